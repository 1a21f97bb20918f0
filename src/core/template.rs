//! The `{expression}` template language used by `ftemplate` grammars.
//!
//! Literal text passes through; `{{` and `}}` are escaped braces. Each
//! `{...}` span holds one expression from a small, side-effect-free
//! language: names, attribute access, string-method calls, indexing,
//! arithmetic, comparisons, boolean operators and conditional expressions.

use thiserror::Error;
use tracing::error;

use crate::core::context::Context;
use crate::core::db::RenderError;
use crate::core::eval;
use crate::core::text::RenderedStr;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ParseError(pub String);

fn fail<T>(message: impl Into<String>) -> Result<T, ParseError> {
    Err(ParseError(message.into()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    FloorDiv,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

/// One parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Name(String),
    Int(i64),
    Str(String),
    Bool(bool),
    Attr(Box<Expr>, String),
    Call {
        target: Box<Expr>,
        method: String,
        args: Vec<Expr>,
    },
    Index(Box<Expr>, Box<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    IfElse {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
}

impl Expr {
    /// Free names referenced anywhere in the expression.
    pub fn names(&self, out: &mut Vec<String>) {
        match self {
            Expr::Name(name) => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            Expr::Int(_) | Expr::Str(_) | Expr::Bool(_) => {}
            Expr::Attr(target, _) => target.names(out),
            Expr::Call { target, args, .. } => {
                target.names(out);
                for arg in args {
                    arg.names(out);
                }
            }
            Expr::Index(target, index) => {
                target.names(out);
                index.names(out);
            }
            Expr::Unary(_, operand) => operand.names(out),
            Expr::Binary(_, lhs, rhs) => {
                lhs.names(out);
                rhs.names(out);
            }
            Expr::IfElse { cond, then, otherwise } => {
                cond.names(out);
                then.names(out);
                otherwise.names(out);
            }
        }
    }
}

/// A segment of a parsed template.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Literal(String),
    Expr(Expr),
}

/// A parsed template: literal runs and expression spans, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    /// Parse template text into segments.
    pub fn parse(input: &str) -> Result<Template, ParseError> {
        let mut segments = Vec::new();
        let mut literal_buf = String::new();
        let chars: Vec<char> = input.chars().collect();
        let len = chars.len();
        let mut i = 0;

        while i < len {
            if chars[i] == '{' {
                // Escaped brace
                if i + 1 < len && chars[i + 1] == '{' {
                    literal_buf.push('{');
                    i += 2;
                    continue;
                }

                if !literal_buf.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal_buf)));
                }

                let start = i + 1;
                let end = find_closing_brace(&chars, start)?;
                let content: String = chars[start..end].iter().collect();
                if content.trim().is_empty() {
                    return fail("empty braces");
                }

                segments.push(Segment::Expr(parse_expr(&content)?));
                i = end + 1;
            } else if chars[i] == '}' {
                // Escaped closing brace
                if i + 1 < len && chars[i + 1] == '}' {
                    literal_buf.push('}');
                    i += 2;
                    continue;
                }
                return fail("unmatched closing brace");
            } else {
                literal_buf.push(chars[i]);
                i += 1;
            }
        }

        if !literal_buf.is_empty() {
            segments.push(Segment::Literal(literal_buf));
        }

        Ok(Template { segments })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Free names referenced by the template's expressions, first use first.
    pub fn names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for segment in &self.segments {
            if let Segment::Expr(expr) = segment {
                expr.names(&mut names);
            }
        }
        names
    }

    /// Evaluate every span against `context` and concatenate.
    pub fn render(&self, grammar_path: &str, context: &Context) -> Result<RenderedStr, RenderError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Expr(expr) => {
                    let value = eval::evaluate(expr, context, grammar_path)?;
                    out.push_str(value.render()?.as_str());
                }
            }
        }
        Ok(RenderedStr::from(out))
    }
}

/// Index of the `}` closing the span opened just before `start`. Quoted
/// strings are skipped.
fn find_closing_brace(chars: &[char], start: usize) -> Result<usize, ParseError> {
    let mut quote: Option<char> = None;
    let mut i = start;
    while i < chars.len() {
        let c = chars[i];
        match quote {
            Some(q) => {
                if c == '\\' {
                    i += 1;
                } else if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => quote = Some(c),
                '{' => return fail("nested braces are not allowed"),
                '}' => return Ok(i),
                _ => {}
            },
        }
        i += 1;
    }
    if quote.is_some() {
        fail("unterminated string")
    } else {
        fail("unclosed brace")
    }
}

/// Render `tmpl` as an `ftemplate` against `context`.
///
/// Failures carry the grammar path and the template text.
pub fn render_ftemplate(tmpl: &str, grammar_path: &str, context: &Context) -> Result<RenderedStr, RenderError> {
    let template = Template::parse(tmpl).map_err(|e| {
        error!(path = grammar_path, template = tmpl, error = %e, "could not parse template");
        RenderError::Syntax {
            path: grammar_path.to_string(),
            template: tmpl.to_string(),
            message: e.0,
        }
    })?;
    template.render(grammar_path, context).map_err(|e| {
        if !e.is_located() {
            error!(path = grammar_path, template = tmpl, error = %e, "could not render template");
        }
        e.in_template(grammar_path, tmpl)
    })
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Name(String),
    Int(i64),
    Str(String),
    Punct(&'static str),
}

const KEYWORDS: &[&str] = &["if", "else", "and", "or", "not", "True", "False"];

fn tokenize(src: &str) -> Result<Vec<Token>, ParseError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Name(chars[start..i].iter().collect()));
        } else if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let digits: String = chars[start..i].iter().collect();
            match digits.parse() {
                Ok(n) => tokens.push(Token::Int(n)),
                Err(_) => return fail(format!("integer literal {} is too large", digits)),
            }
        } else if c == '\'' || c == '"' {
            let mut value = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    None => return fail("unterminated string"),
                    Some(&q) if q == c => break,
                    Some('\\') => {
                        i += 1;
                        match chars.get(i) {
                            Some('n') => value.push('\n'),
                            Some('t') => value.push('\t'),
                            Some(&other) => value.push(other),
                            None => return fail("unterminated string"),
                        }
                    }
                    Some(&other) => value.push(other),
                }
                i += 1;
            }
            i += 1;
            tokens.push(Token::Str(value));
        } else {
            let next = chars.get(i + 1).copied();
            let two = match (c, next) {
                ('/', Some('/')) => Some("//"),
                ('=', Some('=')) => Some("=="),
                ('!', Some('=')) => Some("!="),
                ('<', Some('=')) => Some("<="),
                ('>', Some('=')) => Some(">="),
                _ => None,
            };
            if let Some(op) = two {
                tokens.push(Token::Punct(op));
                i += 2;
                continue;
            }
            let one = match c {
                '.' => ".",
                ',' => ",",
                '(' => "(",
                ')' => ")",
                '[' => "[",
                ']' => "]",
                '+' => "+",
                '-' => "-",
                '*' => "*",
                '%' => "%",
                '<' => "<",
                '>' => ">",
                '!' => return fail("conversions such as !r are not supported"),
                ':' => return fail("format specifications are not supported"),
                '=' => return fail("assignment is not supported"),
                other => return fail(format!("unexpected character {:?}", other)),
            };
            tokens.push(Token::Punct(one));
            i += 1;
        }
    }

    Ok(tokens)
}

/// Parse a single expression (the inside of one `{...}` span).
pub fn parse_expr(src: &str) -> Result<Expr, ParseError> {
    let tokens = tokenize(src)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.ternary()?;
    match parser.peek() {
        None => Ok(expr),
        Some(token) => fail(format!("unexpected {} after expression", describe(token))),
    }
}

fn describe(token: &Token) -> String {
    match token {
        Token::Name(n) => format!("name `{}`", n),
        Token::Int(n) => format!("number {}", n),
        Token::Str(s) => format!("string {:?}", s),
        Token::Punct(p) => format!("`{}`", p),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn at_punct(&self, p: &str) -> bool {
        matches!(self.peek(), Some(Token::Punct(q)) if *q == p)
    }

    fn at_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Token::Name(n)) if n == kw)
    }

    fn eat_punct(&mut self, p: &str) -> bool {
        let found = self.at_punct(p);
        if found {
            self.pos += 1;
        }
        found
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        let found = self.at_keyword(kw);
        if found {
            self.pos += 1;
        }
        found
    }

    fn expect_punct(&mut self, p: &str) -> Result<(), ParseError> {
        if self.eat_punct(p) {
            return Ok(());
        }
        match self.peek() {
            Some(token) => fail(format!("expected `{}`, found {}", p, describe(token))),
            None => fail(format!("expected `{}` before end of expression", p)),
        }
    }

    fn ternary(&mut self) -> Result<Expr, ParseError> {
        let then = self.or()?;
        if !self.eat_keyword("if") {
            return Ok(then);
        }
        let cond = self.or()?;
        if !self.eat_keyword("else") {
            return fail("conditional expression is missing `else`");
        }
        let otherwise = self.ternary()?;
        Ok(Expr::IfElse {
            cond: Box::new(cond),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        })
    }

    fn or(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.and()?;
        while self.eat_keyword("or") {
            let rhs = self.and()?;
            lhs = Expr::Binary(BinaryOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.not()?;
        while self.eat_keyword("and") {
            let rhs = self.not()?;
            lhs = Expr::Binary(BinaryOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn not(&mut self) -> Result<Expr, ParseError> {
        if self.eat_keyword("not") {
            let operand = self.not()?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(operand)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Punct("==")) => BinaryOp::Eq,
                Some(Token::Punct("!=")) => BinaryOp::Ne,
                Some(Token::Punct("<")) => BinaryOp::Lt,
                Some(Token::Punct("<=")) => BinaryOp::Le,
                Some(Token::Punct(">")) => BinaryOp::Gt,
                Some(Token::Punct(">=")) => BinaryOp::Ge,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.additive()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn additive(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Punct("+")) => BinaryOp::Add,
                Some(Token::Punct("-")) => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Punct("*")) => BinaryOp::Mul,
                Some(Token::Punct("//")) => BinaryOp::FloorDiv,
                Some(Token::Punct("%")) => BinaryOp::Mod,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        if self.eat_punct("-") {
            let operand = self.unary()?;
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(operand)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.primary()?;
        loop {
            if self.eat_punct(".") {
                let attr = match self.next() {
                    Some(Token::Name(name)) => name,
                    Some(token) => return fail(format!("expected attribute name, found {}", describe(&token))),
                    None => return fail("expected attribute name after `.`"),
                };
                if self.eat_punct("(") {
                    let args = self.arguments()?;
                    expr = Expr::Call {
                        target: Box::new(expr),
                        method: attr,
                        args,
                    };
                } else {
                    expr = Expr::Attr(Box::new(expr), attr);
                }
            } else if self.eat_punct("[") {
                let index = self.ternary()?;
                self.expect_punct("]")?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else if self.at_punct("(") {
                return fail("only string methods can be called");
            } else {
                return Ok(expr);
            }
        }
    }

    fn arguments(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut args = Vec::new();
        if self.eat_punct(")") {
            return Ok(args);
        }
        loop {
            args.push(self.ternary()?);
            if self.eat_punct(")") {
                return Ok(args);
            }
            self.expect_punct(",")?;
        }
    }

    fn primary(&mut self) -> Result<Expr, ParseError> {
        match self.next() {
            Some(Token::Int(n)) => Ok(Expr::Int(n)),
            Some(Token::Str(s)) => {
                let mut s = s;
                // Adjacent literals concatenate.
                while let Some(Token::Str(more)) = self.peek() {
                    s.push_str(more);
                    self.pos += 1;
                }
                Ok(Expr::Str(s))
            }
            Some(Token::Name(name)) => match name.as_str() {
                "True" => Ok(Expr::Bool(true)),
                "False" => Ok(Expr::Bool(false)),
                kw if KEYWORDS.contains(&kw) => fail(format!("unexpected keyword `{}`", kw)),
                _ => Ok(Expr::Name(name)),
            },
            Some(Token::Punct("(")) => {
                let inner = self.ternary()?;
                self.expect_punct(")")?;
                Ok(inner)
            }
            Some(token) => fail(format!("unexpected {}", describe(&token))),
            None => fail("unexpected end of expression"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::db::Value;

    fn name(n: &str) -> Expr {
        Expr::Name(n.to_string())
    }

    #[test]
    fn parse_literal_only() {
        let t = Template::parse("Hello, world!").unwrap();
        assert_eq!(t.segments(), &[Segment::Literal("Hello, world!".to_string())]);
    }

    #[test]
    fn parse_name_ref() {
        let t = Template::parse("Hello {Name}!").unwrap();
        assert_eq!(
            t.segments(),
            &[
                Segment::Literal("Hello ".to_string()),
                Segment::Expr(name("Name")),
                Segment::Literal("!".to_string()),
            ]
        );
    }

    #[test]
    fn parse_attribute_and_method_chain() {
        let t = Template::parse("{Hero.name.upper()}").unwrap();
        assert_eq!(
            t.segments(),
            &[Segment::Expr(Expr::Call {
                target: Box::new(Expr::Attr(Box::new(name("Hero")), "name".to_string())),
                method: "upper".to_string(),
                args: vec![],
            })]
        );
    }

    #[test]
    fn parse_index_and_arithmetic() {
        let expr = parse_expr("Colors[-1] + 'x' * 2").unwrap();
        assert_eq!(
            expr,
            Expr::Binary(
                BinaryOp::Add,
                Box::new(Expr::Index(
                    Box::new(name("Colors")),
                    Box::new(Expr::Unary(UnaryOp::Neg, Box::new(Expr::Int(1))))
                )),
                Box::new(Expr::Binary(
                    BinaryOp::Mul,
                    Box::new(Expr::Str("x".to_string())),
                    Box::new(Expr::Int(2))
                )),
            )
        );
    }

    #[test]
    fn parse_conditional() {
        let expr = parse_expr("'yes' if flag and not other else 'no'").unwrap();
        let Expr::IfElse { cond, .. } = expr else {
            panic!("expected conditional");
        };
        assert!(matches!(*cond, Expr::Binary(BinaryOp::And, _, _)));
    }

    #[test]
    fn parse_escaped_braces() {
        let t = Template::parse("{{literal}}").unwrap();
        assert_eq!(t.segments(), &[Segment::Literal("{literal}".to_string())]);
    }

    #[test]
    fn parse_braces_inside_strings() {
        let t = Template::parse("{'}'}").unwrap();
        assert_eq!(t.segments(), &[Segment::Expr(Expr::Str("}".to_string()))]);
    }

    #[test]
    fn parse_empty_braces_error() {
        assert_eq!(Template::parse("Hello {}").unwrap_err().0, "empty braces");
        assert_eq!(Template::parse("Hello {  }").unwrap_err().0, "empty braces");
    }

    #[test]
    fn parse_nested_braces_error() {
        assert!(Template::parse("{outer{inner}}").is_err());
    }

    #[test]
    fn parse_unclosed_brace_error() {
        assert_eq!(Template::parse("Hello {name").unwrap_err().0, "unclosed brace");
    }

    #[test]
    fn parse_unmatched_close_error() {
        assert_eq!(Template::parse("Hello name}").unwrap_err().0, "unmatched closing brace");
    }

    #[test]
    fn parse_rejects_format_spec_and_conversion() {
        assert!(Template::parse("{x:>10}").is_err());
        assert!(Template::parse("{x!r}").is_err());
        assert!(Template::parse("{x != y}").is_ok());
    }

    #[test]
    fn parse_rejects_arbitrary_calls() {
        assert!(parse_expr("len(x)").is_err());
        assert!(parse_expr("x.__class__.__bases__[0].__subclasses__()").is_ok());
        assert!(parse_expr("import os").is_err());
    }

    #[test]
    fn template_names_are_collected_once() {
        let t = Template::parse("{A} and {B.c} and {A.upper()} {x if A else y}").unwrap();
        assert_eq!(t.names(), vec!["A", "B", "x", "y"]);
    }

    #[test]
    fn render_plain_and_escaped() {
        let ctx = Context::with_seed("s");
        ctx.insert("name", Value::from("Earth"));
        let out = render_ftemplate("{{Hello}} {name}", "test:Begin", &ctx).unwrap();
        assert_eq!(out, "{Hello} Earth");
    }

    #[test]
    fn render_reports_path_and_template() {
        let ctx = Context::with_seed("s");
        let err = render_ftemplate("Hi {Nobody}", "test:Begin", &ctx).unwrap_err();
        match &err {
            RenderError::Template { path, template, source } => {
                assert_eq!(path, "test:Begin");
                assert_eq!(template, "Hi {Nobody}");
                assert!(matches!(**source, RenderError::UndefinedName { .. }));
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(err.to_string().contains("Hi {Nobody}"));
    }

    #[test]
    fn render_syntax_error_carries_template() {
        let ctx = Context::new();
        let err = render_ftemplate("{a +}", "test:Bad", &ctx).unwrap_err();
        assert!(matches!(err, RenderError::Syntax { ref path, .. } if path == "test:Bad"));
    }
}
