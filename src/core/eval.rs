//! Evaluation of template expressions against a [`Context`].

use std::rc::Rc;

use crate::core::context::Context;
use crate::core::db::{RenderError, Value};
use crate::core::template::{BinaryOp, Expr, UnaryOp};
use crate::core::text::RenderedStr;

/// String methods callable from templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrMethod {
    Upper,
    Lower,
    Title,
    Capitalize,
    Strip,
    Lstrip,
    Rstrip,
    Swapcase,
    Replace,
    Startswith,
    Endswith,
}

impl StrMethod {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "upper" => Self::Upper,
            "lower" => Self::Lower,
            "title" => Self::Title,
            "capitalize" => Self::Capitalize,
            "strip" => Self::Strip,
            "lstrip" => Self::Lstrip,
            "rstrip" => Self::Rstrip,
            "swapcase" => Self::Swapcase,
            "replace" => Self::Replace,
            "startswith" => Self::Startswith,
            "endswith" => Self::Endswith,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Upper => "upper",
            Self::Lower => "lower",
            Self::Title => "title",
            Self::Capitalize => "capitalize",
            Self::Strip => "strip",
            Self::Lstrip => "lstrip",
            Self::Rstrip => "rstrip",
            Self::Swapcase => "swapcase",
            Self::Replace => "replace",
            Self::Startswith => "startswith",
            Self::Endswith => "endswith",
        }
    }

    /// Accepted argument counts, inclusive.
    fn arity(self) -> (usize, usize) {
        match self {
            Self::Upper | Self::Lower | Self::Title | Self::Capitalize | Self::Swapcase => (0, 0),
            Self::Strip | Self::Lstrip | Self::Rstrip => (0, 1),
            Self::Replace => (2, 3),
            Self::Startswith | Self::Endswith => (1, 1),
        }
    }

    pub fn apply(self, s: &str, args: &[Value], path: &str) -> Result<Value, RenderError> {
        let (min, max) = self.arity();
        if args.len() < min || args.len() > max {
            return Err(type_error(
                path,
                format!("{}() takes {} to {} arguments ({} given)", self.name(), min, max, args.len()),
            ));
        }
        let strs = args
            .iter()
            .map(Value::render)
            .collect::<Result<Vec<RenderedStr>, _>>()?;
        let arg = |i: usize| strs.get(i).map(RenderedStr::as_str);
        let trim_set = |i: usize| -> Vec<char> {
            arg(i).map(|chars| chars.chars().collect()).unwrap_or_default()
        };

        Ok(match self {
            Self::Upper => Value::from(s.to_uppercase()),
            Self::Lower => Value::from(s.to_lowercase()),
            Self::Title => Value::from(title_case(s)),
            Self::Capitalize => Value::from(capitalize(s)),
            Self::Swapcase => Value::from(swap_case(s)),
            Self::Strip => match arg(0) {
                None => Value::from(s.trim()),
                Some(_) => {
                    let set = trim_set(0);
                    Value::from(s.trim_matches(|c| set.contains(&c)))
                }
            },
            Self::Lstrip => match arg(0) {
                None => Value::from(s.trim_start()),
                Some(_) => {
                    let set = trim_set(0);
                    Value::from(s.trim_start_matches(|c| set.contains(&c)))
                }
            },
            Self::Rstrip => match arg(0) {
                None => Value::from(s.trim_end()),
                Some(_) => {
                    let set = trim_set(0);
                    Value::from(s.trim_end_matches(|c| set.contains(&c)))
                }
            },
            Self::Replace => {
                let from = arg(0).unwrap_or_default();
                let to = arg(1).unwrap_or_default();
                match args.get(2) {
                    None => Value::from(s.replace(from, to)),
                    Some(count) => {
                        let count = as_int(count)
                            .ok_or_else(|| type_error(path, "replace() count must be an integer"))?;
                        if count < 0 {
                            Value::from(s.replace(from, to))
                        } else {
                            Value::from(s.replacen(from, to, count as usize))
                        }
                    }
                }
            }
            Self::Startswith => Value::Bool(s.starts_with(arg(0).unwrap_or_default())),
            Self::Endswith => Value::Bool(s.ends_with(arg(0).unwrap_or_default())),
        })
    }
}

fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_cased = false;
    for c in s.chars() {
        if c.is_alphabetic() {
            if prev_cased {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            prev_cased = true;
        } else {
            out.push(c);
            prev_cased = false;
        }
    }
    out
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

fn swap_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c.is_uppercase() {
            out.extend(c.to_lowercase());
        } else if c.is_lowercase() {
            out.extend(c.to_uppercase());
        } else {
            out.push(c);
        }
    }
    out
}

fn type_error(path: &str, message: impl Into<String>) -> RenderError {
    RenderError::Type {
        path: path.to_string(),
        message: message.into(),
    }
}

fn as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Int(n) => Some(*n),
        Value::Bool(b) => Some(*b as i64),
        _ => None,
    }
}

fn is_string_like(value: &Value) -> bool {
    matches!(value, Value::Str(_) | Value::Text(_) | Value::Database(_))
}

/// Evaluate `expr` under `context`. `path` names the grammar location for
/// error reporting.
pub fn evaluate(expr: &Expr, context: &Context, path: &str) -> Result<Value, RenderError> {
    match expr {
        Expr::Name(name) => context.lookup(name).ok_or_else(|| RenderError::UndefinedName {
            name: name.clone(),
            path: path.to_string(),
        }),
        Expr::Int(n) => Ok(Value::Int(*n)),
        Expr::Str(s) => Ok(Value::from(s.as_str())),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Attr(target, attr) => {
            let target = evaluate(target, context, path)?;
            get_attr(&target, attr, path)
        }
        Expr::Call { target, method, args } => {
            let target = evaluate(target, context, path)?;
            let args = args
                .iter()
                .map(|arg| evaluate(arg, context, path))
                .collect::<Result<Vec<_>, _>>()?;
            call_method(&target, method, &args, path)
        }
        Expr::Index(target, index) => {
            let target = evaluate(target, context, path)?;
            let index = evaluate(index, context, path)?;
            subscript(&target, &index, path)
        }
        Expr::Unary(UnaryOp::Not, operand) => Ok(Value::Bool(!evaluate(operand, context, path)?.is_truthy())),
        Expr::Unary(UnaryOp::Neg, operand) => {
            let value = evaluate(operand, context, path)?;
            as_int(&value)
                .and_then(i64::checked_neg)
                .map(Value::Int)
                .ok_or_else(|| type_error(path, format!("bad operand type for unary -: {}", value.kind())))
        }
        Expr::Binary(BinaryOp::And, lhs, rhs) => {
            let lhs = evaluate(lhs, context, path)?;
            if lhs.is_truthy() {
                evaluate(rhs, context, path)
            } else {
                Ok(lhs)
            }
        }
        Expr::Binary(BinaryOp::Or, lhs, rhs) => {
            let lhs = evaluate(lhs, context, path)?;
            if lhs.is_truthy() {
                Ok(lhs)
            } else {
                evaluate(rhs, context, path)
            }
        }
        Expr::Binary(op, lhs, rhs) => {
            let lhs = evaluate(lhs, context, path)?;
            let rhs = evaluate(rhs, context, path)?;
            binary(*op, &lhs, &rhs, path)
        }
        Expr::IfElse { cond, then, otherwise } => {
            if evaluate(cond, context, path)?.is_truthy() {
                evaluate(then, context, path)
            } else {
                evaluate(otherwise, context, path)
            }
        }
    }
}

fn binary(op: BinaryOp, lhs: &Value, rhs: &Value, path: &str) -> Result<Value, RenderError> {
    let unsupported = || {
        type_error(
            path,
            format!("unsupported operand types for {:?}: {} and {}", op, lhs.kind(), rhs.kind()),
        )
    };
    let overflow = || type_error(path, "integer overflow");

    match op {
        BinaryOp::Eq => Ok(Value::Bool(values_equal(lhs, rhs)?)),
        BinaryOp::Ne => Ok(Value::Bool(!values_equal(lhs, rhs)?)),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = if let (Some(a), Some(b)) = (as_int(lhs), as_int(rhs)) {
                a.cmp(&b)
            } else if is_string_like(lhs) && is_string_like(rhs) {
                lhs.render()?.cmp(&rhs.render()?)
            } else {
                return Err(unsupported());
            };
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }))
        }
        BinaryOp::Add => {
            if let (Some(a), Some(b)) = (as_int(lhs), as_int(rhs)) {
                a.checked_add(b).map(Value::Int).ok_or_else(overflow)
            } else if is_string_like(lhs) && is_string_like(rhs) {
                Ok(Value::from(format!("{}{}", lhs.render()?, rhs.render()?)))
            } else {
                Err(unsupported())
            }
        }
        BinaryOp::Mul => match (as_int(lhs), as_int(rhs)) {
            (Some(a), Some(b)) => a.checked_mul(b).map(Value::Int).ok_or_else(overflow),
            (None, Some(n)) if is_string_like(lhs) => Ok(Value::from(lhs.render()?.as_str().repeat(n.max(0) as usize))),
            (Some(n), None) if is_string_like(rhs) => Ok(Value::from(rhs.render()?.as_str().repeat(n.max(0) as usize))),
            _ => Err(unsupported()),
        },
        BinaryOp::Sub | BinaryOp::FloorDiv | BinaryOp::Mod => {
            let (a, b) = match (as_int(lhs), as_int(rhs)) {
                (Some(a), Some(b)) => (a, b),
                _ => return Err(unsupported()),
            };
            if b == 0 && op != BinaryOp::Sub {
                return Err(type_error(path, "integer division or modulo by zero"));
            }
            let result = match op {
                BinaryOp::Sub => a.checked_sub(b),
                BinaryOp::FloorDiv => a.checked_div(b).map(|q| if a % b != 0 && (a < 0) != (b < 0) { q - 1 } else { q }),
                _ => a.checked_rem(b).map(|r| if r != 0 && (r < 0) != (b < 0) { r + b } else { r }),
            };
            result.map(Value::Int).ok_or_else(overflow)
        }
        BinaryOp::And | BinaryOp::Or => Err(unsupported()),
    }
}

fn values_equal(lhs: &Value, rhs: &Value) -> Result<bool, RenderError> {
    if let (Some(a), Some(b)) = (as_int(lhs), as_int(rhs)) {
        return Ok(a == b);
    }
    if is_string_like(lhs) && is_string_like(rhs) {
        return Ok(lhs.render()? == rhs.render()?);
    }
    Ok(match (lhs, rhs) {
        (Value::Databag(a), Value::Databag(b)) => Rc::ptr_eq(a, b),
        (Value::Datalist(a), Value::Datalist(b)) => Rc::ptr_eq(a, b),
        _ => false,
    })
}

/// `value.attr` as written in a template.
pub fn get_attr(value: &Value, attr: &str, path: &str) -> Result<Value, RenderError> {
    let no_attribute = || RenderError::NoAttribute {
        kind: value.kind(),
        attr: attr.to_string(),
        path: path.to_string(),
    };
    match value {
        Value::Database(db) => {
            if let Some(method) = StrMethod::from_name(attr) {
                return Err(type_error(
                    path,
                    format!("string method `{}` must be called, as in `.{}()`", attr, method.name()),
                ));
            }
            db.resolve(attr)
        }
        Value::Databag(bag) => bag.get(attr),
        Value::Str(s) => match attr {
            "a" => Ok(Value::from(s.a()?)),
            "an" => Ok(Value::from(s.an()?)),
            "A" => Ok(Value::from(s.A()?)),
            "An" => Ok(Value::from(s.An()?)),
            _ => Err(no_attribute()),
        },
        Value::Text(text) => match attr {
            "a" => Ok(Value::from(text.a()?)),
            "an" => Ok(Value::from(text.an()?)),
            "A" => Ok(Value::from(text.A()?)),
            "An" => Ok(Value::from(text.An()?)),
            _ => Err(no_attribute()),
        },
        Value::Bool(_) | Value::Int(_) | Value::Datalist(_) => Err(no_attribute()),
    }
}

/// `value.method(args)` as written in a template.
pub fn call_method(value: &Value, method: &str, args: &[Value], path: &str) -> Result<Value, RenderError> {
    let not_callable = || RenderError::NotCallable {
        name: method.to_string(),
        kind: value.kind(),
        path: path.to_string(),
    };
    let string_method = StrMethod::from_name(method).ok_or_else(not_callable)?;
    let base = match value {
        Value::Str(s) => s.clone(),
        Value::Text(text) => RenderedStr::from(text.value()),
        Value::Database(db) => db.resolve(method)?.render()?,
        _ => return Err(not_callable()),
    };
    string_method.apply(base.as_str(), args, path)
}

/// `value[index]` as written in a template.
pub fn subscript(value: &Value, index: &Value, path: &str) -> Result<Value, RenderError> {
    match value {
        Value::Datalist(list) => {
            let i = as_int(index).ok_or_else(|| {
                type_error(path, format!("list indices must be integers, not {}", index.kind()))
            })?;
            list.get(i)
        }
        Value::Databag(bag) => bag.get(index.render()?.as_str()),
        Value::Database(db) => db.resolve(index.render()?.as_str()),
        Value::Str(s) => {
            let i = as_int(index).ok_or_else(|| {
                type_error(path, format!("string indices must be integers, not {}", index.kind()))
            })?;
            let chars: Vec<char> = s.as_str().chars().collect();
            let len = chars.len() as i64;
            let pos = if i < 0 { i + len } else { i };
            if pos < 0 || pos >= len {
                return Err(RenderError::IndexOutOfRange {
                    index: i,
                    len: chars.len(),
                    path: path.to_string(),
                });
            }
            Ok(Value::from(chars[pos as usize].to_string()))
        }
        Value::Bool(_) | Value::Int(_) | Value::Text(_) => Err(type_error(
            path,
            format!("{} value is not subscriptable", value.kind()),
        )),
    }
}
