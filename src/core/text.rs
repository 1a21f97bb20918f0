//! Text values: rendered strings, raw text leaves and deferred templates.

use serde::Deserialize;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use crate::core::context::{Context, WeakContext};
use crate::core::db::RenderError;
use crate::core::{jinja, template};

const VOWELS: &[char] = &['a', 'e', 'i', 'o', 'u'];

/// "an" when `s` starts with a vowel (case-insensitive), else "a".
///
/// An empty string has no first character and is an error.
pub fn indefinite_article(s: &str) -> Result<&'static str, RenderError> {
    let first = s.chars().next().ok_or(RenderError::EmptyText)?;
    if first.to_lowercase().any(|c| VOWELS.contains(&c)) {
        Ok("an")
    } else {
        Ok("a")
    }
}

fn capitalized_article(s: &str) -> Result<&'static str, RenderError> {
    Ok(match indefinite_article(s)? {
        "an" => "An",
        _ => "A",
    })
}

/// The product of every render: an immutable string with article helpers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RenderedStr(Rc<str>);

impl RenderedStr {
    pub fn new(s: impl AsRef<str>) -> Self {
        Self(Rc::from(s.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0.to_string()
    }

    pub fn an(&self) -> Result<&'static str, RenderError> {
        indefinite_article(&self.0)
    }

    pub fn a(&self) -> Result<&'static str, RenderError> {
        self.an()
    }

    #[allow(non_snake_case)]
    pub fn An(&self) -> Result<&'static str, RenderError> {
        capitalized_article(&self.0)
    }

    #[allow(non_snake_case)]
    pub fn A(&self) -> Result<&'static str, RenderError> {
        self.An()
    }
}

impl fmt::Display for RenderedStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RenderedStr {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RenderedStr {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for RenderedStr {
    fn from(s: String) -> Self {
        Self(Rc::from(s))
    }
}

impl PartialEq<str> for RenderedStr {
    fn eq(&self, other: &str) -> bool {
        &*self.0 == other
    }
}

impl PartialEq<&str> for RenderedStr {
    fn eq(&self, other: &&str) -> bool {
        &*self.0 == *other
    }
}

/// Interpolation engine for a grammar module, chosen by its `render` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderStrategy {
    /// `{expression}` spans evaluated against the context.
    #[default]
    FTemplate,
    /// A full Jinja pass.
    #[serde(alias = "jinja")]
    Jinja2,
}

impl RenderStrategy {
    pub fn render(self, tmpl: &str, grammar_path: &str, context: &Context) -> Result<RenderedStr, RenderError> {
        match self {
            Self::FTemplate => template::render_ftemplate(tmpl, grammar_path, context),
            Self::Jinja2 => jinja::render_jinja2(tmpl, grammar_path, context),
        }
    }
}

/// A raw text leaf. Rendering is the identity.
///
/// Equality and hashing use the raw value only.
#[derive(Clone)]
pub struct Text {
    value: String,
    grammar_path: String,
    context: WeakContext,
}

impl Text {
    pub fn new(value: impl Into<String>, grammar_path: impl Into<String>, context: &Context) -> Self {
        Self {
            value: value.into(),
            grammar_path: grammar_path.into(),
            context: context.downgrade(),
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn grammar_path(&self) -> &str {
        &self.grammar_path
    }

    pub fn context(&self) -> Result<Context, RenderError> {
        self.context.upgrade(&self.grammar_path)
    }

    pub fn an(&self) -> Result<&'static str, RenderError> {
        indefinite_article(&self.value)
    }

    pub fn a(&self) -> Result<&'static str, RenderError> {
        self.an()
    }

    #[allow(non_snake_case)]
    pub fn An(&self) -> Result<&'static str, RenderError> {
        capitalized_article(&self.value)
    }

    #[allow(non_snake_case)]
    pub fn A(&self) -> Result<&'static str, RenderError> {
        self.An()
    }

    pub fn render(&self) -> RenderedStr {
        RenderedStr::new(&self.value)
    }
}

impl fmt::Debug for Text {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.value)
    }
}

impl PartialEq for Text {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for Text {}

impl Hash for Text {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

/// A template leaf whose rendering is deferred until it is read.
///
/// Construction never renders, and rendering never mutates the instance.
#[derive(Clone)]
pub struct RenderableText {
    text: Text,
    strategy: RenderStrategy,
}

impl RenderableText {
    pub fn new(
        value: impl Into<String>,
        grammar_path: impl Into<String>,
        context: &Context,
        strategy: RenderStrategy,
    ) -> Self {
        Self {
            text: Text::new(value, grammar_path, context),
            strategy,
        }
    }

    pub fn value(&self) -> &str {
        self.text.value()
    }

    pub fn grammar_path(&self) -> &str {
        self.text.grammar_path()
    }

    pub fn strategy(&self) -> RenderStrategy {
        self.strategy
    }

    /// Article helpers read the raw, unrendered template.
    pub fn an(&self) -> Result<&'static str, RenderError> {
        self.text.an()
    }

    pub fn a(&self) -> Result<&'static str, RenderError> {
        self.text.a()
    }

    #[allow(non_snake_case)]
    pub fn An(&self) -> Result<&'static str, RenderError> {
        self.text.An()
    }

    #[allow(non_snake_case)]
    pub fn A(&self) -> Result<&'static str, RenderError> {
        self.text.A()
    }

    /// Render against `context`, or the context this text was parsed under.
    pub fn render(&self, context: Option<&Context>) -> Result<RenderedStr, RenderError> {
        let owned;
        let context = match context {
            Some(ctx) => ctx,
            None => {
                owned = self.text.context()?;
                &owned
            }
        };
        let _guard = context.descend(self.grammar_path())?;
        let raw = self.text.render();
        self.strategy.render(raw.as_str(), self.grammar_path(), context)
    }
}

impl fmt::Debug for RenderableText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.text.value)
    }
}

impl PartialEq for RenderableText {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

impl Eq for RenderableText {}

impl Hash for RenderableText {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.text.hash(state);
    }
}
