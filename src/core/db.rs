//! Lazy grammar containers, the live form of parsed stanzas.
//!
//! A [`Database`] defers a production until it is read and memoizes one
//! result per attribute name. [`Databag`] and [`Datalist`] hold already-parsed
//! children and render text leaves against the ambient context on access.

use rand::seq::SliceRandom;
use rand::Rng;
use rustc_hash::FxHashMap;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use thiserror::Error;
use tracing::{error, trace};

use crate::core::context::{Context, WeakContext};
use crate::core::eval::StrMethod;
use crate::core::markov::{MarkovError, NameGenerator, DEFAULT_MAX_LENGTH};
use crate::core::seeds::{self, Seed};
use crate::core::text::{RenderableText, RenderedStr};

/// Default prefix length for Markov productions.
pub const DEFAULT_MARKOV_CHAINLEN: usize = 2;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("could not parse template {path}: {message}\n--> {template}")]
    Syntax {
        path: String,
        template: String,
        message: String,
    },
    #[error("name `{name}` is not defined (in {path})")]
    UndefinedName { name: String, path: String },
    #[error("no key {key:?} in {path} (available: {available})")]
    MissingKey {
        key: String,
        path: String,
        available: String,
    },
    #[error("index {index} out of range in {path} ({len} items)")]
    IndexOutOfRange { index: i64, len: usize, path: String },
    #[error("{kind} value has no attribute `{attr}` (in {path})")]
    NoAttribute {
        kind: &'static str,
        attr: String,
        path: String,
    },
    #[error("`{name}` cannot be called on a {kind} value (in {path})")]
    NotCallable {
        name: String,
        kind: &'static str,
        path: String,
    },
    #[error("type error in {path}: {message}")]
    Type { path: String, message: String },
    #[error("cannot take the indefinite article of empty text")]
    EmptyText,
    #[error("cannot choose from an empty production in {path}")]
    EmptyProduction { path: String },
    #[error("recursion limit of {limit} exceeded while resolving {path}")]
    RecursionLimit { path: String, limit: usize },
    #[error("evaluation context for {path} no longer exists")]
    ContextDropped { path: String },
    #[error("could not render template {path}: {source}\n--> {template}")]
    Template {
        path: String,
        template: String,
        #[source]
        source: Box<RenderError>,
    },
    #[error("could not render Jinja2 template ({reason}):\n{location}")]
    Jinja {
        path: String,
        reason: String,
        location: String,
        line: Option<usize>,
    },
    #[error("markov production {path} failed: {source}")]
    Markov {
        path: String,
        #[source]
        source: MarkovError,
    },
}

impl RenderError {
    /// Attach the offending template and grammar path to a leaf failure.
    ///
    /// Failures that already carry a location pass through unchanged, so the
    /// innermost template is the one reported.
    pub fn in_template(self, path: &str, template: &str) -> Self {
        if self.is_located() {
            return self;
        }
        RenderError::Template {
            path: path.to_string(),
            template: template.to_string(),
            source: Box::new(self),
        }
    }

    /// True when the error already names the template or limit it hit.
    pub fn is_located(&self) -> bool {
        matches!(
            self,
            RenderError::Syntax { .. }
                | RenderError::Template { .. }
                | RenderError::Jinja { .. }
                | RenderError::RecursionLimit { .. }
                | RenderError::ContextDropped { .. }
        )
    }

    /// True for failures that mean "nothing is bound there".
    pub fn is_lookup_miss(&self) -> bool {
        matches!(
            self,
            RenderError::UndefinedName { .. }
                | RenderError::MissingKey { .. }
                | RenderError::IndexOutOfRange { .. }
                | RenderError::NoAttribute { .. }
        )
    }
}

/// A live grammar value.
#[derive(Debug, Clone)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Str(RenderedStr),
    Text(Rc<RenderableText>),
    Database(Rc<Database>),
    Databag(Rc<Databag>),
    Datalist(Rc<Datalist>),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Str(_) => "string",
            Value::Text(_) => "text",
            Value::Database(_) => "database",
            Value::Databag(_) => "databag",
            Value::Datalist(_) => "datalist",
        }
    }

    /// The string content of an already-rendered value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Stringify, triggering any deferred evaluation.
    pub fn render(&self) -> Result<RenderedStr, RenderError> {
        match self {
            Value::Bool(true) => Ok(RenderedStr::from("True")),
            Value::Bool(false) => Ok(RenderedStr::from("False")),
            Value::Int(n) => Ok(RenderedStr::from(n.to_string())),
            Value::Str(s) => Ok(s.clone()),
            Value::Text(text) => text.render(None),
            Value::Database(db) => db.render(),
            Value::Databag(_) | Value::Datalist(_) => Ok(RenderedStr::from(self.repr())),
        }
    }

    /// Render text leaves against `context`; everything else passes through.
    pub fn render_in(self, context: &Context) -> Result<Value, RenderError> {
        match self {
            Value::Text(text) => Ok(Value::Str(text.render(Some(context))?)),
            other => Ok(other),
        }
    }

    /// A quoted, unevaluated description of the value.
    pub fn repr(&self) -> String {
        match self {
            Value::Bool(true) => "True".to_string(),
            Value::Bool(false) => "False".to_string(),
            Value::Int(n) => n.to_string(),
            Value::Str(s) => quote(s.as_str()),
            Value::Text(text) => quote(text.value()),
            Value::Database(db) => format!("<Database {}>", db.grammar_path()),
            Value::Databag(bag) => {
                let entries: Vec<String> = bag
                    .entries()
                    .map(|(k, v)| format!("{}: {}", quote(k), v.repr()))
                    .collect();
                format!("{{{}}}", entries.join(", "))
            }
            Value::Datalist(list) => {
                let items: Vec<String> = list.items().iter().map(Value::repr).collect();
                format!("[{}]", items.join(", "))
            }
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Str(s) => !s.as_str().is_empty(),
            Value::Databag(bag) => !bag.is_empty(),
            Value::Datalist(list) => !list.is_empty(),
            Value::Text(_) | Value::Database(_) => true,
        }
    }
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(RenderedStr::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(RenderedStr::from(s))
    }
}

impl From<RenderedStr> for Value {
    fn from(s: RenderedStr) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<RenderableText> for Value {
    fn from(text: RenderableText) -> Self {
        Value::Text(Rc::new(text))
    }
}

impl From<Database> for Value {
    fn from(db: Database) -> Self {
        Value::Database(Rc::new(db))
    }
}

impl From<Databag> for Value {
    fn from(bag: Databag) -> Self {
        Value::Databag(Rc::new(bag))
    }
}

impl From<Datalist> for Value {
    fn from(list: Datalist) -> Self {
        Value::Datalist(Rc::new(list))
    }
}

/// How a list of candidates resolves to a single value.
#[derive(Debug)]
pub enum Production {
    /// Seeded selection with replacement.
    Choose(Vec<Value>),
    /// Seeded selection without replacement; owns its backing list.
    Pick(RefCell<Vec<Value>>),
    /// A generated name trained on the listed strings.
    Markov(Vec<String>),
    /// Sequential cycling; the index advances on every evaluation.
    Ratchet { items: Vec<Value>, index: Cell<usize> },
}

pub fn choose(items: Vec<Value>) -> Production {
    Production::Choose(items)
}

pub fn pick(items: Vec<Value>) -> Production {
    Production::Pick(RefCell::new(items))
}

pub fn markovify(items: Vec<String>) -> Production {
    Production::Markov(items)
}

pub fn ratchet(items: Vec<Value>) -> Production {
    Production::Ratchet {
        items,
        index: Cell::new(0),
    }
}

impl Production {
    pub fn mode_name(&self) -> &'static str {
        match self {
            Production::Choose(_) => "reuse",
            Production::Pick(_) => "pick",
            Production::Markov(_) => "markov",
            Production::Ratchet { .. } => "ratchet",
        }
    }

    /// A snapshot of the remaining candidates.
    pub fn items(&self) -> Vec<Value> {
        match self {
            Production::Choose(items) | Production::Ratchet { items, .. } => items.clone(),
            Production::Pick(items) => items.borrow().clone(),
            Production::Markov(names) => names.iter().map(|n| Value::from(n.as_str())).collect(),
        }
    }

    /// Evaluate once under `context`, using its current seed.
    pub fn produce(&self, context: &Context, path: &str) -> Result<Value, RenderError> {
        match self {
            Production::Choose(items) => {
                let mut rng = seeds::get_rng(&context.seed());
                let item = items.choose(&mut rng).cloned().ok_or_else(|| RenderError::EmptyProduction {
                    path: path.to_string(),
                })?;
                item.render_in(context)
            }
            Production::Pick(items) => {
                let item = {
                    let mut items = items.borrow_mut();
                    if items.is_empty() {
                        return Err(RenderError::EmptyProduction {
                            path: path.to_string(),
                        });
                    }
                    let idx = if items.len() > 1 {
                        seeds::get_rng(&context.seed()).gen_range(0..items.len())
                    } else {
                        0
                    };
                    items.remove(idx)
                };
                item.render_in(context)
            }
            Production::Markov(names) => {
                let chainlen = markov_chainlen(context, path)?;
                let start = match context.get("start_markov") {
                    Some(value) => value.render()?.into_string(),
                    None => String::new(),
                };
                let markov_err = |source: MarkovError| RenderError::Markov {
                    path: path.to_string(),
                    source,
                };
                let generator = NameGenerator::new(names, chainlen).map_err(markov_err)?;
                let name = generator
                    .get_random_name(&start, DEFAULT_MAX_LENGTH, &context.seed())
                    .map_err(markov_err)?;
                Ok(Value::from(name))
            }
            Production::Ratchet { items, index } => {
                if items.is_empty() {
                    return Ok(Value::from(""));
                }
                let i = index.get();
                index.set((i + 1) % items.len());
                items[i].clone().render_in(context)
            }
        }
    }
}

fn markov_chainlen(context: &Context, path: &str) -> Result<usize, RenderError> {
    match context.get("markov_chainlen") {
        None => Ok(DEFAULT_MARKOV_CHAINLEN),
        Some(Value::Int(n)) if n >= 0 => Ok(n as usize),
        Some(other) => {
            let rendered = other.render()?;
            rendered.as_str().trim().parse().map_err(|_| RenderError::Type {
                path: path.to_string(),
                message: format!("markov_chainlen must be a non-negative integer, got {}", other.repr()),
            })
        }
    }
}

/// Deferred single-value resolver with one cached slot per attribute name.
#[derive(Debug)]
pub struct Database {
    production: Production,
    grammar_path: String,
    context: WeakContext,
    cache: RefCell<FxHashMap<String, Value>>,
}

impl Database {
    pub fn new(production: Production, grammar_path: impl Into<String>, context: &Context) -> Self {
        Self {
            production,
            grammar_path: grammar_path.into(),
            context: context.downgrade(),
            cache: RefCell::new(FxHashMap::default()),
        }
    }

    pub fn grammar_path(&self) -> &str {
        &self.grammar_path
    }

    pub fn production(&self) -> &Production {
        &self.production
    }

    pub fn context(&self) -> Result<Context, RenderError> {
        self.context.upgrade(&self.grammar_path)
    }

    pub fn is_cached(&self, attr: &str) -> bool {
        self.cache.borrow().contains_key(attr)
    }

    /// The value for `attr`, computed on first access and cached after.
    ///
    /// The production runs with `key = attr` and a seed derived as
    /// `"{seed}-{attr}"`. String-method names resolve to this resolver's
    /// rendered form instead.
    pub fn resolve(&self, attr: &str) -> Result<Value, RenderError> {
        let cached = self.cache.borrow().get(attr).cloned();
        if let Some(value) = cached {
            trace!(path = %self.grammar_path, attr, "lazy slot cache hit");
            return Ok(value);
        }

        let value = if StrMethod::from_name(attr).is_some() {
            Value::Str(self.render()?)
        } else {
            let context = self.context()?;
            let _guard = context.descend(&self.grammar_path)?;
            let seed = format!("{}-{}", context.materialize_seed(), attr);
            context.scoped(Some(attr.to_string()), Seed::Fixed(seed), |ctx| {
                self.production.produce(ctx, &self.grammar_path)
            })?
        };

        self.cache.borrow_mut().insert(attr.to_string(), value.clone());
        Ok(value)
    }

    /// Run the production against the resolver's own context, uncached.
    pub fn evaluate(&self) -> Result<Value, RenderError> {
        let context = self.context()?;
        let _guard = context.descend(&self.grammar_path)?;
        self.production.produce(&context, &self.grammar_path)
    }

    /// Pick one value now and stringify it.
    pub fn render(&self) -> Result<RenderedStr, RenderError> {
        self.evaluate()?.render()
    }
}

/// Insertion-ordered keyed container.
#[derive(Debug)]
pub struct Databag {
    grammar_path: String,
    context: WeakContext,
    entries: Vec<(String, Value)>,
    index: FxHashMap<String, usize>,
}

impl Databag {
    pub fn new<I>(grammar_path: impl Into<String>, context: &Context, entries: I) -> Self
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let mut bag = Self {
            grammar_path: grammar_path.into(),
            context: context.downgrade(),
            entries: Vec::new(),
            index: FxHashMap::default(),
        };
        for (key, value) in entries {
            match bag.index.get(&key) {
                Some(&i) => bag.entries[i].1 = value,
                None => {
                    bag.index.insert(key.clone(), bag.entries.len());
                    bag.entries.push((key, value));
                }
            }
        }
        bag
    }

    pub fn grammar_path(&self) -> &str {
        &self.grammar_path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Stored values, unrendered, in insertion order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn raw(&self, key: &str) -> Option<&Value> {
        self.index.get(key).map(|&i| &self.entries[i].1)
    }

    /// Look up `key`, rendering text leaves against the current context.
    pub fn get(&self, key: &str) -> Result<Value, RenderError> {
        let value = match self.raw(key) {
            Some(value) => value.clone(),
            None => {
                let available = self.keys().collect::<Vec<_>>().join(", ");
                error!(path = %self.grammar_path, key, available = %available, "no such key");
                return Err(RenderError::MissingKey {
                    key: key.to_string(),
                    path: self.grammar_path.clone(),
                    available,
                });
            }
        };
        let context = self.context.upgrade(&self.grammar_path)?;
        value.render_in(&context)
    }
}

/// Positionally ordered container.
#[derive(Debug)]
pub struct Datalist {
    grammar_path: String,
    context: WeakContext,
    items: Vec<Value>,
}

impl Datalist {
    pub fn new(grammar_path: impl Into<String>, context: &Context, items: Vec<Value>) -> Self {
        Self {
            grammar_path: grammar_path.into(),
            context: context.downgrade(),
            items,
        }
    }

    pub fn grammar_path(&self) -> &str {
        &self.grammar_path
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[Value] {
        &self.items
    }

    /// Look up a position (negative counts from the end), rendering text
    /// leaves against the current context.
    pub fn get(&self, index: i64) -> Result<Value, RenderError> {
        let len = self.items.len() as i64;
        let pos = if index < 0 { index + len } else { index };
        if pos < 0 || pos >= len {
            error!(path = %self.grammar_path, index, items = ?self.items, "no such index");
            return Err(RenderError::IndexOutOfRange {
                index,
                len: self.items.len(),
                path: self.grammar_path.clone(),
            });
        }
        let context = self.context.upgrade(&self.grammar_path)?;
        self.items[pos as usize].clone().render_in(&context)
    }
}
