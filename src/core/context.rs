//! Evaluation context: the shared, scoped namespace a grammar renders in.

use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::core::db::{RenderError, Value};
use crate::core::seeds::{self, Seed};

/// Default ceiling on nested evaluations before a render is abandoned.
pub const DEFAULT_MAX_DEPTH: usize = 100;

struct ContextData {
    seed: Seed,
    key: Option<String>,
    bindings: FxHashMap<String, Value>,
    depth: usize,
    max_depth: usize,
}

/// A shared handle to one render call's namespace.
///
/// Cloning the handle shares the same underlying state. Containers built by
/// the grammar parser keep a [`WeakContext`] back to it.
#[derive(Clone)]
pub struct Context {
    inner: Rc<RefCell<ContextData>>,
}

/// A non-owning handle held by parsed containers and text values.
#[derive(Clone)]
pub struct WeakContext(Weak<RefCell<ContextData>>);

impl WeakContext {
    pub fn upgrade(&self, path: &str) -> Result<Context, RenderError> {
        self.0
            .upgrade()
            .map(|inner| Context { inner })
            .ok_or_else(|| RenderError::ContextDropped {
                path: path.to_string(),
            })
    }
}

impl fmt::Debug for WeakContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WeakContext(..)")
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.inner.borrow();
        let mut names: Vec<&String> = data.bindings.keys().collect();
        names.sort();
        f.debug_struct("Context")
            .field("seed", &data.seed)
            .field("key", &data.key)
            .field("bindings", &names)
            .finish()
    }
}

impl Context {
    /// An empty context whose seed is generated on first use.
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(ContextData {
                seed: Seed::Auto,
                key: None,
                bindings: FxHashMap::default(),
                depth: 0,
                max_depth: DEFAULT_MAX_DEPTH,
            })),
        }
    }

    /// A fresh context with `seed` normalized into it.
    pub fn with_seed(seed: impl Into<Seed>) -> Self {
        let ctx = Self::new();
        seeds::set_seed(&ctx, seed.into());
        ctx
    }

    /// A fresh context holding `seed` plus caller-supplied parameters.
    pub fn with_params<I, K>(seed: impl Into<Seed>, params: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let ctx = Self::with_seed(seed);
        for (name, value) in params {
            ctx.insert(name, value);
        }
        ctx
    }

    pub fn downgrade(&self) -> WeakContext {
        WeakContext(Rc::downgrade(&self.inner))
    }

    pub fn seed(&self) -> Seed {
        self.inner.borrow().seed.clone()
    }

    pub fn set_seed(&self, seed: Seed) {
        self.inner.borrow_mut().seed = seed;
    }

    /// The base seed as a string, generating and storing one if needed.
    pub fn materialize_seed(&self) -> String {
        let current = self.seed();
        if let Seed::Fixed(s) = current {
            return s;
        }
        seeds::set_seed(self, current);
        self.seed().as_str().map(str::to_string).unwrap_or_default()
    }

    pub fn key(&self) -> Option<String> {
        self.inner.borrow().key.clone()
    }

    pub fn set_key(&self, key: Option<String>) {
        self.inner.borrow_mut().key = key;
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.inner.borrow().bindings.get(name).cloned()
    }

    pub fn insert(&self, name: impl Into<String>, value: Value) {
        self.inner.borrow_mut().bindings.insert(name.into(), value);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.borrow().bindings.contains_key(name)
    }

    /// Bound names in sorted order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.borrow().bindings.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve a bare name: bindings first, then the `seed` and `key` fields.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.get(name) {
            return Some(value);
        }
        match name {
            "seed" => self.seed().as_str().map(Value::from),
            "key" => self.key().map(Value::from),
            _ => None,
        }
    }

    pub fn max_depth(&self) -> usize {
        self.inner.borrow().max_depth
    }

    pub fn set_max_depth(&self, max_depth: usize) {
        self.inner.borrow_mut().max_depth = max_depth;
    }

    /// Run `f` with `key` and `seed` overridden, restoring both afterwards.
    pub fn scoped<R>(&self, key: Option<String>, seed: Seed, f: impl FnOnce(&Context) -> R) -> R {
        let (old_key, old_seed) = {
            let mut data = self.inner.borrow_mut();
            let old_key = std::mem::replace(&mut data.key, key);
            let old_seed = std::mem::replace(&mut data.seed, seed);
            (old_key, old_seed)
        };
        let result = f(self);
        let mut data = self.inner.borrow_mut();
        data.key = old_key;
        data.seed = old_seed;
        result
    }

    /// Enter one level of nested evaluation for `path`.
    ///
    /// The returned guard leaves the level when dropped.
    pub fn descend(&self, path: &str) -> Result<DepthGuard, RenderError> {
        let mut data = self.inner.borrow_mut();
        if data.depth >= data.max_depth {
            return Err(RenderError::RecursionLimit {
                path: path.to_string(),
                limit: data.max_depth,
            });
        }
        data.depth += 1;
        Ok(DepthGuard {
            inner: Rc::clone(&self.inner),
        })
    }
}

pub struct DepthGuard {
    inner: Rc<RefCell<ContextData>>,
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        let mut data = self.inner.borrow_mut();
        data.depth = data.depth.saturating_sub(1);
    }
}
