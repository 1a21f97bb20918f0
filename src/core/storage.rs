//! Grammar module storage. Where named grammar documents come from.
//!
//! A module is one YAML mapping of stanza names to values, plus the optional
//! `include` and `render` keys. [`FileStorage`] reads `<name>.yaml` files,
//! [`MemoryStorage`] holds parsed documents directly, [`CachedStorage`]
//! memoizes any backend, and [`CompilingFileStorage`] keeps a RON copy of
//! each parsed module next to its source.

use rustc_hash::FxHashMap;
use serde_yaml::{Mapping, Value as YamlValue};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use thiserror::Error;
use tracing::{debug, trace};

/// A parsed grammar module.
pub type Document = Mapping;

const SOURCE_EXTENSION: &str = "yaml";
const COMPILED_EXTENSION: &str = "ron";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("grammar module not found: {0}")]
    ModuleNotFound(String),
    #[error("grammar module {0} is not a mapping of stanzas")]
    NotAMapping(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("YAML error in grammar module: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("RON deserialization error: {0}")]
    Ron(#[from] ron::error::SpannedError),
    #[error("RON serialization error: {0}")]
    RonEncode(#[from] ron::Error),
}

/// A source of grammar modules.
pub trait Storage {
    /// Names of every module this storage can resolve, sorted.
    fn list_modules(&self) -> Result<Vec<String>, StorageError>;

    /// Load one module by name.
    fn resolve_module(&self, name: &str) -> Result<Document, StorageError>;
}

impl<S: Storage + ?Sized> Storage for &S {
    fn list_modules(&self) -> Result<Vec<String>, StorageError> {
        (**self).list_modules()
    }

    fn resolve_module(&self, name: &str) -> Result<Document, StorageError> {
        (**self).resolve_module(name)
    }
}

impl<S: Storage + ?Sized> Storage for Box<S> {
    fn list_modules(&self) -> Result<Vec<String>, StorageError> {
        (**self).list_modules()
    }

    fn resolve_module(&self, name: &str) -> Result<Document, StorageError> {
        (**self).resolve_module(name)
    }
}

/// Parse YAML source text into a module document.
pub fn parse_document(name: &str, source: &str) -> Result<Document, StorageError> {
    match serde_yaml::from_str::<YamlValue>(source)? {
        YamlValue::Mapping(doc) => Ok(doc),
        _ => Err(StorageError::NotAMapping(name.to_string())),
    }
}

/// Sorted stems of the files in `dir` with the given extension. A missing
/// directory has no modules.
fn list_files(dir: &Path, extension: &str) -> Result<Vec<String>, StorageError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut names = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some(extension) {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

/// Modules stored as `<name>.yaml` files in one directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn module_path(&self, name: &str) -> PathBuf {
        self.path.join(format!("{}.{}", name, SOURCE_EXTENSION))
    }
}

impl Storage for FileStorage {
    fn list_modules(&self) -> Result<Vec<String>, StorageError> {
        list_files(&self.path, SOURCE_EXTENSION)
    }

    fn resolve_module(&self, name: &str) -> Result<Document, StorageError> {
        let path = self.module_path(name);
        let source = match fs::read_to_string(&path) {
            Ok(source) => source,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::ModuleNotFound(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        debug!(module = name, path = %path.display(), "loading grammar module");
        parse_document(name, &source)
    }
}

/// [`FileStorage`] that writes a compiled `<name>.ron` beside each module on
/// first load and prefers it afterwards.
///
/// A compiled file that cannot be read falls back to the YAML source.
/// Compiled files are not invalidated when the source changes; call
/// [`recompile_modules`](Self::recompile_modules) after editing.
#[derive(Debug, Clone)]
pub struct CompilingFileStorage {
    files: FileStorage,
}

impl CompilingFileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            files: FileStorage::new(path),
        }
    }

    pub fn path(&self) -> &Path {
        self.files.path()
    }

    pub fn compiled_path(&self, name: &str) -> PathBuf {
        self.files.path().join(format!("{}.{}", name, COMPILED_EXTENSION))
    }

    /// Delete every compiled module file in the directory.
    pub fn clean(&self) -> Result<usize, StorageError> {
        let compiled = list_files(self.files.path(), COMPILED_EXTENSION)?;
        for name in &compiled {
            fs::remove_file(self.compiled_path(name))?;
        }
        debug!(removed = compiled.len(), "cleaned compiled grammar modules");
        Ok(compiled.len())
    }

    /// Discard compiled files and rebuild one for every source module.
    pub fn recompile_modules(&self) -> Result<Vec<String>, StorageError> {
        self.clean()?;
        let modules = self.files.list_modules()?;
        for name in &modules {
            self.resolve_module(name)?;
        }
        Ok(modules)
    }

    fn load_compiled(&self, name: &str) -> Option<Document> {
        let source = fs::read_to_string(self.compiled_path(name)).ok()?;
        match ron::from_str::<Document>(&source) {
            Ok(doc) => Some(doc),
            Err(e) => {
                debug!(module = name, error = %e, "ignoring unreadable compiled module");
                None
            }
        }
    }
}

impl Storage for CompilingFileStorage {
    fn list_modules(&self) -> Result<Vec<String>, StorageError> {
        self.files.list_modules()
    }

    fn resolve_module(&self, name: &str) -> Result<Document, StorageError> {
        if let Some(doc) = self.load_compiled(name) {
            trace!(module = name, "using compiled module");
            return Ok(doc);
        }
        let doc = self.files.resolve_module(name)?;
        let compiled = ron::ser::to_string(&doc)?;
        fs::write(self.compiled_path(name), compiled)?;
        debug!(module = name, "compiled grammar module");
        Ok(doc)
    }
}

/// Parsed modules shared by one or more [`CachedStorage`] handles.
#[derive(Debug, Default)]
pub struct ModuleCache {
    modules: RefCell<FxHashMap<String, Document>>,
}

impl ModuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Document> {
        self.modules.borrow().get(name).cloned()
    }

    pub fn insert(&self, name: &str, doc: Document) {
        self.modules.borrow_mut().insert(name.to_string(), doc);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.borrow().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.modules.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.borrow().is_empty()
    }

    pub fn clear(&self) {
        self.modules.borrow_mut().clear();
    }
}

/// Memoizes another storage. Each resolve returns an independent copy, so
/// callers can never alter the cached document.
#[derive(Debug)]
pub struct CachedStorage<S> {
    inner: S,
    cache: Rc<ModuleCache>,
}

impl<S: Storage> CachedStorage<S> {
    pub fn new(inner: S) -> Self {
        Self::with_cache(inner, Rc::new(ModuleCache::new()))
    }

    pub fn with_cache(inner: S, cache: Rc<ModuleCache>) -> Self {
        Self { inner, cache }
    }

    pub fn cache(&self) -> &Rc<ModuleCache> {
        &self.cache
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: Storage> Storage for CachedStorage<S> {
    fn list_modules(&self) -> Result<Vec<String>, StorageError> {
        self.inner.list_modules()
    }

    fn resolve_module(&self, name: &str) -> Result<Document, StorageError> {
        if let Some(doc) = self.cache.get(name) {
            trace!(module = name, "module cache hit");
            return Ok(doc);
        }
        let doc = self.inner.resolve_module(name)?;
        self.cache.insert(name, doc.clone());
        Ok(doc)
    }
}

/// Modules held in memory, keyed by name.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    modules: BTreeMap<String, Document>,
    loads: Cell<usize>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, doc: Document) {
        self.modules.insert(name.into(), doc);
    }

    /// Parse `source` as YAML and store it under `name`.
    pub fn insert_yaml(&mut self, name: impl Into<String>, source: &str) -> Result<(), StorageError> {
        let name = name.into();
        let doc = parse_document(&name, source)?;
        self.modules.insert(name, doc);
        Ok(())
    }

    /// Build a storage from `(name, yaml)` pairs.
    pub fn from_yaml<'a, I>(modules: I) -> Result<Self, StorageError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut storage = Self::new();
        for (name, source) in modules {
            storage.insert_yaml(name, source)?;
        }
        Ok(storage)
    }

    /// Number of successful resolves served so far.
    pub fn loads(&self) -> usize {
        self.loads.get()
    }
}

impl Storage for MemoryStorage {
    fn list_modules(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.modules.keys().cloned().collect())
    }

    fn resolve_module(&self, name: &str) -> Result<Document, StorageError> {
        let doc = self
            .modules
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::ModuleNotFound(name.to_string()))?;
        self.loads.set(self.loads.get() + 1);
        Ok(doc)
    }
}
