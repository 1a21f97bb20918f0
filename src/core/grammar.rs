//! Grammar loading: turns storage documents into live context bindings.
//!
//! Every top-level stanza of a module (and of each module it includes)
//! becomes a binding in the render [`Context`]. Lists become lazy
//! [`Database`] resolvers whose behavior depends on an optional leading
//! `{mode: ...}` marker, mappings become [`Databag`]s, and scalars become
//! deferred templates.

use rustc_hash::FxHashSet;
use serde::Deserialize;
use serde_yaml::{Mapping, Value as YamlValue};
use thiserror::Error;
use tracing::{debug, trace};

use crate::core::context::Context;
use crate::core::db::{self, Database, Databag, Datalist, Value};
use crate::core::storage::{Storage, StorageError};
use crate::core::text::{RenderStrategy, RenderableText, RenderedStr};

const INCLUDE_KEY: &str = "include";
const RENDER_KEY: &str = "render";
const MODE_KEY: &str = "mode";

#[derive(Debug, Error)]
pub enum GrammarError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("unrecognized render strategy `{strategy}` in {module}")]
    UnknownRenderStrategy { strategy: String, module: String },
    #[error("unrecognized list mode `{mode}` in {path}")]
    UnknownMode { mode: String, path: String },
    #[error("`include` in {module} must be a module name or a list of module names")]
    InvalidInclude { module: String },
    #[error("markov source in {path} must contain only plain names")]
    InvalidMarkovSource { path: String },
}

/// How a list stanza resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Seeded choice with replacement.
    #[default]
    Reuse,
    /// Seeded choice without replacement.
    Pick,
    /// A Markov-generated name trained on the list.
    Markov,
    /// Round-robin through the list.
    Ratchet,
    /// A plain positional list.
    List,
}

/// Load module `name` and everything it includes into `context`.
pub fn load_grammar(storage: &dyn Storage, name: &str, context: &Context) -> Result<(), GrammarError> {
    let mut included = FxHashSet::default();
    parse_grammar_file(storage, name, context, &mut included)
}

/// Load one module into `context`, recursing into its includes first.
///
/// `included` records modules already visited in this load, which also
/// makes include cycles terminate.
pub fn parse_grammar_file(
    storage: &dyn Storage,
    grammar_path: &str,
    context: &Context,
    included: &mut FxHashSet<String>,
) -> Result<(), GrammarError> {
    if !included.insert(grammar_path.to_string()) {
        trace!(module = grammar_path, "module already included");
        return Ok(());
    }
    debug!(module = grammar_path, "parsing grammar module");

    let mut doc = storage.resolve_module(grammar_path)?;
    parse_includes(storage, grammar_path, doc.remove(INCLUDE_KEY), context, included)?;
    let strategy = parse_render_strategy(doc.remove(RENDER_KEY), grammar_path)?;
    parse_data(doc, grammar_path, context, strategy)
}

/// The module's render strategy; `ftemplate` when unspecified.
pub fn parse_render_strategy(render: Option<YamlValue>, grammar_path: &str) -> Result<RenderStrategy, GrammarError> {
    let Some(render) = render else {
        return Ok(RenderStrategy::default());
    };
    serde_yaml::from_value::<RenderStrategy>(render.clone()).map_err(|_| GrammarError::UnknownRenderStrategy {
        strategy: scalar_text(&render).unwrap_or_else(|| format!("{:?}", render)),
        module: grammar_path.to_string(),
    })
}

/// Load each included module, in order, before the including module's data.
pub fn parse_includes(
    storage: &dyn Storage,
    grammar_path: &str,
    includes: Option<YamlValue>,
    context: &Context,
    included: &mut FxHashSet<String>,
) -> Result<(), GrammarError> {
    let names = match includes {
        None | Some(YamlValue::Null) => return Ok(()),
        Some(YamlValue::String(name)) => vec![name],
        Some(YamlValue::Sequence(items)) => items
            .iter()
            .map(scalar_text)
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| GrammarError::InvalidInclude {
                module: grammar_path.to_string(),
            })?,
        Some(_) => {
            return Err(GrammarError::InvalidInclude {
                module: grammar_path.to_string(),
            })
        }
    };
    for name in names {
        parse_grammar_file(storage, &name, context, included)?;
    }
    Ok(())
}

/// Bind every stanza of `data` into `context`. Later modules overwrite
/// earlier bindings of the same name.
pub fn parse_data(
    data: Mapping,
    grammar_path: &str,
    context: &Context,
    strategy: RenderStrategy,
) -> Result<(), GrammarError> {
    for (key, value) in data {
        let Some(name) = scalar_text(&key) else {
            debug!(module = grammar_path, key = ?key, "skipping non-scalar stanza name");
            continue;
        };
        let stanza_path = format!("{}:{}", grammar_path, name);
        let value = parse_value(value, &stanza_path, context, strategy)?;
        context.insert(name, value);
    }
    Ok(())
}

/// Split a list into its mode and items. Only a leading single-key
/// `{mode: ...}` mapping counts as a marker.
pub fn get_list_setting(mut items: Vec<YamlValue>, grammar_path: &str) -> Result<(Mode, Vec<YamlValue>), GrammarError> {
    let mode_value = match items.first() {
        Some(YamlValue::Mapping(head)) if head.len() == 1 => head.get(MODE_KEY).cloned(),
        _ => None,
    };
    let Some(mode_value) = mode_value else {
        return Ok((Mode::default(), items));
    };
    let mode = serde_yaml::from_value::<Mode>(mode_value.clone()).map_err(|_| GrammarError::UnknownMode {
        mode: scalar_text(&mode_value).unwrap_or_else(|| format!("{:?}", mode_value)),
        path: grammar_path.to_string(),
    })?;
    items.remove(0);
    Ok((mode, items))
}

/// Convert one YAML value into a live grammar value.
pub fn parse_value(
    value: YamlValue,
    grammar_path: &str,
    context: &Context,
    strategy: RenderStrategy,
) -> Result<Value, GrammarError> {
    match value {
        YamlValue::Sequence(items) => {
            let (mode, items) = get_list_setting(items, grammar_path)?;
            parse_list(mode, items, grammar_path, context, strategy)
        }
        YamlValue::Mapping(map) => {
            let mut entries = Vec::with_capacity(map.len());
            for (key, value) in map {
                let Some(key) = scalar_text(&key) else {
                    debug!(path = grammar_path, key = ?key, "skipping non-scalar key");
                    continue;
                };
                let entry_path = format!("{}.{}", grammar_path, key);
                entries.push((key, parse_value(value, &entry_path, context, strategy)?));
            }
            Ok(Value::from(Databag::new(grammar_path, context, entries)))
        }
        YamlValue::Bool(b) => Ok(Value::Bool(b)),
        YamlValue::Tagged(tagged) => parse_value(tagged.value, grammar_path, context, strategy),
        scalar => {
            let raw = scalar_text(&scalar).unwrap_or_default();
            Ok(Value::from(RenderableText::new(fix_text(&raw), grammar_path, context, strategy)))
        }
    }
}

fn parse_list(
    mode: Mode,
    items: Vec<YamlValue>,
    grammar_path: &str,
    context: &Context,
    strategy: RenderStrategy,
) -> Result<Value, GrammarError> {
    let path_for = |i: usize| format!("{}[{}]", grammar_path, i);

    match mode {
        Mode::Markov => {
            let names = items
                .iter()
                .map(plain_scalar)
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| GrammarError::InvalidMarkovSource {
                    path: grammar_path.to_string(),
                })?;
            Ok(Value::from(Database::new(db::markovify(names), grammar_path, context)))
        }
        Mode::Ratchet | Mode::List => {
            let mut values = Vec::with_capacity(items.len());
            for (i, item) in items.into_iter().enumerate() {
                let value = match plain_scalar(&item) {
                    Some(text) => Value::Str(RenderedStr::from(text)),
                    None => parse_value(item, &path_for(i), context, strategy)?,
                };
                values.push(value);
            }
            if mode == Mode::List {
                Ok(Value::from(Datalist::new(grammar_path, context, values)))
            } else {
                Ok(Value::from(Database::new(db::ratchet(values), grammar_path, context)))
            }
        }
        Mode::Reuse | Mode::Pick => {
            let mut values = Vec::with_capacity(items.len());
            for (i, item) in items.into_iter().enumerate() {
                values.push(parse_value(item, &path_for(i), context, strategy)?);
            }
            let production = if mode == Mode::Pick {
                db::pick(values)
            } else {
                db::choose(values)
            };
            Ok(Value::from(Database::new(production, grammar_path, context)))
        }
    }
}

/// Text of a scalar YAML value; `None` for collections.
fn scalar_text(value: &YamlValue) -> Option<String> {
    match value {
        YamlValue::String(s) => Some(s.clone()),
        YamlValue::Number(n) => Some(n.to_string()),
        YamlValue::Bool(true) => Some("True".to_string()),
        YamlValue::Bool(false) => Some("False".to_string()),
        YamlValue::Null => Some(String::new()),
        YamlValue::Tagged(tagged) => scalar_text(&tagged.value),
        YamlValue::Sequence(_) | YamlValue::Mapping(_) => None,
    }
}

/// Like [`scalar_text`], but null is not a plain value.
fn plain_scalar(value: &YamlValue) -> Option<String> {
    match value {
        YamlValue::Null => None,
        other => scalar_text(other),
    }
}

/// Strip common leading indentation, then surrounding whitespace.
pub fn fix_text(text: &str) -> String {
    let indent = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| &line[..line.len() - line.trim_start().len()])
        .reduce(|common, prefix| {
            let shared = common
                .char_indices()
                .zip(prefix.chars())
                .find(|((_, a), b)| a != b)
                .map(|((i, _), _)| i)
                .unwrap_or_else(|| common.len().min(prefix.len()));
            &common[..shared]
        })
        .unwrap_or("");

    let dedented: Vec<&str> = text
        .lines()
        .map(|line| line.strip_prefix(indent).unwrap_or_else(|| line.trim_start()))
        .collect();
    dedented.join("\n").trim().to_string()
}
