//! The `jinja2` render strategy, backed by minijinja.
//!
//! Grammar values are reference-counted and lazily evaluated, while
//! minijinja wants `Send + Sync` objects. Each render therefore opens a
//! thread-local frame holding the context and every grammar value handed to
//! the template; the objects minijinja sees carry only a slot number. Names
//! are looked up when the template reaches them, and a production is
//! evaluated every time it is output, so `{{ Color }} {{ Color }}` advances
//! a ratchet twice. Names that resolve to nothing render as a visible
//! `{{ path }}` placeholder.

use minijinja::value::{Enumerator, Object, ObjectRepr, Value as JValue, ValueKind};
use minijinja::{Environment, Error as JError, ErrorKind, State};
use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error};

use crate::core::context::Context;
use crate::core::db::{RenderError, Value};
use crate::core::eval::{self, StrMethod};
use crate::core::text::RenderedStr;

/// Globals minijinja provides itself; these are never bound from the context.
const BUILTIN_GLOBALS: &[&str] = &["range", "dict", "namespace", "debug", "cycler", "joiner", "loop"];

/// Render `tmpl` as a Jinja template against `context`.
pub fn render_jinja2(tmpl: &str, grammar_path: &str, context: &Context) -> Result<RenderedStr, RenderError> {
    let env = Environment::new();
    let template = env
        .template_from_str(tmpl)
        .map_err(|e| jinja_error(&e, tmpl, grammar_path))?;

    let frame = Frame::enter(context.clone());
    let root = JValue::from_object(Root {
        frame: frame.index,
        path: grammar_path.to_string(),
    });
    let rendered = template.render(root);

    if let Some(e) = frame.take_error() {
        if !e.is_located() {
            error!(path = grammar_path, template = tmpl, error = %e, "could not render Jinja2 template");
        }
        return Err(e.in_template(grammar_path, tmpl));
    }
    rendered
        .map(RenderedStr::from)
        .map_err(|e| jinja_error(&e, tmpl, grammar_path))
}

thread_local! {
    static ARENA: RefCell<Arena> = RefCell::new(Arena::default());
}

/// Grammar values reachable from the templates currently rendering.
#[derive(Default)]
struct Arena {
    values: Vec<Value>,
    frames: Vec<FrameData>,
}

struct FrameData {
    start: usize,
    context: Context,
    /// First failure met while minijinja was driving evaluation.
    error: Option<RenderError>,
}

/// One template render's share of the arena. Frames nest when a value
/// rendered by one jinja template is itself a jinja template.
struct Frame {
    index: usize,
}

impl Frame {
    fn enter(context: Context) -> Frame {
        ARENA.with(|arena| {
            let mut arena = arena.borrow_mut();
            let start = arena.values.len();
            arena.frames.push(FrameData {
                start,
                context,
                error: None,
            });
            Frame {
                index: arena.frames.len() - 1,
            }
        })
    }

    fn take_error(&self) -> Option<RenderError> {
        ARENA.with(|arena| {
            arena
                .borrow_mut()
                .frames
                .get_mut(self.index)
                .and_then(|frame| frame.error.take())
        })
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        let released = ARENA.with(|arena| {
            let mut arena = arena.borrow_mut();
            arena.frames.truncate(self.index + 1);
            match arena.frames.pop() {
                Some(frame) => {
                    let values = arena.values.split_off(frame.start);
                    Some((frame.context, values))
                }
                None => None,
            }
        });
        drop(released);
    }
}

fn store(value: Value) -> usize {
    ARENA.with(|arena| {
        let mut arena = arena.borrow_mut();
        arena.values.push(value);
        arena.values.len() - 1
    })
}

fn fetch(slot: usize) -> Option<Value> {
    ARENA.with(|arena| arena.borrow().values.get(slot).cloned())
}

fn frame_context(frame: usize) -> Option<Context> {
    ARENA.with(|arena| arena.borrow().frames.get(frame).map(|f| f.context.clone()))
}

/// Record `err` against the innermost frame; the first one wins.
fn fail(err: RenderError) {
    ARENA.with(|arena| {
        let mut arena = arena.borrow_mut();
        match arena.frames.last_mut() {
            Some(frame) if frame.error.is_none() => frame.error = Some(err),
            Some(_) => {}
            None => error!(error = %err, "jinja failure outside a render"),
        }
    });
}

/// The template's root namespace: the render context, looked up lazily.
#[derive(Debug)]
struct Root {
    frame: usize,
    path: String,
}

impl Object for Root {
    fn repr(self: &Arc<Self>) -> ObjectRepr {
        ObjectRepr::Map
    }

    fn get_value(self: &Arc<Self>, key: &JValue) -> Option<JValue> {
        let name = key.as_str()?;
        let context = frame_context(self.frame)?;
        match context.lookup(name) {
            Some(value) => Some(to_jinja(value, name.to_string(), &self.path)),
            None if BUILTIN_GLOBALS.contains(&name) => None,
            None => {
                debug!(path = %self.path, variable = name, "unbound template variable");
                Some(placeholder(name.to_string()))
            }
        }
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        match frame_context(self.frame) {
            Some(context) => Enumerator::Values(context.names().into_iter().map(JValue::from).collect()),
            None => Enumerator::Empty,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Plain,
    Seq,
    Map,
}

/// A grammar value parked in the arena.
#[derive(Debug)]
struct Live {
    slot: usize,
    shape: Shape,
    /// The template expression that reached this value, for placeholders.
    dotted: String,
    path: String,
}

impl Live {
    fn value(&self) -> Option<Value> {
        fetch(self.slot)
    }

    fn attr(&self, attr: &str) -> Option<JValue> {
        let value = self.value()?;
        let dotted = format!("{}.{}", self.dotted, attr);
        match eval::get_attr(&value, attr, &self.path) {
            Ok(found) => Some(to_jinja(found, dotted, &self.path)),
            Err(e) if e.is_lookup_miss() => {
                debug!(path = %self.path, variable = %dotted, "unbound template variable");
                Some(placeholder(dotted))
            }
            Err(e) => {
                fail(e);
                None
            }
        }
    }

    fn item(&self, index: i64) -> Option<JValue> {
        let Some(Value::Datalist(list)) = self.value() else {
            return None;
        };
        match list.get(index) {
            Ok(found) => Some(to_jinja(found, format!("{}[{}]", self.dotted, index), &self.path)),
            Err(e) if e.is_lookup_miss() => None,
            Err(e) => {
                fail(e);
                None
            }
        }
    }
}

impl Object for Live {
    fn repr(self: &Arc<Self>) -> ObjectRepr {
        match self.shape {
            Shape::Plain => ObjectRepr::Plain,
            Shape::Seq => ObjectRepr::Seq,
            Shape::Map => ObjectRepr::Map,
        }
    }

    fn get_value(self: &Arc<Self>, key: &JValue) -> Option<JValue> {
        if let Some(attr) = key.as_str() {
            return self.attr(attr);
        }
        match self.shape {
            Shape::Seq => self.item(i64::try_from(key.clone()).ok()?),
            Shape::Plain | Shape::Map => None,
        }
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        match self.value() {
            Some(Value::Datalist(list)) => Enumerator::Seq(list.len()),
            Some(Value::Databag(bag)) => Enumerator::Values(bag.keys().map(JValue::from).collect()),
            _ => Enumerator::NonEnumerable,
        }
    }

    fn call_method(
        self: &Arc<Self>,
        _state: &State<'_, '_>,
        method: &str,
        args: &[JValue],
    ) -> Result<JValue, JError> {
        if StrMethod::from_name(method).is_none() {
            return Err(JError::from(ErrorKind::UnknownMethod));
        }
        let value = self
            .value()
            .ok_or_else(|| JError::new(ErrorKind::InvalidOperation, "grammar value is no longer available"))?;
        let args = args
            .iter()
            .map(|arg| {
                from_jinja(arg).ok_or_else(|| {
                    JError::new(
                        ErrorKind::InvalidOperation,
                        format!("unsupported argument {} to {}()", arg, method),
                    )
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        match eval::call_method(&value, method, &args, &self.path) {
            Ok(result) => Ok(to_jinja(result, format!("{}.{}()", self.dotted, method), &self.path)),
            Err(e) => {
                let reason = e.to_string();
                fail(e);
                Err(JError::new(ErrorKind::InvalidOperation, reason))
            }
        }
    }

    fn render(self: &Arc<Self>, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(value) = self.value() else {
            return write!(f, "{{{{ {} }}}}", self.dotted);
        };
        match value.render() {
            Ok(text) => f.write_str(text.as_str()),
            Err(e) => {
                fail(e);
                Err(fmt::Error)
            }
        }
    }
}

/// Stand-in for a name nothing is bound to; attributes of it are too.
#[derive(Debug)]
struct Placeholder(String);

impl Object for Placeholder {
    fn repr(self: &Arc<Self>) -> ObjectRepr {
        ObjectRepr::Plain
    }

    fn get_value(self: &Arc<Self>, key: &JValue) -> Option<JValue> {
        Some(placeholder(format!("{}.{}", self.0, key)))
    }

    fn render(self: &Arc<Self>, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{{ {} }}}}", self.0)
    }
}

fn placeholder(dotted: String) -> JValue {
    JValue::from_object(Placeholder(dotted))
}

fn to_jinja(value: Value, dotted: String, path: &str) -> JValue {
    let shape = match &value {
        Value::Bool(b) => return JValue::from(*b),
        Value::Int(n) => return JValue::from(*n),
        Value::Datalist(_) => Shape::Seq,
        Value::Databag(_) => Shape::Map,
        Value::Str(_) | Value::Text(_) | Value::Database(_) => Shape::Plain,
    };
    JValue::from_object(Live {
        slot: store(value),
        shape,
        dotted,
        path: path.to_string(),
    })
}

fn from_jinja(value: &JValue) -> Option<Value> {
    if let Some(live) = value.downcast_object_ref::<Live>() {
        return live.value();
    }
    if let Some(s) = value.as_str() {
        return Some(Value::from(s));
    }
    if value.kind() == ValueKind::Bool {
        return Some(Value::Bool(value.is_true()));
    }
    i64::try_from(value.clone()).ok().map(Value::Int)
}

fn jinja_error(err: &JError, tmpl: &str, grammar_path: &str) -> RenderError {
    let line = err.line();
    let location = match line.and_then(|n| tmpl.lines().nth(n.saturating_sub(1)).map(|src| (n, src))) {
        Some((n, src)) => format!("{}, line {}\n--> {}", grammar_path, n, src),
        None => format!("{}\n--> {}", grammar_path, tmpl),
    };
    error!(path = grammar_path, template = tmpl, error = %err, "could not render Jinja2 template");
    RenderError::Jinja {
        path: grammar_path.to_string(),
        reason: err.to_string(),
        location,
        line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::db::{choose, pick, ratchet, Database, Databag, Datalist};

    fn ctx() -> Context {
        let ctx = Context::with_seed("jinja");
        ctx.insert("name", Value::from("Earth"));
        ctx
    }

    fn colors(ctx: &Context) {
        let db = Database::new(
            ratchet(vec![Value::from("red"), Value::from("blue"), Value::from("green")]),
            "test:Color",
            ctx,
        );
        ctx.insert("Color", Value::from(db));
    }

    #[test]
    fn renders_simple_variable() {
        let ctx = ctx();
        assert_eq!(render_jinja2("Hello {{ name }}", "test:Begin", &ctx).unwrap(), "Hello Earth");
    }

    #[test]
    fn unbound_names_render_as_placeholders() {
        let ctx = ctx();
        let out = render_jinja2("Hi {{ nobody }} and {{ ghost.name }}", "test:Begin", &ctx).unwrap();
        assert_eq!(out, "Hi {{ nobody }} and {{ ghost.name }}");
    }

    #[test]
    fn nested_attributes_resolve_through_containers() {
        let ctx = ctx();
        let bag = Databag::new(
            "test:Hero",
            &ctx,
            vec![("name".to_string(), Value::from("Ada")), ("title".to_string(), Value::from("Bold"))],
        );
        ctx.insert("Hero", Value::from(bag));
        let out = render_jinja2("{{ Hero.name }} the {{ Hero.title }}{{ Hero.age }}", "test:Begin", &ctx).unwrap();
        assert_eq!(out, "Ada the Bold{{ Hero.age }}");
    }

    #[test]
    fn database_attributes_are_resolved() {
        let ctx = ctx();
        let db = Database::new(ratchet(vec![Value::from("one"), Value::from("two")]), "test:Num", &ctx);
        ctx.insert("Num", Value::from(db));
        let out = render_jinja2("{{ Num.a }}/{{ Num.b }}/{{ Num.a }}", "test:Begin", &ctx).unwrap();
        assert_eq!(out, "one/two/one");
    }

    #[test]
    fn bare_references_evaluate_on_every_use() {
        let ctx = ctx();
        colors(&ctx);
        let out = render_jinja2("{{ Color }} {{ Color }} {{ Color }} {{ Color }}", "test:Begin", &ctx).unwrap();
        assert_eq!(out, "red blue green red");
    }

    #[test]
    fn attributes_resolve_in_template_order() {
        let ctx = ctx();
        colors(&ctx);
        let out = render_jinja2("{{ Color.x }} {{ Color.a }}", "test:Begin", &ctx).unwrap();
        assert_eq!(out, "red blue");
    }

    #[test]
    fn bare_picks_never_repeat() {
        let ctx = ctx();
        let db = Database::new(pick(vec![Value::from("ace"), Value::from("king")]), "test:Card", &ctx);
        ctx.insert("Card", Value::from(db));
        let out = render_jinja2("{{ Card }},{{ Card }}", "test:Begin", &ctx).unwrap();
        let mut cards: Vec<&str> = out.as_str().split(',').collect();
        cards.sort();
        assert_eq!(cards, vec!["ace", "king"]);
    }

    #[test]
    fn string_methods_apply_to_rendered_values() {
        let ctx = ctx();
        let db = Database::new(choose(vec![Value::from("wizard")]), "test:Job", &ctx);
        ctx.insert("Job", Value::from(db));
        let out = render_jinja2(
            "{{ Job.upper() }} {{ name.replace('E', 'Ea') }} {{ Job.title().startswith('W') }}",
            "test:Begin",
            &ctx,
        )
        .unwrap();
        assert_eq!(out, "WIZARD Eaarth true");
    }

    #[test]
    fn lists_support_loops_and_filters() {
        let ctx = ctx();
        let list = Datalist::new("test:Colors", &ctx, vec![Value::from("red"), Value::from("blue")]);
        ctx.insert("Colors", Value::from(list));
        let out = render_jinja2(
            "{% for c in Colors %}{{ c|upper }} {% endfor %}{{ Colors|length }} {{ Colors[-1] }} {{ range(2)|length }}",
            "test:Begin",
            &ctx,
        )
        .unwrap();
        assert_eq!(out, "RED BLUE 2 blue 2");
    }

    #[test]
    fn databags_iterate_in_document_order() {
        let ctx = ctx();
        let bag = Databag::new(
            "test:Hero",
            &ctx,
            vec![("zeal".to_string(), Value::from("high")), ("age".to_string(), Value::from("old"))],
        );
        ctx.insert("Hero", Value::from(bag));
        let out = render_jinja2("{% for k in Hero %}{{ k }}={{ Hero[k] }} {% endfor %}", "test:Begin", &ctx).unwrap();
        assert_eq!(out, "zeal=high age=old ");
    }

    #[test]
    fn evaluation_failures_carry_the_template() {
        let ctx = ctx();
        let db = Database::new(choose(Vec::new()), "test:Empty", &ctx);
        ctx.insert("Empty", Value::from(db));
        let err = render_jinja2("x {{ Empty }}", "test:Begin", &ctx).unwrap_err();
        match err {
            RenderError::Template { path, template, source } => {
                assert_eq!(path, "test:Begin");
                assert_eq!(template, "x {{ Empty }}");
                assert!(matches!(*source, RenderError::EmptyProduction { .. }));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn syntax_errors_report_line() {
        let ctx = ctx();
        let err = render_jinja2("fine\n{% if %}", "test:Broken", &ctx).unwrap_err();
        match err {
            RenderError::Jinja { path, line, location, .. } => {
                assert_eq!(path, "test:Broken");
                assert_eq!(line, Some(2));
                assert!(location.contains("{% if %}"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn arena_is_released_after_render() {
        let ctx = ctx();
        colors(&ctx);
        render_jinja2("{{ Color }} {{ name }}", "test:Begin", &ctx).unwrap();
        ARENA.with(|arena| {
            let arena = arena.borrow();
            assert!(arena.values.is_empty());
            assert!(arena.frames.is_empty());
        });
    }
}
