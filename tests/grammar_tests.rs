//! Grammar loading integration tests: modes, includes and failure reporting.

use prestoplot::core::context::Context;
use prestoplot::core::db::Value;
use prestoplot::core::grammar::{load_grammar, GrammarError};
use prestoplot::core::storage::{FileStorage, MemoryStorage, Storage, StorageError};
use prestoplot::core::text::RenderStrategy;

fn fixtures() -> FileStorage {
    FileStorage::new("tests/fixtures")
}

#[test]
fn fixture_modules_are_listed() {
    let modules = fixtures().list_modules().unwrap();
    for expected in ["characters", "characters_jinja", "hello", "names", "test_ratchet"] {
        assert!(modules.iter().any(|m| m == expected), "missing module {}", expected);
    }
}

#[test]
fn every_fixture_module_loads() {
    let storage = fixtures();
    for module in storage.list_modules().unwrap() {
        let ctx = Context::with_seed("load");
        load_grammar(&storage, &module, &ctx).unwrap_or_else(|e| panic!("{} failed: {}", module, e));
        assert!(!ctx.is_empty(), "{} bound nothing", module);
    }
}

#[test]
fn includes_bring_in_stanzas() {
    let ctx = Context::with_seed("s");
    load_grammar(&fixtures(), "characters_jinja", &ctx).unwrap();
    for name in ["Begin", "Gender", "Adjective", "Job", "Weapon", "HeroName"] {
        assert!(ctx.contains(name), "missing stanza {}", name);
    }
}

#[test]
fn render_strategy_is_per_module() {
    let ctx = Context::with_seed("s");
    load_grammar(&fixtures(), "characters_jinja", &ctx).unwrap();

    let strategy_of = |name: &str| match ctx.get(name) {
        Some(Value::Database(db)) => match db.production().items().first() {
            Some(Value::Text(text)) => text.strategy(),
            other => panic!("unexpected item: {:?}", other),
        },
        other => panic!("unexpected stanza: {:?}", other),
    };
    assert_eq!(strategy_of("Begin"), RenderStrategy::Jinja2);
    assert_eq!(strategy_of("Job"), RenderStrategy::FTemplate);
}

#[test]
fn databag_keys_keep_document_order() {
    let ctx = Context::with_seed("s");
    load_grammar(&fixtures(), "deck", &ctx).unwrap();
    let Some(Value::Databag(dealer)) = ctx.get("Dealer") else {
        panic!("Dealer should be a databag");
    };
    assert_eq!(dealer.keys().collect::<Vec<_>>(), vec!["name", "greeting"]);
    assert_eq!(dealer.get("greeting").unwrap().as_str(), Some("Welcome, I am Morgan."));
}

#[test]
fn unknown_render_strategy_is_rejected() {
    let storage = MemoryStorage::from_yaml([("m", "render: mustache\nBegin: [x]\n")]).unwrap();
    let err = load_grammar(&storage, "m", &Context::new()).unwrap_err();
    match err {
        GrammarError::UnknownRenderStrategy { strategy, module } => {
            assert_eq!(strategy, "mustache");
            assert_eq!(module, "m");
        }
        other => panic!("unexpected: {:?}", other),
    }
}

#[test]
fn unknown_mode_names_the_stanza() {
    let storage = MemoryStorage::from_yaml([("m", "Begin:\n  - mode: shuffle\n  - x\n")]).unwrap();
    let err = load_grammar(&storage, "m", &Context::new()).unwrap_err();
    assert!(matches!(err, GrammarError::UnknownMode { ref path, .. } if path == "m:Begin"));
    assert!(err.to_string().contains("shuffle"));
}

#[test]
fn missing_include_is_a_storage_error() {
    let storage = MemoryStorage::from_yaml([("m", "include: [gone]\nBegin: [x]\n")]).unwrap();
    let err = load_grammar(&storage, "m", &Context::new()).unwrap_err();
    assert!(matches!(err, GrammarError::Storage(StorageError::ModuleNotFound(ref name)) if name == "gone"));
}

#[test]
fn later_modules_override_included_stanzas() {
    let storage = MemoryStorage::from_yaml([
        ("base", "Name: [Base]\nOnly: [base]\n"),
        ("top", "include: base\nName: [Top]\n"),
    ])
    .unwrap();
    let ctx = Context::with_seed("s");
    load_grammar(&storage, "top", &ctx).unwrap();
    let Some(Value::Database(name)) = ctx.get("Name") else {
        panic!("Name should be a database");
    };
    assert_eq!(name.render().unwrap(), "Top");
    assert!(ctx.contains("Only"));
}

#[test]
fn block_text_is_dedented() {
    let storage = MemoryStorage::from_yaml([(
        "m",
        "Begin:\n  - |\n      first line\n        indented\n      last line\n",
    )])
    .unwrap();
    let ctx = Context::with_seed("s");
    load_grammar(&storage, "m", &ctx).unwrap();
    let Some(Value::Database(begin)) = ctx.get("Begin") else {
        panic!("Begin should be a database");
    };
    assert_eq!(begin.render().unwrap(), "first line\n  indented\nlast line");
}

#[test]
fn includes_load_before_render_strategy_is_checked() {
    let storage = MemoryStorage::from_yaml([("m", "render: mustache\ninclude: [gone]\nBegin: [x]\n")]).unwrap();
    let err = load_grammar(&storage, "m", &Context::new()).unwrap_err();
    assert!(matches!(err, GrammarError::Storage(StorageError::ModuleNotFound(ref name)) if name == "gone"));

    let storage = MemoryStorage::from_yaml([("base", "Name: [Base]\n"), ("m", "render: mustache\ninclude: base\n")]).unwrap();
    let ctx = Context::with_seed("s");
    let err = load_grammar(&storage, "m", &ctx).unwrap_err();
    assert!(matches!(err, GrammarError::UnknownRenderStrategy { ref module, .. } if module == "m"));
    assert!(ctx.contains("Name"));
}
