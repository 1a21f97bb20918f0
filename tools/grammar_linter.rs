//! Grammar Linter: validates YAML grammar modules before they are rendered.
//!
//! Usage: grammar_linter <grammar file or directory> [--start <stanza>]

use anyhow::Result;
use clap::Parser;
use prestoplot::core::context::Context;
use prestoplot::core::db::{Production, Value};
use prestoplot::core::grammar;
use prestoplot::core::storage::{FileStorage, Storage};
use prestoplot::core::template::Template;
use prestoplot::core::text::{RenderStrategy, RenderableText};
use std::path::PathBuf;
use std::process;

/// Names every render context provides without a stanza.
const IMPLICIT_NAMES: &[&str] = &["seed", "key", "markov_chainlen", "start_markov"];

#[derive(Parser, Debug)]
#[command(name = "grammar_linter", version, about = "Validate YAML grammar modules")]
struct Args {
    /// A grammar file, or a directory of them
    path: PathBuf,

    /// Stanza each module is expected to define
    #[arg(long, default_value = "Begin")]
    start: String,
}

#[derive(Debug, Default)]
struct Report {
    errors: Vec<String>,
    warnings: Vec<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let (storage, modules) = if args.path.is_file() {
        let dir = args
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let name = args
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        (FileStorage::new(dir), vec![name])
    } else if args.path.is_dir() {
        let storage = FileStorage::new(&args.path);
        let modules = storage.list_modules()?;
        (storage, modules)
    } else {
        eprintln!("ERROR: Path '{}' does not exist", args.path.display());
        process::exit(1);
    };

    println!("Checking {} grammar modules", modules.len());

    let mut report = Report::default();
    for module in &modules {
        lint_module(&storage, module, &args.start, &mut report);
    }

    println!("\n=== Grammar Lint Report ===\n");

    if report.errors.is_empty() && report.warnings.is_empty() {
        println!("All checks passed!");
    }

    for warning in &report.warnings {
        println!("WARNING: {}", warning);
    }

    for error in &report.errors {
        println!("ERROR: {}", error);
    }

    println!(
        "\nSummary: {} errors, {} warnings",
        report.errors.len(),
        report.warnings.len()
    );

    if report.errors.is_empty() {
        Ok(())
    } else {
        process::exit(1);
    }
}

fn lint_module(storage: &dyn Storage, module: &str, start: &str, report: &mut Report) {
    let context = Context::with_seed("lint");
    if let Err(e) = grammar::load_grammar(storage, module, &context) {
        report.errors.push(format!("Module '{}' failed to load: {}", module, e));
        return;
    }
    println!("  Loaded: {}", module);

    if !context.contains(start) {
        report.warnings.push(format!(
            "Module '{}' (with its includes) has no '{}' stanza",
            module, start
        ));
    }

    for name in context.names() {
        if let Some(value) = context.get(&name) {
            lint_value(&value, &name, &context, report);
        }
    }
}

fn lint_value(value: &Value, stanza: &str, context: &Context, report: &mut Report) {
    match value {
        Value::Text(text) => lint_text(text, context, report),
        Value::Database(db) => {
            let items = db.production().items();
            match db.production() {
                Production::Choose(_) | Production::Pick(_) if items.is_empty() => {
                    report.errors.push(format!("Stanza '{}' has no alternatives", db.grammar_path()));
                }
                Production::Choose(_) if items.len() < 2 => {
                    report.warnings.push(format!(
                        "Stanza '{}' has only {} alternative (minimum 2 recommended)",
                        db.grammar_path(),
                        items.len()
                    ));
                }
                Production::Markov(names) if names.len() < 3 => {
                    report.warnings.push(format!(
                        "Markov stanza '{}' is trained on only {} names",
                        db.grammar_path(),
                        names.len()
                    ));
                }
                _ => {}
            }

            let self_referencing = |item: &Value| match item {
                Value::Text(text) => template_names(text).iter().any(|n| n == stanza),
                _ => false,
            };
            if matches!(db.production(), Production::Choose(_) | Production::Pick(_))
                && !items.is_empty()
                && items.iter().all(self_referencing)
            {
                report.errors.push(format!(
                    "Stanza '{}' has no non-recursive alternative (infinite recursion)",
                    db.grammar_path()
                ));
            }

            for item in &items {
                lint_value(item, stanza, context, report);
            }
        }
        Value::Databag(bag) => {
            for (_, entry) in bag.entries() {
                lint_value(entry, stanza, context, report);
            }
        }
        Value::Datalist(list) => {
            for item in list.items() {
                lint_value(item, stanza, context, report);
            }
        }
        Value::Bool(_) | Value::Int(_) | Value::Str(_) => {}
    }
}

fn template_names(text: &RenderableText) -> Vec<String> {
    match text.strategy() {
        RenderStrategy::FTemplate => Template::parse(text.value()).map(|t| t.names()).unwrap_or_default(),
        RenderStrategy::Jinja2 => Vec::new(),
    }
}

fn lint_text(text: &RenderableText, context: &Context, report: &mut Report) {
    match text.strategy() {
        RenderStrategy::FTemplate => match Template::parse(text.value()) {
            Ok(template) => {
                for name in template.names() {
                    if !context.contains(&name) && !IMPLICIT_NAMES.contains(&name.as_str()) {
                        report.errors.push(format!(
                            "Template in '{}' references undefined name '{}'",
                            text.grammar_path(),
                            name
                        ));
                    }
                }
            }
            Err(e) => report.errors.push(format!(
                "Template in '{}' does not parse ({}): {}",
                text.grammar_path(),
                e,
                text.value()
            )),
        },
        RenderStrategy::Jinja2 => {
            let env = minijinja::Environment::new();
            if let Err(e) = env.template_from_str(text.value()) {
                report.errors.push(format!(
                    "Jinja2 template in '{}' does not parse: {}",
                    text.grammar_path(),
                    e
                ));
            }
        }
    }
}
