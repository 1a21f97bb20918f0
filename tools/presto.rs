//! presto: consult a YAML generative grammar from the command line.
//!
//! ```text
//! $ cat names.yaml
//! Begin:
//!   - "{Name}"
//! Name:
//!   - George
//!   - Martha
//! $ presto run names.yaml
//! George
//! ```

use anyhow::{Context as _, Result};
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser, Subcommand};
use prestoplot::core::seeds::Seed;
use prestoplot::core::storage::{CompilingFileStorage, FileStorage, Storage};
use prestoplot::core::story::{StoryRenderer, DEFAULT_START};
use std::path::{Path, PathBuf};
use tracing::debug;

/// PrestoPlot - generative grammar oracle
#[derive(Parser, Debug)]
#[command(name = "presto", version, about)]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse and consult a grammar file. It must contain the start stanza.
    Run {
        /// Grammar file; modules it includes are looked up beside it
        path: PathBuf,

        /// How many times to consult the oracle
        #[arg(long, default_value_t = 1)]
        count: usize,

        /// Characters to start any Markov chains with, e.g. 'Ba'
        #[arg(long, default_value = "")]
        markov_start: String,

        /// Length of Markov chain links
        #[arg(long, default_value_t = 2)]
        markov_chainlen: usize,

        /// Pre-seed the random generator
        #[arg(long)]
        seed: Option<String>,

        /// Stanza to render
        #[arg(long, default_value = DEFAULT_START)]
        start: String,

        /// Wrap text
        #[arg(long)]
        wrap: bool,

        /// Maximum line length when wrapping text
        #[arg(long, default_value_t = 78)]
        wrap_length: usize,

        /// Read and write compiled `.ron` copies of each module
        #[arg(long)]
        compiled: bool,
    },
    /// List the grammar modules in a directory
    List {
        /// Directory of `.yaml` grammar modules
        #[arg(default_value = ".")]
        dir: PathBuf,
    },
    /// Rebuild (or with --clean, delete) compiled module copies
    Compile {
        /// Directory of `.yaml` grammar modules
        #[arg(default_value = ".")]
        dir: PathBuf,

        /// Only delete compiled files
        #[arg(long)]
        clean: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Run {
            path,
            count,
            markov_start,
            markov_chainlen,
            seed,
            start,
            wrap,
            wrap_length,
            compiled,
        } => {
            if !markov_start.is_empty() && markov_start.chars().count() < markov_chainlen {
                Cli::command()
                    .error(
                        ErrorKind::ValueValidation,
                        format!(
                            "--markov-start must be at least as long as --markov-chainlen, currently {}.",
                            markov_chainlen
                        ),
                    )
                    .exit();
            }
            if !path.is_file() {
                Cli::command()
                    .error(
                        ErrorKind::ValueValidation,
                        format!("grammar file {} does not exist", path.display()),
                    )
                    .exit();
            }

            let (dir, name) = split_module_path(&path)?;
            let options = RunOptions {
                count,
                markov_start,
                markov_chainlen,
                seed,
                start,
                wrap: wrap.then_some(wrap_length),
            };
            if compiled {
                run(CompilingFileStorage::new(dir), &name, options)
            } else {
                run(FileStorage::new(dir), &name, options)
            }
        }
        Command::List { dir } => {
            for name in FileStorage::new(dir).list_modules()? {
                println!("{}", name);
            }
            Ok(())
        }
        Command::Compile { dir, clean } => {
            let storage = CompilingFileStorage::new(dir);
            if clean {
                let removed = storage.clean()?;
                println!("Removed {} compiled modules", removed);
            } else {
                for name in storage.recompile_modules()? {
                    println!("  Compiled: {}", storage.compiled_path(&name).display());
                }
            }
            Ok(())
        }
    }
}

struct RunOptions {
    count: usize,
    markov_start: String,
    markov_chainlen: usize,
    seed: Option<String>,
    start: String,
    wrap: Option<usize>,
}

fn run<S: Storage>(storage: S, name: &str, options: RunOptions) -> Result<()> {
    let renderer = StoryRenderer::builder(storage)
        .start(&options.start)
        .seed(Seed::from(options.seed))
        .markov_chainlen(options.markov_chainlen)
        .markov_start(&options.markov_start)
        .build()?;

    for n in 0..options.count {
        debug!(module = name, iteration = n, "consulting oracle");
        let story = renderer
            .render(name)
            .with_context(|| format!("failed to render grammar module {}", name))?;
        match options.wrap {
            None => println!("{}", story),
            Some(width) => {
                for line in story.lines() {
                    if line.trim().is_empty() {
                        println!("{}", line);
                    } else {
                        for wrapped in wrap_line(line, width) {
                            println!("{}", wrapped);
                        }
                    }
                }
            }
        }
        if n + 1 != options.count {
            println!("\n---\n");
        }
    }
    Ok(())
}

/// The directory holding `path` and the module name it names.
fn split_module_path(path: &Path) -> Result<(PathBuf, String)> {
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .with_context(|| format!("cannot derive a module name from {}", path.display()))?
        .to_string();
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((dir, name))
}

/// Greedy word wrap. Words longer than `width` are split.
fn wrap_line(line: &str, width: usize) -> Vec<String> {
    let width = width.max(1);
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for word in line.split_whitespace() {
        let mut word: Vec<char> = word.chars().collect();
        loop {
            let needed = if current_len == 0 { word.len() } else { current_len + 1 + word.len() };
            if needed <= width {
                if current_len > 0 {
                    current.push(' ');
                    current_len += 1;
                }
                current.extend(word.iter());
                current_len += word.len();
                break;
            }
            if current_len > 0 {
                lines.push(std::mem::take(&mut current));
                current_len = 0;
                continue;
            }
            let rest = word.split_off(width);
            lines.push(word.into_iter().collect());
            word = rest;
        }
    }
    if current_len > 0 {
        lines.push(current);
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_breaks_on_whitespace() {
        assert_eq!(
            wrap_line("the quick brown fox jumps", 10),
            vec!["the quick", "brown fox", "jumps"]
        );
    }

    #[test]
    fn wrap_splits_long_words() {
        assert_eq!(wrap_line("abcdefghij xy", 4), vec!["abcd", "efgh", "ij", "xy"]);
    }

    #[test]
    fn module_path_splits_into_dir_and_stem() {
        let (dir, name) = split_module_path(Path::new("grammars/names.yaml")).unwrap();
        assert_eq!(dir, PathBuf::from("grammars"));
        assert_eq!(name, "names");
        let (dir, _) = split_module_path(Path::new("names.yaml")).unwrap();
        assert_eq!(dir, PathBuf::from("."));
    }

    #[test]
    fn cli_parses_run_options() {
        let cli = Cli::try_parse_from(["presto", "--debug", "run", "g.yaml", "--count", "3", "--seed", "x"]).unwrap();
        assert!(cli.debug);
        match cli.command {
            Command::Run { count, seed, markov_chainlen, wrap_length, .. } => {
                assert_eq!(count, 3);
                assert_eq!(seed.as_deref(), Some("x"));
                assert_eq!(markov_chainlen, 2);
                assert_eq!(wrap_length, 78);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
