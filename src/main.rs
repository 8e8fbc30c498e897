use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use mod_translator::config::{init_default_config, load_config, locate_config};
use mod_translator::session::Session;
use mod_translator::terminology::{TermEntry, DEFAULT_DOMAIN};
use mod_translator::unit_log;

#[derive(Parser, Debug)]
#[command(name = "mod-translator")]
#[command(
    about = "Translation memory and resumable translation state for game mods",
    long_about = None
)]
struct Args {
    /// Config file path (default: search for mod-translator.toml upwards)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a default config and prompt files
    Init {
        /// Target directory (default: current directory)
        #[arg(long, value_name = "DIR")]
        dir: Option<PathBuf>,
        /// Overwrite existing files
        #[arg(long)]
        force: bool,
    },
    /// Show per-file progress
    Status,
    /// Discard progress of one file, or of every file
    Reset {
        #[arg(value_name = "FILE")]
        file: Option<String>,
    },
    /// Import every *.jsonl unit log below DIR into the translation memory
    Import {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
        /// Skip the semantic tier
        #[arg(long)]
        no_vector: bool,
    },
    /// Rebuild the semantic tier from the exact tier
    Sync,
    /// Translation memory counts
    Stats,
    /// Terminology dictionary
    #[command(subcommand)]
    Terms(TermsCommand),
}

#[derive(Subcommand, Debug)]
enum TermsCommand {
    List {
        /// Substring of term or translation
        #[arg(long)]
        search: Option<String>,
        #[arg(long)]
        domain: Option<String>,
    },
    Add {
        term: String,
        translation: String,
        #[arg(long, default_value = DEFAULT_DOMAIN)]
        domain: String,
        #[arg(long, default_value = "")]
        notes: String,
    },
    Delete {
        term: String,
    },
    Import {
        #[arg(value_name = "JSON")]
        path: PathBuf,
    },
    Export {
        #[arg(value_name = "JSON")]
        path: PathBuf,
    },
    /// Frequent phrases of the translated files missing from the dictionary
    Suggest {
        #[arg(long, default_value_t = 3)]
        min_frequency: usize,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = args.config;
    let open = || open_session(config.clone());

    match args.command {
        Command::Init { dir, force } => {
            let dir = dir
                .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
            let cfg_path = init_default_config(&dir, force).context("init default config")?;
            eprintln!("Wrote config: {}", cfg_path.display());
        }
        Command::Status => {
            let session = open()?;
            let snap = session.tracker().snapshot();
            println!(
                "{}: {} ({}/{} files completed)",
                session.name(),
                snap.status.as_str(),
                snap.completed_files,
                snap.total_files
            );
            for f in &snap.files {
                println!(
                    "  {:<12} {:>6}/{:<6} {:5.1}%  {}",
                    f.state().as_str(),
                    f.translated_count,
                    f.total_count,
                    f.percentage(),
                    f.file_path
                );
            }
        }
        Command::Reset { file } => {
            open()?
                .tracker()
                .reset_progress(file.as_deref())
                .context("reset progress")?;
            eprintln!("Progress reset: {}", file.as_deref().unwrap_or("all files"));
        }
        Command::Import { dir, no_vector } => {
            let report = open()?
                .memory()
                .import_unit_logs(&dir, !no_vector)
                .with_context(|| format!("import unit logs: {}", dir.display()))?;
            println!(
                "files: {}  success: {}  failed: {}",
                report.files, report.outcome.success, report.outcome.failed
            );
            for e in report.outcome.errors.iter().take(20) {
                eprintln!("  {e}");
            }
        }
        Command::Sync => {
            let report = open()?.memory().sync_all().context("sync semantic tier")?;
            println!("synced: {}  failed: {}", report.synced, report.failed);
        }
        Command::Stats => {
            let stats = open()?.memory().stats().context("memory stats")?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Terms(cmd) => run_terms(&open()?, cmd)?,
    }
    Ok(())
}

fn open_session(explicit: Option<PathBuf>) -> anyhow::Result<Session> {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let cfg_path = locate_config(explicit, &cwd)?;
    let loaded = load_config(&cfg_path)?;
    Session::open(&loaded)
}

fn run_terms(session: &Session, cmd: TermsCommand) -> anyhow::Result<()> {
    let terms = session.terminology();
    match cmd {
        TermsCommand::List { search, domain } => {
            let entries = terms
                .store()
                .list(search.as_deref(), domain.as_deref())
                .context("list terms")?;
            for e in &entries {
                println!("{} => {} [{}] {}", e.term, e.translation, e.domain, e.notes);
            }
            eprintln!("{} terms", entries.len());
        }
        TermsCommand::Add {
            term,
            translation,
            domain,
            notes,
        } => {
            let mut entry = TermEntry::new(term, translation);
            entry.domain = domain;
            entry.notes = notes;
            terms.add(&entry).context("add term")?;
        }
        TermsCommand::Delete { term } => {
            if !terms.delete(&term).context("delete term")? {
                eprintln!("No such term: {term}");
            }
        }
        TermsCommand::Import { path } => {
            let (ok, failed) = terms
                .import_json(&path)
                .with_context(|| format!("import terms: {}", path.display()))?;
            println!("imported: {ok}  failed: {failed}");
        }
        TermsCommand::Export { path } => {
            let n = terms
                .export_json(&path)
                .with_context(|| format!("export terms: {}", path.display()))?;
            println!("exported: {n}");
        }
        TermsCommand::Suggest { min_frequency } => {
            let workspace = session.workspace();
            let mut texts = Vec::new();
            for spec in session.files() {
                let units = unit_log::read_units(&workspace.unit_log(&spec.path))
                    .with_context(|| format!("read unit log: {}", spec.path))?;
                texts.extend(units.into_iter().map(|u| u.original_text));
            }
            let suggestions = terms
                .suggest_terms(texts.iter().map(String::as_str), min_frequency)
                .context("suggest terms")?;
            for s in suggestions {
                println!("{:>5}  {}", s.frequency, s.text);
            }
        }
    }
    Ok(())
}
