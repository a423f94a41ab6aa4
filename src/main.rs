use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use serde::Serialize;

use comic_translator_rust::pipeline::{self, ProcessOptions};
use comic_translator_rust::terminology::ExportFormat;
use comic_translator_rust::{Config, Settings};

#[derive(Parser, Debug)]
#[command(
    name = "comic-translator-rust",
    version,
    about = "Translate Japanese comic pages into Chinese with staged, resumable processing"
)]
struct Cli {
    /// Model name as provider:model (e.g. gemini:gemini-2.0-flash)
    #[arg(short = 'm', long = "model", global = true)]
    model: Option<String>,

    /// API key (overrides environment variables)
    #[arg(short = 'k', long = "key", global = true)]
    key: Option<String>,

    /// Read extra settings from a local TOML file
    #[arg(short = 'r', long = "read-settings", global = true)]
    read_settings: Option<String>,

    /// Enable verbose logging
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Translate one page
    Single {
        input: PathBuf,
        output: Option<PathBuf>,
        /// Ignore cached stages for this page
        #[arg(long = "force")]
        force: bool,
    },
    /// Translate every page in a folder, in file-name order
    Batch {
        input_dir: PathBuf,
        output_dir: Option<PathBuf>,
    },
    /// Manage the terminology store
    Terminology {
        #[command(subcommand)]
        action: TerminologyAction,
    },
    /// Inspect or reset cached stage results
    Progress {
        #[command(subcommand)]
        action: ProgressAction,
    },
}

#[derive(Subcommand, Debug)]
enum TerminologyAction {
    /// Merge a glossary file (json, csv or tab-separated txt)
    Import { file: PathBuf },
    /// Write the store to a file
    Export {
        file: PathBuf,
        /// json, csv or txt (default: from the file extension)
        #[arg(short = 'f', long = "format")]
        format: Option<ExportFormat>,
    },
    /// Show store statistics
    Stats,
}

#[derive(Subcommand, Debug)]
enum ProgressAction {
    /// Show which stages are cached for a page
    View { image: String },
    /// Delete cached stage results
    Clear {
        #[arg(long = "image")]
        image: Option<String>,
        #[arg(long = "all")]
        all: bool,
    },
    /// Run a page again, reusing every cached stage
    Resume {
        input: PathBuf,
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = comic_translator_rust::logging::init(cli.verbose) {
        eprintln!("error: {:#}", err);
        return ExitCode::FAILURE;
    }
    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

/// Returns whether the command fully succeeded.
async fn run(cli: Cli) -> Result<bool> {
    let config = Config {
        model: cli.model,
        key: cli.key,
        settings_path: cli.read_settings,
    };
    let settings = config.load_settings()?;
    match cli.command {
        Command::Single {
            input,
            output,
            force,
        } => translate_single(&settings, &config, &input, output.as_deref(), force).await,
        Command::Batch {
            input_dir,
            output_dir,
        } => {
            let mut pipeline = comic_translator_rust::build_pipeline(&settings, &config)?;
            let report = pipeline
                .process_folder(&input_dir, output_dir.as_deref())
                .await?;
            print_json(&report)?;
            Ok(report.all_succeeded())
        }
        Command::Terminology { action } => run_terminology(&settings, action),
        Command::Progress { action } => match action {
            ProgressAction::View { image } => {
                let cache = comic_translator_rust::open_cache(&settings)?;
                print_json(&pipeline::progress_for(&cache, &image))?;
                Ok(true)
            }
            ProgressAction::Clear { image, all } => {
                let scope = match (image, all) {
                    (Some(image), false) => Some(image),
                    (None, true) => None,
                    _ => return Err(anyhow!("use exactly one of --image <name> or --all")),
                };
                let cache = comic_translator_rust::open_cache(&settings)?;
                let cleared = pipeline::clear_cached(&cache, scope.as_deref());
                println!("cleared {} cached files", cleared);
                Ok(true)
            }
            ProgressAction::Resume { input, output } => {
                translate_single(&settings, &config, &input, output.as_deref(), false).await
            }
        },
    }
}

async fn translate_single(
    settings: &Settings,
    config: &Config,
    input: &Path,
    output: Option<&Path>,
    force: bool,
) -> Result<bool> {
    let mut pipeline = comic_translator_rust::build_pipeline(settings, config)?;
    let report = pipeline
        .process_image(input, output, ProcessOptions { force })
        .await;
    print_json(&report)?;
    Ok(report.is_complete())
}

fn run_terminology(settings: &Settings, action: TerminologyAction) -> Result<bool> {
    let mut store = comic_translator_rust::open_terminology(settings);
    match action {
        TerminologyAction::Import { file } => {
            let added = store.import(&file)?;
            println!("imported {} new terms ({} total)", added, store.len());
            Ok(true)
        }
        TerminologyAction::Export { file, format } => {
            let format = format
                .or_else(|| ExportFormat::from_path(&file))
                .unwrap_or(ExportFormat::Json);
            Ok(store.export(&file, format))
        }
        TerminologyAction::Stats => {
            print_json(&store.statistics())?;
            Ok(true)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
