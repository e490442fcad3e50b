//! # sheetsense CLI
//!
//! ```bash
//! sheetsense                         # run the full pipeline
//! sheetsense run --force --limit 10  # re-analyze the first ten rows
//! sheetsense search "energy stocks with high dividends"
//! sheetsense serve                   # HTTP tool server
//! ```
//!
//! Configuration comes from the environment (`GEMINI_API_KEY`,
//! `GOOGLE_SHEETS_ID`, `GOOGLE_CREDENTIALS_PATH`, `GOOGLE_TOKEN_PATH`,
//! `CHROMA_DB_PATH`), optionally layered over a TOML file given with
//! `--config`.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use sheetsense::commands;
use sheetsense::config::{self, Config};
use sheetsense::pipeline::RunOptions;
use sheetsense::Error;

/// Analyze Google Sheets rows with Gemini and keep searchable embeddings.
#[derive(Parser)]
#[command(name = "sheetsense", version, about)]
struct Cli {
    /// Optional TOML config file. Environment variables override it.
    #[arg(long, global = true, env = "SHEETSENSE_CONFIG")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug). `RUST_LOG` wins when set.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch, analyze and store every row (the default).
    Run {
        /// Instruction sent with each row. Defaults to `analysis.instruction`.
        #[arg(long)]
        instruction: Option<String>,

        /// Re-analyze rows that are unchanged since the last run.
        #[arg(long)]
        force: bool,

        /// Process at most this many rows.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Fetch rows and print them without analysis.
    Fetch {
        #[arg(long)]
        limit: Option<usize>,
    },

    /// List the tabs of the spreadsheet.
    Sheets,

    /// Ask for an overall analysis of the sheet.
    Insights {
        #[arg(long)]
        prompt: Option<String>,
    },

    /// Semantic search over stored analyses.
    Search {
        query: String,

        #[arg(long, default_value = "5")]
        top_k: usize,
    },

    /// List stored analyses.
    List,

    /// Delete every stored analysis in the collection.
    Reset,

    /// Ask a question; the model may call the built-in tools.
    Chat { message: String },

    /// Start the HTTP tool server on `server.bind`.
    Serve,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "sheetsense=info",
        _ => "sheetsense=debug,tower_http=debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn dispatch(cfg: &Config, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Run {
            instruction,
            force,
            limit,
        } => {
            let options = RunOptions {
                instruction: instruction.unwrap_or_else(|| cfg.analysis.instruction.clone()),
                force,
                limit,
            };
            commands::run_pipeline(cfg, &options).await?;
        }
        Commands::Fetch { limit } => commands::run_fetch(cfg, limit).await?,
        Commands::Sheets => commands::run_sheets(cfg).await?,
        Commands::Insights { prompt } => commands::run_insights(cfg, prompt.as_deref()).await?,
        Commands::Search { query, top_k } => commands::run_search(cfg, &query, top_k).await?,
        Commands::List => commands::run_list(cfg).await?,
        Commands::Reset => commands::run_reset(cfg).await?,
        Commands::Chat { message } => commands::run_chat(cfg, &message).await?,
        Commands::Serve => commands::run_serve(cfg).await?,
    }
    Ok(())
}

fn report(err: &anyhow::Error) {
    match err.downcast_ref::<Error>() {
        Some(e) => eprintln!("error: {} stage failed: {}", e.stage(), e),
        None => eprintln!("error: {:#}", err),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Variables already set in the environment take precedence over `.env`.
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg = match config::load_config(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            report(&anyhow::Error::new(e));
            return ExitCode::FAILURE;
        }
    };

    let command = cli.command.unwrap_or(Commands::Run {
        instruction: None,
        force: false,
        limit: None,
    });

    match dispatch(&cfg, command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report(&e);
            ExitCode::FAILURE
        }
    }
}
