use std::sync::mpsc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use reposync::config;
use reposync::credentials::token::fingerprint;
use reposync::forge::rate_limit::{RateLimitReport, DEFAULT_LOW_QUOTA_PERCENT};
use reposync::status::rate_limit_message;
use reposync::sync::{CacheState, UpdateCallback};
use reposync::{Engine, FileEntry, RepoRef, SyncError};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "reposync", about = "Forge repository content sync and cache")]
struct Cli {
    /// Path to the YAML configuration file.  Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<String>,

    /// Print Prometheus metrics to stderr after the command.
    #[arg(long)]
    metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List markdown files on a branch.
    List {
        owner: String,
        repo: String,
        #[arg(short, long, default_value = "main")]
        branch: String,
        /// When the cached listing is stale, wait for the background refresh
        /// and print its result too.
        #[arg(long)]
        wait: bool,
    },
    /// Print one file, following gist pointers.
    Read {
        owner: String,
        repo: String,
        path: String,
        #[arg(short, long, default_value = "main")]
        branch: String,
    },
    /// List branches of a repository.
    Branches { owner: String, repo: String },
    /// Print the content of a gist.
    Gist { url: String },
    /// Query the upstream API quota and warn when it is running low.
    RateLimit {
        /// Warn when more than this percentage of the quota is used.
        #[arg(long, default_value_t = DEFAULT_LOW_QUOTA_PERCENT)]
        threshold: f64,
    },
    /// Manage the stored access token.
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },
    /// Inspect or clear the local cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand, Debug)]
enum TokenAction {
    Set { token: String },
    Clear,
    Status,
}

#[derive(Subcommand, Debug)]
enum CacheAction {
    Stats,
    Clear,
}

#[derive(Serialize)]
struct ListingOutput<'a> {
    state: CacheState,
    files: &'a [FileEntry],
}

#[derive(Serialize)]
struct QuotaOutput {
    #[serde(flatten)]
    report: RateLimitReport,
    low: bool,
}

#[derive(Serialize)]
struct TokenStatus {
    authenticated: bool,
    fingerprint: Option<String>,
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn run(engine: &Engine, command: Command) -> Result<()> {
    match command {
        Command::List {
            owner,
            repo,
            branch,
            wait,
        } => {
            let repo = RepoRef::new(owner, repo, branch);
            let (tx, rx) = mpsc::channel();
            let on_update: UpdateCallback = Box::new(move |files| {
                let _ = tx.send(files);
            });

            let loaded = engine
                .sync
                .load_files(&repo, Some(on_update))
                .await
                .map_err(|e| describe(engine, e))?;
            print_json(&ListingOutput {
                state: loaded.state,
                files: &loaded.files,
            })?;

            // Let a started refresh land in the cache before exiting.
            if let Some(handle) = loaded.revalidation {
                handle.await.context("background refresh panicked")?;
            }
            if wait {
                if let Ok(files) = rx.try_recv() {
                    print_json(&ListingOutput {
                        state: CacheState::Fetched,
                        files: &files,
                    })?;
                }
            }
        }
        Command::Read {
            owner,
            repo,
            path,
            branch,
        } => {
            let repo = RepoRef::new(owner, repo, branch);
            let text = engine
                .sync
                .read_file(&repo, &path)
                .await
                .map_err(|e| describe(engine, e))?;
            println!("{text}");
        }
        Command::Branches { owner, repo } => {
            let branches = engine
                .sync
                .load_branches(&owner, &repo)
                .await
                .map_err(|e| describe(engine, e))?;
            print_json(&branches)?;
        }
        Command::Gist { url } => {
            let text = engine
                .sync
                .read_gist(&url)
                .await
                .map_err(|e| describe(engine, e))?;
            println!("{text}");
        }
        Command::RateLimit { threshold } => {
            let report = engine
                .github
                .check_rate_limit()
                .await
                .map_err(|e| describe(engine, e))?;
            let low = report.warn_if_low(threshold);
            print_json(&QuotaOutput { report, low })?;
        }
        Command::Token { action } => match action {
            TokenAction::Set { token } => {
                engine.tokens.store_token(&token)?;
                tracing::info!(token = %fingerprint(token.trim()), "access token stored");
            }
            TokenAction::Clear => engine.tokens.purge(),
            TokenAction::Status => {
                let token = engine.tokens.resolve_token();
                print_json(&TokenStatus {
                    authenticated: token.is_some(),
                    fingerprint: token.as_deref().map(fingerprint),
                })?;
            }
        },
        Command::Cache { action } => match action {
            CacheAction::Stats => print_json(&engine.sync.stats())?,
            CacheAction::Clear => {
                engine.sync.clear_all();
                tracing::info!("cache cleared");
            }
        },
    }
    Ok(())
}

/// Rate-limit failures become the countdown message; everything else is
/// passed through.
fn describe(engine: &Engine, err: SyncError) -> anyhow::Error {
    match err.reset_epoch_millis() {
        Some(reset) => {
            let now = engine.context.now_millis();
            let retry_after = Duration::from_millis(reset.saturating_sub(now).max(0) as u64);
            anyhow!(rate_limit_message(retry_after))
        }
        None => anyhow::Error::new(err),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("failed to serialise output")?;
    println!("{json}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => config::parse_config("")?,
    };

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    tracing::debug!(config_path = ?cli.config, "starting reposync");

    // ---- Engine ----
    let engine = Engine::from_config(config)?;

    let result = run(&engine, cli.command).await;

    if cli.metrics {
        eprintln!("{}", engine.context.metrics.encode()?);
    }
    result
}
