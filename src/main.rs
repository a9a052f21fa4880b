//! # Catalog Harvest CLI (`harvest`)
//!
//! The `harvest` binary drives the harvesting engine: full sessions,
//! match-count probes, entry point listing and credential management.
//!
//! ## Usage
//!
//! ```bash
//! harvest --config ./config/harvest.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `harvest run` | Harvest every entry point and write the JSON report |
//! | `harvest probe <entry>` | Print match counts for an entry point and its price bands |
//! | `harvest entries` | List configured entry points |
//! | `harvest credential show` | Show the current token's provenance and fingerprint |
//! | `harvest credential set <token>` | Store a manually supplied token |
//! | `harvest credential recover` | Capture a fresh token from the live site |
//!
//! ## Examples
//!
//! ```bash
//! # Full session, report to a file
//! harvest run --output out/catalog.json
//!
//! # Two entry points only, never crawl listing pages
//! harvest run --entry ACME --entry Globex --strategy primary
//!
//! # Stop after ten minutes and keep what was collected
//! harvest run --timeout 600 > catalog.json
//!
//! # How big is this entry point?
//! harvest probe ACME
//! ```

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use catalog_harvest::config::{self, Config};
use catalog_harvest::credential::{validate_token, CredentialStore};
use catalog_harvest::entries;
use catalog_harvest::export;
use catalog_harvest::models::{CredentialSet, HarvestStatus};
use catalog_harvest::orchestrator::{HarvestEngine, StrategyMode};
use catalog_harvest::pacing::Interrupt;
use catalog_harvest::progress::{format_number, ProgressMode};

/// Catalog Harvest CLI: collect every item of a storefront catalog from
/// its hosted search index, with token recovery and page-crawl fallback.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/harvest.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "harvest",
    about = "Catalog Harvest: ceiling-aware catalog harvesting from a hosted search index",
    version,
    long_about = "Catalog Harvest partitions each entry point's query until every partition fits \
    under the index's pagination ceiling, recovers an expired access token from live site traffic, \
    and falls back to crawling listing pages when the index cannot be used."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/harvest.toml`.
    #[arg(long, global = true, default_value = "./config/harvest.toml")]
    config: PathBuf,

    /// Debug-level logging.
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Progress output on stderr: `human`, `json` or `off`.
    ///
    /// Defaults to `human` when stderr is a terminal, otherwise `off`.
    #[arg(long, global = true)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Run a harvest session.
    ///
    /// Harvests every configured entry point (or those named with
    /// `--entry`), then writes the report as JSON to `--output` or stdout.
    /// Interrupting with Ctrl-C stops between requests and still writes
    /// everything collected so far.
    Run {
        /// Only harvest these entry points (repeatable).
        #[arg(long = "entry")]
        entries: Vec<String>,

        /// Write the JSON report here instead of stdout.
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Strategy: `auto` (primary, recovery, fallback), `primary` or `fallback`.
        #[arg(long, default_value = "auto")]
        strategy: StrategyMode,

        /// Session deadline in seconds. Overrides `harvest.session_timeout_secs`.
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Print match counts for an entry point and its first-level price bands.
    ///
    /// Fetches no items; useful for checking the credential and sizing
    /// a harvest before running it.
    Probe {
        /// Entry point name.
        entry: String,
    },

    /// List configured entry points.
    Entries,

    /// Manage the index access token.
    Credential {
        #[command(subcommand)]
        action: CredentialAction,
    },
}

/// Credential subcommands.
#[derive(Subcommand)]
enum CredentialAction {
    /// Show where the current token came from and its fingerprint.
    Show,

    /// Store a manually supplied token in the configured key file.
    Set {
        /// The token value.
        token: String,
    },

    /// Capture a fresh token with the headless browser and store it.
    Recover,
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "catalog_harvest=debug,harvest=debug"
    } else {
        "catalog_harvest=info,harvest=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted; stopping after the current request.");
            token.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Run {
            entries,
            output,
            strategy,
            timeout,
        } => {
            let progress = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);
            run_harvest(&cfg, &entries, output, strategy, timeout, progress).await?;
        }
        Commands::Probe { entry } => {
            run_probe(&cfg, &entry).await?;
        }
        Commands::Entries => {
            entries::list_entries(&cfg)?;
        }
        Commands::Credential { action } => match action {
            CredentialAction::Show => show_credential(&cfg)?,
            CredentialAction::Set { token } => set_credential(&cfg, &token)?,
            CredentialAction::Recover => recover_credential(&cfg).await?,
        },
    }

    Ok(())
}

async fn run_harvest(
    cfg: &Config,
    names: &[String],
    output: Option<PathBuf>,
    strategy: StrategyMode,
    timeout: Option<u64>,
    progress: ProgressMode,
) -> anyhow::Result<()> {
    let mut selected = cfg.entry_points();
    if !names.is_empty() {
        if let Some(unknown) = names.iter().find(|n| !selected.iter().any(|e| &e.name == *n)) {
            bail!("unknown entry point '{}'", unknown);
        }
        selected.retain(|e| names.contains(&e.name));
    }
    if selected.is_empty() {
        bail!("no entry points to harvest; add [[entries]] to the config file");
    }

    let engine = HarvestEngine::from_config(cfg)?;

    let token = CancellationToken::new();
    cancel_on_ctrl_c(token.clone());
    let mut interrupt = Interrupt::new(token);
    if let Some(secs) = timeout.or(cfg.harvest.session_timeout_secs) {
        interrupt = interrupt.with_timeout(Duration::from_secs(secs));
    }

    let reporter = progress.reporter();
    let report = engine
        .harvest(&selected, strategy, &interrupt, reporter.as_ref())
        .await;

    export::print_summary(&report);
    export::write_report(&report, output.as_deref())?;

    if report.status == HarvestStatus::Failed {
        bail!("harvest failed: no strategy produced any items");
    }
    Ok(())
}

async fn run_probe(cfg: &Config, name: &str) -> anyhow::Result<()> {
    let entry = cfg
        .entry_points()
        .into_iter()
        .find(|e| e.name == name)
        .with_context(|| format!("unknown entry point '{}'", name))?;

    let engine = HarvestEngine::from_config(cfg)?;
    let token = CancellationToken::new();
    cancel_on_ctrl_c(token.clone());
    let interrupt = Interrupt::new(token);

    let (total, bands) = engine.survey(&entry, &interrupt).await?;
    let ceiling = engine.settings().planner.pagination_ceiling;

    let show = |count: Option<u64>| match count {
        Some(n) if n > ceiling => format!("{}  (over ceiling)", format_number(n)),
        Some(n) => format_number(n),
        None => "lost".to_string(),
    };
    println!("{:<48} {}", "FILTER", "MATCHES");
    println!("{:<48} {}", engine.root_filter(&entry).describe(), show(total));
    for band in &bands {
        println!("{:<48} {}", band.filter.describe(), show(band.total));
    }
    Ok(())
}

fn show_credential(cfg: &Config) -> anyhow::Result<()> {
    let store = CredentialStore::load(cfg.index.token.as_deref(), cfg.index.key_file.as_deref())?;
    match store.current() {
        Some(credential) => {
            println!("method:      {:?}", credential.method);
            println!("acquired_at: {}", credential.acquired_at.to_rfc3339());
            println!("fingerprint: {}", credential.fingerprint());
        }
        None => println!("No credential configured."),
    }
    if let Some(path) = store.key_file() {
        println!("key_file:    {}", path.display());
    }
    Ok(())
}

fn set_credential(cfg: &Config, token: &str) -> anyhow::Result<()> {
    let token = token.trim();
    validate_token(token, cfg.recovery.min_token_length).context("Invalid token")?;
    let Some(key_file) = cfg.index.key_file.as_deref() else {
        bail!("index.key_file is not configured; nowhere to store the token");
    };

    let store = CredentialStore::load(None, Some(key_file))?;
    let credential = CredentialSet::manual(token);
    let fingerprint = credential.fingerprint();
    store.replace(credential)?;
    println!("Stored token {} in {}", fingerprint, key_file.display());
    Ok(())
}

async fn recover_credential(cfg: &Config) -> anyhow::Result<()> {
    if !cfg.recovery.enabled {
        bail!("recovery is disabled in the config file");
    }
    let engine = HarvestEngine::from_config(cfg)?;
    let token = CancellationToken::new();
    cancel_on_ctrl_c(token.clone());
    let interrupt = Interrupt::new(token);

    match engine.recover_credential(&interrupt).await? {
        Ok(()) => {
            let fingerprint = engine
                .credentials()
                .current()
                .map(|c| c.fingerprint())
                .unwrap_or_default();
            println!("Captured token {}", fingerprint);
            if engine.credentials().key_file().is_none() {
                println!("index.key_file is not configured; the token was not persisted.");
            }
            Ok(())
        }
        Err(failure) => bail!("recovery failed: {}", failure),
    }
}
