//! recrawl CLI
//!
//! Thin process entry points over the library roles. Each role runs until
//! idle (or until Ctrl-C / SIGTERM in daemon mode) and flushes the queue on
//! exit.

use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use recrawl::{
    app::App,
    error::Result,
    models::{Config, RunConfig},
    pipeline::{RunReport, run_pool, shutdown_channel},
    queue::WorkQueue,
};
use tokio::signal;
use tokio::sync::watch;

/// recrawl - incremental listing re-crawler
#[derive(Parser, Debug)]
#[command(name = "recrawl", version, about = "Incremental listing re-crawl pipeline")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "recrawl.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// Run identifier used as the log prefix
    #[arg(long)]
    id: Option<String>,

    /// Number of concurrent loops in this process
    #[arg(long)]
    concurrency: Option<usize>,

    /// Keep polling until interrupted instead of exiting when idle
    #[arg(long)]
    daemon: bool,
}

impl RunArgs {
    fn apply(&self, run: &mut RunConfig) {
        if let Some(concurrency) = self.concurrency {
            run.concurrency = concurrency.max(1);
        }
        if self.daemon {
            run.daemon = true;
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one discovery pass and flag stale items
    Discover {
        #[arg(long)]
        id: Option<String>,
    },

    /// Fetch pending items and forward changes downstream
    Work(RunArgs),

    /// Re-check missing candidates
    Verify(RunArgs),

    /// Discover, then work and verify until idle
    Run,

    /// Print queue counters as JSON
    Stats,

    /// Validate the configuration file
    Validate,
}

/// Initialize logging based on verbosity flag.
fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

/// Resolve on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn load_config(path: &Path) -> Result<Config> {
    let mut config = if path.exists() {
        Config::load(path)?
    } else {
        log::warn!("Config {} not found, using defaults", path.display());
        Config::default()
    };
    config.apply_env();
    Ok(config)
}

fn report(role: &str, report: &RunReport) {
    log::info!(
        "{role} handled {} items ({} queue errors, {} failed)",
        report.handled,
        report.transport_errors,
        report.failed
    );
}

async fn work(app: &App, id: &str, shutdown: watch::Receiver<bool>) {
    let worker = app.worker();
    let run = &app.config.worker;
    let settings = app.loop_settings(run);
    let result = run_pool(&worker, id, run.concurrency, &settings, shutdown).await;
    report(id, &result);
}

async fn verify(app: &App, id: &str, shutdown: watch::Receiver<bool>) {
    let verifier = app.verifier();
    let run = &app.config.verifier;
    let settings = app.loop_settings(run);
    let result = run_pool(&verifier, id, run.concurrency, &settings, shutdown).await;
    report(id, &result);
}

async fn dispatch(app: &App, command: Command, shutdown: watch::Receiver<bool>) -> Result<()> {
    match command {
        Command::Discover { id } => {
            let id = id.unwrap_or_else(|| "coordinator".to_string());
            let pass = app.coordinator().run_pass(&id, shutdown).await?;
            if !pass.failed_partitions.is_empty() {
                log::warn!("{} partitions failed this pass", pass.failed_partitions.len());
            }
        }

        Command::Work(args) => {
            work(app, args.id.as_deref().unwrap_or("worker"), shutdown).await;
        }

        Command::Verify(args) => {
            verify(app, args.id.as_deref().unwrap_or("verifier"), shutdown).await;
        }

        Command::Run => {
            app.coordinator().run_pass("coordinator", shutdown.clone()).await?;
            tokio::join!(
                work(app, "worker", shutdown.clone()),
                verify(app, "verifier", shutdown)
            );
        }

        Command::Stats | Command::Validate => {}
    }
    Ok(())
}

/// Main entry point for the CLI application.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = load_config(&cli.config)?;

    if let Command::Validate = cli.command {
        log::info!("Validating configuration...");
        if let Err(e) = config.validate() {
            log::error!("Config validation failed: {}", e);
            return Err(e);
        }
        log::info!("✓ Config OK ({} partitions)", config.partitions.len());
        return Ok(());
    }

    match &cli.command {
        Command::Work(args) => args.apply(&mut config.worker),
        Command::Verify(args) => args.apply(&mut config.verifier),
        // `run` is a bounded batch job
        Command::Run => {
            config.worker.daemon = false;
            config.verifier.daemon = false;
        }
        _ => {}
    }

    let app = App::build(config).await?;

    if let Command::Stats = cli.command {
        let stats = app.queue.stats().await?;
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    let (tx, rx) = shutdown_channel();
    tokio::spawn(async move {
        shutdown_signal().await;
        log::info!("Shutdown signal received, finishing in-flight items");
        let _ = tx.send(true);
    });

    let result = dispatch(&app, cli.command, rx).await;
    app.close().await?;
    result
}
