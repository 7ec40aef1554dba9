//! logdrift Daemon - background log-following service
//!
//! Loads the YAML configuration, materializes one filter spec per follower
//! declaration, drains the backlog synchronously, then follows live until
//! interrupted. Extracted records are written to stdout as JSON lines;
//! swapping in a network shipper means swapping this binary's [`Handler`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use logdrift_core::config::Config;
use logdrift_core::domain::FilterSpec;
use logdrift_core::ports::Handler;
use logdrift_follow::{FilterManager, StateStore, WatchManager};

#[derive(Debug, Parser)]
#[command(name = "logdriftd", version, about = "Durable log-file follower")]
struct Cli {
    /// Use alternate config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Verbose output (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Drain the backlog and exit instead of following live
    #[arg(long)]
    catchup_only: bool,
}

/// Writes each record to stdout as one JSON object per line
struct StdoutHandler;

#[async_trait::async_trait]
impl Handler for StdoutHandler {
    async fn handle(
        &self,
        record: &[u8],
        timestamp: DateTime<Utc>,
        source: &Path,
    ) -> Result<()> {
        let line = serde_json::json!({
            "ts": timestamp.to_rfc3339(),
            "source": source.display().to_string(),
            "record": String::from_utf8_lossy(record),
        });
        println!("{line}");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;
    config.validate()?;

    // Setup tracing: CLI verbosity wins over the config level, and
    // RUST_LOG wins over both.
    let filter = match cli.verbose {
        0 => config.logging.level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(config = %config_path.display(), "logdriftd starting");

    let store = StateStore::open(&config.state.file)?;
    let filters = Arc::new(FilterManager::new(store, config.limits.max_followers));
    let watch = WatchManager::new(Arc::clone(&filters))?;

    let handler: Arc<dyn Handler> = Arc::new(StdoutHandler);
    for decl in &config.followers {
        let spec = FilterSpec::new(
            decl.name.clone(),
            decl.dir.clone(),
            &decl.patterns,
            decl.recursive,
            decl.engine_params(&decl.name)?,
            Arc::clone(&handler),
        )?;
        watch.add(spec).await?;
    }

    // Ctrl-C cancels the quit token; catch-up aborts between files and the
    // live loop drains what it already received.
    let quit = CancellationToken::new();
    {
        let quit = quit.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, shutting down");
                quit.cancel();
            }
        });
    }

    info!("Draining backlog");
    watch.catchup(&quit).await?;

    if cli.catchup_only {
        info!("Catch-up complete");
        if let Err(e) = watch.close().await {
            warn!(error = %e, "Error during shutdown");
        }
        return Ok(());
    }

    watch.start().await?;
    info!("Following live");

    quit.cancelled().await;

    if let Err(e) = watch.close().await {
        warn!(error = %e, "Error during shutdown");
    }
    info!("logdriftd stopped");
    Ok(())
}
