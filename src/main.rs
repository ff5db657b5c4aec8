//! converge - runs the reconciliation controller against the in-memory
//! external system

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use converge::adapter::kinds::sample_registry;
use converge::adapter::memory::MemoryExternalSystem;
use converge::config::ControllerConfig;
use converge::controller::Context;
use converge::events::TracingEventPublisher;
use converge::manifest::parse_manifest;
use converge::runner::Runner;
use converge::store::MemoryStore;
use converge::telemetry::{init_telemetry, LogFormat, TelemetryConfig};

/// Reconcile declared resources until interrupted
#[derive(Parser, Debug)]
#[command(name = "converge", version, about, long_about = None)]
struct Cli {
    /// Path to the controller configuration (YAML)
    #[arg(short = 'c', long = "config", env = "CONVERGE_CONFIG")]
    config_file: Option<PathBuf>,

    /// Path to a manifest of desired records (YAML list)
    #[arg(short = 'f', long = "manifest", env = "CONVERGE_MANIFEST")]
    manifest_file: Option<PathBuf>,

    /// Number of concurrent workers (overrides the config file)
    #[arg(long, env = "CONVERGE_WORKERS")]
    workers: Option<usize>,

    /// External call deadline in milliseconds (overrides the config file)
    #[arg(long, env = "CONVERGE_CALL_TIMEOUT_MS")]
    call_timeout_ms: Option<u64>,

    /// Log line format: json or pretty
    #[arg(long, env = "CONVERGE_LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let _telemetry = init_telemetry(TelemetryConfig {
        log_format: cli.log_format,
        ..Default::default()
    })
    .context("failed to initialize telemetry")?;

    let config = load_config(&cli)?;
    info!(workers = config.workers, "loaded controller configuration");

    let system = Arc::new(MemoryExternalSystem::new());
    let adapters = sample_registry(system);
    let store = Arc::new(MemoryStore::new());

    if let Some(path) = &cli.manifest_file {
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read manifest {}", path.display()))?;
        let records = parse_manifest(&yaml, &adapters)?;
        info!(count = records.len(), "loaded desired records");
        for record in records {
            store.insert(record);
        }
    } else {
        warn!("no manifest given, nothing to reconcile");
    }

    let ctx = Context::builder(store)
        .adapters(adapters)
        .events(Arc::new(TracingEventPublisher))
        .config(config)
        .build();
    let runner = Runner::new(Arc::new(ctx));

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received shutdown signal");
                signal.cancel();
            }
            Err(e) => warn!(error = %e, "failed to listen for Ctrl-C"),
        }
    });

    runner.run(shutdown).await?;
    info!("controller stopped");
    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<ControllerConfig> {
    let mut config = match &cli.config_file {
        Some(path) => ControllerConfig::from_file(path)?,
        None => ControllerConfig::default(),
    };
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if let Some(ms) = cli.call_timeout_ms {
        config.call_timeout = std::time::Duration::from_millis(ms);
    }
    config.validate()?;
    Ok(config)
}
