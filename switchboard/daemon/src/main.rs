//! Switchboard Daemon - Multi-source Prompt Routing
//!
//! Wires the source clients into one composite client, answers prompts with
//! a loopback engine, and keeps stream buffers swept. Prompts typed on stdin
//! are answered on stdout; logs go to stderr.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults
//! switchboard-daemon
//!
//! # With config file
//! switchboard-daemon --config /etc/switchboard/switchboard.toml
//!
//! # Verbose logging
//! RUST_LOG=debug switchboard-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGINT`: Graceful shutdown; pending prompts are released

mod engine;
mod monitor;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use switchboard_core::{
    load_config, load_config_from_path, CompositeClient, ConfigOverrides, HistoryStore,
    InMemoryHistoryStore, SenderId, SourceClient, StreamManager, StreamResumeCoordinator,
    SwitchboardConfig, TerminalSourceClient, UiHub, UiSourceClient,
};

use engine::LoopbackEngine;

/// Switchboard Daemon - routes prompts from every source to one engine
#[derive(Parser, Debug)]
#[command(name = "switchboard-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "SWITCHBOARD_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "SWITCHBOARD_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Capacity of the merged prompt channel
    #[arg(long, value_name = "N")]
    merge_capacity: Option<usize>,

    /// Capacity of each sink's response channel
    #[arg(long, value_name = "N")]
    sink_capacity: Option<usize>,

    /// Seconds an abandoned stream buffer is kept
    #[arg(long, value_name = "SECS")]
    orphan_grace_secs: Option<u64>,

    /// Agent answering terminal prompts
    #[arg(long, env = "SWITCHBOARD_AGENT", default_value = "loopback")]
    agent: String,

    /// Name terminal prompts are sent as
    #[arg(long, env = "USER", default_value = "local")]
    user: String,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(capacity) = self.merge_capacity {
            overrides = overrides.with_merge_capacity(capacity);
        }
        if let Some(capacity) = self.sink_capacity {
            overrides = overrides.with_sink_capacity(capacity);
        }
        if let Some(secs) = self.orphan_grace_secs {
            overrides = overrides.with_orphan_grace_secs(secs);
        }
        overrides
    }
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "switchboard_daemon={level},switchboard_core={level}"
        ))
    });

    // stdout belongs to the terminal client
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

fn resolve_config(args: &Args) -> Result<SwitchboardConfig> {
    let mut config = match &args.config {
        Some(path) => load_config_from_path(Some(path.clone())),
        None => load_config(),
    }
    .context("Failed to load configuration")?;

    args.overrides()
        .apply(&mut config)
        .context("Invalid command-line override")?;

    info!(
        source = %config.source(),
        path = ?config.config_file_path,
        "Configuration loaded"
    );
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!("Switchboard daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = resolve_config(&args)?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    let result = runtime.block_on(run(&args, &config));
    // A pending stdin read cannot be interrupted; don't wait on it
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

async fn run(args: &Args, config: &SwitchboardConfig) -> Result<()> {
    // Core wiring
    let hub = UiHub::new();
    let streams = Arc::new(StreamManager::with_notifier(
        config.stream_manager_config(),
        Arc::new(hub.clone()),
    ));
    let history: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::new());

    let ui = Arc::new(UiSourceClient::new(hub.clone(), config.merge_capacity));
    let terminal = Arc::new(TerminalSourceClient::new(
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        args.agent.clone(),
        SenderId::new(args.user.clone()),
    ));
    let clients: Vec<Arc<dyn SourceClient>> = vec![ui, terminal];
    let composite = Arc::new(CompositeClient::new(
        clients,
        Arc::clone(&streams),
        config.composite_config(),
    ));

    let root = CancellationToken::new();

    // Background tasks
    let sweeper = streams.spawn_orphan_sweeper(root.child_token());
    let coordinator = Arc::new(StreamResumeCoordinator::new(
        Arc::clone(&streams),
        Arc::clone(&history),
        config.resume_config(),
    ));
    let monitor = monitor::spawn_monitor(&hub, coordinator, config.sink_capacity, root.child_token());

    let (updates_tx, updates_rx) = mpsc::channel(config.sink_capacity);
    let processing = {
        let composite = Arc::clone(&composite);
        let cancel = root.child_token();
        tokio::spawn(async move {
            composite
                .process_response_stream(ReceiverStream::new(updates_rx).boxed(), cancel)
                .await
        })
    };

    let mut prompts = composite
        .read_prompts(Duration::from_millis(100), root.child_token())
        .await
        .context("Failed to start prompt ingestion")?;
    let engine = LoopbackEngine::new(Arc::clone(&composite), history, updates_tx);

    info!(clients = composite.client_count(), "Switchboard ready");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            signal = &mut shutdown => {
                if let Err(error) = signal {
                    error!(%error, "Failed to listen for shutdown signal");
                }
                info!("Received SIGINT, initiating shutdown");
                root.cancel();
                break;
            }
            next = prompts.next() => match next {
                Some(Ok(prompt)) => {
                    if let Err(error) = engine.handle(prompt, root.child_token()).await {
                        error!(error = %format!("{error:#}"), "Failed to answer prompt");
                    }
                }
                Some(Err(error)) => warn!(%error, "Prompt source error"),
                None => {
                    info!("All prompt sources closed");
                    break;
                }
            },
        }
    }

    // Dropping the engine closes the response channel so sinks drain
    drop(engine);
    let result = processing.await.context("Response task panicked")?;
    root.cancel();

    if let Err(error) = sweeper.await {
        warn!(%error, "Orphan sweeper panicked");
    }
    if let Err(error) = monitor.await {
        warn!(%error, "Viewer monitor panicked");
    }

    match result {
        Ok(()) => {
            info!("Switchboard daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e.into())
        }
    }
}
