//! keel Scheduler
//!
//! Runs the scheduler for one service. Inbound events and operator
//! commands arrive as JSON lines on stdin; accepts and declines leave as
//! JSON lines on stdout. Logs go to stderr.
//!
//! ## Configuration
//!
//! - `KEEL_SERVICE_SPEC`: Path to the JSON service spec
//! - `KEEL_DATA_DIR`: Directory holding the state database
//! - `KEEL_ROLE`, `KEEL_PRINCIPAL`: Reservation identity
//! - `KEEL_CAP_*`: Cluster capability flags

use std::sync::Arc;

use anyhow::{Context, Result};
use keel_events::InboundEvent;
use keel_scheduler::config::Config;
use keel_scheduler::{
    Command, Evaluator, JsonLinesTransport, Scheduler, SchedulerWorker, ServiceSpec, StateStore,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .init();

    info!("Starting keel scheduler");

    let mut spec = ServiceSpec::load(&config.service_spec)
        .with_context(|| format!("loading service spec {}", config.service_spec))?;
    if let Some(name) = &config.service_name {
        spec.name = name.clone();
    }
    let role = config.role_for(&spec.name);
    let principal = config.principal_for(&spec.name);
    info!(
        service = %spec.name,
        role = %role,
        principal = %principal,
        data_dir = %config.data_dir,
        "Configuration loaded"
    );

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir))?;
    let store = StateStore::open(config.state_path())?;
    let evaluator = Evaluator::new(&spec.name, role, principal).with_capabilities(config.capabilities);
    let scheduler = Scheduler::new(spec, evaluator, store)?;

    let (event_tx, event_rx) = mpsc::channel(64);
    let (command_tx, command_rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reader_handle = tokio::spawn(read_input(event_tx, command_tx));
    let mut worker_handle = tokio::spawn(
        SchedulerWorker::new(scheduler, Arc::new(JsonLinesTransport::stdout()))
            .run(event_rx, command_rx, shutdown_rx),
    );

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            let _ = shutdown_tx.send(true);
            if let Err(e) = (&mut worker_handle).await {
                error!(error = %e, "Scheduler worker panicked");
            }
        }
        result = &mut worker_handle => {
            match result {
                Ok(scheduler) => {
                    if scheduler.is_uninstalled().unwrap_or(false) {
                        info!("Uninstall complete");
                    }
                }
                Err(e) => error!(error = %e, "Scheduler worker panicked"),
            }
        }
    }

    reader_handle.abort();
    info!("Scheduler shutdown complete");
    Ok(())
}

/// Read JSON lines from stdin. Lines with a `command` field are operator
/// commands; everything else is an inbound event.
async fn read_input(events: mpsc::Sender<InboundEvent>, commands: mpsc::Sender<Command>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("Input closed");
                return;
            }
            Err(e) => {
                error!(error = %e, "Failed to read input");
                return;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let is_command = serde_json::from_str::<serde_json::Value>(line)
            .map(|value| value.get("command").is_some())
            .unwrap_or(false);
        let sent = if is_command {
            match serde_json::from_str::<Command>(line) {
                Ok(command) => commands.send(command).await.is_ok(),
                Err(e) => {
                    warn!(error = %e, "Ignoring malformed command");
                    true
                }
            }
        } else {
            match InboundEvent::from_json(line) {
                Ok(event) => events.send(event).await.is_ok(),
                Err(e) => {
                    warn!(error = %e, "Ignoring malformed event");
                    true
                }
            }
        };
        if !sent {
            return;
        }
    }
}
