//! Chatflow — conversational flow engine and paced message scheduler.
//!
//! Development node: wires the in-memory stores and a recording transport,
//! loads flows and broadcasts from JSON, replays inbound traffic and runs
//! the delivery drain until shutdown.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chatflow_core::collaborators::{
    InMemoryAssets, InMemoryConversations, InMemoryLedger, InMemoryPhonebook, RecordingTransport,
};
use chatflow_core::config::{AppConfig, MetricsConfig};
use chatflow_core::event_bus::{EventSink, TracingSink};
use chatflow_core::flow::FlowDefinition;
use chatflow_core::memory::MemoryBackend;
use chatflow_core::payload::PayloadBuilder;
use chatflow_core::types::InboundMessage;
use chatflow_delivery::{BroadcastController, BroadcastRequest, DeliveryScheduler};
use chatflow_flows::FlowEngine;
use clap::Parser;
use serde::de::DeserializeOwned;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "chatflow")]
#[command(about = "Conversational flow engine and time-distributed message scheduler")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "CHATFLOW__NODE_ID")]
    node_id: Option<String>,

    /// Seconds between drain passes (overrides config)
    #[arg(long, env = "CHATFLOW__DELIVERY__DRAIN_INTERVAL_SECS")]
    drain_interval: Option<u64>,

    /// Prometheus exporter port; enables the exporter when set
    #[arg(long, env = "CHATFLOW__METRICS__PORT")]
    metrics_port: Option<u16>,

    /// JSON array of flow definitions to load at startup
    #[arg(long)]
    flows: Option<PathBuf>,

    /// JSON array of broadcast requests to start at startup
    #[arg(long)]
    broadcasts: Option<PathBuf>,

    /// JSON array of inbound messages to replay after loading
    #[arg(long)]
    inbound: Option<PathBuf>,

    /// Credits granted to every account seen in the loaded files
    #[arg(long, default_value_t = 10_000)]
    credits: u64,

    /// Run a single drain pass and exit
    #[arg(long, default_value_t = false)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chatflow=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Chatflow starting up");

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id.clone() {
        config.node_id = node_id;
    }
    if let Some(secs) = cli.drain_interval {
        config.delivery.drain_interval_secs = secs;
    }
    if let Some(port) = cli.metrics_port {
        config.metrics.enabled = true;
        config.metrics.port = port;
    }

    info!(
        node_id = %config.node_id,
        drain_interval_secs = config.delivery.drain_interval_secs,
        batch_size = config.delivery.drain_batch_size,
        utc_offset_minutes = config.delivery.utc_offset_minutes,
        "Configuration loaded"
    );

    if config.metrics.enabled {
        if let Err(e) = start_metrics(&config.metrics) {
            error!(error = %e, "Failed to start metrics exporter");
        }
    }

    let backend = MemoryBackend::new();
    let transport = Arc::new(RecordingTransport::new());
    let conversations = Arc::new(InMemoryConversations::new());
    let ledger = Arc::new(InMemoryLedger::new());
    let assets = Arc::new(InMemoryAssets::new());
    let phonebook = Arc::new(InMemoryPhonebook::new());
    let events: Arc<dyn EventSink> = Arc::new(TracingSink::new(config.node_id.clone()));

    let scheduler = Arc::new(
        DeliveryScheduler::new(
            backend.messages.clone(),
            backend.cursors.clone(),
            transport.clone(),
            conversations.clone(),
            ledger.clone(),
        )
        .with_config(&config.delivery)
        .with_event_sink(events.clone()),
    );
    let engine = FlowEngine::new(
        backend.flows.clone(),
        backend.cursors.clone(),
        scheduler.clone(),
        assets.clone(),
        phonebook.clone(),
    )?
    .with_config(&config)?
    .with_event_sink(events.clone());
    let broadcasts = BroadcastController::new(
        scheduler.clone(),
        backend.broadcasts.clone(),
        PayloadBuilder::new(assets),
        phonebook,
    )
    .with_config(&config.delivery)?
    .with_event_sink(events);

    if let Some(path) = &cli.flows {
        let flows: Vec<FlowDefinition> = read_json(path)?;
        for flow in flows {
            grant(&ledger, &flow.tenant.account_id, cli.credits);
            let name = flow.name.clone();
            match engine.create_flow(flow) {
                Ok(id) => info!(flow_id = %id, name = %name, "Flow loaded"),
                Err(e) => warn!(name = %name, error = %e, "Flow rejected"),
            }
        }
    }

    if let Some(path) = &cli.broadcasts {
        let requests: Vec<BroadcastRequest> = read_json(path)?;
        for request in requests {
            grant(&ledger, &request.tenant.account_id, cli.credits);
            let name = request.name.clone();
            match broadcasts.start(request) {
                Ok(b) => info!(
                    broadcast_id = %b.id,
                    name = %name,
                    messages = b.message_ids.len(),
                    "Broadcast started"
                ),
                Err(e) => warn!(name = %name, error = %e, "Broadcast rejected"),
            }
        }
    }

    if let Some(path) = &cli.inbound {
        let messages: Vec<InboundMessage> = read_json(path)?;
        for msg in &messages {
            grant(&ledger, &msg.tenant.account_id, cli.credits);
            match engine.handle_inbound(msg) {
                Ok(report) => info!(
                    sender = %msg.sender,
                    engaged = report.engaged.len(),
                    resumed = report.resumed.is_some(),
                    aborted = report.aborted.len(),
                    scheduled = report.scheduled,
                    "Inbound handled"
                ),
                Err(e) => error!(sender = %msg.sender, error = %e, "Inbound failed"),
            }
        }
    }

    if cli.once {
        drain(scheduler.clone()).await;
        info!(sent = transport.sent_count(), "Single drain pass finished");
        return Ok(());
    }

    info!("Chatflow is draining scheduled messages");

    let mut ticker =
        tokio::time::interval(Duration::from_secs(config.delivery.drain_interval_secs.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => drain(scheduler.clone()).await,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!(
        sent = transport.sent_count(),
        pending = backend.messages.len(),
        "Chatflow stopped"
    );
    Ok(())
}

async fn drain(scheduler: Arc<DeliveryScheduler>) {
    match tokio::task::spawn_blocking(move || scheduler.drain()).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => error!(error = %e, "Drain pass failed"),
        Err(e) => error!(error = %e, "Drain task panicked"),
    }
}

fn grant(ledger: &InMemoryLedger, account_id: &str, credits: u64) {
    if ledger.balance(account_id) == 0 {
        ledger.set_balance(account_id, credits);
    }
}

fn start_metrics(config: &MetricsConfig) -> anyhow::Result<()> {
    let addr = SocketAddr::new(config.host.parse()?, config.port);
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    info!(port = config.port, "Metrics exporter started");
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}
