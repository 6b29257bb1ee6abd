//! # Diagram Collab CLI
//!
//! Joins a collaboration session, mirrors the diagram locally and logs
//! everything that happens on the connection until interrupted.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use diagram_collab::{
    apply_remote_operations, session_url, CollabConfig, ConnectionEvent, ConnectionManager,
    DiagramApiClient, DomainMessage, HistoryEngine, PersistenceArbitrator, PersistenceTarget,
    PushStrategy, RestStrategy, SharedGraph, StaticTokenProvider, TeardownPolicy, TokenProvider,
};

/// Command-line arguments.
#[derive(Debug, Clone, Parser)]
#[command(name = "diagram-collab")]
#[command(about = "Join a real-time diagram collaboration session")]
#[command(version)]
struct CliArgs {
    /// Collaboration server base URL (http(s) or ws(s))
    #[arg(long, env = "COLLAB_SERVER_URL")]
    server: String,

    /// Diagram to join
    #[arg(long, env = "COLLAB_DIAGRAM_ID")]
    diagram: String,

    /// Threat model owning the diagram (needed for REST load/save)
    #[arg(long, env = "COLLAB_THREAT_MODEL_ID")]
    threat_model: Option<String>,

    /// REST API base URL; overrides COLLAB_API_URL
    #[arg(long)]
    api_url: Option<String>,

    /// Bearer token for the WebSocket and REST API
    #[arg(long, env = "COLLAB_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Debounce window for batched saves, in milliseconds
    #[arg(long)]
    debounce_ms: Option<u64>,

    /// Do not reconnect after the connection drops
    #[arg(long)]
    no_reconnect: bool,
}

/// Initialize structured tracing with optional JSON format.
///
/// Set `RUST_LOG` to control log levels (default: info,diagram_collab=debug).
/// Set `RUST_LOG_FORMAT=json` for JSON output.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,diagram_collab=debug"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    if std::env::var("RUST_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer.json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .init();
    }
}

fn build_config(args: &CliArgs) -> CollabConfig {
    let mut config = CollabConfig::from_env();
    if let Some(api_url) = &args.api_url {
        config.api.base_url = Some(api_url.clone());
    }
    if let Some(debounce_ms) = args.debounce_ms {
        config.batching.debounce_ms = debounce_ms;
    }
    if args.no_reconnect {
        config.connection.reconnect.enabled = false;
    }
    config
}

fn log_connection_event(event: &ConnectionEvent) {
    match event {
        ConnectionEvent::StateChanged { from, to } => {
            tracing::info!(%from, %to, "Connection state changed");
        }
        ConnectionEvent::ReconnectScheduled { attempt, delay } => {
            tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
        }
        ConnectionEvent::Error(err) => {
            tracing::warn!(
                error = %err.error,
                retryable = err.retryable,
                severity = ?err.severity,
                "Connection error"
            );
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args = CliArgs::parse();
    let config = build_config(&args);
    tracing::debug!(?config, "Loaded configuration");

    let token_provider: Option<Arc<dyn TokenProvider>> = args
        .token
        .clone()
        .map(|t| Arc::new(StaticTokenProvider::new(t)) as Arc<dyn TokenProvider>);

    let graph = SharedGraph::new();
    let rest = match &config.api.base_url {
        Some(base) => Some(Arc::new(RestStrategy::new(
            DiagramApiClient::new(base, config.api.request_timeout(), token_provider.clone())
                .context("failed to create REST API client")?,
        ))),
        None => None,
    };

    let connection = ConnectionManager::websocket(config.connection.clone(), token_provider);
    let history = HistoryEngine::new(Arc::new(graph.clone()), config.max_history);

    let target = PersistenceTarget {
        threat_model_id: args.threat_model.clone(),
        diagram_id: args.diagram.clone(),
    };
    let arbitrator = rest.map(|rest| {
        Arc::new(PersistenceArbitrator::new(
            Arc::new(PushStrategy::new(connection.clone())),
            rest,
            Arc::new(graph.clone()),
            target.clone(),
            config.batching.clone(),
        ))
    });

    if let Some(arbitrator) = &arbitrator {
        if target.threat_model_id.is_some() {
            let document = arbitrator
                .load()
                .await
                .context("failed to load diagram")?;
            tracing::info!(
                name = %document.name,
                cells = document.cells.len(),
                update_vector = document.update_vector,
                "Loaded diagram"
            );
            graph.replace(document.cells);
        }
    }
    let arbitrator_handle = arbitrator.map(|a| a.spawn(history.subscribe()));

    let mut events = connection.subscribe_events();
    let mut domain = connection.subscribe_domain();

    let url = session_url(&args.server, &args.diagram)?;
    tracing::info!(%url, "Joining collaboration session");
    if let Err(err) = connection.connect(url.as_str()).await {
        if !err.is_retryable() || !config.connection.reconnect.enabled {
            return Err(err).context("failed to connect");
        }
        tracing::warn!(error = %err, "Initial connection failed; retrying in the background");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted; leaving session");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => log_connection_event(&event),
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "Missed connection events"),
                Err(RecvError::Closed) => break,
            },
            message = domain.recv() => match message {
                Ok(DomainMessage::DiagramOperation { operation_id, operation, initiating_user, .. }) => {
                    let user = initiating_user.map(|u| u.user_id).unwrap_or_default();
                    match apply_remote_operations(&graph, &operation_id, &operation.cells).await {
                        Ok(result) => tracing::info!(
                            %operation_id,
                            %user,
                            affected = result.affected_ids.len(),
                            cells = graph.len(),
                            "Applied remote operation"
                        ),
                        Err(err) => tracing::warn!(%operation_id, error = %err, "Remote operation rejected locally"),
                    }
                }
                Ok(DomainMessage::ResyncResponse { .. }) | Ok(DomainMessage::StateCorrection { .. }) => {
                    tracing::info!("Server requested a resync");
                }
                Ok(other) => tracing::debug!(message_type = other.message_type(), "Domain message"),
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "Missed domain messages"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    if let Some(handle) = arbitrator_handle {
        handle.shutdown(TeardownPolicy::Flush).await;
    }
    connection.disconnect();
    Ok(())
}
