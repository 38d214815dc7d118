//! Connection handlers for Courier server.
//!
//! Every accepted connection, whatever its transport, is handed to a
//! [`Session`]. The admin endpoint reports health and routing statistics.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{bail, Result};
use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use courier_core::{
    Cluster, GroupManager, MemoryStore, Router as CourierRouter, Session, SessionContext,
};
use courier_transport::{
    Connection, TcpConfig, TcpTransport, Transport, WebSocketConfig, WebSocketTransport,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Local sessions and remote peers.
    pub router: Arc<CourierRouter>,
    /// Users announced by this node.
    pub cluster: Arc<Cluster>,
    /// Offline message queues.
    pub store: Arc<MemoryStore>,
    /// Group directory.
    pub groups: Arc<GroupManager>,
    /// One permit per open connection.
    connections: Arc<Semaphore>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state, creating the configured groups.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let groups = GroupManager::new();
        for group in &config.groups {
            groups.create_group(group.id, group.members.iter().copied());
        }

        Self {
            router: Arc::new(CourierRouter::new()),
            cluster: Arc::new(Cluster::new(config.node_id.clone())),
            store: Arc::new(MemoryStore::new()),
            groups: Arc::new(groups),
            connections: Arc::new(Semaphore::new(config.limits.max_connections)),
            config,
        }
    }

    /// Collaborators for a new session.
    #[must_use]
    pub fn session_context(&self) -> SessionContext {
        SessionContext::new(
            self.router.clone(),
            self.cluster.clone(),
            self.store.clone(),
            self.groups.clone(),
        )
        .with_config(self.config.session_config())
    }

    /// Number of connections currently holding a slot.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.config
            .limits
            .max_connections
            .saturating_sub(self.connections.available_permits())
    }

    /// Snapshot for the admin endpoint.
    #[must_use]
    pub fn stats(&self) -> ServerStats {
        let router = self.router.stats();
        ServerStats {
            node_id: self.cluster.node_id().to_string(),
            online_users: router.online_users,
            remote_users: router.remote_users,
            active_connections: self.active_connections(),
            pending_offline_messages: self.store.total_pending(),
        }
    }
}

/// Body of `GET /stats`.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStats {
    /// This node's cluster identifier.
    pub node_id: String,
    /// Users with a session on this node.
    pub online_users: usize,
    /// Users known to be connected to other nodes.
    pub remote_users: usize,
    /// Open connections, authenticated or not.
    pub active_connections: usize,
    /// Messages waiting in offline queues, across all users.
    pub pending_offline_messages: usize,
}

/// Run the listeners until Ctrl-C.
///
/// # Errors
///
/// Returns an error if a listener fails to bind or none is enabled.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let mut tasks = JoinSet::new();

    if config.transport.tcp {
        let transport = TcpTransport::new(TcpConfig {
            bind_addr: config.bind_addr()?,
            max_message_size: config.limits.max_message_size,
            nodelay: true,
        })
        .await?;
        tasks.spawn(accept_loop(transport, Arc::clone(&state)));
    }

    if config.transport.websocket {
        let transport = WebSocketTransport::new(WebSocketConfig {
            bind_addr: config.websocket_addr()?,
            max_message_size: config.limits.max_message_size,
            ..WebSocketConfig::default()
        })
        .await?;
        tasks.spawn(accept_loop(transport, Arc::clone(&state)));
    }

    if tasks.is_empty() {
        bail!("No transport enabled");
    }

    if config.admin.enabled {
        let addr = config.admin_addr()?;
        let listener = TcpListener::bind(addr).await?;
        let app = admin_router(Arc::clone(&state));

        info!("Admin endpoint: http://{}", addr);

        tasks.spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("Admin server failed: {}", e);
            }
        });
    }

    info!(
        "Courier node {} accepting up to {} connections",
        config.node_id, config.limits.max_connections
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    tasks.shutdown().await;

    Ok(())
}

/// Accept connections from `transport` forever.
pub async fn accept_loop<T: Transport + 'static>(transport: T, state: Arc<AppState>) {
    loop {
        match transport.accept().await {
            Ok(connection) => handle_connection(connection, &state).await,
            Err(e) => {
                warn!(transport = transport.name(), error = %e, "Accept failed");
                metrics::record_error(transport.name());
            }
        }
    }
}

/// Start a session for `connection`, or close it if the server is full.
async fn handle_connection(mut connection: Connection, state: &Arc<AppState>) {
    let Ok(permit) = Arc::clone(&state.connections).try_acquire_owned() else {
        warn!(
            connection = %connection.id,
            remote = ?connection.remote_addr,
            "Connection limit reached, closing"
        );
        metrics::record_rejected();
        if let Err(e) = connection.writer.close().await {
            debug!(connection = %connection.id, error = %e, "Close failed");
        }
        return;
    };

    let ctx = state.session_context();
    tokio::spawn(async move {
        let _permit = permit;
        let _metrics_guard = ConnectionMetricsGuard::new();

        Session::new(ctx, connection).run().await;
        metrics::record_session_closed();
    });
}

/// Routes of the admin endpoint.
pub fn admin_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Routing statistics handler.
async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<ServerStats> {
    Json(state.stats())
}
