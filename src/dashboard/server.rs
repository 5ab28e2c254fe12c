//! HTTP server implementation for the REST API.
//!
//! Builds the axum router over the orchestrator and runs it with graceful
//! shutdown and bind retry.

use axum::{
    Router,
    routing::{get, post},
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::handlers;
use crate::config::ServerConfig;
use crate::db::Database;
use crate::gateway::SharedGateway;
use crate::orchestrator::Orchestrator;

/// State shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// `None` when the gateway is disabled.
    pub gateway: Option<Arc<SharedGateway>>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, gateway: Option<Arc<SharedGateway>>) -> Self {
        Self {
            orchestrator,
            gateway,
        }
    }

    pub fn db(&self) -> &Arc<Database> {
        self.orchestrator.db()
    }
}

/// Build the API router.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(
            "/api/tasks",
            get(handlers::list_tasks).post(handlers::create_task),
        )
        .route(
            "/api/tasks/{id}",
            get(handlers::get_task)
                .patch(handlers::update_task)
                .delete(handlers::delete_task),
        )
        .route("/api/tasks/{id}/dispatch", post(handlers::dispatch_task))
        .route(
            "/api/tasks/{id}/planning",
            get(handlers::get_planning).post(handlers::post_planning),
        )
        .route("/api/tasks/{id}/sessions", get(handlers::task_sessions))
        .route(
            "/api/agents",
            get(handlers::list_agents).post(handlers::create_agent),
        )
        .route(
            "/api/agents/{id}",
            get(handlers::get_agent).patch(handlers::update_agent),
        )
        .route("/api/agents/{id}/status", get(handlers::agent_status))
        .route("/api/agents/{id}/assign", post(handlers::assign_agent))
        .route("/api/agents/{id}/sessions", get(handlers::agent_sessions))
        .route("/api/sessions/{id}", get(handlers::get_session))
        .route("/api/sessions/{id}/output", post(handlers::append_output))
        .route(
            "/api/sessions/{id}/complete",
            post(handlers::complete_session),
        )
        .route("/api/sessions/{id}/cancel", post(handlers::cancel_session))
        .route("/api/gateway", get(handlers::gateway_status))
        .route("/api/health", get(handlers::health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Status of the API server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    /// Serving requests.
    Running,
    /// Bind failed, retrying in background.
    Retrying,
    Stopped,
}

/// Handle for managing the server lifecycle.
pub struct ServerHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    status_rx: watch::Receiver<ServerStatus>,
}

impl ServerHandle {
    pub fn status(&self) -> ServerStatus {
        *self.status_rx.borrow()
    }

    /// Watch status changes.
    pub fn watch_status(&self) -> watch::Receiver<ServerStatus> {
        self.status_rx.clone()
    }

    /// Trigger shutdown of the server.
    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Start the HTTP server on `127.0.0.1:<port>`.
///
/// Returns a oneshot sender that can be used to signal shutdown,
/// and the actual address the server is bound to. Port 0 binds an
/// ephemeral port.
pub async fn start_server(
    state: AppState,
    port: u16,
) -> anyhow::Result<(oneshot::Sender<()>, SocketAddr)> {
    let app = build_router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    info!("API server listening on http://{}", bound_addr);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                info!("API server shutting down");
            })
            .await
        {
            tracing::error!("API server error: {}", e);
        }
    });

    Ok((shutdown_tx, bound_addr))
}

/// Jittered delay for retry, at least one second.
///
/// Uses system time nanoseconds for jitter.
fn compute_jittered_delay(base_ms: u64, jitter_ms: u64) -> Duration {
    use std::time::SystemTime;

    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);

    // Map nanos to range [-jitter_ms, +jitter_ms]
    let jitter_range = (jitter_ms * 2) as i64;
    let jitter = if jitter_range > 0 {
        (nanos as i64 % jitter_range) - (jitter_ms as i64)
    } else {
        0
    };

    let delay_ms = (base_ms as i64 + jitter).max(1000) as u64;
    Duration::from_millis(delay_ms)
}

/// Next backoff interval, capped at `max_ms`.
fn next_retry_ms(current_ms: u64, multiplier: f64, max_ms: u64) -> u64 {
    ((current_ms as f64 * multiplier) as u64).min(max_ms)
}

/// Start the HTTP server with automatic retry on failure.
///
/// This function never fails. If the port is in use it retries in the
/// background with exponential backoff.
pub fn start_server_with_retry(state: AppState, config: &ServerConfig) -> ServerHandle {
    let port = config.port;
    let retry_initial_ms = config.retry_initial_ms;
    let retry_jitter_ms = config.retry_jitter_ms;
    let retry_max_ms = config.retry_max_ms;
    let retry_multiplier = config.retry_multiplier;

    let (status_tx, status_rx) = watch::channel(ServerStatus::Retrying);
    let (handle_shutdown_tx, mut handle_shutdown_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let mut current_delay_ms = retry_initial_ms;

        loop {
            match start_server(state.clone(), port).await {
                Ok((server_shutdown_tx, bound_addr)) => {
                    info!("REST API available at http://{}/api", bound_addr);
                    let _ = status_tx.send(ServerStatus::Running);

                    let _ = (&mut handle_shutdown_rx).await;
                    let _ = server_shutdown_tx.send(());
                    let _ = status_tx.send(ServerStatus::Stopped);
                    break;
                }
                Err(e) => {
                    warn!(
                        port,
                        error = %e,
                        "Failed to start API server. Retrying in {:.1}s...",
                        current_delay_ms as f64 / 1000.0
                    );
                    let _ = status_tx.send(ServerStatus::Retrying);

                    let delay = compute_jittered_delay(current_delay_ms, retry_jitter_ms);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = &mut handle_shutdown_rx => {
                            info!("API server retry loop shutting down");
                            let _ = status_tx.send(ServerStatus::Stopped);
                            break;
                        }
                    }

                    current_delay_ms =
                        next_retry_ms(current_delay_ms, retry_multiplier, retry_max_ms);
                }
            }
        }
    });

    ServerHandle {
        shutdown_tx: Some(handle_shutdown_tx),
        status_rx,
    }
}
