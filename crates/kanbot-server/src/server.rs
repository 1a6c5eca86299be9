use std::sync::Arc;

use axum::routing::{get, post, put};
use axum::Router;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{self, HandlerState};

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: Arc<HandlerState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/tasks", post(handlers::create_task).get(handlers::list_tasks))
        .route("/tasks/{id}", get(handlers::get_task))
        .route("/tasks/{id}/status", put(handlers::update_status))
        .route(
            "/tasks/{id}/comments",
            post(handlers::add_comment).get(handlers::list_comments),
        )
        .route("/tasks/{id}/activity", get(handlers::list_activity))
        .route("/admin/reconcile", post(handlers::reconcile))
        .route("/admin/logs", get(handlers::logs))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and serve until `shutdown` fires.
pub async fn start(
    config: ServerConfig,
    state: Arc<HandlerState>,
    shutdown: CancellationToken,
) -> Result<ServerHandle, std::io::Error> {
    let router = build_router(state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(addr = %local_addr, "kanbot server started");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "server exited with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        server,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub port: u16,
    server: JoinHandle<()>,
}

impl ServerHandle {
    /// Wait for the server task to finish after shutdown was requested.
    pub async fn wait(self) {
        if let Err(e) = self.server.await {
            tracing::error!(error = %e, "server task panicked");
        }
    }
}
