pub mod api;
pub mod auth;

pub use auth::{AuthUser, Authenticator, DebugAuthenticator, ProviderAuthenticator};

use axum::{
    Router, middleware,
    routing::{get, post},
};
use dts_core::{DatabaseConfig, Registry, Result, ServiceConfig};
use dts_tasks::TaskClient;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub tasks: TaskClient,
    pub registry: Arc<Registry>,
    /// Database metadata as configured, for the catalog endpoints
    pub databases: Arc<HashMap<String, DatabaseConfig>>,
    pub authenticator: Arc<dyn Authenticator>,
    pub started_at: Instant,
}

/// The versioned JSON API in front of the task engine
pub struct HttpServer {
    state: AppState,
    config: ServiceConfig,
}

impl HttpServer {
    pub fn new(
        config: ServiceConfig,
        tasks: TaskClient,
        registry: Arc<Registry>,
        databases: HashMap<String, DatabaseConfig>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        let state = AppState {
            tasks,
            registry,
            databases: Arc::new(databases),
            authenticator,
            started_at: Instant::now(),
        };
        Self { state, config }
    }

    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let app = self.create_router();
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        info!("HTTP server listening on http://{}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| dts_core::DtsError::Transfer(format!("http server: {e}")))?;

        Ok(())
    }

    pub fn create_router(&self) -> Router {
        let state = self.state.clone();

        Router::new()
            .route("/", get(api::service_info))
            // Database catalog
            .route("/api/v1/databases", get(api::list_databases))
            .route("/api/v1/databases/{db}", get(api::get_database))
            .route(
                "/api/v1/databases/{db}/search-parameters",
                get(api::search_parameters),
            )
            // File metadata
            .route("/api/v1/files", get(api::search_files).post(api::search_files_post))
            .route("/api/v1/files/by-id", get(api::files_by_id))
            // Transfers
            .route("/api/v1/transfers", post(api::create_transfer))
            .route(
                "/api/v1/transfers/{id}",
                get(api::transfer_status).delete(api::cancel_transfer),
            )
            // Add middleware
            .layer(middleware::from_fn_with_state(
                state.clone(),
                auth::auth_middleware,
            ))
            .layer(GlobalConcurrencyLimitLayer::new(self.config.max_connections))
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}
