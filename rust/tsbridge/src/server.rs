use crate::{
    config::AppConfig,
    db::PgConnector,
    engine::Connector,
    error::{Result, ServiceError},
    instance::InstanceManager,
    query::{CheckHealthRequest, HealthResult, QueryDataRequest, QueryDataResponse, QueryEngine},
    state::AppState,
};
use axum::{
    extract::State,
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

pub struct Server {
    config: Arc<AppConfig>,
    state: AppState,
}

impl Server {
    pub fn new(config: AppConfig) -> Self {
        let connector = PgConnector::new(config.session_pool_size, config.connect_timeout);
        Self::with_connector(config, Arc::new(connector))
    }

    /// Builds the server over any backing engine.
    pub fn with_connector(config: AppConfig, connector: Arc<dyn Connector>) -> Self {
        let config = Arc::new(config);
        let instances = Arc::new(InstanceManager::new(connector));
        let query = QueryEngine::new(instances, Arc::clone(&config));
        let state = AppState::new(Arc::clone(&config), query);

        Self { config, state }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/healthz", get(Self::health))
            .route("/api/query", post(Self::query))
            .route("/api/health", post(Self::check_health))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.config.listen_addr;
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "tsbridge listening");

        let shutdown = self.state.shutdown.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                info!("shutdown signal received, cancelling in-flight queries");
                shutdown.cancel();
            })
            .await?;

        self.state.query.shutdown().await;
        info!("all sessions closed");
        Ok(())
    }

    async fn health() -> Json<serde_json::Value> {
        Json(json!({ "status": "ok" }))
    }

    async fn query(
        State(state): State<AppState>,
        headers: HeaderMap,
        Json(request): Json<QueryDataRequest>,
    ) -> Result<Json<QueryDataResponse>> {
        enforce_api_key(&headers, &state.config)?;
        let cancel = state.shutdown.child_token();
        let response = state.query.query_data(request, cancel).await?;
        Ok(Json(response))
    }

    async fn check_health(
        State(state): State<AppState>,
        headers: HeaderMap,
        Json(request): Json<CheckHealthRequest>,
    ) -> Result<Json<HealthResult>> {
        enforce_api_key(&headers, &state.config)?;
        Ok(Json(state.query.check_health(&request.datasource).await))
    }
}

fn enforce_api_key(headers: &HeaderMap, config: &AppConfig) -> Result<()> {
    if let Some(expected) = &config.api_key {
        let provided = headers
            .get("x-api-key")
            .and_then(|value| value.to_str().ok());

        if provided != Some(expected.as_str()) {
            return Err(ServiceError::Auth);
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
