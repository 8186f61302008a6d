use std::sync::Arc;
use axum::{
    Router,
    extract::State,
    response::Json,
    routing::get,
};
use tokio::sync::watch;
use tracing::info;

use crate::config::Config;
use crate::dns::engine::QueryEngine;

/// Web status API - 重みテーブルと統計の確認用
pub struct WebServer {
    engine: Arc<QueryEngine>,
    config: Arc<Config>,
}

#[derive(Clone)]
struct AppState {
    engine: Arc<QueryEngine>,
}

impl WebServer {
    pub fn new(engine: Arc<QueryEngine>, config: Arc<Config>) -> Self {
        Self { engine, config }
    }

    pub fn router(engine: Arc<QueryEngine>) -> Router {
        Router::new()
            .route("/api/stats", get(api_stats))
            .route("/api/upstreams", get(api_upstreams))
            .route("/api/weights", get(api_weights))
            .with_state(AppState { engine })
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        if !self.config.web.enabled {
            info!("Web UI disabled");
            return Ok(());
        }

        let app = Self::router(self.engine.clone());
        let addr = format!("{}:{}", self.config.web.address, self.config.web.port);
        info!("🌐 Web status API listening on http://{}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            })
            .await?;
        Ok(())
    }
}

/// Stats API
async fn api_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.engine.get_stats())
}

/// Upstreams API
async fn api_upstreams(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.engine.upstream.get_stats())
}

/// Weight table API
async fn api_weights(State(state): State<AppState>) -> Json<serde_json::Value> {
    let domains = state
        .engine
        .balancer
        .as_ref()
        .map(|b| b.list_domains())
        .unwrap_or_default();
    Json(serde_json::json!({
        "enabled": state.engine.balancer.is_some(),
        "domains": domains,
    }))
}
