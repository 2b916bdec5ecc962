//! 健康检查和服务状态 API
//!
//! 包含 /health, /status 端点

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;

use crate::config::env::constants::VERSION;
use crate::domain::OrchestratorState;
use crate::state::AppState;

/// 健康检查响应
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    timestamp: String,
    started_at: String,
    state: OrchestratorState,
    device_name: String,
    configured: bool,
}

/// 创建健康检查路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(service_status))
}

/// GET /health
///
/// 进程存活即返回 ok，编排器状态只作参考
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        service: "relay-agent",
        version: VERSION,
        timestamp: chrono::Utc::now().to_rfc3339(),
        started_at: state.started_at.to_rfc3339(),
        state: state.orchestrator.state().await,
        device_name: state.config.tunnel.device_name.clone(),
        configured: state.config.is_configured(),
    })
}

/// GET /status
async fn service_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.orchestrator.snapshot().await)
}

#[cfg(test)]
mod tests {
    use crate::api::testing::{serve, test_state};
    use crate::services::orchestrator::testing::FAKE_FRPC;
    use std::time::Duration;

    #[tokio::test]
    async fn test_health_and_status_are_public() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir, Some(FAKE_FRPC), Duration::from_secs(60)).await;
        let base = serve(state.clone()).await;
        let client = reqwest::Client::new();

        let health: serde_json::Value = client
            .get(format!("{}/health", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["state"], "idle");

        let status: serde_json::Value = client
            .get(format!("{}/status", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["tunnelStatus"], "stopped");
        assert_eq!(status["channelStatus"], "stopped");
        assert_eq!(status["statusLine"], "idle");
        assert!(status["uptimeMs"].is_u64());
    }
}
