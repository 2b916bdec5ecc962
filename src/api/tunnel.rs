//! 隧道 (frpc) API
//!
//! 包含 /tunnel/* 端点

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::env::constants::MAX_LOG_LINES;
use crate::error::{ApiError, ApiResult};
use crate::middleware::RequireApiKey;
use crate::services::frp::FrpcStatus;
use crate::state::AppState;

const DEFAULT_TAIL: usize = 200;

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub tail: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub count: usize,
    pub lines: Vec<String>,
}

/// 创建隧道管理路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/tunnel/status", get(tunnel_status))
        .route("/tunnel/logs", get(tunnel_logs))
}

/// GET /tunnel/status
async fn tunnel_status(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
) -> Json<FrpcStatus> {
    Json(state.orchestrator.tunnel().status().await)
}

/// GET /tunnel/logs?tail=N
async fn tunnel_logs(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<LogsResponse>> {
    let tail = query.tail.unwrap_or(DEFAULT_TAIL);
    if tail == 0 || tail > MAX_LOG_LINES {
        return Err(ApiError::bad_request(format!(
            "tail must be between 1 and {}",
            MAX_LOG_LINES
        )));
    }

    let lines = state.orchestrator.tunnel().tail_logs(tail).await;
    Ok(Json(LogsResponse {
        count: lines.len(),
        lines,
    }))
}

#[cfg(test)]
mod tests {
    use crate::api::testing::{serve, test_state, TEST_API_KEY};
    use crate::middleware::auth::API_KEY_HEADER;
    use crate::services::orchestrator::testing::FAKE_FRPC;
    use std::time::Duration;

    #[tokio::test]
    async fn test_tunnel_logs() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir, Some(FAKE_FRPC), Duration::from_secs(60)).await;
        state.orchestrator.start().await.unwrap();
        let base = serve(state.clone()).await;
        let client = reqwest::Client::new();

        let body: serde_json::Value = client
            .get(format!("{}/tunnel/logs?tail=50", base))
            .header(API_KEY_HEADER, TEST_API_KEY)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let lines = body["lines"].as_array().unwrap();
        assert_eq!(body["count"].as_u64().unwrap() as usize, lines.len());
        assert!(lines
            .iter()
            .any(|l| l.as_str().unwrap().contains("fake frpc")));

        let resp = client
            .get(format!("{}/tunnel/logs?tail=0", base))
            .header(API_KEY_HEADER, TEST_API_KEY)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

        let resp = client
            .get(format!("{}/tunnel/logs", base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);

        state.orchestrator.stop().await;
    }
}
