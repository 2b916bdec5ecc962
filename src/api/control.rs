//! 生命周期控制 API
//!
//! POST /control/start, /control/stop, /control/restart，均需要 API Key

use axum::{extract::State, routing::post, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::domain::OrchestratorState;
use crate::error::ApiResult;
use crate::middleware::RequireApiKey;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct ControlResponse {
    pub success: bool,
    pub state: OrchestratorState,
    pub message: String,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/control/start", post(start))
        .route("/control/stop", post(stop))
        .route("/control/restart", post(restart))
}

async fn respond(state: &AppState) -> Json<ControlResponse> {
    let orchestrator = &state.orchestrator;
    Json(ControlResponse {
        success: true,
        state: orchestrator.state().await,
        message: orchestrator.status_line().await,
    })
}

async fn start(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<ControlResponse>> {
    info!("Start requested via control API");
    state.orchestrator.start().await?;
    Ok(respond(&state).await)
}

async fn stop(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<ControlResponse>> {
    info!("Stop requested via control API");
    state.orchestrator.stop().await;
    Ok(respond(&state).await)
}

async fn restart(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<ControlResponse>> {
    info!("Restart requested via control API");
    state.orchestrator.restart().await?;
    Ok(respond(&state).await)
}

#[cfg(test)]
mod tests {
    use crate::api::testing::{serve, test_state, TEST_API_KEY};
    use crate::middleware::auth::API_KEY_HEADER;
    use crate::services::orchestrator::testing::FAKE_FRPC;
    use std::time::Duration;

    #[tokio::test]
    async fn test_control_requires_api_key() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir, Some(FAKE_FRPC), Duration::from_secs(60)).await;
        let base = serve(state.clone()).await;

        let resp = reqwest::Client::new()
            .post(format!("{}/control/start", base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);
        assert!(!state.orchestrator.tunnel().is_running().await);
    }

    #[tokio::test]
    async fn test_start_restart_stop() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir, Some(FAKE_FRPC), Duration::from_secs(60)).await;
        let base = serve(state.clone()).await;
        let client = reqwest::Client::new();

        for (path, expected) in [
            ("start", "running"),
            ("restart", "running"),
            ("stop", "stopped"),
        ] {
            let body: serde_json::Value = client
                .post(format!("{}/control/{}", base, path))
                .header(API_KEY_HEADER, TEST_API_KEY)
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            assert_eq!(body["success"], true, "{}", path);
            assert_eq!(body["state"], expected, "{}", path);
        }
        assert!(!state.orchestrator.tunnel().is_running().await);
    }

    #[tokio::test]
    async fn test_start_failure_maps_to_503() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir, None, Duration::from_secs(60)).await;
        let base = serve(state).await;

        let resp = reqwest::Client::new()
            .post(format!("{}/control/start", base))
            .header(API_KEY_HEADER, TEST_API_KEY)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["message"], "binary missing");
    }
}
