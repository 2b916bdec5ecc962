//! API 模块
//!
//! 仅监听 127.0.0.1 的本地控制接口

pub mod control;
pub mod health;
pub mod tunnel;

use axum::Router;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;

/// 构建完整的 API 路由
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health & Status
        .merge(health::router())
        // Lifecycle
        .merge(control::router())
        // Tunnel
        .merge(tunnel::router())
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::config::EnvConfig;
    use crate::infra::RuntimeRoot;
    use crate::services::orchestrator::testing::orchestrator;
    use crate::state::AppState;

    pub const TEST_API_KEY: &str = "test-key";

    pub async fn test_state(
        dir: &tempfile::TempDir,
        asset: Option<&str>,
        health: Duration,
    ) -> Arc<AppState> {
        let orchestrator = orchestrator(dir, asset, health).await;
        let mut config = EnvConfig::from_env();
        config.api_key = TEST_API_KEY.to_string();
        config.runtime_root = dir.path().join("rt");
        Arc::new(AppState::with_orchestrator(
            config,
            RuntimeRoot::new(dir.path().join("rt")),
            orchestrator,
        ))
    }

    /// 在随机端口启动路由，返回 base URL
    pub async fn serve(state: Arc<AppState>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, super::router(state)).await;
        });
        format!("http://{}", addr)
    }
}
