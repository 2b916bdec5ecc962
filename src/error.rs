//! 统一错误处理
//!
//! 各组件的错误类型，以及实现 `IntoResponse` 的 `ApiError`

use std::path::PathBuf;
use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::infra::command::CommandError;

/// 资源准备错误
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Unsupported architecture: {0}")]
    UnsupportedArch(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected HTTP status {0}")]
    BadStatus(u16),

    #[error("Downloaded file too small: {actual} bytes (expected at least {expected})")]
    TooSmall { actual: u64, expected: u64 },

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    Checksum { expected: String, actual: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bundled asset not found: {}", .0.display())]
    AssetMissing(PathBuf),

    #[error("Download failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

/// 配置文件错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(String),
}

/// 隧道进程启动错误
#[derive(Debug, Error)]
pub enum ProcessStartError {
    #[error("Provisioning failed: {0}")]
    Provision(#[from] ProvisionError),

    #[error("Binary missing: {}", .0.display())]
    BinaryMissing(PathBuf),

    #[error("Binary corrupt: {size} bytes (minimum {min})")]
    BinaryCorrupt { size: u64, min: u64 },

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to launch process: {0}")]
    Spawn(#[from] CommandError),

    #[error("Process did not start within {0:?}")]
    StartupTimedOut(Duration),

    #[error("Process died after start")]
    ProcessDiedAfterStart,
}

impl ProcessStartError {
    /// 面向用户的状态行
    pub fn status_line(&self) -> &'static str {
        match self {
            Self::Provision(_) | Self::BinaryMissing(_) => "binary missing",
            _ => "startup failed",
        }
    }
}

/// 控制通道错误
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Connect timed out after {0:?}")]
    Timeout(Duration),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Encode failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Connection closed")]
    Closed,
}

/// 辅助工具安装错误
#[derive(Debug, Error)]
pub enum AuxToolError {
    #[error("Asset not found: {}", .0.display())]
    AssetMissing(PathBuf),

    #[error("Command failed: {0}")]
    Command(#[from] CommandError),

    #[error("Step `{step}` failed with exit code {code}: {output}")]
    StepFailed {
        step: &'static str,
        code: i32,
        output: String,
    },

    #[error("Installed file failed verification")]
    VerifyFailed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// 看门狗错误，始终非致命
#[derive(Debug, Error)]
pub enum WatchdogError {
    #[error("Failed to launch {target}: {reason}")]
    Launch { target: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Command failed: {0}")]
    Command(String),
}

/// API 错误响应结构
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// 统一 API 错误类型
#[derive(Debug)]
pub enum ApiError {
    /// 401 - 未授权（API Key 无效或缺失）
    Unauthorized,
    /// 400 - 请求无效
    BadRequest(String),
    /// 503 - 服务不可用（如隧道启动失败）
    ServiceUnavailable { message: String, details: String },
}

impl ApiError {
    pub fn unauthorized() -> Self {
        Self::Unauthorized
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }
}

impl From<ProcessStartError> for ApiError {
    fn from(e: ProcessStartError) -> Self {
        Self::ServiceUnavailable {
            message: e.status_line().to_string(),
            details: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                ErrorResponse::new("unauthorized", "Invalid or missing API key"),
            ),
            ApiError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, ErrorResponse::new("bad_request", msg))
            }
            ApiError::ServiceUnavailable { message, details } => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorResponse::new("service_unavailable", message).with_details(details),
            ),
        };

        (status, Json(body)).into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Unauthorized => write!(f, "Unauthorized"),
            ApiError::BadRequest(m) => write!(f, "Bad request: {}", m),
            ApiError::ServiceUnavailable { message, details } => {
                write!(f, "Service unavailable: {} ({})", message, details)
            }
        }
    }
}

impl std::error::Error for ApiError {}

/// 便捷类型别名
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_with_details() {
        let resp = ErrorResponse::new("test_error", "Test message").with_details("Extra info");
        assert_eq!(resp.error, "test_error");
        assert_eq!(resp.details, Some("Extra info".to_string()));
    }

    #[test]
    fn test_start_error_maps_to_status_line() {
        let err: ApiError = ProcessStartError::BinaryMissing(PathBuf::from("/x/frpc")).into();
        match err {
            ApiError::ServiceUnavailable { message, .. } => assert_eq!(message, "binary missing"),
            other => panic!("unexpected {:?}", other),
        }

        let err: ApiError = ProcessStartError::ProcessDiedAfterStart.into();
        assert!(err.to_string().contains("startup failed"));
    }

    #[test]
    fn test_unauthorized_status() {
        let resp = ApiError::unauthorized().into_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
