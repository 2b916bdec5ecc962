//! 服务状态模型

use serde::Serialize;

use super::channel::ConnectionState;
use super::tunnel::TunnelStatus;

/// 每个状态周期重新计算并广播的快照
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub tunnel_status: TunnelStatus,
    pub channel_status: ConnectionState,
    pub uptime_ms: u64,
}

impl Default for ServiceStatus {
    fn default() -> Self {
        Self {
            tunnel_status: TunnelStatus::Stopped,
            channel_status: ConnectionState::Disconnected,
            uptime_ms: 0,
        }
    }
}

/// 编排器状态机
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestratorState {
    Idle,
    Starting,
    Running,
    /// 隧道或通道正在恢复
    Degraded,
    Stopped,
}

impl OrchestratorState {
    /// 是否处于活动状态（start 在此状态下为空操作）
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Degraded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_payload_shape() {
        let status = ServiceStatus {
            tunnel_status: TunnelStatus::Running,
            channel_status: ConnectionState::Connecting,
            uptime_ms: 1234,
        };
        let json = serde_json::to_value(status).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "tunnelStatus": "running",
                "channelStatus": "connecting",
                "uptimeMs": 1234
            })
        );
    }

    #[test]
    fn test_active_states() {
        assert!(OrchestratorState::Running.is_active());
        assert!(OrchestratorState::Degraded.is_active());
        assert!(!OrchestratorState::Stopped.is_active());
        assert!(!OrchestratorState::Idle.is_active());
    }
}
