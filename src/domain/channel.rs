//! 控制通道消息与连接状态
//!
//! 入站文本帧在通道边界解码一次为封闭枚举，之后按变体分发。

use serde::{Deserialize, Serialize};

/// 控制通道连接状态
///
/// 序列化值与状态广播中的 `channelStatus` 一致。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    #[serde(rename = "stopped")]
    Disconnected,
    #[serde(rename = "connecting")]
    Connecting,
    #[serde(rename = "running")]
    Connected,
    #[serde(rename = "error")]
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "stopped",
            Self::Connecting => "connecting",
            Self::Connected => "running",
            Self::Error => "error",
        }
    }
}

/// 注册时上报的设备信息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceSpecs {
    pub device_id: String,
    pub frp_port: u16,
    pub device_name: String,
    pub device_type: String,
    pub model: String,
    pub os_version: String,
    pub screen_resolution: String,
    pub battery: u8,
    pub network: String,
}

/// 服务端下发的消息
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// 注册确认
    Registered {
        #[serde(default)]
        device_id: Option<String>,
        #[serde(default)]
        frp_port: Option<u16>,
        #[serde(default)]
        message: Option<String>,
    },
    /// 应用层心跳
    Ping,
    /// 远程命令（保留）
    Command {
        #[serde(default)]
        command: Option<String>,
        #[serde(default)]
        data: Option<serde_json::Value>,
    },
    /// 任务进度（保留）
    TaskUpdate {
        #[serde(default)]
        task_id: Option<String>,
        #[serde(default)]
        status: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

impl InboundMessage {
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// 设备上发的消息
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    DeviceOnline { specs: DeviceSpecs },
    Pong,
}

impl OutboundMessage {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
