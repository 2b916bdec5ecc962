//! 领域模型模块
//!
//! 纯数据结构，不依赖 axum/tokio

pub mod channel;
pub mod status;
pub mod tunnel;

// Re-exports for convenience
pub use channel::{ConnectionState, DeviceSpecs, InboundMessage, OutboundMessage};
pub use status::{OrchestratorState, ServiceStatus};
pub use tunnel::{TunnelConfig, TunnelStatus};
