//! 服务层模块
//!
//! 包含核心业务逻辑

pub mod aux_tool;
pub mod channel;
pub mod device_info;
pub mod frp;
pub mod orchestrator;
pub mod provisioner;
pub mod watchdog;
