//! 配置模块
//!
//! 环境变量解析与资源描述

pub mod env;
pub mod resources;

pub use env::EnvConfig;
pub use resources::{Artifact, LoadStrategy};
