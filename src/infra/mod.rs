//! 基础设施模块
//!
//! 运行时目录与受限环境中的命令执行

pub mod command;
pub mod runtime;

pub use command::{CommandError, ExecutionResult, Executor, ProcessHandle};
pub use runtime::RuntimeRoot;
