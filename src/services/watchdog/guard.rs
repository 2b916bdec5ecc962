//! 常驻守护进程（A 层）
//!
//! 每个间隔检查一次编排器，不存活就拉起。被外部终止时，除非存在停止标记，
//! 否则先拉起一个替代守护进程再退出。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{guard_pidfile, read_pid, restart_if_absent, RestartOutcome, Supervised, TriggerSource};
use crate::error::WatchdogError;
use crate::infra::command::signal_pid;
use crate::infra::RuntimeRoot;

/// 每多少次健康检查输出一次日志
const HEARTBEAT_EVERY: u64 = 10;

pub struct Guard {
    target: Arc<dyn Supervised>,
    interval: Duration,
}

impl Guard {
    pub fn new(target: Arc<dyn Supervised>, interval: Duration) -> Self {
        Self { target, interval }
    }

    pub async fn check_once(&self) -> Result<RestartOutcome, WatchdogError> {
        restart_if_absent(self.target.as_ref(), TriggerSource::Guard).await
    }

    /// 运行直到 `shutdown` 被取消
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            supervised = self.target.name(),
            interval_secs = self.interval.as_secs(),
            "Guard started"
        );

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut healthy: u64 = 0;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.check_once().await {
                Ok(RestartOutcome::AlreadyRunning) => {
                    healthy += 1;
                    if healthy % HEARTBEAT_EVERY == 0 {
                        debug!(supervised = self.target.name(), checks = healthy, "Guard heartbeat");
                    }
                }
                Ok(RestartOutcome::Restarted) => healthy = 0,
                Err(e) => warn!(supervised = self.target.name(), error = %e, "Guard restart failed"),
            }
        }

        info!("Guard stopped");
    }
}

/// 停止标记文件路径
pub fn stop_marker(root: &RuntimeRoot) -> PathBuf {
    root.run_dir().join("guard.stop")
}

/// 有意停止守护进程：先写停止标记，再发 SIGTERM
pub fn request_stop(root: &RuntimeRoot) -> Result<bool, WatchdogError> {
    let marker = stop_marker(root);
    if let Some(parent) = marker.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&marker, b"stop\n")?;

    match read_pid(&guard_pidfile(root)) {
        Some(pid) => {
            signal_pid(pid, libc::SIGTERM)?;
            info!(pid, "Guard stop requested");
            Ok(true)
        }
        None => {
            debug!("No guard pidfile, nothing to signal");
            Ok(false)
        }
    }
}

/// 守护进程收到终止信号后的处理，返回是否拉起了替代进程
///
/// 替代进程启动前需要先释放 pid 文件，否则新进程会认为已有守护进程在运行。
pub async fn on_termination(
    root: &RuntimeRoot,
    pidfile: Option<super::PidFile>,
    replacement: &dyn Supervised,
) -> Result<bool, WatchdogError> {
    let marker = stop_marker(root);
    if marker.exists() {
        let _ = std::fs::remove_file(&marker);
        info!("Guard stop marker found, exiting without replacement");
        return Ok(false);
    }

    drop(pidfile);
    warn!("Guard terminated externally, launching replacement");
    replacement.launch().await?;
    Ok(true)
}
