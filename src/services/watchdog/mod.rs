//! 看门狗
//!
//! 三个独立触发源共用同一个幂等原语 [`restart_if_absent`]：
//! - A: 常驻守护进程，每 10 秒轮询（[`guard`]）
//! - B: crontab 定时 + 开机触发（[`scheduler`]）
//! - C: systemd 用户定时器，带线性退避（[`work_queue`]）

pub mod guard;
pub mod scheduler;
pub mod work_queue;

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::WatchdogError;
use crate::infra::command::pid_exists;
use crate::infra::RuntimeRoot;

/// 可被看门狗拉起的目标
#[async_trait]
pub trait Supervised: Send + Sync {
    fn name(&self) -> &str;

    async fn is_alive(&self) -> bool;

    async fn launch(&self) -> Result<(), WatchdogError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartOutcome {
    AlreadyRunning,
    Restarted,
}

/// 触发来源（仅用于日志）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    Guard,
    Scheduler,
    WorkQueue,
    HealthLoop,
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Guard => "guard",
            Self::Scheduler => "scheduler",
            Self::WorkQueue => "work-queue",
            Self::HealthLoop => "health-loop",
        })
    }
}

impl std::str::FromStr for TriggerSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "guard" => Ok(Self::Guard),
            "scheduler" => Ok(Self::Scheduler),
            "work-queue" | "work_queue" => Ok(Self::WorkQueue),
            "health-loop" => Ok(Self::HealthLoop),
            other => Err(format!("unknown trigger source: {}", other)),
        }
    }
}

/// 目标不存活时拉起；已存活时什么都不做
pub async fn restart_if_absent(
    target: &dyn Supervised,
    source: TriggerSource,
) -> Result<RestartOutcome, WatchdogError> {
    if target.is_alive().await {
        return Ok(RestartOutcome::AlreadyRunning);
    }

    warn!(supervised = target.name(), %source, "Supervised process absent, restarting");
    target.launch().await?;
    info!(supervised = target.name(), %source, "Supervised process launched");
    Ok(RestartOutcome::Restarted)
}

/// 带线性退避的 [`restart_if_absent`]，第 n 次失败后等待 n × base
pub async fn restart_with_backoff(
    target: &dyn Supervised,
    source: TriggerSource,
    attempts: u32,
    base: Duration,
) -> Result<RestartOutcome, WatchdogError> {
    let attempts = attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match restart_if_absent(target, source).await {
            Ok(outcome) => return Ok(outcome),
            Err(e) if attempt < attempts => {
                let delay = base * attempt;
                warn!(
                    supervised = target.name(),
                    attempt,
                    delay_secs = delay.as_secs_f32(),
                    error = %e,
                    "Restart failed, backing off"
                );
                sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// 对每个目标执行一次检查，错误只记录日志
pub async fn tick(
    targets: &[&dyn Supervised],
    source: TriggerSource,
    attempts: u32,
    base: Duration,
) -> Vec<(String, Result<RestartOutcome, WatchdogError>)> {
    let mut results = Vec::with_capacity(targets.len());
    for target in targets {
        let result = restart_with_backoff(*target, source, attempts, base).await;
        match &result {
            Ok(outcome) => debug!(supervised = target.name(), ?outcome, %source, "Watchdog tick"),
            Err(e) => warn!(supervised = target.name(), error = %e, %source, "Watchdog tick failed"),
        }
        results.push((target.name().to_string(), result));
    }
    results
}

/// 以 pid 文件判断存活、以独立进程组启动的目标
#[derive(Debug, Clone)]
pub struct ProcessTarget {
    name: String,
    program: PathBuf,
    args: Vec<String>,
    pidfile: PathBuf,
}

impl ProcessTarget {
    pub fn new(
        name: impl Into<String>,
        program: impl Into<PathBuf>,
        args: Vec<String>,
        pidfile: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
            pidfile: pidfile.into(),
        }
    }

    /// `<exe> run`
    pub fn orchestrator(root: &RuntimeRoot, exe: &Path) -> Self {
        Self::new(
            "orchestrator",
            exe,
            vec!["run".to_string()],
            orchestrator_pidfile(root),
        )
    }

    /// `<exe> guard`
    pub fn guard(root: &RuntimeRoot, exe: &Path) -> Self {
        Self::new("guard", exe, vec!["guard".to_string()], guard_pidfile(root))
    }

    pub fn pidfile(&self) -> &Path {
        &self.pidfile
    }

    pub fn read_pid(&self) -> Option<u32> {
        read_pid(&self.pidfile)
    }
}

#[async_trait]
impl Supervised for ProcessTarget {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_alive(&self) -> bool {
        self.read_pid().map(pid_exists).unwrap_or(false)
    }

    async fn launch(&self) -> Result<(), WatchdogError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| WatchdogError::Launch {
                target: self.name.clone(),
                reason: e.to_string(),
            })?;

        debug!(supervised = %self.name, pid = ?child.id(), "Detached process spawned");
        // 回收子进程，避免僵尸
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
        Ok(())
    }
}

pub fn orchestrator_pidfile(root: &RuntimeRoot) -> PathBuf {
    root.run_dir().join("orchestrator.pid")
}

pub fn guard_pidfile(root: &RuntimeRoot) -> PathBuf {
    root.run_dir().join("guard.pid")
}

pub fn read_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

/// 当前进程的 pid 文件，drop 时仅在内容仍是自己时删除
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    pid: u32,
}

impl PidFile {
    /// 写入 pid 文件；文件指向另一个存活进程时返回 `None`
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Option<Self>, WatchdogError> {
        let path = path.into();
        let pid = std::process::id();

        if let Some(existing) = read_pid(&path) {
            if existing != pid && pid_exists(existing) {
                return Ok(None);
            }
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, format!("{}\n", pid))?;
        Ok(Some(Self { path, pid }))
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if read_pid(&self.path) == Some(self.pid) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeTarget;
    use super::*;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_restart_if_absent_is_idempotent() {
        let target = FakeTarget::new(false);

        let first = restart_if_absent(&target, TriggerSource::Scheduler).await.unwrap();
        let second = restart_if_absent(&target, TriggerSource::WorkQueue).await.unwrap();

        assert_eq!(first, RestartOutcome::Restarted);
        assert_eq!(second, RestartOutcome::AlreadyRunning);
        assert_eq!(target.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_backoff_retries_until_success() {
        let target = FakeTarget::new(false);
        target.failures_left.store(2, Ordering::SeqCst);

        let started = tokio::time::Instant::now();
        let outcome = restart_with_backoff(
            &target,
            TriggerSource::WorkQueue,
            3,
            Duration::from_millis(20),
        )
        .await
        .unwrap();

        assert_eq!(outcome, RestartOutcome::Restarted);
        assert_eq!(target.launches.load(Ordering::SeqCst), 3);
        // 20ms + 40ms
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_backoff_gives_up() {
        let target = FakeTarget::new(false);
        target.failures_left.store(5, Ordering::SeqCst);

        let result =
            restart_with_backoff(&target, TriggerSource::WorkQueue, 2, Duration::from_millis(1))
                .await;
        assert!(result.is_err());
        assert_eq!(target.launches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_process_target_launch_and_liveness() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("child.pid");
        let target = ProcessTarget::new(
            "child",
            "/bin/sh",
            vec![
                "-c".to_string(),
                format!("echo $$ > {}; exec sleep 30", pidfile.display()),
            ],
            &pidfile,
        );

        assert!(!target.is_alive().await);
        target.launch().await.unwrap();

        let mut alive = false;
        for _ in 0..50 {
            if target.is_alive().await {
                alive = true;
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        assert!(alive);

        let pid = target.read_pid().unwrap();
        crate::infra::command::signal_pid(pid, libc::SIGKILL).unwrap();
        sleep(Duration::from_millis(200)).await;
        assert!(!target.is_alive().await);
    }

    #[test]
    fn test_pidfile_refuses_live_owner() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.pid");

        // pid 1 总是存活
        std::fs::write(&path, "1\n").unwrap();
        assert!(PidFile::acquire(&path).unwrap().is_none());

        std::fs::write(&path, "999999999\n").unwrap();
        let pidfile = PidFile::acquire(&path).unwrap().unwrap();
        assert_eq!(read_pid(&path), Some(std::process::id()));
        drop(pidfile);
        assert!(!path.exists());
    }

    #[test]
    fn test_trigger_source_round_trip() {
        for s in ["guard", "scheduler", "work-queue", "health-loop"] {
            let parsed: TriggerSource = s.parse().unwrap();
            assert_eq!(parsed.to_string(), s);
        }
    }
}
