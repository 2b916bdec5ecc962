//! frpc 进程管理
//!
//! 每次启动都重新生成 ini 配置，通过执行器在运行时根目录内启动 `frpc`，
//! 采集 stdout/stderr 到环形缓冲区，并尝试提升进程优先级。

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    sync::{Mutex, RwLock},
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, error, info, warn};

use crate::{
    config::{env::constants::MAX_LOG_LINES, env::TunnelSettings, resources::Artifact},
    domain::tunnel::TunnelConfig,
    error::{ConfigError, ProcessStartError},
    infra::{
        command::{shell_quote, ProcessHandle},
        Executor,
    },
    services::provisioner::{ProvisionProgress, Provisioner},
};

const BINARY_NAME: &str = "frpc";

/// 启动过程中的各项时间与阈值
#[derive(Debug, Clone)]
pub struct TunnelTimings {
    pub startup_timeout: Duration,
    /// 替换已有进程前的等待
    pub replace_grace: Duration,
    /// 启动后到存活探测之间的等待
    pub settle: Duration,
    pub min_binary_size: u64,
}

impl From<&TunnelSettings> for TunnelTimings {
    fn from(s: &TunnelSettings) -> Self {
        Self {
            startup_timeout: Duration::from_secs(s.startup_timeout_secs),
            replace_grace: Duration::from_millis(s.replace_grace_ms),
            settle: Duration::from_millis(s.settle_ms),
            min_binary_size: s.min_binary_size,
        }
    }
}

/// 尽力而为的优先级提升步骤，按顺序独立执行
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PriorityStep {
    OomAdj(i32),
    OomScoreAdj(i32),
    Renice(i32),
}

impl PriorityStep {
    pub fn defaults() -> Vec<Self> {
        vec![
            PriorityStep::OomAdj(-17),
            PriorityStep::OomScoreAdj(-1000),
            PriorityStep::Renice(-20),
        ]
    }

    fn command(&self, pid: u32) -> String {
        match self {
            PriorityStep::OomAdj(v) => format!("echo {} > /proc/{}/oom_adj", v, pid),
            PriorityStep::OomScoreAdj(v) => format!("echo {} > /proc/{}/oom_score_adj", v, pid),
            PriorityStep::Renice(n) => format!("renice -n {} -p {}", n, pid),
        }
    }

    async fn apply(&self, executor: &Executor, pid: u32) -> bool {
        match executor
            .execute(&self.command(pid), None, Duration::from_secs(5))
            .await
        {
            Ok(r) if r.success() => {
                debug!(pid, step = ?self, "Priority step applied");
                true
            }
            Ok(r) => {
                debug!(pid, step = ?self, code = r.exit_code, output = %r.output, "Priority step rejected");
                false
            }
            Err(e) => {
                debug!(pid, step = ?self, error = %e, "Priority step failed");
                false
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FrpcStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub last_error: Option<String>,
    pub config_path: String,
    pub server_addr: Option<String>,
    pub remote_port: Option<u16>,
}

struct RunningTunnel {
    handle: ProcessHandle,
    readers: [JoinHandle<()>; 2],
}

pub struct FrpcManager {
    executor: Executor,
    provisioner: Arc<Provisioner>,
    artifact: Artifact,
    timings: TunnelTimings,
    check_local_port: bool,
    priority_steps: Vec<PriorityStep>,
    /// 串行化 start/stop，长耗时步骤只持有这把锁
    lifecycle: Mutex<()>,
    /// 仅在换入/换出进程句柄时短暂持有
    running: Mutex<Option<RunningTunnel>>,
    last_config: RwLock<Option<TunnelConfig>>,
    started_at: RwLock<Option<DateTime<Utc>>>,
    restart_count: AtomicU32,
    last_error: RwLock<Option<String>>,
    config_path: PathBuf,
    log_lines: Arc<RwLock<VecDeque<String>>>,
}

impl FrpcManager {
    pub fn new(
        executor: Executor,
        provisioner: Arc<Provisioner>,
        artifact: Artifact,
        timings: TunnelTimings,
    ) -> Self {
        let config_path = executor.root().home_dir().join("frpc.ini");
        Self {
            executor,
            provisioner,
            artifact,
            timings,
            check_local_port: true,
            priority_steps: PriorityStep::defaults(),
            lifecycle: Mutex::new(()),
            running: Mutex::new(None),
            last_config: RwLock::new(None),
            started_at: RwLock::new(None),
            restart_count: AtomicU32::new(0),
            last_error: RwLock::new(None),
            config_path,
            log_lines: Arc::new(RwLock::new(VecDeque::new())),
        }
    }

    pub fn with_priority_steps(mut self, steps: Vec<PriorityStep>) -> Self {
        self.priority_steps = steps;
        self
    }

    pub fn with_local_port_check(mut self, enabled: bool) -> Self {
        self.check_local_port = enabled;
        self
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub async fn tail_logs(&self, tail: usize) -> Vec<String> {
        let tail = tail.clamp(1, MAX_LOG_LINES);
        let lines = self.log_lines.read().await;
        let start = lines.len().saturating_sub(tail);
        lines.iter().skip(start).cloned().collect()
    }

    async fn push_log(&self, line: String) {
        push_line(&self.log_lines, line).await;
    }

    /// 原子写入配置（临时文件 + rename），写入后回读校验
    async fn write_config(&self, config: &TunnelConfig) -> Result<(), ConfigError> {
        let mut tmp = self.config_path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let write_err = |source| ConfigError::Write {
            path: self.config_path.clone(),
            source,
        };
        tokio::fs::write(&tmp, config.to_ini()).await.map_err(write_err)?;
        tokio::fs::rename(&tmp, &self.config_path)
            .await
            .map_err(write_err)?;

        let written = tokio::fs::read_to_string(&self.config_path)
            .await
            .map_err(write_err)?;
        if TunnelConfig::parse_ini(&written)? != *config {
            return Err(ConfigError::Parse(format!(
                "{} does not match the requested config",
                self.config_path.display()
            )));
        }
        Ok(())
    }

    /// 启动隧道，已在运行时先停止旧进程
    pub async fn start(&self, config: TunnelConfig) -> Result<(), ProcessStartError> {
        let _lifecycle = self.lifecycle.lock().await;
        match self.launch(&config).await {
            Ok(()) => {
                *self.last_config.write().await = Some(config);
                *self.last_error.write().await = None;
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Failed to start frpc");
                self.push_log(format!("[frp] start failed: {}", e)).await;
                *self.last_error.write().await = Some(e.to_string());
                // 失败后也记住配置，健康检查可以重试
                *self.last_config.write().await = Some(config);
                Err(e)
            }
        }
    }

    /// 调用方需持有 `lifecycle`；`running` 只在换入/换出时加锁
    async fn launch(&self, config: &TunnelConfig) -> Result<(), ProcessStartError> {
        self.provisioner
            .ensure(&self.artifact, &|p: ProvisionProgress| {
                debug!(progress = ?p, "frpc provisioning progress");
            })
            .await?;

        let previous = self.running.lock().await.take();
        if let Some(previous) = previous {
            info!(pid = previous.handle.pid(), "frpc already running, replacing");
            self.teardown(previous).await;
            sleep(self.timings.replace_grace).await;
        }

        self.write_config(config).await?;

        let binary = self.provisioner.mirror_path(BINARY_NAME);
        let size = tokio::fs::metadata(&binary)
            .await
            .map_err(|_| ProcessStartError::BinaryMissing(binary.clone()))?
            .len();
        if size < self.timings.min_binary_size {
            return Err(ProcessStartError::BinaryCorrupt {
                size,
                min: self.timings.min_binary_size,
            });
        }

        let chmod = format!("chmod 755 {}", shell_quote(&binary.to_string_lossy()));
        match self
            .executor
            .execute(&chmod, None, Duration::from_secs(10))
            .await
        {
            Ok(r) if r.success() => {}
            Ok(r) => warn!(code = r.exit_code, output = %r.output, "chmod on frpc failed"),
            Err(e) => warn!(error = %e, "chmod on frpc failed"),
        }

        if self.check_local_port && !port_listening(config.local_port).await {
            warn!(
                local_port = config.local_port,
                "Local port is not listening, tunnel will forward to nothing"
            );
        }

        let command = format!(
            "exec {} -c {}",
            BINARY_NAME,
            shell_quote(&self.config_path.to_string_lossy())
        );
        self.push_log(format!("[frp] starting: {}", command)).await;

        let mut handle = tokio::time::timeout(
            self.timings.startup_timeout,
            self.executor.start_background(&command, None),
        )
        .await
        .map_err(|_| ProcessStartError::StartupTimedOut(self.timings.startup_timeout))??;

        let pid = handle.pid();
        let readers = [
            spawn_log_reader(handle.take_stdout(), "STDOUT", self.log_lines.clone()),
            spawn_log_reader(handle.take_stderr(), "STDERR", self.log_lines.clone()),
        ];
        let mut tunnel = RunningTunnel { handle, readers };

        for step in &self.priority_steps {
            step.apply(&self.executor, pid).await;
        }

        sleep(self.timings.settle).await;
        if !tunnel.handle.is_alive() {
            // 给读取任务一点时间把最后的输出写入缓冲区
            sleep(Duration::from_millis(50)).await;
            self.teardown(tunnel).await;
            return Err(ProcessStartError::ProcessDiedAfterStart);
        }

        info!(
            pid,
            server_addr = %config.server_addr,
            server_port = config.server_port,
            remote_port = config.remote_port,
            "frpc started"
        );
        *self.running.lock().await = Some(tunnel);
        *self.started_at.write().await = Some(Utc::now());
        Ok(())
    }

    async fn teardown(&self, mut tunnel: RunningTunnel) {
        for reader in &tunnel.readers {
            reader.abort();
        }
        tunnel.handle.destroy().await;
    }

    /// 停止隧道（可重复调用）
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let taken = self.running.lock().await.take();
        let Some(tunnel) = taken else {
            return;
        };

        let pid = tunnel.handle.pid();
        self.push_log(format!("[frp] stopping frpc (pid {})", pid)).await;
        self.teardown(tunnel).await;
        *self.started_at.write().await = None;
        info!(pid, "frpc stopped");
    }

    /// 使用最近一次的配置重启
    pub async fn restart(&self) -> Result<(), ProcessStartError> {
        let Some(config) = self.last_config.read().await.clone() else {
            return Err(ConfigError::Parse("no previous tunnel config".to_string()).into());
        };
        self.restart_count.fetch_add(1, Ordering::Relaxed);
        self.stop().await;
        self.start(config).await
    }

    pub async fn is_running(&self) -> bool {
        let mut slot = self.running.lock().await;
        match slot.as_mut() {
            Some(tunnel) => tunnel.handle.is_alive(),
            None => false,
        }
    }

    pub async fn pid(&self) -> Option<u32> {
        self.running.lock().await.as_ref().map(|t| t.handle.pid())
    }

    pub async fn status(&self) -> FrpcStatus {
        let (running, pid) = {
            let mut slot = self.running.lock().await;
            match slot.as_mut() {
                Some(t) => (t.handle.is_alive(), Some(t.handle.pid())),
                None => (false, None),
            }
        };
        let config = self.last_config.read().await.clone();

        FrpcStatus {
            running,
            pid,
            started_at: *self.started_at.read().await,
            restart_count: self.restart_count.load(Ordering::Relaxed),
            last_error: self.last_error.read().await.clone(),
            config_path: self.config_path.to_string_lossy().to_string(),
            server_addr: config.as_ref().map(|c| c.server_addr.clone()),
            remote_port: config.as_ref().map(|c| c.remote_port),
        }
    }
}

async fn push_line(lines: &RwLock<VecDeque<String>>, line: String) {
    let mut buf = lines.write().await;
    buf.push_back(line);
    while buf.len() > MAX_LOG_LINES {
        buf.pop_front();
    }
}

fn spawn_log_reader<R>(
    stream: Option<R>,
    tag: &'static str,
    lines: Arc<RwLock<VecDeque<String>>>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(stream) = stream else {
            return;
        };
        let mut reader = BufReader::new(stream).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            info!(target: "relay_agent::frpc", stream = tag, "{}", line);
            push_line(&lines, format!("[{}] {}", tag, line)).await;
        }
        debug!(stream = tag, "frpc output closed");
    })
}

/// 通过 /proc/net/tcp{,6} 检查本地端口是否处于 LISTEN 状态
pub async fn port_listening(port: u16) -> bool {
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        let Ok(text) = tokio::fs::read_to_string(table).await else {
            continue;
        };
        if listening_in_table(&text, port) {
            return true;
        }
    }
    false
}

fn listening_in_table(text: &str, port: u16) -> bool {
    const TCP_LISTEN: &str = "0A";
    text.lines().skip(1).any(|line| {
        let mut cols = line.split_whitespace();
        let local = cols.nth(1);
        let state = cols.nth(1);
        match (local, state) {
            (Some(local), Some(state)) => {
                state == TCP_LISTEN
                    && local
                        .rsplit_once(':')
                        .and_then(|(_, p)| u16::from_str_radix(p, 16).ok())
                        == Some(port)
            }
            _ => false,
        }
    })
}
