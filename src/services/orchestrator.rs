//! 服务编排器
//!
//! 按顺序启动隧道、辅助工具与控制通道，然后运行两个周期任务：
//! - 健康检查：隧道、控制通道、守护进程三项检查互相隔离
//! - 状态广播：通过 `watch` 发布 [`ServiceStatus`]

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EnvConfig;
use crate::domain::status::{OrchestratorState, ServiceStatus};
use crate::domain::tunnel::{TunnelConfig, TunnelStatus};
use crate::domain::ConnectionState;
use crate::error::ProcessStartError;
use crate::services::aux_tool::AuxToolInstaller;
use crate::services::channel::ChannelClient;
use crate::services::frp::{FrpcManager, FrpcStatus};
use crate::services::watchdog::{restart_if_absent, RestartOutcome, Supervised, TriggerSource};

const STATUS_RUNNING: &str = "running";
const STATUS_DEGRADED: &str = "degraded: reconnecting";
const STATUS_STOPPED: &str = "stopped";

#[derive(Debug, Clone)]
pub struct OrchestratorTimings {
    /// 隧道启动后、后续步骤之前的等待
    pub settle: Duration,
    pub health_interval: Duration,
    pub status_interval: Duration,
}

impl From<&EnvConfig> for OrchestratorTimings {
    fn from(config: &EnvConfig) -> Self {
        Self {
            settle: Duration::from_millis(config.tunnel.settle_ms),
            health_interval: Duration::from_secs(config.watchdog.health_interval_secs),
            status_interval: Duration::from_secs(config.watchdog.status_interval_secs),
        }
    }
}

/// `/status` 返回的完整快照
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    #[serde(flatten)]
    pub status: ServiceStatus,
    pub state: OrchestratorState,
    pub status_line: String,
    pub tunnel: FrpcStatus,
}

struct Loops {
    cancel: CancellationToken,
    health: JoinHandle<()>,
    status: JoinHandle<()>,
}

pub struct Orchestrator {
    tunnel: Arc<FrpcManager>,
    channel: Arc<ChannelClient>,
    tunnel_config: TunnelConfig,
    timings: OrchestratorTimings,
    aux_tool: Option<Arc<AuxToolInstaller>>,
    guard: Option<Arc<dyn Supervised>>,
    state: RwLock<OrchestratorState>,
    status_line: RwLock<String>,
    status_tx: watch::Sender<ServiceStatus>,
    /// 最近一次成功启动的时间，未运行时为空
    started_at: RwLock<Option<Instant>>,
    /// 每次 stop 加一，`run` 据此放弃启动重试
    stop_epoch: AtomicU64,
    loops: Mutex<Option<Loops>>,
    /// 串行化 start/stop
    lifecycle: Mutex<()>,
}

impl Orchestrator {
    pub fn new(
        tunnel: Arc<FrpcManager>,
        channel: Arc<ChannelClient>,
        tunnel_config: TunnelConfig,
        timings: OrchestratorTimings,
    ) -> Self {
        let (status_tx, _) = watch::channel(ServiceStatus::default());
        Self {
            tunnel,
            channel,
            tunnel_config,
            timings,
            aux_tool: None,
            guard: None,
            state: RwLock::new(OrchestratorState::Idle),
            status_line: RwLock::new("idle".to_string()),
            status_tx,
            started_at: RwLock::new(None),
            stop_epoch: AtomicU64::new(0),
            loops: Mutex::new(None),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn with_aux_tool(mut self, installer: Arc<AuxToolInstaller>) -> Self {
        self.aux_tool = Some(installer);
        self
    }

    /// 健康检查时一并确认守护进程存活
    pub fn with_guard(mut self, guard: Arc<dyn Supervised>) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn tunnel(&self) -> &Arc<FrpcManager> {
        &self.tunnel
    }

    pub fn channel(&self) -> &Arc<ChannelClient> {
        &self.channel
    }

    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    pub async fn status_line(&self) -> String {
        self.status_line.read().await.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ServiceStatus> {
        self.status_tx.subscribe()
    }

    async fn set_state(&self, state: OrchestratorState, line: &str) {
        let previous = std::mem::replace(&mut *self.state.write().await, state);
        *self.status_line.write().await = line.to_string();
        if previous != state {
            info!(from = ?previous, to = ?state, status = line, "Orchestrator state changed");
        }
    }

    /// 启动所有组件，已处于活动状态时为空操作
    pub async fn start(self: &Arc<Self>) -> Result<(), ProcessStartError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.start_locked().await
    }

    /// 调用方需持有 `lifecycle`
    async fn start_locked(self: &Arc<Self>) -> Result<(), ProcessStartError> {
        if self.state().await.is_active() {
            debug!("Orchestrator already active, start ignored");
            return Ok(());
        }

        self.set_state(OrchestratorState::Starting, "starting").await;

        if let Err(e) = self.tunnel.start(self.tunnel_config.clone()).await {
            error!(error = %e, "Tunnel startup failed");
            self.tunnel.stop().await;
            self.set_state(OrchestratorState::Stopped, e.status_line()).await;
            self.publish().await;
            return Err(e);
        }

        sleep(self.timings.settle).await;

        if let Some(aux) = self.aux_tool.as_ref().filter(|a| a.enabled()) {
            match aux.ensure_installed().await {
                Ok(true) => info!("Aux tool installed"),
                Ok(false) => {}
                Err(e) => warn!(error = %e, "Aux tool install failed, continuing"),
            }
        }

        if self.channel.enabled() {
            self.channel.connect();
        }

        self.spawn_loops().await;
        *self.started_at.write().await = Some(Instant::now());
        self.set_state(OrchestratorState::Running, STATUS_RUNNING).await;
        self.publish().await;
        info!("Orchestrator started");
        Ok(())
    }

    /// 停止循环、断开通道、停止隧道（可重复调用）
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.stop_epoch.fetch_add(1, Ordering::SeqCst);

        if let Some(loops) = self.loops.lock().await.take() {
            loops.cancel.cancel();
            let _ = loops.health.await;
            let _ = loops.status.await;
        }

        self.channel.disconnect().await;
        self.tunnel.stop().await;
        *self.started_at.write().await = None;

        self.set_state(OrchestratorState::Stopped, STATUS_STOPPED).await;
        self.publish().await;
        info!("Orchestrator stopped");
    }

    pub async fn restart(self: &Arc<Self>) -> Result<(), ProcessStartError> {
        self.stop().await;
        self.start().await
    }

    async fn spawn_loops(self: &Arc<Self>) {
        let cancel = CancellationToken::new();

        let health = {
            let this = Arc::clone(self);
            let token = cancel.clone();
            tokio::spawn(async move {
                loop {
                    // 上一轮检查结束后才开始计时
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = sleep(this.timings.health_interval) => {}
                    }
                    this.health_check_once().await;
                }
                debug!("Health loop exited");
            })
        };

        let status = {
            let this = Arc::clone(self);
            let token = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = sleep(this.timings.status_interval) => {}
                    }
                    this.publish().await;
                }
                debug!("Status loop exited");
            })
        };

        let previous = self.loops.lock().await.replace(Loops {
            cancel,
            health,
            status,
        });
        if let Some(old) = previous {
            old.cancel.cancel();
        }
    }

    /// 执行一轮健康检查，返回是否健康
    pub async fn health_check_once(&self) -> bool {
        let tunnel_ok = isolated("tunnel", self.check_tunnel()).await;
        let channel_ok = isolated("channel", self.check_channel()).await;
        isolated("guard", self.check_guard()).await;

        let healthy = tunnel_ok && channel_ok;
        if self.state().await.is_active() {
            if healthy {
                self.set_state(OrchestratorState::Running, STATUS_RUNNING).await;
            } else {
                self.set_state(OrchestratorState::Degraded, STATUS_DEGRADED).await;
            }
        }
        healthy
    }

    async fn check_tunnel(&self) -> bool {
        if self.tunnel.is_running().await {
            return true;
        }
        warn!("Tunnel not running, restarting");
        match self.tunnel.restart().await {
            Ok(()) => {
                info!("Tunnel restarted by health check");
                true
            }
            Err(e) => {
                error!(error = %e, "Tunnel restart failed");
                false
            }
        }
    }

    async fn check_channel(&self) -> bool {
        if !self.channel.enabled() {
            return true;
        }
        match self.channel.state() {
            ConnectionState::Connected => true,
            ConnectionState::Connecting => false,
            state => {
                warn!(state = state.as_str(), "Channel not connected, reconnecting");
                self.channel.connect();
                false
            }
        }
    }

    /// 守护进程问题只记录日志，不影响健康结论
    async fn check_guard(&self) -> bool {
        let Some(guard) = &self.guard else {
            return true;
        };
        match restart_if_absent(guard.as_ref(), TriggerSource::HealthLoop).await {
            Ok(RestartOutcome::AlreadyRunning) => true,
            Ok(RestartOutcome::Restarted) => {
                info!(supervised = guard.name(), "Guard relaunched by health check");
                true
            }
            Err(e) => {
                warn!(supervised = guard.name(), error = %e, "Guard relaunch failed");
                true
            }
        }
    }

    async fn compute_status(&self) -> ServiceStatus {
        let tunnel_status = if self.tunnel.is_running().await {
            TunnelStatus::Running
        } else {
            TunnelStatus::Stopped
        };
        ServiceStatus {
            tunnel_status,
            channel_status: self.channel.state(),
            uptime_ms: self
                .started_at
                .read()
                .await
                .map(|t| t.elapsed().as_millis() as u64)
                .unwrap_or(0),
        }
    }

    /// 重新计算状态并广播
    pub async fn publish(&self) -> ServiceStatus {
        let status = self.compute_status().await;
        self.status_tx.send_replace(status);
        status
    }

    pub async fn snapshot(&self) -> StatusReport {
        StatusReport {
            status: self.compute_status().await,
            state: self.state().await,
            status_line: self.status_line().await,
            tunnel: self.tunnel.status().await,
        }
    }

    /// 持续尝试启动直到成功，然后等待关闭信号
    ///
    /// 重试期间调用过 `stop` 则不再重试。
    pub async fn run(self: &Arc<Self>, shutdown: CancellationToken) {
        let epoch = self.stop_epoch.load(Ordering::SeqCst);
        loop {
            let attempt = {
                let _lifecycle = self.lifecycle.lock().await;
                if self.stop_epoch.load(Ordering::SeqCst) != epoch {
                    None
                } else {
                    Some(self.start_locked().await)
                }
            };
            match attempt {
                None => {
                    info!("Stop requested, startup retries abandoned");
                    break;
                }
                Some(Ok(())) => break,
                Some(Err(e)) => {
                    warn!(
                        error = %e,
                        retry_secs = self.timings.health_interval.as_secs(),
                        "Orchestrator start failed, will retry"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            self.stop().await;
                            return;
                        }
                        _ = sleep(self.timings.health_interval) => {}
                    }
                }
            }
        }

        shutdown.cancelled().await;
        self.stop().await;
    }
}

/// 捕获单项检查中的 panic，视为失败
async fn isolated<F>(name: &'static str, check: F) -> bool
where
    F: std::future::Future<Output = bool>,
{
    match AssertUnwindSafe(check).catch_unwind().await {
        Ok(ok) => ok,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(check = name, panic = %message, "Health check panicked");
            false
        }
    }
}
