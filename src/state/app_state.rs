//! 应用状态

use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// 全局 shutdown token，用于优雅关闭所有后台任务
static GLOBAL_SHUTDOWN: std::sync::OnceLock<CancellationToken> = std::sync::OnceLock::new();

/// 获取全局 shutdown token
pub fn get_shutdown_token() -> CancellationToken {
    GLOBAL_SHUTDOWN
        .get_or_init(CancellationToken::new)
        .clone()
}

/// 触发全局 shutdown
pub fn trigger_shutdown() {
    if let Some(token) = GLOBAL_SHUTDOWN.get() {
        token.cancel();
    }
}

use crate::config::{
    env::EnvConfig,
    resources::{current_arch, frpc_artifact},
};
use crate::error::ProvisionError;
use crate::infra::{Executor, RuntimeRoot};
use crate::services::{
    aux_tool::AuxToolInstaller,
    channel::ChannelClient,
    device_info::collect_device_specs,
    frp::{FrpcManager, TunnelTimings},
    orchestrator::{Orchestrator, OrchestratorTimings},
    provisioner::Provisioner,
    watchdog::ProcessTarget,
};

/// 应用状态
pub struct AppState {
    /// API 密钥（用于验证请求）
    pub api_key: String,
    /// 环境配置
    pub config: EnvConfig,
    /// 服务启动时间
    pub started_at: DateTime<Utc>,
    pub root: RuntimeRoot,
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    /// 根据配置组装所有组件
    ///
    /// `exe` 是当前可执行文件，用于健康检查时拉起守护进程。
    pub fn new(config: EnvConfig, exe: &Path) -> Result<Self, ProvisionError> {
        tracing::info!(
            api_key_len = config.api_key.len(),
            port = config.control_port,
            root = %config.runtime_root.display(),
            server = %config.tunnel.server_addr,
            remote_port = config.tunnel.remote_port,
            channel_enabled = config.channel.enabled,
            strategy = %config.provision.strategy,
            "Loaded configuration"
        );

        let root = RuntimeRoot::new(&config.runtime_root);
        let executor = Executor::new(root.clone());

        let provisioner = Arc::new(Provisioner::new(root.clone(), &config.provision)?);
        let artifact = frpc_artifact(&config.provision, current_arch())?;
        let tunnel = Arc::new(
            FrpcManager::new(
                executor.clone(),
                provisioner,
                artifact,
                TunnelTimings::from(&config.tunnel),
            )
            .with_local_port_check(config.tunnel.check_local_port),
        );

        let specs = collect_device_specs(&config.channel);
        let channel = Arc::new(ChannelClient::new(config.channel.clone(), specs));

        let aux_tool = Arc::new(AuxToolInstaller::new(
            executor,
            config.aux_tool.clone(),
            config.provision.assets_dir.clone(),
        ));

        let orchestrator = Orchestrator::new(
            tunnel,
            channel,
            config.tunnel.to_tunnel_config(),
            OrchestratorTimings::from(&config),
        )
        .with_aux_tool(aux_tool)
        .with_guard(Arc::new(ProcessTarget::guard(&root, exe)));

        Ok(Self::with_orchestrator(config, root, Arc::new(orchestrator)))
    }

    /// 使用现成的编排器（测试时替换组件）
    pub fn with_orchestrator(
        config: EnvConfig,
        root: RuntimeRoot,
        orchestrator: Arc<Orchestrator>,
    ) -> Self {
        Self {
            api_key: config.api_key.clone(),
            config,
            started_at: Utc::now(),
            root,
            orchestrator,
        }
    }
}
