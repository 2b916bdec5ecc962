//! Relay Agent - 设备端反向隧道代理
//!
//! 维持一个 frpc 反向隧道与一条控制通道，并由三层看门狗保证编排器常驻。

pub mod api;
pub mod config;
pub mod domain;
pub mod error;
pub mod infra;
pub mod middleware;
pub mod services;
pub mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::env::{constants::VERSION, snapshot_env_file};
use crate::config::EnvConfig;
use crate::infra::{Executor, RuntimeRoot};
use crate::services::aux_tool::AuxToolInstaller;
use crate::services::watchdog::{
    self, guard, orchestrator_pidfile, restart_if_absent, scheduler, work_queue, PidFile,
    ProcessTarget, Supervised, TriggerSource,
};
use crate::state::{get_shutdown_token, trigger_shutdown, AppState};

/// 初始化日志，默认级别 `relay_agent=info`，可用 `RUST_LOG` 覆盖
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("relay_agent=info,tower_http=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// 收到 SIGTERM/SIGINT 时触发全局 shutdown
fn spawn_signal_handler() -> anyhow::Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("install SIGINT handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
        trigger_shutdown();
    });
    Ok(())
}

async fn prepare_root(config: &EnvConfig) -> anyhow::Result<RuntimeRoot> {
    let root = RuntimeRoot::new(&config.runtime_root);
    root.init()
        .await
        .with_context(|| format!("create runtime root {}", root.path().display()))?;
    Ok(root)
}

fn current_exe() -> anyhow::Result<PathBuf> {
    std::env::current_exe().context("resolve current executable")
}

/// `relay-agent run`：编排器与本地控制接口
pub async fn run_agent(config: EnvConfig) -> anyhow::Result<()> {
    let root = prepare_root(&config).await?;
    let Some(_pidfile) = PidFile::acquire(orchestrator_pidfile(&root))? else {
        info!("Orchestrator already running, exiting");
        return Ok(());
    };

    info!(version = VERSION, root = %root.path().display(), "Starting relay-agent");

    let exe = current_exe()?;
    let state = Arc::new(AppState::new(config, &exe)?);
    let shutdown = get_shutdown_token();
    spawn_signal_handler()?;

    let addr = SocketAddr::from(([127, 0, 0, 1], state.config.control_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind control port {}", addr))?;
    info!(%addr, "Control API listening");

    let server = {
        let app = api::router(state.clone());
        let token = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
        })
    };

    let orchestrator = state.orchestrator.clone();
    if state.config.auto_start && state.config.is_configured() {
        orchestrator.run(shutdown.clone()).await;
    } else {
        if !state.config.is_configured() {
            warn!("FRP_SERVER_ADDR not set, waiting for configuration");
        }
        shutdown.cancelled().await;
        orchestrator.stop().await;
    }

    server.await.context("control API task")??;
    info!("relay-agent stopped");
    Ok(())
}

/// `relay-agent guard`：A 层守护进程
pub async fn run_guard(config: EnvConfig) -> anyhow::Result<()> {
    let root = prepare_root(&config).await?;
    let Some(pidfile) = PidFile::acquire(watchdog::guard_pidfile(&root))? else {
        info!("Guard already running, exiting");
        return Ok(());
    };

    // 上一次有意停止留下的标记
    let marker = guard::stop_marker(&root);
    if marker.exists() {
        let _ = std::fs::remove_file(&marker);
    }

    let exe = current_exe()?;
    let shutdown = get_shutdown_token();
    spawn_signal_handler()?;

    let guard = guard::Guard::new(
        Arc::new(ProcessTarget::orchestrator(&root, &exe)),
        Duration::from_secs(config.watchdog.guard_interval_secs),
    );
    guard.run(shutdown).await;

    let replacement = ProcessTarget::guard(&root, &exe);
    guard::on_termination(&root, Some(pidfile), &replacement).await?;
    Ok(())
}

/// `relay-agent guard-stop`
pub fn stop_guard(config: &EnvConfig) -> anyhow::Result<()> {
    let root = RuntimeRoot::new(&config.runtime_root);
    if guard::request_stop(&root)? {
        println!("guard stop requested");
    } else {
        println!("guard is not running");
    }
    Ok(())
}

/// `relay-agent tick --source <scheduler|work-queue>`：B/C 层单次检查
///
/// 检查失败只记录日志，不返回错误。
pub async fn run_tick(config: EnvConfig, source: TriggerSource) -> anyhow::Result<()> {
    let root = prepare_root(&config).await?;
    let exe = current_exe()?;
    let orchestrator = ProcessTarget::orchestrator(&root, &exe);
    let guard = ProcessTarget::guard(&root, &exe);
    let targets: [&dyn Supervised; 2] = [&orchestrator, &guard];

    let (attempts, backoff) = match source {
        TriggerSource::WorkQueue => (
            config.watchdog.tick_attempts,
            Duration::from_secs(config.watchdog.tick_backoff_secs),
        ),
        _ => (1, Duration::ZERO),
    };

    for (name, result) in watchdog::tick(&targets, source, attempts, backoff).await {
        match result {
            Ok(outcome) => info!(supervised = %name, ?outcome, %source, "Tick complete"),
            Err(e) => warn!(supervised = %name, error = %e, %source, "Tick failed"),
        }
    }
    Ok(())
}

/// `relay-agent install-watchdogs`：写入 env 文件、安装 B/C 层并拉起 A 层
pub async fn install_watchdogs(config: EnvConfig) -> anyhow::Result<()> {
    let root = prepare_root(&config).await?;
    let exe = current_exe()?;

    let env_file = config.env_file();
    let count = snapshot_env_file(&env_file)
        .with_context(|| format!("write {}", env_file.display()))?;
    println!("env file: {} ({} variables)", env_file.display(), count);

    match scheduler::install(&root, &exe).await {
        Ok(()) => println!("scheduler: installed"),
        Err(e) => println!("scheduler: failed ({})", e),
    }
    match work_queue::install(&root, &exe).await {
        Ok(()) => println!("work queue: installed"),
        Err(e) => println!("work queue: failed ({})", e),
    }
    match restart_if_absent(&ProcessTarget::guard(&root, &exe), TriggerSource::Guard).await {
        Ok(outcome) => println!("guard: {:?}", outcome),
        Err(e) => println!("guard: failed ({})", e),
    }
    Ok(())
}

/// `relay-agent uninstall`：移除 B/C 层、停止 A 层并删除辅助工具
///
/// 每一步独立执行，失败只输出原因。
pub async fn uninstall(config: EnvConfig) -> anyhow::Result<()> {
    let root = RuntimeRoot::new(&config.runtime_root);

    match scheduler::uninstall().await {
        Ok(()) => println!("scheduler: removed"),
        Err(e) => println!("scheduler: failed ({})", e),
    }
    match work_queue::uninstall().await {
        Ok(()) => println!("work queue: removed"),
        Err(e) => println!("work queue: failed ({})", e),
    }
    match guard::request_stop(&root) {
        Ok(true) => println!("guard: stop requested"),
        Ok(false) => println!("guard: not running"),
        Err(e) => println!("guard: failed ({})", e),
    }

    if config.aux_tool.enabled && root.is_initialized() {
        let aux = AuxToolInstaller::new(
            Executor::new(root),
            config.aux_tool.clone(),
            config.provision.assets_dir.clone(),
        );
        match aux.uninstall().await {
            Ok(()) => println!("aux tool: removed"),
            Err(e) => println!("aux tool: failed ({})", e),
        }
    }
    Ok(())
}

/// `relay-agent status`
pub async fn print_status(config: EnvConfig) -> anyhow::Result<()> {
    let root = RuntimeRoot::new(&config.runtime_root);
    let exe = current_exe()?;
    for target in [
        ProcessTarget::orchestrator(&root, &exe),
        ProcessTarget::guard(&root, &exe),
    ] {
        let alive = target.is_alive().await;
        println!(
            "{:<13} {:<8} pid={}",
            target.name(),
            if alive { "alive" } else { "absent" },
            target
                .read_pid()
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }

    let url = format!("http://127.0.0.1:{}/status", config.control_port);
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(3))
        .build()?;
    match client.get(&url).send().await {
        Ok(resp) => {
            let body: serde_json::Value = resp.json().await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        Err(e) => println!("control API unreachable: {}", e),
    }
    Ok(())
}
