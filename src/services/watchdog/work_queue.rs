//! 周期任务队列触发（C 层）
//!
//! 使用 systemd 用户定时器，开机 2 分钟后首次执行，之后每 15 分钟一次，
//! 错过的执行在下次启动时补上。执行内容是 `tick --source work-queue`。

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{info, warn};

use crate::error::WatchdogError;
use crate::infra::RuntimeRoot;

pub const UNIT_NAME: &str = "relay-agent-watchdog";

/// systemd 单元文件中的双引号转义，`%` 需写成 `%%`
fn unit_quote(value: &str) -> String {
    let escaped = value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('%', "%%");
    format!("\"{}\"", escaped)
}

/// oneshot 单元结束时只结束 tick 本身，拉起的进程留在 cgroup 中继续运行
pub fn render_service(root: &RuntimeRoot, exe: &Path) -> String {
    let env = format!("RELAY_AGENT_ROOT={}", root.path().display());
    format!(
        "[Unit]\n\
         Description=relay-agent watchdog tick\n\
         \n\
         [Service]\n\
         Type=oneshot\n\
         KillMode=process\n\
         Environment={env}\n\
         ExecStart={exe} tick --source work-queue\n",
        env = unit_quote(&env),
        exe = unit_quote(&exe.to_string_lossy()),
    )
}

pub fn render_timer() -> String {
    format!(
        "[Unit]\n\
         Description=Periodic relay-agent watchdog tick\n\
         \n\
         [Timer]\n\
         OnBootSec=2min\n\
         OnUnitActiveSec=15min\n\
         Persistent=true\n\
         Unit={unit}.service\n\
         \n\
         [Install]\n\
         WantedBy=timers.target\n",
        unit = UNIT_NAME,
    )
}

/// `~/.config/systemd/user`
pub fn user_unit_dir() -> Option<PathBuf> {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
        .map(|p| p.join("systemd/user"))
}

/// 写入单元文件，返回 (service, timer) 路径
pub async fn write_units(
    unit_dir: &Path,
    root: &RuntimeRoot,
    exe: &Path,
) -> Result<(PathBuf, PathBuf), WatchdogError> {
    tokio::fs::create_dir_all(unit_dir).await?;
    let service = unit_dir.join(format!("{}.service", UNIT_NAME));
    let timer = unit_dir.join(format!("{}.timer", UNIT_NAME));
    tokio::fs::write(&service, render_service(root, exe)).await?;
    tokio::fs::write(&timer, render_timer()).await?;
    Ok((service, timer))
}

/// 写入单元文件并启用定时器
///
/// 用户会话不可用时（无 systemd 的设备），单元文件照常写入，启用失败只记录警告。
pub async fn install(root: &RuntimeRoot, exe: &Path) -> Result<(), WatchdogError> {
    let unit_dir = user_unit_dir()
        .ok_or_else(|| WatchdogError::Command("cannot resolve user unit directory".to_string()))?;
    let (_, timer) = write_units(&unit_dir, root, exe).await?;
    info!(path = %timer.display(), "Work queue units written");

    if let Err(e) = systemctl(&["daemon-reload"]).await {
        warn!(error = %e, "systemctl daemon-reload failed");
        return Ok(());
    }
    match systemctl(&["enable", "--now", &format!("{}.timer", UNIT_NAME)]).await {
        Ok(()) => info!("Work queue timer enabled"),
        Err(e) => warn!(error = %e, "Failed to enable work queue timer"),
    }
    Ok(())
}

/// 停用定时器并删除单元文件
pub async fn uninstall() -> Result<(), WatchdogError> {
    let unit_dir = user_unit_dir()
        .ok_or_else(|| WatchdogError::Command("cannot resolve user unit directory".to_string()))?;

    if let Err(e) = systemctl(&["disable", "--now", &format!("{}.timer", UNIT_NAME)]).await {
        warn!(error = %e, "Failed to disable work queue timer");
    }
    let removed = remove_units(&unit_dir).await?;
    if removed > 0 {
        if let Err(e) = systemctl(&["daemon-reload"]).await {
            warn!(error = %e, "systemctl daemon-reload failed");
        }
        info!(removed, "Work queue units removed");
    }
    Ok(())
}

/// 删除单元文件，返回实际删除的数量
pub async fn remove_units(unit_dir: &Path) -> Result<usize, WatchdogError> {
    let mut removed = 0;
    for ext in ["timer", "service"] {
        let path = unit_dir.join(format!("{}.{}", UNIT_NAME, ext));
        match tokio::fs::remove_file(&path).await {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(removed)
}

async fn systemctl(args: &[&str]) -> Result<(), WatchdogError> {
    let output = Command::new("systemctl")
        .arg("--user")
        .args(args)
        .output()
        .await
        .map_err(|e| WatchdogError::Command(format!("systemctl: {}", e)))?;
    if !output.status.success() {
        return Err(WatchdogError::Command(format!(
            "systemctl --user {} exited with {}: {}",
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}
