//! 定时触发（B 层）
//!
//! 通过用户 crontab 每 15 分钟执行一次 `tick --source scheduler`，
//! 并在开机时执行一次。条目带标记注释，重复安装不会产生重复行。

use std::path::Path;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::WatchdogError;
use crate::infra::command::shell_quote;
use crate::infra::RuntimeRoot;

pub const MARKER: &str = "# relay-agent watchdog";

/// 生成 crontab 条目（每行以标记结尾）
pub fn render_entries(root: &RuntimeRoot, exe: &Path) -> Vec<String> {
    let command = format!(
        "RELAY_AGENT_ROOT={} {} tick --source scheduler >/dev/null 2>&1",
        shell_quote(&root.path().to_string_lossy()),
        shell_quote(&exe.to_string_lossy()),
    );
    vec![
        format!("*/15 * * * * {} {}", command, MARKER),
        format!("@reboot {} {}", command, MARKER),
    ]
}

/// 删除旧的带标记条目后追加新条目，其它行保持原样
pub fn merge_crontab(existing: &str, entries: &[String]) -> String {
    let mut lines: Vec<&str> = existing
        .lines()
        .filter(|l| !l.trim_end().ends_with(MARKER))
        .collect();
    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }

    let mut out = String::new();
    for line in lines {
        out.push_str(line);
        out.push('\n');
    }
    for entry in entries {
        out.push_str(entry);
        out.push('\n');
    }
    out
}

/// 删除所有带标记条目
pub fn strip_entries(existing: &str) -> String {
    merge_crontab(existing, &[])
}

pub async fn install(root: &RuntimeRoot, exe: &Path) -> Result<(), WatchdogError> {
    let existing = read_crontab().await?;
    let merged = merge_crontab(&existing, &render_entries(root, exe));
    if merged == existing {
        debug!("Crontab already up to date");
        return Ok(());
    }
    write_crontab(&merged).await?;
    info!("Scheduler entries installed");
    Ok(())
}

pub async fn uninstall() -> Result<(), WatchdogError> {
    let existing = read_crontab().await?;
    let stripped = strip_entries(&existing);
    if stripped != existing {
        write_crontab(&stripped).await?;
        info!("Scheduler entries removed");
    }
    Ok(())
}

/// `crontab -l`；没有 crontab 时视为空
async fn read_crontab() -> Result<String, WatchdogError> {
    let output = Command::new("crontab")
        .arg("-l")
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| WatchdogError::Command(format!("crontab -l: {}", e)))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        debug!(
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "crontab -l returned non-zero, treating as empty"
        );
        Ok(String::new())
    }
}

async fn write_crontab(content: &str) -> Result<(), WatchdogError> {
    let mut child = Command::new("crontab")
        .arg("-")
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| WatchdogError::Command(format!("crontab -: {}", e)))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(content.as_bytes()).await?;
        stdin.shutdown().await?;
    }

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        return Err(WatchdogError::Command(format!(
            "crontab - exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}
