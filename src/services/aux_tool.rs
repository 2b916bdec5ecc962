//! 辅助工具安装
//!
//! 把随包分发的辅助二进制放到固定的设备路径。所有步骤都经过执行器，
//! 因此与隧道进程处于相同的受限环境。

use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::env::AuxToolConfig;
use crate::error::AuxToolError;
use crate::infra::command::shell_quote;
use crate::infra::Executor;

const STEP_TIMEOUT: Duration = Duration::from_secs(15);

pub struct AuxToolInstaller {
    executor: Executor,
    config: AuxToolConfig,
    asset_path: PathBuf,
}

impl AuxToolInstaller {
    pub fn new(executor: Executor, config: AuxToolConfig, assets_dir: PathBuf) -> Self {
        let asset_path = assets_dir.join(&config.asset_name);
        Self {
            executor,
            config,
            asset_path,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// 目标文件存在且大小不小于下限
    pub async fn is_installed(&self) -> bool {
        let path = shell_quote(&self.config.device_path.to_string_lossy());
        let cmd = format!("test -f {p} && stat -c %s {p}", p = path);
        match self.executor.execute(&cmd, None, STEP_TIMEOUT).await {
            Ok(r) if r.success() => r
                .output
                .trim()
                .parse::<u64>()
                .map(|size| size >= self.config.min_size)
                .unwrap_or(false),
            Ok(_) => false,
            Err(e) => {
                debug!(error = %e, "Aux tool check failed");
                false
            }
        }
    }

    /// 未安装时安装，返回是否执行了安装
    pub async fn ensure_installed(&self) -> Result<bool, AuxToolError> {
        if self.is_installed().await {
            debug!(path = %self.config.device_path.display(), "Aux tool already installed");
            return Ok(false);
        }
        self.install().await?;
        Ok(true)
    }

    pub async fn install(&self) -> Result<(), AuxToolError> {
        if !tokio::fs::try_exists(&self.asset_path).await.unwrap_or(false) {
            return Err(AuxToolError::AssetMissing(self.asset_path.clone()));
        }

        let staging = self
            .executor
            .root()
            .home_dir()
            .join(format!(".{}.staging", self.config.asset_name));
        tokio::fs::copy(&self.asset_path, &staging).await?;

        let result = self.install_from(&staging).await;

        if let Err(e) = tokio::fs::remove_file(&staging).await {
            warn!(path = %staging.display(), error = %e, "Failed to remove staging file");
        }
        result?;

        info!(path = %self.config.device_path.display(), "Aux tool installed");
        Ok(())
    }

    async fn install_from(&self, staging: &std::path::Path) -> Result<(), AuxToolError> {
        let src = shell_quote(&staging.to_string_lossy());
        let dst = shell_quote(&self.config.device_path.to_string_lossy());

        self.step("copy", format!("cp {} {}", src, dst)).await?;
        self.step("chmod", format!("chmod 755 {}", dst)).await?;

        if !self.is_installed().await {
            return Err(AuxToolError::VerifyFailed);
        }
        Ok(())
    }

    pub async fn uninstall(&self) -> Result<(), AuxToolError> {
        let dst = shell_quote(&self.config.device_path.to_string_lossy());
        self.step("remove", format!("rm -f {}", dst)).await?;
        info!(path = %self.config.device_path.display(), "Aux tool removed");
        Ok(())
    }

    async fn step(&self, step: &'static str, command: String) -> Result<(), AuxToolError> {
        let result = self.executor.execute(&command, None, STEP_TIMEOUT).await?;
        if !result.success() {
            return Err(AuxToolError::StepFailed {
                step,
                code: result.exit_code,
                output: result.output,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::RuntimeRoot;

    async fn installer(dir: &tempfile::TempDir, asset: Option<&[u8]>) -> AuxToolInstaller {
        let root = RuntimeRoot::new(dir.path().join("rt"));
        root.init().await.unwrap();

        let assets = dir.path().join("assets");
        std::fs::create_dir_all(&assets).unwrap();
        if let Some(bytes) = asset {
            std::fs::write(assets.join("yadb"), bytes).unwrap();
        }

        let config = AuxToolConfig {
            enabled: true,
            asset_name: "yadb".to_string(),
            device_path: dir.path().join("device/yadb"),
            min_size: 64,
        };
        std::fs::create_dir_all(dir.path().join("device")).unwrap();
        AuxToolInstaller::new(Executor::new(root), config, assets)
    }

    #[tokio::test]
    async fn test_install_then_uninstall() {
        let dir = tempfile::tempdir().unwrap();
        let tool = installer(&dir, Some(&[7u8; 128])).await;

        assert!(!tool.is_installed().await);
        assert!(tool.ensure_installed().await.unwrap());
        assert!(tool.is_installed().await);
        assert!(!tool.ensure_installed().await.unwrap());

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(dir.path().join("device/yadb"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
        assert!(!dir.path().join("rt/home/.yadb.staging").exists());

        tool.uninstall().await.unwrap();
        assert!(!tool.is_installed().await);
    }

    #[tokio::test]
    async fn test_undersized_asset_fails_verification() {
        let dir = tempfile::tempdir().unwrap();
        let tool = installer(&dir, Some(&[1u8; 10])).await;
        assert!(matches!(tool.install().await, Err(AuxToolError::VerifyFailed)));
    }

    #[tokio::test]
    async fn test_missing_asset() {
        let dir = tempfile::tempdir().unwrap();
        let tool = installer(&dir, None).await;
        assert!(matches!(tool.install().await, Err(AuxToolError::AssetMissing(_))));
    }
}
