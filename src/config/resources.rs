//! 外部二进制资源描述
//!
//! 下载地址按 CPU 架构选择，最小大小用于拦截截断或错误页面。

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::env::ProvisionSettings;
use crate::error::ProvisionError;

/// frp 版本
pub const FRP_VERSION: &str = "0.65.0";

/// 从网络下载的 frpc 最小大小（10MB）
pub const MIN_FRP_SIZE: u64 = 10 * 1024 * 1024;

/// 资源加载策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadStrategy {
    /// 仅使用随包资源
    Assets,
    /// 仅从网络下载
    Network,
    /// 优先随包资源，失败后下载
    Hybrid,
}

impl FromStr for LoadStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "assets" | "from_assets" => Ok(Self::Assets),
            "network" | "from_oss" | "oss" => Ok(Self::Network),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(format!("unknown load strategy: {}", other)),
        }
    }
}

impl fmt::Display for LoadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Assets => "assets",
            Self::Network => "network",
            Self::Hybrid => "hybrid",
        };
        f.write_str(s)
    }
}

/// 待安装的可执行资源
#[derive(Debug, Clone)]
pub struct Artifact {
    /// 在 bin/ 中的程序名
    pub name: String,
    pub url: String,
    /// 随包资源的完整路径
    pub asset_path: PathBuf,
    pub min_size: u64,
    pub sha256: Option<String>,
    pub strategy: LoadStrategy,
}

/// 当前进程运行的架构
pub fn current_arch() -> &'static str {
    std::env::consts::ARCH
}

/// 架构名到下载包后缀的映射
pub fn arch_suffix(arch: &str) -> Result<&'static str, ProvisionError> {
    match arch {
        "aarch64" | "arm64" => Ok("arm64"),
        "arm" | "armv7" => Ok("arm"),
        "x86_64" | "amd64" => Ok("amd64"),
        other => Err(ProvisionError::UnsupportedArch(other.to_string())),
    }
}

/// 构建 frpc 资源描述
pub fn frpc_artifact(settings: &ProvisionSettings, arch: &str) -> Result<Artifact, ProvisionError> {
    let suffix = arch_suffix(arch)?;
    let base = settings.base_url.trim_end_matches('/');
    Ok(Artifact {
        name: "frpc".to_string(),
        url: format!("{}/packages/frp_{}_linux_{}_frpc", base, FRP_VERSION, suffix),
        asset_path: settings.assets_dir.join(format!("frpc-{}", suffix)),
        min_size: MIN_FRP_SIZE,
        sha256: settings.frpc_sha256.clone(),
        strategy: settings.strategy,
    })
}
