//! 环境变量配置加载

use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::warn;

use crate::config::resources::LoadStrategy;
use crate::domain::tunnel::TunnelConfig;

/// 环境配置
#[derive(Clone, Debug)]
pub struct EnvConfig {
    /// 本地控制接口的 API 密钥
    pub api_key: String,
    /// 本地控制接口端口（仅监听 127.0.0.1）
    pub control_port: u16,
    /// 运行时根目录
    pub runtime_root: PathBuf,
    /// 开机后是否自动启动编排器
    pub auto_start: bool,
    pub tunnel: TunnelSettings,
    pub channel: ChannelSettings,
    pub provision: ProvisionSettings,
    pub aux_tool: AuxToolConfig,
    pub watchdog: WatchdogSettings,
}

impl EnvConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Self {
        let api_key = env::var("RELAY_AGENT_API_KEY")
            .unwrap_or_else(|_| "change-me-in-production".to_string());

        let control_port = env_parse("RELAY_AGENT_PORT", 9877);

        let runtime_root = env::var("RELAY_AGENT_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_runtime_root());

        let auto_start = env_flag("RELAY_AGENT_AUTO_START", true);

        let tunnel = TunnelSettings::from_env();
        let channel = ChannelSettings::from_env(&tunnel);

        Self {
            api_key,
            control_port,
            runtime_root,
            auto_start,
            tunnel,
            channel,
            provision: ProvisionSettings::from_env(),
            aux_tool: AuxToolConfig::from_env(),
            watchdog: WatchdogSettings::from_env(),
        }
    }

    /// 先读取 `<root>/agent.env` 再从环境变量加载
    ///
    /// 定时任务与 systemd 触发时没有交互式 shell 的环境，靠这个文件拿到配置。
    pub fn load() -> Self {
        let root = env::var("RELAY_AGENT_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_runtime_root());
        match load_env_file(&env_file_path(&root)) {
            Ok(n) if n > 0 => tracing::debug!(count = n, "Loaded variables from env file"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to read env file"),
        }
        Self::from_env()
    }

    pub fn env_file(&self) -> PathBuf {
        env_file_path(&self.runtime_root)
    }

    /// 隧道是否已配置（服务器地址非空）
    pub fn is_configured(&self) -> bool {
        !self.tunnel.server_addr.is_empty()
    }
}

/// frpc 隧道配置
#[derive(Clone, Debug)]
pub struct TunnelSettings {
    pub server_addr: String,
    pub server_port: u16,
    pub token: String,
    pub local_port: u16,
    pub remote_port: u16,
    /// 设备名，用于生成代理段名 `[<name>_adb]`
    pub device_name: String,
    pub startup_timeout_secs: u64,
    pub settle_ms: u64,
    pub replace_grace_ms: u64,
    /// frpc 二进制的最小可接受大小
    pub min_binary_size: u64,
    /// 启动前检查本地端口是否处于监听状态
    pub check_local_port: bool,
}

impl TunnelSettings {
    pub fn from_env() -> Self {
        let server_addr = env::var("FRP_SERVER_ADDR").unwrap_or_default();
        let server_port = env_parse("FRP_SERVER_PORT", constants::DEFAULT_FRP_PORT);
        let token = env::var("FRP_TOKEN").unwrap_or_default();
        if token.is_empty() && !server_addr.is_empty() {
            warn!("FRP_TOKEN is empty, frps may reject the login");
        }

        let device_name = env::var("DEVICE_NAME").unwrap_or_else(|_| {
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "device".to_string())
        });

        Self {
            server_addr,
            server_port,
            token,
            local_port: env_parse("FRP_LOCAL_PORT", constants::DEFAULT_LOCAL_PORT),
            remote_port: env_parse("FRP_REMOTE_PORT", constants::DEFAULT_REMOTE_PORT),
            device_name,
            startup_timeout_secs: env_parse(
                "FRP_STARTUP_TIMEOUT_SECS",
                constants::FRP_STARTUP_TIMEOUT_SECS,
            ),
            settle_ms: env_parse("FRP_SETTLE_MS", 2000),
            replace_grace_ms: env_parse("FRP_REPLACE_GRACE_MS", 1000),
            min_binary_size: env_parse("FRP_MIN_BINARY_SIZE", 1_000_000),
            check_local_port: env_flag("FRP_CHECK_LOCAL_PORT", true),
        }
    }

    /// 生成本次启动使用的隧道配置
    pub fn to_tunnel_config(&self) -> TunnelConfig {
        TunnelConfig {
            server_addr: self.server_addr.clone(),
            server_port: self.server_port,
            auth_token: self.token.clone(),
            local_port: self.local_port,
            remote_port: self.remote_port,
            name: self.device_name.clone(),
        }
    }
}

/// 控制通道（WebSocket）配置
#[derive(Clone, Debug)]
pub struct ChannelSettings {
    pub enabled: bool,
    pub url: String,
    pub device_id: String,
    pub device_name: String,
    pub device_type: String,
    pub remote_port: u16,
    pub screen_resolution: String,
    pub connect_timeout_secs: u64,
    pub ping_interval_secs: u64,
    pub reconnect_delay_secs: u64,
}

impl ChannelSettings {
    pub fn from_env(tunnel: &TunnelSettings) -> Self {
        // 未显式配置时回落到 ws://<frps 地址>:9999
        let url = env::var("CHANNEL_URL").unwrap_or_else(|_| {
            format!(
                "ws://{}:{}",
                if tunnel.server_addr.is_empty() {
                    "127.0.0.1"
                } else {
                    tunnel.server_addr.as_str()
                },
                constants::DEFAULT_WS_PORT
            )
        });

        let device_id = env::var("DEVICE_ID")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| format!("device_{}", tunnel.remote_port));

        Self {
            enabled: env_flag("CHANNEL_ENABLED", true),
            url,
            device_id,
            device_name: tunnel.device_name.clone(),
            device_type: env::var("DEVICE_TYPE").unwrap_or_else(|_| "linux".to_string()),
            remote_port: tunnel.remote_port,
            screen_resolution: env::var("SCREEN_RESOLUTION")
                .unwrap_or_else(|_| "unknown".to_string()),
            connect_timeout_secs: env_parse(
                "CHANNEL_CONNECT_TIMEOUT_SECS",
                constants::WEBSOCKET_CONNECT_TIMEOUT_SECS,
            ),
            ping_interval_secs: env_parse("CHANNEL_PING_INTERVAL_SECS", constants::PING_INTERVAL_SECS),
            reconnect_delay_secs: env_parse(
                "CHANNEL_RECONNECT_DELAY_SECS",
                constants::RECONNECT_DELAY_SECS,
            ),
        }
    }
}

/// 资源下载与安装配置
#[derive(Clone, Debug)]
pub struct ProvisionSettings {
    pub strategy: LoadStrategy,
    pub base_url: String,
    /// 随包分发的资源目录
    pub assets_dir: PathBuf,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub max_retry: u32,
    pub retry_base_ms: u64,
    pub frpc_sha256: Option<String>,
}

impl ProvisionSettings {
    pub fn from_env() -> Self {
        let strategy = env::var("RESOURCE_STRATEGY")
            .ok()
            .and_then(|v| LoadStrategy::from_str(&v).ok())
            .unwrap_or(LoadStrategy::Hybrid);

        let assets_dir = env::var("RESOURCE_ASSETS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/usr/share/relay-agent/assets"));

        Self {
            strategy,
            base_url: env::var("RESOURCE_BASE_URL")
                .unwrap_or_else(|_| constants::DEFAULT_RESOURCE_BASE_URL.to_string()),
            assets_dir,
            connect_timeout_secs: env_parse("RESOURCE_CONNECT_TIMEOUT_SECS", 30),
            read_timeout_secs: env_parse("RESOURCE_READ_TIMEOUT_SECS", 120),
            max_retry: env_parse("RESOURCE_MAX_RETRY", 3),
            retry_base_ms: env_parse("RESOURCE_RETRY_BASE_MS", 2000),
            frpc_sha256: env::var("FRPC_SHA256").ok().filter(|s| !s.is_empty()),
        }
    }
}

/// 辅助工具安装配置
#[derive(Clone, Debug)]
pub struct AuxToolConfig {
    pub enabled: bool,
    /// 资源目录中的文件名
    pub asset_name: String,
    /// 安装目标路径
    pub device_path: PathBuf,
    pub min_size: u64,
}

impl AuxToolConfig {
    pub fn from_env() -> Self {
        Self {
            enabled: env_flag("AUX_TOOL_ENABLED", false),
            asset_name: env::var("AUX_TOOL_ASSET").unwrap_or_else(|_| "yadb".to_string()),
            device_path: env::var("AUX_TOOL_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/data/local/tmp/yadb")),
            min_size: env_parse("AUX_TOOL_MIN_SIZE", 50 * 1024),
        }
    }
}

/// 看门狗与循环周期配置
#[derive(Clone, Debug)]
pub struct WatchdogSettings {
    pub guard_interval_secs: u64,
    pub health_interval_secs: u64,
    pub status_interval_secs: u64,
    pub tick_backoff_secs: u64,
    pub tick_attempts: u32,
}

impl WatchdogSettings {
    pub fn from_env() -> Self {
        Self {
            guard_interval_secs: env_parse("GUARD_INTERVAL_SECS", 10),
            health_interval_secs: env_parse(
                "HEALTH_INTERVAL_SECS",
                constants::HEALTH_CHECK_INTERVAL_SECS,
            ),
            status_interval_secs: env_parse(
                "STATUS_INTERVAL_SECS",
                constants::STATUS_UPDATE_INTERVAL_SECS,
            ),
            tick_backoff_secs: env_parse("TICK_BACKOFF_SECS", 10),
            tick_attempts: env_parse("TICK_ATTEMPTS", 3),
        }
    }
}

/// 持久化到 env 文件的变量
const PERSISTED_KEYS: &[&str] = &[
    "RELAY_AGENT_API_KEY",
    "RELAY_AGENT_PORT",
    "RELAY_AGENT_ROOT",
    "RELAY_AGENT_AUTO_START",
    "FRP_SERVER_ADDR",
    "FRP_SERVER_PORT",
    "FRP_TOKEN",
    "FRP_LOCAL_PORT",
    "FRP_REMOTE_PORT",
    "DEVICE_NAME",
    "DEVICE_ID",
    "DEVICE_TYPE",
    "SCREEN_RESOLUTION",
    "CHANNEL_URL",
    "CHANNEL_ENABLED",
    "RESOURCE_STRATEGY",
    "RESOURCE_BASE_URL",
    "RESOURCE_ASSETS_DIR",
    "FRPC_SHA256",
    "AUX_TOOL_ENABLED",
    "AUX_TOOL_PATH",
    "RUST_LOG",
];

pub fn env_file_path(root: &Path) -> PathBuf {
    root.join("agent.env")
}

/// 读取 `KEY=VALUE` 格式的文件，已存在的环境变量不会被覆盖
///
/// 文件不存在时返回 0。
pub fn load_env_file(path: &Path) -> std::io::Result<usize> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut loaded = 0;
    for (key, value) in parse_env_lines(&content) {
        if env::var_os(&key).is_none() {
            env::set_var(&key, value);
            loaded += 1;
        }
    }
    Ok(loaded)
}

/// 把当前进程中已设置的配置变量写入 env 文件
pub fn snapshot_env_file(path: &Path) -> std::io::Result<usize> {
    let mut out = String::from("# written by relay-agent install-watchdogs\n");
    let mut count = 0;
    for key in PERSISTED_KEYS {
        if let Ok(value) = env::var(key) {
            out.push_str(&format!("{}={}\n", key, value));
            count += 1;
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("env.tmp");
    std::fs::write(&tmp, out)?;
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(count)
}

fn parse_env_lines(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| {
            let l = l.strip_prefix("export ").unwrap_or(l);
            let (k, v) = l.split_once('=')?;
            let k = k.trim();
            if k.is_empty() {
                return None;
            }
            let v = v.trim();
            let v = v
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(v);
            Some((k.to_string(), v.to_string()))
        })
        .collect()
}

fn default_runtime_root() -> PathBuf {
    env::var("HOME")
        .map(|h| PathBuf::from(h).join(".local/share/relay-agent"))
        .unwrap_or_else(|_| PathBuf::from("/var/lib/relay-agent"))
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

/// 常量
pub mod constants {
    /// frps 默认端口
    pub const DEFAULT_FRP_PORT: u16 = 7000;

    /// 控制通道默认端口
    pub const DEFAULT_WS_PORT: u16 = 9999;

    /// 被暴露的本地服务端口
    pub const DEFAULT_LOCAL_PORT: u16 = 5555;

    pub const DEFAULT_REMOTE_PORT: u16 = 6104;

    /// frpc 启动超时（秒）
    pub const FRP_STARTUP_TIMEOUT_SECS: u64 = 30;

    pub const WEBSOCKET_CONNECT_TIMEOUT_SECS: u64 = 10;

    /// WebSocket 传输层 ping 间隔（秒）
    pub const PING_INTERVAL_SECS: u64 = 30;

    /// 控制通道重连延迟（秒），每次重连保持不变
    pub const RECONNECT_DELAY_SECS: u64 = 5;

    pub const STATUS_UPDATE_INTERVAL_SECS: u64 = 5;

    /// 健康检查间隔（秒）
    pub const HEALTH_CHECK_INTERVAL_SECS: u64 = 15;

    /// 隧道日志环形缓冲区最大行数
    pub const MAX_LOG_LINES: usize = 5000;

    pub const DEFAULT_RESOURCE_BASE_URL: &str = "https://resources.relay-agent.dev";

    /// 版本号
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}
