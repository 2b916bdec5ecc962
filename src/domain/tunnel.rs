//! 隧道 (frpc) 相关领域模型
//!
//! 纯数据类型，无 tokio/axum 依赖

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// frpc 启动配置
///
/// 每次启动都重新生成，写入磁盘后不再修改。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub server_addr: String,
    pub server_port: u16,
    pub auth_token: String,
    pub local_port: u16,
    pub remote_port: u16,
    /// 设备名
    pub name: String,
}

impl TunnelConfig {
    /// 代理段名
    pub fn section_name(&self) -> String {
        format!("{}_adb", self.name)
    }

    /// 生成 ini 格式配置（相同输入总是得到相同输出）
    pub fn to_ini(&self) -> String {
        let mut out = String::new();
        out.push_str("[common]\n");
        out.push_str(&format!("server_addr = {}\n", self.server_addr));
        out.push_str(&format!("server_port = {}\n", self.server_port));
        out.push_str(&format!("token = {}\n", self.auth_token));
        out.push('\n');

        out.push_str(&format!("[{}]\n", self.section_name()));
        out.push_str("type = tcp\n");
        out.push_str("local_ip = 127.0.0.1\n");
        out.push_str(&format!("local_port = {}\n", self.local_port));
        out.push_str(&format!("remote_port = {}\n", self.remote_port));

        out
    }

    /// 从 ini 文本解析
    ///
    /// 只识别 `[common]` 和第一个 `*_adb` 代理段。
    pub fn parse_ini(text: &str) -> Result<Self, ConfigError> {
        let mut section = String::new();
        let mut server_addr = None;
        let mut server_port = None;
        let mut auth_token = None;
        let mut local_port = None;
        let mut remote_port = None;
        let mut name = None;

        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(inner) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                section = inner.trim().to_string();
                if name.is_none() {
                    if let Some(device) = section.strip_suffix("_adb") {
                        name = Some(device.to_string());
                    }
                }
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::Parse(format!("malformed line: {}", line)));
            };
            let (key, value) = (key.trim(), value.trim());

            if section == "common" {
                match key {
                    "server_addr" => server_addr = Some(value.to_string()),
                    "server_port" => server_port = Some(parse_port(key, value)?),
                    "token" => auth_token = Some(value.to_string()),
                    _ => {}
                }
            } else if section.ends_with("_adb") && name.as_deref() == section.strip_suffix("_adb") {
                match key {
                    "local_port" => local_port = Some(parse_port(key, value)?),
                    "remote_port" => remote_port = Some(parse_port(key, value)?),
                    _ => {}
                }
            }
        }

        let missing = |field: &str| ConfigError::Parse(format!("missing {}", field));
        Ok(Self {
            server_addr: server_addr.ok_or_else(|| missing("server_addr"))?,
            server_port: server_port.ok_or_else(|| missing("server_port"))?,
            auth_token: auth_token.unwrap_or_default(),
            local_port: local_port.ok_or_else(|| missing("local_port"))?,
            remote_port: remote_port.ok_or_else(|| missing("remote_port"))?,
            name: name.ok_or_else(|| missing("proxy section"))?,
        })
    }
}

fn parse_port(key: &str, value: &str) -> Result<u16, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::Parse(format!("invalid {}: {}", key, value)))
}

/// 隧道运行状态（用于状态广播）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    Running,
    Stopped,
}
