//! 设备信息采集（注册消息使用）

use std::path::Path;

use sysinfo::System;

use crate::config::env::ChannelSettings;
use crate::domain::channel::DeviceSpecs;

pub fn collect_device_specs(settings: &ChannelSettings) -> DeviceSpecs {
    DeviceSpecs {
        device_id: settings.device_id.clone(),
        frp_port: settings.remote_port,
        device_name: settings.device_name.clone(),
        device_type: settings.device_type.clone(),
        model: device_model(),
        os_version: System::os_version().unwrap_or_else(|| "unknown".to_string()),
        screen_resolution: settings.screen_resolution.clone(),
        battery: battery_level(Path::new("/sys/class/power_supply")),
        network: network_type(Path::new("/sys/class/net")),
    }
}

fn device_model() -> String {
    std::fs::read_to_string("/sys/class/dmi/id/product_name")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(System::host_name)
        .unwrap_or_else(|| "unknown".to_string())
}

/// 没有电池的设备视为 100
fn battery_level(power_supply: &Path) -> u8 {
    let Ok(entries) = std::fs::read_dir(power_supply) else {
        return 100;
    };
    entries
        .flatten()
        .filter_map(|e| std::fs::read_to_string(e.path().join("capacity")).ok())
        .find_map(|s| s.trim().parse::<u8>().ok())
        .map(|v| v.min(100))
        .unwrap_or(100)
}

/// 根据处于 up 状态的网卡推断网络类型
fn network_type(net: &Path) -> String {
    let Ok(entries) = std::fs::read_dir(net) else {
        return "unknown".to_string();
    };

    let mut found = None;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if name == "lo" {
            continue;
        }
        let up = std::fs::read_to_string(entry.path().join("operstate"))
            .map(|s| s.trim() == "up")
            .unwrap_or(false);
        if !up {
            continue;
        }

        let kind = if entry.path().join("wireless").exists() || name.starts_with("wl") {
            "wifi"
        } else if name.starts_with("rmnet") || name.starts_with("wwan") || name.starts_with("ccmni") {
            "cellular"
        } else {
            "ethernet"
        };
        // wifi 优先
        if kind == "wifi" {
            return kind.to_string();
        }
        found.get_or_insert(kind);
    }

    found.unwrap_or("unknown").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(root: &Path, name: &str, state: &str, wireless: bool) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("operstate"), format!("{}\n", state)).unwrap();
        if wireless {
            std::fs::create_dir_all(dir.join("wireless")).unwrap();
        }
    }

    #[test]
    fn test_network_type_prefers_wifi() {
        let dir = tempfile::tempdir().unwrap();
        iface(dir.path(), "lo", "unknown", false);
        iface(dir.path(), "eth0", "up", false);
        assert_eq!(network_type(dir.path()), "ethernet");

        iface(dir.path(), "wlan0", "up", true);
        assert_eq!(network_type(dir.path()), "wifi");
    }

    #[test]
    fn test_network_type_down_or_missing() {
        let dir = tempfile::tempdir().unwrap();
        iface(dir.path(), "eth0", "down", false);
        assert_eq!(network_type(dir.path()), "unknown");
        assert_eq!(network_type(&dir.path().join("nope")), "unknown");
    }

    #[test]
    fn test_battery_level() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(battery_level(dir.path()), 100);

        let bat = dir.path().join("BAT0");
        std::fs::create_dir_all(&bat).unwrap();
        std::fs::write(bat.join("capacity"), "57\n").unwrap();
        assert_eq!(battery_level(dir.path()), 57);
    }
}
