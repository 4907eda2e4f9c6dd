use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path, time::Duration};
use tokio::fs;
use tracing::warn;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct KernelConfig {
    #[serde(default)]
    pub listen: ListenConf,
    #[serde(default)]
    pub streams: StreamConf,
    #[serde(default)]
    pub session: SessionConf,
    /// Inventaire des équipements surveillés, indexé par id
    #[serde(default)]
    pub devices: HashMap<i64, DeviceConf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ListenConf {
    pub addr: String,
}

impl Default for ListenConf {
    fn default() -> Self {
        Self { addr: "0.0.0.0:8080".into() }
    }
}

/// Cadences des deux classes de flux : vue détaillée d'un équipement
/// et vue d'ensemble de la flotte (dashboard).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StreamConf {
    pub live_interval_secs: u64,
    pub dashboard_interval_secs: u64,
    /// Nombre max d'interfaces par snapshot streamé (les suivantes sont omises)
    pub max_interfaces: usize,
}

impl Default for StreamConf {
    fn default() -> Self {
        Self {
            live_interval_secs: 3,
            dashboard_interval_secs: 5,
            max_interfaces: 10,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SessionConf {
    pub connect_timeout_secs: u64,
    pub command_timeout_secs: u64,
}

impl Default for SessionConf {
    fn default() -> Self {
        Self { connect_timeout_secs: 5, command_timeout_secs: 10 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DeviceConf {
    pub name: String,
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    pub username: String,
    /// Secret chiffré par le Vault (base64), jamais le mot de passe en clair
    pub encrypted_secret: String,
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default = "default_device_type")]
    pub device_type: String,
    #[serde(default)]
    pub model: Option<String>,
}

fn default_api_port() -> u16 {
    8728
}

fn default_device_type() -> String {
    "router".into()
}

impl StreamConf {
    pub fn live_interval(&self) -> Duration {
        Duration::from_secs(self.live_interval_secs)
    }

    pub fn dashboard_interval(&self) -> Duration {
        Duration::from_secs(self.dashboard_interval_secs)
    }
}

impl SessionConf {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("MIRADOR_KERNEL_CONFIG").unwrap_or_else(|_| "mirador.yaml".into());
    if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        if txt.trim().is_empty() {
            return KernelConfig::default();
        }
        serde_yaml::from_str(&txt).unwrap_or_else(|e| {
            warn!("config invalide ({path}): {e}");
            KernelConfig::default()
        })
    } else {
        warn!("pas de {path}, usage config par défaut");
        KernelConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_config() {
        let yaml = r#"
listen:
  addr: "127.0.0.1:9090"
streams:
  live_interval_secs: 2
  dashboard_interval_secs: 7
  max_interfaces: 4
session:
  connect_timeout_secs: 3
  command_timeout_secs: 6
devices:
  7:
    name: "edge-gw"
    host: "10.0.0.1"
    username: "api"
    encrypted_secret: "AAAA"
    device_type: "router"
    model: "hEX S"
"#;
        let cfg: KernelConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.listen.addr, "127.0.0.1:9090");
        assert_eq!(cfg.streams.live_interval(), Duration::from_secs(2));
        assert_eq!(cfg.streams.max_interfaces, 4);
        assert_eq!(cfg.session.command_timeout(), Duration::from_secs(6));
        let dev = cfg.devices.get(&7).unwrap();
        assert_eq!(dev.port, 8728);
        assert!(!dev.use_tls);
        assert_eq!(dev.model.as_deref(), Some("hEX S"));
    }

    #[test]
    fn defaults_when_sections_missing() {
        let cfg: KernelConfig = serde_yaml::from_str("devices: {}").unwrap();
        assert_eq!(cfg.streams.live_interval_secs, 3);
        assert_eq!(cfg.streams.dashboard_interval_secs, 5);
        assert_eq!(cfg.streams.max_interfaces, 10);
        assert_eq!(cfg.session.connect_timeout_secs, 5);
        assert_eq!(cfg.listen.addr, "0.0.0.0:8080");
    }
}
