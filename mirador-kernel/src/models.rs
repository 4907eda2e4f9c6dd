use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Ressources système brutes telles que renvoyées par l'équipement
/// (`/system/resource/print`), avant calcul des champs dérivés.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemResources {
    pub cpu_load: u32,
    pub free_memory: u64,
    pub total_memory: u64,
    pub uptime: String,
    pub version: String,
    pub board_name: String,
}

/// Bloc système d'un snapshot, champs dérivés inclus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemTelemetry {
    pub cpu_load_percent: u32,
    pub memory_free_bytes: u64,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub memory_percent: f64,
    pub uptime: String,
    pub version: String,
    pub board_name: String,
}

impl SystemTelemetry {
    /// Dérive used = total - free et le pourcentage arrondi à 1 décimale.
    /// Un total nul donne 0.0, jamais une division par zéro.
    pub fn derive(res: &SystemResources) -> Self {
        let used = res.total_memory.saturating_sub(res.free_memory);
        let percent = if res.total_memory > 0 {
            ((used as f64 / res.total_memory as f64) * 1000.0).round() / 10.0
        } else {
            0.0
        };
        Self {
            cpu_load_percent: res.cpu_load,
            memory_free_bytes: res.free_memory,
            memory_used_bytes: used,
            memory_total_bytes: res.total_memory,
            memory_percent: percent,
            uptime: res.uptime.clone(),
            version: res.version.clone(),
            board_name: res.board_name.clone(),
        }
    }
}

/// Compteurs d'une interface réseau (`/interface/print`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceTelemetry {
    pub name: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
    pub rx_drops: u64,
    pub tx_drops: u64,
}

/// Bail DHCP (`/ip/dhcp-server/lease/print`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhcpLease {
    pub address: String,
    pub mac_address: String,
    pub host_name: String,
    pub status: String,
}

/// Adresse IP configurée (`/ip/address/print`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpAddress {
    pub address: String,
    pub network: String,
    pub interface: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
    Ok,
    Error,
}

/// Capture ponctuelle de télémétrie pour un équipement. Immuable une fois
/// construite ; consommée par zéro ou plusieurs observateurs, jamais persistée.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub device_id: i64,
    pub device_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub captured_at: OffsetDateTime,
    pub status: SnapshotStatus,
    pub system: Option<SystemTelemetry>,
    pub interfaces: Vec<InterfaceTelemetry>,
    pub error: Option<String>,
}

impl TelemetrySnapshot {
    pub fn ok(
        device_id: i64,
        device_name: String,
        system: SystemTelemetry,
        interfaces: Vec<InterfaceTelemetry>,
    ) -> Self {
        Self {
            device_id,
            device_name,
            captured_at: OffsetDateTime::now_utc(),
            status: SnapshotStatus::Ok,
            system: Some(system),
            interfaces,
            error: None,
        }
    }

    pub fn failure(device_id: i64, device_name: String, message: String) -> Self {
        Self {
            device_id,
            device_name,
            captured_at: OffsetDateTime::now_utc(),
            status: SnapshotStatus::Error,
            system: None,
            interfaces: Vec::new(),
            error: Some(message),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == SnapshotStatus::Ok
    }

    /// Horodatage au format RFC3339 pour les trames sortantes
    pub fn timestamp(&self) -> String {
        self.captured_at.format(&Rfc3339).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resources(total: u64, free: u64) -> SystemResources {
        SystemResources {
            cpu_load: 12,
            free_memory: free,
            total_memory: total,
            uptime: "1w2d3h4m5s".into(),
            version: "7.14.2".into(),
            board_name: "hEX S".into(),
        }
    }

    #[test]
    fn memory_derivation() {
        let sys = SystemTelemetry::derive(&resources(1_073_741_824, 268_435_456));
        assert_eq!(sys.memory_used_bytes, 805_306_368);
        assert_eq!(sys.memory_percent, 75.0);
        assert_eq!(sys.memory_total_bytes, 1_073_741_824);
    }

    #[test]
    fn memory_percent_rounds_to_one_decimal() {
        let sys = SystemTelemetry::derive(&resources(3_000_000, 1_000_000));
        assert_eq!(sys.memory_percent, 66.7);
    }

    #[test]
    fn zero_total_memory_guarded() {
        let sys = SystemTelemetry::derive(&resources(0, 0));
        assert_eq!(sys.memory_used_bytes, 0);
        assert_eq!(sys.memory_percent, 0.0);
    }

    #[test]
    fn error_snapshot_carries_message() {
        let snap = TelemetrySnapshot::failure(7, "edge-gw".into(), "connection timed out".into());
        assert!(!snap.is_ok());
        assert!(snap.system.is_none());
        assert!(snap.interfaces.is_empty());
        assert_eq!(snap.error.as_deref(), Some("connection timed out"));
    }
}
