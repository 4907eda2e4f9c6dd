/**
 * DEVICE DIRECTORY - Inventaire des équipements surveillés
 *
 * RÔLE :
 * Résolution id -> paramètres de connexion (hôte, port, identifiants chiffrés)
 * pour les pollers, et vue catalogue pour le dashboard. Le cœur du streaming
 * n'emprunte que des copies ; l'inventaire reste propriété du Directory.
 *
 * FONCTIONNEMENT :
 * - ConfigDirectory : implémentation production adossée au YAML du kernel
 * - Surcouche d'état runtime (is_online / last_seen) alimentée par les
 *   pollers via mark_polled, consultée par la vue flotte
 */
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::config::KernelConfig;

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("device {0} not found")]
    NotFound(i64),
}

/// Paramètres d'un équipement tels que vus par le cœur du streaming.
/// Immuable pendant un cycle de capture.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub id: i64,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub encrypted_secret: String,
    pub use_tls: bool,
    pub device_type: String,
    pub model: Option<String>,
}

/// Vue catalogue pour l'API et la trame dashboard
#[derive(Debug, Clone, Serialize)]
pub struct DeviceView {
    pub id: i64,
    pub name: String,
    pub ip_address: String,
    pub is_online: bool,
    pub device_type: String,
    pub model: Option<String>,
    pub last_seen: Option<String>,
}

#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn get_device(&self, id: i64) -> Result<DeviceRecord, DirectoryError>;
    async fn list_devices(&self) -> Vec<DeviceView>;
    /// Retour d'état d'un cycle de poll (streaming ou capture ponctuelle)
    async fn mark_polled(&self, id: i64, online: bool);
}

#[derive(Debug, Clone, Copy, Default)]
struct DeviceRuntime {
    is_online: bool,
    last_seen: Option<OffsetDateTime>,
}

pub struct ConfigDirectory {
    records: HashMap<i64, DeviceRecord>,
    runtime: Mutex<HashMap<i64, DeviceRuntime>>,
}

impl ConfigDirectory {
    pub fn from_config(cfg: &KernelConfig) -> Self {
        let records = cfg
            .devices
            .iter()
            .map(|(id, d)| {
                (
                    *id,
                    DeviceRecord {
                        id: *id,
                        name: d.name.clone(),
                        host: d.host.clone(),
                        port: d.port,
                        username: d.username.clone(),
                        encrypted_secret: d.encrypted_secret.clone(),
                        use_tls: d.use_tls,
                        device_type: d.device_type.clone(),
                        model: d.model.clone(),
                    },
                )
            })
            .collect();
        Self {
            records,
            runtime: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl DeviceDirectory for ConfigDirectory {
    async fn get_device(&self, id: i64) -> Result<DeviceRecord, DirectoryError> {
        self.records
            .get(&id)
            .cloned()
            .ok_or(DirectoryError::NotFound(id))
    }

    async fn list_devices(&self) -> Vec<DeviceView> {
        let runtime = self.runtime.lock();
        let mut views: Vec<DeviceView> = self
            .records
            .values()
            .map(|r| {
                let rt = runtime.get(&r.id).copied().unwrap_or_default();
                DeviceView {
                    id: r.id,
                    name: r.name.clone(),
                    ip_address: r.host.clone(),
                    is_online: rt.is_online,
                    device_type: r.device_type.clone(),
                    model: r.model.clone(),
                    last_seen: rt
                        .last_seen
                        .map(|t| t.format(&Rfc3339).unwrap_or_default()),
                }
            })
            .collect();
        views.sort_by_key(|v| v.id);
        views
    }

    async fn mark_polled(&self, id: i64, online: bool) {
        let mut runtime = self.runtime.lock();
        let entry = runtime.entry(id).or_default();
        entry.is_online = online;
        if online {
            entry.last_seen = Some(OffsetDateTime::now_utc());
        }
    }
}
