//! Doublures partagées par les tests unitaires : sessions scriptées et
//! contexte de poller sur inventaire synthétique.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::{DeviceConf, KernelConfig};
use crate::directory::ConfigDirectory;
use crate::models::{DhcpLease, InterfaceTelemetry, IpAddress, SystemResources};
use crate::poller::PollerContext;
use crate::session::{RemoteSession, SessionError, SessionFactory, SessionTarget};
use crate::vault::CredentialVault;

pub(crate) fn test_vault() -> CredentialVault {
    CredentialVault::new(&[7u8; 32]).unwrap()
}

/// Le scénario mémoire de référence : 1 GiB total, 256 MiB libres
pub(crate) fn sample_resources() -> SystemResources {
    SystemResources {
        cpu_load: 12,
        free_memory: 268_435_456,
        total_memory: 1_073_741_824,
        uptime: "1w2d3h4m5s".into(),
        version: "7.14.2".into(),
        board_name: "hEX S".into(),
    }
}

pub(crate) fn sample_interfaces(count: usize) -> Vec<InterfaceTelemetry> {
    (0..count)
        .map(|i| InterfaceTelemetry {
            name: format!("ether{}", i + 1),
            rx_bytes: 1_000 + i as u64,
            tx_bytes: 2_000 + i as u64,
            rx_packets: 10 + i as u64,
            tx_packets: 20 + i as u64,
            rx_errors: 0,
            tx_errors: 0,
            rx_drops: 0,
            tx_drops: 0,
        })
        .collect()
}

pub(crate) enum ScriptedCycle {
    Ok {
        resources: SystemResources,
        interfaces: Vec<InterfaceTelemetry>,
    },
    OpenFail(SessionError),
    FetchFail(SessionError),
}

/// Factory scriptée : consomme ses cycles puis répond toujours Ok avec le
/// profil de référence. Compte les ouvertures et fermetures de sessions.
pub(crate) struct ScriptedFactory {
    cycles: Mutex<VecDeque<ScriptedCycle>>,
    pub(crate) opened: AtomicUsize,
    pub(crate) closed: Arc<AtomicUsize>,
}

impl ScriptedFactory {
    pub(crate) fn new(cycles: Vec<ScriptedCycle>) -> Arc<Self> {
        Arc::new(Self {
            cycles: Mutex::new(cycles.into()),
            opened: AtomicUsize::new(0),
            closed: Arc::new(AtomicUsize::new(0)),
        })
    }
}

#[async_trait]
impl SessionFactory for ScriptedFactory {
    async fn open(&self, _target: &SessionTarget) -> Result<Box<dyn RemoteSession>, SessionError> {
        let cycle = self.cycles.lock().pop_front().unwrap_or_else(|| ScriptedCycle::Ok {
            resources: sample_resources(),
            interfaces: sample_interfaces(2),
        });
        let (resources, interfaces, fail) = match cycle {
            ScriptedCycle::OpenFail(e) => return Err(e),
            ScriptedCycle::Ok {
                resources,
                interfaces,
            } => (resources, interfaces, None),
            ScriptedCycle::FetchFail(e) => (sample_resources(), Vec::new(), Some(e)),
        };
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            resources,
            interfaces,
            fail,
            closed: self.closed.clone(),
        }))
    }
}

pub(crate) struct FakeSession {
    resources: SystemResources,
    interfaces: Vec<InterfaceTelemetry>,
    fail: Option<SessionError>,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl RemoteSession for FakeSession {
    async fn fetch_system_resources(&mut self) -> Result<SystemResources, SessionError> {
        if let Some(e) = self.fail.take() {
            return Err(e);
        }
        Ok(self.resources.clone())
    }

    async fn fetch_interfaces(&mut self) -> Result<Vec<InterfaceTelemetry>, SessionError> {
        Ok(self.interfaces.clone())
    }

    async fn fetch_identity(&mut self) -> Result<String, SessionError> {
        Ok("fake-router".into())
    }

    async fn fetch_dhcp_leases(&mut self) -> Result<Vec<DhcpLease>, SessionError> {
        Ok(Vec::new())
    }

    async fn fetch_ip_addresses(&mut self) -> Result<Vec<IpAddress>, SessionError> {
        Ok(Vec::new())
    }

    async fn close(self: Box<Self>) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Contexte de test : équipement 7 valide, équipement 8 au secret illisible
pub(crate) fn test_context(factory: Arc<ScriptedFactory>) -> Arc<PollerContext> {
    let vault = test_vault();
    let mut cfg = KernelConfig::default();
    cfg.devices.insert(
        7,
        DeviceConf {
            name: "edge-gw".into(),
            host: "127.0.0.1".into(),
            port: 8728,
            username: "api".into(),
            encrypted_secret: vault.encrypt("s3cret"),
            use_tls: false,
            device_type: "router".into(),
            model: Some("hEX S".into()),
        },
    );
    cfg.devices.insert(
        8,
        DeviceConf {
            name: "lab-sw".into(),
            host: "127.0.0.2".into(),
            port: 8728,
            username: "api".into(),
            encrypted_secret: "AAAA".into(),
            use_tls: false,
            device_type: "switch".into(),
            model: None,
        },
    );
    Arc::new(PollerContext {
        directory: Arc::new(ConfigDirectory::from_config(&cfg)),
        vault,
        factory: factory as Arc<dyn SessionFactory>,
        max_interfaces: 10,
    })
}
