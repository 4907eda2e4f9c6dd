/**
 * REMOTE SESSION - Connexion transitoire vers un routeur via l'API RouterOS
 *
 * RÔLE :
 * Un cycle connexion -> login -> lectures typées -> fermeture par équipement.
 * Session à usage unique : une fois fermée ou en échec, on en reconstruit
 * une au cycle suivant.
 *
 * FONCTIONNEMENT :
 * - Machine d'états Unconnected -> Connecting -> Ready -> Closed, avec
 *   Failed terminal depuis Connecting ou Ready
 * - Classification uniforme des échecs : Timeout (délai de connexion ou de
 *   commande), Unreachable (refus/reset transport), AuthRejected (trap au
 *   login), Fetch (commande échouée une fois connecté)
 * - Chaque commande est bornée par command_timeout
 *
 * UTILITÉ DANS MIRADOR :
 * 🎯 Pollers : capture de télémétrie sans jamais fuiter une connexion
 * 🎯 API REST : probe de connexion, lectures ponctuelles (baux DHCP...)
 * 🎯 Tests : traits RemoteSession/SessionFactory substituables par des stubs
 */
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tracing::debug;

use crate::directory::DeviceRecord;
use crate::models::{DhcpLease, InterfaceTelemetry, IpAddress, SystemResources};
use crate::protocol::{self, ProtocolError, Reply};
use crate::transport::{self, DeviceTransport};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("device unreachable: {0}")]
    Unreachable(String),
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unconnected,
    Connecting,
    Ready,
    Closed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
}

/// Paramètres de connexion résolus (secret déjà déchiffré par le Vault).
/// Ne dérive volontairement pas Debug : le secret ne doit pas fuiter en log.
#[derive(Clone)]
pub struct SessionTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub secret: String,
    pub use_tls: bool,
}

impl SessionTarget {
    pub fn for_device(record: &DeviceRecord, secret: String) -> Self {
        Self {
            host: record.host.clone(),
            port: record.port,
            username: record.username.clone(),
            secret,
            use_tls: record.use_tls,
        }
    }
}

/// Opérations disponibles sur une session prête. Les enregistrements bruts
/// de l'équipement sont normalisés en structures typées à cette frontière.
#[async_trait]
pub trait RemoteSession: Send {
    async fn fetch_system_resources(&mut self) -> Result<SystemResources, SessionError>;
    async fn fetch_interfaces(&mut self) -> Result<Vec<InterfaceTelemetry>, SessionError>;
    async fn fetch_identity(&mut self) -> Result<String, SessionError>;
    async fn fetch_dhcp_leases(&mut self) -> Result<Vec<DhcpLease>, SessionError>;
    async fn fetch_ip_addresses(&mut self) -> Result<Vec<IpAddress>, SessionError>;
    /// Rend la connexion sous-jacente. Consomme la session : usage unique.
    async fn close(self: Box<Self>);
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self, target: &SessionTarget) -> Result<Box<dyn RemoteSession>, SessionError>;
}

struct CommandOutcome {
    records: Vec<HashMap<String, String>>,
    trap: Option<String>,
}

pub struct ApiSession {
    stream: DeviceTransport,
    state: SessionState,
    peer: String,
    command_timeout: Duration,
}

impl ApiSession {
    pub async fn open(
        target: &SessionTarget,
        settings: &SessionSettings,
    ) -> Result<Self, SessionError> {
        let stream =
            transport::connect(&target.host, target.port, target.use_tls, settings.connect_timeout)
                .await?;
        let mut session = Self {
            stream,
            state: SessionState::Connecting,
            peer: format!("{}:{}", target.host, target.port),
            command_timeout: settings.command_timeout,
        };
        match session.login(&target.username, &target.secret).await {
            Ok(()) => {
                session.state = SessionState::Ready;
                debug!(peer = %session.peer, "session ready");
                Ok(session)
            }
            Err(e) => {
                session.state = SessionState::Failed;
                Err(e)
            }
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Login en clair (post-6.43). Un trap ici signifie identifiants refusés,
    /// une coupure transport signifie équipement injoignable.
    async fn login(&mut self, username: &str, secret: &str) -> Result<(), SessionError> {
        let name = format!("=name={username}");
        let password = format!("=password={secret}");
        let outcome = match self.exchange(&["/login", &name, &password]).await {
            Ok(outcome) => outcome,
            Err(SessionError::Fetch(m)) => return Err(SessionError::Unreachable(m)),
            Err(e) => return Err(e),
        };
        if let Some(message) = outcome.trap {
            return Err(SessionError::AuthRejected(message));
        }
        Ok(())
    }

    fn ensure_ready(&self) -> Result<(), SessionError> {
        if self.state == SessionState::Ready {
            Ok(())
        } else {
            Err(SessionError::Protocol(format!(
                "session {} not ready ({:?})",
                self.peer, self.state
            )))
        }
    }

    async fn exchange(&mut self, words: &[&str]) -> Result<CommandOutcome, SessionError> {
        match timeout(self.command_timeout, self.exchange_inner(words)).await {
            Ok(result) => result,
            Err(_) => {
                self.state = SessionState::Failed;
                Err(SessionError::Timeout(self.command_timeout))
            }
        }
    }

    async fn exchange_inner(&mut self, words: &[&str]) -> Result<CommandOutcome, SessionError> {
        protocol::write_sentence(&mut self.stream, words)
            .await
            .map_err(map_protocol_err)?;
        let mut records = Vec::new();
        let mut trap = None;
        loop {
            let sentence = protocol::read_sentence(&mut self.stream)
                .await
                .map_err(map_protocol_err)?;
            if sentence.is_empty() {
                continue;
            }
            match protocol::classify_reply(&sentence).map_err(map_protocol_err)? {
                Reply::Data(attrs) => records.push(attrs),
                Reply::Trap { message } => trap = Some(message),
                Reply::Done => return Ok(CommandOutcome { records, trap }),
                Reply::Fatal(message) => {
                    self.state = SessionState::Failed;
                    return Err(SessionError::Protocol(format!(
                        "device aborted session: {message}"
                    )));
                }
            }
        }
    }

    async fn run_query(
        &mut self,
        command: &str,
    ) -> Result<Vec<HashMap<String, String>>, SessionError> {
        self.ensure_ready()?;
        let outcome = self.exchange(&[command]).await?;
        if let Some(message) = outcome.trap {
            return Err(SessionError::Fetch(format!("{command}: {message}")));
        }
        Ok(outcome.records)
    }
}

#[async_trait]
impl RemoteSession for ApiSession {
    async fn fetch_system_resources(&mut self) -> Result<SystemResources, SessionError> {
        let records = self.run_query("/system/resource/print").await?;
        let attrs = records.into_iter().next().ok_or_else(|| {
            SessionError::Protocol("empty /system/resource reply".into())
        })?;
        Ok(SystemResources {
            cpu_load: attr_u64(&attrs, "cpu-load") as u32,
            free_memory: attr_u64(&attrs, "free-memory"),
            total_memory: attr_u64(&attrs, "total-memory"),
            uptime: attr_or(&attrs, "uptime", "unknown"),
            version: attr_or(&attrs, "version", "unknown"),
            board_name: attr_or(&attrs, "board-name", "unknown"),
        })
    }

    async fn fetch_interfaces(&mut self) -> Result<Vec<InterfaceTelemetry>, SessionError> {
        let records = self.run_query("/interface/print").await?;
        Ok(records
            .iter()
            .map(|attrs| InterfaceTelemetry {
                name: attr_or(attrs, "name", "unknown"),
                rx_bytes: attr_u64(attrs, "rx-byte"),
                tx_bytes: attr_u64(attrs, "tx-byte"),
                rx_packets: attr_u64(attrs, "rx-packet"),
                tx_packets: attr_u64(attrs, "tx-packet"),
                rx_errors: attr_u64(attrs, "rx-error"),
                tx_errors: attr_u64(attrs, "tx-error"),
                rx_drops: attr_u64(attrs, "rx-drop"),
                tx_drops: attr_u64(attrs, "tx-drop"),
            })
            .collect())
    }

    async fn fetch_identity(&mut self) -> Result<String, SessionError> {
        let records = self.run_query("/system/identity/print").await?;
        let attrs = records
            .into_iter()
            .next()
            .ok_or_else(|| SessionError::Protocol("empty /system/identity reply".into()))?;
        Ok(attr_or(&attrs, "name", "unknown"))
    }

    async fn fetch_dhcp_leases(&mut self) -> Result<Vec<DhcpLease>, SessionError> {
        let records = self.run_query("/ip/dhcp-server/lease/print").await?;
        Ok(records
            .iter()
            .map(|attrs| DhcpLease {
                address: attr_str(attrs, "address"),
                mac_address: attr_str(attrs, "mac-address"),
                host_name: attr_str(attrs, "host-name"),
                status: attr_str(attrs, "status"),
            })
            .collect())
    }

    async fn fetch_ip_addresses(&mut self) -> Result<Vec<IpAddress>, SessionError> {
        let records = self.run_query("/ip/address/print").await?;
        Ok(records
            .iter()
            .map(|attrs| IpAddress {
                address: attr_str(attrs, "address"),
                network: attr_str(attrs, "network"),
                interface: attr_str(attrs, "interface"),
            })
            .collect())
    }

    async fn close(mut self: Box<Self>) {
        if self.state == SessionState::Ready {
            // /quit provoque un !fatal côté équipement, inutile de l'attendre
            let _ = timeout(
                Duration::from_millis(250),
                protocol::write_sentence(&mut self.stream, &["/quit"]),
            )
            .await;
        }
        let _ = self.stream.shutdown().await;
        self.state = SessionState::Closed;
        debug!(peer = %self.peer, "session closed");
    }
}

pub struct ApiSessionFactory {
    settings: SessionSettings,
}

impl ApiSessionFactory {
    pub fn new(settings: SessionSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl SessionFactory for ApiSessionFactory {
    async fn open(&self, target: &SessionTarget) -> Result<Box<dyn RemoteSession>, SessionError> {
        Ok(Box::new(ApiSession::open(target, &self.settings).await?))
    }
}

fn map_protocol_err(e: ProtocolError) -> SessionError {
    match e {
        ProtocolError::Io(e) => SessionError::Fetch(format!("connection lost: {e}")),
        other => SessionError::Protocol(other.to_string()),
    }
}

fn attr_u64(attrs: &HashMap<String, String>, key: &str) -> u64 {
    attrs
        .get(key)
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0)
}

fn attr_str(attrs: &HashMap<String, String>, key: &str) -> String {
    attrs.get(key).cloned().unwrap_or_default()
}

fn attr_or(attrs: &HashMap<String, String>, key: &str, fallback: &str) -> String {
    attrs
        .get(key)
        .cloned()
        .unwrap_or_else(|| fallback.to_string())
}
