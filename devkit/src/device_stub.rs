/*!
Stub d'équipement RouterOS pour développement sans matériel

Sert le sous-ensemble de l'API utilisé par le kernel : login en clair,
/system/resource/print, /interface/print, /system/identity/print,
/ip/dhcp-server/lease/print, /ip/address/print. Le profil contrôle les
identifiants acceptés, les valeurs renvoyées et un délai de réponse
optionnel pour simuler un équipement lent ou muet.
*/

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::wire;

type Record = Vec<(String, String)>;

#[derive(Debug, Clone)]
pub struct StubProfile {
    pub username: String,
    pub password: String,
    pub identity: String,
    pub resources: Record,
    pub interfaces: Vec<Record>,
    pub leases: Vec<Record>,
    pub addresses: Vec<Record>,
    /// Délai appliqué avant chaque réponse
    pub response_delay: Option<Duration>,
}

impl Default for StubProfile {
    fn default() -> Self {
        Self {
            username: "api".into(),
            password: "s3cret".into(),
            identity: "stub-router".into(),
            resources: record(&[
                ("cpu-load", "12"),
                ("free-memory", "268435456"),
                ("total-memory", "1073741824"),
                ("uptime", "1w2d3h4m5s"),
                ("version", "7.14.2"),
                ("board-name", "hEX S"),
            ]),
            interfaces: vec![interface("ether1", 1_000, 2_000), interface("ether2", 3_000, 4_000)],
            leases: vec![record(&[
                ("address", "192.168.88.10"),
                ("mac-address", "AA:BB:CC:DD:EE:FF"),
                ("host-name", "laptop"),
                ("status", "bound"),
            ])],
            addresses: vec![record(&[
                ("address", "192.168.88.1/24"),
                ("network", "192.168.88.0"),
                ("interface", "bridge"),
            ])],
            response_delay: None,
        }
    }
}

pub fn record(pairs: &[(&str, &str)]) -> Record {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Interface avec compteurs plausibles pour les scénarios de test
pub fn interface(name: &str, rx_bytes: u64, tx_bytes: u64) -> Record {
    record(&[
        ("name", name),
        ("rx-byte", &rx_bytes.to_string()),
        ("tx-byte", &tx_bytes.to_string()),
        ("rx-packet", "10"),
        ("tx-packet", "20"),
        ("rx-error", "0"),
        ("tx-error", "0"),
        ("rx-drop", "0"),
        ("tx-drop", "0"),
    ])
}

/// Équipement simulé. L'écoute s'arrête quand le stub est droppé.
pub struct DeviceStub {
    addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl DeviceStub {
    pub async fn spawn(profile: StubProfile) -> Result<Self> {
        env_logger::try_init().ok();
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        log::info!("[stub] listening on {addr}");
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        log::debug!("[stub] connection from {peer}");
                        let profile = profile.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, profile).await {
                                log::debug!("[stub] connection ended: {e:#}");
                            }
                        });
                    }
                    Err(e) => {
                        log::error!("[stub] accept failed: {e}");
                        break;
                    }
                }
            }
        });
        Ok(Self { addr, accept_task })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

impl Drop for DeviceStub {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve_connection(mut stream: TcpStream, profile: StubProfile) -> Result<()> {
    let mut authenticated = false;
    loop {
        let words = wire::read_sentence(&mut stream).await?;
        if words.is_empty() {
            continue;
        }
        if let Some(delay) = profile.response_delay {
            tokio::time::sleep(delay).await;
        }
        match words[0].as_str() {
            "/login" => {
                let name = attr_value(&words, "name");
                let password = attr_value(&words, "password");
                if name.as_deref() == Some(profile.username.as_str())
                    && password.as_deref() == Some(profile.password.as_str())
                {
                    authenticated = true;
                    wire::write_sentence(&mut stream, &["!done"]).await?;
                } else {
                    log::debug!("[stub] login rejected for {name:?}");
                    wire::write_sentence(
                        &mut stream,
                        &["!trap", "=message=invalid user name or password (6)"],
                    )
                    .await?;
                    wire::write_sentence(&mut stream, &["!done"]).await?;
                }
            }
            "/quit" => {
                wire::write_sentence(&mut stream, &["!fatal", "session terminated"]).await?;
                return Ok(());
            }
            _ if !authenticated => {
                wire::write_sentence(&mut stream, &["!trap", "=message=not logged in"]).await?;
                wire::write_sentence(&mut stream, &["!done"]).await?;
            }
            "/system/resource/print" => {
                send_records(&mut stream, std::slice::from_ref(&profile.resources)).await?;
            }
            "/system/identity/print" => {
                let identity = vec![("name".to_string(), profile.identity.clone())];
                send_records(&mut stream, std::slice::from_ref(&identity)).await?;
            }
            "/interface/print" => send_records(&mut stream, &profile.interfaces).await?,
            "/ip/dhcp-server/lease/print" => send_records(&mut stream, &profile.leases).await?,
            "/ip/address/print" => send_records(&mut stream, &profile.addresses).await?,
            other => {
                log::debug!("[stub] unknown command {other}");
                wire::write_sentence(&mut stream, &["!trap", "=message=no such command"]).await?;
                wire::write_sentence(&mut stream, &["!done"]).await?;
            }
        }
    }
}

async fn send_records(stream: &mut TcpStream, records: &[Record]) -> Result<()> {
    for rec in records {
        let mut words = vec!["!re".to_string()];
        for (key, value) in rec {
            words.push(format!("={key}={value}"));
        }
        let refs: Vec<&str> = words.iter().map(String::as_str).collect();
        wire::write_sentence(stream, &refs).await?;
    }
    wire::write_sentence(stream, &["!done"]).await?;
    Ok(())
}

fn attr_value(words: &[String], key: &str) -> Option<String> {
    let prefix = format!("={key}=");
    words
        .iter()
        .find_map(|w| w.strip_prefix(&prefix).map(str::to_string))
}
