/**
 * TELEMETRY POLLER - Cycle de capture pour un équipement
 *
 * RÔLE :
 * Conduit un équipement à cadence fixe : résolution inventaire, déchiffrement
 * du secret, session transitoire, lectures, champs dérivés, émission vers le
 * hub. Un échec produit un snapshot en erreur, jamais une exception qui sort
 * de la boucle : un équipement en panne ne dégrade que son propre flux.
 *
 * FONCTIONNEMENT :
 * - Cadence fixe sans backoff : un équipement injoignable se rétablit seul
 *   au tick suivant
 * - Annulation coopérative via watch channel, honorée entre deux cycles
 *   (une capture en vol va toujours jusqu'à la fermeture de session)
 */
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::directory::{DeviceDirectory, DeviceRecord};
use crate::models::{InterfaceTelemetry, SystemTelemetry, TelemetrySnapshot};
use crate::session::{RemoteSession, SessionFactory, SessionTarget};
use crate::stream::StreamHub;
use crate::vault::CredentialVault;

/// Dépendances partagées par tous les pollers et la passerelle
pub struct PollerContext {
    pub directory: Arc<dyn DeviceDirectory>,
    pub vault: CredentialVault,
    pub factory: Arc<dyn SessionFactory>,
    /// Cap d'interfaces par snapshot streamé (les suivantes sont omises)
    pub max_interfaces: usize,
}

/// Résultat d'un test de connexion ponctuel
#[derive(Debug, Serialize)]
pub struct ProbeReport {
    pub identity: String,
    pub version: String,
    pub board_name: String,
    pub uptime: String,
    pub cpu_load: u32,
    pub free_memory: u64,
    pub total_memory: u64,
}

pub fn spawn_device_poller(
    ctx: Arc<PollerContext>,
    hub: StreamHub,
    device_id: i64,
    cadence: Duration,
    mut cancel: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(device_id, cadence_ms = cadence.as_millis() as u64, "poller started");
        let mut ticker = tokio::time::interval(cadence);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if *cancel.borrow() {
                        break;
                    }
                    let snapshot = poll_device_once(&ctx, device_id).await;
                    ctx.directory.mark_polled(device_id, snapshot.is_ok()).await;
                    hub.broadcast(device_id, snapshot);
                }
                _ = cancel.changed() => break,
            }
        }
        info!(device_id, "poller stopped");
    })
}

/// Un cycle complet. Toute erreur (inventaire, vault, session, lecture)
/// devient un snapshot en erreur : les échecs sont des données.
pub async fn poll_device_once(ctx: &PollerContext, device_id: i64) -> TelemetrySnapshot {
    let device = match ctx.directory.get_device(device_id).await {
        Ok(d) => d,
        Err(e) => return TelemetrySnapshot::failure(device_id, String::new(), e.to_string()),
    };
    match capture(ctx, &device, ctx.max_interfaces).await {
        Ok((system, interfaces)) => {
            TelemetrySnapshot::ok(device_id, device.name, system, interfaces)
        }
        Err(e) => {
            let message = format!("{e:#}");
            debug!(device_id, error = message.as_str(), "poll cycle failed");
            TelemetrySnapshot::failure(device_id, device.name, message)
        }
    }
}

/// Déchiffre le secret et ouvre une session vers l'équipement
pub async fn open_session(
    ctx: &PollerContext,
    device: &DeviceRecord,
) -> anyhow::Result<Box<dyn RemoteSession>> {
    let secret = ctx
        .vault
        .decrypt(&device.encrypted_secret)
        .context("credential decrypt failed")?;
    let target = SessionTarget::for_device(device, secret);
    let session = ctx
        .factory
        .open(&target)
        .await
        .context("session open failed")?;
    Ok(session)
}

/// Capture ressources + interfaces sur une session fraîche, puis la ferme
/// quel que soit le résultat des lectures.
pub async fn capture(
    ctx: &PollerContext,
    device: &DeviceRecord,
    max_interfaces: usize,
) -> anyhow::Result<(SystemTelemetry, Vec<InterfaceTelemetry>)> {
    let mut session = open_session(ctx, device).await?;
    let fetched = fetch_telemetry(session.as_mut(), max_interfaces).await;
    session.close().await;
    fetched
}

async fn fetch_telemetry(
    session: &mut dyn RemoteSession,
    max_interfaces: usize,
) -> anyhow::Result<(SystemTelemetry, Vec<InterfaceTelemetry>)> {
    let resources = session.fetch_system_resources().await?;
    let mut interfaces = session.fetch_interfaces().await?;
    interfaces.truncate(max_interfaces);
    Ok((SystemTelemetry::derive(&resources), interfaces))
}

/// Test de connexion ponctuel : identité + ressources, session refermée
pub async fn probe(ctx: &PollerContext, device: &DeviceRecord) -> anyhow::Result<ProbeReport> {
    let mut session = open_session(ctx, device).await?;
    let identity = session.fetch_identity().await;
    let resources = session.fetch_system_resources().await;
    session.close().await;
    let identity = identity?;
    let resources = resources?;
    Ok(ProbeReport {
        identity,
        version: resources.version,
        board_name: resources.board_name,
        uptime: resources.uptime,
        cpu_load: resources.cpu_load,
        free_memory: resources.free_memory,
        total_memory: resources.total_memory,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SnapshotStatus;
    use crate::session::SessionError;
    use crate::test_support::{
        sample_interfaces, sample_resources, test_context, ScriptedCycle, ScriptedFactory,
    };
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn successful_cycle_derives_fields() {
        let factory = ScriptedFactory::new(vec![ScriptedCycle::Ok {
            resources: sample_resources(),
            interfaces: sample_interfaces(3),
        }]);
        let ctx = test_context(factory.clone());
        let snapshot = poll_device_once(&ctx, 7).await;
        assert_eq!(snapshot.status, SnapshotStatus::Ok);
        assert_eq!(snapshot.device_name, "edge-gw");
        let system = snapshot.system.unwrap();
        assert_eq!(system.memory_used_bytes, 805_306_368);
        assert_eq!(system.memory_percent, 75.0);
        assert_eq!(snapshot.interfaces.len(), 3);
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn interface_overflow_silently_capped() {
        let factory = ScriptedFactory::new(vec![ScriptedCycle::Ok {
            resources: sample_resources(),
            interfaces: sample_interfaces(24),
        }]);
        let ctx = test_context(factory);
        let snapshot = poll_device_once(&ctx, 7).await;
        assert_eq!(snapshot.status, SnapshotStatus::Ok);
        assert_eq!(snapshot.interfaces.len(), 10);
        assert_eq!(snapshot.interfaces[0].name, "ether1");
    }

    #[tokio::test]
    async fn open_failure_becomes_error_snapshot() {
        let factory = ScriptedFactory::new(vec![ScriptedCycle::OpenFail(
            SessionError::Timeout(Duration::from_secs(5)),
        )]);
        let ctx = test_context(factory);
        let snapshot = poll_device_once(&ctx, 7).await;
        assert_eq!(snapshot.status, SnapshotStatus::Error);
        let message = snapshot.error.unwrap();
        assert!(message.contains("timed out"), "{message}");
    }

    #[tokio::test]
    async fn fetch_failure_still_closes_session() {
        let factory = ScriptedFactory::new(vec![ScriptedCycle::FetchFail(
            SessionError::Fetch("not permitted".into()),
        )]);
        let ctx = test_context(factory.clone());
        let snapshot = poll_device_once(&ctx, 7).await;
        assert_eq!(snapshot.status, SnapshotStatus::Error);
        assert_eq!(factory.opened.load(Ordering::SeqCst), 1);
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_device_reported_not_found() {
        let factory = ScriptedFactory::new(vec![]);
        let ctx = test_context(factory);
        let snapshot = poll_device_once(&ctx, 99).await;
        assert_eq!(snapshot.status, SnapshotStatus::Error);
        assert!(snapshot.error.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn bad_ciphertext_reported_as_vault_failure() {
        let factory = ScriptedFactory::new(vec![]);
        let ctx = test_context(factory.clone());
        // l'équipement 8 du contexte de test porte un secret illisible
        let snapshot = poll_device_once(&ctx, 8).await;
        assert_eq!(snapshot.status, SnapshotStatus::Error);
        assert!(snapshot.error.unwrap().contains("credential decrypt failed"));
        // aucune session ouverte quand le déchiffrement échoue
        assert_eq!(factory.opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn probe_reports_identity_and_resources() {
        let factory = ScriptedFactory::new(vec![]);
        let ctx = test_context(factory.clone());
        let device = ctx.directory.get_device(7).await.unwrap();
        let report = probe(&ctx, &device).await.unwrap();
        assert_eq!(report.identity, "fake-router");
        assert_eq!(report.total_memory, 1_073_741_824);
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
    }
}
