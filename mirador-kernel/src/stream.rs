/**
 * STREAM HUB - Multiplexeur de diffusion par équipement
 *
 * RÔLE :
 * Garantit un seul poller par équipement quel que soit le nombre
 * d'observateurs : le premier abonnement démarre le poller, le dernier
 * désabonnement l'annule. Diffusion ordonnée des snapshots, rattrapage
 * immédiat des abonnés tardifs via le dernier snapshot en cache.
 *
 * FONCTIONNEMENT :
 * - Table externe id équipement -> entrée par équipement, chaque entrée
 *   sous son propre verrou : deux équipements ne se contendent jamais
 * - Ordre de verrouillage unique table -> entrée, sections critiques
 *   courtes, jamais de verrou tenu à travers un await
 * - Diffusion en try_send : un canal plein ou fermé fait retirer l'abonné,
 *   les observateurs sains ne sont jamais bloqués par un lent ou un mort
 */
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::TelemetrySnapshot;
use crate::poller::{self, PollerContext};

/// Capacité du canal de chaque abonné
pub const SUBSCRIBER_BUFFER: usize = 16;

struct DeviceChannel {
    subscribers: HashMap<Uuid, mpsc::Sender<TelemetrySnapshot>>,
    last_snapshot: Option<TelemetrySnapshot>,
    cancel: watch::Sender<bool>,
}

struct HubInner {
    devices: Mutex<HashMap<i64, Arc<Mutex<DeviceChannel>>>>,
    ctx: Arc<PollerContext>,
    cadence: Duration,
}

#[derive(Clone)]
pub struct StreamHub {
    inner: Arc<HubInner>,
}

/// Abonnement à un flux équipement. Le détacher (drop) désabonne ; le
/// dernier désabonnement d'un équipement annule son poller.
pub struct StreamSubscription {
    hub: StreamHub,
    device_id: i64,
    subscriber_id: Uuid,
    rx: mpsc::Receiver<TelemetrySnapshot>,
}

impl StreamSubscription {
    pub async fn recv(&mut self) -> Option<TelemetrySnapshot> {
        self.rx.recv().await
    }

    pub fn device_id(&self) -> i64 {
        self.device_id
    }
}

impl Drop for StreamSubscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.device_id, self.subscriber_id);
    }
}

impl StreamHub {
    pub fn new(ctx: Arc<PollerContext>, cadence: Duration) -> Self {
        Self {
            inner: Arc::new(HubInner {
                devices: Mutex::new(HashMap::new()),
                ctx,
                cadence,
            }),
        }
    }

    pub fn subscribe(&self, device_id: i64) -> StreamSubscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let subscriber_id = Uuid::new_v4();
        let mut devices = self.inner.devices.lock();
        let entry = devices
            .entry(device_id)
            .or_insert_with(|| {
                let (cancel_tx, cancel_rx) = watch::channel(false);
                poller::spawn_device_poller(
                    self.inner.ctx.clone(),
                    self.clone(),
                    device_id,
                    self.inner.cadence,
                    cancel_rx,
                );
                debug!(device_id, "first subscriber, poller spawned");
                Arc::new(Mutex::new(DeviceChannel {
                    subscribers: HashMap::new(),
                    last_snapshot: None,
                    cancel: cancel_tx,
                }))
            })
            .clone();
        let mut channel = entry.lock();
        // rattrapage immédiat : un abonné tardif n'attend pas le tick suivant
        if let Some(snapshot) = &channel.last_snapshot {
            let _ = tx.try_send(snapshot.clone());
        }
        channel.subscribers.insert(subscriber_id, tx);
        debug!(
            device_id,
            %subscriber_id,
            total = channel.subscribers.len(),
            "subscriber attached"
        );
        drop(channel);
        drop(devices);
        StreamSubscription {
            hub: self.clone(),
            device_id,
            subscriber_id,
            rx,
        }
    }

    pub fn unsubscribe(&self, device_id: i64, subscriber_id: Uuid) {
        let mut devices = self.inner.devices.lock();
        let Some(entry) = devices.get(&device_id).cloned() else {
            return;
        };
        let mut channel = entry.lock();
        if channel.subscribers.remove(&subscriber_id).is_none() {
            return;
        }
        if channel.subscribers.is_empty() {
            let _ = channel.cancel.send(true);
            drop(channel);
            devices.remove(&device_id);
            info!(device_id, "last subscriber left, poller cancelled");
        }
    }

    /// Diffuse un snapshot à tous les abonnés de l'équipement, dans l'ordre
    /// de production du poller. Appelé uniquement par le poller de
    /// l'équipement, d'où l'ordre naturel par équipement.
    pub fn broadcast(&self, device_id: i64, snapshot: TelemetrySnapshot) {
        let entry = self.inner.devices.lock().get(&device_id).cloned();
        let Some(entry) = entry else {
            return;
        };
        let mut channel = entry.lock();
        channel.last_snapshot = Some(snapshot.clone());
        let mut dead = Vec::new();
        for (id, tx) in &channel.subscribers {
            if tx.try_send(snapshot.clone()).is_err() {
                dead.push(*id);
            }
        }
        for id in &dead {
            channel.subscribers.remove(id);
            warn!(device_id, subscriber_id = %id, "subscriber channel unavailable, dropped");
        }
        let now_empty = !dead.is_empty() && channel.subscribers.is_empty();
        drop(channel);
        if now_empty {
            self.collect_if_idle(device_id);
        }
    }

    /// GC : si tous les abonnés ont été retirés par la diffusion, annule le
    /// poller et libère l'entrée.
    fn collect_if_idle(&self, device_id: i64) {
        let mut devices = self.inner.devices.lock();
        let Some(entry) = devices.get(&device_id).cloned() else {
            return;
        };
        let channel = entry.lock();
        if channel.subscribers.is_empty() {
            let _ = channel.cancel.send(true);
            drop(channel);
            devices.remove(&device_id);
            info!(device_id, "no live subscribers left, poller cancelled");
        }
    }

    pub fn subscriber_count(&self, device_id: i64) -> usize {
        self.inner
            .devices
            .lock()
            .get(&device_id)
            .map(|entry| entry.lock().subscribers.len())
            .unwrap_or(0)
    }

    /// Nombre d'équipements avec un poller actif
    pub fn active_streams(&self) -> usize {
        self.inner.devices.lock().len()
    }
}
