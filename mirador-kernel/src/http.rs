/**
 * PASSERELLE HTTP/WEBSOCKET - Surface externe du kernel
 *
 * RÔLE :
 * Ce module expose l'API du kernel : inventaire, lectures ponctuelles,
 * probe de connexion, et les deux flux temps réel (vue équipement et vue
 * flotte). La passerelle possède les transports WebSocket ; le hub ne
 * connaît que des canaux d'abonnés.
 *
 * FONCTIONNEMENT :
 * - Serveur Axum, routes REST + upgrade WebSocket
 * - /ws/devices/{id}/live : trame "connected" puis une trame "metrics" par
 *   snapshot ; une trame "error" en cas d'échec de cycle, connexion gardée
 * - /ws/dashboard : trame "dashboard" périodique construite sur l'inventaire
 * - Équipement inconnu sur un flux : fermeture code 1008 avec raison
 */
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;

use crate::directory::{DeviceDirectory as _, DeviceView};
use crate::models::{DhcpLease, IpAddress, SnapshotStatus, TelemetrySnapshot};
use crate::poller::{self, PollerContext};
use crate::stream::StreamHub;

#[derive(Clone)]
pub struct AppState {
    pub hub: StreamHub,
    pub ctx: Arc<PollerContext>,
    pub dashboard_interval: Duration,
    pub started_at: Instant,
}

#[derive(Debug, Serialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub devices_total: usize,
    pub devices_online: usize,
    pub active_streams: usize,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/devices", get(get_devices))
        .route("/devices/{id}/metrics/current", get(get_current_metrics))
        .route("/devices/{id}/probe", post(probe_device))
        .route("/devices/{id}/dhcp-leases", get(get_dhcp_leases))
        .route("/devices/{id}/addresses", get(get_ip_addresses))
        .route("/ws/devices/{id}/live", get(ws_device_live))
        .route("/ws/dashboard", get(ws_dashboard))
        .with_state(app_state)
}

// GET /system/health (état du kernel)
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    let devices = app.ctx.directory.list_devices().await;
    Json(KernelHealth {
        uptime_seconds: app.started_at.elapsed().as_secs(),
        devices_total: devices.len(),
        devices_online: devices.iter().filter(|d| d.is_online).count(),
        active_streams: app.hub.active_streams(),
    })
}

// GET /devices (vue inventaire)
async fn get_devices(State(app): State<AppState>) -> Json<Vec<DeviceView>> {
    Json(app.ctx.directory.list_devices().await)
}

// GET /devices/{id}/metrics/current (lecture ponctuelle, liste d'interfaces complète)
async fn get_current_metrics(
    State(app): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<TelemetrySnapshot>, (StatusCode, Json<Value>)> {
    let device = app.ctx.directory.get_device(id).await.map_err(|e| {
        (StatusCode::NOT_FOUND, Json(json!({ "detail": e.to_string() })))
    })?;
    match poller::capture(&app.ctx, &device, usize::MAX).await {
        Ok((system, interfaces)) => {
            app.ctx.directory.mark_polled(id, true).await;
            Ok(Json(TelemetrySnapshot::ok(id, device.name, system, interfaces)))
        }
        Err(e) => {
            app.ctx.directory.mark_polled(id, false).await;
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "detail": format!("Failed to fetch metrics: {e:#}") })),
            ))
        }
    }
}

// POST /devices/{id}/probe (test de connexion)
async fn probe_device(
    State(app): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, StatusCode> {
    let device = app
        .ctx
        .directory
        .get_device(id)
        .await
        .map_err(|_| StatusCode::NOT_FOUND)?;
    match poller::probe(&app.ctx, &device).await {
        Ok(report) => Ok(Json(json!({
            "success": true,
            "host": device.host,
            "identity": report.identity,
            "version": report.version,
            "board_name": report.board_name,
            "uptime": report.uptime,
            "cpu_load": report.cpu_load,
            "free_memory": report.free_memory,
            "total_memory": report.total_memory,
        }))),
        Err(e) => Ok(Json(json!({
            "success": false,
            "host": device.host,
            "error": format!("{e:#}"),
        }))),
    }
}

// GET /devices/{id}/dhcp-leases
async fn get_dhcp_leases(
    State(app): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<DhcpLease>>, (StatusCode, Json<Value>)> {
    let device = app.ctx.directory.get_device(id).await.map_err(|e| {
        (StatusCode::NOT_FOUND, Json(json!({ "detail": e.to_string() })))
    })?;
    let mut session = poller::open_session(&app.ctx, &device).await.map_err(|e| {
        (StatusCode::BAD_GATEWAY, Json(json!({ "detail": format!("{e:#}") })))
    })?;
    let leases = session.fetch_dhcp_leases().await;
    session.close().await;
    leases.map(Json).map_err(|e| {
        (StatusCode::BAD_GATEWAY, Json(json!({ "detail": e.to_string() })))
    })
}

// GET /devices/{id}/addresses
async fn get_ip_addresses(
    State(app): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<IpAddress>>, (StatusCode, Json<Value>)> {
    let device = app.ctx.directory.get_device(id).await.map_err(|e| {
        (StatusCode::NOT_FOUND, Json(json!({ "detail": e.to_string() })))
    })?;
    let mut session = poller::open_session(&app.ctx, &device).await.map_err(|e| {
        (StatusCode::BAD_GATEWAY, Json(json!({ "detail": format!("{e:#}") })))
    })?;
    let addresses = session.fetch_ip_addresses().await;
    session.close().await;
    addresses.map(Json).map_err(|e| {
        (StatusCode::BAD_GATEWAY, Json(json!({ "detail": e.to_string() })))
    })
}

// GET /ws/devices/{id}/live (flux temps réel d'un équipement)
async fn ws_device_live(
    State(app): State<AppState>,
    Path(id): Path<i64>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_device_socket(socket, app, id))
}

// GET /ws/dashboard (vue d'ensemble de la flotte)
async fn ws_dashboard(State(app): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_dashboard_socket(socket, app))
}

async fn handle_device_socket(mut socket: WebSocket, app: AppState, device_id: i64) {
    let device = match app.ctx.directory.get_device(device_id).await {
        Ok(d) => d,
        Err(_) => {
            // fermeture anormale distincte : l'équipement n'existe pas
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: 1008,
                    reason: "Device not found".into(),
                })))
                .await;
            return;
        }
    };

    let mut subscription = app.hub.subscribe(device_id);
    let (mut tx, mut rx) = socket.split();

    let connected = json!({
        "type": "connected",
        "device_id": device_id,
        "device_name": device.name,
        "message": "Connected to device metrics stream",
    });
    if tx.send(Message::Text(connected.to_string().into())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            snapshot = subscription.recv() => {
                match snapshot {
                    Some(snapshot) => {
                        let frame = device_frame(&snapshot);
                        if tx.send(Message::Text(frame.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    // retiré par le hub (consommateur trop lent) : plus rien à servir
                    None => break,
                }
            }
            incoming = rx.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = tx.send(Message::Pong(data)).await;
                    }
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
    debug!(device_id, "live stream observer disconnected");
}

async fn handle_dashboard_socket(socket: WebSocket, app: AppState) {
    let (mut tx, mut rx) = socket.split();

    let connected = json!({
        "type": "connected",
        "message": "Connected to dashboard stream",
    });
    if tx.send(Message::Text(connected.to_string().into())).await.is_err() {
        return;
    }

    let mut ticker = tokio::time::interval(app.dashboard_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let devices = app.ctx.directory.list_devices().await;
                let frame = dashboard_frame(&devices);
                if tx.send(Message::Text(frame.to_string().into())).await.is_err() {
                    break;
                }
            }
            incoming = rx.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = tx.send(Message::Pong(data)).await;
                    }
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
    debug!("dashboard observer disconnected");
}

/// Trame sortante pour le flux équipement : "metrics" pour un snapshot sain,
/// "error" pour un cycle en échec (la connexion reste ouverte).
fn device_frame(snapshot: &TelemetrySnapshot) -> Value {
    match (&snapshot.status, &snapshot.system) {
        (SnapshotStatus::Ok, Some(system)) => json!({
            "type": "metrics",
            "timestamp": snapshot.timestamp(),
            "device_id": snapshot.device_id,
            "device_name": snapshot.device_name,
            "system": {
                "cpu_load": system.cpu_load_percent,
                "memory_used": system.memory_used_bytes,
                "memory_total": system.memory_total_bytes,
                "memory_percent": system.memory_percent,
                "uptime": system.uptime,
                "version": system.version,
            },
            "interfaces": snapshot.interfaces.iter().map(|i| json!({
                "name": i.name,
                "rx_bytes": i.rx_bytes,
                "tx_bytes": i.tx_bytes,
                "rx_packets": i.rx_packets,
                "tx_packets": i.tx_packets,
            })).collect::<Vec<_>>(),
            "status": "ok",
        }),
        _ => json!({
            "type": "error",
            "message": snapshot.error.clone().unwrap_or_else(|| "unknown error".into()),
            "timestamp": snapshot.timestamp(),
        }),
    }
}

fn dashboard_frame(devices: &[DeviceView]) -> Value {
    let online = devices.iter().filter(|d| d.is_online).count();
    json!({
        "type": "dashboard",
        "timestamp": OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default(),
        "total_devices": devices.len(),
        "online_devices": online,
        "offline_devices": devices.len() - online,
        "devices": devices.iter().map(|d| json!({
            "id": d.id,
            "name": d.name,
            "ip_address": d.ip_address,
            "is_online": d.is_online,
            "device_type": d.device_type,
            "model": d.model,
            "last_seen": d.last_seen,
        })).collect::<Vec<_>>(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InterfaceTelemetry, SystemResources, SystemTelemetry};

    fn ok_snapshot() -> TelemetrySnapshot {
        let system = SystemTelemetry::derive(&SystemResources {
            cpu_load: 12,
            free_memory: 268_435_456,
            total_memory: 1_073_741_824,
            uptime: "1w2d3h4m5s".into(),
            version: "7.14.2".into(),
            board_name: "hEX S".into(),
        });
        let interfaces = vec![InterfaceTelemetry {
            name: "ether1".into(),
            rx_bytes: 1000,
            tx_bytes: 2000,
            rx_packets: 10,
            tx_packets: 20,
            rx_errors: 1,
            tx_errors: 2,
            rx_drops: 3,
            tx_drops: 4,
        }];
        TelemetrySnapshot::ok(7, "edge-gw".into(), system, interfaces)
    }

    #[test]
    fn metrics_frame_shape() {
        let frame = device_frame(&ok_snapshot());
        assert_eq!(frame["type"], "metrics");
        assert_eq!(frame["device_id"], 7);
        assert_eq!(frame["device_name"], "edge-gw");
        assert_eq!(frame["status"], "ok");
        assert_eq!(frame["system"]["cpu_load"], 12);
        assert_eq!(frame["system"]["memory_used"], 805_306_368u64);
        assert_eq!(frame["system"]["memory_percent"], 75.0);
        // le flux ne transporte que le sous-ensemble documenté des compteurs
        let iface = &frame["interfaces"][0];
        assert_eq!(iface["name"], "ether1");
        assert_eq!(iface["rx_bytes"], 1000);
        assert!(iface.get("rx_errors").is_none());
    }

    #[test]
    fn error_frame_keeps_connection_semantics() {
        let snapshot = TelemetrySnapshot::failure(7, "edge-gw".into(), "timed out after 5s".into());
        let frame = device_frame(&snapshot);
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["message"], "timed out after 5s");
        assert!(frame.get("system").is_none());
    }

    #[test]
    fn dashboard_frame_counts() {
        let devices = vec![
            DeviceView {
                id: 1,
                name: "gw-1".into(),
                ip_address: "10.0.0.1".into(),
                is_online: true,
                device_type: "router".into(),
                model: Some("hEX S".into()),
                last_seen: Some("2026-08-05T10:00:00Z".into()),
            },
            DeviceView {
                id: 2,
                name: "sw-1".into(),
                ip_address: "10.0.0.2".into(),
                is_online: false,
                device_type: "switch".into(),
                model: None,
                last_seen: None,
            },
        ];
        let frame = dashboard_frame(&devices);
        assert_eq!(frame["type"], "dashboard");
        assert_eq!(frame["total_devices"], 2);
        assert_eq!(frame["online_devices"], 1);
        assert_eq!(frame["offline_devices"], 1);
        assert_eq!(frame["devices"][0]["ip_address"], "10.0.0.1");
        assert_eq!(frame["devices"][1]["last_seen"], Value::Null);
    }
}
