/**
 * MIRADOR KERNEL - Point d'entrée du serveur de supervision
 *
 * RÔLE : Orchestration des modules : config, vault, inventaire, hub de
 * streaming, passerelle HTTP/WebSocket. Bootstrap complet avec gestion
 * d'erreurs et logging.
 *
 * ARCHITECTURE : Sessions API transitoires vers les routeurs + fan-out
 * temps réel vers les observateurs + API REST d'inspection.
 */
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpListener;
use tracing::{error, info};

use mirador_kernel::config::load_config;
use mirador_kernel::directory::{ConfigDirectory, DeviceDirectory};
use mirador_kernel::http::{self, AppState};
use mirador_kernel::poller::PollerContext;
use mirador_kernel::session::{ApiSessionFactory, SessionFactory, SessionSettings};
use mirador_kernel::stream::StreamHub;
use mirador_kernel::vault::CredentialVault;

#[tokio::main]
async fn main() {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().init();

    // Mode utilitaire : chiffrer un secret d'équipement pour l'inventaire
    let args: Vec<String> = std::env::args().collect();
    if args.get(1).map(String::as_str) == Some("encrypt-secret") {
        let Some(plaintext) = args.get(2) else {
            eprintln!("usage: mirador-kernel encrypt-secret <plaintext>");
            std::process::exit(2);
        };
        match CredentialVault::from_env() {
            Ok(vault) => println!("{}", vault.encrypt(plaintext)),
            Err(e) => {
                eprintln!("vault error: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    let cfg = load_config().await;

    let vault = match CredentialVault::from_env() {
        Ok(vault) => vault,
        Err(e) => {
            error!("failed to load vault key: {e}");
            std::process::exit(1);
        }
    };

    let directory: Arc<dyn DeviceDirectory> = Arc::new(ConfigDirectory::from_config(&cfg));
    let factory: Arc<dyn SessionFactory> = Arc::new(ApiSessionFactory::new(SessionSettings {
        connect_timeout: cfg.session.connect_timeout(),
        command_timeout: cfg.session.command_timeout(),
    }));
    let ctx = Arc::new(PollerContext {
        directory,
        vault,
        factory,
        max_interfaces: cfg.streams.max_interfaces,
    });
    info!(devices = cfg.devices.len(), "inventory loaded");

    let hub = StreamHub::new(ctx.clone(), cfg.streams.live_interval());

    let app_state = AppState {
        hub,
        ctx,
        dashboard_interval: cfg.streams.dashboard_interval(),
        started_at: Instant::now(),
    };
    let app = http::build_router(app_state);

    let addr: SocketAddr = cfg.listen.addr.parse().unwrap_or_else(|e| {
        error!("invalid listen address {}: {e}", cfg.listen.addr);
        std::process::exit(1);
    });
    info!("listening on http://{addr}");
    let listener = TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
