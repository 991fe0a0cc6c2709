mod api;
mod broker;
mod command_surface;
mod config;
mod db;
mod discovery;
mod insecure_tls;
mod model;
mod mqtt;
mod printer_manager;
mod quickcam;
mod records;
mod translator;
mod websocket;

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::discovery::{DiscoveredPrinter, SsdpDiscovery};
use crate::printer_manager::PrinterManager;
use crate::quickcam::QuickCam;

/// Shared application state
pub struct AppState {
    pub db: SqlitePool,
    pub config: Config,
    /// SSDP discovery service
    pub ssdp_discovery: SsdpDiscovery,
    /// Discovered printers (keyed by serial)
    pub discovered_printers: Arc<Mutex<HashMap<String, DiscoveredPrinter>>>,
    /// Printer connection manager
    pub printer_manager: Arc<PrinterManager>,
    /// Live webcam pumps, one per printer that's been asked for a snapshot
    /// or stream since the agent started.
    pub webcams: Mutex<HashMap<String, Arc<QuickCam>>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bambu_agent=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();

    let db = db::connect(&config.database_url).await?;
    db::migrate(&db).await?;

    let (ssdp_discovery, mut ssdp_rx) = SsdpDiscovery::new();

    let discovered_printers = Arc::new(Mutex::new(HashMap::new()));

    let (printer_manager, mut printer_event_rx) = PrinterManager::new(
        config.local_storage_root.clone(),
        config.local_broker_port_base,
        db.clone(),
        discovered_printers.clone(),
    );
    let printer_manager = Arc::new(printer_manager);

    let state = Arc::new(AppState {
        db,
        config: config.clone(),
        ssdp_discovery,
        discovered_printers,
        printer_manager,
        webcams: Mutex::new(HashMap::new()),
    });

    // Collect SSDP discoveries into the shared map so the rediscovery path
    // and the /api/discovery/printers endpoint both see them.
    {
        let state = state.clone();
        tokio::spawn(async move {
            while let Ok(printer) = ssdp_rx.recv().await {
                let mut discovered = state.discovered_printers.lock().await;
                discovered.insert(printer.serial.clone(), printer);
            }
        });
    }

    // Auto-connect printers with auto_connect enabled
    {
        let state = state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;

            let printers: Vec<db::Printer> =
                match sqlx::query_as("SELECT * FROM printers WHERE auto_connect = 1")
                    .fetch_all(&state.db)
                    .await
                {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::error!("Failed to fetch auto-connect printers: {}", e);
                        return;
                    }
                };

            for printer in printers {
                if let (Some(ip), Some(code)) = (printer.ip_address, printer.access_code) {
                    tracing::info!("Auto-connecting to printer {}", printer.serial);
                    if let Err(e) = state
                        .printer_manager
                        .connect(printer.serial.clone(), ip, code, printer.name)
                        .await
                    {
                        tracing::error!("Failed to auto-connect to {}: {}", printer.serial, e);
                    }
                }
            }
        });
    }

    // Feed printer events into the connection manager's caches and fan
    // them out to dashboard websocket clients.
    {
        let state = state.clone();
        tokio::spawn(async move {
            while let Ok(event) = printer_event_rx.recv().await {
                state.printer_manager.handle_event(event).await;
            }
        });
    }

    let app = Router::new()
        .nest("/api", api::router())
        .nest("/ws", websocket::router())
        .fallback_service(ServeDir::new(&config.static_dir))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    tracing::info!("bambu-agent listening on {}", config.bind_address);

    axum::serve(listener, app).await?;

    Ok(())
}
