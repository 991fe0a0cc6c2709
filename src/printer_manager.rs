//! Printer connection manager
//!
//! Owns the long-running task per connected printer (the upstream MQTT
//! session plus its local broker and upstream-forwarding plumbing), and the
//! last-known state/version/connection caches the HTTP surface reads from
//! without needing to reach into a specific printer's session.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use sqlx::SqlitePool;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, UpstreamRequest};
use crate::discovery::DiscoveredPrinter;
use crate::model::{PrinterState, PrinterVersion};
use crate::mqtt::{BambuMqttClient, CommandReply, PrinterCommand, PrinterConfig, PrinterEvent};
use crate::records::PrintRecordStore;

/// Handle for sending commands to a connected printer
#[derive(Clone)]
pub struct PrinterHandle {
    pub serial: String,
    pub command_tx: mpsc::Sender<PrinterCommand>,
}

/// Connection info for a printer
#[derive(Debug, Clone)]
pub struct PrinterConnection {
    pub serial: String,
    pub connected: bool,
    pub state: Option<PrinterState>,
}

/// Manages connections to multiple printers
pub struct PrinterManager {
    /// Root directory under which each printer gets its own `PrintInfos` dir.
    local_storage_root: PathBuf,
    /// Active printer connections (serial -> handle)
    connections: RwLock<HashMap<String, PrinterHandle>>,
    /// Printer states (serial -> state)
    states: RwLock<HashMap<String, PrinterState>>,
    /// Printer version/model identity (serial -> version)
    versions: RwLock<HashMap<String, PrinterVersion>>,
    /// Connection status (serial -> connected)
    connected: RwLock<HashMap<String, bool>>,
    /// Event broadcaster for UI updates
    event_tx: broadcast::Sender<PrinterEvent>,
    /// Background tasks spawned per printer (session, local broker, upstream
    /// forwarder); aborted as a group on disconnect.
    tasks: Mutex<HashMap<String, Vec<JoinHandle<()>>>>,
    db: SqlitePool,
    discovered_printers: Arc<Mutex<HashMap<String, DiscoveredPrinter>>>,
    /// Next port to hand to a newly connected printer's local broker.
    next_broker_port: Mutex<u16>,
}

impl PrinterManager {
    /// Create a new printer manager. `broker_port_base` is the first port in
    /// the range handed out to printers' local brokers, one per connection,
    /// incrementing as printers connect.
    pub fn new(
        local_storage_root: PathBuf,
        broker_port_base: u16,
        db: SqlitePool,
        discovered_printers: Arc<Mutex<HashMap<String, DiscoveredPrinter>>>,
    ) -> (Self, broadcast::Receiver<PrinterEvent>) {
        let (event_tx, event_rx) = broadcast::channel(100);

        let manager = Self {
            local_storage_root,
            connections: RwLock::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
            versions: RwLock::new(HashMap::new()),
            connected: RwLock::new(HashMap::new()),
            event_tx,
            tasks: Mutex::new(HashMap::new()),
            db,
            discovered_printers,
            next_broker_port: Mutex::new(broker_port_base),
        };

        (manager, event_rx)
    }

    /// Subscribe to printer events
    pub fn subscribe(&self) -> broadcast::Receiver<PrinterEvent> {
        self.event_tx.subscribe()
    }

    /// Check if a printer is connected
    pub async fn is_connected(&self, serial: &str) -> bool {
        self.connected.read().await.get(serial).copied().unwrap_or(false)
    }

    /// Get all connection statuses
    pub async fn get_connection_statuses(&self) -> HashMap<String, bool> {
        self.connected.read().await.clone()
    }

    /// Get printer state
    pub async fn get_state(&self, serial: &str) -> Option<PrinterState> {
        self.states.read().await.get(serial).cloned()
    }

    /// Get printer version/model identity
    pub async fn get_version(&self, serial: &str) -> Option<PrinterVersion> {
        self.versions.read().await.get(serial).cloned()
    }

    /// A fresh handle onto a printer's print-record store. Cheap: it's just
    /// a directory path, so there's no shared state to hand out instead.
    pub fn record_store(&self, serial: &str) -> PrintRecordStore {
        PrintRecordStore::new(self.local_storage_root.join(serial).join("PrintInfos"))
    }

    /// Connect to a printer: starts its upstream MQTT session, a local
    /// broker bound to the next port in the configured range, and the glue
    /// that lets broker clients ride along on the upstream session.
    pub async fn connect(
        &self,
        serial: String,
        ip_address: String,
        access_code: String,
        name: Option<String>,
    ) -> Result<(), String> {
        if self.is_connected(&serial).await {
            return Err(format!("Printer {} is already connected", serial));
        }

        info!("Connecting to printer {} at {}", serial, ip_address);

        let config = PrinterConfig {
            serial: serial.clone(),
            ip_address,
            access_code,
            name,
        };

        let (command_tx, command_rx) = mpsc::channel(32);

        {
            let mut connections = self.connections.write().await;
            connections.insert(
                serial.clone(),
                PrinterHandle {
                    serial: serial.clone(),
                    command_tx: command_tx.clone(),
                },
            );
        }

        let broker_port = {
            let mut next = self.next_broker_port.lock().await;
            let port = *next;
            *next += 1;
            port
        };

        let (upstream_tx, mut upstream_rx) = mpsc::channel::<UpstreamRequest>(32);
        let report_topic = format!("device/{serial}/report");
        let broker = Broker::new(upstream_tx, report_topic);

        let mut handles = Vec::with_capacity(3);

        handles.push({
            let broker = broker.clone();
            let bind_addr = format!("127.0.0.1:{broker_port}");
            let serial = serial.clone();
            tokio::spawn(async move {
                if let Err(e) = broker.serve(&bind_addr).await {
                    error!(serial = %serial, error = ?e, "local mqtt broker exited");
                }
            })
        });

        handles.push({
            let command_tx = command_tx.clone();
            tokio::spawn(async move {
                while let Some(req) = upstream_rx.recv().await {
                    let cmd = match req {
                        UpstreamRequest::Publish { topic, payload } => {
                            PrinterCommand::RawPublish { topic, payload }
                        }
                        UpstreamRequest::Subscribe(filter) => PrinterCommand::SubscribeTopic(filter),
                        UpstreamRequest::Unsubscribe(filter) => {
                            PrinterCommand::UnsubscribeTopic(filter)
                        }
                    };
                    if command_tx.send(cmd).await.is_err() {
                        break;
                    }
                }
            })
        });

        let records_dir = self.local_storage_root.join(&serial).join("PrintInfos");
        let rediscovery = self.rediscover_fn();
        let client = BambuMqttClient::new(
            config,
            self.event_tx.clone(),
            command_rx,
            records_dir,
            Some(broker),
            Some(rediscovery),
        );

        let serial_clone = serial.clone();
        let event_tx = self.event_tx.clone();
        handles.push(tokio::spawn(async move {
            client.run().await;
            debug!("MQTT client for {} finished", serial_clone);
            let _ = event_tx.send(PrinterEvent::Disconnected {
                serial: serial_clone,
            });
        }));

        self.tasks.lock().await.insert(serial.clone(), handles);

        Ok(())
    }

    /// Builds the closure `BambuMqttClient` calls after repeated connect
    /// failures: looks the serial up in whatever SSDP has most recently
    /// observed, and if found, persists it so the next `connect()` call
    /// (and the one already in flight) picks it up.
    fn rediscover_fn(&self) -> crate::mqtt::RediscoverFn {
        let db = self.db.clone();
        let discovered = self.discovered_printers.clone();
        Arc::new(move |serial: String| {
            let db = db.clone();
            let discovered = discovered.clone();
            Box::pin(async move {
                let ip = {
                    let discovered = discovered.lock().await;
                    discovered.get(&serial).map(|p| p.ip_address.to_string())
                }?;
                let _ = sqlx::query("UPDATE printers SET ip_address = ? WHERE serial = ?")
                    .bind(&ip)
                    .bind(&serial)
                    .execute(&db)
                    .await;
                Some(ip)
            }) as BoxFuture<'static, Option<String>>
        })
    }

    /// Disconnect from a printer
    pub async fn disconnect(&self, serial: &str) -> Result<(), String> {
        info!("Disconnecting from printer {}", serial);

        if let Some(handles) = self.tasks.lock().await.remove(serial) {
            for handle in handles {
                handle.abort();
            }
        }

        self.connections.write().await.remove(serial);
        self.connected.write().await.remove(serial);
        self.states.write().await.remove(serial);
        self.versions.write().await.remove(serial);

        Ok(())
    }

    /// Send a command to a printer, fire-and-forget.
    pub async fn send_command(&self, serial: &str, command: PrinterCommand) -> Result<(), String> {
        let connections = self.connections.read().await;

        if let Some(handle) = connections.get(serial) {
            handle
                .command_tx
                .send(command)
                .await
                .map_err(|e| format!("Failed to send command: {}", e))
        } else {
            Err(format!("Printer {} is not connected", serial))
        }
    }

    async fn send_and_await(
        &self,
        serial: &str,
        build: impl FnOnce(CommandReply) -> PrinterCommand,
    ) -> Result<(), String> {
        let (tx, rx) = oneshot::channel();
        self.send_command(serial, build(tx)).await?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(format!("printer {} disconnected before replying", serial)),
        }
    }

    pub async fn pause(&self, serial: &str) -> Result<(), String> {
        self.send_and_await(serial, PrinterCommand::Pause).await
    }

    pub async fn resume(&self, serial: &str) -> Result<(), String> {
        self.send_and_await(serial, PrinterCommand::Resume).await
    }

    pub async fn cancel(&self, serial: &str) -> Result<(), String> {
        self.send_and_await(serial, PrinterCommand::Cancel).await
    }

    pub async fn set_chamber_light(&self, serial: &str, on: bool) -> Result<(), String> {
        self.send_and_await(serial, |reply| PrinterCommand::SetChamberLight(on, reply))
            .await
    }

    /// Handle printer events (call this in a background task)
    pub async fn handle_event(&self, event: PrinterEvent) {
        match &event {
            PrinterEvent::Connected { serial } => {
                info!("Printer {} connected", serial);
                self.connected.write().await.insert(serial.clone(), true);
            }
            PrinterEvent::Disconnected { serial } => {
                info!("Printer {} disconnected", serial);
                self.connected.write().await.insert(serial.clone(), false);
            }
            PrinterEvent::FullSync { serial } => {
                debug!("Printer {} completed first full state sync", serial);
            }
            PrinterEvent::StateUpdate { serial, state } => {
                debug!("Printer {} state update", serial);
                self.states.write().await.insert(serial.clone(), state.clone());
            }
            PrinterEvent::VersionUpdate { serial, version } => {
                debug!(serial = %serial, model = version.model.name(), "printer version update");
                self.versions.write().await.insert(serial.clone(), version.clone());
            }
            PrinterEvent::RediscoveryNeeded { serial } => {
                warn!("Printer {} needs rediscovery after repeated connect failures", serial);
            }
            PrinterEvent::Lifecycle { serial, event } => {
                info!(serial = %serial, ?event, "print lifecycle event");
            }
            PrinterEvent::Error { serial, message } => {
                warn!("Printer {} error: {}", serial, message);
            }
        }
    }
}
