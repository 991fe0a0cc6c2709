//! Upstream MQTT session: the TLS connection this agent holds open to the
//! printer's own embedded broker.
//!
//! Connection loop: dial, wait for CONNACK, subscribe to `device/{sn}/report`,
//! prime with `get_version` then `pushall`, then pump incoming publishes into
//! the state/version caches and forward outgoing commands. A failed dial or a
//! dropped connection restarts the loop with linear backoff; three
//! consecutive failures ask the caller to re-resolve the printer's IP before
//! trying again, since Bambu printers hop DHCP leases more often than their
//! firmware changes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use rumqttc::{
    AsyncClient, Event, MqttOptions, Packet, QoS, SubscribeReasonCode, TlsConfiguration, Transport,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::broker::Broker;
use crate::insecure_tls;
use crate::model::{PrinterState, PrinterVersion};
use crate::records::PrintRecordStore;
use crate::translator::{LifecycleEvent, StateTranslator};

use super::wire::{
    GetVersionCommand, Message, PrintControlCommand, PushAllCommand, SetChamberLightCommand,
};

const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(5);
const FAILURES_BEFORE_REDISCOVERY: u32 = 3;
const FAILURES_RESET_THRESHOLD: u32 = 5;
const PUBLISH_ACK_TIMEOUT: Duration = Duration::from_secs(20);

/// Once a single `pushall` response carries more than this many top-level
/// keys, we treat it as the first full state sync rather than an incremental
/// delta; see `PrinterEvent::FullSync`.
const FULL_SYNC_KEY_THRESHOLD: usize = 40;

/// Looks up a printer's current LAN address, called once a reconnect has
/// failed `FAILURES_BEFORE_REDISCOVERY` times in a row. Supplied by the
/// printer manager, which also persists whatever it finds; takes the serial
/// by value since the future it returns must outlive the caller's borrow.
pub type RediscoverFn = Arc<dyn Fn(String) -> BoxFuture<'static, Option<String>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct PrinterConfig {
    pub serial: String,
    pub ip_address: String,
    pub access_code: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub enum PrinterEvent {
    Connected { serial: String },
    Disconnected { serial: String },
    /// The first `pushall` response after connecting carried a full
    /// snapshot rather than a sparse delta.
    FullSync { serial: String },
    StateUpdate { serial: String, state: PrinterState },
    VersionUpdate { serial: String, version: PrinterVersion },
    /// Raised after `FAILURES_BEFORE_REDISCOVERY` consecutive connect
    /// failures; the printer manager should re-run SSDP discovery and, if a
    /// new IP is found, update the stored printer record before the next
    /// retry picks it up.
    RediscoveryNeeded { serial: String },
    /// A job-lifecycle transition derived from the state stream by the
    /// translator (start/resume/pause/failure/completion/progress).
    Lifecycle { serial: String, event: LifecycleEvent },
    Error { serial: String, message: String },
}

/// Reply to a command that the command surface wants to know the outcome
/// of, so a publish timeout or a disconnected session surfaces as a 400/503
/// to the HTTP caller rather than a fire-and-forget no-op.
pub type CommandReply = oneshot::Sender<Result<(), String>>;

#[derive(Debug)]
pub enum PrinterCommand {
    PushAll,
    GetVersion,
    Pause(CommandReply),
    Resume(CommandReply),
    Cancel(CommandReply),
    SetChamberLight(bool, CommandReply),
    /// Raw outbound publish requested by a local broker client (C5).
    RawPublish { topic: String, payload: Bytes },
    /// Upstream (un)subscription requested by a local broker client (C5).
    SubscribeTopic(String),
    UnsubscribeTopic(String),
}

/// MQTT client for a single Bambu Lab printer.
pub struct BambuMqttClient {
    config: PrinterConfig,
    client: Option<AsyncClient>,
    event_tx: broadcast::Sender<PrinterEvent>,
    command_rx: mpsc::Receiver<PrinterCommand>,
    state: PrinterState,
    version: PrinterVersion,
    translator: StateTranslator,
    consecutive_failures: u32,
    synced: bool,
    broker: Option<Arc<Broker>>,
    rediscovery: Option<RediscoverFn>,
}

impl BambuMqttClient {
    pub fn new(
        config: PrinterConfig,
        event_tx: broadcast::Sender<PrinterEvent>,
        command_rx: mpsc::Receiver<PrinterCommand>,
        records_dir: PathBuf,
        broker: Option<Arc<Broker>>,
        rediscovery: Option<RediscoverFn>,
    ) -> Self {
        Self {
            config,
            client: None,
            event_tx,
            command_rx,
            state: PrinterState::default(),
            version: PrinterVersion::default(),
            translator: StateTranslator::new(PrintRecordStore::new(records_dir)),
            consecutive_failures: 0,
            synced: false,
            broker,
            rediscovery,
        }
    }

    /// Runs forever, reconnecting on every error. Returns only if the
    /// command channel is dropped (the printer was deregistered).
    pub async fn run(mut self) {
        loop {
            self.synced = false;
            match self.connect_and_run().await {
                Ok(()) => {
                    info!("mqtt session for {} ended normally", self.config.serial);
                    self.consecutive_failures = 0;
                }
                Err(e) => {
                    self.consecutive_failures += 1;
                    error!(
                        serial = %self.config.serial,
                        failures = self.consecutive_failures,
                        error = ?e,
                        "mqtt session error, reconnecting"
                    );
                    self.translator.on_disconnect();
                    let _ = self.event_tx.send(PrinterEvent::Disconnected {
                        serial: self.config.serial.clone(),
                    });

                    if self.consecutive_failures == FAILURES_BEFORE_REDISCOVERY {
                        let _ = self.event_tx.send(PrinterEvent::RediscoveryNeeded {
                            serial: self.config.serial.clone(),
                        });
                        if let Some(rediscovery) = &self.rediscovery {
                            if let Some(ip) = rediscovery(self.config.serial.clone()).await {
                                if ip != self.config.ip_address {
                                    info!(
                                        serial = %self.config.serial,
                                        old = %self.config.ip_address,
                                        new = %ip,
                                        "rediscovered printer at new address"
                                    );
                                }
                                self.config.ip_address = ip;
                            }
                        }
                    }
                    if self.consecutive_failures >= FAILURES_RESET_THRESHOLD {
                        self.consecutive_failures = 0;
                    }
                }
            }

            let backoff = RECONNECT_BACKOFF
                .saturating_mul(self.consecutive_failures.max(1))
                .min(MAX_RECONNECT_BACKOFF);
            tokio::time::sleep(backoff).await;
        }
    }

    async fn connect_and_run(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let serial = self.config.serial.clone();
        let ip = self.config.ip_address.clone();
        let access_code = self.config.access_code.clone();

        info!("connecting to printer {} at {}:8883", serial, ip);

        let mut mqttoptions = MqttOptions::new(format!("bambu-agent-{serial}"), ip, 8883);
        mqttoptions.set_keep_alive(Duration::from_secs(5));
        mqttoptions.set_credentials("bblp", &access_code);
        // Bambu printers send status pushes well past the rumqttc default cap.
        mqttoptions.set_max_packet_size(64 * 1024, 64 * 1024);

        let tls_config = TlsConfiguration::Rustls(Arc::new(insecure_tls::client_config()));
        mqttoptions.set_transport(Transport::tls_with_config(tls_config));

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);
        self.client = Some(client.clone());

        let mut connected = false;
        for _ in 0..30 {
            match tokio::time::timeout(Duration::from_secs(1), eventloop.poll()).await {
                Ok(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                    info!(serial = %serial, connack = ?ack, "mqtt connected");
                    connected = true;
                    break;
                }
                Ok(Ok(event)) => debug!(serial = %serial, ?event, "pre-connect event"),
                Ok(Err(e)) => return Err(Box::new(e)),
                Err(_) => continue,
            }
        }
        if !connected {
            return Err("connection timeout: no CONNACK received".into());
        }

        let report_topic = format!("device/{serial}/report");
        client.subscribe(&report_topic, QoS::AtLeastOnce).await?;
        info!(serial = %serial, topic = %report_topic, "subscribe requested");

        // Wait for the SUBACK before priming: a wrong SN is a common cause
        // of subscribe failure, and priming (or even staying connected) on
        // a rejected subscription would leave us connected with no report
        // data ever arriving.
        let mut subscribed = false;
        for _ in 0..10 {
            match tokio::time::timeout(Duration::from_secs(2), eventloop.poll()).await {
                Ok(Ok(Event::Incoming(Packet::SubAck(ack)))) => {
                    if ack
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure))
                    {
                        return Err(format!(
                            "subscribe to {report_topic} was rejected (wrong serial number?)"
                        )
                        .into());
                    }
                    subscribed = true;
                    break;
                }
                Ok(Ok(event)) => debug!(serial = %serial, ?event, "pre-suback event"),
                Ok(Err(e)) => return Err(Box::new(e)),
                Err(_) => continue,
            }
        }
        if !subscribed {
            return Err("subscribe timeout: no SUBACK received".into());
        }
        info!(serial = %serial, topic = %report_topic, "subscribed");

        if let Some(broker) = &self.broker {
            broker.on_upstream_reconnect().await;
        }

        // Prime the session on its own task so a slow ack doesn't stall the
        // event loop below; get_version first so model/CPU identity lands
        // before the first state snapshot.
        {
            let client = client.clone();
            let serial = serial.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::prime(&client, &serial).await {
                    warn!(serial = %serial, error = ?e, "priming publish failed");
                }
            });
        }

        let _ = self.event_tx.send(PrinterEvent::Connected {
            serial: serial.clone(),
        });

        loop {
            tokio::select! {
                event = eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            let payload = publish.payload.clone();
                            if let Some(broker) = &self.broker {
                                broker.on_upstream_message(&publish.topic, payload.clone()).await;
                            }
                            if publish.topic == report_topic {
                                self.handle_message(&payload).await;
                            }
                        }
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            debug!(serial = %serial, "duplicate connack");
                        }
                        Ok(Event::Incoming(Packet::PingResp)) => {
                            debug!(serial = %serial, "ping response");
                        }
                        Ok(event) => debug!(serial = %serial, ?event, "mqtt event"),
                        Err(e) => return Err(Box::new(e)),
                    }
                }
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.send_command(cmd).await,
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    async fn prime(
        client: &AsyncClient,
        serial: &str,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let topic = format!("device/{serial}/request");
        let get_version = serde_json::to_string(&GetVersionCommand::new())?;
        tokio::time::timeout(
            PUBLISH_ACK_TIMEOUT,
            client.publish(&topic, QoS::AtLeastOnce, false, get_version),
        )
        .await??;

        let pushall = serde_json::to_string(&PushAllCommand::new())?;
        tokio::time::timeout(
            PUBLISH_ACK_TIMEOUT,
            client.publish(&topic, QoS::AtLeastOnce, false, pushall),
        )
        .await??;

        Ok(())
    }

    async fn handle_message(&mut self, payload: &[u8]) {
        let payload_str = match std::str::from_utf8(payload) {
            Ok(s) => s,
            Err(_) => {
                warn!(serial = %self.config.serial, "non-utf8 payload from printer");
                return;
            }
        };

        let raw: serde_json::Value = match serde_json::from_str(payload_str) {
            Ok(v) => v,
            Err(e) => {
                debug!(serial = %self.config.serial, error = %e, "failed to parse payload as json");
                return;
            }
        };

        if let Some(print) = raw.get("print") {
            self.handle_print_delta(print).await;
        }
        if let Some(info) = raw.get("info") {
            self.version.on_update(info);
            let _ = self.event_tx.send(PrinterEvent::VersionUpdate {
                serial: self.config.serial.clone(),
                version: self.version.clone(),
            });
        }

        // Structured decode is best-effort; kept for diagnostics when a
        // payload shape drifts from what we model.
        if let Err(e) = serde_json::from_str::<Message>(payload_str) {
            debug!(serial = %self.config.serial, error = %e, "payload did not match known message shape");
        }
    }

    async fn handle_print_delta(&mut self, print: &serde_json::Value) {
        let is_first_sync = !self.synced
            && print.get("command").and_then(serde_json::Value::as_str) == Some("push_status")
            && print
                .as_object()
                .map(|m| m.len() > FULL_SYNC_KEY_THRESHOLD)
                .unwrap_or(false);

        self.state.on_update(print);

        if is_first_sync {
            self.synced = true;
            let _ = self.event_tx.send(PrinterEvent::FullSync {
                serial: self.config.serial.clone(),
            });
        }

        let _ = self.event_tx.send(PrinterEvent::StateUpdate {
            serial: self.config.serial.clone(),
            state: self.state.clone(),
        });

        let lifecycle_events = self
            .translator
            .on_message(print, &self.state, is_first_sync)
            .await;
        for event in lifecycle_events {
            let _ = self.event_tx.send(PrinterEvent::Lifecycle {
                serial: self.config.serial.clone(),
                event,
            });
        }
    }

    async fn send_command(&self, cmd: PrinterCommand) {
        let Some(client) = self.client.as_ref() else {
            reply_err(cmd, "not connected");
            return;
        };
        let topic = format!("device/{}/request", self.config.serial);

        match cmd {
            PrinterCommand::PushAll => {
                self.fire_and_forget(client, &topic, PushAllCommand::new()).await;
            }
            PrinterCommand::GetVersion => {
                self.fire_and_forget(client, &topic, GetVersionCommand::new()).await;
            }
            PrinterCommand::Pause(reply) => {
                self.publish_with_ack(client, &topic, PrintControlCommand::pause(), reply).await;
            }
            PrinterCommand::Resume(reply) => {
                self.publish_with_ack(client, &topic, PrintControlCommand::resume(), reply).await;
            }
            PrinterCommand::Cancel(reply) => {
                self.publish_with_ack(client, &topic, PrintControlCommand::cancel(), reply).await;
            }
            PrinterCommand::SetChamberLight(on, reply) => {
                self.publish_with_ack(client, &topic, SetChamberLightCommand::new(on), reply).await;
            }
            PrinterCommand::RawPublish { topic, payload } => {
                if let Err(e) = client.publish(&topic, QoS::AtLeastOnce, false, payload).await {
                    warn!(serial = %self.config.serial, error = ?e, "broker-relayed publish failed");
                }
            }
            PrinterCommand::SubscribeTopic(filter) => {
                if let Err(e) = client.subscribe(&filter, QoS::AtLeastOnce).await {
                    warn!(serial = %self.config.serial, filter = %filter, error = ?e, "broker-relayed subscribe failed");
                }
            }
            PrinterCommand::UnsubscribeTopic(filter) => {
                if let Err(e) = client.unsubscribe(&filter).await {
                    warn!(serial = %self.config.serial, filter = %filter, error = ?e, "broker-relayed unsubscribe failed");
                }
            }
        }
    }

    async fn fire_and_forget(&self, client: &AsyncClient, topic: &str, body: impl serde::Serialize) {
        let Ok(payload) = serde_json::to_string(&body) else {
            return;
        };
        debug!(topic = %topic, payload = %payload, "publishing to printer");
        if let Err(e) = client.publish(topic, QoS::AtLeastOnce, false, payload).await {
            error!(serial = %self.config.serial, error = ?e, "failed to send command");
        }
    }

    async fn publish_with_ack(
        &self,
        client: &AsyncClient,
        topic: &str,
        body: impl serde::Serialize,
        reply: CommandReply,
    ) {
        let payload = match serde_json::to_string(&body) {
            Ok(p) => p,
            Err(e) => {
                let _ = reply.send(Err(format!("failed to encode command: {e}")));
                return;
            }
        };
        debug!(topic = %topic, payload = %payload, "publishing to printer");
        let result = tokio::time::timeout(
            PUBLISH_ACK_TIMEOUT,
            client.publish(topic, QoS::AtLeastOnce, false, payload),
        )
        .await;

        let outcome = match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(format!("publish failed: {e}")),
            Err(_) => Err("publish timed out".to_string()),
        };
        if outcome.is_err() {
            error!(serial = %self.config.serial, error = ?outcome, "command publish failed");
        }
        let _ = reply.send(outcome);
    }
}

fn reply_err(cmd: PrinterCommand, message: &str) {
    match cmd {
        PrinterCommand::Pause(reply)
        | PrinterCommand::Resume(reply)
        | PrinterCommand::Cancel(reply)
        | PrinterCommand::SetChamberLight(_, reply) => {
            let _ = reply.send(Err(message.to_string()));
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_sync_detected_once_past_key_threshold() {
        let mut obj = serde_json::Map::new();
        for i in 0..FULL_SYNC_KEY_THRESHOLD + 1 {
            obj.insert(format!("k{i}"), serde_json::Value::Null);
        }
        let value = serde_json::Value::Object(obj);
        assert!(value.as_object().unwrap().len() > FULL_SYNC_KEY_THRESHOLD);
    }

    fn test_client(dir: std::path::PathBuf) -> (BambuMqttClient, broadcast::Receiver<PrinterEvent>) {
        let (event_tx, event_rx) = broadcast::channel(8);
        let (_cmd_tx, cmd_rx) = mpsc::channel(1);
        let config = PrinterConfig {
            serial: "01S00A000000000".into(),
            ip_address: "127.0.0.1".into(),
            access_code: "12345678".into(),
            name: None,
        };
        (
            BambuMqttClient::new(config, event_tx, cmd_rx, dir, None, None),
            event_rx,
        )
    }

    fn big_delta(command: &str) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        obj.insert("command".into(), serde_json::Value::String(command.into()));
        for i in 0..FULL_SYNC_KEY_THRESHOLD + 1 {
            obj.insert(format!("k{i}"), serde_json::Value::Null);
        }
        serde_json::Value::Object(obj)
    }

    #[tokio::test]
    async fn first_sync_requires_push_status_command_not_just_key_count() {
        use rand::Rng;
        let dir = std::env::temp_dir().join(format!(
            "bambu-client-test-{}",
            rand::thread_rng().gen::<u64>()
        ));
        let (mut client, mut event_rx) = test_client(dir.clone());

        client.handle_print_delta(&big_delta("some_other_command")).await;
        let mut saw_full_sync = false;
        while let Ok(event) = event_rx.try_recv() {
            saw_full_sync |= matches!(event, PrinterEvent::FullSync { .. });
        }
        assert!(!saw_full_sync, "non-push_status delta must not count as first full sync");

        client.handle_print_delta(&big_delta("push_status")).await;
        let mut saw_full_sync = false;
        while let Ok(event) = event_rx.try_recv() {
            saw_full_sync |= matches!(event, PrinterEvent::FullSync { .. });
        }
        assert!(saw_full_sync, "push_status delta past the key threshold is the first full sync");

        tokio::fs::remove_dir_all(dir).await.ok();
    }
}
