//! Local MQTT broker (C5): the downstream-facing MQTT 3.1.1 server that
//! lets local tools (a dashboard, a notification daemon) piggyback on the
//! single upstream session C2 holds open to the printer, without each of
//! them needing their own printer-side MQTT client.

mod codec;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use codec::{Packet, ReadError};

const MAX_CLIENTS: usize = 20;
const PRE_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Any filter ending in a `report` segment is treated as owned by C2 and
/// never unsubscribed upstream through the refcounting path, not just the
/// one literal topic for this printer's own serial.
fn is_report_filter(filter: &str) -> bool {
    filter.rsplit('/').next() == Some("report")
}

/// What a connected client asked the broker to do with the upstream
/// session. The broker never talks to C2 directly; it forwards these.
#[derive(Debug, Clone)]
pub enum UpstreamRequest {
    Publish { topic: String, payload: Bytes },
    Subscribe(String),
    Unsubscribe(String),
}

struct BrokerClient {
    id: String,
    subscriptions: Mutex<Arc<HashSet<String>>>,
    writer: Mutex<tokio::net::tcp::OwnedWriteHalf>,
    closed: AtomicBool,
}

impl BrokerClient {
    async fn write(&self, bytes: Bytes) -> bool {
        if self.closed.load(Ordering::Relaxed) {
            return false;
        }
        let mut writer = self.writer.lock().await;
        if writer.write_all(&bytes).await.is_err() || writer.flush().await.is_err() {
            self.closed.store(true, Ordering::Relaxed);
            return false;
        }
        true
    }
}

pub struct Broker {
    clients: Mutex<HashMap<String, Arc<BrokerClient>>>,
    /// Reference count per upstream filter, across all connected clients;
    /// the report topic is always present regardless of refcount.
    filter_refcounts: Mutex<HashMap<String, usize>>,
    upstream_tx: mpsc::Sender<UpstreamRequest>,
    report_topic_filter: String,
}

impl Broker {
    pub fn new(upstream_tx: mpsc::Sender<UpstreamRequest>, report_topic_filter: String) -> Arc<Self> {
        Arc::new(Self {
            clients: Mutex::new(HashMap::new()),
            filter_refcounts: Mutex::new(HashMap::new()),
            upstream_tx,
            report_topic_filter,
        })
    }

    pub async fn serve(self: Arc<Self>, bind_addr: &str) -> std::io::Result<()> {
        let listener = TcpListener::bind(bind_addr).await?;
        info!(addr = %bind_addr, "local mqtt broker listening");

        loop {
            let (socket, peer) = listener.accept().await?;
            if self.clients.lock().await.len() >= MAX_CLIENTS {
                debug!(%peer, "rejecting connection, at max capacity");
                drop(socket);
                continue;
            }

            let broker = self.clone();
            tokio::spawn(async move {
                if let Err(e) = broker.handle_client(socket).await {
                    debug!(%peer, error = ?e, "broker client session ended");
                }
            });
        }
    }

    async fn handle_client(self: Arc<Self>, socket: TcpStream) -> Result<(), ReadError> {
        let (read_half, write_half) = socket.into_split();
        let mut reader = BufReader::new(read_half);

        let packet = tokio::time::timeout(PRE_CONNECT_TIMEOUT, codec::read_packet(&mut reader))
            .await
            .map_err(|_| ReadError::Malformed("pre-connect timeout"))??;

        let (client_id, keep_alive) = match packet {
            Packet::Connect { client_id, keep_alive } => (client_id, keep_alive),
            _ => return Err(ReadError::Malformed("expected CONNECT as first packet")),
        };

        let client = Arc::new(BrokerClient {
            id: client_id.clone(),
            subscriptions: Mutex::new(Arc::new(HashSet::new())),
            writer: Mutex::new(write_half),
            closed: AtomicBool::new(false),
        });

        // CONNACK must land before the client is registered, so routed
        // PUBLISH from upstream can never race ahead of it.
        client.write(codec::encode_connack()).await;
        self.register(client.clone()).await;

        let read_timeout = if keep_alive > 0 {
            Duration::from_secs_f64(keep_alive as f64 * 1.5 + 10.0)
        } else {
            Duration::from_secs(30)
        };

        let result = self.client_read_loop(&client, &mut reader, read_timeout).await;
        self.deregister(&client_id).await;
        result
    }

    async fn client_read_loop(
        &self,
        client: &Arc<BrokerClient>,
        reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
        read_timeout: Duration,
    ) -> Result<(), ReadError> {
        loop {
            let packet = match tokio::time::timeout(read_timeout, codec::read_packet(reader)).await
            {
                Ok(result) => result?,
                Err(_) => return Err(ReadError::Malformed("client read timeout")),
            };

            match packet {
                Packet::Subscribe { packet_id, filters } => {
                    self.handle_subscribe(client, packet_id, filters).await;
                }
                Packet::Unsubscribe { packet_id, filters } => {
                    self.handle_unsubscribe(client, packet_id, filters).await;
                }
                Packet::Publish { topic, payload, qos, packet_id } => {
                    let _ = self
                        .upstream_tx
                        .send(UpstreamRequest::Publish { topic, payload })
                        .await;
                    if qos > 0 {
                        if let Some(id) = packet_id {
                            client.write(codec::encode_puback(id)).await;
                        }
                    }
                }
                Packet::PingReq => {
                    client.write(codec::encode_pingresp()).await;
                }
                Packet::Disconnect => return Ok(()),
                Packet::PubAck { .. } | Packet::Unsupported => {}
                Packet::Connect { .. } | Packet::ConnAck | Packet::SubAck { .. }
                | Packet::UnsubAck { .. } | Packet::PingResp => {
                    // Client-to-broker direction never sends these; ignore.
                }
            }
        }
    }

    async fn register(&self, client: Arc<BrokerClient>) {
        let mut clients = self.clients.lock().await;
        if let Some(prior) = clients.remove(&client.id) {
            warn!(client_id = %client.id, "duplicate client id, forcing prior session closed");
            prior.closed.store(true, Ordering::Relaxed);
            let mut writer = prior.writer.lock().await;
            let _ = writer.shutdown().await;
        }
        clients.insert(client.id.clone(), client);
    }

    async fn deregister(&self, client_id: &str) {
        let removed = self.clients.lock().await.remove(client_id);
        if let Some(client) = removed {
            let filters = client.subscriptions.lock().await.clone();
            for filter in filters.iter() {
                self.decref_filter(filter).await;
            }
        }
    }

    async fn handle_subscribe(
        &self,
        client: &Arc<BrokerClient>,
        packet_id: u16,
        filters: Vec<(String, u8)>,
    ) {
        let mut codes = Vec::with_capacity(filters.len());
        let mut newly_added = Vec::new();

        {
            let mut current = client.subscriptions.lock().await;
            let mut updated = (**current).clone();
            for (filter, _requested_qos) in &filters {
                if updated.insert(filter.clone()) {
                    newly_added.push(filter.clone());
                }
                codes.push(0x00); // always grant QoS 0
            }
            *current = Arc::new(updated);
        }

        client.write(codec::encode_suback(packet_id, &codes)).await;

        for filter in newly_added {
            self.incref_filter(&filter).await;
        }
    }

    async fn handle_unsubscribe(&self, client: &Arc<BrokerClient>, packet_id: u16, filters: Vec<String>) {
        let mut removed = Vec::new();
        {
            let mut current = client.subscriptions.lock().await;
            let mut updated = (**current).clone();
            for filter in &filters {
                if updated.remove(filter) {
                    removed.push(filter.clone());
                }
            }
            *current = Arc::new(updated);
        }

        client.write(codec::encode_unsuback(packet_id)).await;

        for filter in removed {
            self.decref_filter(&filter).await;
        }
    }

    async fn incref_filter(&self, filter: &str) {
        let mut refcounts = self.filter_refcounts.lock().await;
        let count = refcounts.entry(filter.to_string()).or_insert(0);
        *count += 1;
        if *count == 1 {
            let _ = self.upstream_tx.send(UpstreamRequest::Subscribe(filter.to_string())).await;
        }
    }

    async fn decref_filter(&self, filter: &str) {
        let mut refcounts = self.filter_refcounts.lock().await;
        if let Some(count) = refcounts.get_mut(filter) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                refcounts.remove(filter);
                if !is_report_filter(filter) && filter != self.report_topic_filter {
                    let _ = self
                        .upstream_tx
                        .send(UpstreamRequest::Unsubscribe(filter.to_string()))
                        .await;
                }
            }
        }
    }

    /// Called by whatever owns the upstream session when a message arrives
    /// on a topic the broker (or one of its clients) cares about.
    pub async fn on_upstream_message(&self, topic: &str, payload: Bytes) {
        let bytes = codec::encode_publish(topic, &payload, 0, None);
        let clients: Vec<Arc<BrokerClient>> = self.clients.lock().await.values().cloned().collect();

        for client in clients {
            let subs = client.subscriptions.lock().await.clone();
            if subs.iter().any(|f| codec::topic_matches(f, topic)) {
                client.write(bytes.clone()).await;
            }
        }
    }

    /// Called after the upstream session reconnects: re-subscribe to the
    /// union of every client's current filters.
    pub async fn on_upstream_reconnect(&self) {
        let filters: HashSet<String> = self.filter_refcounts.lock().await.keys().cloned().collect();
        for filter in filters {
            let _ = self.upstream_tx.send(UpstreamRequest::Subscribe(filter)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_filter_guard_covers_any_serial_not_just_the_owned_one() {
        assert!(is_report_filter("device/01S/report"));
        assert!(is_report_filter("device/OTHER_SN/report"));
        assert!(is_report_filter("device/+/report"));
        assert!(!is_report_filter("device/01S/request"));
    }

    #[tokio::test]
    async fn subscribe_refcounting_only_unsubscribes_upstream_once_all_clients_drop_it() {
        let (tx, mut rx) = mpsc::channel(16);
        let broker = Broker::new(tx, "device/01S/report".to_string());

        let client_a = Arc::new(BrokerClient {
            id: "a".into(),
            subscriptions: Mutex::new(Arc::new(HashSet::new())),
            writer: dummy_writer().await,
            closed: AtomicBool::new(false),
        });
        let client_b = Arc::new(BrokerClient {
            id: "b".into(),
            subscriptions: Mutex::new(Arc::new(HashSet::new())),
            writer: dummy_writer().await,
            closed: AtomicBool::new(false),
        });

        broker
            .handle_subscribe(&client_a, 1, vec![("device/01S/status".to_string(), 0)])
            .await;
        broker
            .handle_subscribe(&client_b, 2, vec![("device/01S/status".to_string(), 0)])
            .await;

        assert!(matches!(
            rx.recv().await,
            Some(UpstreamRequest::Subscribe(f)) if f == "device/01S/status"
        ));

        broker
            .handle_unsubscribe(&client_a, 3, vec!["device/01S/status".to_string()])
            .await;
        // still referenced by client_b: no unsubscribe yet
        assert!(rx.try_recv().is_err());

        broker
            .handle_unsubscribe(&client_b, 4, vec!["device/01S/status".to_string()])
            .await;
        assert!(matches!(
            rx.recv().await,
            Some(UpstreamRequest::Unsubscribe(f)) if f == "device/01S/status"
        ));
    }

    async fn dummy_writer() -> Mutex<tokio::net::tcp::OwnedWriteHalf> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accepted, connected) = tokio::join!(listener.accept(), connect);
        let stream = connected.unwrap();
        let _ = accepted.unwrap();
        let (_read, write) = stream.into_split();
        Mutex::new(write)
    }
}
