use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::channel::mpsc as fmpsc;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tokio::sync::{Notify, mpsc};
use tokio::time::timeout;

use crate::config::{SessionConfig, TransportConfig};
use crate::directory::Directory;
use crate::error::{ConnectError, DirectoryFetchError};
use crate::model::Identity;
use crate::transport::link::{Connector, Link, LinkError, LinkMessage};
use crate::transport::stomp::{self, Command, Frame, Inbound};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

pub const TEST_ENDPOINT: &str = "ws://broker.test/ws";

/// Transport config with fast reconnects and heartbeats off.
pub fn test_transport_config() -> TransportConfig {
    TransportConfig {
        endpoint: TEST_ENDPOINT.to_string(),
        virtual_host: None,
        connect_timeout: Duration::from_secs(1),
        reconnect_delay: Duration::from_millis(10),
        heartbeat_outgoing: Duration::ZERO,
        heartbeat_incoming: Duration::ZERO,
        event_capacity: 256,
    }
}

pub fn test_session_config() -> SessionConfig {
    let mut config = SessionConfig::default();
    config.transport = test_transport_config();
    config.receipt_timeout = Duration::from_secs(2);
    config.event_capacity = 256;
    config
}

// =============================================================================
// In-memory broker
// =============================================================================

struct MemoryConnector {
    accepted: mpsc::UnboundedSender<BrokerPeer>,
    refuse: AtomicUsize,
    attempts: AtomicUsize,
}

impl Connector for MemoryConnector {
    fn connect<'a>(&'a self, _endpoint: &'a str) -> BoxFuture<'a, Result<Link, ConnectError>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let refused = self
                .refuse
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refused {
                return Err(ConnectError::Unreachable("connection refused".into()));
            }

            let (client_tx, broker_rx) = fmpsc::unbounded::<String>();
            let (broker_tx, client_rx) = fmpsc::unbounded::<LinkMessage>();
            let sink = client_tx.sink_map_err(|e| LinkError(e.to_string()));
            let stream = client_rx.map(Ok::<_, LinkError>);

            self.accepted
                .send(BrokerPeer {
                    from_client: broker_rx,
                    to_client: broker_tx,
                })
                .map_err(|_| ConnectError::Unreachable("broker gone".into()))?;
            Ok(Link::new(sink, stream))
        })
    }
}

/// Broker side of the in-memory connector. Each successful connect yields a
/// `BrokerPeer` from `accept()`.
pub struct MemoryBroker {
    connector: Arc<MemoryConnector>,
    accepted: mpsc::UnboundedReceiver<BrokerPeer>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            connector: Arc::new(MemoryConnector {
                accepted: tx,
                refuse: AtomicUsize::new(0),
                attempts: AtomicUsize::new(0),
            }),
            accepted: rx,
        }
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        self.connector.clone()
    }

    /// Refuse the next `n` connection attempts.
    pub fn refuse_next(&self, n: usize) {
        self.connector.refuse.store(n, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.connector.attempts.load(Ordering::SeqCst)
    }

    pub async fn accept(&mut self) -> BrokerPeer {
        timeout(TEST_TIMEOUT, self.accepted.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("connector dropped")
    }

    pub fn try_accept(&mut self) -> Option<BrokerPeer> {
        self.accepted.try_recv().ok()
    }
}

/// One accepted link, seen from the broker. Dropping it closes the link.
pub struct BrokerPeer {
    from_client: fmpsc::UnboundedReceiver<String>,
    to_client: fmpsc::UnboundedSender<LinkMessage>,
}

impl BrokerPeer {
    /// Next raw message from the client, heartbeats included.
    pub async fn recv_raw(&mut self) -> String {
        timeout(TEST_TIMEOUT, self.from_client.next())
            .await
            .expect("timed out waiting for client data")
            .expect("client closed the link")
    }

    /// Next frame from the client, skipping heartbeats.
    pub async fn expect_frame(&mut self) -> Frame {
        loop {
            let raw = self.recv_raw().await;
            let items = stomp::decode(&raw).expect("client sent a malformed frame");
            if let Some(frame) = items.into_iter().find_map(|item| match item {
                Inbound::Frame(frame) => Some(frame),
                Inbound::Heartbeat => None,
            }) {
                return frame;
            }
        }
    }

    /// Assert no frame (heartbeats aside) arrives within `within`.
    pub async fn expect_silence(&mut self, within: Duration) {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            match tokio::time::timeout_at(deadline, self.from_client.next()).await {
                Err(_) => return,
                Ok(None) => return,
                Ok(Some(raw)) if raw.trim().is_empty() => continue,
                Ok(Some(raw)) => panic!("expected silence, got {raw:?}"),
            }
        }
    }

    pub fn send_raw(&self, text: &str) {
        self.to_client
            .unbounded_send(LinkMessage::Text(text.to_string()))
            .expect("client gone");
    }

    pub fn send_binary(&self, bytes: Vec<u8>) {
        self.to_client
            .unbounded_send(LinkMessage::Binary(bytes))
            .expect("client gone");
    }

    pub fn send_frame(&self, frame: Frame) {
        self.send_raw(&frame.encode());
    }

    pub fn send_connected(&self, heart_beat: &str) {
        self.send_frame(
            Frame::new(Command::Connected)
                .header("version", "1.2")
                .header("heart-beat", heart_beat),
        );
    }

    /// Read CONNECT and answer CONNECTED with heartbeats off.
    pub async fn handshake(&mut self) -> Frame {
        let connect = self.expect_frame().await;
        assert_eq!(connect.command, Command::Connect);
        self.send_connected("0,0");
        connect
    }

    pub fn send_receipt(&self, receipt_id: &str) {
        self.send_frame(Frame::new(Command::Receipt).header("receipt-id", receipt_id));
    }

    /// Deliver a MESSAGE on a subscription.
    pub fn deliver(&self, subscription: &str, destination: &str, json: &str) {
        static NEXT_ID: AtomicUsize = AtomicUsize::new(1);
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        self.send_frame(
            Frame::new(Command::Message)
                .header("subscription", subscription)
                .header("destination", destination)
                .header("message-id", format!("m-{id}"))
                .header("content-type", "application/json")
                .body(json),
        );
    }
}

// =============================================================================
// Fake directory
// =============================================================================

/// Directory backed by a settable result. Optionally gated so a fetch stays
/// in flight until `release()`.
pub struct FakeDirectory {
    result: Mutex<Result<Vec<Identity>, DirectoryFetchError>>,
    calls: AtomicUsize,
    gate: Option<Arc<Notify>>,
}

impl FakeDirectory {
    pub fn new(online: Vec<Identity>) -> Self {
        Self {
            result: Mutex::new(Ok(online)),
            calls: AtomicUsize::new(0),
            gate: None,
        }
    }

    pub fn gated(online: Vec<Identity>) -> Self {
        Self {
            gate: Some(Arc::new(Notify::new())),
            ..Self::new(online)
        }
    }

    pub fn set_online(&self, online: Vec<Identity>) {
        *self.result.lock().unwrap() = Ok(online);
    }

    pub fn fail_with(&self, err: DirectoryFetchError) {
        *self.result.lock().unwrap() = Err(err);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Let one gated fetch complete.
    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.notify_one();
        }
    }
}

impl Directory for FakeDirectory {
    fn fetch_online(&self) -> BoxFuture<'_, Result<Vec<Identity>, DirectoryFetchError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.result.lock().unwrap().clone()
        })
    }
}

pub fn ids(online: &[&str]) -> Vec<Identity> {
    online.iter().map(|id| Identity::bare(*id)).collect()
}
