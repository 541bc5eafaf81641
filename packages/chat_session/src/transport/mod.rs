//! Transport adapter: one physical broker connection at a time.
//!
//! - `stomp`: frame codec
//! - `link`: physical link seam (`Connector`, `WsConnector`)
//!
//! The supervisor task owns the link. It performs the STOMP handshake,
//! exchanges heartbeats, and on unexpected loss waits a fixed delay and
//! reconnects, forever, until `close()` cancels it.
//!
//! Events go out twice: on lossless `feed()` receivers for owners that must
//! see every frame, and on a bounded broadcast for other observers, which
//! may lag.

pub mod link;
pub mod stomp;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::TransportConfig;
use crate::error::{ConnectError, ProtocolError, SendError};

use self::link::{Connector, Link, LinkStream};
use self::stomp::{Command, Frame, HEARTBEAT, Inbound};

/// What the broker is told about who is connecting.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub login: String,
    /// Opaque token established elsewhere; sent as a bearer `Authorization`
    /// header and as `passcode`.
    pub token: Option<String>,
}

/// Negotiated heartbeat intervals. `None` = disabled in that direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Heartbeat {
    pub outgoing: Option<Duration>,
    pub incoming: Option<Duration>,
}

impl Heartbeat {
    /// STOMP negotiation: each direction uses the larger of the two wishes,
    /// and is off if either side says 0.
    pub fn negotiate(ours_out: Duration, ours_in: Duration, server_header: Option<&str>) -> Self {
        let (server_out, server_in) = server_header
            .and_then(|h| h.split_once(','))
            .map(|(sx, sy)| {
                (
                    sx.trim().parse::<u64>().unwrap_or(0),
                    sy.trim().parse::<u64>().unwrap_or(0),
                )
            })
            .unwrap_or((0, 0));

        let pick = |ours: Duration, theirs_ms: u64| {
            if ours.is_zero() || theirs_ms == 0 {
                None
            } else {
                Some(ours.max(Duration::from_millis(theirs_ms)))
            }
        };

        Self {
            outgoing: pick(ours_out, server_in),
            incoming: pick(ours_in, server_out),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called by the owner.
    Requested,
    /// The peer ended the stream.
    PeerClosed,
    /// Two expected heartbeats went missing.
    HeartbeatTimeout,
    /// Read or write on the link failed.
    LinkFailed(String),
}

impl CloseReason {
    pub fn is_requested(&self) -> bool {
        matches!(self, CloseReason::Requested)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Transport events, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened { heartbeat: Heartbeat },
    Frame(Frame),
    Closed(CloseReason),
    Error(TransportError),
}

/// Frames queued for the link that was current when they were sent.
struct OutboundBatch {
    generation: u64,
    frames: Vec<String>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    config: TransportConfig,
    events: broadcast::Sender<TransportEvent>,
    feeds: Mutex<Vec<mpsc::UnboundedSender<TransportEvent>>>,
    outbound_tx: mpsc::UnboundedSender<OutboundBatch>,
    /// Taken by the supervisor on `connect`.
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<OutboundBatch>>>,
    open: AtomicBool,
    closed: AtomicBool,
    generation: AtomicU64,
    cancel: CancellationToken,
}

/// Handle to the transport adapter. Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl Transport {
    pub fn new(connector: Arc<dyn Connector>, config: TransportConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(16));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                connector,
                config,
                events,
                feeds: Mutex::new(Vec::new()),
                outbound_tx,
                outbound_rx: Mutex::new(Some(outbound_rx)),
                open: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Observe transport events. A receiver that falls more than
    /// `event_capacity` behind skips events; use `feed` when that matters.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }

    /// Every event from now on, in order, with nothing skipped. Take it
    /// before `connect` to see the first `Opened`.
    pub fn feed(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut feeds) = self.inner.feeds.lock() {
            feeds.push(tx);
        }
        rx
    }

    /// Validate the endpoint and start the supervisor.
    ///
    /// Only an invalid endpoint or a second call fail here; an unreachable
    /// broker is reported as `TransportEvent::Error` and retried.
    pub fn connect(&self, endpoint: &str, credentials: Credentials) -> Result<(), ConnectError> {
        let uri = endpoint
            .parse::<Uri>()
            .map_err(|e| ConnectError::InvalidEndpoint {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;
        let Some(host) = uri.host().map(str::to_string) else {
            return Err(ConnectError::InvalidEndpoint {
                endpoint: endpoint.to_string(),
                reason: "missing host".to_string(),
            });
        };
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ConnectError::Handshake("transport already closed".to_string()));
        }

        let outbound_rx = self
            .inner
            .outbound_rx
            .lock()
            .map_err(|_| ConnectError::AlreadyConnected)?
            .take()
            .ok_or(ConnectError::AlreadyConnected)?;

        let virtual_host = self.inner.config.virtual_host.clone().unwrap_or(host);
        let inner = self.inner.clone();
        let endpoint = endpoint.to_string();
        tokio::spawn(async move {
            supervise(inner, endpoint, virtual_host, credentials, outbound_rx).await;
        });
        Ok(())
    }

    /// Queue one frame on the current link. Fails fast when not connected.
    pub fn send(&self, frame: Frame) -> Result<(), SendError> {
        self.send_batch(vec![frame])
    }

    /// Queue frames to be written back-to-back with a single flush.
    pub fn send_batch(&self, frames: Vec<Frame>) -> Result<(), SendError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(SendError::Closed);
        }
        if !self.inner.open.load(Ordering::SeqCst) {
            return Err(SendError::NotConnected);
        }
        let batch = OutboundBatch {
            generation: self.inner.generation.load(Ordering::SeqCst),
            frames: frames.iter().map(Frame::encode).collect(),
        };
        self.inner
            .outbound_tx
            .send(batch)
            .map_err(|_| SendError::Closed)
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// Stop heartbeats and the reconnect loop. Frames already queued are
    /// flushed, then DISCONNECT is sent best-effort. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("transport close requested");
        self.inner.cancel.cancel();

        // Never started: nobody else will report the close.
        let never_started = self
            .inner
            .outbound_rx
            .lock()
            .map(|rx| rx.is_some())
            .unwrap_or(false);
        if never_started {
            self.inner.emit(TransportEvent::Closed(CloseReason::Requested));
        }
    }
}

impl Inner {
    fn emit(&self, event: TransportEvent) {
        if let Ok(mut feeds) = self.feeds.lock() {
            feeds.retain(|feed| feed.send(event.clone()).is_ok());
        }
        let _ = self.events.send(event);
    }
}

async fn supervise(
    inner: Arc<Inner>,
    endpoint: String,
    virtual_host: String,
    credentials: Credentials,
    mut outbound_rx: mpsc::UnboundedReceiver<OutboundBatch>,
) {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let opened = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            result = open_link(&inner, &endpoint, &virtual_host, &credentials) => result,
        };

        match opened {
            Ok((link, heartbeat, leftovers)) => {
                info!(endpoint = %endpoint, attempt, ?heartbeat, "broker connection opened");
                attempt = 0;
                let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
                inner.open.store(true, Ordering::SeqCst);
                inner.emit(TransportEvent::Opened { heartbeat });
                for frame in leftovers {
                    inner.emit(TransportEvent::Frame(frame));
                }

                let reason = run_link(&inner, link, heartbeat, generation, &mut outbound_rx).await;
                inner.open.store(false, Ordering::SeqCst);

                if reason.is_requested() {
                    info!(endpoint = %endpoint, "broker connection closed by owner");
                    inner.emit(TransportEvent::Closed(reason));
                    return;
                }
                warn!(endpoint = %endpoint, ?reason, "broker connection lost, will reconnect");
                inner.emit(TransportEvent::Closed(reason));
            }
            Err(e) => {
                warn!(endpoint = %endpoint, attempt, error = %e, "connect failed, will retry");
                inner.emit(TransportEvent::Error(e.into()));
            }
        }

        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = tokio::time::sleep(inner.config.reconnect_delay) => {}
        }
    }

    inner.open.store(false, Ordering::SeqCst);
    inner.emit(TransportEvent::Closed(CloseReason::Requested));
}

/// Connect the physical link and complete the STOMP handshake.
async fn open_link(
    inner: &Inner,
    endpoint: &str,
    virtual_host: &str,
    credentials: &Credentials,
) -> Result<(Link, Heartbeat, Vec<Frame>), ConnectError> {
    let config = &inner.config;
    let mut link = tokio::time::timeout(config.connect_timeout, inner.connector.connect(endpoint))
        .await
        .map_err(|_| ConnectError::HandshakeTimeout)??;

    let mut connect = Frame::new(Command::Connect)
        .header("accept-version", "1.2")
        .header("host", virtual_host)
        .header(
            "heart-beat",
            format!(
                "{},{}",
                config.heartbeat_outgoing.as_millis(),
                config.heartbeat_incoming.as_millis()
            ),
        );
    if !credentials.login.is_empty() {
        connect = connect.header("login", credentials.login.as_str());
    }
    if let Some(token) = &credentials.token {
        connect = connect
            .header("Authorization", format!("Bearer {token}"))
            .header("passcode", token.as_str());
    }

    link.sink
        .send(connect.encode())
        .await
        .map_err(|e| ConnectError::Unreachable(e.to_string()))?;

    let (connected, leftovers) = tokio::time::timeout(config.connect_timeout, await_connected(&mut link.stream))
        .await
        .map_err(|_| ConnectError::HandshakeTimeout)??;

    let heartbeat = Heartbeat::negotiate(
        config.heartbeat_outgoing,
        config.heartbeat_incoming,
        connected.get("heart-beat"),
    );
    Ok((link, heartbeat, leftovers))
}

/// Read until CONNECTED. Frames that arrive in the same message after it are returned.
async fn await_connected(stream: &mut LinkStream) -> Result<(Frame, Vec<Frame>), ConnectError> {
    while let Some(message) = stream.next().await {
        let text = message
            .map_err(|e| ConnectError::Unreachable(e.to_string()))?
            .into_text()
            .map_err(|e| ConnectError::Handshake(e.to_string()))?;
        let items = stomp::decode(&text).map_err(|e| ConnectError::Handshake(e.to_string()))?;
        let mut frames = items.into_iter().filter_map(|item| match item {
            Inbound::Frame(frame) => Some(frame),
            Inbound::Heartbeat => None,
        });
        let Some(first) = frames.next() else {
            continue;
        };
        return match first.command {
            Command::Connected => Ok((first, frames.collect())),
            Command::Error => Err(ConnectError::Handshake(
                first
                    .get("message")
                    .map(str::to_string)
                    .unwrap_or_else(|| first.body.clone()),
            )),
            other => Err(ConnectError::Handshake(format!("expected CONNECTED, got {other}"))),
        };
    }
    Err(ConnectError::Unreachable("closed during handshake".to_string()))
}

/// Pump one established link until it ends. Returns why it ended.
async fn run_link(
    inner: &Inner,
    link: Link,
    heartbeat: Heartbeat,
    generation: u64,
    outbound_rx: &mut mpsc::UnboundedReceiver<OutboundBatch>,
) -> CloseReason {
    let Link {
        mut sink,
        mut stream,
    } = link;

    let mut ticker = heartbeat.outgoing.map(|every| {
        let mut t = tokio::time::interval_at(Instant::now() + every, every);
        t.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        t
    });
    // Two missed heartbeats = dead peer.
    let read_deadline = heartbeat.incoming.map(|every| every * 2);
    let idle = tokio::time::sleep(read_deadline.unwrap_or(Duration::from_secs(86_400)));
    tokio::pin!(idle);

    loop {
        tokio::select! {
            biased;

            _ = inner.cancel.cancelled() => {
                while let Ok(batch) = outbound_rx.try_recv() {
                    if batch.generation != generation {
                        continue;
                    }
                    for text in batch.frames {
                        if sink.feed(text).await.is_err() {
                            break;
                        }
                    }
                }
                let _ = sink.feed(Frame::new(Command::Disconnect).encode()).await;
                let _ = sink.flush().await;
                let _ = sink.close().await;
                return CloseReason::Requested;
            }

            batch = outbound_rx.recv() => {
                let Some(batch) = batch else {
                    return CloseReason::Requested;
                };
                if batch.generation != generation {
                    trace!(stale = batch.generation, current = generation, "dropping frames queued for a previous link");
                    continue;
                }
                let mut written = batch.frames.len();
                let mut failed = None;
                for text in batch.frames {
                    if let Err(e) = sink.feed(text).await {
                        failed = Some(e);
                        break;
                    }
                }
                // Coalesce whatever else is already queued into this flush.
                while failed.is_none() {
                    let Ok(more) = outbound_rx.try_recv() else { break };
                    if more.generation != generation {
                        continue;
                    }
                    written += more.frames.len();
                    for text in more.frames {
                        if let Err(e) = sink.feed(text).await {
                            failed = Some(e);
                            break;
                        }
                    }
                }
                if failed.is_none() {
                    if let Err(e) = sink.flush().await {
                        failed = Some(e);
                    }
                }
                if let Some(e) = failed {
                    return CloseReason::LinkFailed(e.to_string());
                }
                trace!(frames = written, "flushed outbound frames");
            }

            message = stream.next() => {
                let message = match message {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => return CloseReason::LinkFailed(e.to_string()),
                    None => return CloseReason::PeerClosed,
                };
                if let Some(deadline) = read_deadline {
                    idle.as_mut().reset(Instant::now() + deadline);
                }
                match message.into_text().and_then(|text| stomp::decode(&text)) {
                    Ok(items) => {
                        for item in items {
                            match item {
                                Inbound::Heartbeat => trace!("heartbeat received"),
                                Inbound::Frame(frame) => inner.emit(TransportEvent::Frame(frame)),
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "dropping malformed frame");
                        inner.emit(TransportEvent::Error(e.into()));
                    }
                }
            }

            _ = async {
                match ticker.as_mut() {
                    Some(t) => { t.tick().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {
                if let Err(e) = sink.send(HEARTBEAT.to_string()).await {
                    return CloseReason::LinkFailed(e.to_string());
                }
                trace!("heartbeat sent");
            }

            () = &mut idle, if read_deadline.is_some() => {
                return CloseReason::HeartbeatTimeout;
            }
        }
    }
}
