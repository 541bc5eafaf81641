//! Session task and its handle.
//!
//! One task per session owns the transport subscription, router, presence
//! tracker and conversation log. Inbound frames are processed strictly in
//! order (demux, presence, log, notify). The view layer talks to the task
//! through a cloneable `SessionHandle`.

pub mod state;

#[cfg(test)]
mod e2e_tests;

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::conversation::{ConversationLog, Delivery, LogEntry};
use crate::directory::Directory;
use crate::error::{ConnectError, DirectoryFetchError, ProtocolError, PublishError, SessionError};
use crate::model::{Channel, ChannelKind, ChatEvent, ConversationKey, EventKind, Identity, PresenceEntry, now_millis};
use crate::presence::{PresenceTracker, SnapshotTicket};
use crate::router::{ChannelRouter, Publish, RouterEvent};
use crate::transport::link::Connector;
use crate::transport::{Credentials, Transport, TransportError, TransportEvent};

pub use state::SessionState;
use state::{Action, Lifecycle, LifecycleSignal};

/// Notifications for the view layer, in processing order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    Appended {
        key: ConversationKey,
        entry: LogEntry,
    },
    DeliveryChanged {
        key: ConversationKey,
        entry: LogEntry,
    },
    RosterChanged(Vec<PresenceEntry>),
    BrokerError(String),
    DirectoryFetchFailed(DirectoryFetchError),
}

type RosterReply = oneshot::Sender<Result<Vec<PresenceEntry>, DirectoryFetchError>>;

enum SessionCommand {
    Send {
        body: String,
        recipient: Option<String>,
        respond_to: oneshot::Sender<Result<LogEntry, PublishError>>,
    },
    Roster {
        respond_to: oneshot::Sender<Vec<PresenceEntry>>,
    },
    RefreshRoster {
        respond_to: RosterReply,
    },
    Conversation {
        key: ConversationKey,
        respond_to: oneshot::Sender<Vec<LogEntry>>,
    },
    Conversations {
        respond_to: oneshot::Sender<Vec<ConversationKey>>,
    },
    Logout {
        respond_to: oneshot::Sender<()>,
    },
}

/// Handle to a running session. Cheap to clone.
#[derive(Clone)]
pub struct SessionHandle {
    sender: mpsc::Sender<SessionCommand>,
    events: broadcast::Sender<SessionEvent>,
    state: watch::Receiver<SessionState>,
    identity: Arc<Identity>,
}

impl SessionHandle {
    /// Start a session: connect, subscribe, announce, and fetch the initial
    /// roster snapshot. Must be called inside a tokio runtime.
    ///
    /// Fails only for an endpoint that can never work; an unreachable broker
    /// is retried in the background.
    pub fn start(
        config: SessionConfig,
        identity: Identity,
        credentials: Credentials,
        connector: Arc<dyn Connector>,
        directory: Arc<dyn Directory>,
    ) -> Result<Self, SessionError> {
        let transport = Transport::new(connector, config.transport.clone());
        let transport_events = transport.feed();
        let (events, _) = broadcast::channel(config.event_capacity.max(16));
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let (sender, commands) = mpsc::channel(64);
        let (fetch_tx, fetch_rx) = mpsc::channel(4);

        let mut actor = SessionActor {
            router: ChannelRouter::new(transport.clone(), config.await_receipts),
            presence: PresenceTracker::new(identity.id.clone()),
            log: ConversationLog::new(),
            lifecycle: Lifecycle::new(config.reannounce_after),
            identity: identity.clone(),
            credentials,
            config,
            transport,
            directory,
            events: events.clone(),
            state_tx,
            fetch_tx,
            fetch_in_flight: None,
            fetch_waiters: Vec::new(),
            receipt_deadline: None,
        };

        let broadcast_topic = actor.config.channels.broadcast_topic.clone();
        let private_queue = actor.config.channels.private_queue_for(&identity.id);
        actor.router.subscribe(Channel::broadcast(broadcast_topic));
        actor.router.subscribe(Channel::private(private_queue));

        actor.apply(LifecycleSignal::Start)?;
        actor.begin_directory_fetch(None);

        info!(id = %identity.id, endpoint = %actor.config.transport.endpoint, "session started");
        tokio::spawn(actor.run(commands, transport_events, fetch_rx));

        Ok(Self {
            sender,
            events,
            state: state_rx,
            identity: Arc::new(identity),
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(make(tx))
            .await
            .map_err(|_| SessionError::Ended)?;
        rx.await.map_err(|_| SessionError::Ended)
    }

    /// Send a chat message to everyone (`recipient = None`) or to one identity.
    ///
    /// The message is logged before it is published. On failure it stays in
    /// the log as `Unconfirmed` and the error is returned; there is no retry.
    pub async fn send(&self, body: &str, recipient: Option<&str>) -> Result<LogEntry, SessionError> {
        let body = body.to_string();
        let recipient = recipient.map(str::to_string);
        Ok(self
            .request(|respond_to| SessionCommand::Send {
                body,
                recipient,
                respond_to,
            })
            .await??)
    }

    pub async fn roster(&self) -> Result<Vec<PresenceEntry>, SessionError> {
        self.request(|respond_to| SessionCommand::Roster { respond_to })
            .await
    }

    /// Fetch a fresh directory snapshot and return the reconciled roster.
    /// Concurrent refreshes share one fetch.
    pub async fn refresh_roster(&self) -> Result<Vec<PresenceEntry>, SessionError> {
        Ok(self
            .request(|respond_to| SessionCommand::RefreshRoster { respond_to })
            .await??)
    }

    /// Full history of one conversation, oldest first.
    pub async fn conversation(&self, key: ConversationKey) -> Result<Vec<LogEntry>, SessionError> {
        self.request(|respond_to| SessionCommand::Conversation { key, respond_to })
            .await
    }

    pub async fn conversations(&self) -> Result<Vec<ConversationKey>, SessionError> {
        self.request(|respond_to| SessionCommand::Conversations { respond_to })
            .await
    }

    /// Announce Leave (when a link is usable) and close the connection.
    /// Idempotent; returns once the request is accepted.
    pub async fn logout(&self) -> Result<(), SessionError> {
        match self
            .request(|respond_to| SessionCommand::Logout { respond_to })
            .await
        {
            Ok(()) | Err(SessionError::Ended) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Resolves when the session task has finished.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        while state.changed().await.is_ok() {}
    }
}

struct SessionActor {
    identity: Identity,
    config: SessionConfig,
    credentials: Credentials,
    transport: Transport,
    router: ChannelRouter<Transport>,
    presence: PresenceTracker,
    log: ConversationLog,
    lifecycle: Lifecycle,
    directory: Arc<dyn Directory>,
    events: broadcast::Sender<SessionEvent>,
    state_tx: watch::Sender<SessionState>,
    fetch_tx: mpsc::Sender<Result<Vec<Identity>, DirectoryFetchError>>,
    fetch_in_flight: Option<SnapshotTicket>,
    fetch_waiters: Vec<RosterReply>,
    receipt_deadline: Option<Instant>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        mut fetch_results: mpsc::Receiver<Result<Vec<Identity>, DirectoryFetchError>>,
    ) {
        let mut commands_open = true;

        while !self.lifecycle.is_terminal() {
            let receipt_deadline = self.receipt_deadline;
            let receipt_timer = async move {
                match receipt_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                event = transport_events.recv() => match event {
                    Some(event) => self.on_transport_event(event),
                    None => break,
                },

                command = commands.recv(), if commands_open => match command {
                    Some(command) => self.on_command(command),
                    None => {
                        debug!("all session handles dropped, logging out");
                        commands_open = false;
                        self.signal(LifecycleSignal::LogoutRequested);
                    }
                },

                Some(result) = fetch_results.recv() => self.on_directory_result(result),

                () = receipt_timer => {
                    self.receipt_deadline = None;
                    warn!(
                        timeout_ms = self.config.receipt_timeout.as_millis() as u64,
                        "subscription receipts did not arrive, continuing without them"
                    );
                    self.signal(LifecycleSignal::ReceiptTimeout);
                }
            }
        }

        self.transport.close();
        info!(id = %self.identity.id, "session ended");
    }

    /// Feed the lifecycle and carry out its actions.
    fn apply(&mut self, signal: LifecycleSignal) -> Result<(), ConnectError> {
        let transition = self.lifecycle.process(signal, Instant::now());
        if let Some(state) = transition.state {
            self.state_tx.send_replace(state);
            self.emit(SessionEvent::StateChanged(state));
            if state != SessionState::Joining {
                self.receipt_deadline = None;
            }
        }
        for action in transition.actions {
            match action {
                Action::Connect => {
                    self.transport
                        .connect(&self.config.transport.endpoint, self.credentials.clone())?;
                }
                Action::Subscribe { announce } => self.open_channels(announce),
                Action::MarkGap => self.log.mark_gap(),
                Action::AnnounceLeave => self.announce(EventKind::Leave),
                Action::CloseTransport => self.transport.close(),
            }
        }
        Ok(())
    }

    fn signal(&mut self, signal: LifecycleSignal) {
        if let Err(e) = self.apply(signal) {
            warn!(error = %e, ?signal, "lifecycle action failed");
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn presence_payload(&self, kind: EventKind) -> Result<String, PublishError> {
        ChatEvent::presence(&self.identity.id, kind, now_millis())
            .to_wire()
            .map_err(|e| PublishError::Encode(e.to_string()))
    }

    /// Replay subscriptions on a fresh link, with Join after them when announcing.
    fn open_channels(&mut self, announce: bool) {
        let mut trailing = Vec::new();
        if announce {
            match self.presence_payload(EventKind::Join) {
                Ok(payload) => trailing.push(Publish::new(
                    self.config.channels.join_destination.as_str(),
                    payload,
                )),
                Err(e) => warn!(error = %e, "failed to encode join"),
            }
        }

        match self.router.on_opened(trailing) {
            Ok(0) => self.signal(LifecycleSignal::SubscriptionsAcknowledged),
            Ok(pending) => {
                debug!(pending, "awaiting subscription receipts");
                self.receipt_deadline = Some(Instant::now() + self.config.receipt_timeout);
            }
            // The link died under us; its Closed event drives the reconnect.
            Err(e) => warn!(error = %e, "failed to replay subscriptions"),
        }
        if announce {
            info!(id = %self.identity.id, "announced join");
        }
    }

    fn announce(&mut self, kind: EventKind) {
        let destination = match kind {
            EventKind::Leave => self.config.channels.leave_destination.clone(),
            _ => self.config.channels.join_destination.clone(),
        };
        let result = self
            .presence_payload(kind)
            .and_then(|payload| self.router.publish(&destination, payload));
        match result {
            Ok(()) => info!(id = %self.identity.id, ?kind, "announced presence"),
            Err(e) => warn!(error = %e, ?kind, "failed to announce presence"),
        }
    }

    // ── transport events ────────────────────────────────────────────────

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened { heartbeat } => {
                debug!(?heartbeat, "transport opened");
                self.signal(LifecycleSignal::Opened);
            }
            TransportEvent::Frame(frame) => match self.router.route(frame) {
                Ok(Some(RouterEvent::Message { channel, body })) => self.on_message(channel, &body),
                Ok(Some(RouterEvent::SubscriptionsAcknowledged)) => {
                    self.signal(LifecycleSignal::SubscriptionsAcknowledged);
                }
                Ok(Some(RouterEvent::BrokerError(message))) => {
                    self.emit(SessionEvent::BrokerError(message));
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "dropping frame"),
            },
            TransportEvent::Closed(reason) => {
                self.router.on_closed();
                if reason.is_requested() {
                    self.signal(LifecycleSignal::Closed);
                } else {
                    self.signal(LifecycleSignal::LinkLost);
                }
            }
            TransportEvent::Error(TransportError::Connect(e)) => {
                debug!(error = %e, "connect attempt failed");
                self.signal(LifecycleSignal::LinkLost);
            }
            TransportEvent::Error(TransportError::Protocol(e)) => {
                debug!(error = %e, "transport dropped a malformed frame");
            }
        }
    }

    fn on_message(&mut self, channel: Channel, body: &str) {
        let mut event = match ChatEvent::from_wire(body, now_millis()) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, channel = %channel.name, "dropping frame");
                return;
            }
        };
        let local = self.identity.id.clone();

        let recipient = event.recipient.clone();
        match (channel.kind, recipient.as_deref()) {
            (ChannelKind::PrivateToSelf, None) => event.recipient = Some(local.clone()),
            (ChannelKind::PrivateToSelf, Some(recipient)) if recipient != local => {
                let e = ProtocolError::Misaddressed {
                    recipient: recipient.to_string(),
                    local,
                };
                warn!(error = %e, "dropping frame");
                return;
            }
            // The public topic relays every private message.
            (ChannelKind::Broadcast, Some(recipient)) if recipient != local && event.sender != local => {
                debug!(sender = %event.sender, "skipping private message between others");
                return;
            }
            _ => {}
        }

        let key = event.conversation_key(&local);
        // Private messages can arrive on both the topic and the queue.
        if event.sender != local && matches!(key, ConversationKey::Direct(_)) && self.log.contains_copy(&key, &event) {
            debug!(sender = %event.sender, "skipping duplicate private message");
            return;
        }

        if matches!(event.kind, EventKind::Join | EventKind::Leave) && self.presence.on_event(&event) {
            self.emit(SessionEvent::RosterChanged(self.presence.roster()));
        }

        if event.sender == local && event.kind == EventKind::Chat {
            self.confirm_or_append(key, event);
        } else {
            self.append(key, event, Delivery::Received);
        }
    }

    /// An echo of our own message: confirm the logged entry, or log it if it
    /// was sent from elsewhere.
    fn confirm_or_append(&mut self, key: ConversationKey, event: ChatEvent) {
        match self.log.confirm_echo(&key, &event) {
            Some(entry) => self.emit(SessionEvent::DeliveryChanged { key, entry }),
            None if self.log.contains_copy(&key, &event) => {
                debug!(conversation = %key, "echo already logged");
            }
            None => {
                self.append(key, event, Delivery::Received);
            }
        }
    }

    fn append(&mut self, key: ConversationKey, event: ChatEvent, delivery: Delivery) -> LogEntry {
        let entry = self.log.append(key.clone(), event, delivery);
        if entry.out_of_order {
            debug!(conversation = %key, seq = entry.seq, "entry is earlier than its predecessor");
        }
        self.emit(SessionEvent::Appended {
            key,
            entry: entry.clone(),
        });
        entry
    }

    // ── commands ────────────────────────────────────────────────────────

    fn on_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Send {
                body,
                recipient,
                respond_to,
            } => {
                let _ = respond_to.send(self.send(body, recipient));
            }
            SessionCommand::Roster { respond_to } => {
                let _ = respond_to.send(self.presence.roster());
            }
            SessionCommand::RefreshRoster { respond_to } => {
                self.begin_directory_fetch(Some(respond_to));
            }
            SessionCommand::Conversation { key, respond_to } => {
                let _ = respond_to.send(self.log.conversation(&key).cloned().collect());
            }
            SessionCommand::Conversations { respond_to } => {
                let _ = respond_to.send(self.log.keys());
            }
            SessionCommand::Logout { respond_to } => {
                info!(id = %self.identity.id, state = %self.lifecycle.state(), "logout requested");
                self.signal(LifecycleSignal::LogoutRequested);
                let _ = respond_to.send(());
            }
        }
    }

    fn send(&mut self, body: String, recipient: Option<String>) -> Result<LogEntry, PublishError> {
        let event = ChatEvent::chat(&self.identity.id, recipient.as_deref(), &body, now_millis());
        let key = match &recipient {
            Some(id) => ConversationKey::direct(id.clone()),
            None => ConversationKey::Broadcast,
        };

        let state = self.lifecycle.state();
        if state != SessionState::Active {
            self.append(key, event, Delivery::Unconfirmed);
            return Err(PublishError::NotActive {
                state: state.to_string(),
            });
        }

        let entry = self.append(key.clone(), event.clone(), Delivery::Sent);
        let published = event
            .to_wire()
            .map_err(|e| PublishError::Encode(e.to_string()))
            .and_then(|payload| {
                self.router
                    .publish(&self.config.channels.send_destination, payload)
            });

        match published {
            Ok(()) => Ok(entry),
            Err(e) => {
                warn!(error = %e, conversation = %key, "publish failed, message left unconfirmed");
                if let Some(entry) = self.log.set_delivery(&key, entry.seq, Delivery::Unconfirmed) {
                    self.emit(SessionEvent::DeliveryChanged { key, entry });
                }
                Err(e)
            }
        }
    }

    // ── directory ───────────────────────────────────────────────────────

    /// Start a snapshot fetch unless one is in flight; either way `waiter`
    /// gets that fetch's result.
    fn begin_directory_fetch(&mut self, waiter: Option<RosterReply>) {
        self.fetch_waiters.extend(waiter);
        if self.fetch_in_flight.is_some() {
            debug!(waiters = self.fetch_waiters.len(), "directory fetch already in flight");
            return;
        }

        self.fetch_in_flight = Some(self.presence.begin_snapshot());
        let directory = self.directory.clone();
        let results = self.fetch_tx.clone();
        tokio::spawn(async move {
            let result = directory.fetch_online().await;
            let _ = results.send(result).await;
        });
    }

    fn on_directory_result(&mut self, result: Result<Vec<Identity>, DirectoryFetchError>) {
        let Some(ticket) = self.fetch_in_flight.take() else {
            return;
        };
        let waiters = std::mem::take(&mut self.fetch_waiters);

        match result {
            Ok(online) => {
                let local = &self.identity.id;
                let snapshot: Vec<Identity> = online.into_iter().filter(|i| &i.id != local).collect();
                debug!(count = snapshot.len(), "directory snapshot received");
                if self.presence.reconcile_from(ticket, snapshot) {
                    self.emit(SessionEvent::RosterChanged(self.presence.roster()));
                }
                let roster = self.presence.roster();
                for waiter in waiters {
                    let _ = waiter.send(Ok(roster.clone()));
                }
            }
            Err(e) => {
                warn!(error = %e, "directory fetch failed, keeping last-known roster");
                self.emit(SessionEvent::DirectoryFetchFailed(e.clone()));
                for waiter in waiters {
                    let _ = waiter.send(Err(e.clone()));
                }
            }
        }
    }
}
