//! Logical channels multiplexed over the one transport connection.
//!
//! The router remembers every live subscription so it can replay them after
//! each reconnect; the broker forgets subscriptions when a link dies.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::error::{ProtocolError, PublishError, SendError};
use crate::model::Channel;
use crate::transport::Transport;
use crate::transport::stomp::{Command, Frame};

/// Where outbound frames go. The transport in production, a recorder in tests.
pub trait FrameSink: Send + Sync {
    fn send(&self, frame: Frame) -> Result<(), SendError>;

    /// Write all frames back-to-back, flushed once.
    fn send_batch(&self, frames: Vec<Frame>) -> Result<(), SendError>;
}

impl FrameSink for Transport {
    fn send(&self, frame: Frame) -> Result<(), SendError> {
        Transport::send(self, frame)
    }

    fn send_batch(&self, frames: Vec<Frame>) -> Result<(), SendError> {
        Transport::send_batch(self, frames)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub id: String,
    pub channel: Channel,
}

/// One fire-and-forget publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub destination: String,
    pub payload: String,
}

impl Publish {
    pub fn new(destination: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            payload: payload.into(),
        }
    }

    fn into_frame(self) -> Frame {
        Frame::send(&self.destination, self.payload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterEvent {
    Message { channel: Channel, body: String },
    /// Every subscription issued on the current link has been receipted.
    SubscriptionsAcknowledged,
    BrokerError(String),
}

pub struct ChannelRouter<S> {
    sink: S,
    /// Insertion-ordered so replays go out in the order they were first made.
    subscriptions: Vec<SubscriptionHandle>,
    pending_receipts: HashSet<String>,
    request_receipts: bool,
    open: bool,
    next_subscription: u64,
    next_receipt: u64,
}

impl<S: FrameSink> ChannelRouter<S> {
    pub fn new(sink: S, request_receipts: bool) -> Self {
        Self {
            sink,
            subscriptions: Vec::new(),
            pending_receipts: HashSet::new(),
            request_receipts,
            open: false,
            next_subscription: 0,
            next_receipt: 0,
        }
    }

    /// Register a channel. While the link is open the SUBSCRIBE goes out now;
    /// otherwise it is sent on the next `on_opened`.
    pub fn subscribe(&mut self, channel: Channel) -> SubscriptionHandle {
        self.next_subscription += 1;
        let handle = SubscriptionHandle {
            id: format!("sub-{}", self.next_subscription),
            channel,
        };
        self.subscriptions.push(handle.clone());

        if self.open {
            let frame = self.subscribe_frame(&handle);
            if let Err(e) = self.sink.send(frame) {
                debug!(subscription = %handle.id, error = %e, "subscribe deferred to next open");
            }
        }
        handle
    }

    pub fn unsubscribe(&mut self, handle: &SubscriptionHandle) {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.id != handle.id);
        if self.subscriptions.len() == before {
            return;
        }
        if self.open {
            if let Err(e) = self.sink.send(Frame::unsubscribe(&handle.id)) {
                debug!(subscription = %handle.id, error = %e, "unsubscribe not sent");
            }
        }
    }

    /// A new link is up: replay every live subscription, then `trailing`, in
    /// one write batch. Returns how many receipts are now outstanding.
    pub fn on_opened(&mut self, trailing: Vec<Publish>) -> Result<usize, SendError> {
        self.open = true;
        self.pending_receipts.clear();

        let mut frames = Vec::with_capacity(self.subscriptions.len() + trailing.len());
        for handle in self.subscriptions.clone() {
            frames.push(self.subscribe_frame(&handle));
        }
        frames.extend(trailing.into_iter().map(Publish::into_frame));

        debug!(
            subscriptions = self.subscriptions.len(),
            frames = frames.len(),
            "replaying subscriptions"
        );
        if frames.is_empty() {
            return Ok(0);
        }
        self.sink.send_batch(frames)?;
        Ok(self.pending_receipts.len())
    }

    /// The link is gone. Subscriptions stay registered for the next open.
    pub fn on_closed(&mut self) {
        self.open = false;
        self.pending_receipts.clear();
    }

    pub fn publish(&self, destination: &str, payload: String) -> Result<(), PublishError> {
        self.publish_batch(vec![Publish::new(destination, payload)])
    }

    /// Publish several items in one write batch.
    pub fn publish_batch(&self, items: Vec<Publish>) -> Result<(), PublishError> {
        if !self.open {
            return Err(SendError::NotConnected.into());
        }
        if items.is_empty() {
            return Ok(());
        }
        self.sink
            .send_batch(items.into_iter().map(Publish::into_frame).collect())?;
        Ok(())
    }

    /// Demultiplex one inbound frame.
    pub fn route(&mut self, frame: Frame) -> Result<Option<RouterEvent>, ProtocolError> {
        match frame.command {
            Command::Message => {
                let channel = self.channel_for(&frame)?;
                Ok(Some(RouterEvent::Message {
                    channel,
                    body: frame.body,
                }))
            }
            Command::Receipt => {
                let Some(id) = frame.get("receipt-id") else {
                    return Err(ProtocolError::MalformedHeader("RECEIPT without receipt-id".into()));
                };
                if !self.pending_receipts.remove(id) {
                    debug!(receipt = id, "ignoring unexpected receipt");
                    return Ok(None);
                }
                if self.pending_receipts.is_empty() {
                    Ok(Some(RouterEvent::SubscriptionsAcknowledged))
                } else {
                    Ok(None)
                }
            }
            Command::Error => {
                let message = frame
                    .get("message")
                    .map(str::to_string)
                    .unwrap_or_else(|| frame.body.clone());
                warn!(message = %message, "broker reported an error");
                Ok(Some(RouterEvent::BrokerError(message)))
            }
            other => {
                debug!(command = %other, "ignoring frame");
                Ok(None)
            }
        }
    }

    fn channel_for(&self, frame: &Frame) -> Result<Channel, ProtocolError> {
        if let Some(id) = frame.get("subscription") {
            if let Some(handle) = self.subscriptions.iter().find(|s| s.id == id) {
                return Ok(handle.channel.clone());
            }
        }
        if let Some(destination) = frame.get("destination") {
            if let Some(handle) = self
                .subscriptions
                .iter()
                .find(|s| s.channel.name == destination)
            {
                return Ok(handle.channel.clone());
            }
        }
        Err(ProtocolError::UnknownSubscription(
            frame
                .get("subscription")
                .or_else(|| frame.get("destination"))
                .unwrap_or_default()
                .to_string(),
        ))
    }

    fn subscribe_frame(&mut self, handle: &SubscriptionHandle) -> Frame {
        let receipt = if self.request_receipts {
            self.next_receipt += 1;
            let id = format!("rcpt-{}", self.next_receipt);
            self.pending_receipts.insert(id.clone());
            Some(id)
        } else {
            None
        };
        Frame::subscribe(&handle.id, &handle.channel.name, receipt.as_deref())
    }
}
