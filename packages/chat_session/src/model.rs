//! Core data types shared by every layer of the session.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// A participant. Unique per connected user, immutable for the session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub display_name: String,
}

impl Identity {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }

    /// Identity whose display name is its id.
    pub fn bare(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Broadcast,
    PrivateToSelf,
}

/// A logical channel, carried over the single physical connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Channel {
    /// Broker destination, e.g. `/topic/public`.
    pub name: String,
    pub kind: ChannelKind,
}

impl Channel {
    pub fn broadcast(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ChannelKind::Broadcast,
        }
    }

    pub fn private(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ChannelKind::PrivateToSelf,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    Join,
    Leave,
    Chat,
}

/// One chat/presence event, inbound or outbound.
///
/// `recipient == None` means broadcast. For inbound private traffic the
/// recipient is the local identity; for outbound it is the correspondent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEvent {
    pub sender: String,
    pub recipient: Option<String>,
    pub kind: EventKind,
    pub body: Option<String>,
    pub sent_at: DateTime<Utc>,
}

impl ChatEvent {
    pub fn chat(sender: &str, recipient: Option<&str>, body: &str, sent_at: DateTime<Utc>) -> Self {
        Self {
            sender: sender.to_string(),
            recipient: recipient.map(str::to_string),
            kind: EventKind::Chat,
            body: Some(body.to_string()),
            sent_at,
        }
    }

    pub fn presence(sender: &str, kind: EventKind, sent_at: DateTime<Utc>) -> Self {
        Self {
            sender: sender.to_string(),
            recipient: None,
            kind,
            body: None,
            sent_at,
        }
    }

    /// Text to show for this event. Join/Leave without a body get a synthesized notice.
    pub fn display_text(&self) -> String {
        match (&self.body, self.kind) {
            (Some(body), _) if !body.is_empty() => body.clone(),
            (_, EventKind::Join) => format!("{} joined the chat", self.sender),
            (_, EventKind::Leave) => format!("{} left the chat", self.sender),
            (_, EventKind::Chat) => String::new(),
        }
    }

    /// Conversation this event belongs to, seen from `local_id`.
    pub fn conversation_key(&self, local_id: &str) -> ConversationKey {
        match &self.recipient {
            None => ConversationKey::Broadcast,
            Some(recipient) if self.sender == local_id => ConversationKey::Direct(recipient.clone()),
            Some(_) => ConversationKey::Direct(self.sender.clone()),
        }
    }

    /// Decode a wire payload. A missing timestamp means "just now" (`received_at`).
    pub fn from_wire(json: &str, received_at: DateTime<Utc>) -> Result<Self, ProtocolError> {
        let wire: WireChatMessage =
            serde_json::from_str(json).map_err(|e| ProtocolError::Payload(e.to_string()))?;
        let sent_at = match wire.timestamp.as_deref() {
            None | Some("") => received_at,
            Some(ts) => parse_timestamp(ts)?,
        };
        Ok(Self {
            sender: wire.sender,
            recipient: wire.recipient.filter(|r| !r.is_empty()),
            kind: wire.kind,
            body: wire.content,
            sent_at,
        })
    }

    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&WireChatMessage {
            sender: self.sender.clone(),
            recipient: self.recipient.clone(),
            content: self.body.clone(),
            kind: self.kind,
            timestamp: Some(self.sent_at.to_rfc3339_opts(SecondsFormat::Millis, true)),
        })
    }
}

/// JSON payload exchanged with the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireChatMessage {
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

fn parse_timestamp(ts: &str) -> Result<DateTime<Utc>, ProtocolError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(ts) {
        return Ok(dt.with_timezone(&Utc));
    }
    // Servers that serialize a local date-time without an offset.
    NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|_| ProtocolError::Payload(format!("invalid timestamp {ts:?}")))
}

/// Current time truncated to milliseconds, the precision of the wire format.
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

/// Key of one conversation in the log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConversationKey {
    Broadcast,
    /// Private conversation with the given correspondent id.
    Direct(String),
}

impl ConversationKey {
    pub fn direct(id: impl Into<String>) -> Self {
        ConversationKey::Direct(id.into())
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationKey::Broadcast => f.write_str("broadcast"),
            ConversationKey::Direct(id) => f.write_str(id),
        }
    }
}

/// Roster entry for one online identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub identity: Identity,
    pub last_seen_at: DateTime<Utc>,
}
