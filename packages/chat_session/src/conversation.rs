//! Per-conversation, append-only message ledger.
//!
//! Entries are kept in arrival order. Timestamp anomalies are flagged on the
//! entry, never fixed by reordering.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::model::{ChatEvent, ConversationKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Inbound from another participant.
    Received,
    /// Local, handed to the transport; echo not seen yet.
    Sent,
    /// Local, and the broker's echo was observed.
    Confirmed,
    /// Local, the publish failed. Never retried automatically.
    Unconfirmed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Position within its conversation, from 0.
    pub seq: u64,
    pub event: ChatEvent,
    pub delivery: Delivery,
    pub out_of_order: bool,
    pub after_gap: bool,
}

#[derive(Debug, Default)]
struct Conversation {
    entries: Vec<LogEntry>,
    latest_sent_at: Option<DateTime<Utc>>,
    /// The next inbound entry follows a reconnect.
    gap_pending: bool,
    /// Gap generation this conversation has caught up with.
    gap_generation: u64,
}

#[derive(Debug, Default)]
pub struct ConversationLog {
    conversations: BTreeMap<ConversationKey, Conversation>,
    /// Bumped on every reconnect.
    gap_generation: u64,
}

impl ConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, key: ConversationKey, event: ChatEvent, delivery: Delivery) -> LogEntry {
        let gap_generation = self.gap_generation;
        let conversation = self
            .conversations
            .entry(key)
            .or_insert_with(|| Conversation {
                gap_generation,
                ..Conversation::default()
            });
        if conversation.gap_generation != gap_generation {
            conversation.gap_pending = true;
            conversation.gap_generation = gap_generation;
        }

        let out_of_order = conversation
            .latest_sent_at
            .is_some_and(|latest| event.sent_at < latest);
        if !out_of_order {
            conversation.latest_sent_at = Some(event.sent_at);
        }

        let after_gap = conversation.gap_pending && delivery == Delivery::Received;
        if after_gap {
            conversation.gap_pending = false;
        }

        let entry = LogEntry {
            seq: conversation.entries.len() as u64,
            event,
            delivery,
            out_of_order,
            after_gap,
        };
        conversation.entries.push(entry.clone());
        entry
    }

    /// Full history of one conversation. Each call starts from the first entry.
    pub fn conversation(&self, key: &ConversationKey) -> impl Iterator<Item = &LogEntry> + '_ {
        self.conversations
            .get(key)
            .map(|c| c.entries.as_slice())
            .unwrap_or_default()
            .iter()
    }

    pub fn keys(&self) -> Vec<ConversationKey> {
        self.conversations.keys().cloned().collect()
    }

    pub fn len(&self, key: &ConversationKey) -> usize {
        self.conversations.get(key).map_or(0, |c| c.entries.len())
    }

    /// Update a local entry's delivery status. Returns the updated entry.
    pub fn set_delivery(&mut self, key: &ConversationKey, seq: u64, delivery: Delivery) -> Option<LogEntry> {
        let entry = self
            .conversations
            .get_mut(key)?
            .entries
            .get_mut(usize::try_from(seq).ok()?)?;
        if entry.delivery == delivery {
            return None;
        }
        entry.delivery = delivery;
        Some(entry.clone())
    }

    /// If `echo` is the broker's copy of a `Sent` local entry, mark that entry
    /// `Confirmed` and return it. The echo itself is not appended.
    pub fn confirm_echo(&mut self, key: &ConversationKey, echo: &ChatEvent) -> Option<LogEntry> {
        let conversation = self.conversations.get_mut(key)?;
        let entry = conversation.entries.iter_mut().find(|entry| {
            matches!(entry.delivery, Delivery::Sent | Delivery::Unconfirmed) && same_message(&entry.event, echo)
        })?;
        entry.delivery = Delivery::Confirmed;
        Some(entry.clone())
    }

    /// Whether `event` is already logged under `key`, e.g. a private message
    /// that also arrived on another channel.
    pub fn contains_copy(&self, key: &ConversationKey, event: &ChatEvent) -> bool {
        self.conversation(key).any(|entry| same_message(&entry.event, event))
    }

    /// A reconnect happened: the next inbound entry of every existing
    /// conversation is flagged `after_gap`.
    pub fn mark_gap(&mut self) {
        self.gap_generation += 1;
    }
}

fn same_message(a: &ChatEvent, b: &ChatEvent) -> bool {
    a.sender == b.sender && a.recipient == b.recipient && a.kind == b.kind && a.body == b.body && a.sent_at == b.sent_at
}
