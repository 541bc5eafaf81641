//! Roster of online identities.
//!
//! Live Join/Leave events and directory snapshots both feed the roster. A
//! snapshot is a point-in-time read that can race with live events, so live
//! events win: an id whose Leave was seen after the snapshot was requested is
//! not re-added, and an entry backed by a live Join is never dropped just
//! because a snapshot omits it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use crate::model::{ChatEvent, EventKind, Identity, PresenceEntry, now_millis};

#[derive(Debug, Clone)]
struct Tracked {
    entry: PresenceEntry,
    /// Seen in a live Join, not only in a snapshot.
    live: bool,
}

/// Marks the point in the event sequence where a snapshot fetch was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotTicket {
    seq: u64,
}

pub struct PresenceTracker {
    local_id: String,
    entries: HashMap<String, Tracked>,
    /// Count of presence events processed.
    seq: u64,
    last_leave: HashMap<String, u64>,
}

impl PresenceTracker {
    pub fn new(local_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            entries: HashMap::new(),
            seq: 0,
            last_leave: HashMap::new(),
        }
    }

    /// Apply a live event. Returns whether roster membership changed.
    pub fn on_event(&mut self, event: &ChatEvent) -> bool {
        if event.sender == self.local_id {
            return false;
        }
        match event.kind {
            EventKind::Join => {
                self.seq += 1;
                self.join(&event.sender, event.sent_at)
            }
            EventKind::Leave => {
                self.seq += 1;
                self.last_leave.insert(event.sender.clone(), self.seq);
                let removed = self.entries.remove(&event.sender).is_some();
                if !removed {
                    trace!(id = %event.sender, "leave for absent identity");
                }
                removed
            }
            EventKind::Chat => false,
        }
    }

    fn join(&mut self, id: &str, at: DateTime<Utc>) -> bool {
        match self.entries.get_mut(id) {
            Some(tracked) => {
                tracked.live = true;
                if at > tracked.entry.last_seen_at {
                    tracked.entry.last_seen_at = at;
                }
                false
            }
            None => {
                self.entries.insert(
                    id.to_string(),
                    Tracked {
                        entry: PresenceEntry {
                            identity: Identity::bare(id),
                            last_seen_at: at,
                        },
                        live: true,
                    },
                );
                true
            }
        }
    }

    /// Call when the snapshot request is issued, before awaiting it.
    pub fn begin_snapshot(&self) -> SnapshotTicket {
        SnapshotTicket { seq: self.seq }
    }

    /// Merge a snapshot requested at `ticket`. Returns whether membership changed.
    pub fn reconcile_from(&mut self, ticket: SnapshotTicket, snapshot: Vec<Identity>) -> bool {
        let now = now_millis();
        let local_id = self.local_id.clone();
        let snapshot: HashMap<String, Identity> = snapshot
            .into_iter()
            .filter(|identity| identity.id != local_id)
            .map(|identity| (identity.id.clone(), identity))
            .collect();

        let before = self.entries.len();
        self.entries
            .retain(|id, tracked| tracked.live || snapshot.contains_key(id));
        let mut changed = self.entries.len() != before;

        for (id, identity) in snapshot {
            let left_since = self
                .last_leave
                .get(&id)
                .is_some_and(|&leave_seq| leave_seq > ticket.seq);
            if left_since {
                debug!(id = %id, "snapshot lists an identity that has since left");
                continue;
            }
            match self.entries.get_mut(&id) {
                // Snapshots carry display names; live Joins only carry ids.
                Some(tracked) => tracked.entry.identity = identity,
                None => {
                    self.entries.insert(
                        id,
                        Tracked {
                            entry: PresenceEntry {
                                identity,
                                last_seen_at: now,
                            },
                            live: false,
                        },
                    );
                    changed = true;
                }
            }
        }
        changed
    }

    /// Merge a snapshot that did not race with any live event.
    pub fn reconcile(&mut self, snapshot: Vec<Identity>) -> bool {
        let ticket = self.begin_snapshot();
        self.reconcile_from(ticket, snapshot)
    }

    /// Point-in-time roster, sorted by id.
    pub fn roster(&self) -> Vec<PresenceEntry> {
        let mut roster: Vec<PresenceEntry> = self
            .entries
            .values()
            .map(|tracked| tracked.entry.clone())
            .collect();
        roster.sort_by(|a, b| a.identity.id.cmp(&b.identity.id));
        roster
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
