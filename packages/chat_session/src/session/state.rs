//! Session lifecycle.
//!
//! A pure state machine: the session task feeds it signals and carries out
//! the actions it returns. Nothing here touches the network.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Joining,
    Active,
    Leaving,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Joining => "joining",
            SessionState::Active => "active",
            SessionState::Leaving => "leaving",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleSignal {
    Start,
    /// The transport completed a broker handshake.
    Opened,
    SubscriptionsAcknowledged,
    /// Receipts did not all arrive in time.
    ReceiptTimeout,
    /// The link dropped or a connect attempt failed.
    LinkLost,
    LogoutRequested,
    /// The transport finished closing at our request.
    Closed,
}

/// What the session task must do in response to a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Connect,
    /// Replay subscriptions; publish Join after them when `announce` is set.
    Subscribe { announce: bool },
    /// The link is gone; whatever arrives next may follow missed traffic.
    MarkGap,
    AnnounceLeave,
    CloseTransport,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Transition {
    /// Set when the state changed.
    pub state: Option<SessionState>,
    pub actions: Vec<Action>,
}

impl Transition {
    fn to(state: SessionState, actions: Vec<Action>) -> Self {
        Self {
            state: Some(state),
            actions,
        }
    }

    fn none() -> Self {
        Self::default()
    }
}

pub struct Lifecycle {
    state: SessionState,
    started: bool,
    logout_requested: bool,
    join_announced: bool,
    leave_announced: bool,
    /// When the last usable link was lost, for the re-announce policy.
    lost_at: Option<Instant>,
    reannounce_after: Option<Duration>,
}

impl Lifecycle {
    pub fn new(reannounce_after: Option<Duration>) -> Self {
        Self {
            state: SessionState::Disconnected,
            started: false,
            logout_requested: false,
            join_announced: false,
            leave_announced: false,
            lost_at: None,
            reannounce_after,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Started once and back to Disconnected: the session is over.
    pub fn is_terminal(&self) -> bool {
        self.started && self.state == SessionState::Disconnected
    }

    /// Apply `signal` at time `now`.
    pub fn process(&mut self, signal: LifecycleSignal, now: Instant) -> Transition {
        use LifecycleSignal as S;
        use SessionState as St;

        let transition = match (self.state, signal) {
            (St::Disconnected, S::Start) if !self.started => {
                self.started = true;
                Transition::to(St::Connecting, vec![Action::Connect])
            }

            (St::Connecting, S::Opened) => {
                let announce = !self.join_announced || self.outage_exceeded(now);
                self.join_announced = true;
                self.lost_at = None;
                Transition::to(St::Joining, vec![Action::Subscribe { announce }])
            }

            (St::Joining, S::SubscriptionsAcknowledged | S::ReceiptTimeout) => {
                Transition::to(St::Active, Vec::new())
            }

            (St::Joining | St::Active, S::LinkLost) => {
                if self.lost_at.is_none() {
                    self.lost_at = Some(now);
                }
                Transition::to(St::Connecting, vec![Action::MarkGap])
            }

            (St::Joining | St::Active, S::LogoutRequested) => {
                self.logout_requested = true;
                let mut actions = Vec::with_capacity(2);
                if !self.leave_announced {
                    self.leave_announced = true;
                    actions.push(Action::AnnounceLeave);
                }
                actions.push(Action::CloseTransport);
                Transition::to(St::Leaving, actions)
            }

            // No usable link to announce on.
            (St::Connecting, S::LogoutRequested) => {
                self.logout_requested = true;
                Transition::to(St::Leaving, vec![Action::CloseTransport])
            }
            (St::Disconnected, S::LogoutRequested) if !self.logout_requested => {
                self.logout_requested = true;
                self.started = true;
                Transition::to(St::Leaving, vec![Action::CloseTransport])
            }

            (St::Leaving, S::Closed) => Transition::to(St::Disconnected, Vec::new()),

            // Closed without a logout, e.g. the transport handle was closed directly.
            (St::Connecting | St::Joining | St::Active, S::Closed) => {
                Transition::to(St::Disconnected, Vec::new())
            }

            (state, signal) => {
                debug!(%state, ?signal, "signal ignored");
                Transition::none()
            }
        };

        if let Some(next) = transition.state {
            debug!(from = %self.state, to = %next, ?signal, "session state change");
            self.state = next;
        }
        transition
    }

    fn outage_exceeded(&self, now: Instant) -> bool {
        match (self.reannounce_after, self.lost_at) {
            (Some(threshold), Some(lost_at)) => now.saturating_duration_since(lost_at) >= threshold,
            _ => false,
        }
    }
}
