//! Realtime session core for a STOMP-over-WebSocket chat client.
//!
//! One session keeps a single broker connection alive, multiplexes the shared
//! broadcast channel and the local user's private queue over it, tracks who is
//! online, and keeps a per-conversation log for a view layer to render.
//!
//! Layering, leaf first:
//! - `transport`: frame codec, physical link, reconnecting supervisor
//! - `router`: logical channels over the one connection
//! - `presence`: roster from Join/Leave events and directory snapshots
//! - `conversation`: append-only per-conversation log
//! - `session`: lifecycle state machine and the task that owns it all

pub mod config;
pub mod conversation;
pub mod directory;
pub mod error;
pub mod model;
pub mod presence;
pub mod router;
pub mod session;
pub mod transport;

#[cfg(test)]
mod test_helpers;

pub use session::{SessionEvent, SessionHandle, SessionState};
