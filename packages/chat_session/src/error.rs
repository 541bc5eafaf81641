//! Failure taxonomy for the session core.
//!
//! Nothing here is fatal to the process: connect failures feed the reconnect
//! loop, everything else is reported per operation.

/// Establishing the physical connection or the broker handshake failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("invalid endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("broker unreachable: {0}")]
    Unreachable(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("transport already connected")]
    AlreadyConnected,
}

/// A frame could not be handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("transport is not connected")]
    NotConnected,

    #[error("transport was closed by its owner")]
    Closed,
}

/// A publish was rejected before reaching the wire. No retry is attempted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    #[error("session is not active (state: {state})")]
    NotActive { state: String },

    #[error(transparent)]
    Transport(#[from] SendError),

    #[error("failed to encode payload: {0}")]
    Encode(String),
}

/// Malformed inbound data. The offending frame is dropped and the session continues.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame truncated")]
    Truncated,

    #[error("frame missing NUL terminator")]
    MissingTerminator,

    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    #[error("malformed header {0:?}")]
    MalformedHeader(String),

    #[error("invalid header escape {0:?}")]
    BadEscape(String),

    #[error("binary message is not valid UTF-8")]
    InvalidUtf8,

    #[error("frame too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("invalid chat payload: {0}")]
    Payload(String),

    #[error("message for unknown subscription {0:?}")]
    UnknownSubscription(String),

    #[error("private message addressed to {recipient}, not {local}")]
    Misaddressed { recipient: String, local: String },
}

/// The roster snapshot could not be fetched. The roster keeps its last-known state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryFetchError {
    #[error("directory unavailable: {0}")]
    Unavailable(String),

    #[error("directory returned status {0}")]
    Status(u16),

    #[error("invalid directory response: {0}")]
    Decode(String),
}

impl DirectoryFetchError {
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            Self::Status(status.as_u16())
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Unavailable(err.to_string())
        }
    }
}

/// Errors from talking to the session task itself.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session has ended")]
    Ended,

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Directory(#[from] DirectoryFetchError),

    #[error("invalid configuration: {0}")]
    Config(String),
}
