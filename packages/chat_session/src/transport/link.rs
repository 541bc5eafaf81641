//! Physical links: one duplex stream of text messages.
//!
//! `Connector` is the seam between the transport supervisor and the socket
//! implementation. Production uses `WsConnector`; tests plug in an in-memory
//! broker.

use std::pin::Pin;

use futures::future::{self, BoxFuture};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::debug;

use crate::error::{ConnectError, ProtocolError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct LinkError(pub String);

/// One inbound data message. Binary messages are only valid if they hold UTF-8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkMessage {
    Text(String),
    Binary(Vec<u8>),
}

impl LinkMessage {
    pub fn into_text(self) -> Result<String, ProtocolError> {
        match self {
            LinkMessage::Text(text) => Ok(text),
            LinkMessage::Binary(bytes) => String::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8),
        }
    }
}

pub type LinkSink = Pin<Box<dyn Sink<String, Error = LinkError> + Send>>;
pub type LinkStream = Pin<Box<dyn Stream<Item = Result<LinkMessage, LinkError>> + Send>>;

/// An established physical connection. The stream ending means the peer closed.
pub struct Link {
    pub sink: LinkSink,
    pub stream: LinkStream,
}

impl Link {
    pub fn new<Si, St>(sink: Si, stream: St) -> Self
    where
        Si: Sink<String, Error = LinkError> + Send + 'static,
        St: Stream<Item = Result<LinkMessage, LinkError>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

/// Opens physical links to an endpoint.
pub trait Connector: Send + Sync + 'static {
    fn connect<'a>(&'a self, endpoint: &'a str) -> BoxFuture<'a, Result<Link, ConnectError>>;
}

/// WebSocket links via tokio-tungstenite. Ping/pong is handled by tungstenite.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect<'a>(&'a self, endpoint: &'a str) -> BoxFuture<'a, Result<Link, ConnectError>> {
        Box::pin(async move {
            let (ws_stream, response) = tokio_tungstenite::connect_async(endpoint)
                .await
                .map_err(|e| connect_error(endpoint, e))?;
            debug!(endpoint, status = %response.status(), "websocket established");

            let (ws_write, ws_read) = ws_stream.split();
            let sink = ws_write
                .with(|text: String| future::ready(Ok::<_, tungstenite::Error>(Message::Text(text.into()))))
                .sink_map_err(|e| LinkError(e.to_string()));
            let stream = ws_read.filter_map(|msg| {
                future::ready(match msg {
                    Ok(Message::Text(text)) => Some(Ok(LinkMessage::Text(text.as_str().to_owned()))),
                    Ok(Message::Binary(bytes)) => Some(Ok(LinkMessage::Binary(bytes.to_vec()))),
                    Ok(_) => None,
                    Err(e) => Some(Err(LinkError(e.to_string()))),
                })
            });
            Ok(Link::new(sink, stream))
        })
    }
}

fn connect_error(endpoint: &str, err: tungstenite::Error) -> ConnectError {
    match err {
        tungstenite::Error::Url(e) => ConnectError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        },
        tungstenite::Error::Http(response) => {
            ConnectError::Handshake(format!("HTTP {} during upgrade", response.status()))
        }
        other => ConnectError::Unreachable(other.to_string()),
    }
}
