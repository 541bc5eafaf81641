//! STOMP 1.2 text framing.
//!
//! Wire format: `COMMAND\nname:value\n...\n\nBODY\0`
//!
//! A lone EOL (`\n` or `\r\n`) between frames is a heartbeat. One WebSocket
//! text message may carry any number of frames and heartbeats.

use std::fmt;

use crate::error::ProtocolError;

/// Frames larger than this are rejected (1 MiB, same bound as the broker).
const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// The single byte sent as an outbound heartbeat.
pub const HEARTBEAT: &str = "\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    // client
    Connect,
    Send,
    Subscribe,
    Unsubscribe,
    Disconnect,
    // server
    Connected,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Disconnect => "DISCONNECT",
            Command::Connected => "CONNECTED",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "CONNECT" => Command::Connect,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "DISCONNECT" => Command::Disconnect,
            "CONNECTED" => Command::Connected,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            _ => return None,
        })
    }

    /// CONNECT and CONNECTED headers are never escaped (STOMP 1.2 §Value Encoding).
    fn escapes_headers(self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One STOMP frame. Header order is preserved; on lookup the first
/// occurrence wins, as the protocol requires for repeated headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// `SEND` with a JSON body.
    pub fn send(destination: &str, json: String) -> Self {
        Frame::new(Command::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .body(json)
    }

    pub fn subscribe(id: &str, destination: &str, receipt: Option<&str>) -> Self {
        let frame = Frame::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto");
        match receipt {
            Some(r) => frame.header("receipt", r),
            None => frame,
        }
    }

    pub fn unsubscribe(id: &str) -> Self {
        Frame::new(Command::Unsubscribe).header("id", id)
    }

    /// Serialize to wire text, adding `content-length` when the body is non-empty.
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        let escape = self.command.escapes_headers();
        for (name, value) in &self.headers {
            if name == "content-length" {
                continue;
            }
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        if !self.body.is_empty() {
            out.push_str("content-length:");
            out.push_str(&self.body.len().to_string());
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }
}

/// One unit read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Heartbeat,
    Frame(Frame),
}

/// Parse every frame and heartbeat contained in one transport message.
///
/// Any malformed frame fails the whole message; the caller drops it.
pub fn decode(input: &str) -> Result<Vec<Inbound>, ProtocolError> {
    if input.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::TooLarge {
            size: input.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let mut out = Vec::new();
    let mut rest = input;
    while !rest.is_empty() {
        if let Some(r) = rest.strip_prefix("\r\n") {
            out.push(Inbound::Heartbeat);
            rest = r;
            continue;
        }
        if let Some(r) = rest.strip_prefix('\n') {
            out.push(Inbound::Heartbeat);
            rest = r;
            continue;
        }
        // Trailing NULs some brokers pad with.
        if let Some(r) = rest.strip_prefix('\0') {
            rest = r;
            continue;
        }
        let (frame, r) = decode_frame(rest)?;
        out.push(Inbound::Frame(frame));
        rest = r;
    }
    Ok(out)
}

fn decode_frame(input: &str) -> Result<(Frame, &str), ProtocolError> {
    let (command_line, mut rest) = split_line(input).ok_or(ProtocolError::Truncated)?;
    let command =
        Command::parse(command_line).ok_or_else(|| ProtocolError::UnknownCommand(command_line.to_string()))?;

    let mut headers = Vec::new();
    loop {
        let (line, r) = split_line(rest).ok_or(ProtocolError::Truncated)?;
        rest = r;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ProtocolError::MalformedHeader(line.to_string()))?;
        if command.escapes_headers() {
            headers.push((unescape_header(name)?, unescape_header(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .map(|(_, v)| {
            v.trim()
                .parse::<usize>()
                .map_err(|_| ProtocolError::MalformedHeader(format!("content-length:{v}")))
        })
        .transpose()?;

    let (body, rest) = match content_length {
        Some(len) => {
            if len >= rest.len() || !rest.is_char_boundary(len) {
                return Err(ProtocolError::Truncated);
            }
            let (body, tail) = rest.split_at(len);
            let tail = tail.strip_prefix('\0').ok_or(ProtocolError::MissingTerminator)?;
            (body, tail)
        }
        None => {
            let end = rest.find('\0').ok_or(ProtocolError::MissingTerminator)?;
            (&rest[..end], &rest[end + 1..])
        }
    };

    Ok((
        Frame {
            command,
            headers,
            body: body.to_string(),
        },
        rest,
    ))
}

/// Split off one line, accepting `\n` or `\r\n`.
fn split_line(input: &str) -> Option<(&str, &str)> {
    let idx = input.find('\n')?;
    let line = input[..idx].strip_suffix('\r').unwrap_or(&input[..idx]);
    Some((line, &input[idx + 1..]))
}

fn escape_header(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_header(s: &str) -> Result<String, ProtocolError> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            other => {
                return Err(ProtocolError::BadEscape(format!(
                    "\\{}",
                    other.map(String::from).unwrap_or_default()
                )));
            }
        }
    }
    Ok(out)
}
