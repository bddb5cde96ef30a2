//! STOMP 1.2 text frame codec.
//!
//! ```text
//! COMMAND\n
//! header:value\n
//! ...\n
//! \n
//! body\0
//! ```
//!
//! A bare EOL between frames is a heartbeat. Header values are escaped on
//! every frame except `CONNECT` and `CONNECTED`.

use std::fmt;

use duet_core::error::{DuetError, DuetResult};

/// Frame commands this client sends or understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    // Client frames
    Connect,
    Send,
    Subscribe,
    Unsubscribe,
    Disconnect,
    // Server frames
    Connected,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Send => "SEND",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Disconnect => "DISCONNECT",
            Self::Connected => "CONNECTED",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> DuetResult<Self> {
        match s {
            "CONNECT" | "STOMP" => Ok(Self::Connect),
            "SEND" => Ok(Self::Send),
            "SUBSCRIBE" => Ok(Self::Subscribe),
            "UNSUBSCRIBE" => Ok(Self::Unsubscribe),
            "DISCONNECT" => Ok(Self::Disconnect),
            "CONNECTED" => Ok(Self::Connected),
            "MESSAGE" => Ok(Self::Message),
            "RECEIPT" => Ok(Self::Receipt),
            "ERROR" => Ok(Self::Error),
            other => Err(DuetError::Decode(format!("unknown STOMP command: {other:?}"))),
        }
    }

    fn escapes_headers(&self) -> bool {
        !matches!(self, Self::Connect | Self::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One STOMP frame. Repeated headers are kept; the first one wins on lookup.
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

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Opening frame; `heartbeat` is `(outgoing_ms, incoming_ms)`.
    pub fn connect(host: &str, token: &str, heartbeat: (u64, u64)) -> Self {
        Self::new(Command::Connect)
            .header("accept-version", duet_core::constants::STOMP_ACCEPT_VERSION)
            .header("host", host)
            .header("heart-beat", format!("{},{}", heartbeat.0, heartbeat.1))
            .header("Authorization", format!("Bearer {token}"))
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Self::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    pub fn unsubscribe(id: &str) -> Self {
        Self::new(Command::Unsubscribe).header("id", id)
    }

    pub fn send(destination: &str, body: impl Into<String>) -> Self {
        Self::new(Command::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .with_body(body)
    }

    pub fn disconnect(receipt: &str) -> Self {
        Self::new(Command::Disconnect).header("receipt", receipt)
    }

    /// Serialize to wire text, adding `content-length` for non-empty bodies.
    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
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
        if !self.body.is_empty() && self.get("content-length").is_none() {
            out.push_str(&format!("content-length:{}\n", self.body.len()));
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Parse one frame from the start of `input`; returns the unread rest.
    fn parse(input: &str) -> DuetResult<(Self, &str)> {
        let mut pos = 0;
        let command_line = next_line(input, &mut pos)?;
        let command = Command::parse(command_line)?;
        let escape = command.escapes_headers();

        let mut headers = Vec::new();
        loop {
            let line = next_line(input, &mut pos)?;
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| DuetError::Decode(format!("malformed header line: {line:?}")))?;
            if escape {
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
                    .map_err(|_| DuetError::Decode(format!("bad content-length: {v:?}")))
            })
            .transpose()?;

        let rest = &input[pos..];
        let body_end = match content_length {
            Some(len) => {
                if rest.as_bytes().get(len) != Some(&0) {
                    return Err(DuetError::Decode("frame body does not match content-length".into()));
                }
                len
            }
            None => rest
                .find('\0')
                .ok_or_else(|| DuetError::Decode("unterminated frame".into()))?,
        };
        let body = rest
            .get(..body_end)
            .ok_or_else(|| DuetError::Decode("content-length splits a character".into()))?;

        let frame = Self {
            command,
            headers,
            body: body.to_string(),
        };
        Ok((frame, &rest[body_end + 1..]))
    }
}

/// A frame or a heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Heartbeat,
    Frame(Frame),
}

impl Packet {
    pub fn encode(&self) -> String {
        match self {
            Self::Heartbeat => "\n".to_string(),
            Self::Frame(frame) => frame.encode(),
        }
    }

    /// Decode every packet carried by one transport message, failing on the
    /// first malformed frame.
    pub fn decode_all(text: &str) -> DuetResult<Vec<Packet>> {
        Self::decode_each(text).into_iter().collect()
    }

    /// Decode one transport message frame by frame.
    ///
    /// A malformed frame yields one `Err` and decoding resumes after its NUL
    /// terminator, so the frames around it still come through.
    pub fn decode_each(text: &str) -> Vec<DuetResult<Packet>> {
        let mut packets = Vec::new();
        let mut rest = text;
        loop {
            if let Some(r) = rest.strip_prefix("\r\n") {
                packets.push(Ok(Packet::Heartbeat));
                rest = r;
            } else if let Some(r) = rest.strip_prefix('\n') {
                packets.push(Ok(Packet::Heartbeat));
                rest = r;
            } else if rest.is_empty() {
                return packets;
            } else {
                match Frame::parse(rest) {
                    Ok((frame, r)) => {
                        packets.push(Ok(Packet::Frame(frame)));
                        rest = r;
                    }
                    Err(e) => {
                        packets.push(Err(e));
                        rest = rest.find('\0').map_or("", |nul| &rest[nul + 1..]);
                    }
                }
            }
        }
    }
}

/// Heartbeat periods agreed with the broker, in milliseconds (0 = off).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Heartbeat {
    pub outgoing_ms: u64,
    pub incoming_ms: u64,
}

impl Heartbeat {
    /// Combine our `(outgoing, incoming)` offer with the `heart-beat` header
    /// of the CONNECTED frame.
    pub fn negotiate(client: (u64, u64), server_header: Option<&str>) -> DuetResult<Self> {
        let Some(header) = server_header else {
            return Ok(Self::default());
        };
        let (sx, sy) = header
            .split_once(',')
            .and_then(|(a, b)| Some((a.trim().parse::<u64>().ok()?, b.trim().parse::<u64>().ok()?)))
            .ok_or_else(|| DuetError::Decode(format!("bad heart-beat header: {header:?}")))?;
        let (cx, cy) = client;

        let outgoing_ms = if cx == 0 || sy == 0 { 0 } else { cx.max(sy) };
        let incoming_ms = if cy == 0 || sx == 0 { 0 } else { cy.max(sx) };
        Ok(Self {
            outgoing_ms,
            incoming_ms,
        })
    }
}

fn next_line<'a>(input: &'a str, pos: &mut usize) -> DuetResult<&'a str> {
    let rest = &input[*pos..];
    let end = rest
        .find('\n')
        .ok_or_else(|| DuetError::Decode("truncated frame header".into()))?;
    *pos += end + 1;
    Ok(rest[..end].strip_suffix('\r').unwrap_or(&rest[..end]))
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(raw: &str) -> DuetResult<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
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
                return Err(DuetError::Decode(format!(
                    "invalid header escape: \\{}",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}
