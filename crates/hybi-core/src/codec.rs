//! Frame event adapter over the tungstenite codec.
//!
//! The bit-level framing (opcode, length, masking, fragment reassembly) is
//! done by tungstenite. This module turns its message stream into the typed
//! [`FrameEvent`] sequence the conversation dispatches on, and turns
//! [`OutboundFrame`]s back into codec messages.
//!
//! Some client runtimes cannot send or observe native ping/pong control
//! frames, so the protocol also carries ping/pong as binary frames holding a
//! fixed sentinel payload. Both forms surface as the same events.

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

/// Binary payload standing in for a ping.
pub const PING_SENTINEL: &[u8] = b"\x00\xffPING";

/// Binary payload standing in for a pong.
pub const PONG_SENTINEL: &[u8] = b"\x00\xffPONG";

/// One decoded unit of inbound traffic, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    Text(Vec<u8>),
    Data(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
    Error(String),
}

/// A frame to put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Data(Vec<u8>),
}

impl OutboundFrame {
    /// Sentinel ping carried as a data frame.
    pub fn sentinel_ping() -> Self {
        OutboundFrame::Data(PING_SENTINEL.to_vec())
    }

    /// Sentinel pong carried as a data frame.
    pub fn sentinel_pong() -> Self {
        OutboundFrame::Data(PONG_SENTINEL.to_vec())
    }
}

impl From<OutboundFrame> for Message {
    fn from(frame: OutboundFrame) -> Self {
        match frame {
            OutboundFrame::Text(s) => Message::Text(s.into()),
            OutboundFrame::Data(d) => Message::Binary(d.into()),
        }
    }
}

/// Marker opening a targeted message: `\x00@<service>\n<body>`.
pub const TARGET_MARKER: &[u8] = b"\x00@";

/// Split a targeted message into its service name and body.
///
/// Returns `None` for untargeted payloads, which go to the default service.
/// A marker without a terminating newline or with a non-UTF-8 name is not a
/// target envelope.
pub fn split_target(payload: &[u8]) -> Option<(&str, &[u8])> {
    let rest = payload.strip_prefix(TARGET_MARKER)?;
    let end = rest.iter().position(|&b| b == b'\n')?;
    let name = std::str::from_utf8(&rest[..end]).ok()?;
    if name.is_empty() {
        return None;
    }
    Some((name, &rest[end + 1..]))
}

/// Wrap `body` so it is delivered to `service`.
pub fn target_envelope(service: &str, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(TARGET_MARKER.len() + service.len() + 1 + body.len());
    out.extend_from_slice(TARGET_MARKER);
    out.extend_from_slice(service.as_bytes());
    out.push(b'\n');
    out.extend_from_slice(body);
    out
}

/// Classify a single codec message.
///
/// Returns `None` for raw frames, which never surface from a reading
/// tungstenite stream.
pub fn classify(message: Message) -> Option<FrameEvent> {
    match message {
        Message::Text(text) => Some(FrameEvent::Text(text.as_bytes().to_vec())),
        Message::Binary(data) => {
            let data = data.to_vec();
            if data == PING_SENTINEL {
                Some(FrameEvent::Ping(data))
            } else if data == PONG_SENTINEL {
                Some(FrameEvent::Pong(data))
            } else {
                Some(FrameEvent::Data(data))
            }
        }
        Message::Ping(data) => Some(FrameEvent::Ping(data.to_vec())),
        Message::Pong(data) => Some(FrameEvent::Pong(data.to_vec())),
        Message::Close(_) => Some(FrameEvent::Close),
        Message::Frame(_) => None,
    }
}

/// Lazy reader turning the inbound half of a WebSocket into frame events.
pub struct FrameReader {
    inner: BoxStream<'static, Result<Message, WsError>>,
    finished: bool,
}

impl FrameReader {
    pub fn new(inner: BoxStream<'static, Result<Message, WsError>>) -> Self {
        Self {
            inner,
            finished: false,
        }
    }

    /// Next event. After a `Close` or `Error` event every further call yields
    /// `Close`.
    pub async fn next_event(&mut self) -> FrameEvent {
        if self.finished {
            return FrameEvent::Close;
        }
        loop {
            let event = match self.inner.next().await {
                Some(Ok(message)) => match classify(message) {
                    Some(event) => event,
                    None => continue,
                },
                Some(Err(WsError::ConnectionClosed)) | None => FrameEvent::Close,
                Some(Err(e)) => FrameEvent::Error(e.to_string()),
            };
            if matches!(event, FrameEvent::Close | FrameEvent::Error(_)) {
                self.finished = true;
            }
            return event;
        }
    }
}
