//! Asterisk manager interface (AMI) wire format.
//!
//! AMI is a line protocol over TCP: every message is a block of `Key: Value`
//! lines terminated by an empty line, and a connection opens with a single
//! banner line (`Asterisk Call Manager/<version>`). [`AmiCodec`] frames the
//! byte stream; the free functions below build the actions this gateway sends
//! and map the events it cares about onto [`EventKind`].

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use super::{EventKind, OriginateFailure, OriginateRequest};
use crate::core::model::CorrelationId;

/// Upper bound for a single framed message. Command output can be long but
/// nothing this gateway consumes comes close.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Asterisk channel state codes carried by `Newstate`
const CHANNEL_STATE_RINGING: &str = "5";
const CHANNEL_STATE_UP: &str = "6";

/// `OriginateResponse` reason codes
const REASON_NO_ANSWER: &str = "3";
const REASON_BUSY: &str = "5";
const REASON_CONGESTION: &str = "8";

// =============================================================================
// Messages
// =============================================================================

/// One AMI message: an ordered list of header fields. Keys compare
/// case-insensitively, repeated keys (`Variable`) are preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AmiMessage {
    fields: Vec<(String, String)>,
}

impl AmiMessage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start an action message with its `Action` and `ActionID` headers.
    pub fn action(name: &str, action_id: &str) -> Self {
        Self::new().with("Action", name).with("ActionID", action_id)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(key, value);
        self
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.push((key.into(), value.into()));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    pub fn event_name(&self) -> Option<&str> {
        self.get("Event")
    }

    pub fn action_id(&self) -> Option<&str> {
        self.get("ActionID")
    }

    /// Reply to an action. `OriginateResponse` events also carry a `Response`
    /// header; anything with an `Event` header is an event.
    pub fn is_response(&self) -> bool {
        self.get("Event").is_none() && self.get("Response").is_some()
    }

    pub fn is_success(&self) -> bool {
        matches!(self.get("Response"), Some(r) if r.eq_ignore_ascii_case("success"))
    }

    /// `Message` header of a response, used as the error text for failures
    pub fn message(&self) -> Option<&str> {
        self.get("Message")
    }
}

/// What the decoder yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AmiFrame {
    /// `Asterisk Call Manager/<version>` sent once on connect
    Banner(String),
    Message(AmiMessage),
}

// =============================================================================
// Codec
// =============================================================================

#[derive(Debug, Default)]
pub struct AmiCodec {
    banner_seen: bool,
}

impl AmiCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Locate the end of the next message block. Returns (body length, terminator length).
fn find_block_end(buf: &[u8]) -> Option<(usize, usize)> {
    let crlf = find_subsequence(buf, b"\r\n\r\n").map(|pos| (pos, 4));
    let lf = find_subsequence(buf, b"\n\n").map(|pos| (pos, 2));
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn parse_block(block: &str) -> AmiMessage {
    let mut message = AmiMessage::new();
    for line in block.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        match line.split_once(':') {
            Some((key, value)) => message.push(key.trim(), value.trim_start()),
            // Raw command output lines
            None => message.push("Output", line),
        }
    }
    message
}

impl Decoder for AmiCodec {
    type Item = AmiFrame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if !self.banner_seen {
            let Some(pos) = find_subsequence(src, b"\n") else {
                if src.len() > MAX_FRAME_BYTES {
                    return Err(frame_too_large());
                }
                return Ok(None);
            };
            let line = src.split_to(pos + 1);
            self.banner_seen = true;
            let text = String::from_utf8_lossy(&line).trim().to_string();
            trace!("AMI banner: {}", text);
            return Ok(Some(AmiFrame::Banner(text)));
        }

        // Drop blank lines between blocks
        while src.first().is_some_and(|b| *b == b'\r' || *b == b'\n') {
            let _ = src.split_to(1);
        }

        match find_block_end(src) {
            Some((len, terminator)) => {
                if len > MAX_FRAME_BYTES {
                    return Err(frame_too_large());
                }
                let block = src.split_to(len + terminator);
                let text = String::from_utf8_lossy(&block[..len]);
                Ok(Some(AmiFrame::Message(parse_block(&text))))
            }
            None if src.len() > MAX_FRAME_BYTES => Err(frame_too_large()),
            None => Ok(None),
        }
    }
}

fn frame_too_large() -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("AMI frame exceeds {MAX_FRAME_BYTES} bytes"),
    )
}

impl Encoder<AmiMessage> for AmiCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: AmiMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        for (key, value) in item.fields() {
            // A newline inside a value would start a new header
            if key.contains(['\r', '\n']) || value.contains(['\r', '\n']) {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("AMI header {key} contains a line break"),
                ));
            }
            dst.reserve(key.len() + value.len() + 4);
            dst.put_slice(key.as_bytes());
            dst.put_slice(b": ");
            dst.put_slice(value.as_bytes());
            dst.put_slice(b"\r\n");
        }
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

// =============================================================================
// Actions
// =============================================================================

/// Where originated calls are routed on the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialTarget<'a> {
    pub technology: &'a str,
    pub trunk: &'a str,
    pub context: &'a str,
    pub exten: &'a str,
    pub priority: u32,
}

pub fn login(action_id: &str, username: &str, secret: &str) -> AmiMessage {
    AmiMessage::action("Login", action_id)
        .with("Username", username)
        .with("Secret", secret)
        .with("Events", "call,user")
}

pub fn logoff(action_id: &str) -> AmiMessage {
    AmiMessage::action("Logoff", action_id)
}

pub fn ping(action_id: &str) -> AmiMessage {
    AmiMessage::action("Ping", action_id)
}

/// Channel name of the outbound leg for a destination.
pub fn dial_channel(target: &DialTarget<'_>, destination: &str) -> String {
    format!("{}/{}/{}", target.technology, target.trunk, destination)
}

/// Build an asynchronous originate. The correlation id doubles as ActionID
/// and as the channel's unique id, so both the `OriginateResponse` and every
/// channel event can be traced back to the job.
pub fn originate(request: &OriginateRequest, target: &DialTarget<'_>) -> AmiMessage {
    let correlation = request.correlation_id.to_string();
    let timeout_ms = request.ring_timeout.as_millis().to_string();

    let mut message = AmiMessage::action("Originate", &correlation)
        .with("Channel", dial_channel(target, &request.destination))
        .with("ChannelId", correlation.as_str())
        .with("Context", target.context)
        .with("Exten", target.exten)
        .with("Priority", target.priority.to_string())
        .with("CallerID", request.caller_id.as_str())
        .with("Timeout", timeout_ms)
        .with("Async", "true")
        .with("Variable", format!("AUDIO_FILE={}", request.playback))
        .with("Variable", format!("CALL_ID={}", correlation))
        .with("Variable", format!("JOB_ID={}", request.job_id))
        .with("Variable", format!("PHONE_NUMBER={}", request.destination));

    if let Some(extension) = &request.extension {
        message.push("Variable", format!("EXTENSION={extension}"));
    }
    message
}

pub fn hangup(action_id: &str, channel: &str) -> AmiMessage {
    AmiMessage::action("Hangup", action_id)
        .with("Channel", channel)
        .with("Cause", "16")
}

// =============================================================================
// Event mapping
// =============================================================================

/// Correlation id an event refers to, for events that carry one of ours.
/// Foreign channels on a shared PBX use numeric unique ids and are skipped.
fn correlation_of(message: &AmiMessage, key: &str) -> Option<CorrelationId> {
    message.get(key).and_then(|value| value.parse().ok())
}

fn originate_failure(reason: Option<&str>) -> OriginateFailure {
    match reason {
        Some(REASON_NO_ANSWER) => OriginateFailure::NoAnswer,
        Some(REASON_BUSY) => OriginateFailure::Busy,
        Some(REASON_CONGESTION) => OriginateFailure::Congestion,
        Some(other) => OriginateFailure::Rejected(format!("originate failed (reason {other})")),
        None => OriginateFailure::Rejected("originate failed".to_string()),
    }
}

/// Map a manager event onto call progress, if it concerns one of our calls.
pub fn classify_event(message: &AmiMessage) -> Option<(CorrelationId, EventKind)> {
    let event = message.event_name()?;

    match event {
        "Newchannel" => Some((correlation_of(message, "Uniqueid")?, EventKind::Progressing)),
        "Newstate" => {
            let correlation_id = correlation_of(message, "Uniqueid")?;
            match message.get("ChannelState")? {
                CHANNEL_STATE_RINGING => Some((correlation_id, EventKind::Ringing)),
                CHANNEL_STATE_UP => Some((correlation_id, EventKind::Answered)),
                _ => None,
            }
        }
        "UserEvent" => {
            let correlation_id = correlation_of(message, "Uniqueid")
                .or_else(|| correlation_of(message, "CALL_ID"))?;
            match message.get("UserEvent")? {
                "PlaybackStarted" => Some((correlation_id, EventKind::PlaybackStarted)),
                "PlaybackFinished" => Some((correlation_id, EventKind::PlaybackFinished)),
                _ => None,
            }
        }
        "Hangup" => {
            let correlation_id = correlation_of(message, "Uniqueid")?;
            let cause = message
                .get("Cause")
                .and_then(|c| c.parse().ok())
                .unwrap_or_default();
            let text = message.get("Cause-txt").unwrap_or_default().to_string();
            Some((correlation_id, EventKind::Hangup { cause, text }))
        }
        "OriginateResponse" => {
            let correlation_id = correlation_of(message, "ActionID")?;
            let failed = message
                .get("Response")
                .is_some_and(|r| r.eq_ignore_ascii_case("failure"));
            if !failed {
                // Success is reported again by Newstate
                return None;
            }
            let reason = originate_failure(message.get("Reason"));
            Some((correlation_id, EventKind::OriginateFailed { reason }))
        }
        _ => None,
    }
}
