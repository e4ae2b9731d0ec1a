//! Streaming inference support
//!
//! Generated text travels from the inference worker to the host over a
//! one-way channel. Every request ends with exactly one [`StreamToken::Done`].
//!
//! Hosts that cannot take Rust strings directly (JVM bridges, UTF-16 UIs)
//! re-encode each piece with [`TransportEncoding`]. The CLI exposes this as
//! `chat --transport`.

use std::str::FromStr;
use std::sync::mpsc::{Receiver, Sender};

use crate::inference::session::{FinishReason, OutputSink, SessionSummary};

/// Message emitted during streaming inference
#[derive(Debug, Clone)]
pub enum StreamToken {
    /// Complete, well-formed text in generation order
    Token(String),
    /// Generation finished; always the final message
    Done(SessionSummary),
}

impl StreamToken {
    /// Returns true if this is a token variant
    pub fn is_token(&self) -> bool {
        matches!(self, StreamToken::Token(_))
    }

    /// Returns true if generation is complete
    pub fn is_done(&self) -> bool {
        matches!(self, StreamToken::Done(_))
    }

    /// Extracts the token string if this is a Token variant
    pub fn as_token(&self) -> Option<&str> {
        match self {
            StreamToken::Token(s) => Some(s),
            _ => None,
        }
    }

    /// Extracts the summary if this is the Done variant
    pub fn summary(&self) -> Option<&SessionSummary> {
        match self {
            StreamToken::Done(summary) => Some(summary),
            _ => None,
        }
    }
}

/// Worker-side end of a streaming request
pub struct ChannelSink {
    tx: Sender<StreamToken>,
    closed: bool,
}

impl ChannelSink {
    pub fn new(tx: Sender<StreamToken>) -> Self {
        Self { tx, closed: false }
    }
}

impl OutputSink for ChannelSink {
    fn emit(&mut self, text: &str) {
        if self.closed {
            return;
        }
        if self.tx.send(StreamToken::Token(text.to_string())).is_err() {
            tracing::debug!("Receiver dropped, stopping generation");
            self.closed = true;
        }
    }

    fn done(&mut self, summary: &SessionSummary) {
        let _ = self.tx.send(StreamToken::Done(summary.clone()));
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Callback-style consumer of a stream
pub trait TokenListener {
    fn on_token(&mut self, text: &str);
    fn on_done(&mut self, summary: &SessionSummary);
}

/// Drives `listener` until the stream ends and returns the final summary.
///
/// `on_done` runs exactly once, even if the worker vanished without sending
/// its own completion message.
pub fn pump(rx: Receiver<StreamToken>, listener: &mut dyn TokenListener) -> SessionSummary {
    for message in rx.iter() {
        match message {
            StreamToken::Token(text) => listener.on_token(&text),
            StreamToken::Done(summary) => {
                listener.on_done(&summary);
                return summary;
            }
        }
    }

    tracing::warn!("Stream closed without completion message");
    let summary = SessionSummary::immediate(uuid::Uuid::nil(), FinishReason::Disconnected);
    listener.on_done(&summary);
    summary
}

/// Text encodings a host transport may require
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportEncoding {
    #[default]
    Utf8,
    /// UTF-16 code units; supplementary characters become surrogate pairs
    Utf16,
    /// JNI "modified UTF-8": surrogate pairs encoded as two 3-byte
    /// sequences and NUL as `C0 80`
    ModifiedUtf8,
}

/// Text in a transport's native form
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportText {
    Utf8(String),
    Utf16(Vec<u16>),
    ModifiedUtf8(Vec<u8>),
}

impl FromStr for TransportEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Ok(TransportEncoding::Utf8),
            "utf16" | "utf-16" => Ok(TransportEncoding::Utf16),
            "modified-utf8" | "mutf8" => Ok(TransportEncoding::ModifiedUtf8),
            other => Err(format!("unknown transport encoding: {}", other)),
        }
    }
}

impl TransportText {
    /// Bytes as written to a byte-oriented transport; UTF-16 is little-endian
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            TransportText::Utf8(text) => text.into_bytes(),
            TransportText::Utf16(units) => units.iter().flat_map(|u| u.to_le_bytes()).collect(),
            TransportText::ModifiedUtf8(bytes) => bytes,
        }
    }
}

impl TransportEncoding {
    pub fn encode(self, text: &str) -> TransportText {
        match self {
            TransportEncoding::Utf8 => TransportText::Utf8(text.to_string()),
            TransportEncoding::Utf16 => TransportText::Utf16(text.encode_utf16().collect()),
            TransportEncoding::ModifiedUtf8 => TransportText::ModifiedUtf8(to_modified_utf8(text)),
        }
    }
}

fn push_three_byte(out: &mut Vec<u8>, unit: u16) {
    out.push(0xE0 | (unit >> 12) as u8);
    out.push(0x80 | ((unit >> 6) & 0x3F) as u8);
    out.push(0x80 | (unit & 0x3F) as u8);
}

/// Encodes `text` the way `NewStringUTF` expects it
pub fn to_modified_utf8(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    for ch in text.chars() {
        if ch == '\0' {
            out.extend_from_slice(&[0xC0, 0x80]);
        } else if (ch as u32) <= 0xFFFF {
            let mut buf = [0u8; 4];
            out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
        } else {
            let mut units = [0u16; 2];
            for &unit in ch.encode_utf16(&mut units).iter() {
                push_three_byte(&mut out, unit);
            }
        }
    }
    out
}
