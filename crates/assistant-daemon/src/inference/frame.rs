//! Server-sent event framing for the chat-completions stream.
//!
//! The backend writes `data: {json}` lines terminated by `data: [DONE]`.
//! Lines are decoded from raw bytes so a multi-byte character split across
//! two network chunks is never mangled.

use serde::Deserialize;
use thiserror::Error;

use crate::generation::DeltaKind;

const DONE_SENTINEL: &str = "[DONE]";

/// Buffers raw bytes and hands out complete lines.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns every line it completed, without the
    /// trailing `\n` / `\r\n`.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            lines.push(Self::decode(&self.buffer[start..end]));
            start = end + 1;
        }
        self.buffer.drain(..start);
        lines
    }

    /// Returns the unterminated tail left when the connection closed.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = Self::decode(&self.buffer);
        self.buffer.clear();
        Some(line)
    }

    fn decode(raw: &[u8]) -> String {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        String::from_utf8_lossy(raw).into_owned()
    }
}

/// Extracts the payload of an SSE `data:` line. Comments, `event:` lines and
/// blank keep-alives yield `None`.
pub fn data_payload(line: &str) -> Option<&str> {
    let payload = line.strip_prefix("data:")?;
    Some(payload.strip_prefix(' ').unwrap_or(payload).trim_end())
}

#[derive(Debug, Error)]
pub enum MalformedFrame {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// A single decoded event frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// The `[DONE]` sentinel.
    Done,
    /// Zero or more deltas in arrival order. `finished` is set when the
    /// backend reported a finish reason on this frame.
    Chunk {
        deltas: Vec<(DeltaKind, String)>,
        finished: bool,
    },
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<ChatDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    // Some servers send this name instead, some send both.
    #[serde(default)]
    reasoning: Option<String>,
}

/// Parses one `data:` payload.
///
/// Missing fields are never an error: a frame without `choices`, without a
/// `delta`, or without either text field decodes to an empty chunk. Only a
/// payload that is not JSON of the expected shape is malformed.
pub fn parse_frame(payload: &str) -> Result<Frame, MalformedFrame> {
    if payload.trim() == DONE_SENTINEL {
        return Ok(Frame::Done);
    }

    let chunk: StreamChunk = serde_json::from_str(payload)?;
    let Some(choice) = chunk.choices.into_iter().next() else {
        return Ok(Frame::Chunk {
            deltas: Vec::new(),
            finished: false,
        });
    };

    let mut deltas = Vec::new();
    if let Some(delta) = choice.delta {
        // Reasoning precedes the answer when a backend sends both at once.
        let reasoning = delta.reasoning_content.or(delta.reasoning);
        if let Some(text) = reasoning.filter(|t| !t.is_empty()) {
            deltas.push((DeltaKind::Reasoning, text));
        }
        if let Some(text) = delta.content.filter(|t| !t.is_empty()) {
            deltas.push((DeltaKind::Content, text));
        }
    }

    Ok(Frame::Chunk {
        deltas,
        finished: choice.finish_reason.is_some(),
    })
}
