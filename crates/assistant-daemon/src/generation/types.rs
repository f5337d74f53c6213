//! Wire-level types shared by the daemon and its consumers.
//!
//! Every event carries the id of the generation it belongs to so that a
//! consumer can drop events from generations it no longer cares about.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque correlation token assigned when a generation starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenerationId(Uuid);

impl GenerationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for GenerationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for GenerationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaKind {
    Content,
    Reasoning,
}

impl DeltaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeltaKind::Content => "content",
            DeltaKind::Reasoning => "reasoning",
        }
    }
}

/// One incremental piece of output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub generation_id: GenerationId,
    pub kind: DeltaKind,
    pub text: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalReason {
    Completed,
    Cancelled,
    Error,
}

impl TerminalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalReason::Completed => "completed",
            TerminalReason::Cancelled => "cancelled",
            TerminalReason::Error => "error",
        }
    }
}

impl fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single notification that closes out a generation.
///
/// `message` is always present when `reason` is [`TerminalReason::Error`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalEvent {
    pub generation_id: GenerationId,
    pub reason: TerminalReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub at: DateTime<Utc>,
}

impl TerminalEvent {
    pub fn new(generation_id: GenerationId, reason: TerminalReason, message: Option<String>) -> Self {
        let message = match (reason, message) {
            (TerminalReason::Error, None) => Some("generation failed".to_string()),
            (_, message) => message,
        };
        Self {
            generation_id,
            reason,
            message,
            at: Utc::now(),
        }
    }
}

/// Broadcast notifications published on the session bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum BusEvent {
    Delta(Delta),
    Terminal(TerminalEvent),
    HistoryCleared,
    ReasoningChanged { enabled: bool },
}

impl BusEvent {
    pub fn generation_id(&self) -> Option<GenerationId> {
        match self {
            BusEvent::Delta(delta) => Some(delta.generation_id),
            BusEvent::Terminal(terminal) => Some(terminal.generation_id),
            _ => None,
        }
    }

    /// Name used for the SSE `event:` field.
    pub fn signal_name(&self) -> &'static str {
        match self {
            BusEvent::Delta(_) => "delta",
            BusEvent::Terminal(_) => "terminal",
            BusEvent::HistoryCleared => "history_cleared",
            BusEvent::ReasoningChanged { .. } => "reasoning_changed",
        }
    }
}

/// Reply to `StartStreaming`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartReply {
    pub generation_id: GenerationId,
    pub started_at: DateTime<Utc>,
}
