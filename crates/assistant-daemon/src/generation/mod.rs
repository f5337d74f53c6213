//! Generation lifecycle: identifiers, events and the single-slot manager.

pub mod manager;
pub mod types;

pub use manager::{GenerationCounters, GenerationManager, GenerationSnapshot};
pub use types::{
    BusEvent, Delta, DeltaKind, GenerationId, StartReply, TerminalEvent, TerminalReason,
};
