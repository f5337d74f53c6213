//! Inference backend access: SSE framing, request construction and the
//! streaming transport.

pub mod frame;
pub mod prompt;
pub mod transport;

pub use prompt::{ChatMessage, InferenceRequest, PromptBuilder};
pub use transport::{DeltaSink, HttpTransport, InferenceTransport, StreamOutcome, TransportError};
