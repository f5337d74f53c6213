// assistant-daemon/crates/assistant-daemon/src/lib.rs

pub mod api;
pub mod bus;
pub mod config;
pub mod consumer;
pub mod conversation;
pub mod generation;
pub mod inference;
pub mod metrics;
pub mod server;
pub mod settings;
pub mod shared_state;
pub mod telemetry;

// Public API exports
pub use config::Config;
pub use server::{build_router, run_daemon};
pub use shared_state::{AppState, AssistantService};

pub use bus::{AssistantBus, EventBus, HttpBusClient, LocalBus};
pub use consumer::{Correlator, ExchangeOutcome, ExchangeRecord, Presenter, TerminalPresenter, UserCommand};
pub use conversation::{ConversationEntry, ConversationStore, InMemoryConversationStore, SqliteConversationStore};
pub use generation::{BusEvent, DeltaKind, GenerationId, GenerationManager, TerminalReason};
pub use inference::{HttpTransport, InferenceTransport, TransportError};
