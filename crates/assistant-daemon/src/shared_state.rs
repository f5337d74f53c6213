//! Daemon-wide state shared by the bus handlers.
//!
//! Everything lives behind `Arc`s; the HTTP layer and the in-process bus both
//! reach the same [`AssistantService`].

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::config::Config;
use crate::conversation::ConversationStore;
use crate::generation::{BusEvent, GenerationCounters, GenerationManager, GenerationSnapshot, StartReply};
use crate::inference::{InferenceTransport, PromptBuilder};
use crate::settings::{InferenceSettings, SettingsHandle};

pub struct AssistantService {
    pub config: Arc<Config>,
    pub settings: Arc<SettingsHandle>,
    pub store: Arc<dyn ConversationStore>,
    pub bus: EventBus,
    pub manager: GenerationManager,
    counters: Arc<GenerationCounters>,
    shutdown: CancellationToken,
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub daemon_status: &'static str,
    pub settings: InferenceSettings,
    pub reasoning_supported: bool,
    pub active_generation: Option<GenerationSnapshot>,
    pub generations_started: usize,
    pub generations_completed: usize,
    pub generations_cancelled: usize,
    pub generations_failed: usize,
    pub subscribers: usize,
}

impl AssistantService {
    pub fn new(
        config: Config,
        transport: Arc<dyn InferenceTransport>,
        store: Arc<dyn ConversationStore>,
    ) -> Self {
        info!("Initializing assistant service");

        let settings = Arc::new(SettingsHandle::new(config.initial_settings()));
        let bus = EventBus::new();
        let manager = GenerationManager::new(
            bus.clone(),
            transport,
            store.clone(),
            settings.clone(),
            PromptBuilder::new(config.context_turns, config.max_tokens),
        );
        let counters = manager.counters();

        Self {
            config: Arc::new(config),
            settings,
            store,
            bus,
            manager,
            counters,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn start_streaming(&self, text: &str) -> StartReply {
        self.manager.start(text)
    }

    pub fn clear_history(&self) -> anyhow::Result<()> {
        self.store.clear()?;
        info!("Conversation history cleared");
        self.bus.publish(BusEvent::HistoryCleared);
        Ok(())
    }

    pub fn set_reasoning_enabled(&self, enabled: bool) {
        self.settings.set_reasoning_enabled(enabled);
        info!("Reasoning {}", if enabled { "enabled" } else { "disabled" });
        self.bus.publish(BusEvent::ReasoningChanged { enabled });
    }

    /// Stops the active generation and ends every open signal stream once
    /// its terminal event is out. Gives up on that event after `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        if self.manager.stop().is_some()
            && tokio::time::timeout(grace, self.manager.wait_idle()).await.is_err()
        {
            warn!("Active generation did not finish within {:?}", grace);
        }
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn status(&self) -> StatusReport {
        let settings = (*self.settings.snapshot()).clone();
        let active_generation = self.manager.current();
        StatusReport {
            daemon_status: if active_generation.is_some() { "thinking" } else { "ready" },
            reasoning_supported: crate::inference::prompt::supports_reasoning(&settings.model),
            settings,
            active_generation,
            generations_started: self.counters.started.load(Ordering::Relaxed),
            generations_completed: self.counters.completed.load(Ordering::Relaxed),
            generations_cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            generations_failed: self.counters.errored.load(Ordering::Relaxed),
            subscribers: self.bus.subscriber_count(),
        }
    }
}

/// State handed to the axum router.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<AssistantService>,
}

impl AppState {
    pub fn new(service: Arc<AssistantService>) -> Self {
        Self { service }
    }
}
