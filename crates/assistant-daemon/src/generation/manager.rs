//! Lifecycle manager for "the current generation".
//!
//! The manager owns a single slot. Starting a generation supersedes whatever
//! occupies it: the old generation is marked cancelled and its terminal event
//! is published before the new generation is spawned, so no delta of the new
//! generation can precede it.
//!
//! Each generation guards its own state with a mutex and publishes deltas and
//! its terminal event while holding it. A generation that has gone terminal
//! publishes nothing further, which is what makes the terminal event both
//! unique and last.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::types::{BusEvent, Delta, DeltaKind, GenerationId, StartReply, TerminalEvent, TerminalReason};
use crate::bus::EventBus;
use crate::conversation::{ConversationEntry, ConversationStore};
use crate::inference::{InferenceTransport, PromptBuilder, StreamOutcome};
use crate::metrics;
use crate::settings::{InferenceSettings, SettingsHandle};

/// Lock-free counters for status reporting.
#[derive(Debug, Default)]
pub struct GenerationCounters {
    pub started: AtomicUsize,
    pub completed: AtomicUsize,
    pub cancelled: AtomicUsize,
    pub errored: AtomicUsize,
}

impl GenerationCounters {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, reason: TerminalReason) {
        let counter = match reason {
            TerminalReason::Completed => &self.completed,
            TerminalReason::Cancelled => &self.cancelled,
            TerminalReason::Error => &self.errored,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn terminal_total(&self) -> usize {
        self.completed.load(Ordering::Relaxed)
            + self.cancelled.load(Ordering::Relaxed)
            + self.errored.load(Ordering::Relaxed)
    }
}

/// Read-only view of the active generation.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationSnapshot {
    pub id: GenerationId,
    pub started_at: DateTime<Utc>,
    pub first_reasoning_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    pub content_chars: usize,
    pub reasoning_chars: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Active,
    Terminal(TerminalReason),
}

struct GenerationState {
    phase: Phase,
    content: String,
    reasoning: String,
    first_reasoning_at: Option<DateTime<Utc>>,
}

struct Generation {
    id: GenerationId,
    user_text: String,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    state: Mutex<GenerationState>,
}

impl Generation {
    fn new(user_text: String) -> Self {
        Self {
            id: GenerationId::new(),
            user_text,
            started_at: Utc::now(),
            cancel: CancellationToken::new(),
            state: Mutex::new(GenerationState {
                phase: Phase::Active,
                content: String::new(),
                reasoning: String::new(),
                first_reasoning_at: None,
            }),
        }
    }

    // A panic while holding the lock must not prevent the terminal event.
    fn state(&self) -> MutexGuard<'_, GenerationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_active(&self) -> bool {
        self.state().phase == Phase::Active
    }

    fn cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Returns `true` the first time cancellation is requested.
    fn request_cancel(&self) -> bool {
        let first = !self.cancel.is_cancelled();
        self.cancel.cancel();
        first
    }

    fn push_delta(&self, kind: DeltaKind, text: &str, bus: &EventBus) -> ControlFlow<()> {
        let mut state = self.state();
        if state.phase != Phase::Active || self.cancel_requested() {
            return ControlFlow::Break(());
        }

        let at = Utc::now();
        match kind {
            DeltaKind::Content => state.content.push_str(text),
            DeltaKind::Reasoning => {
                state.first_reasoning_at.get_or_insert(at);
                state.reasoning.push_str(text);
            }
        }
        bus.publish(BusEvent::Delta(Delta {
            generation_id: self.id,
            kind,
            text: text.to_string(),
            at,
        }));
        metrics::record_delta(kind);
        ControlFlow::Continue(())
    }

    /// Moves the generation to `Terminal` and publishes its terminal event.
    /// `before_publish` runs under the state lock with the accumulated answer
    /// text. Returns `false` if the generation was already terminal.
    fn finish(
        &self,
        reason: TerminalReason,
        message: Option<String>,
        bus: &EventBus,
        before_publish: impl FnOnce(&str),
    ) -> bool {
        let mut state = self.state();
        if state.phase != Phase::Active {
            return false;
        }
        state.phase = Phase::Terminal(reason);
        before_publish(&state.content);
        bus.publish(BusEvent::Terminal(TerminalEvent::new(self.id, reason, message)));
        true
    }

    fn snapshot(&self) -> GenerationSnapshot {
        let state = self.state();
        GenerationSnapshot {
            id: self.id,
            started_at: self.started_at,
            first_reasoning_at: state.first_reasoning_at,
            cancel_requested: self.cancel_requested(),
            content_chars: state.content.chars().count(),
            reasoning_chars: state.reasoning.chars().count(),
        }
    }
}

struct ManagerInner {
    slot: Mutex<Option<Arc<Generation>>>,
    bus: EventBus,
    transport: Arc<dyn InferenceTransport>,
    store: Arc<dyn ConversationStore>,
    settings: Arc<SettingsHandle>,
    prompt: PromptBuilder,
    counters: Arc<GenerationCounters>,
    idle: Notify,
}

impl ManagerInner {
    fn slot(&self) -> MutexGuard<'_, Option<Arc<Generation>>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn conclude(&self, generation: &Generation, reason: TerminalReason, message: Option<String>) -> bool {
        let concluded = generation.finish(reason, message.clone(), &self.bus, |content| {
            if reason != TerminalReason::Completed {
                return;
            }
            let entry = ConversationEntry::new(generation.user_text.clone(), content);
            if let Err(e) = self.store.append(entry) {
                error!("Failed to persist exchange for generation {}: {}", generation.id, e);
            }
        });

        if concluded {
            self.counters.record(reason);
            metrics::record_terminal(reason);
            match message {
                Some(message) => info!("Generation {} ended: {} ({})", generation.id, reason, message),
                None => info!("Generation {} ended: {}", generation.id, reason),
            }
        }
        concluded
    }

    fn release(&self, generation: &Generation) {
        let mut slot = self.slot();
        if slot.as_ref().map(|current| current.id) == Some(generation.id) {
            *slot = None;
            self.idle.notify_waiters();
        }
    }
}

/// Concludes the generation with an error if its driver never reached a
/// terminal state (panic or task abort), and frees the slot either way.
struct TerminalGuard<'a> {
    inner: &'a ManagerInner,
    generation: &'a Generation,
}

impl Drop for TerminalGuard<'_> {
    fn drop(&mut self) {
        if self.generation.is_active() {
            warn!("Generation {} dropped before completion", self.generation.id);
            self.inner.conclude(
                self.generation,
                TerminalReason::Error,
                Some("generation aborted".to_string()),
            );
        }
        self.inner.release(self.generation);
    }
}

#[derive(Clone)]
pub struct GenerationManager {
    inner: Arc<ManagerInner>,
}

impl GenerationManager {
    pub fn new(
        bus: EventBus,
        transport: Arc<dyn InferenceTransport>,
        store: Arc<dyn ConversationStore>,
        settings: Arc<SettingsHandle>,
        prompt: PromptBuilder,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                slot: Mutex::new(None),
                bus,
                transport,
                store,
                settings,
                prompt,
                counters: Arc::new(GenerationCounters::new()),
                idle: Notify::new(),
            }),
        }
    }

    pub fn counters(&self) -> Arc<GenerationCounters> {
        self.inner.counters.clone()
    }

    /// Supersedes any active generation, activates a new one and returns its
    /// id immediately. The transport is driven on a spawned task, so this
    /// must be called from within a tokio runtime.
    pub fn start(&self, user_text: impl Into<String>) -> StartReply {
        let settings = self.inner.settings.snapshot();
        let generation = Arc::new(Generation::new(user_text.into()));

        {
            let mut slot = self.inner.slot();
            if let Some(previous) = slot.take() {
                previous.request_cancel();
                if self.inner.conclude(&previous, TerminalReason::Cancelled, None) {
                    info!("Generation {} superseded by {}", previous.id, generation.id);
                }
            }
            *slot = Some(generation.clone());
        }

        self.inner.counters.started.fetch_add(1, Ordering::Relaxed);
        metrics::record_started();
        info!("Starting generation {} (model: {})", generation.id, settings.model);

        let reply = StartReply {
            generation_id: generation.id,
            started_at: generation.started_at,
        };
        tokio::spawn(drive(self.inner.clone(), generation, settings));
        reply
    }

    /// Requests cooperative cancellation of the active generation. Returns the
    /// id that was signalled, or `None` when nothing is active.
    pub fn stop(&self) -> Option<GenerationId> {
        let slot = self.inner.slot();
        match slot.as_ref() {
            Some(generation) if generation.is_active() => {
                if generation.request_cancel() {
                    info!("Stop requested for generation {}", generation.id);
                } else {
                    debug!("Stop already requested for generation {}", generation.id);
                }
                Some(generation.id)
            }
            _ => {
                debug!("Stop requested with no active generation");
                None
            }
        }
    }

    /// Resolves once no generation occupies the slot, i.e. after the last
    /// one has published its terminal event.
    pub async fn wait_idle(&self) {
        loop {
            let released = self.inner.idle.notified();
            let empty = self.inner.slot().is_none();
            if empty {
                return;
            }
            released.await;
        }
    }

    pub fn current(&self) -> Option<GenerationSnapshot> {
        let slot = self.inner.slot();
        slot.as_ref()
            .filter(|generation| generation.is_active())
            .map(|generation| generation.snapshot())
    }
}

async fn drive(inner: Arc<ManagerInner>, generation: Arc<Generation>, settings: Arc<InferenceSettings>) {
    let _guard = TerminalGuard {
        inner: &inner,
        generation: &generation,
    };

    let history = match inner.store.recent(inner.prompt.context_turns()) {
        Ok(history) => history,
        Err(e) => {
            warn!("Could not load conversation context: {}", e);
            Vec::new()
        }
    };
    let request = inner.prompt.build(&settings, &history, &generation.user_text);

    let bus = inner.bus.clone();
    let mut on_delta = |kind: DeltaKind, text: &str| generation.push_delta(kind, text, &bus);
    let outcome = inner
        .transport
        .stream(&request, &generation.cancel, &mut on_delta)
        .await;

    match outcome {
        Ok(StreamOutcome::Completed { content }) if !generation.cancel_requested() => {
            debug!("Generation {} stream finished ({} chars)", generation.id, content.len());
            inner.conclude(&generation, TerminalReason::Completed, None);
        }
        Ok(_) => {
            inner.conclude(&generation, TerminalReason::Cancelled, None);
        }
        Err(e) => {
            warn!("Generation {} transport failure: {}", generation.id, e);
            inner.conclude(&generation, TerminalReason::Error, Some(e.to_string()));
        }
    }
}
