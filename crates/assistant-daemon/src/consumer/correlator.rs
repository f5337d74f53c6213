//! Consumer correlator.
//!
//! Holds the id of the generation the user is looking at and discards every
//! signal tagged with any other id. That single comparison is what keeps the
//! tail of a superseded generation out of the newer exchange.
//!
//! Content is rendered through a [`RenderThrottle`]; the terminal event always
//! triggers one final unthrottled render so nothing is lost.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::presenter::Presenter;
use super::throttle::RenderThrottle;
use crate::bus::{AssistantBus, SignalStream};
use crate::generation::{BusEvent, Delta, DeltaKind, GenerationId, TerminalReason};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCommand {
    Send(String),
    Stop,
    ClearHistory,
    SetReasoning(bool),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeOutcome {
    Completed,
    Cancelled,
    Errored(String),
}

/// A finished exchange, kept for later reference.
#[derive(Debug, Clone)]
pub struct ExchangeRecord {
    pub generation_id: GenerationId,
    pub user_text: String,
    pub content: String,
    pub reasoning: Option<String>,
    pub reasoning_duration: Option<Duration>,
    pub outcome: ExchangeOutcome,
}

struct Exchange {
    generation_id: GenerationId,
    user_text: String,
    started_at: DateTime<Utc>,
    content: String,
    // Created lazily by the first reasoning delta.
    reasoning: Option<String>,
    first_content_at: Option<DateTime<Utc>>,
    content_dirty: bool,
    reasoning_dirty: bool,
    reasoning_opened: bool,
}

impl Exchange {
    fn new(generation_id: GenerationId, user_text: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            generation_id,
            user_text: user_text.to_string(),
            started_at,
            content: String::new(),
            reasoning: None,
            first_content_at: None,
            content_dirty: false,
            reasoning_dirty: false,
            reasoning_opened: false,
        }
    }

    fn apply(&mut self, delta: &Delta) {
        match delta.kind {
            DeltaKind::Content => {
                self.first_content_at.get_or_insert(delta.at);
                self.content.push_str(&delta.text);
                self.content_dirty = true;
            }
            DeltaKind::Reasoning => {
                self.reasoning.get_or_insert_with(String::new).push_str(&delta.text);
                self.reasoning_dirty = true;
            }
        }
    }

    /// Time from the start of the generation until the answer began, or
    /// until the generation ended if no answer text arrived.
    fn reasoning_duration(&self, ended_at: DateTime<Utc>) -> Option<Duration> {
        self.reasoning.as_ref()?;
        let end = self.first_content_at.unwrap_or(ended_at);
        (end - self.started_at).to_std().ok()
    }
}

enum Step {
    Signal(Option<BusEvent>),
    Command(Option<UserCommand>),
    Flush,
}

pub struct Correlator<P: Presenter> {
    bus: Arc<dyn AssistantBus>,
    presenter: P,
    signals: SignalStream,
    throttle: RenderThrottle,
    current: Option<GenerationId>,
    exchange: Option<Exchange>,
    history: Vec<ExchangeRecord>,
}

impl<P: Presenter> Correlator<P> {
    /// Subscribes to the bus once; the subscription lives as long as the
    /// correlator.
    pub async fn connect(
        bus: Arc<dyn AssistantBus>,
        presenter: P,
        render_interval: Duration,
    ) -> anyhow::Result<Self> {
        let signals = bus.subscribe().await?;
        Ok(Self {
            bus,
            presenter,
            signals,
            throttle: RenderThrottle::new(render_interval),
            current: None,
            exchange: None,
            history: Vec::new(),
        })
    }

    pub fn current_generation(&self) -> Option<GenerationId> {
        self.current
    }

    pub fn is_generating(&self) -> bool {
        self.current.is_some()
    }

    pub fn history(&self) -> &[ExchangeRecord] {
        &self.history
    }

    pub fn presenter(&self) -> &P {
        &self.presenter
    }

    /// Text rendered so far for the exchange in progress.
    pub fn buffer(&self) -> Option<&str> {
        self.exchange.as_ref().map(|exchange| exchange.content.as_str())
    }

    /// Starts a new generation. An exchange still in progress is closed as
    /// cancelled; its late signals are filtered out by id.
    pub async fn send(&mut self, text: &str) -> anyhow::Result<GenerationId> {
        let reply = self.bus.start_streaming(text).await?;

        if let Some(previous) = self.exchange.take() {
            debug!("Generation {} superseded locally", previous.generation_id);
            self.close_exchange(previous, ExchangeOutcome::Cancelled, Utc::now());
        }

        self.current = Some(reply.generation_id);
        self.throttle.reset();
        self.presenter.begin_exchange(text);
        self.presenter.set_generating(true);
        self.exchange = Some(Exchange::new(reply.generation_id, text, reply.started_at));
        Ok(reply.generation_id)
    }

    pub async fn stop(&mut self) -> anyhow::Result<()> {
        self.bus.stop_generation().await?;
        Ok(())
    }

    pub async fn clear_history(&mut self) -> anyhow::Result<()> {
        self.bus.clear_history().await
    }

    pub async fn set_reasoning_enabled(&mut self, enabled: bool) -> anyhow::Result<()> {
        self.bus.set_reasoning_enabled(enabled).await
    }

    pub fn handle_event(&mut self, event: BusEvent, now: Instant) {
        match event {
            BusEvent::Delta(delta) => {
                if self.current != Some(delta.generation_id) {
                    trace!("Discarding delta for generation {}", delta.generation_id);
                    return;
                }
                let Some(exchange) = self.exchange.as_mut() else { return };
                exchange.apply(&delta);
                if self.throttle.on_data(now) {
                    self.render();
                }
            }
            BusEvent::Terminal(terminal) => {
                if self.current != Some(terminal.generation_id) {
                    trace!("Discarding terminal event for generation {}", terminal.generation_id);
                    return;
                }
                self.current = None;
                let Some(exchange) = self.exchange.take() else { return };
                let outcome = match terminal.reason {
                    TerminalReason::Completed => ExchangeOutcome::Completed,
                    TerminalReason::Cancelled => ExchangeOutcome::Cancelled,
                    TerminalReason::Error => ExchangeOutcome::Errored(
                        terminal.message.unwrap_or_else(|| "generation failed".to_string()),
                    ),
                };
                self.close_exchange(exchange, outcome, terminal.at);
            }
            BusEvent::HistoryCleared => self.presenter.history_cleared(),
            BusEvent::ReasoningChanged { enabled } => {
                debug!("Reasoning {} on the daemon", if enabled { "enabled" } else { "disabled" });
            }
        }
    }

    /// Performs a deferred render if its deadline has passed.
    pub fn flush_pending(&mut self, now: Instant) {
        if self.throttle.on_tick(now) {
            self.render();
        }
    }

    /// Waits for the next signal or render deadline and handles it. Returns
    /// `false` once the signal stream has ended.
    pub async fn poll_once(&mut self) -> bool {
        let deadline = self.throttle.deadline();
        let step = tokio::select! {
            biased;
            event = self.signals.next() => Step::Signal(event),
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => Step::Flush,
        };
        match step {
            Step::Signal(Some(event)) => {
                self.handle_event(event, Instant::now());
                true
            }
            Step::Signal(None) => false,
            _ => {
                self.flush_pending(Instant::now());
                true
            }
        }
    }

    /// Pumps signals until the current exchange has closed.
    pub async fn wait_idle(&mut self) {
        while self.is_generating() {
            if !self.poll_once().await {
                break;
            }
        }
    }

    /// Event loop for interactive use: user commands and bus signals are
    /// handled on one task, in arrival order.
    pub async fn run(mut self, mut commands: mpsc::Receiver<UserCommand>) -> anyhow::Result<P> {
        loop {
            let deadline = self.throttle.deadline();
            // Signals already delivered belong to the exchange the user is
            // looking at and must be applied before the next command.
            let step = tokio::select! {
                biased;
                event = self.signals.next() => Step::Signal(event),
                command = commands.recv() => Step::Command(command),
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => Step::Flush,
            };

            match step {
                Step::Signal(Some(event)) => self.handle_event(event, Instant::now()),
                Step::Signal(None) => {
                    warn!("Signal stream closed by the daemon");
                    break;
                }
                Step::Command(Some(command)) => self.execute(command).await,
                Step::Command(None) => break,
                Step::Flush => self.flush_pending(Instant::now()),
            }
        }
        Ok(self.presenter)
    }

    async fn execute(&mut self, command: UserCommand) {
        let result = match command {
            UserCommand::Send(text) => self.send(&text).await.map(|_| ()),
            UserCommand::Stop => self.stop().await,
            UserCommand::ClearHistory => self.clear_history().await,
            UserCommand::SetReasoning(enabled) => self.set_reasoning_enabled(enabled).await,
        };
        if let Err(e) = result {
            warn!("Command failed: {}", e);
        }
    }

    fn render(&mut self) {
        if let Some(exchange) = self.exchange.as_mut() {
            Self::paint(&mut self.presenter, exchange);
        }
    }

    fn paint(presenter: &mut P, exchange: &mut Exchange) {
        if exchange.reasoning_dirty {
            if let Some(reasoning) = &exchange.reasoning {
                if !exchange.reasoning_opened {
                    presenter.open_reasoning();
                    exchange.reasoning_opened = true;
                }
                presenter.render_reasoning(reasoning);
            }
            exchange.reasoning_dirty = false;
        }
        if exchange.content_dirty {
            presenter.render_content(&exchange.content);
            exchange.content_dirty = false;
        }
    }

    fn close_exchange(&mut self, mut exchange: Exchange, outcome: ExchangeOutcome, ended_at: DateTime<Utc>) {
        // Final render bypasses the throttle.
        exchange.content_dirty = true;
        exchange.reasoning_dirty = exchange.reasoning.is_some();
        Self::paint(&mut self.presenter, &mut exchange);
        self.throttle.reset();

        let reasoning_duration = exchange.reasoning_duration(ended_at);
        let record = ExchangeRecord {
            generation_id: exchange.generation_id,
            user_text: exchange.user_text,
            content: exchange.content,
            reasoning: exchange.reasoning,
            reasoning_duration,
            outcome,
        };

        self.presenter.set_generating(false);
        self.presenter.finish_exchange(&record);
        self.history.push(record);
    }
}
