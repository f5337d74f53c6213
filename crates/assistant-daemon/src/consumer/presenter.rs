//! Presentation seam for the correlator.

use std::io::Write;

use tracing::debug;

use super::correlator::{ExchangeOutcome, ExchangeRecord};

/// Receives rendering calls from a [`Correlator`](super::Correlator).
///
/// `render_content` and `render_reasoning` always receive the full text
/// accumulated so far, never a fragment.
pub trait Presenter {
    fn begin_exchange(&mut self, user_text: &str);

    fn render_content(&mut self, content: &str);

    /// Called once per exchange, right before the first reasoning render.
    fn open_reasoning(&mut self);

    fn render_reasoning(&mut self, reasoning: &str);

    fn set_generating(&mut self, generating: bool);

    fn finish_exchange(&mut self, record: &ExchangeRecord);

    fn history_cleared(&mut self) {}
}

/// Streams an exchange to a terminal, printing only what is new since the
/// previous render.
pub struct TerminalPresenter<W: Write> {
    out: W,
    printed_content: usize,
    printed_reasoning: usize,
    reasoning_open: bool,
    content_started: bool,
}

impl<W: Write> TerminalPresenter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            printed_content: 0,
            printed_reasoning: 0,
            reasoning_open: false,
            content_started: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write(&mut self, text: &str) {
        if let Err(e) = self.out.write_all(text.as_bytes()).and_then(|_| self.out.flush()) {
            debug!("Terminal write failed: {}", e);
        }
    }
}

impl<W: Write> Presenter for TerminalPresenter<W> {
    fn begin_exchange(&mut self, _user_text: &str) {
        self.printed_content = 0;
        self.printed_reasoning = 0;
        self.reasoning_open = false;
        self.content_started = false;
    }

    fn render_content(&mut self, content: &str) {
        let Some(fresh) = content.get(self.printed_content..) else { return };
        if fresh.is_empty() {
            return;
        }
        let mut text = String::new();
        if self.reasoning_open && !self.content_started {
            text.push_str("\n\n");
        }
        text.push_str(fresh);
        self.content_started = true;
        self.printed_content = content.len();
        self.write(&text);
    }

    fn open_reasoning(&mut self) {
        self.reasoning_open = true;
        self.write("[thinking] ");
    }

    fn render_reasoning(&mut self, reasoning: &str) {
        let Some(fresh) = reasoning.get(self.printed_reasoning..) else { return };
        if fresh.is_empty() {
            return;
        }
        self.printed_reasoning = reasoning.len();
        self.write(fresh);
    }

    fn set_generating(&mut self, _generating: bool) {}

    fn finish_exchange(&mut self, record: &ExchangeRecord) {
        let mut text = String::new();
        if let Some(duration) = record.reasoning_duration {
            text.push_str(&format!("\n[thought for {:.1}s]", duration.as_secs_f64()));
        }
        match &record.outcome {
            ExchangeOutcome::Completed => {}
            ExchangeOutcome::Cancelled => text.push_str("\n[stopped]"),
            ExchangeOutcome::Errored(message) => text.push_str(&format!("\n[error] {}", message)),
        }
        text.push('\n');
        self.write(&text);
    }

    fn history_cleared(&mut self) {
        self.write("[history cleared]\n");
    }
}
