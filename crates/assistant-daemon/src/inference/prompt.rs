//! Chat-completion request construction.

use serde::{Deserialize, Serialize};

use crate::conversation::ConversationEntry;
use crate::settings::InferenceSettings;

/// Model families that emit a separate reasoning channel.
pub const REASONING_FAMILIES: &[&str] = &[
    "deepseek-r1",
    "deepseek-reasoner",
    "qwq",
    "qwen3",
    "gpt-oss",
    "o1",
    "o3",
];

const REASONING_TEMPERATURE: f32 = 0.6;
const DEFAULT_TEMPERATURE: f32 = 0.7;

pub fn supports_reasoning(model: &str) -> bool {
    let name = display_name(model).to_lowercase();
    REASONING_FAMILIES.iter().any(|family| {
        name == *family
            || name.starts_with(&format!("{family}:"))
            || name.starts_with(&format!("{family}-"))
            || name.starts_with(&format!("{family}."))
    })
}

/// `ollama://library/llama3.2:latest` -> `llama3.2`
pub fn display_name(model: &str) -> &str {
    let name = model.rsplit('/').next().unwrap_or(model);
    name.strip_suffix(":latest").unwrap_or(name)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".into(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".into(), content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".into(), content: content.into() }
    }
}

/// Everything the transport needs to open one streaming call.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub reasoning: bool,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct PromptBuilder {
    context_turns: usize,
    max_tokens: Option<u32>,
}

impl PromptBuilder {
    pub fn new(context_turns: usize, max_tokens: Option<u32>) -> Self {
        Self { context_turns, max_tokens }
    }

    pub fn context_turns(&self) -> usize {
        self.context_turns
    }

    /// `history` is oldest first; only the last `context_turns` entries are replayed.
    pub fn build(
        &self,
        settings: &InferenceSettings,
        history: &[ConversationEntry],
        user_text: &str,
    ) -> InferenceRequest {
        let mut messages = vec![ChatMessage::system(system_prompt(&settings.model))];

        let skip = history.len().saturating_sub(self.context_turns);
        for entry in &history[skip..] {
            messages.push(ChatMessage::user(entry.user_text.clone()));
            messages.push(ChatMessage::assistant(entry.answer_text.clone()));
        }
        messages.push(ChatMessage::user(user_text));

        let reasoning = settings.reasoning_active();
        InferenceRequest {
            model: settings.model.clone(),
            messages,
            temperature: if reasoning { REASONING_TEMPERATURE } else { DEFAULT_TEMPERATURE },
            reasoning,
            max_tokens: self.max_tokens,
        }
    }
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new(5, None)
    }
}

fn system_prompt(model: &str) -> String {
    format!(
        "You are a helpful desktop assistant running locally on the user's machine \
         using the {} model. Answer clearly and concisely. Use markdown when it helps.",
        display_name(model)
    )
}
