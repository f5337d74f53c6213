// assistant-daemon/crates/assistant-daemon/src/config.rs

use anyhow::{Context, Result};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::inference::prompt::supports_reasoning;
use crate::settings::InferenceSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasoningMode {
    On,
    Off,
    /// Enabled exactly when the model belongs to a known reasoning family.
    Auto,
}

impl FromStr for ReasoningMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "true" | "on" | "1" | "yes" => Ok(ReasoningMode::On),
            "false" | "off" | "0" | "no" => Ok(ReasoningMode::Off),
            "auto" => Ok(ReasoningMode::Auto),
            other => Err(anyhow::anyhow!("invalid reasoning mode: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub inference_url: String,
    pub model_id: String,
    pub reasoning: ReasoningMode,
    pub connect_timeout_seconds: u64,
    pub stream_idle_timeout_seconds: u64,
    pub context_turns: usize,
    pub max_tokens: Option<u32>,
    pub api_host: String,
    pub api_port: u16,
    pub database_path: PathBuf,
    pub render_interval_ms: u64,
    pub assistant_url: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        let max_tokens = match env::var("MAX_TOKENS") {
            Ok(raw) if !raw.trim().is_empty() => {
                Some(raw.trim().parse().context("MAX_TOKENS must be a positive integer")?)
            }
            _ => None,
        };

        let api_host = env::var("API_HOST").unwrap_or_else(|_| "127.0.0.1".into());
        let api_port: u16 = env::var("API_PORT")
            .unwrap_or_else(|_| "8765".into())
            .parse()
            .context("API_PORT must be a port number")?;

        Ok(Self {
            inference_url: env::var("INFERENCE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8080".into()),
            model_id: env::var("MODEL_ID").unwrap_or_else(|_| "default".into()),
            reasoning: env::var("REASONING_ENABLED")
                .unwrap_or_else(|_| "auto".into())
                .parse()?,
            connect_timeout_seconds: env::var("CONNECT_TIMEOUT_SECONDS")
                .unwrap_or_else(|_| "30".into())
                .parse()
                .context("CONNECT_TIMEOUT_SECONDS must be an integer")?,
            stream_idle_timeout_seconds: env::var("STREAM_IDLE_TIMEOUT_SECONDS")
                .unwrap_or_else(|_| "300".into())
                .parse()
                .context("STREAM_IDLE_TIMEOUT_SECONDS must be an integer")?,
            context_turns: env::var("CONTEXT_TURNS")
                .unwrap_or_else(|_| "5".into())
                .parse()
                .context("CONTEXT_TURNS must be an integer")?,
            max_tokens,
            assistant_url: env::var("ASSISTANT_URL")
                .unwrap_or_else(|_| format!("http://{}:{}", api_host, api_port)),
            api_host,
            api_port,
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "./data/conversations.db".into())
                .into(),
            render_interval_ms: env::var("RENDER_INTERVAL_MS")
                .unwrap_or_else(|_| "50".into())
                .parse()
                .context("RENDER_INTERVAL_MS must be an integer")?,
        })
    }

    pub fn print_config(&self) {
        info!("Inference backend: {}", self.inference_url);
        info!("Model: {} (reasoning: {:?})", self.model_id, self.reasoning);
        info!(
            "Timeouts: connect {}s, stream idle {}s",
            self.connect_timeout_seconds, self.stream_idle_timeout_seconds
        );
        info!("Context turns: {}, database: {}", self.context_turns, self.database_path.display());
        info!("Bus listening on {}:{}", self.api_host, self.api_port);
    }

    pub fn api_addr(&self) -> SocketAddr {
        format!("{}:{}", self.api_host, self.api_port)
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], self.api_port)))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    /// `None` when the idle timeout is disabled with `0`.
    pub fn stream_idle_timeout(&self) -> Option<Duration> {
        (self.stream_idle_timeout_seconds > 0).then(|| Duration::from_secs(self.stream_idle_timeout_seconds))
    }

    pub fn render_interval(&self) -> Duration {
        Duration::from_millis(self.render_interval_ms)
    }

    pub fn initial_settings(&self) -> InferenceSettings {
        let reasoning_enabled = match self.reasoning {
            ReasoningMode::On => true,
            ReasoningMode::Off => false,
            ReasoningMode::Auto => supports_reasoning(&self.model_id),
        };
        InferenceSettings {
            model: self.model_id.clone(),
            reasoning_enabled,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            inference_url: "http://127.0.0.1:8080".into(),
            model_id: "default".into(),
            reasoning: ReasoningMode::Auto,
            connect_timeout_seconds: 30,
            stream_idle_timeout_seconds: 300,
            context_turns: 5,
            max_tokens: None,
            api_host: "127.0.0.1".into(),
            api_port: 8765,
            database_path: PathBuf::from("./data/conversations.db"),
            render_interval_ms: 50,
            assistant_url: "http://127.0.0.1:8765".into(),
        }
    }
}
