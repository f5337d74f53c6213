//! Bus client for a daemon running in another process.
//!
//! Methods are plain JSON POSTs; signals arrive over a long-lived SSE
//! response from `GET /signals`.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{AssistantBus, SignalStream};
use crate::generation::{BusEvent, GenerationId, StartReply};
use crate::inference::frame::{data_payload, LineDecoder};

#[derive(Debug, Serialize, Deserialize)]
pub struct StartRequest {
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StopReply {
    pub acknowledged: bool,
    #[serde(default)]
    pub generation_id: Option<GenerationId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReasoningRequest {
    pub enabled: bool,
}

pub struct HttpBusClient {
    base_url: String,
    http_client: reqwest::Client,
}

impl HttpBusClient {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> anyhow::Result<reqwest::Response> {
        let response = self
            .http_client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Assistant daemon unreachable: {}", e))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Assistant daemon returned {}: {}", status, body));
        }
        Ok(response)
    }
}

#[async_trait]
impl AssistantBus for HttpBusClient {
    async fn start_streaming(&self, text: &str) -> anyhow::Result<StartReply> {
        let response = self
            .post("/streaming/start", &StartRequest { text: text.to_string() })
            .await?;
        response
            .json::<StartReply>()
            .await
            .map_err(|e| anyhow::anyhow!("Invalid start reply: {}", e))
    }

    async fn stop_generation(&self) -> anyhow::Result<bool> {
        let reply: StopReply = self
            .post("/generation/stop", &serde_json::json!({}))
            .await?
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Invalid stop reply: {}", e))?;
        Ok(reply.acknowledged)
    }

    async fn clear_history(&self) -> anyhow::Result<()> {
        self.post("/history/clear", &serde_json::json!({})).await?;
        Ok(())
    }

    async fn set_reasoning_enabled(&self, enabled: bool) -> anyhow::Result<()> {
        self.post("/settings/reasoning", &ReasoningRequest { enabled }).await?;
        Ok(())
    }

    async fn subscribe(&self) -> anyhow::Result<SignalStream> {
        let response = self
            .http_client
            .get(self.url("/signals"))
            .header("accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to subscribe to signals: {}", e))?;
        if !response.status().is_success() {
            return Err(anyhow::anyhow!("Signal subscription rejected: {}", response.status()));
        }

        let mut bytes = Box::pin(response.bytes_stream());
        let stream = async_stream::stream! {
            let mut decoder = LineDecoder::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!("Signal stream interrupted: {}", e);
                        break;
                    }
                };
                for line in decoder.push(&chunk) {
                    let Some(payload) = data_payload(&line) else { continue };
                    match serde_json::from_str::<BusEvent>(payload) {
                        Ok(event) => yield event,
                        Err(e) => debug!("Ignoring unrecognised signal: {}", e),
                    }
                }
            }
        };
        Ok(stream.boxed())
    }
}
