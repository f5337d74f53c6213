//! Streaming HTTP transport to the inference backend.
//!
//! One call to [`InferenceTransport::stream`] opens one chat-completions
//! request and feeds every decoded delta to the caller's callback. Failures
//! are returned as [`TransportError`] values, never raised past this module.

use std::ops::ControlFlow;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::frame::{data_payload, parse_frame, Frame, LineDecoder};
use super::prompt::{ChatMessage, InferenceRequest};
use crate::config::Config;
use crate::generation::DeltaKind;

/// Per-delta callback. Returning `Break` stops the read loop.
pub type DeltaSink<'a> = dyn FnMut(DeltaKind, &str) -> ControlFlow<()> + Send + 'a;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// The stream ended naturally; `content` is the concatenated answer text.
    Completed { content: String },
    /// Reading stopped because cancellation was requested.
    Cancelled { content: String },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection refused: cannot reach the inference backend at {url}")]
    Connect { url: String },
    #[error("the inference backend timed out")]
    Timeout,
    #[error("inference backend returned HTTP {status}: {message}")]
    UpstreamStatus { status: u16, message: String },
    #[error("stream interrupted: {0}")]
    Stream(String),
    #[error("request to the inference backend failed: {0}")]
    Request(String),
}

impl TransportError {
    fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_connect() {
            TransportError::Connect { url: url.to_string() }
        } else {
            TransportError::Request(err.to_string())
        }
    }
}

#[async_trait]
pub trait InferenceTransport: Send + Sync {
    async fn stream(
        &self,
        request: &InferenceRequest,
        cancel: &CancellationToken,
        on_delta: &mut DeltaSink<'_>,
    ) -> Result<StreamOutcome, TransportError>;
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    reasoning: bool,
}

#[derive(Debug, Deserialize)]
struct UpstreamErrorBody {
    error: UpstreamErrorDetail,
}

#[derive(Debug, Deserialize)]
struct UpstreamErrorDetail {
    message: String,
}

enum LineStep {
    Continue,
    Finished,
    Stopped,
}

pub struct HttpTransport {
    base_url: String,
    http_client: reqwest::Client,
    idle_timeout: Option<Duration>,
}

impl HttpTransport {
    pub fn new(
        base_url: impl Into<String>,
        connect_timeout: Duration,
        idle_timeout: Option<Duration>,
    ) -> anyhow::Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let http_client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;
        info!("Inference transport targeting {}", base_url);
        Ok(Self {
            base_url,
            http_client,
            idle_timeout,
        })
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Self::new(
            config.inference_url.clone(),
            config.connect_timeout(),
            config.stream_idle_timeout(),
        )
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    async fn describe_status(response: reqwest::Response) -> TransportError {
        let status = response.status().as_u16();
        if status == 503 {
            return TransportError::UpstreamStatus {
                status,
                message: "model is still loading, please wait a moment and try again".to_string(),
            };
        }

        let body = response.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<UpstreamErrorBody>(&body) {
            Ok(parsed) => parsed.error.message,
            Err(_) => body.chars().take(200).collect(),
        };
        TransportError::UpstreamStatus { status, message }
    }

    async fn next_chunk<S>(&self, mut stream: Pin<&mut S>) -> Result<Option<Bytes>, TransportError>
    where
        S: Stream<Item = reqwest::Result<Bytes>>,
    {
        let next = match self.idle_timeout {
            Some(limit) => tokio::time::timeout(limit, stream.next())
                .await
                .map_err(|_| TransportError::Timeout)?,
            None => stream.next().await,
        };
        match next {
            Some(Ok(bytes)) => Ok(Some(bytes)),
            Some(Err(e)) if e.is_timeout() => Err(TransportError::Timeout),
            Some(Err(e)) => Err(TransportError::Stream(e.to_string())),
            None => Ok(None),
        }
    }

    fn handle_line(
        line: &str,
        content: &mut String,
        cancel: &CancellationToken,
        on_delta: &mut DeltaSink<'_>,
    ) -> LineStep {
        let Some(payload) = data_payload(line) else {
            return LineStep::Continue;
        };
        if payload.is_empty() {
            return LineStep::Continue;
        }

        match parse_frame(payload) {
            Ok(Frame::Done) => LineStep::Finished,
            Ok(Frame::Chunk { deltas, finished }) => {
                for (kind, text) in deltas {
                    if cancel.is_cancelled() {
                        return LineStep::Stopped;
                    }
                    if on_delta(kind, &text).is_break() {
                        return LineStep::Stopped;
                    }
                    if kind == DeltaKind::Content {
                        content.push_str(&text);
                    }
                }
                if finished {
                    LineStep::Finished
                } else {
                    LineStep::Continue
                }
            }
            Err(e) => {
                warn!("Skipping malformed frame: {}", e);
                debug!("Malformed frame payload: {}", payload);
                LineStep::Continue
            }
        }
    }
}

#[async_trait]
impl InferenceTransport for HttpTransport {
    async fn stream(
        &self,
        request: &InferenceRequest,
        cancel: &CancellationToken,
        on_delta: &mut DeltaSink<'_>,
    ) -> Result<StreamOutcome, TransportError> {
        let url = self.completions_url();
        debug!(
            "Opening stream to {} (model: {}, reasoning: {})",
            url, request.model, request.reasoning
        );

        let body = ChatCompletionRequest {
            model: &request.model,
            messages: &request.messages,
            temperature: request.temperature,
            stream: true,
            max_tokens: request.max_tokens,
            reasoning: request.reasoning,
        };

        let send = self.http_client.post(&url).json(&body).send();
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Ok(StreamOutcome::Cancelled { content: String::new() });
            }
            response = send => response.map_err(|e| TransportError::from_reqwest(&url, e))?,
        };

        if !response.status().is_success() {
            return Err(Self::describe_status(response).await);
        }

        let mut bytes = Box::pin(response.bytes_stream());
        let mut decoder = LineDecoder::new();
        let mut content = String::new();

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Cancellation observed between frames");
                    return Ok(StreamOutcome::Cancelled { content });
                }
                chunk = self.next_chunk(bytes.as_mut()) => chunk?,
            };
            let Some(chunk) = chunk else { break };

            for line in decoder.push(&chunk) {
                match Self::handle_line(&line, &mut content, cancel, on_delta) {
                    LineStep::Continue => {}
                    LineStep::Finished => return Ok(StreamOutcome::Completed { content }),
                    LineStep::Stopped => return Ok(StreamOutcome::Cancelled { content }),
                }
            }
        }

        // Connection closed without the sentinel; flush whatever was left.
        if let Some(line) = decoder.finish() {
            if let LineStep::Stopped = Self::handle_line(&line, &mut content, cancel, on_delta) {
                return Ok(StreamOutcome::Cancelled { content });
            }
        }
        debug!("Stream closed by backend ({} chars)", content.len());
        Ok(StreamOutcome::Completed { content })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> InferenceRequest {
        InferenceRequest {
            model: "llama3.2".into(),
            messages: vec![ChatMessage::user("What is 2+2?")],
            temperature: 0.7,
            reasoning: false,
            max_tokens: None,
        }
    }

    fn sse(frames: &[&str]) -> String {
        frames.iter().map(|f| format!("data: {f}\n\n")).collect()
    }

    async fn collect(
        transport: &HttpTransport,
        cancel: &CancellationToken,
    ) -> (Result<StreamOutcome, TransportError>, Vec<(DeltaKind, String)>) {
        let mut seen = Vec::new();
        let mut sink = |kind: DeltaKind, text: &str| {
            seen.push((kind, text.to_string()));
            ControlFlow::Continue(())
        };
        let result = transport.stream(&request(), cancel, &mut sink).await;
        (result, seen)
    }

    fn transport(url: String) -> HttpTransport {
        HttpTransport::new(url, Duration::from_secs(2), Some(Duration::from_secs(5))).unwrap()
    }

    #[tokio::test]
    async fn test_streams_content_and_skips_bad_frames() {
        let mut server = mockito::Server::new_async().await;
        let body = sse(&[
            r#"{"choices":[{"delta":{"role":"assistant","content":null}}]}"#,
            r#"{"choices":[{"delta":{"content":"The"}}]}"#,
            r#"{"choices":[{"delta":{"content":" answer is"#,
            r#"{"choices":[{"delta":{"content":" answer is"}}]}"#,
            r#"{"choices":[{"delta":{"content":" 4."}}]}"#,
            "[DONE]",
        ]);
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_body(mockito::Matcher::PartialJsonString(r#"{"stream":true}"#.into()))
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let (result, seen) = collect(&transport(server.url()), &CancellationToken::new()).await;

        mock.assert_async().await;
        assert_eq!(
            result.unwrap(),
            StreamOutcome::Completed { content: "The answer is 4.".into() }
        );
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|(kind, _)| *kind == DeltaKind::Content));
    }

    #[tokio::test]
    async fn test_reasoning_is_surfaced_but_not_returned() {
        let mut server = mockito::Server::new_async().await;
        let body = sse(&[
            r#"{"choices":[{"delta":{"reasoning_content":"Adding."}}]}"#,
            r#"{"choices":[{"delta":{"content":"4"},"finish_reason":"stop"}]}"#,
            r#"{"choices":[{"delta":{"content":"ignored"}}]}"#,
        ]);
        server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let (result, seen) = collect(&transport(server.url()), &CancellationToken::new()).await;

        assert_eq!(result.unwrap(), StreamOutcome::Completed { content: "4".into() });
        assert_eq!(
            seen,
            vec![
                (DeltaKind::Reasoning, "Adding.".to_string()),
                (DeltaKind::Content, "4".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_closed_connection_without_sentinel_completes() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_body("data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}")
            .create_async()
            .await;

        let (result, seen) = collect(&transport(server.url()), &CancellationToken::new()).await;
        assert_eq!(result.unwrap(), StreamOutcome::Completed { content: "hi".into() });
        assert_eq!(seen.len(), 1);
    }

    #[tokio::test]
    async fn test_upstream_status_is_an_error_value() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/chat/completions")
            .with_status(500)
            .with_body(r#"{"error":{"message":"out of memory"}}"#)
            .create_async()
            .await;

        let (result, seen) = collect(&transport(server.url()), &CancellationToken::new()).await;
        match result {
            Err(TransportError::UpstreamStatus { status, message }) => {
                assert_eq!(status, 500);
                assert_eq!(message, "out of memory");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(seen.is_empty());
    }

    #[tokio::test]
    async fn test_loading_model_message() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/chat/completions")
            .with_status(503)
            .create_async()
            .await;

        let (result, _) = collect(&transport(server.url()), &CancellationToken::new()).await;
        let err = result.unwrap_err();
        assert!(err.to_string().contains("still loading"));
    }

    #[tokio::test]
    async fn test_connection_refused_is_reported() {
        // Port 9 (discard) is not listening on test machines.
        let transport = transport("http://127.0.0.1:9".into());
        let (result, _) = collect(&transport, &CancellationToken::new()).await;
        let err = result.unwrap_err();
        assert!(
            matches!(err, TransportError::Connect { .. }),
            "unexpected error: {err:?}"
        );
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_break_from_callback_stops_reading() {
        let mut server = mockito::Server::new_async().await;
        let body = sse(&[
            r#"{"choices":[{"delta":{"content":"one"}}]}"#,
            r#"{"choices":[{"delta":{"content":"two"}}]}"#,
            "[DONE]",
        ]);
        server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let transport = transport(server.url());
        let mut calls = 0;
        let mut sink = |_: DeltaKind, _: &str| {
            calls += 1;
            ControlFlow::Break(())
        };
        let result = transport
            .stream(&request(), &CancellationToken::new(), &mut sink)
            .await
            .unwrap();

        assert_eq!(calls, 1);
        assert_eq!(result, StreamOutcome::Cancelled { content: String::new() });
    }

    #[tokio::test]
    async fn test_pre_cancelled_token_skips_request() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let transport = transport("http://127.0.0.1:9".into());
        let (result, seen) = collect(&transport, &cancel).await;
        assert_eq!(result.unwrap(), StreamOutcome::Cancelled { content: String::new() });
        assert!(seen.is_empty());
    }

    /// Answers with one frame, then keeps the connection open without
    /// sending anything else.
    async fn stalling_backend() -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n{}",
                sse(&[r#"{"choices":[{"delta":{"content":"The"}}]}"#])
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_stall_between_frames_times_out() {
        let url = stalling_backend().await;
        let transport =
            HttpTransport::new(url, Duration::from_secs(2), Some(Duration::from_millis(200))).unwrap();

        let (result, seen) = collect(&transport, &CancellationToken::new()).await;

        assert!(matches!(result, Err(TransportError::Timeout)), "unexpected result: {result:?}");
        assert_eq!(seen, vec![(DeltaKind::Content, "The".to_string())]);
    }
}
