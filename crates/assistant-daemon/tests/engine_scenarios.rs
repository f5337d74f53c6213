//! End-to-end scenarios: service, bus and correlator wired together.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use assistant_daemon::consumer::ExchangeRecord;
use assistant_daemon::inference::{DeltaSink, InferenceRequest, StreamOutcome};
use assistant_daemon::{
    build_router, AppState, AssistantBus, AssistantService, BusEvent, Config, ConversationStore,
    Correlator, DeltaKind, ExchangeOutcome, GenerationId, HttpBusClient, HttpTransport,
    InMemoryConversationStore, InferenceTransport, LocalBus, Presenter, TerminalReason, TransportError,
};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Answers each prompt from a fixed script keyed by the user's message.
struct ScriptedBackend {
    step: Duration,
}

impl ScriptedBackend {
    fn script(prompt: &str) -> (Vec<(DeltaKind, &'static str)>, Option<&'static str>) {
        match prompt {
            "What is 2+2?" => (
                vec![(DeltaKind::Content, "The"), (DeltaKind::Content, " answer is"), (DeltaKind::Content, " 4.")],
                None,
            ),
            "Count to 10" => (
                ["1", ", 2", ", 3", ", 4", ", 5", ", 6", ", 7", ", 8", ", 9", ", 10"]
                    .into_iter()
                    .map(|t| (DeltaKind::Content, t))
                    .collect(),
                None,
            ),
            "What color is the sky?" => (vec![(DeltaKind::Content, "Blue.")], None),
            "Think first" => (
                vec![(DeltaKind::Reasoning, "Hmm."), (DeltaKind::Content, "Done.")],
                None,
            ),
            _ => (
                vec![(DeltaKind::Content, "The"), (DeltaKind::Content, " answer")],
                Some("connection reset by peer"),
            ),
        }
    }
}

#[async_trait]
impl InferenceTransport for ScriptedBackend {
    async fn stream(
        &self,
        request: &InferenceRequest,
        cancel: &CancellationToken,
        on_delta: &mut DeltaSink<'_>,
    ) -> Result<StreamOutcome, TransportError> {
        let prompt = request.messages.last().map(|m| m.content.as_str()).unwrap_or_default();
        let (deltas, failure) = Self::script(prompt);
        let mut content = String::new();
        for (kind, text) in deltas {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(StreamOutcome::Cancelled { content }),
                _ = tokio::time::sleep(self.step) => {}
            }
            if let ControlFlow::Break(()) = on_delta(kind, text) {
                return Ok(StreamOutcome::Cancelled { content });
            }
            if kind == DeltaKind::Content {
                content.push_str(text);
            }
        }
        match failure {
            Some(message) => Err(TransportError::Stream(message.into())),
            None => Ok(StreamOutcome::Completed { content }),
        }
    }
}

#[derive(Default)]
struct Recording {
    renders: Vec<String>,
    reasoning_regions: usize,
    generating: Vec<bool>,
    finished: Vec<ExchangeRecord>,
}

impl Presenter for Recording {
    fn begin_exchange(&mut self, _user_text: &str) {}

    fn render_content(&mut self, content: &str) {
        self.renders.push(content.to_string());
    }

    fn open_reasoning(&mut self) {
        self.reasoning_regions += 1;
    }

    fn render_reasoning(&mut self, _reasoning: &str) {}

    fn set_generating(&mut self, generating: bool) {
        self.generating.push(generating);
    }

    fn finish_exchange(&mut self, record: &ExchangeRecord) {
        self.finished.push(record.clone());
    }
}

fn test_config() -> Config {
    Config {
        model_id: "llama3.2".into(),
        render_interval_ms: 50,
        ..Config::default()
    }
}

struct Harness {
    service: Arc<AssistantService>,
    store: InMemoryConversationStore,
    observer: mpsc::UnboundedReceiver<BusEvent>,
}

fn harness(step: Duration) -> Harness {
    let store = InMemoryConversationStore::new();
    let service = Arc::new(AssistantService::new(
        test_config(),
        Arc::new(ScriptedBackend { step }),
        Arc::new(store.clone()),
    ));
    let observer = service.bus.subscribe();
    Harness { service, store, observer }
}

async fn correlator(service: &Arc<AssistantService>) -> Correlator<Recording> {
    let bus = Arc::new(LocalBus::new(service.clone()));
    Correlator::connect(bus, Recording::default(), Duration::from_millis(50))
        .await
        .unwrap()
}

async fn settle(correlator: &mut Correlator<Recording>) {
    tokio::time::timeout(Duration::from_secs(5), correlator.wait_idle())
        .await
        .expect("exchange never finished");
}

fn drain(observer: &mut mpsc::UnboundedReceiver<BusEvent>) -> Vec<BusEvent> {
    let mut events = Vec::new();
    while let Ok(event) = observer.try_recv() {
        events.push(event);
    }
    events
}

fn terminal_count(events: &[BusEvent], id: GenerationId) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, BusEvent::Terminal(t) if t.generation_id == id))
        .count()
}

#[tokio::test]
async fn content_round_trip() {
    let mut h = harness(Duration::from_millis(5));
    let mut correlator = correlator(&h.service).await;

    let id = correlator.send("What is 2+2?").await.unwrap();
    settle(&mut correlator).await;

    let presenter = correlator.presenter();
    assert_eq!(presenter.renders.last().unwrap(), "The answer is 4.");
    assert_eq!(presenter.reasoning_regions, 0);
    assert_eq!(presenter.generating, vec![true, false]);
    assert_eq!(presenter.finished[0].outcome, ExchangeOutcome::Completed);

    let entries = h.store.recent(10).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].user_text, "What is 2+2?");
    assert_eq!(entries[0].answer_text, "The answer is 4.");

    let events = drain(&mut h.observer);
    assert_eq!(terminal_count(&events, id), 1);
    assert!(matches!(events.last(), Some(BusEvent::Terminal(t)) if t.reason == TerminalReason::Completed));
}

#[tokio::test]
async fn supersede_cancels_then_completes_without_interleaving() {
    let mut h = harness(Duration::from_millis(20));
    let mut correlator = correlator(&h.service).await;

    let first = correlator.send("Count to 10").await.unwrap();
    while correlator.buffer().map_or(true, str::is_empty) {
        assert!(correlator.poll_once().await);
    }
    let second = correlator.send("What color is the sky?").await.unwrap();
    settle(&mut correlator).await;
    // Let any trailing signal from the first generation arrive.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let events = drain(&mut h.observer);
    assert_eq!(terminal_count(&events, first), 1);
    assert_eq!(terminal_count(&events, second), 1);

    let first_terminal = events
        .iter()
        .position(|e| matches!(e, BusEvent::Terminal(t) if t.generation_id == first))
        .unwrap();
    assert!(matches!(&events[first_terminal], BusEvent::Terminal(t) if t.reason == TerminalReason::Cancelled));
    for (index, event) in events.iter().enumerate() {
        match event {
            BusEvent::Delta(d) if d.generation_id == first => assert!(index < first_terminal),
            BusEvent::Delta(d) if d.generation_id == second => assert!(index > first_terminal),
            _ => {}
        }
    }

    let history = correlator.history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].outcome, ExchangeOutcome::Cancelled);
    assert_eq!(history[1].content, "Blue.");
    assert_eq!(history[1].outcome, ExchangeOutcome::Completed);

    let entries = h.store.recent(10).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].user_text, "What color is the sky?");
}

#[tokio::test]
async fn mid_stream_failure_keeps_partial_text() {
    let mut h = harness(Duration::from_millis(5));
    let mut correlator = correlator(&h.service).await;

    let id = correlator.send("Tell me something").await.unwrap();
    settle(&mut correlator).await;

    let record = &correlator.history()[0];
    assert_eq!(record.content, "The answer");
    assert!(matches!(&record.outcome, ExchangeOutcome::Errored(m) if m.contains("connection reset")));
    assert!(!correlator.is_generating());
    assert!(h.store.is_empty());

    let events = drain(&mut h.observer);
    assert_eq!(terminal_count(&events, id), 1);
}

#[tokio::test]
async fn connection_refused_is_reported_as_error() {
    let store = InMemoryConversationStore::new();
    let transport = HttpTransport::new("http://127.0.0.1:9", Duration::from_secs(2), None).unwrap();
    let service = Arc::new(AssistantService::new(
        test_config(),
        Arc::new(transport),
        Arc::new(store.clone()),
    ));
    let mut correlator = correlator(&service).await;

    correlator.send("hello").await.unwrap();
    settle(&mut correlator).await;

    let record = &correlator.history()[0];
    assert!(record.content.is_empty());
    assert!(matches!(&record.outcome, ExchangeOutcome::Errored(m) if m.contains("connection refused")));
    assert!(store.is_empty());
}

/// Inference backend that sends one frame and then goes quiet.
async fn stalling_backend() -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let _ = socket.read(&mut buf).await;
        let response = concat!(
            "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"The\"}}]}\n\n",
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.flush().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn stalled_backend_ends_with_one_error_terminal() {
    let url = stalling_backend().await;
    let store = InMemoryConversationStore::new();
    let transport = HttpTransport::new(url, Duration::from_secs(2), Some(Duration::from_millis(200))).unwrap();
    let service = Arc::new(AssistantService::new(
        test_config(),
        Arc::new(transport),
        Arc::new(store.clone()),
    ));
    let mut observer = service.bus.subscribe();
    let mut correlator = correlator(&service).await;

    let id = correlator.send("Tell me something").await.unwrap();
    settle(&mut correlator).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let events = drain(&mut observer);
    assert_eq!(terminal_count(&events, id), 1);
    assert!(matches!(
        events.last(),
        Some(BusEvent::Terminal(t)) if t.reason == TerminalReason::Error
            && t.message.as_deref().is_some_and(|m| m.contains("timed out"))
    ));

    let record = &correlator.history()[0];
    assert_eq!(record.content, "The");
    assert!(matches!(&record.outcome, ExchangeOutcome::Errored(m) if m.contains("timed out")));
    assert!(store.is_empty());
}

#[tokio::test]
async fn reasoning_toggle_reaches_daemon_settings() {
    let mut h = harness(Duration::from_millis(5));
    let mut correlator = correlator(&h.service).await;

    correlator.set_reasoning_enabled(true).await.unwrap();
    assert!(h.service.settings.snapshot().reasoning_enabled);
    correlator.set_reasoning_enabled(false).await.unwrap();
    assert!(!h.service.settings.snapshot().reasoning_enabled);

    let events = drain(&mut h.observer);
    assert_eq!(
        events,
        vec![
            BusEvent::ReasoningChanged { enabled: true },
            BusEvent::ReasoningChanged { enabled: false },
        ]
    );
}

#[tokio::test]
async fn stop_without_generation_is_acknowledged_silently() {
    let mut h = harness(Duration::from_millis(5));
    let bus = LocalBus::new(h.service.clone());

    assert!(bus.stop_generation().await.unwrap());
    assert!(bus.stop_generation().await.unwrap());
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(drain(&mut h.observer).is_empty());
}

#[tokio::test]
async fn stop_twice_yields_one_cancelled_terminal() {
    let mut h = harness(Duration::from_millis(20));
    let mut correlator = correlator(&h.service).await;

    let id = correlator.send("Count to 10").await.unwrap();
    while correlator.buffer().map_or(true, str::is_empty) {
        assert!(correlator.poll_once().await);
    }
    correlator.stop().await.unwrap();
    correlator.stop().await.unwrap();
    settle(&mut correlator).await;
    tokio::time::sleep(Duration::from_millis(60)).await;

    let events = drain(&mut h.observer);
    assert_eq!(terminal_count(&events, id), 1);
    assert_eq!(correlator.history()[0].outcome, ExchangeOutcome::Cancelled);
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn reasoning_region_only_when_reasoning_arrives() {
    let h = harness(Duration::from_millis(5));
    let mut correlator = correlator(&h.service).await;

    correlator.send("Think first").await.unwrap();
    settle(&mut correlator).await;

    let presenter = correlator.presenter();
    assert_eq!(presenter.reasoning_regions, 1);
    let record = &presenter.finished[0];
    assert_eq!(record.reasoning.as_deref(), Some("Hmm."));
    assert_eq!(record.content, "Done.");
    assert!(record.reasoning_duration.is_some());
}

#[tokio::test]
async fn http_bus_streams_backend_output() {
    let mut backend = mockito::Server::new_async().await;
    let body = [
        r#"{"choices":[{"delta":{"content":"Hello"}}]}"#,
        r#"{"choices":[{"delta":{"content":", world"}}]}"#,
        "[DONE]",
    ]
    .iter()
    .map(|payload| format!("data: {}\n\n", payload))
    .collect::<String>();
    backend
        .mock("POST", "/v1/chat/completions")
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(body)
        .create_async()
        .await;

    let config = Config {
        inference_url: backend.url(),
        ..test_config()
    };
    let store = InMemoryConversationStore::new();
    let transport = HttpTransport::from_config(&config).unwrap();
    let service = Arc::new(AssistantService::new(config, Arc::new(transport), Arc::new(store.clone())));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(AppState::new(service.clone()));
    let shutdown = service.shutdown_token();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .unwrap();
    });

    let client = Arc::new(HttpBusClient::new(format!("http://{}", addr)).unwrap());
    let mut correlator = Correlator::connect(client, Recording::default(), Duration::from_millis(50))
        .await
        .unwrap();

    correlator.send("Say hello").await.unwrap();
    settle(&mut correlator).await;

    assert_eq!(correlator.history()[0].content, "Hello, world");
    assert_eq!(correlator.history()[0].outcome, ExchangeOutcome::Completed);
    assert_eq!(store.all()[0].answer_text, "Hello, world");

    service.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn shutdown_delivers_cancelled_terminal_to_remote_consumers() {
    let h = harness(Duration::from_millis(50));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(AppState::new(h.service.clone()));
    let shutdown = h.service.shutdown_token();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .unwrap();
    });

    let client = Arc::new(HttpBusClient::new(format!("http://{}", addr)).unwrap());
    let mut correlator = Correlator::connect(client, Recording::default(), Duration::from_millis(50))
        .await
        .unwrap();

    let id = correlator.send("Count to 10").await.unwrap();
    while correlator.buffer().map_or(true, str::is_empty) {
        assert!(correlator.poll_once().await);
    }

    let service = h.service.clone();
    tokio::spawn(async move { service.shutdown(Duration::from_secs(2)).await });
    settle(&mut correlator).await;

    let record = &correlator.history()[0];
    assert_eq!(record.generation_id, id);
    assert_eq!(record.outcome, ExchangeOutcome::Cancelled);

    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server did not stop")
        .unwrap();
}
