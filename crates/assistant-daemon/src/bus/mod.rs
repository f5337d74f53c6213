//! The session bus: ordered broadcast of [`BusEvent`]s plus the method
//! surface consumers call.
//!
//! Every subscriber owns an unbounded queue, so nothing is dropped for a slow
//! reader and each subscriber sees events in publication order.

pub mod http_client;
pub mod local;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::BoxStream;
use tokio::sync::mpsc;
use tracing::debug;

use crate::generation::{BusEvent, StartReply};

pub use http_client::HttpBusClient;
pub use local::LocalBus;

pub type SignalStream = BoxStream<'static, BusEvent>;

#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

#[derive(Default)]
struct BusInner {
    subscribers: DashMap<u64, mpsc::UnboundedSender<BusEvent>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<BusEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.insert(id, tx);
        debug!("Bus subscriber {} attached", id);
        rx
    }

    pub fn publish(&self, event: BusEvent) {
        let mut closed = Vec::new();
        for subscriber in self.inner.subscribers.iter() {
            if subscriber.value().send(event.clone()).is_err() {
                closed.push(*subscriber.key());
            }
        }
        for id in closed {
            self.inner.subscribers.remove(&id);
            debug!("Bus subscriber {} detached", id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }
}

/// Method surface of the assistant daemon.
#[async_trait]
pub trait AssistantBus: Send + Sync {
    /// Starts a generation and returns as soon as it has an id.
    async fn start_streaming(&self, text: &str) -> anyhow::Result<StartReply>;

    /// Requests cancellation of the active generation. Always acknowledged.
    async fn stop_generation(&self) -> anyhow::Result<bool>;

    async fn clear_history(&self) -> anyhow::Result<()>;

    /// Applies to generations started after the change.
    async fn set_reasoning_enabled(&self, enabled: bool) -> anyhow::Result<()>;

    async fn subscribe(&self) -> anyhow::Result<SignalStream>;
}
