//! In-process bus: the consumer and the daemon share one address space.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{AssistantBus, SignalStream};
use crate::generation::StartReply;
use crate::shared_state::AssistantService;

#[derive(Clone)]
pub struct LocalBus {
    service: Arc<AssistantService>,
}

impl LocalBus {
    pub fn new(service: Arc<AssistantService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl AssistantBus for LocalBus {
    async fn start_streaming(&self, text: &str) -> anyhow::Result<StartReply> {
        Ok(self.service.start_streaming(text))
    }

    async fn stop_generation(&self) -> anyhow::Result<bool> {
        self.service.manager.stop();
        Ok(true)
    }

    async fn clear_history(&self) -> anyhow::Result<()> {
        self.service.clear_history()
    }

    async fn set_reasoning_enabled(&self, enabled: bool) -> anyhow::Result<()> {
        self.service.set_reasoning_enabled(enabled);
        Ok(())
    }

    async fn subscribe(&self) -> anyhow::Result<SignalStream> {
        Ok(UnboundedReceiverStream::new(self.service.bus.subscribe()).boxed())
    }
}
