use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;
use tracing::info;

use super::nats::NatsEventTransport;
use crate::domain::event::{Event, EventTransport};

/// Writes events to the tracing subscriber only.
#[derive(Clone, Debug, Default)]
pub struct LogEventTransport;

#[async_trait::async_trait]
impl EventTransport for LogEventTransport {
    async fn publish(&self, event: &Event) -> Result<()> {
        info!(kind = event.payload.kind(), id = %event.header.id, payload = ?event.payload, "event");
        Ok(())
    }
}

/// Keeps every published event in memory.
#[derive(Clone, Debug, Default)]
pub struct MemoryEventTransport {
    events: Arc<Mutex<Vec<Event>>>,
}

impl MemoryEventTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl EventTransport for MemoryEventTransport {
    async fn publish(&self, event: &Event) -> Result<()> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

/// Runtime choice of sink, picked at startup from configuration.
#[derive(Clone, Debug)]
pub enum AnyEventTransport {
    Nats(NatsEventTransport),
    Log(LogEventTransport),
}

#[async_trait::async_trait]
impl EventTransport for AnyEventTransport {
    async fn publish(&self, event: &Event) -> Result<()> {
        match self {
            AnyEventTransport::Nats(t) => t.publish(event).await,
            AnyEventTransport::Log(t) => t.publish(event).await,
        }
    }
}
