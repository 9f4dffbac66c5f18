use anyhow::{anyhow, Result};
use bytes::Bytes;
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::api::service::RpcRouter;
use crate::domain::event::{Event, EventTransport};

/// Publishes events as JSON on `{prefix}.events.{kind}`.
#[derive(Clone, Debug)]
pub struct NatsEventTransport {
    client: async_nats::Client,
    prefix: String,
}

impl NatsEventTransport {
    pub fn new(client: async_nats::Client, prefix: String) -> Self {
        Self { client, prefix }
    }
}

#[async_trait::async_trait]
impl EventTransport for NatsEventTransport {
    async fn publish(&self, event: &Event) -> Result<()> {
        let subject = format!("{}.events.{}", self.prefix, event.payload.kind());
        let payload = Bytes::from(serde_json::to_vec(event)?);

        self.client
            .publish(subject.clone(), payload)
            .await
            .map_err(|e| anyhow!("publish to {}: {}", subject, e))?;

        debug!(%subject, "published event");
        Ok(())
    }
}

/// Request/reply ingress. Requests arrive on `{prefix}.rpc.{method}` and are
/// shared across instances through a queue group.
#[derive(Clone, Debug)]
pub struct NatsRpc {
    client: async_nats::Client,
    prefix: String,
}

impl NatsRpc {
    pub fn new(client: async_nats::Client, prefix: String) -> Self {
        Self { client, prefix }
    }

    pub async fn listen<R: RpcRouter>(&self, router: R) -> Result<()> {
        let subject = format!("{}.rpc.*", self.prefix);
        let group = format!("{}-ingress", self.prefix);

        let mut requests = self
            .client
            .queue_subscribe(subject.clone(), group)
            .await
            .map_err(|e| anyhow!("subscribe to {}: {}", subject, e))?;

        info!(%subject, "listening for requests");

        while let Some(msg) = requests.next().await {
            let reply = match msg.reply.clone() {
                Some(reply) => reply,
                None => {
                    warn!(subject = %msg.subject, "request without reply subject");
                    continue;
                }
            };
            let method = msg.subject.rsplit('.').next().unwrap_or_default().to_string();

            let router = router.clone();
            let client = self.client.clone();
            tokio::spawn(async move {
                let body = router.route(&method, &msg.payload).await;
                if let Err(e) = client.publish(reply, Bytes::from(body)).await {
                    warn!(%method, error = %e, "failed to send reply");
                }
            });
        }

        Ok(())
    }
}
