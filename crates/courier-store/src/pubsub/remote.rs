//! Redis `PUBLISH` / `SUBSCRIBE` / `PSUBSCRIBE` transport.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use tracing::{debug, warn};

use super::{PubSubTransport, RawMessage};
use crate::backend::{Namespace, RedisBackend};
use crate::error::StoreResult;

/// Channels are global in Redis; commands go through the users database.
const PUBSUB_NAMESPACE: Namespace = Namespace::Users;

#[derive(Clone)]
pub struct RedisTransport {
    backend: RedisBackend,
}

impl RedisTransport {
    #[must_use]
    pub fn new(backend: RedisBackend) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl PubSubTransport for RedisTransport {
    async fn publish(&self, channel: &str, payload: String) -> StoreResult<usize> {
        let mut conn = self.backend.connection(PUBSUB_NAMESPACE).await?;
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(usize::try_from(receivers).unwrap_or(0))
    }

    async fn subscribe(
        &self,
        channels: Vec<String>,
        patterns: Vec<String>,
    ) -> StoreResult<BoxStream<'static, RawMessage>> {
        let mut pubsub = self
            .backend
            .client(PUBSUB_NAMESPACE)?
            .get_async_pubsub()
            .await?;
        for channel in &channels {
            pubsub.subscribe(channel).await?;
        }
        for pattern in &patterns {
            pubsub.psubscribe(pattern).await?;
        }
        debug!(?channels, ?patterns, "redis subscription opened");

        Ok(pubsub
            .into_on_message()
            .filter_map(|msg| async move {
                let channel = msg.get_channel_name().to_owned();
                match msg.get_payload::<String>() {
                    Ok(payload) => Some(RawMessage { channel, payload }),
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "unreadable pubsub payload");
                        None
                    }
                }
            })
            .boxed())
    }
}
