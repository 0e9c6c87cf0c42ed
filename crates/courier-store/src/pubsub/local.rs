//! In-process transport for deployments without Redis.
//!
//! Built on [`tokio::sync::broadcast`]: every subscription sees every
//! message and filters by its own channels and patterns. Messages are
//! wrapped in [`Arc`] so fan-out does not copy payloads.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{trace, warn};

use super::{PubSubTransport, RawMessage};
use crate::error::StoreResult;
use crate::pattern::GlobPattern;

/// Default number of undelivered messages a slow subscriber may fall behind.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Broadcast bus with Redis-style channel and pattern subscriptions.
///
/// Cheap to clone; clones share subscribers.
#[derive(Clone)]
pub struct LocalBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    sender: broadcast::Sender<Arc<RawMessage>>,
    filters: DashMap<u64, Arc<Filter>>,
    next_id: AtomicU64,
}

struct Filter {
    channels: HashSet<String>,
    patterns: Vec<GlobPattern>,
}

impl Filter {
    fn matches(&self, channel: &str) -> bool {
        self.channels.contains(channel) || self.patterns.iter().any(|p| p.matches(channel))
    }
}

/// Removes the filter when the subscription stream is dropped.
struct Registration {
    id: u64,
    bus: Weak<BusInner>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.filters.remove(&self.id);
            trace!(id = self.id, "local subscription dropped");
        }
    }
}

struct Subscription {
    rx: broadcast::Receiver<Arc<RawMessage>>,
    filter: Arc<Filter>,
    _registration: Registration,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl LocalBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(BusInner {
                sender,
                filters: DashMap::new(),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner.filters.len()
    }
}

#[async_trait]
impl PubSubTransport for LocalBus {
    async fn publish(&self, channel: &str, payload: String) -> StoreResult<usize> {
        let matching = self
            .inner
            .filters
            .iter()
            .filter(|entry| entry.value().matches(channel))
            .count();

        if matching > 0 {
            let message = Arc::new(RawMessage {
                channel: channel.to_owned(),
                payload,
            });
            // No receivers left between the count and the send is not an error.
            let _ = self.inner.sender.send(message);
        }
        trace!(channel, subscribers = matching, "local publish");
        Ok(matching)
    }

    async fn subscribe(
        &self,
        channels: Vec<String>,
        patterns: Vec<String>,
    ) -> StoreResult<BoxStream<'static, RawMessage>> {
        let patterns = patterns
            .iter()
            .map(|p| GlobPattern::new(p))
            .collect::<StoreResult<Vec<_>>>()?;
        let filter = Arc::new(Filter {
            channels: channels.into_iter().collect(),
            patterns,
        });

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let rx = self.inner.sender.subscribe();
        self.inner.filters.insert(id, filter.clone());

        let state = Subscription {
            rx,
            filter,
            _registration: Registration {
                id,
                bus: Arc::downgrade(&self.inner),
            },
        };

        Ok(futures::stream::unfold(state, |mut sub| async move {
            loop {
                match sub.rx.recv().await {
                    Ok(message) if sub.filter.matches(&message.channel) => {
                        let message = RawMessage::clone(&message);
                        return Some((message, sub));
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "local subscriber lagged, notifications dropped");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        })
        .boxed())
    }
}
