//! Real-time notifications.
//!
//! Notifications are small JSON envelopes that signal "something changed
//! for this user"; the data itself lives in the caches. Channels follow
//! [`KeyFactory::channel`]:
//!
//! ```text
//! courier:notify:{tenant}:{user}:{event}
//! ```
//!
//! Publishing is fire-and-forget and reports how many subscribers were
//! listening at that moment, not whether they processed the message.
//! Subscriptions are streams of parsed [`Notification`]s; payloads that do
//! not parse are logged and skipped.

mod local;
mod remote;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::error::{StoreError, StoreResult};
use crate::keys::KeyFactory;

pub use local::LocalBus;
pub use remote::RedisTransport;

/// Envelope format version written by this crate.
pub const ENVELOPE_VERSION: &str = "1";

// ── events ───────────────────────────────────────────────────────────

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Message received from the user.
    IncomingMessage,
    /// Message sent through the API.
    OutgoingMessage,
    /// Message sent by the bot while handling a conversation.
    BotReply,
    /// Delivery or read receipt.
    StatusChange,
    Custom(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::IncomingMessage => "incoming_message",
            Self::OutgoingMessage => "outgoing_message",
            Self::BotReply => "bot_reply",
            Self::StatusChange => "status_change",
            Self::Custom(name) => name,
        }
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        match s {
            "incoming_message" => Self::IncomingMessage,
            "outgoing_message" => Self::OutgoingMessage,
            "bot_reply" => Self::BotReply,
            "status_change" => Self::StatusChange,
            other => Self::Custom(other.to_owned()),
        }
    }
}

impl FromStr for EventType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s))
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── envelope ─────────────────────────────────────────────────────────

/// A parsed notification.
///
/// Missing envelope fields take their defaults so older publishers stay
/// readable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Notification {
    pub event: String,
    pub tenant: String,
    pub user_id: String,
    pub platform: String,
    pub data: Value,
    pub timestamp: String,
    #[serde(rename = "v", alias = "version")]
    pub version: String,
    /// Channel the message arrived on. Not part of the envelope.
    #[serde(skip)]
    pub channel: String,
}

impl Default for Notification {
    fn default() -> Self {
        Self {
            event: "unknown".to_owned(),
            tenant: String::new(),
            user_id: String::new(),
            platform: crate::config::DEFAULT_PLATFORM.to_owned(),
            data: Value::Object(serde_json::Map::new()),
            timestamp: String::new(),
            version: ENVELOPE_VERSION.to_owned(),
            channel: String::new(),
        }
    }
}

impl Notification {
    /// Parse a raw message. `None` (logged) if the payload is not an envelope.
    pub fn parse(message: &RawMessage) -> Option<Self> {
        match serde_json::from_str::<Self>(&message.payload) {
            Ok(mut notification) => {
                notification.channel = message.channel.clone();
                Some(notification)
            }
            Err(e) => {
                warn!(channel = %message.channel, error = %e, "invalid notification payload");
                None
            }
        }
    }

    pub fn event_type(&self) -> EventType {
        EventType::from(self.event.as_str())
    }
}

/// A message as delivered by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub channel: String,
    pub payload: String,
}

// ── transport ────────────────────────────────────────────────────────

/// Moves payloads between publishers and subscribers.
#[async_trait]
pub trait PubSubTransport: Send + Sync {
    /// Returns the number of subscribers that received the message.
    async fn publish(&self, channel: &str, payload: String) -> StoreResult<usize>;

    /// Messages on any of `channels` (exact) or `patterns` (glob).
    async fn subscribe(
        &self,
        channels: Vec<String>,
        patterns: Vec<String>,
    ) -> StoreResult<BoxStream<'static, RawMessage>>;
}

// ── publisher ────────────────────────────────────────────────────────

/// Publishes notifications for one (tenant, user) pair.
#[derive(Clone)]
pub struct Publisher {
    transport: Arc<dyn PubSubTransport>,
    keys: KeyFactory,
    tenant: String,
    user_id: String,
    platform: String,
}

impl Publisher {
    /// Fails with [`StoreError::Config`] if either id is empty.
    pub fn new(
        transport: Arc<dyn PubSubTransport>,
        keys: KeyFactory,
        tenant: &str,
        user_id: &str,
        platform: &str,
    ) -> StoreResult<Self> {
        if tenant.trim().is_empty() || user_id.trim().is_empty() {
            return Err(StoreError::Config(
                "publisher needs a tenant and a user id".into(),
            ));
        }
        Ok(Self {
            transport,
            keys,
            tenant: tenant.to_owned(),
            user_id: user_id.to_owned(),
            platform: platform.to_owned(),
        })
    }

    pub fn channel(&self, event: &EventType) -> String {
        self.keys.channel(&self.tenant, &self.user_id, event.as_str())
    }

    fn envelope(&self, event: &EventType, data: Value) -> Notification {
        Notification {
            event: event.as_str().to_owned(),
            tenant: self.tenant.clone(),
            user_id: self.user_id.clone(),
            platform: self.platform.clone(),
            data,
            timestamp: Utc::now().to_rfc3339(),
            version: ENVELOPE_VERSION.to_owned(),
            channel: String::new(),
        }
    }

    /// Publish one notification. Returns the subscriber count, `0` on failure.
    pub async fn publish(&self, event: &EventType, data: Value) -> usize {
        let channel = self.channel(event);
        let payload = match serde_json::to_string(&self.envelope(event, data)) {
            Ok(payload) => payload,
            Err(e) => {
                error!(channel = %channel, error = %e, "failed to encode notification");
                return 0;
            }
        };

        match self.transport.publish(&channel, payload).await {
            Ok(subscribers) => {
                debug!(channel = %channel, subscribers, "notification published");
                subscribers
            }
            Err(e) => {
                error!(channel = %channel, error = %e, "failed to publish notification");
                0
            }
        }
    }

    /// Publish in order. Returns subscriber counts keyed by channel.
    pub async fn publish_batch(
        &self,
        notifications: impl IntoIterator<Item = (EventType, Value)>,
    ) -> BTreeMap<String, usize> {
        let mut results = BTreeMap::new();
        for (event, data) in notifications {
            let subscribers = self.publish(&event, data).await;
            results.insert(self.channel(&event), subscribers);
        }
        results
    }
}

// ── subscriber ───────────────────────────────────────────────────────

/// Stream of parsed notifications.
pub type NotificationStream = BoxStream<'static, Notification>;

#[derive(Clone)]
pub struct Subscriber {
    transport: Arc<dyn PubSubTransport>,
    keys: KeyFactory,
}

impl Subscriber {
    #[must_use]
    pub fn new(transport: Arc<dyn PubSubTransport>, keys: KeyFactory) -> Self {
        Self { transport, keys }
    }

    /// Subscribe to exact `channels` and glob `patterns`. At least one is
    /// required.
    pub async fn subscribe(
        &self,
        channels: &[String],
        patterns: &[String],
    ) -> StoreResult<NotificationStream> {
        if channels.is_empty() && patterns.is_empty() {
            return Err(StoreError::Config(
                "subscribe needs at least one channel or pattern".into(),
            ));
        }
        let raw = self
            .transport
            .subscribe(channels.to_vec(), patterns.to_vec())
            .await?;
        debug!(channels = channels.len(), patterns = patterns.len(), "subscribed");
        Ok(raw
            .filter_map(|message| async move { Notification::parse(&message) })
            .boxed())
    }

    /// Notifications for a tenant, optionally narrowed to one user and/or
    /// one event type. `None` listens to all of them.
    pub async fn subscribe_tenant(
        &self,
        tenant: &str,
        user_id: Option<&str>,
        event: Option<&EventType>,
    ) -> StoreResult<NotificationStream> {
        let pattern = self.keys.channel_pattern(
            tenant,
            user_id.unwrap_or(crate::keys::WILDCARD),
            event.map_or(crate::keys::WILDCARD, EventType::as_str),
        );
        self.subscribe(&[], &[pattern]).await
    }

    /// Wait for a single notification. `Ok(None)` on timeout.
    pub async fn listen_once(
        &self,
        channels: &[String],
        patterns: &[String],
        timeout: Duration,
    ) -> StoreResult<Option<Notification>> {
        let mut stream = self.subscribe(channels, patterns).await?;
        match tokio::time::timeout(timeout, stream.next()).await {
            Ok(notification) => Ok(notification),
            Err(_) => {
                debug!(timeout_ms = timeout.as_millis() as u64, "listen_once timed out");
                Ok(None)
            }
        }
    }
}

// ── buffering ────────────────────────────────────────────────────────

/// Collects notifications until a size or age limit is reached.
#[derive(Debug)]
pub struct NotificationBuffer {
    max_size: usize,
    max_wait: Duration,
    items: Vec<Notification>,
    first_added: Option<Instant>,
}

impl Default for NotificationBuffer {
    fn default() -> Self {
        Self::new(100, Duration::from_secs(5))
    }
}

impl NotificationBuffer {
    #[must_use]
    pub fn new(max_size: usize, max_wait: Duration) -> Self {
        Self {
            max_size: max_size.max(1),
            max_wait,
            items: Vec::new(),
            first_added: None,
        }
    }

    pub fn add(&mut self, notification: Notification) {
        if self.items.is_empty() {
            self.first_added = Some(Instant::now());
        }
        self.items.push(notification);
    }

    /// Full, or the oldest entry has waited `max_wait`.
    pub fn is_ready(&self) -> bool {
        if self.items.len() >= self.max_size {
            return true;
        }
        self.first_added
            .is_some_and(|first| first.elapsed() >= self.max_wait)
    }

    pub fn flush(&mut self) -> Vec<Notification> {
        self.first_added = None;
        std::mem::take(&mut self.items)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
