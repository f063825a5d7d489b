//! Publish/subscribe bus abstraction.
//!
//! The bus carries raw envelope bytes between relay processes. Every
//! subscriber of a topic receives every payload published to it, like a
//! fanout exchange. Broker-backed implementations live outside this crate;
//! [`LocalBus`] is the in-process implementation.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::stream::{self, BoxStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Default per-topic buffer of the in-process bus.
pub const DEFAULT_BUS_CAPACITY: usize = 4096;

/// A stream of payloads delivered by a bus subscription.
///
/// The stream ending means the subscription was lost.
pub type BusSubscription = BoxStream<'static, Bytes>;

/// Bus errors.
#[derive(Debug, Error)]
pub enum BusError {
    /// The bus rejected a publish.
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// A publish did not complete in time.
    #[error("Publish timed out after {0:?}")]
    PublishTimeout(Duration),

    /// The bus cannot be reached.
    #[error("Bus unavailable: {0}")]
    Unavailable(String),

    /// The bridge already holds this process's subscription.
    #[error("Bus subscription already started")]
    AlreadyStarted,
}

/// An external publish/subscribe transport.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish a payload to every subscriber of `topic`.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BusError>;

    /// Subscribe to `topic`.
    async fn subscribe(&self, topic: &str) -> Result<BusSubscription, BusError>;

    /// Get the bus name (e.g., "local").
    fn name(&self) -> &'static str;
}

/// In-process bus backed by one broadcast channel per topic.
pub struct LocalBus {
    topics: DashMap<String, broadcast::Sender<Bytes>>,
    capacity: usize,
    available: AtomicBool,
}

impl LocalBus {
    /// Create a new bus with default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    /// Create a new bus with a specific per-topic capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
            available: AtomicBool::new(true),
        }
    }

    /// Mark the bus reachable or unreachable.
    ///
    /// Going unavailable ends every live subscription.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if !available {
            self.topics.clear();
            debug!("Local bus marked unavailable");
        }
    }

    /// Check if the bus is reachable.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Get the number of live subscriptions to a topic.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for LocalBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BusError> {
        if !self.is_available() {
            return Err(BusError::Unavailable("local bus is down".to_string()));
        }

        // No subscribers means nobody is bound to the exchange; the payload is discarded.
        if let Some(sender) = self.topics.get(topic) {
            let _ = sender.send(payload);
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<BusSubscription, BusError> {
        if !self.is_available() {
            return Err(BusError::Unavailable("local bus is down".to_string()));
        }

        let receiver = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        let topic = topic.to_string();
        let subscription = stream::unfold(receiver, move |mut receiver| {
            let topic = topic.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(payload) => return Some((payload, receiver)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(topic = %topic, skipped, "Bus subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(Box::pin(subscription))
    }

    fn name(&self) -> &'static str {
        "local"
    }
}
