//! Bridge between the local room registry and the bus.
//!
//! Each process holds exactly one bus subscription. Every payload it
//! delivers is decoded once and copied onto the outbound queue of each local
//! member of the target room. Publishing goes the other way: one bus call per
//! `message` envelope, shared topic for all rooms.

use crate::bus::{Bus, BusError, BusSubscription};
use crate::handle::DeliveryError;
use crate::metrics;
use crate::registry::RoomRegistry;
use bytes::Bytes;
use futures_util::StreamExt;
use roomcast_protocol::{codec, RoomId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Topic shared by every room.
    pub topic: String,
    /// Upper bound on a single publish attempt.
    pub publish_timeout: Duration,
    /// Extra attempts after a failed publish.
    pub publish_retries: u32,
    /// First delay before re-subscribing after the subscription is lost.
    pub reconnect_initial_backoff: Duration,
    /// Cap on the re-subscribe delay.
    pub reconnect_max_backoff: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            topic: "chat".to_string(),
            publish_timeout: Duration::from_secs(5),
            publish_retries: 1,
            reconnect_initial_backoff: Duration::from_millis(100),
            reconnect_max_backoff: Duration::from_secs(10),
        }
    }
}

/// Process-wide adapter between the registry and the bus.
pub struct BusBridge {
    bus: Arc<dyn Bus>,
    registry: Arc<RoomRegistry>,
    config: BridgeConfig,
    started: AtomicBool,
}

impl BusBridge {
    /// Create a new bridge.
    #[must_use]
    pub fn new(bus: Arc<dyn Bus>, registry: Arc<RoomRegistry>, config: BridgeConfig) -> Self {
        Self {
            bus,
            registry,
            config,
            started: AtomicBool::new(false),
        }
    }

    /// Subscribe to the bus and spawn the fan-out task.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::AlreadyStarted`] on a second call, or the bus
    /// error if the initial subscription fails. Later losses of the
    /// subscription are retried in the background.
    pub async fn start(self: Arc<Self>) -> Result<JoinHandle<()>, BusError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(BusError::AlreadyStarted);
        }

        let subscription = match self.bus.subscribe(&self.config.topic).await {
            Ok(subscription) => subscription,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        info!(
            bus = self.bus.name(),
            topic = %self.config.topic,
            "Subscribed to bus"
        );
        Ok(tokio::spawn(self.run(subscription)))
    }

    /// Publish a raw envelope to the bus on behalf of a room member.
    ///
    /// # Errors
    ///
    /// Returns the last error if every attempt failed or timed out.
    pub async fn publish(&self, room_id: RoomId, payload: Bytes) -> Result<(), BusError> {
        let start = Instant::now();
        let mut attempt = 0;

        loop {
            let result = tokio::time::timeout(
                self.config.publish_timeout,
                self.bus.publish(&self.config.topic, payload.clone()),
            )
            .await
            .unwrap_or(Err(BusError::PublishTimeout(self.config.publish_timeout)));

            match result {
                Ok(()) => {
                    metrics::record_publish_latency(start.elapsed().as_secs_f64());
                    metrics::record_message(payload.len(), "published");
                    trace!(room = room_id, bytes = payload.len(), "Published to bus");
                    return Ok(());
                }
                Err(e) if attempt < self.config.publish_retries => {
                    attempt += 1;
                    debug!(room = room_id, error = %e, attempt, "Retrying publish");
                }
                Err(e) => {
                    metrics::record_error("publish");
                    return Err(e);
                }
            }
        }
    }

    /// Deliver one bus payload to every local member of its room.
    ///
    /// Returns the number of members the payload was queued for.
    pub fn fan_out(&self, payload: Bytes) -> usize {
        let envelope = match codec::decode(&payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable bus payload");
                metrics::record_error("bus_decode");
                return 0;
            }
        };

        let mut delivered = 0;
        for member in self.registry.members_of(envelope.room_id) {
            match member.deliver(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(DeliveryError::QueueFull) => {
                    warn!(
                        room = envelope.room_id,
                        connection = %member.id(),
                        "Outbound queue full, dropping message"
                    );
                    metrics::record_dropped_delivery();
                }
                Err(DeliveryError::Closed) => {
                    trace!(connection = %member.id(), "Member closing, skipped");
                }
            }
        }

        trace!(room = envelope.room_id, recipients = delivered, "Fanned out");
        delivered
    }

    async fn run(self: Arc<Self>, mut subscription: BusSubscription) {
        loop {
            while let Some(payload) = subscription.next().await {
                self.fan_out(payload);
            }

            error!(topic = %self.config.topic, "Bus subscription lost");
            metrics::record_error("bus_subscription");
            subscription = self.resubscribe().await;
        }
    }

    async fn resubscribe(&self) -> BusSubscription {
        let mut backoff = self.config.reconnect_initial_backoff;

        loop {
            tokio::time::sleep(backoff).await;

            match self.bus.subscribe(&self.config.topic).await {
                Ok(subscription) => {
                    info!(topic = %self.config.topic, "Re-subscribed to bus");
                    return subscription;
                }
                Err(e) => {
                    warn!(error = %e, retry_in = ?backoff, "Bus re-subscribe failed");
                    backoff = (backoff * 2).min(self.config.reconnect_max_backoff);
                }
            }
        }
    }
}
