//! Message bus abstraction for inter-instance frame routing.
//!
//! A thin subject-based pub/sub contract plus an ephemeral presence
//! registry. [`LocalBus`] is the in-process implementation; a
//! broker-backed implementation of the same trait is the
//! cross-instance deployment path. Delivery is at-most-once,
//! ordered per subject per subscriber.

mod local;
pub mod subjects;

pub use local::LocalBus;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Presence held by instance {0}")]
    PresenceConflict(String),
}

/// Subject-based pub/sub transport between service instances.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Fire-and-forget publish; only transport errors surface.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError>;

    /// Subscribe to a subject. The subscription is canceled by
    /// dropping the returned handle.
    async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError>;

    /// Claim ownership of a device link with an expiring record. The
    /// claim must be refreshed within `ttl` or it is auto-removed.
    /// Fails when a live claim by a different instance exists.
    async fn presence_register(
        &self,
        tenant_id: &str,
        device_id: &str,
        instance_id: &str,
        ttl: Duration,
    ) -> Result<Box<dyn PresenceHandle>, BusError>;

    /// Cross-instance routing hint: the instance currently owning the
    /// device link, if any.
    async fn presence_lookup(
        &self,
        tenant_id: &str,
        device_id: &str,
    ) -> Result<Option<String>, BusError>;
}

pub type SharedBus = Arc<dyn MessageBus>;

/// An expiring presence claim held by the owning endpoint.
#[async_trait]
pub trait PresenceHandle: Send + Sync + std::fmt::Debug {
    /// Extend the claim by its TTL.
    async fn refresh(&self) -> Result<(), BusError>;

    /// Drop the claim immediately.
    async fn release(&self);
}

/// Channel-backed delivery handle for one subject subscription.
///
/// Dropping the subscription unsubscribes.
pub struct Subscription {
    subject: String,
    rx: mpsc::Receiver<Bytes>,
    _guard: UnsubscribeGuard,
}

impl Subscription {
    pub(crate) fn new(
        subject: String,
        rx: mpsc::Receiver<Bytes>,
        on_drop: Box<dyn FnOnce() + Send + Sync>,
    ) -> Self {
        Self {
            subject,
            rx,
            _guard: UnsubscribeGuard {
                on_drop: Some(on_drop),
            },
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Next payload on this subject, or `None` once unsubscribed and
    /// drained.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Explicit cancel; equivalent to dropping the handle.
    pub fn unsubscribe(self) {}
}

struct UnsubscribeGuard {
    on_drop: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Drop for UnsubscribeGuard {
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f();
        }
    }
}
