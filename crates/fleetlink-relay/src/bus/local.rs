//! In-process message bus.
//!
//! Fan-out over bounded per-subscriber queues; a full queue drops the
//! payload for that subscriber (at-most-once delivery). Presence is a
//! TTL-bounded key/value map. Used by single-instance deployments and
//! tests; the subjects and semantics match what a broker-backed bus
//! provides across a fleet.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{subjects, BusError, MessageBus, PresenceHandle, Subscription};

const DEFAULT_QUEUE_CAPACITY: usize = 128;

struct SubscriberSlot {
    id: u64,
    tx: mpsc::Sender<Bytes>,
}

struct PresenceEntry {
    instance_id: String,
    expires_at: Instant,
}

#[derive(Clone)]
pub struct LocalBus {
    subscribers: Arc<Mutex<HashMap<String, Vec<SubscriberSlot>>>>,
    presence: Arc<Mutex<HashMap<String, PresenceEntry>>>,
    next_id: Arc<AtomicU64>,
    queue_capacity: usize,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Bus with a custom per-subscriber queue capacity.
    pub fn with_capacity(queue_capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            presence: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
            queue_capacity,
        }
    }

    fn remove_subscriber(subscribers: &Mutex<HashMap<String, Vec<SubscriberSlot>>>, subject: &str, id: u64) {
        let mut map = subscribers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(slots) = map.get_mut(subject) {
            slots.retain(|s| s.id != id);
            if slots.is_empty() {
                map.remove(subject);
            }
        }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError> {
        let mut map = self
            .subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let Some(slots) = map.get_mut(subject) else {
            // Nobody listening; fire-and-forget semantics.
            return Ok(());
        };

        slots.retain(|slot| match slot.tx.try_send(payload.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(subject = %subject, "Subscriber queue full, dropping payload");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        if slots.is_empty() {
            map.remove(subject);
        }

        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_capacity);

        self.subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entry(subject.to_string())
            .or_default()
            .push(SubscriberSlot { id, tx });

        debug!(subject = %subject, id, "Subscribed");

        let subscribers = Arc::clone(&self.subscribers);
        let subject_owned = subject.to_string();
        Ok(Subscription::new(
            subject.to_string(),
            rx,
            Box::new(move || Self::remove_subscriber(&subscribers, &subject_owned, id)),
        ))
    }

    async fn presence_register(
        &self,
        tenant_id: &str,
        device_id: &str,
        instance_id: &str,
        ttl: Duration,
    ) -> Result<Box<dyn PresenceHandle>, BusError> {
        let key = subjects::presence(tenant_id, device_id);
        let now = Instant::now();

        {
            let mut map = self
                .presence
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);

            if let Some(entry) = map.get(&key) {
                if entry.expires_at > now && entry.instance_id != instance_id {
                    return Err(BusError::PresenceConflict(entry.instance_id.clone()));
                }
            }

            map.insert(
                key.clone(),
                PresenceEntry {
                    instance_id: instance_id.to_string(),
                    expires_at: now + ttl,
                },
            );
        }

        debug!(key = %key, instance_id = %instance_id, "Presence registered");

        Ok(Box::new(LocalPresenceHandle {
            presence: Arc::clone(&self.presence),
            key,
            instance_id: instance_id.to_string(),
            ttl,
        }))
    }

    async fn presence_lookup(
        &self,
        tenant_id: &str,
        device_id: &str,
    ) -> Result<Option<String>, BusError> {
        let key = subjects::presence(tenant_id, device_id);
        let mut map = self
            .presence
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        match map.get(&key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                Ok(Some(entry.instance_id.clone()))
            }
            Some(_) => {
                // Expired claim; reap it on the way out.
                map.remove(&key);
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

struct LocalPresenceHandle {
    presence: Arc<Mutex<HashMap<String, PresenceEntry>>>,
    key: String,
    instance_id: String,
    ttl: Duration,
}

impl std::fmt::Debug for LocalPresenceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalPresenceHandle")
            .field("key", &self.key)
            .field("instance_id", &self.instance_id)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl PresenceHandle for LocalPresenceHandle {
    async fn refresh(&self) -> Result<(), BusError> {
        let mut map = self
            .presence
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        match map.get_mut(&self.key) {
            Some(entry) if entry.instance_id == self.instance_id => {
                entry.expires_at = Instant::now() + self.ttl;
                Ok(())
            }
            Some(entry) => Err(BusError::PresenceConflict(entry.instance_id.clone())),
            None => {
                // Claim expired and was reaped; re-establish it.
                map.insert(
                    self.key.clone(),
                    PresenceEntry {
                        instance_id: self.instance_id.clone(),
                        expires_at: Instant::now() + self.ttl,
                    },
                );
                Ok(())
            }
        }
    }

    async fn release(&self) {
        let mut map = self
            .presence
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if let Some(entry) = map.get(&self.key) {
            if entry.instance_id == self.instance_id {
                map.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_delivers_in_order() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("session.s1").await.unwrap();

        for i in 0u8..5 {
            bus.publish("session.s1", Bytes::from(vec![i])).await.unwrap();
        }

        for i in 0u8..5 {
            assert_eq!(sub.recv().await.unwrap(), Bytes::from(vec![i]));
        }
    }

    #[tokio::test]
    async fn fan_out_to_multiple_subscribers() {
        let bus = LocalBus::new();
        let mut a = bus.subscribe("device.t.d").await.unwrap();
        let mut b = bus.subscribe("device.t.d").await.unwrap();

        bus.publish("device.t.d", Bytes::from_static(b"x")).await.unwrap();

        assert_eq!(a.recv().await.unwrap(), Bytes::from_static(b"x"));
        assert_eq!(b.recv().await.unwrap(), Bytes::from_static(b"x"));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let bus = LocalBus::new();
        bus.publish("session.nobody", Bytes::from_static(b"x"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn dropped_subscription_unsubscribes() {
        let bus = LocalBus::new();
        let sub = bus.subscribe("session.s1").await.unwrap();
        sub.unsubscribe();

        bus.publish("session.s1", Bytes::from_static(b"x")).await.unwrap();
        assert!(bus.subscribers.lock().unwrap().get("session.s1").is_none());
    }

    #[tokio::test]
    async fn full_queue_drops_payload() {
        let bus = LocalBus::with_capacity(1);
        let mut sub = bus.subscribe("session.s1").await.unwrap();

        bus.publish("session.s1", Bytes::from_static(b"first")).await.unwrap();
        bus.publish("session.s1", Bytes::from_static(b"dropped")).await.unwrap();
        bus.publish("session.s1", Bytes::from_static(b"dropped")).await.unwrap();

        assert_eq!(sub.recv().await.unwrap(), Bytes::from_static(b"first"));

        // Queue drained; the next publish goes through again.
        bus.publish("session.s1", Bytes::from_static(b"second")).await.unwrap();
        assert_eq!(sub.recv().await.unwrap(), Bytes::from_static(b"second"));
    }

    #[tokio::test]
    async fn presence_register_and_lookup() {
        let bus = LocalBus::new();
        let _handle = bus
            .presence_register("t1", "d1", "instance-1", Duration::from_secs(60))
            .await
            .unwrap();

        let owner = bus.presence_lookup("t1", "d1").await.unwrap();
        assert_eq!(owner.as_deref(), Some("instance-1"));

        assert!(bus.presence_lookup("t1", "d2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn presence_conflict_rejected() {
        let bus = LocalBus::new();
        let _handle = bus
            .presence_register("t1", "d1", "instance-1", Duration::from_secs(60))
            .await
            .unwrap();

        let err = bus
            .presence_register("t1", "d1", "instance-2", Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::PresenceConflict(owner) if owner == "instance-1"));
    }

    #[tokio::test]
    async fn presence_reregister_by_same_instance_is_ok() {
        let bus = LocalBus::new();
        let _a = bus
            .presence_register("t1", "d1", "instance-1", Duration::from_secs(60))
            .await
            .unwrap();
        let _b = bus
            .presence_register("t1", "d1", "instance-1", Duration::from_secs(60))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn presence_expires_without_refresh() {
        let bus = LocalBus::new();
        let handle = bus
            .presence_register("t1", "d1", "instance-1", Duration::from_millis(20))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(bus.presence_lookup("t1", "d1").await.unwrap().is_none());

        // A refresh re-establishes the claim.
        handle.refresh().await.unwrap();
        assert_eq!(
            bus.presence_lookup("t1", "d1").await.unwrap().as_deref(),
            Some("instance-1")
        );
    }

    #[tokio::test]
    async fn presence_release_removes_claim() {
        let bus = LocalBus::new();
        let handle = bus
            .presence_register("t1", "d1", "instance-1", Duration::from_secs(60))
            .await
            .unwrap();

        handle.release().await;
        assert!(bus.presence_lookup("t1", "d1").await.unwrap().is_none());
    }
}
