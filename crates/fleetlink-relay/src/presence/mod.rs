//! Device presence tracking.
//!
//! Wraps the message bus presence registry and the store's device
//! status into a single contract for the device endpoint: connecting
//! marks the device `connected` and claims the link for this
//! instance; a renewer task keeps the claim alive until the link
//! dies; disconnecting marks the device `disconnected` and drops the
//! claim immediately.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bus::{BusError, SharedBus};
use crate::store::{DeviceStatus, RelayStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    #[error("Device already connected to instance {0}")]
    DeviceAlreadyConnected(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Bus error: {0}")]
    Bus(String),
}

impl From<StoreError> for PresenceError {
    fn from(e: StoreError) -> Self {
        Self::Store(e.to_string())
    }
}

#[derive(Clone)]
pub struct PresenceTracker {
    store: RelayStore,
    bus: SharedBus,
    instance_id: String,
    heartbeat: Duration,
}

impl PresenceTracker {
    pub fn new(store: RelayStore, bus: SharedBus, instance_id: String, heartbeat: Duration) -> Self {
        Self {
            store,
            bus,
            instance_id,
            heartbeat,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Record a device link coming up: status `connected`, presence
    /// claim with TTL = 2 x heartbeat, renewer task refreshing every
    /// heartbeat until the link's shutdown fires.
    ///
    /// Fails with `DeviceAlreadyConnected` when another instance holds
    /// a live claim; the device status is left untouched in that case
    /// (the other link is the live one).
    pub async fn device_connected(
        &self,
        tenant_id: &str,
        device_id: &str,
    ) -> Result<PresenceSession, PresenceError> {
        self.store
            .upsert_device_status(tenant_id, device_id, DeviceStatus::Connected)
            .await?;

        let handle = match self
            .bus
            .presence_register(tenant_id, device_id, &self.instance_id, self.heartbeat * 2)
            .await
        {
            Ok(h) => h,
            Err(BusError::PresenceConflict(owner)) => {
                return Err(PresenceError::DeviceAlreadyConnected(owner));
            }
            Err(e) => return Err(PresenceError::Bus(e.to_string())),
        };

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let heartbeat = self.heartbeat;
        let tenant = tenant_id.to_string();
        let device = device_id.to_string();

        let renewer = tokio::spawn(async move {
            let mut timer = tokio::time::interval(heartbeat);
            timer.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if let Err(e) = handle.refresh().await {
                            warn!(
                                tenant_id = %tenant,
                                device_id = %device,
                                error = %e,
                                "Presence refresh failed, stopping renewer"
                            );
                            return;
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!(tenant_id = %tenant, device_id = %device, "Presence renewer shutting down");
                        handle.release().await;
                        return;
                    }
                }
            }
        });

        Ok(PresenceSession {
            store: self.store.clone(),
            tenant_id: tenant_id.to_string(),
            device_id: device_id.to_string(),
            shutdown_tx,
            renewer,
        })
    }

    /// Cross-instance routing hint: which instance owns the device
    /// link, if any.
    pub async fn lookup(
        &self,
        tenant_id: &str,
        device_id: &str,
    ) -> Result<Option<String>, PresenceError> {
        self.bus
            .presence_lookup(tenant_id, device_id)
            .await
            .map_err(|e| PresenceError::Bus(e.to_string()))
    }
}

/// Live presence claim for one device link. Closing it releases the
/// claim and records the device as disconnected.
pub struct PresenceSession {
    store: RelayStore,
    tenant_id: String,
    device_id: String,
    shutdown_tx: watch::Sender<bool>,
    renewer: JoinHandle<()>,
}

impl std::fmt::Debug for PresenceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceSession")
            .field("tenant_id", &self.tenant_id)
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

impl PresenceSession {
    /// Full disconnect cleanup: stop the renewer, drop the presence
    /// claim, mark the device `disconnected`.
    pub async fn close(self) {
        let Self {
            store,
            tenant_id,
            device_id,
            shutdown_tx,
            renewer,
        } = self;

        let _ = shutdown_tx.send(true);
        if let Err(e) = renewer.await {
            warn!(device_id = %device_id, error = %e, "Presence renewer join failed");
        }

        if let Err(e) = store
            .upsert_device_status(&tenant_id, &device_id, DeviceStatus::Disconnected)
            .await
        {
            warn!(
                tenant_id = %tenant_id,
                device_id = %device_id,
                error = %e,
                "Failed to record device disconnect"
            );
        }
    }
}
