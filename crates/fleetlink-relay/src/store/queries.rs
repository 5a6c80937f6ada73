//! Database queries for the Fleetlink relay store.

use std::io::Read;

use flate2::read::MultiGzDecoder;
use tracing::debug;
use uuid::Uuid;

use super::db::{RelayStore, StoreError};
use super::models::{Device, DeviceStatus, Recording, RecordingSink, Session};

/// Chunk size used when streaming a decompressed recording into a sink.
const RECORDING_READ_BUFFER_SIZE: usize = 4096;

impl RelayStore {
    // =========================================================================
    // Device queries
    // =========================================================================

    /// Ensure the tenant's namespace is usable. Idempotent; the schema
    /// and indexes are maintained by embedded migrations, so this only
    /// resolves and logs the namespace.
    pub async fn provision_tenant(&self, tenant_id: &str) -> Result<(), StoreError> {
        let dbname = self.namespace(tenant_id);
        debug!(tenant_id = %tenant_id, dbname = %dbname, "Tenant provisioned");
        Ok(())
    }

    /// Create a device record with status `unknown`. Idempotent: an
    /// existing row is left untouched.
    pub async fn provision_device(
        &self,
        tenant_id: &str,
        device_id: &str,
    ) -> Result<(), StoreError> {
        let now = self.now_ms();

        sqlx::query(
            "INSERT INTO devices (dbname, device_id, status, created_ts, updated_ts) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT (dbname, device_id) DO NOTHING",
        )
        .bind(self.namespace(tenant_id))
        .bind(device_id)
        .bind(DeviceStatus::Unknown)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Get a device record. A missing device is `Ok(None)`.
    pub async fn get_device(
        &self,
        tenant_id: &str,
        device_id: &str,
    ) -> Result<Option<Device>, StoreError> {
        let device = sqlx::query_as::<_, Device>(
            "SELECT device_id, status, created_ts, updated_ts FROM devices \
             WHERE dbname = ? AND device_id = ?",
        )
        .bind(self.namespace(tenant_id))
        .bind(device_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(device)
    }

    /// Upsert the connection status. Inserts set both timestamps;
    /// updates preserve `created_ts` and advance `updated_ts`.
    pub async fn upsert_device_status(
        &self,
        tenant_id: &str,
        device_id: &str,
        status: DeviceStatus,
    ) -> Result<(), StoreError> {
        let now = self.now_ms();

        sqlx::query(
            "INSERT INTO devices (dbname, device_id, status, created_ts, updated_ts) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT (dbname, device_id) DO UPDATE SET \
                 status = excluded.status, updated_ts = excluded.updated_ts",
        )
        .bind(self.namespace(tenant_id))
        .bind(device_id)
        .bind(status)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Remove a device record. Sessions referencing the device are
    /// left to drain through their own lifecycle.
    pub async fn delete_device(&self, tenant_id: &str, device_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM devices WHERE dbname = ? AND device_id = ?")
            .bind(self.namespace(tenant_id))
            .bind(device_id)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    // =========================================================================
    // Session queries
    // =========================================================================

    /// Persist a new session. Fails with `InvalidSession` when the
    /// record is incomplete and `Conflict` on a duplicate id.
    pub async fn allocate_session(&self, session: &Session) -> Result<(), StoreError> {
        session
            .validate()
            .map_err(StoreError::InvalidSession)?;

        sqlx::query(
            "INSERT INTO sessions (id, dbname, user_id, device_id, tenant_id, start_ts) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&session.id)
        .bind(self.namespace(&session.tenant_id))
        .bind(&session.user_id)
        .bind(&session.device_id)
        .bind(&session.tenant_id)
        .bind(session.start_ts)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Get a session by id.
    pub async fn get_session(&self, session_id: &str) -> Result<Session, StoreError> {
        sqlx::query_as::<_, Session>(
            "SELECT id, user_id, device_id, tenant_id, start_ts FROM sessions WHERE id = ?",
        )
        .bind(session_id)
        .fetch_optional(self.pool())
        .await?
        .ok_or(StoreError::SessionNotFound)
    }

    /// Delete a session, returning the removed record.
    pub async fn delete_session(&self, session_id: &str) -> Result<Session, StoreError> {
        sqlx::query_as::<_, Session>(
            "DELETE FROM sessions WHERE id = ? \
             RETURNING id, user_id, device_id, tenant_id, start_ts",
        )
        .bind(session_id)
        .fetch_optional(self.pool())
        .await?
        .ok_or(StoreError::SessionNotFound)
    }

    // =========================================================================
    // Recording queries
    // =========================================================================

    /// Append a compressed chunk to the session's recording, creating
    /// the row on first call. Appends preserve order. Rows past their
    /// expiry are purged on the way in.
    pub async fn insert_session_recording(
        &self,
        tenant_id: &str,
        session_id: &str,
        chunk: &[u8],
    ) -> Result<(), StoreError> {
        let now = self.now_ms();

        sqlx::query("DELETE FROM recordings WHERE expire_ts <= ?")
            .bind(now)
            .execute(self.pool())
            .await?;

        // The id, created_ts, and expire_ts take effect only on the
        // first chunk; the conflict path appends and keeps them.
        sqlx::query(
            "INSERT INTO recordings (id, dbname, session_id, recording, created_ts, expire_ts) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT (session_id) DO UPDATE SET \
                 recording = recordings.recording || excluded.recording",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(self.namespace(tenant_id))
        .bind(session_id)
        .bind(chunk)
        .bind(now)
        .bind(now + self.recording_expire_ms)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Get the metadata of a session's recording. Expired or absent
    /// recordings are `Ok(None)`.
    pub async fn get_session_recording_meta(
        &self,
        tenant_id: &str,
        session_id: &str,
    ) -> Result<Option<Recording>, StoreError> {
        let recording = sqlx::query_as::<_, Recording>(
            "SELECT id, session_id, created_ts, expire_ts FROM recordings \
             WHERE dbname = ? AND session_id = ? AND expire_ts > ?",
        )
        .bind(self.namespace(tenant_id))
        .bind(session_id)
        .bind(self.now_ms())
        .fetch_optional(self.pool())
        .await?;

        Ok(recording)
    }

    /// Stream the decompressed recording into `sink` in storage order.
    /// An expired or absent recording yields no data.
    pub async fn get_session_recording(
        &self,
        tenant_id: &str,
        session_id: &str,
        sink: &mut dyn RecordingSink,
    ) -> Result<(), StoreError> {
        let now = self.now_ms();

        let stored: Option<Vec<u8>> = sqlx::query_scalar(
            "SELECT recording FROM recordings \
             WHERE dbname = ? AND session_id = ? AND expire_ts > ?",
        )
        .bind(self.namespace(tenant_id))
        .bind(session_id)
        .bind(now)
        .fetch_optional(self.pool())
        .await?;

        let Some(stored) = stored else {
            return Ok(());
        };
        if stored.is_empty() {
            return Ok(());
        }

        let mut decoder = MultiGzDecoder::new(stored.as_slice());
        let mut buf = [0u8; RECORDING_READ_BUFFER_SIZE];
        loop {
            let n = decoder
                .read(&mut buf)
                .map_err(|e| StoreError::Io(e.to_string()))?;
            if n == 0 {
                break;
            }
            sink.write_chunk(&buf[..n])
                .await
                .map_err(|e| StoreError::Io(e.to_string()))?;
        }

        Ok(())
    }
}
