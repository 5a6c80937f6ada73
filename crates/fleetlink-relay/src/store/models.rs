//! Data models for the Fleetlink relay storage.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Connection status of a device as last observed by the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum DeviceStatus {
    Unknown,
    Connected,
    Disconnected,
}

impl DeviceStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    pub device_id: String,
    pub status: DeviceStatus,
    pub created_ts: i64,
    pub updated_ts: i64,
}

/// A live end-to-end bridge between one management client and one
/// device. The id doubles as the pub/sub topic suffix for
/// session-scoped traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub device_id: String,
    pub tenant_id: String,
    pub start_ts: i64,
}

impl Session {
    /// Validate the fields required before persistence. Returns the
    /// offending field description on rejection.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("id: cannot be blank".to_string());
        }
        if self.user_id.is_empty() {
            return Err("user_id: cannot be blank".to_string());
        }
        if self.device_id.is_empty() {
            return Err("device_id: cannot be blank".to_string());
        }
        if self.start_ts <= 0 {
            return Err("start_ts: cannot be blank".to_string());
        }
        Ok(())
    }
}

/// Metadata of a stored session recording. The id is assigned when
/// the first chunk is appended and stays stable across appends; the
/// compressed payload itself is streamed separately through a
/// [`RecordingSink`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Recording {
    pub id: String,
    pub session_id: String,
    pub created_ts: i64,
    pub expire_ts: i64,
}

/// Minimal sink capability for streaming recording bytes: accepts
/// ordered chunks and reports bytes written.
#[async_trait]
pub trait RecordingSink: Send {
    async fn write_chunk(&mut self, chunk: &[u8]) -> std::io::Result<usize>;
}

#[async_trait]
impl RecordingSink for Vec<u8> {
    async fn write_chunk(&mut self, chunk: &[u8]) -> std::io::Result<usize> {
        self.extend_from_slice(chunk);
        Ok(chunk.len())
    }
}

/// Channel-backed sink, used by playback and tests.
pub struct ChannelSink(pub mpsc::Sender<Vec<u8>>);

#[async_trait]
impl RecordingSink for ChannelSink {
    async fn write_chunk(&mut self, chunk: &[u8]) -> std::io::Result<usize> {
        self.0
            .send(chunk.to_vec())
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "sink closed"))?;
        Ok(chunk.len())
    }
}
