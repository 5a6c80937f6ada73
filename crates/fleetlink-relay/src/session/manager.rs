//! Session allocation, bridging, and termination.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use fleetlink_core::clock::SharedClock;
use fleetlink_core::config::RecordingConfig;
use fleetlink_proto::{
    self as proto, is_recordable, Frame, MSG_NEW_SESSION, MSG_PING, MSG_PONG, MSG_STOP_SESSION,
    PROTO_SHELL,
};

use super::recorder::{self, RecordError, Recorder};
use crate::bus::{subjects, SharedBus, Subscription};
use crate::presence::PresenceTracker;
use crate::store::{RelayStore, Session, StoreError};

/// Attempts at a fresh UUID when session allocation collides.
const ALLOCATE_RETRIES: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Device not connected")]
    DeviceNotConnected,

    #[error("Recorder queue overflow")]
    RecorderOverflow,

    #[error("Session not found")]
    NotFound,

    #[error("Store error: {0}")]
    Store(String),

    #[error("Bus error: {0}")]
    Bus(String),

    #[error("Frame error: {0}")]
    Proto(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::SessionNotFound => Self::NotFound,
            other => Self::Store(other.to_string()),
        }
    }
}

impl From<crate::bus::BusError> for SessionError {
    fn from(e: crate::bus::BusError) -> Self {
        Self::Bus(e.to_string())
    }
}

impl From<proto::ProtoError> for SessionError {
    fn from(e: proto::ProtoError) -> Self {
        Self::Proto(e.to_string())
    }
}

impl From<RecordError> for SessionError {
    fn from(e: RecordError) -> Self {
        match e {
            RecordError::Overflow => Self::RecorderOverflow,
            RecordError::Stopped => Self::Internal("recorder stopped".to_string()),
        }
    }
}

/// Whether a frame belongs in the session recording: recordable
/// protocols only, minus keepalives and the relay's own session
/// control frames.
fn should_record(frame: &Frame) -> bool {
    is_recordable(frame.proto)
        && frame.typ != MSG_PING
        && frame.typ != MSG_PONG
        && frame.typ != MSG_NEW_SESSION
        && frame.typ != MSG_STOP_SESSION
}

#[derive(Clone)]
pub struct SessionManager {
    store: RelayStore,
    bus: SharedBus,
    presence: PresenceTracker,
    clock: SharedClock,
    recording: RecordingConfig,
}

impl SessionManager {
    pub fn new(
        store: RelayStore,
        bus: SharedBus,
        presence: PresenceTracker,
        clock: SharedClock,
        recording: RecordingConfig,
    ) -> Self {
        Self {
            store,
            bus,
            presence,
            clock,
            recording,
        }
    }

    /// Open a session between `user_id` and a connected device.
    ///
    /// Verifies presence, allocates the session record (retrying the
    /// UUID on collision), subscribes to the session and device
    /// subjects, announces the session to the device, and wires the
    /// recorder when `recordable`.
    pub async fn open_session(
        &self,
        user_id: &str,
        tenant_id: &str,
        device_id: &str,
        recordable: bool,
    ) -> Result<SessionHandle, SessionError> {
        let owner = self
            .presence
            .lookup(tenant_id, device_id)
            .await
            .map_err(|e| SessionError::Bus(e.to_string()))?;
        if owner.is_none() {
            return Err(SessionError::DeviceNotConnected);
        }

        let mut session = None;
        for attempt in 0..ALLOCATE_RETRIES {
            let candidate = Session {
                id: Uuid::new_v4().to_string(),
                user_id: user_id.to_string(),
                device_id: device_id.to_string(),
                tenant_id: tenant_id.to_string(),
                start_ts: self.clock.now_ms(),
            };
            match self.store.allocate_session(&candidate).await {
                Ok(()) => {
                    session = Some(candidate);
                    break;
                }
                Err(StoreError::Conflict(_)) if attempt + 1 < ALLOCATE_RETRIES => {
                    debug!(attempt, "Session id collision, retrying with a fresh UUID");
                }
                Err(e) => return Err(e.into()),
            }
        }
        let session =
            session.ok_or_else(|| SessionError::Internal("session id space exhausted".into()))?;

        let device_subject = subjects::device(tenant_id, device_id);
        let session_sub = self.bus.subscribe(&subjects::session(&session.id)).await?;
        let device_sub = self.bus.subscribe(&device_subject).await?;

        let new_session = Frame::new(PROTO_SHELL, MSG_NEW_SESSION)
            .with_session(&session.id)
            .with_prop("user_id", user_id);
        self.bus
            .publish(&device_subject, proto::encode(&new_session)?.into())
            .await?;

        info!(
            session_id = %session.id,
            device_id = %device_id,
            user_id = %user_id,
            recordable,
            "Session opened"
        );

        let (overflow_tx, overflow_rx) = watch::channel(false);

        let (recorder, recorder_task, tap_task, held_overflow_tx, held_device_sub) = if recordable
        {
            let (recorder, recorder_task) = recorder::spawn(
                self.store.clone(),
                session.tenant_id.clone(),
                session.id.clone(),
                self.recording.chunk_bytes,
                self.recording.queue_frames,
            );
            let tap_task = spawn_device_tap(
                device_sub,
                session.id.clone(),
                recorder.clone(),
                overflow_tx,
            );
            (
                Some(recorder),
                Some(recorder_task),
                Some(tap_task),
                None,
                None,
            )
        } else {
            // No tap; keep the subscription and the overflow sender
            // alive for the session's lifetime.
            (None, None, None, Some(overflow_tx), Some(device_sub))
        };

        let receiver = SessionReceiver {
            session_sub,
            recorder: recorder.clone(),
        };

        Ok(SessionHandle {
            session,
            device_subject,
            bus: Arc::clone(&self.bus),
            store: self.store.clone(),
            receiver: Some(receiver),
            recorder_task,
            tap_task,
            overflow_rx,
            _overflow_tx: held_overflow_tx,
            _device_sub: held_device_sub,
        })
    }
}

/// Mirror device-bound recordable frames into the recorder.
///
/// The tap owns the device-subject subscription for the session's
/// lifetime; it signals `overflow` when the recorder queue fills so
/// the endpoint can fail the session.
fn spawn_device_tap(
    mut device_sub: Subscription,
    session_id: String,
    recorder: Recorder,
    overflow_tx: watch::Sender<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(payload) = device_sub.recv().await {
            let Ok(frame) = proto::decode(&payload) else {
                continue;
            };
            if frame.sid != session_id || !should_record(&frame) {
                continue;
            }
            match recorder.record(payload) {
                Ok(()) => {}
                Err(RecordError::Overflow) => {
                    warn!(session_id = %session_id, "Recorder overflow on device tap");
                    let _ = overflow_tx.send(true);
                    return;
                }
                Err(RecordError::Stopped) => return,
            }
        }
    })
}

/// Receiving half of a session bridge: device-side frames plus the
/// recorder mirror. Split from the handle so an endpoint can poll it
/// while forwarding through the handle in the same loop.
pub struct SessionReceiver {
    session_sub: Subscription,
    recorder: Option<Recorder>,
}

impl SessionReceiver {
    /// Receive the next device-side frame. Recordable frames are
    /// mirrored into the recorder; a full recorder queue surfaces as
    /// `RecorderOverflow` and the caller must drop the session.
    pub async fn recv(&mut self) -> Option<Result<Frame, SessionError>> {
        let payload = self.session_sub.recv().await?;
        let frame = match proto::decode(&payload) {
            Ok(f) => f,
            Err(e) => return Some(Err(e.into())),
        };

        if let Some(recorder) = &self.recorder {
            if should_record(&frame) {
                if let Err(e) = recorder.record(payload) {
                    return Some(Err(e.into()));
                }
            }
        }

        Some(Ok(frame))
    }
}

/// Bridging handles for one open session, owned by the management
/// endpoint for the session's lifetime.
pub struct SessionHandle {
    session: Session,
    device_subject: String,
    bus: SharedBus,
    store: RelayStore,
    receiver: Option<SessionReceiver>,
    recorder_task: Option<JoinHandle<()>>,
    tap_task: Option<JoinHandle<()>>,
    overflow_rx: watch::Receiver<bool>,
    _overflow_tx: Option<watch::Sender<bool>>,
    _device_sub: Option<Subscription>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn id(&self) -> &str {
        &self.session.id
    }

    /// Take the receiving half. Returns `None` once taken; the caller
    /// must drop it before `close` so the recorder can drain.
    pub fn take_receiver(&mut self) -> Option<SessionReceiver> {
        self.receiver.take()
    }

    /// Signal fired when the recorder queue overflows; the session
    /// must then be torn down.
    pub fn overflow_signal(&self) -> watch::Receiver<bool> {
        self.overflow_rx.clone()
    }

    /// Forward a management-side frame to the device.
    pub async fn forward_to_device(&self, frame: &Frame) -> Result<(), SessionError> {
        let bytes = proto::encode(frame)?;
        self.bus
            .publish(&self.device_subject, Bytes::from(bytes))
            .await?;
        Ok(())
    }

    /// Close the session: notify the device, stop the recorder and
    /// flush its tail, delete the session record. Idempotent — a
    /// session already deleted elsewhere still closes cleanly.
    pub async fn close(mut self, reason: &str) -> Result<Option<Session>, SessionError> {
        let stop = Frame::new(PROTO_SHELL, MSG_STOP_SESSION)
            .with_session(&self.session.id)
            .with_body(Bytes::copy_from_slice(reason.as_bytes()));
        if let Err(e) = self.forward_to_device(&stop).await {
            warn!(
                session_id = %self.session.id,
                error = %e,
                "Failed to notify device of session stop; proceeding with teardown"
            );
        }

        // Unsubscribe and stop the tap before flushing the recorder so
        // every sender is gone and the writer can drain.
        drop(self.receiver.take());
        if let Some(tap) = self.tap_task.take() {
            tap.abort();
            let _ = tap.await;
        }
        if let Some(task) = self.recorder_task.take() {
            let _ = task.await;
        }

        info!(session_id = %self.session.id, reason = %reason, "Session closed");

        match self.store.delete_session(&self.session.id).await {
            Ok(deleted) => Ok(Some(deleted)),
            Err(StoreError::SessionNotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
