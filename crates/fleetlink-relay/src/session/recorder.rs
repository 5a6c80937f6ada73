//! Gzip recorder for session frames.
//!
//! One writer task per recorded session, fed encoded frames through a
//! bounded channel. Frames are compressed into independent gzip
//! members and flushed to the store once the compressed output reaches
//! the configured chunk size; the decoder side reads the concatenated
//! members back as one stream.

use std::io::Write;

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::store::RelayStore;

/// Sender half of a session recorder.
#[derive(Clone)]
pub struct Recorder {
    tx: mpsc::Sender<Bytes>,
}

/// Error returned when a frame cannot be queued for recording.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("Recorder queue overflow")]
    Overflow,

    #[error("Recorder stopped")]
    Stopped,
}

impl Recorder {
    pub(crate) fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx }
    }

    /// Queue an encoded frame. The queue is bounded; a full queue is
    /// an overflow and fails the session rather than blocking the
    /// relay path.
    pub fn record(&self, frame: Bytes) -> Result<(), RecordError> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RecordError::Overflow,
            mpsc::error::TrySendError::Closed(_) => RecordError::Stopped,
        })
    }
}

/// Spawn the writer task for one session. The task drains the queue,
/// compresses, and appends chunks to the store; it flushes the final
/// partial chunk when every [`Recorder`] clone is dropped.
pub fn spawn(
    store: RelayStore,
    tenant_id: String,
    session_id: String,
    chunk_bytes: usize,
    queue_frames: usize,
) -> (Recorder, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Bytes>(queue_frames);

    let task = tokio::spawn(async move {
        let mut chunker = GzChunker::new(chunk_bytes);

        while let Some(frame) = rx.recv().await {
            let member = match chunker.write(&frame) {
                Ok(m) => m,
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Recorder compression failed");
                    return;
                }
            };
            if let Some(member) = member {
                if let Err(e) = store
                    .insert_session_recording(&tenant_id, &session_id, &member)
                    .await
                {
                    warn!(session_id = %session_id, error = %e, "Recorder store append failed");
                    return;
                }
            }
        }

        // Channel closed: flush whatever is buffered.
        match chunker.finish() {
            Ok(Some(member)) => {
                if let Err(e) = store
                    .insert_session_recording(&tenant_id, &session_id, &member)
                    .await
                {
                    warn!(session_id = %session_id, error = %e, "Recorder final flush failed");
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Recorder final compression failed");
            }
        }
        debug!(session_id = %session_id, "Recorder finished");
    });

    (Recorder::new(tx), task)
}

/// Accumulates plaintext into gzip members of a bounded compressed
/// size.
struct GzChunker {
    encoder: GzEncoder<Vec<u8>>,
    plain_bytes: usize,
    chunk_bytes: usize,
}

impl GzChunker {
    fn new(chunk_bytes: usize) -> Self {
        Self {
            encoder: GzEncoder::new(Vec::new(), Compression::default()),
            plain_bytes: 0,
            chunk_bytes,
        }
    }

    /// Append plaintext; returns a completed gzip member once the
    /// compressed output reaches the chunk target.
    fn write(&mut self, data: &[u8]) -> std::io::Result<Option<Vec<u8>>> {
        self.encoder.write_all(data)?;
        self.encoder.flush()?;
        self.plain_bytes += data.len();

        if self.encoder.get_ref().len() >= self.chunk_bytes {
            let done = std::mem::replace(
                &mut self.encoder,
                GzEncoder::new(Vec::new(), Compression::default()),
            );
            self.plain_bytes = 0;
            return done.finish().map(Some);
        }
        Ok(None)
    }

    /// Close the current member, if it holds any data.
    fn finish(self) -> std::io::Result<Option<Vec<u8>>> {
        if self.plain_bytes == 0 {
            return Ok(None);
        }
        self.encoder.finish().map(Some)
    }
}
