//! Storage mailbox used to hand a snapshot to the foreground.
//!
//! The snapshot is framed with a little-endian u16 length and moved in chunks
//! of at most [`MAX_VALUE_LEN`] bytes through [`MAILBOX_PAYLOAD_KEY`].
//! [`MAILBOX_LOCK_KEY`] is the handoff flag: the worker writes a chunk only
//! while the lock is absent and then sets it; the foreground reads the chunk
//! and clears the lock. Neither side ever waits on the other without a bound:
//! a writer whose chunk stays uncollected past the handshake timeout gives
//! up and empties the mailbox.

use alloc::vec::Vec;

use embassy_time::Duration;
use embedded_hal_async::delay::DelayNs;
use log::{debug, warn};

use super::snapshot::Snapshot;
use super::{MessageSink, WorkerMessage};
use crate::config::HandshakeConfig;
use crate::error::RecorderError;
use crate::storage::{MAILBOX_LOCK_KEY, MAILBOX_PAYLOAD_KEY, MAX_VALUE_LEN, Storage};

const LENGTH_PREFIX: usize = 2;

fn clear_mailbox<S: Storage>(storage: &mut S) -> Result<(), RecorderError> {
    storage.delete(MAILBOX_LOCK_KEY)?;
    storage.delete(MAILBOX_PAYLOAD_KEY)?;
    Ok(())
}

/// Worker side of the handshake
#[derive(Debug)]
pub struct SnapshotWriter {
    frame: Vec<u8>,
    offset: usize,
    /// Unix time of the last progress
    written_at: u32,
}

impl SnapshotWriter {
    /// Encode `snapshot` and reset the mailbox
    pub fn begin<S: Storage>(
        storage: &mut S,
        snapshot: &Snapshot,
        now: u32,
    ) -> Result<Self, RecorderError> {
        let body = snapshot.to_bytes()?;
        let len = u16::try_from(body.len()).map_err(|_| RecorderError::Serialization)?;

        let mut frame = Vec::with_capacity(LENGTH_PREFIX + body.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&body);

        clear_mailbox(storage)?;
        Ok(Self {
            frame,
            offset: 0,
            written_at: now,
        })
    }

    pub fn is_done(&self) -> bool {
        self.offset >= self.frame.len()
    }

    /// Write the next chunk if the previous one was collected.
    ///
    /// Returns true once the writer is finished: the whole frame was handed
    /// over, or a chunk sat uncollected for longer than `timeout` and the
    /// transfer was abandoned.
    pub fn service<S: Storage>(
        &mut self,
        storage: &mut S,
        now: u32,
        timeout: Duration,
    ) -> Result<bool, RecorderError> {
        if self.is_done() {
            return Ok(true);
        }
        if storage.exists(MAILBOX_LOCK_KEY) {
            if now.saturating_sub(self.written_at) as u64 > timeout.as_secs() {
                warn!(
                    "Snapshot chunk at {} uncollected since {}, abandoning transfer",
                    self.offset, self.written_at
                );
                clear_mailbox(storage)?;
                self.offset = self.frame.len();
                return Ok(true);
            }
            return Ok(false);
        }

        let end = (self.offset + MAX_VALUE_LEN).min(self.frame.len());
        storage.write(MAILBOX_PAYLOAD_KEY, &self.frame[self.offset..end])?;
        storage.write(MAILBOX_LOCK_KEY, &[1])?;
        debug!("Snapshot chunk {}..{} written", self.offset, end);

        self.offset = end;
        self.written_at = now;
        Ok(self.is_done())
    }
}

/// Foreground side of the handshake.
///
/// Posts [`WorkerMessage::RequestSnapshot`] and polls the mailbox every
/// `poll_interval` until the frame is complete. Gives up with
/// [`RecorderError::CrossProcessTimeout`] after `timeout`, leaving the
/// mailbox empty.
pub async fn request_snapshot<S, K, D>(
    storage: &mut S,
    sink: &mut K,
    delay: &mut D,
    start_index: u16,
    config: &HandshakeConfig,
) -> Result<Snapshot, RecorderError>
where
    S: Storage,
    K: MessageSink,
    D: DelayNs,
{
    clear_mailbox(storage)?;
    sink.post(WorkerMessage::RequestSnapshot { start_index });

    let max_polls = config.max_polls();
    let interval_us = config.poll_interval.as_micros().min(u32::MAX as u64) as u32;
    let mut frame: Vec<u8> = Vec::new();
    let mut buf = [0u8; MAX_VALUE_LEN];

    for _ in 0..max_polls {
        delay.delay_us(interval_us).await;

        if !storage.exists(MAILBOX_LOCK_KEY) {
            continue;
        }
        if let Some(len) = storage.read(MAILBOX_PAYLOAD_KEY, &mut buf)? {
            frame.extend_from_slice(&buf[..len]);
        }
        storage.delete(MAILBOX_LOCK_KEY)?;

        if frame.len() < LENGTH_PREFIX {
            continue;
        }
        let total = LENGTH_PREFIX + u16::from_le_bytes([frame[0], frame[1]]) as usize;
        if frame.len() >= total {
            storage.delete(MAILBOX_PAYLOAD_KEY)?;
            return Snapshot::from_bytes(&frame[LENGTH_PREFIX..total]);
        }
    }

    warn!("Snapshot request timed out after {} polls", max_polls);
    clear_mailbox(storage)?;
    Err(RecorderError::CrossProcessTimeout { polls: max_polls })
}
