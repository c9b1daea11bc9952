//! Messaging between the recording worker and a foreground reader.
//!
//! The two sides share the key-value storage and a small typed message bus.
//! The worker posts [`WorkerMessage::ReloadNotification`] whenever derived
//! statistics change; the foreground requests a [`Snapshot`] through the
//! storage mailbox (see [`mailbox`]).

pub mod mailbox;
pub mod snapshot;

pub use mailbox::{SnapshotWriter, request_snapshot};
pub use snapshot::{Snapshot, SnapshotPoint};

use alloc::vec::Vec;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, Sender, TrySendError};
use log::warn;

/// Bus capacity, enough for a burst of alert and reload messages
pub const MESSAGE_CHANNEL_CAPACITY: usize = 8;

/// Messages exchanged over the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMessage {
    /// Foreground asks for a snapshot with history starting at `start_index`
    RequestSnapshot { start_index: u16 },
    /// Derived statistics changed, cached views should be reloaded
    ReloadNotification,
    ScheduleAlert { seconds: i32 },
    UnscheduleAlert { index: u8 },
    AlertFired { index: u8 },
    /// Dump the diagnostic report to the log
    ExportRequest,
}

pub type MessageChannel =
    Channel<CriticalSectionRawMutex, WorkerMessage, MESSAGE_CHANNEL_CAPACITY>;

pub type MessageSender<'a> =
    Sender<'a, CriticalSectionRawMutex, WorkerMessage, MESSAGE_CHANNEL_CAPACITY>;

/// Outgoing side of the bus. Posting never blocks.
pub trait MessageSink {
    fn post(&mut self, message: WorkerMessage);
}

impl MessageSink for MessageSender<'_> {
    fn post(&mut self, message: WorkerMessage) {
        if let Err(TrySendError::Full(message)) = self.try_send(message) {
            warn!("Message bus full, dropping {:?}", message);
        }
    }
}

impl MessageSink for Vec<WorkerMessage> {
    fn post(&mut self, message: WorkerMessage) {
        self.push(message);
    }
}

impl<T: MessageSink + ?Sized> MessageSink for &mut T {
    fn post(&mut self, message: WorkerMessage) {
        (**self).post(message);
    }
}
