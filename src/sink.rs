//! The enqueue handle the supervisor hands to collectors.
//!
//! Wraps the durable buffer together with the shared pause flag: while the
//! agent is paused, enqueues become no-ops but collectors keep observing
//! filesystem events, so offsets and baselines still advance and resuming
//! does not replay history.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::error;

use crate::buffer::EventBuffer;
use crate::event::{FimRecord, LogRecord};

#[derive(Clone)]
pub struct EventSink {
    buffer: Arc<EventBuffer>,
    paused: Arc<AtomicBool>,
}

impl EventSink {
    pub fn new(buffer: Arc<EventBuffer>, paused: Arc<AtomicBool>) -> Self {
        EventSink { buffer, paused }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Enqueue a log record unless paused. Storage errors are not expected
    /// here; they are logged and the record is dropped.
    pub fn log(&self, record: LogRecord) {
        if self.is_paused() {
            return;
        }
        if let Err(error) = self.buffer.enqueue_log(&record) {
            error!(message = "Failed to enqueue log record.", %error);
        }
    }

    /// Enqueue a FIM record unless paused.
    pub fn fim(&self, record: FimRecord) {
        if self.is_paused() {
            return;
        }
        if let Err(error) = self.buffer.enqueue_fim(&record) {
            error!(message = "Failed to enqueue FIM record.", %error);
        }
    }
}
