//! Memory sinks for encoded and raw frames.

use std::sync::{Arc, Mutex};

use scanline_core::prelude::Frame;

/// Errors from a sink.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("sink rejected the frame: {0}")]
    Rejected(String),
}

/// Anything that accepts published frames (shared-memory segments, HTTP
/// streamers, recorders). Latest-wins semantics are the sink's business.
pub trait MemorySink: Send {
    fn publish(&mut self, frame: &Frame) -> Result<(), SinkError>;
}

/// In-process latest-frame slot: each publish replaces the previous frame.
pub struct SharedSlotSink {
    slot: Arc<Mutex<Option<Frame>>>,
    published: u64,
}

/// Reader handle for a [`SharedSlotSink`].
#[derive(Clone)]
pub struct SharedSlot(Arc<Mutex<Option<Frame>>>);

impl SharedSlotSink {
    pub fn new() -> (Self, SharedSlot) {
        let slot = Arc::new(Mutex::new(None));
        (
            Self {
                slot: slot.clone(),
                published: 0,
            },
            SharedSlot(slot),
        )
    }

    /// Frames accepted so far.
    pub fn published(&self) -> u64 {
        self.published
    }
}

impl MemorySink for SharedSlotSink {
    fn publish(&mut self, frame: &Frame) -> Result<(), SinkError> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| SinkError::Rejected("slot poisoned".into()))?;
        *slot = Some(frame.clone());
        self.published += 1;
        Ok(())
    }
}

impl SharedSlot {
    /// Clone out the most recently published frame.
    pub fn latest(&self) -> Option<Frame> {
        self.0.lock().ok().and_then(|slot| slot.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scanline_core::prelude::PixelFormat;

    #[test]
    fn slot_keeps_the_latest_frame() {
        let (mut sink, slot) = SharedSlotSink::new();
        assert!(slot.latest().is_none());

        let mut frame = Frame::new();
        frame.format = PixelFormat::H264;
        frame.append(&[1, 2, 3]).unwrap();
        sink.publish(&frame).unwrap();

        frame.clear();
        frame.append(&[9, 9]).unwrap();
        sink.publish(&frame).unwrap();

        let latest = slot.latest().unwrap();
        assert_eq!(latest.data(), &[9, 9]);
        assert_eq!(sink.published(), 2);
    }
}
