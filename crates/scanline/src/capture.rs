//! The consumed capture-source interface.
//!
//! Backends (V4L2, HDMI bridges, synthetic sources) live outside this
//! crate; the pipeline only needs buffers with an index, an optional DMA
//! file descriptor for cross-subsystem sharing, and the raw frame view.

use scanline_core::prelude::{Frame, PixelFormat};
use scanline_display::prelude::{SourceBuffer, SourceDescriptor};

/// Errors from a capture backend.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// The device disappeared or refused an ioctl.
    #[error("capture device failure: {0}")]
    Device(String),
    /// The source has no signal; the caller shows the no-signal overlay.
    #[error("no capture signal")]
    NoSignal,
}

/// Identity of one buffer in the producer's pool.
#[derive(Clone, Copy, Debug)]
pub struct CaptureBufferInfo {
    /// Unique inside the pool; the buffer's identity across the system.
    pub index: u32,
    /// Non-negative when the producer supports DMA sharing.
    pub dma_fd: i32,
}

/// Negotiated capture parameters, fixed for a streaming session.
#[derive(Clone, Debug)]
pub struct CaptureState {
    pub width: u32,
    pub height: u32,
    pub hz: f32,
    pub format: PixelFormat,
    pub stride: u32,
    pub buffers: Vec<CaptureBufferInfo>,
}

impl CaptureState {
    pub fn n_bufs(&self) -> usize {
        self.buffers.len()
    }

    /// What the display engine needs to import this source.
    pub fn descriptor(&self) -> SourceDescriptor {
        SourceDescriptor {
            width: self.width,
            height: self.height,
            hz: self.hz,
            format: self.format,
            stride: self.stride,
            buffers: self
                .buffers
                .iter()
                .map(|buf| SourceBuffer {
                    index: buf.index,
                    dma_fd: buf.dma_fd,
                })
                .collect(),
        }
    }
}

/// One dequeued buffer. `raw` stays valid until `release(index)`.
#[derive(Debug)]
pub struct CaptureBuffer {
    pub index: u32,
    pub dma_fd: i32,
    pub raw: Frame,
}

/// A frame producer.
pub trait CaptureSource: Send {
    /// Negotiate formats and map the buffer pool.
    fn open(&mut self) -> Result<CaptureState, CaptureError>;
    /// Dequeue the next filled buffer, or `None` when nothing is ready.
    fn poll(&mut self) -> Result<Option<CaptureBuffer>, CaptureError>;
    /// Return a buffer to the pool for refilling.
    fn release(&mut self, index: u32) -> Result<(), CaptureError>;
}
