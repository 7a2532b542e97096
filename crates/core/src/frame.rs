use std::time::Duration;

use crate::format::PixelFormat;

/// Errors raised by [`Frame`] buffer management.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// A required buffer growth could not be satisfied.
    #[error("frame buffer allocation failed")]
    OutOfMemory,
}

/// A rectangular image plus a resizable byte payload.
///
/// `stride` is in bytes and refers to the dominant plane: for packed formats
/// it is at least `width * bytes_per_pixel`, for planar formats it describes
/// the luma plane. `used` counts the valid bytes; the backing buffer never
/// shrinks and is reallocated geometrically on demand.
///
/// # Example
/// ```rust
/// use scanline_core::prelude::{Frame, PixelFormat};
///
/// let mut frame = Frame::new();
/// frame.width = 4;
/// frame.height = 2;
/// frame.format = PixelFormat::RGB24;
/// frame.stride = 12;
/// frame.append(&[0u8; 24]).unwrap();
/// assert_eq!(frame.used(), 24);
/// ```
#[derive(Debug, Clone)]
pub struct Frame {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Bytes per row of the dominant plane.
    pub stride: u32,
    /// Opaque format tag.
    pub format: PixelFormat,
    /// Monotonic timestamp taken at the frame source.
    pub grab_ts: Duration,
    used: usize,
    data: Vec<u8>,
}

impl Frame {
    /// An empty frame with no allocation and unset metadata.
    pub fn new() -> Self {
        Self {
            width: 0,
            height: 0,
            stride: 0,
            format: PixelFormat::NONE,
            grab_ts: Duration::ZERO,
            used: 0,
            data: Vec::new(),
        }
    }

    /// Copy every scalar field from `other` except the payload bookkeeping
    /// (`data`, `used`, `allocated`).
    pub fn copy_meta_from(&mut self, other: &Frame) {
        self.width = other.width;
        self.height = other.height;
        self.stride = other.stride;
        self.format = other.format;
        self.grab_ts = other.grab_ts;
    }

    /// Valid bytes in the payload.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Current buffer capacity in bytes.
    pub fn allocated(&self) -> usize {
        self.data.len()
    }

    /// The valid payload.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.used]
    }

    /// Mutable view of the valid payload.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.used]
    }

    /// Drop the payload without releasing the allocation.
    pub fn clear(&mut self) {
        self.used = 0;
    }

    /// Grow the buffer so it can hold at least `capacity` bytes.
    ///
    /// Never shrinks; bytes in `[0, used)` are preserved. Growth is
    /// geometric to amortize repeated appends.
    pub fn ensure_capacity(&mut self, capacity: usize) -> Result<(), FrameError> {
        if self.data.len() >= capacity {
            return Ok(());
        }
        let target = capacity.max(self.data.len().saturating_mul(2));
        self.data
            .try_reserve_exact(target - self.data.len())
            .map_err(|_| FrameError::OutOfMemory)?;
        self.data.resize(target, 0);
        Ok(())
    }

    /// Append `bytes` to the payload, growing the buffer as needed.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), FrameError> {
        let end = self
            .used
            .checked_add(bytes.len())
            .ok_or(FrameError::OutOfMemory)?;
        self.ensure_capacity(end)?;
        self.data[self.used..end].copy_from_slice(bytes);
        self.used = end;
        Ok(())
    }

    /// Size the payload to exactly `len` bytes and hand out the writable
    /// slice. This is the fill path for converters and decoders.
    pub fn payload_mut(&mut self, len: usize) -> Result<&mut [u8], FrameError> {
        self.ensure_capacity(len)?;
        self.used = len;
        Ok(&mut self.data[..len])
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}
