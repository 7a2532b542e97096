#![doc = include_str!("../README.md")]

use scanline_core::prelude::{FrameError, PixelFormat};

pub mod convert;
pub mod jpeg;
pub mod vendor;

pub mod prelude {
    pub use crate::{
        convert::{self, Center},
        jpeg,
        vendor::{
            api::{RateControl, VendorDevice, VendorLibrary},
            decoder::MjpegDecoder,
            encoder::{EncoderTuning, H264Encoder},
            loopback::LoopbackLibrary,
            transcoder::{Transcoder, TranscoderStats},
            CodecStats,
        },
        CodecError,
    };
}

/// Errors emitted by the codec layer.
///
/// `InfoChange` and `Eos` are soft conditions: the caller retries the frame
/// (after the decoder re-provisioned its buffers) or drains the context.
/// Everything else is a real failure reported to the orchestrator, which
/// tracks consecutive errors and recreates the processor above a threshold.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// A caller-supplied argument was rejected.
    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),
    /// A buffer allocation could not be satisfied.
    #[error("buffer allocation failed")]
    OutOfMemory,
    /// Context creation or configuration failed.
    #[error("codec initialization failed: {0}")]
    Init(String),
    /// The encode path failed.
    #[error("encoding failed: {0}")]
    Encode(String),
    /// The decode path failed.
    #[error("decoding failed: {0}")]
    Decode(String),
    /// The software JPEG decompressor failed.
    #[error("jpeg decompression failed: {0}")]
    JpegDecode(String),
    /// The input pixel format has no route through this component.
    #[error("format {0} is not supported")]
    FormatUnsupported(PixelFormat),
    /// The context is not (or no longer) usable.
    #[error("codec not initialized")]
    NotInitialized,
    /// Output would exceed the pre-allocated buffer.
    #[error("output exceeds buffer capacity")]
    BufferOverflow,
    /// The bounded get/put loop exhausted its retries.
    #[error("codec operation timed out")]
    Timeout,
    /// Output geometry is now known; buffers were re-provisioned. Retry the
    /// same frame on the next call.
    #[error("output info changed, retry the frame")]
    InfoChange,
    /// End of stream reached; drain the context.
    #[error("end of stream")]
    Eos,
}

impl CodecError {
    /// True for the soft conditions the caller retries rather than reports.
    pub fn is_transient(&self) -> bool {
        matches!(self, CodecError::InfoChange | CodecError::Eos)
    }
}

impl From<FrameError> for CodecError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::OutOfMemory => CodecError::OutOfMemory,
        }
    }
}
