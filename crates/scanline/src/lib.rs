#![doc = include_str!("../README.md")]

pub use scanline_codec as codec;
pub use scanline_core as core;
pub use scanline_display as display;

pub mod capture;
pub mod config;
pub mod pipeline;
pub mod sink;

pub mod prelude {
    pub use crate::capture::{
        CaptureBuffer, CaptureBufferInfo, CaptureError, CaptureSource, CaptureState,
    };
    pub use crate::config::{DisplaySettings, EncoderSettings, NodeConfig};
    pub use crate::pipeline::{PassthroughPipeline, PipelineError, PipelineStats};
    pub use crate::sink::{MemorySink, SharedSlot, SharedSlotSink, SinkError};
    pub use scanline_codec::prelude::*;
    pub use scanline_core::prelude::*;
    pub use scanline_display::prelude::*;
}
