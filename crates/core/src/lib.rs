#![doc = include_str!("../README.md")]

pub mod clock;
pub mod format;
pub mod frame;

pub mod prelude {
    pub use crate::{
        clock::{now_monotonic, MonotonicClock, SystemClock},
        format::PixelFormat,
        frame::{Frame, FrameError},
    };
}
