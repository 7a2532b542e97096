#![doc = include_str!("../README.md")]

pub mod display;
pub mod modeset;
pub mod text;

mod font;

pub mod prelude {
    pub use crate::display::{
        Display, DisplayOptions, HwFrame, OpenMode, Platform, SourceBuffer, SourceDescriptor,
        StubCause, StubKind,
    };
    pub use crate::modeset::{DisplayError, ModesetDevice};
    pub use crate::text::TextRenderer;
}
