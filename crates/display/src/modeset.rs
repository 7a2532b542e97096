//! The consumed surface of the kernel modesetting device.
//!
//! The display engine drives this trait; the binary-level ioctl bindings
//! live outside this crate. Ids are the kernel's own object ids and are
//! only ever compared or passed back.

use std::time::Duration;

use scanline_core::prelude::PixelFormat;

/// DPMS property value for "on".
pub const DPMS_ON: u64 = 0;
/// DPMS property value for "off".
pub const DPMS_OFF: u64 = 3;

/// Errors from the display layer.
#[derive(Debug, thiserror::Error)]
pub enum DisplayError {
    /// The sink is unplugged; the engine waits for a replug.
    #[error("display is not plugged")]
    NoDevice,
    /// Another master holds the resource; best-effort paths continue.
    #[error("display resource is busy")]
    Busy,
    /// A bounded wait elapsed.
    #[error("timed out waiting for the display")]
    Timeout,
    /// A caller-supplied argument was rejected.
    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),
    /// The device lacks a required capability.
    #[error("not supported: {0}")]
    Unsupported(&'static str),
    /// Any other device failure.
    #[error("modesetting device failure: {0}")]
    Device(String),
}

/// One display timing, as advertised by a connector.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ModeInfo {
    pub hdisplay: u16,
    pub vdisplay: u16,
    pub htotal: u16,
    pub vtotal: u16,
    /// Pixel clock in kHz.
    pub clock_khz: u32,
    pub vscan: u16,
    pub interlace: bool,
    pub doublescan: bool,
    pub preferred: bool,
}

impl ModeInfo {
    /// Refresh rate derived from the timing, matching the kernel's
    /// rounding.
    pub fn refresh_hz(&self) -> f32 {
        if self.htotal == 0 || self.vtotal == 0 {
            return 0.0;
        }
        let mut mhz = (self.clock_khz as i64 * 1_000_000 / self.htotal as i64
            + self.vtotal as i64 / 2)
            / self.vtotal as i64;
        if self.interlace {
            mhz *= 2;
        }
        if self.doublescan {
            mhz /= 2;
        }
        if self.vscan > 1 {
            mhz /= self.vscan as i64;
        }
        mhz as f32 / 1000.0
    }
}

/// Physical connector flavor; `label()` yields the port-name prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectorKind {
    Vga,
    DviI,
    DviD,
    DviA,
    Composite,
    SVideo,
    Lvds,
    Component,
    Din,
    DisplayPort,
    HdmiA,
    HdmiB,
    Tv,
    Edp,
    Virtual,
    Dsi,
    Dpi,
    Writeback,
    Spi,
    Usb,
    Unknown,
}

impl ConnectorKind {
    pub fn label(&self) -> &'static str {
        match self {
            ConnectorKind::Vga => "VGA",
            ConnectorKind::DviI => "DVI-I",
            ConnectorKind::DviD => "DVI-D",
            ConnectorKind::DviA => "DVI-A",
            ConnectorKind::Composite => "Composite",
            ConnectorKind::SVideo => "SVIDEO",
            ConnectorKind::Lvds => "LVDS",
            ConnectorKind::Component => "Component",
            ConnectorKind::Din => "DIN",
            ConnectorKind::DisplayPort => "DP",
            ConnectorKind::HdmiA => "HDMI-A",
            ConnectorKind::HdmiB => "HDMI-B",
            ConnectorKind::Tv => "TV",
            ConnectorKind::Edp => "eDP",
            ConnectorKind::Virtual => "Virtual",
            ConnectorKind::Dsi => "DSI",
            ConnectorKind::Dpi => "DPI",
            ConnectorKind::Writeback => "Writeback",
            ConnectorKind::Spi => "SPI",
            ConnectorKind::Usb => "USB",
            ConnectorKind::Unknown => "Unknown",
        }
    }
}

/// A property exposed on a connector.
#[derive(Clone, Debug)]
pub struct ConnectorProperty {
    pub id: u32,
    pub name: String,
}

/// Connector snapshot.
#[derive(Clone, Debug)]
pub struct ConnectorInfo {
    pub id: u32,
    pub kind: ConnectorKind,
    pub kind_id: u32,
    pub connected: bool,
    pub modes: Vec<ModeInfo>,
    pub encoders: Vec<u32>,
    pub properties: Vec<ConnectorProperty>,
}

impl ConnectorInfo {
    /// `<type>-<type_id>`, e.g. `HDMI-A-1`.
    pub fn port_name(&self) -> String {
        format!("{}-{}", self.kind.label(), self.kind_id)
    }
}

/// Encoder snapshot; `possible_crtcs` is the usual bitmask over the
/// resource list's CRTC indexes.
#[derive(Clone, Copy, Debug)]
pub struct EncoderInfo {
    pub id: u32,
    pub possible_crtcs: u32,
}

/// Top-level object id lists.
#[derive(Clone, Debug, Default)]
pub struct Resources {
    pub connectors: Vec<u32>,
    pub encoders: Vec<u32>,
    pub crtcs: Vec<u32>,
}

/// Saved CRTC state, restored verbatim at close.
#[derive(Clone, Debug, PartialEq)]
pub struct CrtcState {
    pub crtc_id: u32,
    pub fb_id: u32,
    pub x: u32,
    pub y: u32,
    pub mode: Option<ModeInfo>,
}

/// A driver-allocated CPU-mappable surface.
#[derive(Clone, Copy, Debug)]
pub struct DumbBuffer {
    pub handle: u32,
    pub pitch: u32,
    pub size: usize,
}

/// Device capabilities the engine probes at open.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capability {
    DumbBuffer,
    PrimeImport,
}

/// Hotplug state of a connector.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectorStatus {
    Connected,
    Disconnected,
    #[default]
    Unknown,
}

/// Page-flip request flags.
#[derive(Clone, Copy, Debug, Default)]
pub struct PageFlipFlags {
    /// Deliver a completion event through `wait_event`.
    pub event: bool,
    /// Don't wait for vblank to queue the flip.
    pub asynchronous: bool,
}

/// A delivered page-flip completion.
#[derive(Clone, Copy, Debug)]
pub struct FlipEvent {
    /// The token passed to `page_flip`.
    pub token: usize,
}

/// CPU mapping of a dumb buffer. Dropped mappings are unmapped.
pub trait MappedDumb: Send {
    fn data(&mut self) -> &mut [u8];
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One opened modesetting device.
pub trait ModesetDevice: Send {
    fn driver_name(&self) -> String;
    fn drop_master(&mut self) -> Result<(), DisplayError>;
    fn set_master(&mut self) -> Result<(), DisplayError>;
    fn has_capability(&self, cap: Capability) -> Result<bool, DisplayError>;

    /// Hotplug status for the named port, e.g. `HDMI-A-1`.
    fn connector_status(&self, port: &str) -> Result<ConnectorStatus, DisplayError>;

    fn resources(&self) -> Result<Resources, DisplayError>;
    fn connector(&self, id: u32) -> Result<ConnectorInfo, DisplayError>;
    fn encoder(&self, id: u32) -> Result<EncoderInfo, DisplayError>;
    fn crtc(&self, id: u32) -> Result<CrtcState, DisplayError>;
    fn set_crtc(
        &mut self,
        crtc_id: u32,
        fb_id: u32,
        x: u32,
        y: u32,
        connectors: &[u32],
        mode: Option<&ModeInfo>,
    ) -> Result<(), DisplayError>;
    fn set_connector_property(
        &mut self,
        connector_id: u32,
        property_id: u32,
        value: u64,
    ) -> Result<(), DisplayError>;

    fn create_dumb(&mut self, width: u32, height: u32, bpp: u32)
        -> Result<DumbBuffer, DisplayError>;
    fn map_dumb(&mut self, handle: u32) -> Result<Box<dyn MappedDumb>, DisplayError>;
    fn destroy_dumb(&mut self, handle: u32) -> Result<(), DisplayError>;

    /// PRIME-import a foreign DMA buffer, returning its handle.
    fn import_dma(&mut self, dma_fd: i32) -> Result<u32, DisplayError>;

    /// Legacy framebuffer registration (depth + bpp).
    fn add_framebuffer(
        &mut self,
        width: u32,
        height: u32,
        depth: u32,
        bpp: u32,
        pitch: u32,
        handle: u32,
    ) -> Result<u32, DisplayError>;
    /// Format-explicit framebuffer registration.
    fn add_framebuffer2(
        &mut self,
        width: u32,
        height: u32,
        format: PixelFormat,
        handles: [u32; 4],
        pitches: [u32; 4],
        offsets: [u32; 4],
    ) -> Result<u32, DisplayError>;
    fn remove_framebuffer(&mut self, fb_id: u32) -> Result<(), DisplayError>;

    fn page_flip(
        &mut self,
        crtc_id: u32,
        fb_id: u32,
        flags: PageFlipFlags,
        token: usize,
    ) -> Result<(), DisplayError>;

    /// Block up to `timeout` for one event; `None` on timeout.
    fn wait_event(&mut self, timeout: Duration) -> Result<Option<FlipEvent>, DisplayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_rate_matches_kernel_rounding() {
        // 1920x1080p60: 148.5 MHz, 2200x1125 total.
        let mode = ModeInfo {
            hdisplay: 1920,
            vdisplay: 1080,
            htotal: 2200,
            vtotal: 1125,
            clock_khz: 148_500,
            ..ModeInfo::default()
        };
        assert!((mode.refresh_hz() - 60.0).abs() < 0.01);

        let interlaced = ModeInfo {
            interlace: true,
            ..mode
        };
        assert!((interlaced.refresh_hz() - 120.0).abs() < 0.01);
    }

    #[test]
    fn port_names_follow_type_and_id() {
        let conn = ConnectorInfo {
            id: 5,
            kind: ConnectorKind::HdmiA,
            kind_id: 1,
            connected: true,
            modes: Vec::new(),
            encoders: Vec::new(),
            properties: Vec::new(),
        };
        assert_eq!(conn.port_name(), "HDMI-A-1");
    }
}
