//! The display engine: connector/mode selection, framebuffer management,
//! scan-out, and the no-signal policy.

use std::sync::Arc;
use std::time::Duration;

use scanline_codec::convert::{self, Center, ScanoutTarget};
use scanline_codec::jpeg;
use scanline_core::prelude::{Frame, MonotonicClock, PixelFormat, SystemClock};
use smallvec::SmallVec;
use tracing::{debug, error, info, warn};

use crate::modeset::{
    Capability, ConnectorInfo, ConnectorStatus, CrtcState, DisplayError, MappedDumb, ModeInfo,
    ModesetDevice, PageFlipFlags, Resources, DPMS_OFF, DPMS_ON,
};
use crate::text::TextRenderer;

/// Dumb framebuffers allocated for the stub path.
const STUB_FRAMEBUFFERS: usize = 4;

/// How the display was opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    /// Live zero-copy scan-out of capture buffers.
    Dma,
    /// Text overlays only.
    Stub(StubCause),
}

/// Why the engine fell back to stub mode at open.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StubCause {
    /// Opened without a capture source.
    NoSource,
    /// The capture pixel format has no scan-out route.
    BadFormat,
    /// No mode matches the capture geometry.
    BadResolution,
}

/// Which canned status overlay to show.
#[derive(Clone, Debug, PartialEq)]
pub enum StubKind {
    BadResolution { width: u32, height: u32, hz: f32 },
    BadFormat,
    NoSignal,
    Busy,
}

/// Scan-out strategy classes, frozen at open time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Platform {
    /// Raspberry-Pi-class: async page flips with reliable flip events.
    Rpi,
    /// Amlogic-class: CPU convert + blocking CRTC set; flip events are
    /// not reliably delivered.
    Amlogic,
    Generic,
}

/// Engine configuration.
#[derive(Clone, Debug)]
pub struct DisplayOptions {
    /// Connector port name (`HDMI-A-1`); auto-detected when unset.
    pub port: Option<String>,
    /// Vsync wait bound.
    pub timeout: Duration,
    /// No-signal time before the output is powered off.
    pub blank_after: Duration,
}

impl Default for DisplayOptions {
    fn default() -> Self {
        Self {
            port: None,
            timeout: Duration::from_secs(5),
            blank_after: Duration::from_secs(5),
        }
    }
}

/// One capture-side buffer the display may import.
#[derive(Clone, Copy, Debug)]
pub struct SourceBuffer {
    pub index: u32,
    pub dma_fd: i32,
}

/// What the display needs to know about the capture source at open.
#[derive(Clone, Debug)]
pub struct SourceDescriptor {
    pub width: u32,
    pub height: u32,
    pub hz: f32,
    pub format: PixelFormat,
    pub stride: u32,
    pub buffers: Vec<SourceBuffer>,
}

/// A live capture buffer handed to the expose calls.
#[derive(Clone, Copy, Debug)]
pub struct HwFrame<'a> {
    pub index: u32,
    pub dma_fd: i32,
    pub raw: &'a Frame,
}

struct Framebuffer {
    fb_id: u32,
    handle: u32,
    pitch: u32,
    bpp: u32,
    map: Option<Box<dyn MappedDumb>>,
    dumb_created: bool,
    fb_added: bool,
    source_dma_fd: Option<i32>,
}

/// The display runtime. Serial by construction: every operation takes
/// `&mut self`, callers share it behind their own lock.
pub struct Display {
    options: DisplayOptions,
    device: Box<dyn ModesetDevice>,
    clock: Arc<dyn MonotonicClock>,
    text: TextRenderer,

    opened: Option<OpenMode>,
    platform: Platform,
    port: Option<String>,
    conn_id: u32,
    crtc_id: u32,
    dpms_id: Option<u32>,
    dpms_state: Option<bool>,
    mode: ModeInfo,
    bufs: SmallVec<[Framebuffer; STUB_FRAMEBUFFERS]>,
    saved_crtc: Option<CrtcState>,
    has_vsync: bool,
    exposing_dma_fd: Option<i32>,
    blank_at: Option<Duration>,
    detected_bpp: u32,
    stub_n_buf: usize,
    frame_counter: u32,
    last_logged_format: Option<PixelFormat>,
}

impl Display {
    pub fn new(device: Box<dyn ModesetDevice>, options: DisplayOptions) -> Self {
        Self::with_clock(device, options, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(
        device: Box<dyn ModesetDevice>,
        options: DisplayOptions,
        clock: Arc<dyn MonotonicClock>,
    ) -> Self {
        Self {
            port: options.port.clone(),
            options,
            device,
            clock,
            text: TextRenderer::new(),
            opened: None,
            platform: Platform::Generic,
            conn_id: 0,
            crtc_id: 0,
            dpms_id: None,
            dpms_state: None,
            mode: ModeInfo::default(),
            bufs: SmallVec::new(),
            saved_crtc: None,
            has_vsync: true,
            exposing_dma_fd: None,
            blank_at: None,
            detected_bpp: 24,
            stub_n_buf: 0,
            frame_counter: 0,
            last_logged_format: None,
        }
    }

    pub fn open_mode(&self) -> Option<OpenMode> {
        self.opened
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn mode(&self) -> ModeInfo {
        self.mode
    }

    pub fn port(&self) -> Option<&str> {
        self.port.as_deref()
    }

    pub fn exposing_dma(&self) -> Option<i32> {
        self.exposing_dma_fd
    }

    pub fn detected_bpp(&self) -> u32 {
        self.detected_bpp
    }

    /// Configure the device and bring up the pipeline.
    ///
    /// With a capture descriptor the engine tries zero-copy DMA scan-out;
    /// unsupported formats or geometries degrade to stub mode instead of
    /// failing. `NoDevice` means the sink is unplugged; retry on replug.
    pub fn open(&mut self, cap: Option<&SourceDescriptor>) -> Result<OpenMode, DisplayError> {
        if self.opened.is_some() {
            return Err(DisplayError::InvalidParam("display is already open"));
        }
        match self.open_inner(cap) {
            Ok(mode) => {
                self.opened = Some(mode);
                info!(?mode, "display opened");
                Ok(mode)
            }
            Err(err) => {
                if matches!(err, DisplayError::NoDevice) {
                    error!("display is not plugged");
                }
                self.close();
                Err(err)
            }
        }
    }

    fn open_inner(&mut self, cap: Option<&SourceDescriptor>) -> Result<OpenMode, DisplayError> {
        self.check_status()?;
        info!(
            port = self.port.as_deref().unwrap_or("auto-detect"),
            mode = if cap.is_some() { "DMA" } else { "STUB" },
            "configuring display device"
        );

        // Drop then set master to recover from a dirty handoff. A refusal
        // is survivable: scan-out degrades to whatever the kernel allows.
        let _ = self.device.drop_master();
        if let Err(err) = self.device.set_master() {
            warn!("can't acquire master control ({err}), continuing without page-flip rights");
        }

        let driver = self.device.driver_name();
        self.platform = detect_platform(&driver);
        info!(driver, platform = ?self.platform, "detected platform");

        let mut cause = match cap {
            None => Some(StubCause::NoSource),
            Some(src)
                if !matches!(
                    src.format,
                    PixelFormat::RGB24
                        | PixelFormat::BGR24
                        | PixelFormat::YUYV
                        | PixelFormat::MJPEG
                ) =>
            {
                error!("input format {} is not supported, forcing to stub", src.format);
                Some(StubCause::BadFormat)
            }
            Some(_) => None,
        };

        if !self.device.has_capability(Capability::DumbBuffer)? {
            return Err(DisplayError::Unsupported("dumb buffers"));
        }
        if cause.is_none() && !self.device.has_capability(Capability::PrimeImport)? {
            return Err(DisplayError::Unsupported("prime import"));
        }

        let (width, height, hz) = match (cause, cap) {
            (None, Some(src)) => (src.width, src.height, src.hz),
            _ => (0, 0, 0.0),
        };
        self.find_sink(width, height, hz)?;

        if cause.is_none() {
            // Show something when only the height differs; anything else
            // is a stub.
            if width != self.mode.hdisplay as u32 || height < self.mode.vdisplay as u32 {
                error!("no appropriate mode for the capture, forcing to stub");
                cause = Some(StubCause::BadResolution);
            }
        }

        self.init_buffers(if cause.is_some() { None } else { cap })?;

        self.saved_crtc = Some(self.device.crtc(self.crtc_id)?);
        debug!("setting up CRTC");
        match self.device.set_crtc(
            self.crtc_id,
            self.bufs[0].fb_id,
            0,
            0,
            &[self.conn_id],
            Some(&self.mode),
        ) {
            Ok(()) => {}
            Err(DisplayError::Busy) => {
                info!("CRTC is busy (probably a desktop environment), continuing without display control");
            }
            Err(err) => return Err(err),
        }

        self.exposing_dma_fd = None;
        self.blank_at = None;
        self.stub_n_buf = 0;
        self.has_vsync = true;
        Ok(match cause {
            None => OpenMode::Dma,
            Some(cause) => OpenMode::Stub(cause),
        })
    }

    /// Tear down: wait out an in-flight flip, restore the original CRTC,
    /// release every buffer, and drop master.
    pub fn close(&mut self) {
        if self.exposing_dma_fd.is_some() {
            // The exposed buffer stays pinned until its flip completes.
            let _ = self.wait_for_vsync();
            self.exposing_dma_fd = None;
        }

        if let Some(saved) = self.saved_crtc.take() {
            debug!("restoring CRTC");
            if let Err(err) = self.device.set_crtc(
                saved.crtc_id,
                saved.fb_id,
                saved.x,
                saved.y,
                &[self.conn_id],
                saved.mode.as_ref(),
            ) {
                error!("can't restore CRTC: {err}");
            }
        }

        let had_bufs = !self.bufs.is_empty();
        for buf in self.bufs.drain(..) {
            debug!(
                fb = buf.fb_id,
                dma_fd = ?buf.source_dma_fd,
                "releasing framebuffer"
            );
            if buf.fb_added {
                if let Err(err) = self.device.remove_framebuffer(buf.fb_id) {
                    error!("can't remove framebuffer {}: {err}", buf.fb_id);
                }
            }
            drop(buf.map);
            if buf.dumb_created {
                if let Err(err) = self.device.destroy_dumb(buf.handle) {
                    error!("can't destroy dumb buffer {}: {err}", buf.handle);
                }
            }
        }

        let _ = self.device.drop_master();
        self.crtc_id = 0;
        self.conn_id = 0;
        self.dpms_id = None;
        self.dpms_state = None;
        self.has_vsync = true;
        self.stub_n_buf = 0;
        if self.opened.take().is_some() || had_bufs {
            info!("display closed");
        }
    }

    /// Draw a canned status overlay into the next stub framebuffer and
    /// queue it for scan-out.
    pub fn expose_stub(&mut self, kind: StubKind) -> Result<(), DisplayError> {
        if self.opened.is_none() {
            return Err(DisplayError::InvalidParam("display is not open"));
        }
        self.blank_at = None;
        self.check_status()?;
        self.ensure_dpms_power(true);

        let message = match &kind {
            StubKind::BadResolution { width, height, hz } => format!(
                "=== SCANLINE ===\n \n< UNSUPPORTED RESOLUTION >\n \n< {width}x{height}p{hz:.2} >\n \nby this display"
            ),
            StubKind::BadFormat => {
                "=== SCANLINE ===\n \n< UNSUPPORTED CAPTURE FORMAT >".to_string()
            }
            StubKind::NoSignal => "=== SCANLINE ===\n \n< NO LIVE VIDEO >".to_string(),
            StubKind::Busy => "=== SCANLINE ===\n \n< ONLINE IS ACTIVE >".to_string(),
        };

        let (mode_w, mode_h) = (self.mode.hdisplay as u32, self.mode.vdisplay as u32);
        let n_buf = self.stub_n_buf;
        if self.bufs.len() <= n_buf {
            return Err(DisplayError::InvalidParam("no stub framebuffers"));
        }
        self.has_vsync = false;

        debug!(n_buf, "copying stub frame");
        let frame = self.text.draw(&message, mode_w, mode_h);
        let buf = &mut self.bufs[n_buf];
        let map = buf
            .map
            .as_mut()
            .ok_or(DisplayError::Unsupported("framebuffer is not CPU-writable"))?;
        copy_stub(frame, map.data(), buf.pitch as usize, buf.bpp, mode_w, mode_h)?;

        debug!(n_buf, "exposing stub framebuffer");
        match self.device.page_flip(
            self.crtc_id,
            buf.fb_id,
            PageFlipFlags {
                event: true,
                asynchronous: true,
            },
            n_buf,
        ) {
            Ok(()) => {}
            Err(DisplayError::Busy) => debug!("page flip permission denied"),
            Err(err) => {
                error!("can't expose stub framebuffer {n_buf}: {err}");
                return Err(err);
            }
        }

        self.stub_n_buf = (self.stub_n_buf + 1) % self.bufs.len();
        Ok(())
    }

    /// Queue the capture buffer's framebuffer for scan-out. The source
    /// buffer stays pinned until the vsync event fires.
    pub fn expose_dma(&mut self, hw: &HwFrame<'_>) -> Result<(), DisplayError> {
        if self.opened != Some(OpenMode::Dma) {
            return Err(DisplayError::InvalidParam("display is not open for DMA"));
        }
        if hw.index as usize >= self.bufs.len() {
            return Err(DisplayError::InvalidParam("capture buffer index out of range"));
        }
        self.blank_at = None;
        self.check_status()?;
        self.ensure_dpms_power(true);
        self.has_vsync = false;

        // Import failed for this slot: convert into the dumb fallback.
        let (mode_w, mode_h) = (self.mode.hdisplay as u32, self.mode.vdisplay as u32);
        let buf = &mut self.bufs[hw.index as usize];
        if let Some(map) = buf.map.as_mut() {
            debug!(index = hw.index, "converting frame into fallback framebuffer");
            scanout_convert(hw.raw, map.data(), buf.pitch as usize, buf.bpp, mode_w, mode_h)?;
        }

        debug!(index = hw.index, "exposing DMA framebuffer");
        match self.device.page_flip(
            self.crtc_id,
            buf.fb_id,
            PageFlipFlags {
                event: true,
                asynchronous: true,
            },
            hw.index as usize,
        ) {
            Ok(()) => {}
            Err(DisplayError::Busy) => debug!("page flip permission denied"),
            Err(err) => {
                error!("can't expose DMA framebuffer {}: {err}", hw.index);
                return Err(err);
            }
        }
        self.exposing_dma_fd = Some(hw.dma_fd);
        Ok(())
    }

    /// Scan out a source smaller than the mode, centered, using the
    /// platform's strategy.
    pub fn expose_centered(&mut self, hw: &HwFrame<'_>) -> Result<(), DisplayError> {
        if self.opened != Some(OpenMode::Dma) {
            return Err(DisplayError::InvalidParam("display is not open for DMA"));
        }
        self.blank_at = None;
        self.check_status()?;
        self.ensure_dpms_power(true);

        match self.platform {
            Platform::Rpi => self.expose_flip(hw, false),
            Platform::Generic => {
                // Exactly one in-flight flip.
                if !self.has_vsync {
                    self.wait_for_vsync()?;
                }
                self.expose_flip(hw, false)
            }
            Platform::Amlogic => self.expose_amlogic(hw),
        }
    }

    fn expose_flip(&mut self, hw: &HwFrame<'_>, asynchronous: bool) -> Result<(), DisplayError> {
        if hw.index as usize >= self.bufs.len() {
            return Err(DisplayError::InvalidParam("capture buffer index out of range"));
        }
        self.has_vsync = false;
        let buf = &self.bufs[hw.index as usize];
        match self.device.page_flip(
            self.crtc_id,
            buf.fb_id,
            PageFlipFlags {
                event: true,
                asynchronous,
            },
            hw.index as usize,
        ) {
            Ok(()) => {}
            Err(DisplayError::Busy) => debug!("page flip permission denied"),
            Err(err) => {
                error!("can't expose framebuffer {}: {err}", hw.index);
                return Err(err);
            }
        }
        self.exposing_dma_fd = Some(hw.dma_fd);
        Ok(())
    }

    fn expose_amlogic(&mut self, hw: &HwFrame<'_>) -> Result<(), DisplayError> {
        let (mode_w, mode_h) = (self.mode.hdisplay as u32, self.mode.vdisplay as u32);
        if Center::fit(hw.raw.width, hw.raw.height, mode_w, mode_h).is_none() {
            error!(
                "source {}x{} is larger than the display {}x{}",
                hw.raw.width, hw.raw.height, mode_w, mode_h
            );
            return self.expose_stub(StubKind::BadResolution {
                width: hw.raw.width,
                height: hw.raw.height,
                hz: 0.0,
            });
        }
        if hw.index as usize >= self.bufs.len() {
            return Err(DisplayError::InvalidParam("capture buffer index out of range"));
        }
        if hw.raw.used() == 0 {
            return Err(DisplayError::InvalidParam("no frame data to display"));
        }

        self.frame_counter = self.frame_counter.wrapping_add(1);
        if self.frame_counter % 60 == 1 || self.last_logged_format != Some(hw.raw.format) {
            debug!(
                format = %hw.raw.format,
                src_w = hw.raw.width,
                src_h = hw.raw.height,
                mode_w,
                mode_h,
                "converting frame for display"
            );
            self.last_logged_format = Some(hw.raw.format);
        }

        self.has_vsync = false;
        let buf = &mut self.bufs[hw.index as usize];
        let map = buf
            .map
            .as_mut()
            .ok_or(DisplayError::Unsupported("framebuffer is not CPU-writable"))?;
        scanout_convert(hw.raw, map.data(), buf.pitch as usize, buf.bpp, mode_w, mode_h)?;

        self.device.set_crtc(
            self.crtc_id,
            buf.fb_id,
            0,
            0,
            &[self.conn_id],
            Some(&self.mode),
        )?;
        // Flip events are unreliable here; consider the frame presented.
        self.has_vsync = true;
        Ok(())
    }

    /// No-signal policy: show the stub until `blank_after` passes, then
    /// power the output off until the next live frame.
    pub fn ensure_no_signal(&mut self) -> Result<(), DisplayError> {
        if self.opened.is_none() {
            return Err(DisplayError::InvalidParam("display is not open"));
        }
        let now = self.clock.now();
        if self.blank_at.is_none() {
            self.blank_at = Some(now + self.options.blank_after);
        }
        // The expose/wait calls clear the deadline; keep it alive across
        // them.
        let saved = self.blank_at;

        let result = if Some(now) <= saved {
            self.wait_for_vsync()
                .and_then(|()| self.expose_stub(StubKind::NoSignal))
        } else {
            if self.dpms_state != Some(false) {
                info!("turning off the display by timeout");
            }
            self.dpms_power_off()
        };
        self.blank_at = saved;
        result
    }

    /// DPMS off, tolerating an unplugged sink.
    pub fn dpms_power_off(&mut self) -> Result<(), DisplayError> {
        match self.check_status() {
            Ok(()) => {}
            // During DPMS transitions some sinks blink through a
            // disconnected state; that is not an error here.
            Err(DisplayError::NoDevice) => return Ok(()),
            Err(err) => return Err(err),
        }
        self.ensure_dpms_power(false);
        Ok(())
    }

    /// Wait for the pending flip's vsync event, bounded by the configured
    /// timeout. A no-op when nothing is pending or the platform delivers
    /// no events.
    pub fn wait_for_vsync(&mut self) -> Result<(), DisplayError> {
        self.blank_at = None;
        self.check_status()?;
        self.ensure_dpms_power(true);

        if self.has_vsync {
            return Ok(());
        }
        if self.platform == Platform::Amlogic {
            debug!("skipping vsync wait on this platform");
            self.has_vsync = true;
            return Ok(());
        }

        debug!("waiting for vsync event");
        match self.device.wait_event(self.options.timeout)? {
            Some(event) => {
                debug!(token = event.token, "got vsync signal");
                self.has_vsync = true;
                self.exposing_dma_fd = None;
                Ok(())
            }
            None => {
                error!("device timeout while waiting for vsync");
                Err(DisplayError::Timeout)
            }
        }
    }

    fn check_status(&mut self) -> Result<(), DisplayError> {
        let Some(port) = self.port.clone() else {
            debug!("skipping status check, port not yet detected");
            return Ok(());
        };
        match self.device.connector_status(&port)? {
            ConnectorStatus::Disconnected => Err(DisplayError::NoDevice),
            _ => Ok(()),
        }
    }

    fn ensure_dpms_power(&mut self, on: bool) {
        if let Some(dpms_id) = self.dpms_id {
            if self.dpms_state != Some(on) {
                info!(on, "changing DPMS power mode");
                let value = if on { DPMS_ON } else { DPMS_OFF };
                if let Err(err) = self
                    .device
                    .set_connector_property(self.conn_id, dpms_id, value)
                {
                    error!("can't set DPMS power={on} (ignored): {err}");
                }
            }
        }
        self.dpms_state = Some(on);
    }

    fn find_sink(&mut self, width: u32, height: u32, hz: f32) -> Result<(), DisplayError> {
        self.crtc_id = 0;
        debug!("looking for an appropriate sink");

        let res = self.device.resources()?;
        if res.connectors.is_empty() {
            return Err(DisplayError::Device("no connectors".into()));
        }

        for conn_id in &res.connectors {
            let conn = self.device.connector(*conn_id)?;
            let port = conn.port_name();

            if let Some(want) = &self.options.port {
                if *want != port {
                    continue;
                }
                info!(port, "using configured connector");
                if !conn.connected {
                    error!("connector for port {port} is not connected");
                    return Err(DisplayError::Device("connector is not connected".into()));
                }
            } else {
                if !conn.connected {
                    continue;
                }
                self.port = Some(port.clone());
                info!(port, "auto-detected connector");
            }

            let best = match find_best_mode(&conn.modes, width, height, hz) {
                Some(mode) => mode,
                None => {
                    error!("can't find any appropriate display modes");
                    return Err(DisplayError::NoDevice);
                }
            };
            info!(
                "using best mode: {}x{}p{:.2}",
                best.hdisplay,
                best.vdisplay,
                best.refresh_hz()
            );

            self.dpms_id = conn
                .properties
                .iter()
                .find(|prop| prop.name == "DPMS")
                .map(|prop| prop.id);
            match self.dpms_id {
                Some(id) => info!(id, "using DPMS"),
                None => info!("using DPMS: none"),
            }

            self.crtc_id = self
                .find_crtc(&res, &conn)?
                .ok_or_else(|| DisplayError::Device("can't find CRTC".into()))?;
            info!(crtc = self.crtc_id, "using CRTC");

            self.conn_id = conn.id;
            self.mode = best;
            break;
        }

        if self.crtc_id == 0 {
            return Err(DisplayError::Device("no usable sink".into()));
        }
        Ok(())
    }

    fn find_crtc(
        &self,
        res: &Resources,
        conn: &ConnectorInfo,
    ) -> Result<Option<u32>, DisplayError> {
        let mut taken: u32 = 0;
        for enc_id in &conn.encoders {
            let enc = match self.device.encoder(*enc_id) {
                Ok(enc) => enc,
                Err(_) => continue,
            };
            for (ci, crtc_id) in res.crtcs.iter().enumerate() {
                let bit = 1u32 << ci;
                if enc.possible_crtcs & bit == 0 || taken & bit != 0 {
                    continue;
                }
                taken |= bit;
                return Ok(Some(*crtc_id));
            }
        }
        Ok(None)
    }

    fn init_buffers(&mut self, cap: Option<&SourceDescriptor>) -> Result<(), DisplayError> {
        let n_bufs = cap.map(|c| c.buffers.len()).unwrap_or(STUB_FRAMEBUFFERS);
        debug!(
            n_bufs,
            kind = if cap.is_some() { "DMA" } else { "STUB" },
            "initializing framebuffers"
        );

        let (mode_w, mode_h) = (self.mode.hdisplay as u32, self.mode.vdisplay as u32);
        let (stub_format, stub_bpp) = if self.platform == Platform::Amlogic {
            info!("using 32-bit dumb buffers for this platform");
            (PixelFormat::XRGB8888, 32u32)
        } else {
            (PixelFormat::RGB888, 24u32)
        };
        self.detected_bpp = stub_bpp;

        for n_buf in 0..n_bufs {
            let buf = match cap {
                None => self.create_stub_buffer(n_buf, mode_w, mode_h, stub_format, stub_bpp)?,
                Some(src) => self.create_dma_buffer(n_buf, src, mode_w, mode_h)?,
            };
            self.bufs.push(buf);
        }
        Ok(())
    }

    fn create_stub_buffer(
        &mut self,
        n_buf: usize,
        mode_w: u32,
        mode_h: u32,
        format: PixelFormat,
        bpp: u32,
    ) -> Result<Framebuffer, DisplayError> {
        let dumb = self.device.create_dumb(mode_w, mode_h, bpp)?;
        let map = self.device.map_dumb(dumb.handle)?;

        let fb = if self.platform == Platform::Amlogic {
            self.device
                .add_framebuffer(mode_w, mode_h, 24, 32, dumb.pitch, dumb.handle)
        } else {
            self.device.add_framebuffer2(
                mode_w,
                mode_h,
                format,
                [dumb.handle, 0, 0, 0],
                [dumb.pitch, 0, 0, 0],
                [0; 4],
            )
        };
        match fb {
            Ok(fb_id) => Ok(Framebuffer {
                fb_id,
                handle: dumb.handle,
                pitch: dumb.pitch,
                bpp,
                map: Some(map),
                dumb_created: true,
                fb_added: true,
                source_dma_fd: None,
            }),
            Err(_) => {
                debug!("preferred stub format failed, trying fallbacks");
                drop(map);
                self.device.destroy_dumb(dumb.handle)?;
                self.stub_fallback_ladder(n_buf, mode_w, mode_h)
            }
        }
    }

    /// Retry the stub surface as XRGB8888 and then RGB565, remembering the
    /// depth that finally worked for the conversion path.
    fn stub_fallback_ladder(
        &mut self,
        n_buf: usize,
        mode_w: u32,
        mode_h: u32,
    ) -> Result<Framebuffer, DisplayError> {
        for (bpp, name) in [(32u32, "XRGB8888"), (16u32, "RGB565")] {
            let dumb = match self.device.create_dumb(mode_w, mode_h, bpp) {
                Ok(dumb) => dumb,
                Err(_) => continue,
            };
            let map = match self.device.map_dumb(dumb.handle) {
                Ok(map) => map,
                Err(_) => {
                    let _ = self.device.destroy_dumb(dumb.handle);
                    continue;
                }
            };
            match self
                .device
                .add_framebuffer(mode_w, mode_h, bpp, bpp, dumb.pitch, dumb.handle)
            {
                Ok(fb_id) => {
                    info!(name, bpp, "using fallback stub format");
                    self.detected_bpp = bpp;
                    return Ok(Framebuffer {
                        fb_id,
                        handle: dumb.handle,
                        pitch: dumb.pitch,
                        bpp,
                        map: Some(map),
                        dumb_created: true,
                        fb_added: true,
                        source_dma_fd: None,
                    });
                }
                Err(_) => {
                    drop(map);
                    let _ = self.device.destroy_dumb(dumb.handle);
                }
            }
        }
        error!("can't set up stub framebuffer {n_buf} in any format");
        Err(DisplayError::Device("no usable framebuffer format".into()))
    }

    fn create_dma_buffer(
        &mut self,
        n_buf: usize,
        src: &SourceDescriptor,
        mode_w: u32,
        mode_h: u32,
    ) -> Result<Framebuffer, DisplayError> {
        let source = src
            .buffers
            .get(n_buf)
            .ok_or(DisplayError::InvalidParam("missing capture buffer"))?;

        // PRIME import is skipped where scan-out of imported buffers is
        // known-broken; a failed import falls back in the same call.
        if self.platform != Platform::Amlogic {
            debug!(n_buf, "attempting DMA buffer import");
            match self.device.import_dma(source.dma_fd) {
                Ok(handle) => {
                    let format = match src.format {
                        PixelFormat::RGB24 => PixelFormat::RGB888,
                        PixelFormat::BGR24 => PixelFormat::BGR888,
                        PixelFormat::YUYV => PixelFormat::YUYV,
                        _ => PixelFormat::XRGB8888,
                    };
                    let fb_id = self.device.add_framebuffer2(
                        src.width,
                        src.height,
                        format,
                        [handle, 0, 0, 0],
                        [src.stride, 0, 0, 0],
                        [0; 4],
                    )?;
                    debug!(n_buf, "DMA buffer import successful");
                    return Ok(Framebuffer {
                        fb_id,
                        handle,
                        pitch: src.stride,
                        bpp: 0,
                        map: None,
                        dumb_created: false,
                        fb_added: true,
                        source_dma_fd: Some(source.dma_fd),
                    });
                }
                Err(err) => debug!(n_buf, "DMA import failed ({err}), using dumb fallback"),
            }
        } else {
            debug!(n_buf, "skipping DMA import on this platform");
        }

        let bpp = if self.platform == Platform::Amlogic { 32 } else { 24 };
        let dumb = self.device.create_dumb(mode_w, mode_h, bpp)?;
        let map = self.device.map_dumb(dumb.handle)?;
        let fb_id = if self.platform == Platform::Amlogic {
            self.device
                .add_framebuffer(mode_w, mode_h, 24, 32, dumb.pitch, dumb.handle)?
        } else {
            self.device.add_framebuffer2(
                mode_w,
                mode_h,
                PixelFormat::RGB888,
                [dumb.handle, 0, 0, 0],
                [dumb.pitch, 0, 0, 0],
                [0; 4],
            )?
        };
        Ok(Framebuffer {
            fb_id,
            handle: dumb.handle,
            pitch: dumb.pitch,
            bpp,
            map: Some(map),
            dumb_created: true,
            fb_added: true,
            source_dma_fd: Some(source.dma_fd),
        })
    }
}

impl Drop for Display {
    fn drop(&mut self) {
        if self.opened.is_some() {
            self.close();
        }
    }
}

fn detect_platform(driver: &str) -> Platform {
    if driver.contains("vc4") {
        Platform::Rpi
    } else if driver.contains("meson") {
        Platform::Amlogic
    } else {
        Platform::Generic
    }
}

fn find_best_mode(modes: &[ModeInfo], width: u32, height: u32, hz: f32) -> Option<ModeInfo> {
    let mut best: Option<ModeInfo> = None;
    let mut closest: Option<ModeInfo> = None;
    let mut preferred: Option<ModeInfo> = None;

    for mode in modes {
        if mode.interlace {
            continue;
        }
        let mode_hz = mode.refresh_hz();
        // Some ancient DOS-era sources emit 640x416 through a VGA
        // converter; show them on a 640x480 mode with the extra lines
        // blanked.
        if width == 640 && height == 416 && mode.hdisplay == 640 && mode.vdisplay == 480 {
            if hz > 0.0 && mode_hz < hz {
                let mut coerced = *mode;
                coerced.vdisplay = 416;
                best = Some(coerced);
                break;
            }
        }
        if mode.hdisplay as u32 == width && mode.vdisplay as u32 == height {
            best = Some(*mode);
            if hz > 0.0 && mode_hz == hz {
                break;
            }
        }
        if mode.hdisplay as u32 == width && (mode.vdisplay as u32) < height {
            let keep = match &closest {
                None => true,
                Some(current) => current.refresh_hz() != hz,
            };
            if keep {
                closest = Some(*mode);
            }
        }
        if preferred.is_none() && mode.preferred {
            preferred = Some(*mode);
        }
    }

    best.or(closest).or(preferred).or_else(|| modes.first().copied())
}

/// Convert a live frame into a CPU-writable framebuffer, centered.
fn scanout_convert(
    raw: &Frame,
    map: &mut [u8],
    pitch: usize,
    bpp: u32,
    mode_w: u32,
    mode_h: u32,
) -> Result<(), DisplayError> {
    let bpp = match bpp {
        32 => 4usize,
        24 => 3usize,
        _ => return Err(DisplayError::Unsupported("scan-out depth for live frames")),
    };
    map.fill(0);
    let center = Center::fit(raw.width, raw.height, mode_w, mode_h).unwrap_or(Center::NONE);
    let mut target = ScanoutTarget {
        data: map,
        stride: pitch,
        bpp,
        width: mode_w,
        height: mode_h,
    };

    let result = match raw.format {
        PixelFormat::YUYV => {
            convert::yuyv_to_scanout(raw.data(), raw.width, raw.height, &mut target, center)
        }
        PixelFormat::RGB24 => {
            convert::rgb24_to_scanout(raw.data(), raw.width, raw.height, &mut target, center)
        }
        PixelFormat::BGR24 => {
            convert::bgr24_to_scanout(raw.data(), raw.width, raw.height, &mut target, center)
        }
        PixelFormat::MJPEG | PixelFormat::JPEG => {
            let mut decoded = Frame::new();
            match jpeg::decode_rgb(raw, &mut decoded) {
                Ok(()) => {
                    let center =
                        Center::fit(decoded.width, decoded.height, mode_w, mode_h)
                            .unwrap_or(Center::NONE);
                    convert::rgb24_to_scanout(
                        decoded.data(),
                        decoded.width,
                        decoded.height,
                        &mut target,
                        center,
                    )
                }
                Err(err) => {
                    // Leave the buffer black rather than showing garbage.
                    error!("can't decode MJPEG frame for display: {err}");
                    return Ok(());
                }
            }
        }
        other => {
            error!("unsupported format {other} for display conversion");
            return Err(DisplayError::Unsupported("capture format for conversion"));
        }
    };
    result.map_err(|err| DisplayError::Device(err.to_string()))
}

/// Copy the RGB24 stub overlay into a framebuffer of any supported depth.
fn copy_stub(
    frame: &Frame,
    map: &mut [u8],
    pitch: usize,
    bpp: u32,
    mode_w: u32,
    mode_h: u32,
) -> Result<(), DisplayError> {
    match bpp {
        24 => {
            let src_stride = frame.stride as usize;
            let row = src_stride.min(pitch);
            for y in 0..(frame.height as usize).min(mode_h as usize) {
                let src = &frame.data()[y * src_stride..][..row];
                map[y * pitch..y * pitch + row].copy_from_slice(src);
            }
            Ok(())
        }
        32 => {
            let mut target = ScanoutTarget {
                data: map,
                stride: pitch,
                bpp: 4,
                width: mode_w,
                height: mode_h,
            };
            convert::rgb24_to_scanout(
                frame.data(),
                frame.width,
                frame.height,
                &mut target,
                Center::NONE,
            )
            .map_err(|err| DisplayError::Device(err.to_string()))
        }
        16 => {
            let src_stride = frame.stride as usize;
            for y in 0..(frame.height as usize).min(mode_h as usize) {
                let src = &frame.data()[y * src_stride..][..src_stride];
                let dst = &mut map[y * pitch..];
                for x in 0..(frame.width as usize).min(mode_w as usize) {
                    let r = src[x * 3] as u16;
                    let g = src[x * 3 + 1] as u16;
                    let b = src[x * 3 + 2] as u16;
                    let px = (r >> 3) << 11 | (g >> 2) << 5 | (b >> 3);
                    dst[x * 2..x * 2 + 2].copy_from_slice(&px.to_le_bytes());
                }
            }
            Ok(())
        }
        _ => Err(DisplayError::Unsupported("stub framebuffer depth")),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex as StdMutex};

    use super::*;
    use crate::modeset::{ConnectorKind, ConnectorProperty, DumbBuffer, EncoderInfo, FlipEvent};

    const DPMS_PROP_ID: u32 = 42;

    struct FakeClock(StdMutex<Duration>);

    impl FakeClock {
        fn new() -> Arc<Self> {
            Arc::new(Self(StdMutex::new(Duration::ZERO)))
        }

        fn set(&self, at: Duration) {
            *self.0.lock().unwrap() = at;
        }
    }

    impl MonotonicClock for FakeClock {
        fn now(&self) -> Duration {
            *self.0.lock().unwrap()
        }
    }

    #[derive(Default)]
    struct FakeState {
        driver: String,
        status: ConnectorStatus,
        connectors: Vec<ConnectorInfo>,
        encoders: Vec<EncoderInfo>,
        crtcs: Vec<u32>,
        crtc_initial: Option<CrtcState>,
        import_ok: bool,
        fail_fb2: bool,
        next_id: u32,
        dumbs: HashMap<u32, usize>,
        set_crtc_calls: Vec<CrtcState>,
        flips: Vec<(u32, bool, usize)>,
        events: VecDeque<FlipEvent>,
        prop_writes: Vec<(u32, u32, u64)>,
        destroyed_dumbs: Vec<u32>,
        removed_fbs: Vec<u32>,
        imported: Vec<i32>,
    }

    struct FakeDevice(Arc<StdMutex<FakeState>>);

    struct FakeMap {
        data: Vec<u8>,
    }

    impl MappedDumb for FakeMap {
        fn data(&mut self) -> &mut [u8] {
            &mut self.data
        }

        fn len(&self) -> usize {
            self.data.len()
        }
    }

    impl ModesetDevice for FakeDevice {
        fn driver_name(&self) -> String {
            self.0.lock().unwrap().driver.clone()
        }

        fn drop_master(&mut self) -> Result<(), DisplayError> {
            Ok(())
        }

        fn set_master(&mut self) -> Result<(), DisplayError> {
            Ok(())
        }

        fn has_capability(&self, _cap: Capability) -> Result<bool, DisplayError> {
            Ok(true)
        }

        fn connector_status(&self, _port: &str) -> Result<ConnectorStatus, DisplayError> {
            Ok(self.0.lock().unwrap().status)
        }

        fn resources(&self) -> Result<Resources, DisplayError> {
            let state = self.0.lock().unwrap();
            Ok(Resources {
                connectors: state.connectors.iter().map(|c| c.id).collect(),
                encoders: state.encoders.iter().map(|e| e.id).collect(),
                crtcs: state.crtcs.clone(),
            })
        }

        fn connector(&self, id: u32) -> Result<ConnectorInfo, DisplayError> {
            self.0
                .lock()
                .unwrap()
                .connectors
                .iter()
                .find(|c| c.id == id)
                .cloned()
                .ok_or_else(|| DisplayError::Device("unknown connector".into()))
        }

        fn encoder(&self, id: u32) -> Result<EncoderInfo, DisplayError> {
            self.0
                .lock()
                .unwrap()
                .encoders
                .iter()
                .find(|e| e.id == id)
                .copied()
                .ok_or_else(|| DisplayError::Device("unknown encoder".into()))
        }

        fn crtc(&self, id: u32) -> Result<CrtcState, DisplayError> {
            let state = self.0.lock().unwrap();
            let mut initial = state
                .crtc_initial
                .clone()
                .ok_or_else(|| DisplayError::Device("no crtc".into()))?;
            initial.crtc_id = id;
            Ok(initial)
        }

        fn set_crtc(
            &mut self,
            crtc_id: u32,
            fb_id: u32,
            x: u32,
            y: u32,
            _connectors: &[u32],
            mode: Option<&ModeInfo>,
        ) -> Result<(), DisplayError> {
            self.0.lock().unwrap().set_crtc_calls.push(CrtcState {
                crtc_id,
                fb_id,
                x,
                y,
                mode: mode.copied(),
            });
            Ok(())
        }

        fn set_connector_property(
            &mut self,
            connector_id: u32,
            property_id: u32,
            value: u64,
        ) -> Result<(), DisplayError> {
            self.0
                .lock()
                .unwrap()
                .prop_writes
                .push((connector_id, property_id, value));
            Ok(())
        }

        fn create_dumb(
            &mut self,
            width: u32,
            height: u32,
            bpp: u32,
        ) -> Result<DumbBuffer, DisplayError> {
            let mut state = self.0.lock().unwrap();
            state.next_id += 1;
            let handle = state.next_id;
            let pitch = width * bpp / 8;
            let size = (pitch * height) as usize;
            state.dumbs.insert(handle, size);
            Ok(DumbBuffer {
                handle,
                pitch,
                size,
            })
        }

        fn map_dumb(&mut self, handle: u32) -> Result<Box<dyn MappedDumb>, DisplayError> {
            let size = *self
                .0
                .lock()
                .unwrap()
                .dumbs
                .get(&handle)
                .ok_or_else(|| DisplayError::Device("unknown dumb".into()))?;
            Ok(Box::new(FakeMap {
                data: vec![0; size],
            }))
        }

        fn destroy_dumb(&mut self, handle: u32) -> Result<(), DisplayError> {
            let mut state = self.0.lock().unwrap();
            state.dumbs.remove(&handle);
            state.destroyed_dumbs.push(handle);
            Ok(())
        }

        fn import_dma(&mut self, dma_fd: i32) -> Result<u32, DisplayError> {
            let mut state = self.0.lock().unwrap();
            if !state.import_ok {
                return Err(DisplayError::Device("import refused".into()));
            }
            state.next_id += 1;
            state.imported.push(dma_fd);
            Ok(state.next_id)
        }

        fn add_framebuffer(
            &mut self,
            _width: u32,
            _height: u32,
            _depth: u32,
            _bpp: u32,
            _pitch: u32,
            _handle: u32,
        ) -> Result<u32, DisplayError> {
            let mut state = self.0.lock().unwrap();
            state.next_id += 1;
            Ok(state.next_id)
        }

        fn add_framebuffer2(
            &mut self,
            _width: u32,
            _height: u32,
            _format: PixelFormat,
            _handles: [u32; 4],
            _pitches: [u32; 4],
            _offsets: [u32; 4],
        ) -> Result<u32, DisplayError> {
            let mut state = self.0.lock().unwrap();
            if state.fail_fb2 {
                return Err(DisplayError::Device("format refused".into()));
            }
            state.next_id += 1;
            Ok(state.next_id)
        }

        fn remove_framebuffer(&mut self, fb_id: u32) -> Result<(), DisplayError> {
            self.0.lock().unwrap().removed_fbs.push(fb_id);
            Ok(())
        }

        fn page_flip(
            &mut self,
            _crtc_id: u32,
            fb_id: u32,
            flags: PageFlipFlags,
            token: usize,
        ) -> Result<(), DisplayError> {
            let mut state = self.0.lock().unwrap();
            state.flips.push((fb_id, flags.asynchronous, token));
            if flags.event {
                state.events.push_back(FlipEvent { token });
            }
            Ok(())
        }

        fn wait_event(&mut self, _timeout: Duration) -> Result<Option<FlipEvent>, DisplayError> {
            Ok(self.0.lock().unwrap().events.pop_front())
        }
    }

    fn mode(width: u16, height: u16, hz: u32, preferred: bool) -> ModeInfo {
        ModeInfo {
            hdisplay: width,
            vdisplay: height,
            htotal: 1000,
            vtotal: 1000,
            clock_khz: hz * 1000,
            vscan: 0,
            interlace: false,
            doublescan: false,
            preferred,
        }
    }

    fn hdmi(id: u32, connected: bool, modes: Vec<ModeInfo>) -> ConnectorInfo {
        ConnectorInfo {
            id,
            kind: ConnectorKind::HdmiA,
            kind_id: 1,
            connected,
            modes,
            encoders: vec![11],
            properties: vec![ConnectorProperty {
                id: DPMS_PROP_ID,
                name: "DPMS".into(),
            }],
        }
    }

    fn fake(driver: &str, modes: Vec<ModeInfo>) -> (Arc<StdMutex<FakeState>>, Arc<FakeClock>, Display) {
        let state = Arc::new(StdMutex::new(FakeState {
            driver: driver.into(),
            status: ConnectorStatus::Connected,
            connectors: vec![hdmi(5, true, modes)],
            encoders: vec![EncoderInfo {
                id: 11,
                possible_crtcs: 0b1,
            }],
            crtcs: vec![30],
            crtc_initial: Some(CrtcState {
                crtc_id: 30,
                fb_id: 7,
                x: 0,
                y: 0,
                mode: Some(mode(1024, 768, 60, false)),
            }),
            import_ok: true,
            ..FakeState::default()
        }));
        let clock = FakeClock::new();
        let display = Display::with_clock(
            Box::new(FakeDevice(state.clone())),
            DisplayOptions::default(),
            clock.clone(),
        );
        (state, clock, display)
    }

    fn yuyv_source(width: u32, height: u32, n_bufs: u32) -> SourceDescriptor {
        SourceDescriptor {
            width,
            height,
            hz: 60.0,
            format: PixelFormat::YUYV,
            stride: width * 2,
            buffers: (0..n_bufs)
                .map(|index| SourceBuffer {
                    index,
                    dma_fd: 100 + index as i32,
                })
                .collect(),
        }
    }

    fn yuyv_raw(width: u32, height: u32) -> Frame {
        let mut frame = Frame::new();
        frame.width = width;
        frame.height = height;
        frame.stride = width * 2;
        frame.format = PixelFormat::YUYV;
        let len = (width * height * 2) as usize;
        let payload = frame.payload_mut(len).unwrap();
        payload.fill(0x80);
        frame
    }

    #[test]
    fn stub_open_saves_and_restores_crtc() {
        let (state, _, mut display) = fake("i915", vec![mode(1280, 720, 60, true)]);
        assert_eq!(display.open(None).unwrap(), OpenMode::Stub(StubCause::NoSource));
        assert_eq!(display.port(), Some("HDMI-A-1"));

        display.close();
        let state = state.lock().unwrap();
        // First call is the open's modeset, last is the restoration.
        let restore = state.set_crtc_calls.last().unwrap();
        assert_eq!(
            *restore,
            CrtcState {
                crtc_id: 30,
                fb_id: 7,
                x: 0,
                y: 0,
                mode: Some(mode(1024, 768, 60, false)),
            }
        );
        assert_eq!(state.removed_fbs.len(), STUB_FRAMEBUFFERS);
        assert_eq!(state.destroyed_dumbs.len(), STUB_FRAMEBUFFERS);
    }

    #[test]
    fn mode_scoring_order() {
        let modes = vec![
            mode(1920, 1080, 60, true),
            mode(1280, 720, 60, false),
            mode(1280, 720, 50, false),
        ];

        let exact = find_best_mode(&modes, 1280, 720, 50.0).unwrap();
        assert_eq!((exact.vdisplay, exact.refresh_hz() as u32), (720, 50));

        let same_width = find_best_mode(&modes, 1280, 800, 60.0).unwrap();
        assert_eq!((same_width.hdisplay, same_width.vdisplay), (1280, 720));

        let preferred = find_best_mode(&modes, 800, 600, 60.0).unwrap();
        assert_eq!(preferred.hdisplay, 1920);

        let mut interlaced = mode(800, 600, 60, false);
        interlaced.interlace = true;
        let skipped = find_best_mode(&[interlaced, mode(640, 480, 60, false)], 800, 600, 60.0);
        assert_eq!(skipped.unwrap().hdisplay, 640);
    }

    #[test]
    fn ancient_vga_source_coerces_640x480() {
        let modes = vec![mode(640, 480, 60, false)];
        let coerced = find_best_mode(&modes, 640, 416, 70.0).unwrap();
        assert_eq!((coerced.hdisplay, coerced.vdisplay), (640, 416));
    }

    #[test]
    fn stub_flips_round_robin() {
        let (state, _, mut display) = fake("i915", vec![mode(640, 480, 60, true)]);
        display.open(None).unwrap();
        for _ in 0..5 {
            display.expose_stub(StubKind::NoSignal).unwrap();
        }
        let state = state.lock().unwrap();
        let tokens: Vec<usize> = state.flips.iter().map(|f| f.2).collect();
        assert_eq!(tokens, vec![0, 1, 2, 3, 0]);
        assert!(state.flips.iter().all(|f| f.1), "stub flips are async");
    }

    #[test]
    fn no_signal_blanks_after_deadline() {
        let (state, clock, mut display) = fake("i915", vec![mode(640, 480, 60, true)]);
        display.open(None).unwrap();

        display.ensure_no_signal().unwrap();
        clock.set(Duration::from_secs(2));
        display.ensure_no_signal().unwrap();
        {
            let state = state.lock().unwrap();
            assert_eq!(state.flips.len(), 2, "stub shown until the deadline");
            assert_eq!(
                state
                    .prop_writes
                    .iter()
                    .filter(|w| w.2 == DPMS_OFF)
                    .count(),
                0
            );
        }

        clock.set(Duration::from_secs(6));
        display.ensure_no_signal().unwrap();
        display.ensure_no_signal().unwrap();
        let state = state.lock().unwrap();
        assert_eq!(state.flips.len(), 2, "no more stubs after the deadline");
        let offs: Vec<_> = state
            .prop_writes
            .iter()
            .filter(|w| w.2 == DPMS_OFF)
            .collect();
        assert_eq!(offs.len(), 1, "DPMS off is written exactly once");
        assert_eq!(offs[0].1, DPMS_PROP_ID);
    }

    #[test]
    fn disconnect_during_dma_returns_no_device() {
        let (state, _, mut display) = fake("vc4", vec![mode(640, 480, 60, true)]);
        let source = yuyv_source(640, 480, 3);
        assert_eq!(display.open(Some(&source)).unwrap(), OpenMode::Dma);
        assert_eq!(display.platform(), Platform::Rpi);
        assert_eq!(state.lock().unwrap().imported, vec![100, 101, 102]);

        state.lock().unwrap().status = ConnectorStatus::Disconnected;
        let raw = yuyv_raw(640, 480);
        let hw = HwFrame {
            index: 0,
            dma_fd: 100,
            raw: &raw,
        };
        assert!(matches!(display.expose_dma(&hw), Err(DisplayError::NoDevice)));
        assert!(state.lock().unwrap().flips.is_empty(), "no flip after unplug");
    }

    #[test]
    fn vsync_event_releases_the_dma_pin() {
        let (_, _, mut display) = fake("vc4", vec![mode(640, 480, 60, true)]);
        let source = yuyv_source(640, 480, 2);
        display.open(Some(&source)).unwrap();

        let raw = yuyv_raw(640, 480);
        let hw = HwFrame {
            index: 1,
            dma_fd: 101,
            raw: &raw,
        };
        display.expose_dma(&hw).unwrap();
        assert_eq!(display.exposing_dma(), Some(101));

        display.wait_for_vsync().unwrap();
        assert_eq!(display.exposing_dma(), None);
    }

    #[test]
    fn import_failure_falls_back_to_dumb_buffers() {
        let (state, _, mut display) = fake("i915", vec![mode(640, 480, 60, true)]);
        state.lock().unwrap().import_ok = false;
        let source = yuyv_source(640, 480, 3);
        assert_eq!(display.open(Some(&source)).unwrap(), OpenMode::Dma);
        assert_eq!(state.lock().unwrap().dumbs.len(), 3);

        let raw = yuyv_raw(640, 480);
        let hw = HwFrame {
            index: 0,
            dma_fd: 100,
            raw: &raw,
        };
        display.expose_dma(&hw).unwrap();
        assert_eq!(state.lock().unwrap().flips.len(), 1);
    }

    #[test]
    fn oversized_capture_opens_as_stub_and_still_draws() {
        let (state, _, mut display) = fake("i915", vec![mode(1280, 720, 60, true)]);
        let source = yuyv_source(1920, 1200, 3);
        assert_eq!(
            display.open(Some(&source)).unwrap(),
            OpenMode::Stub(StubCause::BadResolution)
        );
        display
            .expose_stub(StubKind::BadResolution {
                width: 1920,
                height: 1200,
                hz: 60.0,
            })
            .unwrap();
        assert_eq!(state.lock().unwrap().flips.len(), 1);
    }

    #[test]
    fn unsupported_capture_format_opens_as_stub() {
        let (_, _, mut display) = fake("i915", vec![mode(640, 480, 60, true)]);
        let mut source = yuyv_source(640, 480, 2);
        source.format = PixelFormat::NV12;
        assert_eq!(
            display.open(Some(&source)).unwrap(),
            OpenMode::Stub(StubCause::BadFormat)
        );
    }

    #[test]
    fn stub_format_fallback_remembers_depth() {
        let (state, _, mut display) = fake("i915", vec![mode(640, 480, 60, true)]);
        state.lock().unwrap().fail_fb2 = true;
        display.open(None).unwrap();
        // AddFB2 refused; the legacy 32-bit rung succeeded.
        assert_eq!(display.detected_bpp(), 32);
        display.expose_stub(StubKind::Busy).unwrap();
    }

    #[test]
    fn amlogic_converts_and_sets_crtc() {
        let (state, _, mut display) = fake("meson", vec![mode(640, 480, 60, true)]);
        let source = yuyv_source(640, 480, 2);
        assert_eq!(display.open(Some(&source)).unwrap(), OpenMode::Dma);
        assert_eq!(display.platform(), Platform::Amlogic);
        // No imports on this platform, dumb fallbacks instead.
        assert!(state.lock().unwrap().imported.is_empty());

        let raw = yuyv_raw(320, 240);
        let hw = HwFrame {
            index: 0,
            dma_fd: 100,
            raw: &raw,
        };
        display.expose_centered(&hw).unwrap();
        let state_guard = state.lock().unwrap();
        assert_eq!(state_guard.set_crtc_calls.len(), 2, "open + expose");
        assert!(state_guard.flips.is_empty(), "no page flips on this path");
        drop(state_guard);

        // Flip events are unreliable; the engine self-marks vsync.
        display.wait_for_vsync().unwrap();
    }

    #[test]
    fn amlogic_oversized_source_degrades_to_stub() {
        let (state, _, mut display) = fake("meson", vec![mode(640, 480, 60, true)]);
        let source = yuyv_source(640, 480, 2);
        display.open(Some(&source)).unwrap();

        let raw = yuyv_raw(800, 600);
        let hw = HwFrame {
            index: 0,
            dma_fd: 100,
            raw: &raw,
        };
        display.expose_centered(&hw).unwrap();
        assert_eq!(state.lock().unwrap().flips.len(), 1, "stub flip queued");
    }
}
