//! The steady-state pump: capture → transcode → publish, with the local
//! display driven alongside.

use std::sync::Arc;

use scanline_codec::prelude::{CodecError, Transcoder, TranscoderStats, VendorLibrary};
use scanline_core::prelude::Frame;
use scanline_display::prelude::{Display, DisplayError, HwFrame, OpenMode};
use tracing::{debug, info, warn};

use crate::capture::{CaptureError, CaptureSource, CaptureState};
use crate::config::NodeConfig;
use crate::sink::{MemorySink, SinkError};

/// Errors that stop a pipeline iteration.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Display(#[from] DisplayError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error("pipeline is not open")]
    NotOpen,
}

/// Counters over the pipeline's lifetime.
#[derive(Clone, Copy, Debug, Default)]
pub struct PipelineStats {
    pub frames_captured: u64,
    pub frames_published: u64,
    pub frames_displayed: u64,
    pub codec_errors: u64,
    pub transcoder_restarts: u64,
}

/// One capture source, one transcoder, optional display, optional sinks.
///
/// The owner calls [`run_once`] from its pump thread; internally serial
/// components carry their own locks.
///
/// [`run_once`]: PassthroughPipeline::run_once
pub struct PassthroughPipeline {
    source: Box<dyn CaptureSource>,
    library: Arc<dyn VendorLibrary>,
    config: NodeConfig,

    state: Option<CaptureState>,
    transcoder: Option<Transcoder>,
    display: Option<Display>,
    display_open: bool,
    h264_sink: Option<Box<dyn MemorySink>>,
    raw_sink: Option<Box<dyn MemorySink>>,

    encoded: Frame,
    force_key: bool,
    consecutive_errors: u32,
    stats: PipelineStats,
}

impl PassthroughPipeline {
    pub fn new(
        source: Box<dyn CaptureSource>,
        library: Arc<dyn VendorLibrary>,
        config: NodeConfig,
    ) -> Self {
        Self {
            source,
            library,
            config,
            state: None,
            transcoder: None,
            display: None,
            display_open: false,
            h264_sink: None,
            raw_sink: None,
            encoded: Frame::new(),
            force_key: true,
            consecutive_errors: 0,
            stats: PipelineStats::default(),
        }
    }

    /// Attach the local display engine.
    pub fn with_display(mut self, display: Display) -> Self {
        self.display = Some(display);
        self
    }

    /// Attach the H.264 sink.
    pub fn with_h264_sink(mut self, sink: Box<dyn MemorySink>) -> Self {
        self.h264_sink = Some(sink);
        self
    }

    /// Attach the raw-frame sink.
    pub fn with_raw_sink(mut self, sink: Box<dyn MemorySink>) -> Self {
        self.raw_sink = Some(sink);
        self
    }

    /// Open the capture source and build the transcoding chain.
    pub fn open(&mut self) -> Result<(), PipelineError> {
        let state = self.source.open()?;
        info!(
            width = state.width,
            height = state.height,
            format = %state.format,
            n_bufs = state.n_bufs(),
            "capture source opened"
        );

        self.transcoder = Some(Transcoder::new(
            self.library.clone(),
            state.width,
            state.height,
            self.config.encoder.tuning(),
        )?);
        self.open_display(&state);
        self.state = Some(state);
        self.force_key = true;
        Ok(())
    }

    fn open_display(&mut self, state: &CaptureState) {
        let Some(display) = self.display.as_mut() else {
            return;
        };
        if !self.config.display.enabled {
            return;
        }
        match display.open(Some(&state.descriptor())) {
            Ok(mode) => {
                info!(?mode, "display attached");
                self.display_open = true;
            }
            Err(DisplayError::NoDevice) => {
                debug!("display unplugged, waiting for replug");
                self.display_open = false;
            }
            Err(err) => {
                warn!("display open failed ({err}), continuing headless");
                self.display_open = false;
            }
        }
    }

    /// Request that the next encoded frame is a keyframe.
    pub fn request_keyframe(&mut self) {
        self.force_key = true;
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn transcoder_stats(&self) -> Option<TranscoderStats> {
        self.transcoder.as_ref().map(|t| t.stats())
    }

    /// Process at most one captured frame. Returns `false` when the
    /// source had nothing, after running the no-signal policy.
    pub fn run_once(&mut self) -> Result<bool, PipelineError> {
        if self.state.is_none() {
            return Err(PipelineError::NotOpen);
        }

        let Some(buf) = self.source.poll()? else {
            if self.display_open {
                if let Some(display) = self.display.as_mut() {
                    match display.ensure_no_signal() {
                        Ok(()) | Err(DisplayError::Timeout) => {}
                        Err(DisplayError::NoDevice) => {
                            debug!("display unplugged, waiting for replug");
                            display.close();
                            self.display_open = false;
                        }
                        Err(err) => warn!("no-signal overlay failed: {err}"),
                    }
                }
            }
            return Ok(false);
        };
        self.stats.frames_captured += 1;

        self.transcode_and_publish(&buf.raw)?;

        if let Some(sink) = self.raw_sink.as_mut() {
            sink.publish(&buf.raw)?;
        }

        self.drive_display(&buf);
        self.source.release(buf.index)?;
        Ok(true)
    }

    fn transcode_and_publish(&mut self, raw: &Frame) -> Result<(), PipelineError> {
        let Some(transcoder) = self.transcoder.as_ref() else {
            return Err(PipelineError::NotOpen);
        };
        match transcoder.process(raw, &mut self.encoded, self.force_key) {
            Ok(()) => {
                self.force_key = false;
                self.consecutive_errors = 0;
                if let Some(sink) = self.h264_sink.as_mut() {
                    sink.publish(&self.encoded)?;
                }
                self.stats.frames_published += 1;
            }
            Err(err) if err.is_transient() => {
                // Buffers were re-provisioned; the next capture retries.
                debug!("transcoder info change, retrying on the next frame");
            }
            Err(err) => {
                warn!("transcode failed: {err}");
                self.stats.codec_errors += 1;
                self.consecutive_errors += 1;
                let worst = self
                    .consecutive_errors
                    .max(transcoder.consecutive_errors());
                if worst > self.config.max_consecutive_errors {
                    self.rebuild_transcoder()?;
                }
            }
        }
        Ok(())
    }

    fn rebuild_transcoder(&mut self) -> Result<(), PipelineError> {
        let Some(state) = self.state.as_ref() else {
            return Err(PipelineError::NotOpen);
        };
        warn!("too many consecutive codec errors, rebuilding the transcoder");
        self.transcoder = Some(Transcoder::new(
            self.library.clone(),
            state.width,
            state.height,
            self.config.encoder.tuning(),
        )?);
        self.stats.transcoder_restarts += 1;
        self.consecutive_errors = 0;
        self.force_key = true;
        Ok(())
    }

    fn drive_display(&mut self, buf: &crate::capture::CaptureBuffer) {
        if self.display.is_none() || !self.config.display.enabled {
            return;
        }
        if !self.display_open {
            // Replug probe: try to bring the display back with the
            // current capture geometry.
            if let Some(state) = self.state.clone() {
                self.open_display(&state);
            }
            if !self.display_open {
                return;
            }
        }

        let Some(display) = self.display.as_mut() else {
            return;
        };
        let hw = HwFrame {
            index: buf.index,
            dma_fd: buf.dma_fd,
            raw: &buf.raw,
        };
        let shown = match display.open_mode() {
            Some(OpenMode::Dma) => display
                .expose_dma(&hw)
                .and_then(|()| display.wait_for_vsync()),
            Some(OpenMode::Stub(_)) | None => Ok(()),
        };
        match shown {
            Ok(()) => self.stats.frames_displayed += 1,
            Err(DisplayError::NoDevice) => {
                debug!("display unplugged mid-stream, waiting for replug");
                display.close();
                self.display_open = false;
            }
            Err(err) => warn!("display expose failed: {err}"),
        }
    }
}
