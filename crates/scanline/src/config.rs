//! Node configuration.

use std::time::Duration;

use scanline_codec::prelude::{EncoderTuning, RateControl};
use scanline_display::prelude::DisplayOptions;

/// H.264 encoder settings.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct EncoderSettings {
    pub bitrate_kbps: u32,
    pub gop: u32,
    pub fps_num: u32,
    pub fps_den: u32,
    pub rc_mode: RateControl,
    pub profile: u32,
    pub level: u32,
    pub qp_min: u32,
    pub qp_max: u32,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            bitrate_kbps: 5000,
            gop: 30,
            fps_num: 30,
            fps_den: 1,
            rc_mode: RateControl::Cbr,
            profile: 100,
            level: 40,
            qp_min: 16,
            qp_max: 40,
        }
    }
}

impl EncoderSettings {
    pub fn tuning(&self) -> EncoderTuning {
        EncoderTuning {
            bitrate_bps: self.bitrate_kbps.saturating_mul(1000),
            gop: self.gop,
            fps_num: self.fps_num,
            fps_den: self.fps_den,
            rc_mode: self.rc_mode,
            profile: self.profile,
            level: self.level,
            qp_min: self.qp_min,
            qp_max: self.qp_max,
            ..EncoderTuning::default()
        }
    }
}

/// Local display settings.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DisplaySettings {
    pub enabled: bool,
    pub port: Option<String>,
    pub timeout: Duration,
    pub blank_after: Duration,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            port: None,
            timeout: Duration::from_secs(5),
            blank_after: Duration::from_secs(5),
        }
    }
}

impl DisplaySettings {
    pub fn options(&self) -> DisplayOptions {
        DisplayOptions {
            port: self.port.clone(),
            timeout: self.timeout,
            blank_after: self.blank_after,
        }
    }
}

/// Everything the passthrough node needs.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct NodeConfig {
    pub encoder: EncoderSettings,
    pub display: DisplaySettings,
    /// Consecutive codec failures before the transcoder is rebuilt.
    pub max_consecutive_errors: u32,
}

impl NodeConfig {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            encoder: EncoderSettings::default(),
            display: DisplaySettings::default(),
            max_consecutive_errors: 10,
        }
    }
}
