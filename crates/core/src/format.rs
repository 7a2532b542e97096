use std::{fmt, str::FromStr};

/// Four-character code naming a pixel or stream format.
///
/// Tags are opaque: the pipeline only ever compares them for equality and
/// never interprets the bytes.
///
/// # Example
/// ```rust
/// use scanline_core::prelude::PixelFormat;
///
/// let fmt = PixelFormat::NV12;
/// assert_eq!(fmt.to_string(), "NV12");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelFormat([u8; 4]);

impl PixelFormat {
    /// Packed YUV 4:2:2, two luma samples per chroma pair.
    pub const YUYV: Self = Self(*b"YUYV");
    /// Packed RGB, 3 bytes per pixel.
    pub const RGB24: Self = Self(*b"RGB3");
    /// Packed BGR, 3 bytes per pixel.
    pub const BGR24: Self = Self(*b"BGR3");
    /// Planar YUV 4:2:0 with interleaved chroma.
    pub const NV12: Self = Self(*b"NV12");
    /// Planar YUV 4:2:2 with interleaved chroma.
    pub const NV16: Self = Self(*b"NV16");
    /// Planar YUV 4:2:0 with separate chroma planes (I420).
    pub const YUV420: Self = Self(*b"YU12");
    /// Motion JPEG bitstream.
    pub const MJPEG: Self = Self(*b"MJPG");
    /// Single JPEG bitstream.
    pub const JPEG: Self = Self(*b"JPEG");
    /// H.264 Annex B byte stream.
    pub const H264: Self = Self(*b"H264");
    /// 32-bit packed RGB with a padding byte, display scan-out order.
    pub const XRGB8888: Self = Self(*b"XR24");
    /// 24-bit packed RGB, display scan-out order.
    pub const RGB888: Self = Self(*b"RG24");
    /// 24-bit packed BGR, display scan-out order.
    pub const BGR888: Self = Self(*b"BG24");
    /// 16-bit packed RGB 5:6:5.
    pub const RGB565: Self = Self(*b"RG16");
    /// Unset; the zero value of a freshly constructed frame.
    pub const NONE: Self = Self([0; 4]);

    /// Construct from raw fourcc bytes.
    pub const fn new(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Little-endian u32 encoding of the tag.
    pub fn to_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    /// Printable form when the tag is ASCII.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    /// True for both JPEG container flavors.
    pub fn is_jpeg(self) -> bool {
        self == Self::MJPEG || self == Self::JPEG
    }

    /// Bytes per pixel for packed formats; `None` for planar and
    /// entropy-coded formats.
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            Self::XRGB8888 => Some(4),
            Self::RGB24 | Self::BGR24 | Self::RGB888 | Self::BGR888 => Some(3),
            Self::YUYV | Self::RGB565 => Some(2),
            _ => None,
        }
    }

    /// Full payload size of a `width`×`height` image in this format.
    ///
    /// `None` for entropy-coded formats whose size is data-dependent.
    ///
    /// # Example
    /// ```rust
    /// use scanline_core::prelude::PixelFormat;
    ///
    /// assert_eq!(PixelFormat::NV12.payload_size(1280, 720), Some(1_382_400));
    /// ```
    pub fn payload_size(self, width: u32, height: u32) -> Option<usize> {
        let pixels = (width as usize).checked_mul(height as usize)?;
        match self {
            Self::NV12 | Self::YUV420 => Some(pixels * 3 / 2),
            Self::YUYV | Self::NV16 | Self::RGB565 => pixels.checked_mul(2),
            Self::RGB24 | Self::BGR24 | Self::RGB888 | Self::BGR888 => pixels.checked_mul(3),
            Self::XRGB8888 => pixels.checked_mul(4),
            _ => None,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.as_str() {
            write!(f, "{s}")
        } else {
            write!(f, "0x{:08x}", self.to_u32())
        }
    }
}

impl FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 4 {
            return Err("pixel format tag must be four ASCII bytes".into());
        }
        let mut arr = [0u8; 4];
        arr.copy_from_slice(bytes);
        Ok(PixelFormat(arr))
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for PixelFormat {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for PixelFormat {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
