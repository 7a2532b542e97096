//! Software JPEG decoding.
//!
//! When the bitstream carries exactly 4:2:0 chroma, the decoder asks the
//! library for raw planes and emits tightly packed I420 with
//! `stride = width`; anything else falls back to packed RGB24. The
//! per-call decompressor is destroyed on every path, so a malformed input
//! leaks no state.

use scanline_core::prelude::{Frame, PixelFormat};
use turbojpeg::{Decompressor, Image as TjImage, PixelFormat as TjPixelFormat, Subsamp, YuvImage};

use crate::CodecError;

/// Decompress `src` into `dst`, choosing I420 or RGB24 per the sampling.
pub fn decode(src: &Frame, dst: &mut Frame) -> Result<(), CodecError> {
    unjpeg(src, dst, true)
}

/// Header-only parse: populate `dst` metadata, allocate no pixel storage.
pub fn probe(src: &Frame, dst: &mut Frame) -> Result<(), CodecError> {
    unjpeg(src, dst, false)
}

/// Decompress to packed RGB24 regardless of the source sampling.
///
/// The display fallback path composes onto RGB surfaces and has no use
/// for planar output.
pub fn decode_rgb(src: &Frame, dst: &mut Frame) -> Result<(), CodecError> {
    if !src.format.is_jpeg() {
        return Err(CodecError::FormatUnsupported(src.format));
    }
    let data = src.data();
    if data.len() < 2 || data[0] != 0xFF || data[1] != 0xD8 {
        return Err(CodecError::JpegDecode("missing SOI marker".into()));
    }

    let mut tj = Decompressor::new().map_err(jpeg_error)?;
    let header = tj.read_header(data).map_err(jpeg_error)?;
    if header.width == 0 || header.height == 0 {
        return Err(CodecError::JpegDecode("empty image geometry".into()));
    }

    dst.copy_meta_from(src);
    dst.width = header.width as u32;
    dst.height = header.height as u32;
    dst.format = PixelFormat::RGB24;
    dst.stride = dst.width * 3;
    let pitch = header.width * 3;
    let image = TjImage {
        pixels: dst.payload_mut(pitch * header.height)?,
        width: header.width,
        pitch,
        height: header.height,
        format: TjPixelFormat::RGB,
    };
    tj.decompress(data, image).map_err(jpeg_error)?;
    Ok(())
}

fn unjpeg(src: &Frame, dst: &mut Frame, decode: bool) -> Result<(), CodecError> {
    if !src.format.is_jpeg() {
        return Err(CodecError::FormatUnsupported(src.format));
    }
    let data = src.data();
    if data.len() < 2 || data[0] != 0xFF || data[1] != 0xD8 {
        return Err(CodecError::JpegDecode("missing SOI marker".into()));
    }

    let mut tj = Decompressor::new().map_err(jpeg_error)?;
    let header = tj.read_header(data).map_err(jpeg_error)?;
    if header.width == 0 || header.height == 0 {
        return Err(CodecError::JpegDecode("empty image geometry".into()));
    }

    dst.copy_meta_from(src);
    dst.width = header.width as u32;
    dst.height = header.height as u32;
    let is_420 = header.subsamp == Subsamp::Sub2x2;
    if is_420 {
        dst.format = PixelFormat::YUV420;
        dst.stride = dst.width;
    } else {
        dst.format = PixelFormat::RGB24;
        dst.stride = dst.width * 3;
    }
    if !decode {
        dst.clear();
        return Ok(());
    }

    if is_420 {
        let len = i420_len(header.width, header.height);
        let image = YuvImage {
            pixels: dst.payload_mut(len)?,
            width: header.width,
            align: 1,
            height: header.height,
            subsamp: Subsamp::Sub2x2,
        };
        tj.decompress_to_yuv(data, image).map_err(jpeg_error)?;
    } else {
        let pitch = header.width * 3;
        let image = TjImage {
            pixels: dst.payload_mut(pitch * header.height)?,
            width: header.width,
            pitch,
            height: header.height,
            format: TjPixelFormat::RGB,
        };
        tj.decompress(data, image).map_err(jpeg_error)?;
    }
    Ok(())
}

fn i420_len(width: usize, height: usize) -> usize {
    width * height + 2 * (width.div_ceil(2) * height.div_ceil(2))
}

fn jpeg_error(err: turbojpeg::Error) -> CodecError {
    tracing::error!("can't decompress JPEG: {err}");
    CodecError::JpegDecode(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg_frame(width: usize, height: usize, subsamp: Subsamp) -> Frame {
        let mut rgb = vec![0u8; width * height * 3];
        for (i, px) in rgb.chunks_exact_mut(3).enumerate() {
            px[0] = (i % 251) as u8;
            px[1] = (i % 127) as u8;
            px[2] = (i % 63) as u8;
        }
        let image = TjImage {
            pixels: rgb.as_slice(),
            width,
            pitch: width * 3,
            height,
            format: TjPixelFormat::RGB,
        };
        let jpeg = turbojpeg::compress(image, 90, subsamp).unwrap();

        let mut frame = Frame::new();
        frame.width = width as u32;
        frame.height = height as u32;
        frame.format = PixelFormat::MJPEG;
        frame.append(&jpeg).unwrap();
        frame
    }

    #[test]
    fn sub2x2_emits_planar_i420() {
        let src = jpeg_frame(1920, 1080, Subsamp::Sub2x2);
        let mut dst = Frame::new();
        decode(&src, &mut dst).unwrap();
        assert_eq!(dst.format, PixelFormat::YUV420);
        assert_eq!((dst.width, dst.height), (1920, 1080));
        assert_eq!(dst.stride, 1920);
        assert_eq!(dst.used(), 3_110_400);
    }

    #[test]
    fn other_sampling_falls_back_to_rgb() {
        let src = jpeg_frame(640, 480, Subsamp::Sub2x1);
        let mut dst = Frame::new();
        decode(&src, &mut dst).unwrap();
        assert_eq!(dst.format, PixelFormat::RGB24);
        assert_eq!(dst.stride, 1920);
        assert_eq!(dst.used(), 921_600);
    }

    #[test]
    fn decode_rgb_ignores_sampling() {
        let src = jpeg_frame(320, 240, Subsamp::Sub2x2);
        let mut dst = Frame::new();
        decode_rgb(&src, &mut dst).unwrap();
        assert_eq!(dst.format, PixelFormat::RGB24);
        assert_eq!(dst.stride, 960);
        assert_eq!(dst.used(), 320 * 240 * 3);
    }

    #[test]
    fn probe_parses_headers_without_pixels() {
        let src = jpeg_frame(320, 240, Subsamp::Sub2x2);
        let mut dst = Frame::new();
        probe(&src, &mut dst).unwrap();
        assert_eq!(dst.format, PixelFormat::YUV420);
        assert_eq!((dst.width, dst.height), (320, 240));
        assert_eq!(dst.used(), 0);
        assert_eq!(dst.allocated(), 0);
    }

    #[test]
    fn malformed_inputs_leave_output_untouched() {
        let mut dst = Frame::new();

        let mut short = Frame::new();
        short.format = PixelFormat::JPEG;
        short.append(&[0xFF]).unwrap();
        assert!(matches!(
            decode(&short, &mut dst),
            Err(CodecError::JpegDecode(_))
        ));

        let mut bad_soi = Frame::new();
        bad_soi.format = PixelFormat::MJPEG;
        bad_soi.append(&[0x00, 0xD8, 1, 2, 3, 4]).unwrap();
        assert!(matches!(
            decode(&bad_soi, &mut dst),
            Err(CodecError::JpegDecode(_))
        ));

        assert_eq!(dst.used(), 0);
        assert_eq!(dst.format, PixelFormat::NONE);
    }

    #[test]
    fn non_jpeg_tag_is_rejected() {
        let mut src = Frame::new();
        src.format = PixelFormat::YUYV;
        src.append(&[0xFF, 0xD8, 0xFF, 0xE0]).unwrap();
        let mut dst = Frame::new();
        assert!(matches!(
            decode(&src, &mut dst),
            Err(CodecError::FormatUnsupported(_))
        ));
    }
}
