//! CPU pixel-format conversions.
//!
//! Two converter families live here. The NV12 targets feed the hardware
//! encoder and operate on whole [`Frame`]s; the scan-out targets feed the
//! display fallback paths, write into a mapped framebuffer, and support
//! centering a smaller source inside the mode rectangle.
//!
//! Color math is full-range BT.601 with saturation to `[0, 255]`; chroma
//! for 4:2:0 outputs averages each 2×2 block. The matrix step goes
//! through `yuvutils_rs`, with a scalar fallback (threaded over rows)
//! when the library rejects a layout. Resampling-only conversions
//! (YUYV/I420/NV16 repacking) carry no color math and stay local.

use rayon::prelude::*;
use scanline_core::prelude::{Frame, PixelFormat};
use yuvutils_rs::{
    BufferStoreMut, YuvBiPlanarImageMut, YuvConversionMode, YuvPackedImage, YuvRange,
    YuvStandardMatrix,
};

use crate::CodecError;

/// Placement of a source rectangle inside a larger destination.
///
/// Converters honoring a center write only
/// `[offset_x, offset_x + src_w) × [offset_y, offset_y + src_h)` and leave
/// the rest of the destination untouched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Center {
    pub offset_x: u32,
    pub offset_y: u32,
}

impl Center {
    /// Top-left placement.
    pub const NONE: Center = Center {
        offset_x: 0,
        offset_y: 0,
    };

    /// Center `src` inside `dst`, or `None` when the source does not fit.
    ///
    /// Offsets use integer division: `(dst - src) / 2`.
    pub fn fit(src_w: u32, src_h: u32, dst_w: u32, dst_h: u32) -> Option<Center> {
        if src_w <= dst_w && src_h <= dst_h {
            Some(Center {
                offset_x: (dst_w - src_w) / 2,
                offset_y: (dst_h - src_h) / 2,
            })
        } else {
            None
        }
    }
}

/// A CPU-writable scan-out surface: a mapped framebuffer row-addressed by
/// `stride`, holding `bpp`-byte pixels (4 = XRGB8888, 3 = RGB888).
pub struct ScanoutTarget<'a> {
    pub data: &'a mut [u8],
    pub stride: usize,
    pub bpp: usize,
    pub width: u32,
    pub height: u32,
}

// Full-range ("JPEG") BT.601, matching the encoder's range setting.
const YUV_RANGE: YuvRange = YuvRange::Full;
const YUV_MATRIX: YuvStandardMatrix = YuvStandardMatrix::Bt601;

#[inline]
fn sat(v: f32) -> u8 {
    v.clamp(0.0, 255.0) as u8
}

/// BT.601 RGB → YUV reference, saturated. Scalar fallback path.
#[inline]
pub(crate) fn rgb_to_yuv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let (r, g, b) = (r as f32, g as f32, b as f32);
    let y = 0.299 * r + 0.587 * g + 0.114 * b;
    let u = -0.147 * r - 0.289 * g + 0.436 * b + 128.0;
    let v = 0.615 * r - 0.515 * g - 0.100 * b + 128.0;
    (sat(y), sat(u), sat(v))
}

/// BT.601 YUV → RGB reference, saturated. Scalar fallback path.
#[inline]
pub(crate) fn yuv_to_rgb(y: i32, u: i32, v: i32) -> (u8, u8, u8) {
    let y = y as f32;
    let u = (u - 128) as f32;
    let v = (v - 128) as f32;
    let r = y + 1.402 * v;
    let g = y - 0.344 * u - 0.714 * v;
    let b = y + 1.772 * u;
    (sat(r), sat(g), sat(b))
}

fn check_420_geometry(width: u32, height: u32) -> Result<(), CodecError> {
    if width == 0 || height == 0 {
        return Err(CodecError::InvalidParam("empty source geometry"));
    }
    if width % 2 != 0 || height % 2 != 0 {
        return Err(CodecError::InvalidParam("4:2:0 output requires even geometry"));
    }
    Ok(())
}

fn check_input_len(src: &Frame, required: usize) -> Result<(), CodecError> {
    if src.used() < required {
        return Err(CodecError::InvalidParam("source payload is too short"));
    }
    Ok(())
}

fn finish_nv12_meta(src: &Frame, dst: &mut Frame) {
    dst.width = src.width;
    dst.height = src.height;
    dst.stride = src.width;
    dst.format = PixelFormat::NV12;
    dst.grab_ts = src.grab_ts;
}

/// Dispatch `src` to the right NV12 converter based on its format tag.
///
/// NV12 input is an identity copy. JPEG input is not handled here; it goes
/// through the software decoder or the hardware front end.
pub fn convert_to_nv12(src: &Frame, dst: &mut Frame) -> Result<(), CodecError> {
    match src.format {
        PixelFormat::NV12 => nv12_copy(src, dst),
        PixelFormat::YUYV => yuyv_to_nv12(src, dst),
        PixelFormat::RGB24 => rgb24_to_nv12(src, dst),
        PixelFormat::BGR24 => bgr24_to_nv12(src, dst),
        PixelFormat::YUV420 => i420_to_nv12(src, dst),
        PixelFormat::NV16 => nv16_to_nv12(src, dst),
        other => Err(CodecError::FormatUnsupported(other)),
    }
}

/// NV12 → NV12 identity copy.
pub fn nv12_copy(src: &Frame, dst: &mut Frame) -> Result<(), CodecError> {
    check_420_geometry(src.width, src.height)?;
    let len = nv12_len(src.width, src.height);
    check_input_len(src, len)?;
    dst.payload_mut(len)?.copy_from_slice(&src.data()[..len]);
    finish_nv12_meta(src, dst);
    Ok(())
}

fn nv12_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * 3 / 2
}

/// Packed YUYV 4:2:2 → NV12. Chroma rows are averaged in pairs for the
/// vertical decimation.
pub fn yuyv_to_nv12(src: &Frame, dst: &mut Frame) -> Result<(), CodecError> {
    check_420_geometry(src.width, src.height)?;
    let width = src.width as usize;
    let height = src.height as usize;
    let src_stride = (src.stride as usize).max(width * 2);
    check_input_len(src, src_stride * height)?;

    let len = nv12_len(src.width, src.height);
    let data = src.data();
    let payload = dst.payload_mut(len)?;
    let (y_plane, uv_plane) = payload.split_at_mut(width * height);

    y_plane
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, y_row)| {
            let row = &data[y * src_stride..][..width * 2];
            for (x, dst_px) in y_row.iter_mut().enumerate() {
                *dst_px = row[x * 2];
            }
        });

    uv_plane
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(cy, uv_row)| {
            let top = &data[(cy * 2) * src_stride..][..width * 2];
            let bot = &data[(cy * 2 + 1) * src_stride..][..width * 2];
            for cx in 0..width / 2 {
                let base = cx * 4;
                let u = (top[base + 1] as u16 + bot[base + 1] as u16) / 2;
                let v = (top[base + 3] as u16 + bot[base + 3] as u16) / 2;
                uv_row[cx * 2] = u as u8;
                uv_row[cx * 2 + 1] = v as u8;
            }
        });

    finish_nv12_meta(src, dst);
    Ok(())
}

/// Packed RGB24 → NV12.
pub fn rgb24_to_nv12(src: &Frame, dst: &mut Frame) -> Result<(), CodecError> {
    rgb_like_to_nv12(src, dst, false)
}

/// Packed BGR24 → NV12.
pub fn bgr24_to_nv12(src: &Frame, dst: &mut Frame) -> Result<(), CodecError> {
    rgb_like_to_nv12(src, dst, true)
}

fn rgb_like_to_nv12(src: &Frame, dst: &mut Frame, swapped: bool) -> Result<(), CodecError> {
    check_420_geometry(src.width, src.height)?;
    let width = src.width as usize;
    let height = src.height as usize;
    let src_stride = (src.stride as usize).max(width * 3);
    check_input_len(src, src_stride * height)?;

    let len = nv12_len(src.width, src.height);
    let data = src.data();

    let converted = {
        let (y_plane, uv_plane) = dst.payload_mut(len)?.split_at_mut(width * height);
        let mut bi = YuvBiPlanarImageMut {
            y_plane: BufferStoreMut::Borrowed(y_plane),
            y_stride: width as u32,
            uv_plane: BufferStoreMut::Borrowed(uv_plane),
            uv_stride: width as u32,
            width: src.width,
            height: src.height,
        };
        if swapped {
            yuvutils_rs::bgr_to_yuv_nv12(
                &mut bi,
                data,
                src_stride as u32,
                YUV_RANGE,
                YUV_MATRIX,
                YuvConversionMode::Balanced,
            )
        } else {
            yuvutils_rs::rgb_to_yuv_nv12(
                &mut bi,
                data,
                src_stride as u32,
                YUV_RANGE,
                YUV_MATRIX,
                YuvConversionMode::Balanced,
            )
        }
    };

    if converted.is_err() {
        // Scalar fallback (threaded) writing into the sized payload.
        let (y_plane, uv_plane) = dst.data_mut().split_at_mut(width * height);

        let rgb_at = |row: &[u8], x: usize| -> (u8, u8, u8) {
            let px = &row[x * 3..x * 3 + 3];
            if swapped {
                (px[2], px[1], px[0])
            } else {
                (px[0], px[1], px[2])
            }
        };

        y_plane
            .par_chunks_mut(width)
            .enumerate()
            .for_each(|(y, y_row)| {
                let row = &data[y * src_stride..][..width * 3];
                for (x, dst_px) in y_row.iter_mut().enumerate() {
                    let (r, g, b) = rgb_at(row, x);
                    *dst_px = rgb_to_yuv(r, g, b).0;
                }
            });

        uv_plane
            .par_chunks_mut(width)
            .enumerate()
            .for_each(|(cy, uv_row)| {
                let top = &data[(cy * 2) * src_stride..][..width * 3];
                let bot = &data[(cy * 2 + 1) * src_stride..][..width * 3];
                for cx in 0..width / 2 {
                    let mut u_sum = 0u32;
                    let mut v_sum = 0u32;
                    for row in [top, bot] {
                        for dx in 0..2 {
                            let (r, g, b) = rgb_at(row, cx * 2 + dx);
                            let (_, u, v) = rgb_to_yuv(r, g, b);
                            u_sum += u as u32;
                            v_sum += v as u32;
                        }
                    }
                    uv_row[cx * 2] = (u_sum / 4) as u8;
                    uv_row[cx * 2 + 1] = (v_sum / 4) as u8;
                }
            });
    }

    finish_nv12_meta(src, dst);
    Ok(())
}

/// Planar I420 → NV12: copy luma, interleave the chroma planes. The
/// interleave is lossless, so NV12 → I420 → NV12 round-trips byte-exact.
///
/// Planar sources are expected tightly packed with `stride == width`.
pub fn i420_to_nv12(src: &Frame, dst: &mut Frame) -> Result<(), CodecError> {
    check_420_geometry(src.width, src.height)?;
    if src.stride != 0 && src.stride != src.width {
        return Err(CodecError::InvalidParam("planar source must be tightly packed"));
    }
    let width = src.width as usize;
    let height = src.height as usize;
    let y_size = width * height;
    let c_size = (width / 2) * (height / 2);
    check_input_len(src, y_size + 2 * c_size)?;

    let data = src.data();
    let (y_src, chroma) = data.split_at(y_size);
    let (u_src, v_src) = chroma.split_at(c_size);

    let payload = dst.payload_mut(y_size + 2 * c_size)?;
    let (y_plane, uv_plane) = payload.split_at_mut(y_size);
    y_plane.copy_from_slice(y_src);
    for (uv, (u, v)) in uv_plane
        .chunks_exact_mut(2)
        .zip(u_src.iter().zip(v_src.iter()))
    {
        uv[0] = *u;
        uv[1] = *v;
    }

    finish_nv12_meta(src, dst);
    Ok(())
}

/// NV16 (4:2:2) → NV12 (4:2:0) by dropping every other chroma row.
pub fn nv16_to_nv12(src: &Frame, dst: &mut Frame) -> Result<(), CodecError> {
    check_420_geometry(src.width, src.height)?;
    if src.stride != 0 && src.stride != src.width {
        return Err(CodecError::InvalidParam("planar source must be tightly packed"));
    }
    let width = src.width as usize;
    let height = src.height as usize;
    let y_size = width * height;
    check_input_len(src, y_size * 2)?;

    let data = src.data();
    let (y_src, uv_src) = data.split_at(y_size);

    let payload = dst.payload_mut(y_size + y_size / 2)?;
    let (y_plane, uv_plane) = payload.split_at_mut(y_size);
    y_plane.copy_from_slice(y_src);
    for (cy, uv_row) in uv_plane.chunks_exact_mut(width).enumerate() {
        uv_row.copy_from_slice(&uv_src[(cy * 2) * width..][..width]);
    }

    finish_nv12_meta(src, dst);
    Ok(())
}

fn check_scanout(dst: &ScanoutTarget<'_>, bpp: &[usize]) -> Result<(), CodecError> {
    if !bpp.contains(&dst.bpp) {
        return Err(CodecError::InvalidParam("unsupported scan-out pixel size"));
    }
    if dst.stride < dst.width as usize * dst.bpp {
        return Err(CodecError::InvalidParam("scan-out stride shorter than a row"));
    }
    if dst.data.len() < dst.stride * dst.height as usize {
        return Err(CodecError::InvalidParam("scan-out buffer is too short"));
    }
    Ok(())
}

/// Packed RGB24 → scan-out surface (XRGB8888 or RGB888), centered.
///
/// The padding byte of 4-byte pixels is written as `0xFF`.
pub fn rgb24_to_scanout(
    src: &[u8],
    src_w: u32,
    src_h: u32,
    dst: &mut ScanoutTarget<'_>,
    center: Center,
) -> Result<(), CodecError> {
    rgb_like_to_scanout(src, src_w, src_h, dst, center, false)
}

/// Packed BGR24 → scan-out surface (XRGB8888 or RGB888), centered.
pub fn bgr24_to_scanout(
    src: &[u8],
    src_w: u32,
    src_h: u32,
    dst: &mut ScanoutTarget<'_>,
    center: Center,
) -> Result<(), CodecError> {
    rgb_like_to_scanout(src, src_w, src_h, dst, center, true)
}

fn rgb_like_to_scanout(
    src: &[u8],
    src_w: u32,
    src_h: u32,
    dst: &mut ScanoutTarget<'_>,
    center: Center,
    swapped: bool,
) -> Result<(), CodecError> {
    check_scanout(dst, &[3, 4])?;
    let src_stride = src_w as usize * 3;
    if src.len() < src_stride * src_h as usize {
        return Err(CodecError::InvalidParam("source payload is too short"));
    }

    let bpp = dst.bpp;
    for y in 0..src_h {
        let dst_y = y + center.offset_y;
        if dst_y >= dst.height {
            break;
        }
        let src_row = &src[y as usize * src_stride..][..src_stride];
        let row_start = dst_y as usize * dst.stride + center.offset_x as usize * bpp;
        for x in 0..src_w {
            let dst_x = x + center.offset_x;
            if dst_x >= dst.width {
                break;
            }
            let px = &src_row[x as usize * 3..][..3];
            let (r, g, b) = if swapped {
                (px[2], px[1], px[0])
            } else {
                (px[0], px[1], px[2])
            };
            let out = &mut dst.data[row_start + x as usize * bpp..][..bpp];
            if bpp == 4 {
                out[0] = b;
                out[1] = g;
                out[2] = r;
                out[3] = 0xFF;
            } else {
                out[0] = r;
                out[1] = g;
                out[2] = b;
            }
        }
    }
    Ok(())
}

/// Packed YUYV 4:2:2 → scan-out surface (XRGB8888 or RGB888), centered.
///
/// The matrix step lands in a tight RGB24 staging buffer; the centered
/// pixel packing reuses the RGB scan-out writer.
pub fn yuyv_to_scanout(
    src: &[u8],
    src_w: u32,
    src_h: u32,
    dst: &mut ScanoutTarget<'_>,
    center: Center,
) -> Result<(), CodecError> {
    check_scanout(dst, &[3, 4])?;
    let src_stride = src_w as usize * 2;
    let required = src_stride * src_h as usize;
    if src.len() < required {
        return Err(CodecError::InvalidParam("source payload is too short"));
    }

    let rgb_stride = src_w as usize * 3;
    let mut rgb = vec![0u8; rgb_stride * src_h as usize];
    let packed = YuvPackedImage {
        yuy: &src[..required],
        yuy_stride: src_stride as u32,
        width: src_w,
        height: src_h,
    };
    if yuvutils_rs::yuyv422_to_rgb(&packed, &mut rgb, rgb_stride as u32, YUV_RANGE, YUV_MATRIX)
        .is_err()
    {
        // Scalar fallback (threaded) writing into the staging buffer.
        rgb.par_chunks_mut(rgb_stride)
            .enumerate()
            .for_each(|(y, dst_line)| {
                let line = &src[y * src_stride..][..src_stride];
                for pair in 0..src_w as usize / 2 {
                    let base = pair * 4;
                    let y0 = line[base] as i32;
                    let u = line[base + 1] as i32;
                    let y1 = line[base + 2] as i32;
                    let v = line[base + 3] as i32;
                    let (r0, g0, b0) = yuv_to_rgb(y0, u, v);
                    let (r1, g1, b1) = yuv_to_rgb(y1, u, v);
                    let di = pair * 6;
                    dst_line[di] = r0;
                    dst_line[di + 1] = g0;
                    dst_line[di + 2] = b0;
                    dst_line[di + 3] = r1;
                    dst_line[di + 4] = g1;
                    dst_line[di + 5] = b1;
                }
            });
    }

    rgb_like_to_scanout(&rgb, src_w, src_h, dst, center, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(format: PixelFormat, width: u32, height: u32, stride: u32, data: &[u8]) -> Frame {
        let mut f = Frame::new();
        f.width = width;
        f.height = height;
        f.stride = stride;
        f.format = format;
        f.append(data).unwrap();
        f
    }

    #[test]
    fn nv12_identity_is_byte_exact() {
        let payload: Vec<u8> = (0..4 * 2 * 3 / 2).map(|i| i as u8 ^ 0x5A).collect();
        let src = frame(PixelFormat::NV12, 4, 2, 4, &payload);
        let mut dst = Frame::new();
        convert_to_nv12(&src, &mut dst).unwrap();
        assert_eq!(dst.format, PixelFormat::NV12);
        assert_eq!(dst.stride, 4);
        assert_eq!(dst.data(), payload.as_slice());
    }

    #[test]
    fn i420_round_trips_through_nv12() {
        let (w, h) = (4u32, 4u32);
        let y_size = (w * h) as usize;
        let c_size = y_size / 4;
        let payload: Vec<u8> = (0..y_size + 2 * c_size).map(|i| (i * 7) as u8).collect();
        let src = frame(PixelFormat::YUV420, w, h, w, &payload);
        let mut nv12 = Frame::new();
        i420_to_nv12(&src, &mut nv12).unwrap();
        assert_eq!(nv12.used(), y_size + 2 * c_size);

        // Deinterleave back and compare with the original planes.
        let data = nv12.data();
        let (y_out, uv) = data.split_at(y_size);
        assert_eq!(y_out, &payload[..y_size]);
        let u_orig = &payload[y_size..y_size + c_size];
        let v_orig = &payload[y_size + c_size..];
        for i in 0..c_size {
            assert_eq!(uv[i * 2], u_orig[i]);
            assert_eq!(uv[i * 2 + 1], v_orig[i]);
        }
    }

    #[test]
    fn yuyv_to_nv12_sets_payload_contract() {
        let (w, h) = (1280u32, 720u32);
        let src = frame(
            PixelFormat::YUYV,
            w,
            h,
            w * 2,
            &vec![0x80u8; (w * h * 2) as usize],
        );
        assert_eq!(src.stride, 2560);
        let mut dst = Frame::new();
        yuyv_to_nv12(&src, &mut dst).unwrap();
        assert_eq!(dst.format, PixelFormat::NV12);
        assert_eq!((dst.width, dst.height), (w, h));
        assert_eq!(dst.stride, w);
        assert_eq!(dst.used(), 1_382_400);
    }

    #[test]
    fn yuyv_gray_produces_flat_planes() {
        // Y = 0x50, U = V = 0x80 everywhere.
        let mut data = Vec::new();
        for _ in 0..(4 * 2) / 2 {
            data.extend_from_slice(&[0x50, 0x80, 0x50, 0x80]);
        }
        let src = frame(PixelFormat::YUYV, 4, 2, 8, &data);
        let mut dst = Frame::new();
        yuyv_to_nv12(&src, &mut dst).unwrap();
        let (y, uv) = dst.data().split_at(8);
        assert!(y.iter().all(|&b| b == 0x50));
        assert!(uv.iter().all(|&b| b == 0x80));
    }

    #[test]
    fn rgb_to_nv12_matches_reference_matrix() {
        // Uniform white: Y saturates to 255, chroma sits at the unbiased
        // midpoint.
        let src = frame(PixelFormat::RGB24, 2, 2, 6, &[0xFF; 12]);
        let mut dst = Frame::new();
        rgb24_to_nv12(&src, &mut dst).unwrap();
        let (y, uv) = dst.data().split_at(4);
        assert!(y.iter().all(|&b| b == 255));
        assert!(uv.iter().all(|&b| (127..=129).contains(&b)));

        // A solid color block converts to flat planes within rounding of
        // the reference matrix.
        let red = [0xFFu8, 0, 0];
        let mut data = Vec::new();
        for _ in 0..4 {
            data.extend_from_slice(&red);
        }
        let src = frame(PixelFormat::RGB24, 2, 2, 6, &data);
        let mut dst = Frame::new();
        rgb24_to_nv12(&src, &mut dst).unwrap();
        let (expect_y, expect_u, expect_v) = rgb_to_yuv(0xFF, 0, 0);
        let (y, uv) = dst.data().split_at(4);
        assert!(y.iter().all(|&b| (b as i16 - expect_y as i16).abs() <= 2));
        assert!((uv[0] as i16 - expect_u as i16).abs() <= 2);
        assert!((uv[1] as i16 - expect_v as i16).abs() <= 2);
        assert!(y.windows(2).all(|w| w[0] == w[1]), "luma plane is flat");
    }

    #[test]
    fn bgr_swaps_channels() {
        let rgb = frame(PixelFormat::RGB24, 2, 2, 6, &[10, 20, 30].repeat(4));
        let bgr = frame(PixelFormat::BGR24, 2, 2, 6, &[30, 20, 10].repeat(4));
        let mut a = Frame::new();
        let mut b = Frame::new();
        rgb24_to_nv12(&rgb, &mut a).unwrap();
        bgr24_to_nv12(&bgr, &mut b).unwrap();
        assert_eq!(a.data(), b.data());
    }

    #[test]
    fn nv16_drops_every_other_chroma_row() {
        let (w, h) = (2u32, 4u32);
        let y: Vec<u8> = (0u8..8).collect();
        let uv: Vec<u8> = (100u8..108).collect();
        let mut data = y.clone();
        data.extend_from_slice(&uv);
        let src = frame(PixelFormat::NV16, w, h, w, &data);
        let mut dst = Frame::new();
        nv16_to_nv12(&src, &mut dst).unwrap();
        let (y_out, uv_out) = dst.data().split_at(8);
        assert_eq!(y_out, y.as_slice());
        // Rows 0 and 2 of the 4:2:2 chroma survive.
        assert_eq!(uv_out, &[100, 101, 104, 105]);
    }

    #[test]
    fn router_rejects_unknown_formats() {
        let src = frame(PixelFormat::H264, 2, 2, 0, &[0; 16]);
        let mut dst = Frame::new();
        assert!(matches!(
            convert_to_nv12(&src, &mut dst),
            Err(CodecError::FormatUnsupported(_))
        ));
    }

    #[test]
    fn odd_geometry_is_rejected() {
        let src = frame(PixelFormat::YUYV, 3, 2, 6, &[0; 12]);
        let mut dst = Frame::new();
        assert!(matches!(
            yuyv_to_nv12(&src, &mut dst),
            Err(CodecError::InvalidParam(_))
        ));
    }

    #[test]
    fn centered_scanout_touches_only_the_rectangle() {
        let (dst_w, dst_h) = (6u32, 4u32);
        let mut buf = vec![0xEEu8; (dst_w * dst_h * 4) as usize];
        let mut target = ScanoutTarget {
            data: &mut buf,
            stride: dst_w as usize * 4,
            bpp: 4,
            width: dst_w,
            height: dst_h,
        };
        let center = Center::fit(2, 2, dst_w, dst_h).unwrap();
        assert_eq!(center, Center { offset_x: 2, offset_y: 1 });

        let src = [0u8, 0, 0xFF].repeat(4); // solid blue
        rgb24_to_scanout(&src, 2, 2, &mut target, center).unwrap();

        for y in 0..dst_h {
            for x in 0..dst_w {
                let px = &buf[(y * dst_w + x) as usize * 4..][..4];
                let inside = (2..4).contains(&x) && (1..3).contains(&y);
                if inside {
                    assert_eq!(px, &[0xFF, 0, 0, 0xFF]);
                } else {
                    assert_eq!(px, &[0xEE; 4]);
                }
            }
        }
    }

    #[test]
    fn scanout_alpha_is_opaque() {
        let mut buf = vec![0u8; 2 * 1 * 4];
        let mut target = ScanoutTarget {
            data: &mut buf,
            stride: 8,
            bpp: 4,
            width: 2,
            height: 1,
        };
        yuyv_to_scanout(&[0x80, 0x80, 0x80, 0x80], 2, 1, &mut target, Center::NONE).unwrap();
        assert_eq!(buf[3], 0xFF);
        assert_eq!(buf[7], 0xFF);
    }

    #[test]
    fn rgb888_scanout_keeps_three_bytes() {
        let mut buf = vec![0u8; 2 * 1 * 3];
        let mut target = ScanoutTarget {
            data: &mut buf,
            stride: 6,
            bpp: 3,
            width: 2,
            height: 1,
        };
        rgb24_to_scanout(&[1, 2, 3, 4, 5, 6], 2, 1, &mut target, Center::NONE).unwrap();
        assert_eq!(buf, vec![1, 2, 3, 4, 5, 6]);
    }
}
