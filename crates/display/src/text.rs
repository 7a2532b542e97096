//! Status-text rasterizer for the stub overlay path.
//!
//! Renders a multi-line ASCII message centered into an owned RGB24 frame.
//! Line breaks are explicit; there is no word wrapping. The previous
//! render is reused when neither the text nor the geometry changed.

use scanline_core::prelude::{Frame, PixelFormat};

use crate::font::{GLYPHS, GLYPH_SIZE};

const INK: u8 = 0x65; // gray; reads the same through RGB and BGR scan-out

/// Owns the glyph atlas and the rendered overlay frame.
pub struct TextRenderer {
    frame: Frame,
    text: Option<String>,
}

impl TextRenderer {
    pub fn new() -> Self {
        Self {
            frame: Frame::new(),
            text: None,
        }
    }

    /// The last rendered overlay.
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Compose `text` centered into a `width`×`height` RGB24 frame.
    pub fn draw(&mut self, text: &str, width: u32, height: u32) -> &Frame {
        if self.frame.width == width
            && self.frame.height == height
            && self.text.as_deref() == Some(text)
        {
            return &self.frame;
        }
        self.text = Some(text.to_string());
        self.frame.width = width;
        self.frame.height = height;
        self.frame.format = PixelFormat::RGB24;
        self.frame.stride = width * 3;
        let len = (width * height * 3) as usize;
        if let Ok(payload) = self.frame.payload_mut(len) {
            payload.fill(0);
        } else {
            return &self.frame;
        }
        if width == 0 || height == 0 {
            return &self.frame;
        }

        // Measure the text block in glyph cells. Consecutive line breaks
        // collapse; messages carry a " " line to force vertical gaps.
        let lines: Vec<&str> = text.split('\n').filter(|line| !line.is_empty()).collect();
        let block_width = lines
            .iter()
            .map(|line| line.len() as u32 * GLYPH_SIZE)
            .max()
            .unwrap_or(0);
        let block_height = lines.len() as u32 * GLYPH_SIZE;
        if block_width == 0 || block_height == 0 {
            return &self.frame;
        }

        // Shape the block between half and three quarters of the screen,
        // then clamp the scales against each other to keep proportions.
        let div_x = ((100 / block_width * 2) as f32).clamp(1.5, 2.0);
        let div_y = ((70 / block_height * 2) as f32).clamp(1.5, 2.0);
        let mut scale_x = ((width / block_width) as f32 / div_x) as u32;
        let mut scale_y = ((height / block_height) as f32 / div_y) as u32;
        if (scale_x as f32) < scale_y as f32 / 1.5 {
            scale_y = (scale_x as f32 * 1.5) as u32;
        } else if (scale_y as f32) < scale_x as f32 * 1.5 {
            scale_x = (scale_y as f32 / 1.5) as u32;
        }

        let start_y = if height >= block_height * scale_y {
            (height - block_height * scale_y) / 2
        } else {
            0
        };
        for (n, line) in lines.iter().enumerate() {
            let line_width = line.len() as u32 * GLYPH_SIZE * scale_x;
            let start_x = if width >= line_width {
                (width - line_width) / 2
            } else {
                0
            };
            self.draw_line(
                line,
                scale_x,
                scale_y,
                start_x,
                start_y + n as u32 * GLYPH_SIZE * scale_y,
            );
        }
        &self.frame
    }

    fn draw_line(&mut self, line: &str, scale_x: u32, scale_y: u32, start_x: u32, start_y: u32) {
        let frame = &mut self.frame;
        let stride = frame.stride as usize;
        let width = frame.width;
        let used = frame.used();
        let data = frame.data_mut();
        let bytes = line.as_bytes();

        for ch_y in 0..GLYPH_SIZE * scale_y {
            let canvas_y = (start_y + ch_y) as usize;
            for ch_x in 0..GLYPH_SIZE * bytes.len() as u32 * scale_x {
                if start_x + ch_x >= width {
                    break;
                }
                let canvas_x = ((start_x + ch_x) * 3) as usize;
                let offset = canvas_y * stride + canvas_x;
                if offset + 2 >= used {
                    break;
                }

                let ch = bytes[(ch_x / GLYPH_SIZE / scale_x) as usize].min(127) as usize;
                let glyph_row = ((ch_y / scale_y) % GLYPH_SIZE) as usize;
                let glyph_bit = (ch_x / scale_x) % GLYPH_SIZE;
                let on = GLYPHS[ch][glyph_row] >> glyph_bit & 1 != 0;

                let ink = if on { INK } else { 0 };
                data[offset] = ink;
                data[offset + 1] = ink;
                data[offset + 2] = ink;
            }
        }
    }
}

impl Default for TextRenderer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lit_bbox(frame: &Frame) -> Option<(u32, u32, u32, u32)> {
        let mut bbox: Option<(u32, u32, u32, u32)> = None;
        let stride = frame.stride as usize;
        for y in 0..frame.height {
            for x in 0..frame.width {
                if frame.data()[y as usize * stride + x as usize * 3] != 0 {
                    bbox = Some(match bbox {
                        None => (x, y, x, y),
                        Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
                    });
                }
            }
        }
        bbox
    }

    #[test]
    fn renders_exact_rgb24_payload() {
        let mut renderer = TextRenderer::new();
        let frame = renderer.draw("NO LIVE VIDEO", 640, 480);
        assert_eq!(frame.format, PixelFormat::RGB24);
        assert_eq!((frame.width, frame.height), (640, 480));
        assert_eq!(frame.stride, 640 * 3);
        assert_eq!(frame.used(), 640 * 480 * 3);
        assert!(frame.data().iter().all(|&b| b == 0 || b == INK));
        assert!(frame.data().iter().any(|&b| b == INK));
    }

    #[test]
    fn message_is_centered() {
        let mut renderer = TextRenderer::new();
        let frame = renderer.draw("=== TEST ===\n \n< NO LIVE VIDEO >", 640, 480);
        let (x0, y0, x1, y1) = lit_bbox(frame).unwrap();
        let cx = (x0 + x1) / 2;
        let cy = (y0 + y1) / 2;
        assert!((cx as i64 - 320).unsigned_abs() <= 24, "cx = {cx}");
        assert!((cy as i64 - 240).unsigned_abs() <= 24, "cy = {cy}");
    }

    #[test]
    fn unchanged_input_reuses_the_render() {
        let mut renderer = TextRenderer::new();
        let first = renderer.draw("HELLO", 320, 240).data().to_vec();
        let again = renderer.draw("HELLO", 320, 240).data().to_vec();
        assert_eq!(first, again);

        let other = renderer.draw("WORLD", 320, 240).data().to_vec();
        assert_ne!(first, other);
    }

    #[test]
    fn survives_degenerate_geometry() {
        let mut renderer = TextRenderer::new();
        let frame = renderer.draw("X", 2, 2);
        assert_eq!(frame.used(), 2 * 2 * 3);
        // Too small for any glyph; stays black.
        assert!(frame.data().iter().all(|&b| b == 0));
    }
}
