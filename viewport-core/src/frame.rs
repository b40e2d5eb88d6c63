//! Shared frame types for the capture pipeline.
//!
//! A [`Frame`] is produced once per capture tick and shared read-only by
//! every viewer watching that display. Per-viewer work (cursor, overlays,
//! encoding) starts from a [`Canvas`] copy taken in the transform stage,
//! so the shared frame is never written to.

use std::time::Instant;

use bytes::Bytes;

// ── PixelFormat ──────────────────────────────────────────────────

/// Pixel layout for raw captured frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 4 bytes per pixel: Blue, Green, Red, Alpha (DXGI and X11 default).
    Bgra8,
    /// 4 bytes per pixel: Red, Green, Blue, Alpha.
    Rgba8,
}

impl PixelFormat {
    /// Bytes consumed by a single pixel in this format.
    pub const fn bytes_per_pixel(self) -> usize {
        4
    }
}

// ── Frame ────────────────────────────────────────────────────────

/// A raw, uncompressed capture of one display.
///
/// The payload holds `height` rows of `stride` bytes each. `stride` may
/// exceed `width * 4` due to GPU row alignment.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Display this frame was acquired from.
    pub display_name: String,
    pub width: u32,
    pub height: u32,
    /// Row pitch in **bytes**.
    pub stride: u32,
    pub format: PixelFormat,
    pub payload: Bytes,
    /// Monotonic capture timestamp.
    pub timestamp: Instant,
    /// Per-display capture counter, assigned by the capture loop.
    pub sequence: u64,
}

impl Frame {
    /// Build a tightly packed frame (`stride == width * 4`).
    pub fn packed(
        display_name: impl Into<String>,
        width: u32,
        height: u32,
        format: PixelFormat,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            display_name: display_name.into(),
            width,
            height,
            stride: width * format.bytes_per_pixel() as u32,
            format,
            payload: payload.into(),
            timestamp: Instant::now(),
            sequence: 0,
        }
    }

    /// Total byte size the raw bitmap occupies.
    pub fn byte_len(&self) -> usize {
        self.stride as usize * self.height as usize
    }

    /// Returns a row slice (including possible padding bytes).
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride as usize;
        let end = start + self.stride as usize;
        &self.payload[start..end]
    }

    /// Copy the visible pixels into a tightly packed RGBA canvas.
    pub fn to_canvas(&self) -> Canvas {
        let bpp = self.format.bytes_per_pixel();
        let row_len = self.width as usize * bpp;
        let mut pixels = Vec::with_capacity(row_len * self.height as usize);
        for y in 0..self.height {
            pixels.extend_from_slice(&self.row(y)[..row_len]);
        }
        if self.format == PixelFormat::Bgra8 {
            for px in pixels.chunks_exact_mut(4) {
                px.swap(0, 2);
            }
        }
        Canvas {
            width: self.width,
            height: self.height,
            pixels,
        }
    }
}

// ── Canvas ───────────────────────────────────────────────────────

/// A per-viewer, mutable RGBA copy of a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Canvas {
    pub width: u32,
    pub height: u32,
    /// Tightly packed RGBA, `width * height * 4` bytes.
    pub pixels: Vec<u8>,
}

impl Canvas {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width as usize * height as usize * 4],
        }
    }

    /// Alpha-blend `rgba` onto the pixel at `(x, y)`; out-of-bounds
    /// coordinates are ignored.
    pub fn blend(&mut self, x: i64, y: i64, rgba: [u8; 4]) {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return;
        }
        let offset = (y as usize * self.width as usize + x as usize) * 4;
        let alpha = rgba[3] as u32;
        let dst = &mut self.pixels[offset..offset + 4];
        for c in 0..3 {
            dst[c] = ((rgba[c] as u32 * alpha + dst[c] as u32 * (255 - alpha)) / 255) as u8;
        }
        dst[3] = 255;
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let offset = (y as usize * self.width as usize + x as usize) * 4;
        [
            self.pixels[offset],
            self.pixels[offset + 1],
            self.pixels[offset + 2],
            self.pixels[offset + 3],
        ]
    }

    /// Tightly packed BGRA bytes (the raw wire layout).
    pub fn to_bgra(&self) -> Vec<u8> {
        let mut out = self.pixels.clone();
        for px in out.chunks_exact_mut(4) {
            px.swap(0, 2);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canvas_drops_row_padding_and_swizzles() {
        // 2×1 BGRA frame with 4 bytes of padding per row.
        let frame = Frame {
            display_name: "d".into(),
            width: 2,
            height: 1,
            stride: 12,
            format: PixelFormat::Bgra8,
            payload: Bytes::from(vec![1, 2, 3, 255, 4, 5, 6, 255, 9, 9, 9, 9]),
            timestamp: Instant::now(),
            sequence: 0,
        };
        let canvas = frame.to_canvas();
        assert_eq!(canvas.pixels, vec![3, 2, 1, 255, 6, 5, 4, 255]);
        assert_eq!(canvas.to_bgra(), vec![1, 2, 3, 255, 4, 5, 6, 255]);
    }

    #[test]
    fn blend_ignores_out_of_bounds() {
        let mut canvas = Canvas::new(2, 2);
        canvas.blend(-1, 0, [255, 0, 0, 255]);
        canvas.blend(5, 5, [255, 0, 0, 255]);
        assert!(canvas.pixels.iter().all(|&b| b == 0));
        canvas.blend(1, 1, [255, 0, 0, 255]);
        assert_eq!(canvas.pixel(1, 1), [255, 0, 0, 255]);
    }
}
