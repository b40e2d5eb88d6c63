//! Tile-level change detection between consecutive captures of a display.
//!
//! The screen is divided into `block_size × block_size` tiles that are
//! compared row by row against the previous frame. The result tells the
//! worker whether anything changed at all and which region did.

use std::cmp;

use crate::display::Rect;
use crate::frame::Frame;

/// Default tile edge in pixels.
pub const DEFAULT_BLOCK_SIZE: usize = 64;

/// Above this share of changed tiles the delta is promoted to a full frame.
const FULL_FRAME_RATIO: f64 = 0.80;

// ── DeltaFrame ───────────────────────────────────────────────────

/// Result of one detection pass.
///
/// `full_frame` is set for the first frame, after a resolution change, and
/// when most tiles changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaFrame {
    pub width: u32,
    pub height: u32,
    pub changed_blocks: Vec<Rect>,
    pub full_frame: bool,
}

impl DeltaFrame {
    /// A delta reporting that nothing changed.
    pub fn unchanged(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            changed_blocks: Vec::new(),
            full_frame: false,
        }
    }

    fn full(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            changed_blocks: vec![Rect::new(0, 0, width, height)],
            full_frame: true,
        }
    }

    pub fn is_unchanged(&self) -> bool {
        !self.full_frame && self.changed_blocks.is_empty()
    }

    /// Smallest rectangle covering every changed tile.
    pub fn bounding_box(&self) -> Option<Rect> {
        self.changed_blocks
            .iter()
            .copied()
            .reduce(|acc, block| acc.union(&block))
    }

    /// Fraction of the screen area that changed (0.0 – 1.0).
    pub fn change_ratio(&self) -> f64 {
        if self.full_frame {
            return 1.0;
        }
        let total = self.width as f64 * self.height as f64;
        if total == 0.0 {
            return 0.0;
        }
        let changed: f64 = self
            .changed_blocks
            .iter()
            .map(|b| b.width as f64 * b.height as f64)
            .sum();
        (changed / total).min(1.0)
    }
}

// ── DeltaDetector ────────────────────────────────────────────────

/// Remembers the previous frame of one display.
pub struct DeltaDetector {
    previous: Option<Frame>,
    block_size: usize,
}

impl Default for DeltaDetector {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE)
    }
}

impl DeltaDetector {
    /// A zero block size is bumped to one pixel.
    pub fn new(block_size: usize) -> Self {
        Self {
            previous: None,
            block_size: block_size.max(1),
        }
    }

    /// Forget the previous frame; the next detection is a full frame.
    pub fn reset(&mut self) {
        self.previous = None;
    }

    pub fn detect(&mut self, current: &Frame) -> DeltaFrame {
        let delta = match &self.previous {
            Some(prev)
                if prev.width == current.width
                    && prev.height == current.height
                    && prev.stride == current.stride =>
            {
                self.detect_blocks(current, prev)
            }
            _ => DeltaFrame::full(current.width, current.height),
        };
        // `Frame` payloads are reference counted; this clone is cheap.
        self.previous = Some(current.clone());
        delta
    }

    fn detect_blocks(&self, current: &Frame, previous: &Frame) -> DeltaFrame {
        if current.payload == previous.payload {
            return DeltaFrame::unchanged(current.width, current.height);
        }

        let w = current.width as usize;
        let h = current.height as usize;
        let bs = self.block_size;
        let blocks_x = w.div_ceil(bs);
        let blocks_y = h.div_ceil(bs);

        let mut changed = Vec::new();
        for by in 0..blocks_y {
            for bx in 0..blocks_x {
                let start_x = bx * bs;
                let start_y = by * bs;
                let end_x = cmp::min(start_x + bs, w);
                let end_y = cmp::min(start_y + bs, h);
                if block_differs(current, previous, start_x, start_y, end_x, end_y) {
                    changed.push(Rect::new(
                        start_x as i32,
                        start_y as i32,
                        (end_x - start_x) as u32,
                        (end_y - start_y) as u32,
                    ));
                }
            }
        }

        let total_blocks = blocks_x * blocks_y;
        if !changed.is_empty() && changed.len() as f64 / total_blocks as f64 > FULL_FRAME_RATIO {
            return DeltaFrame::full(current.width, current.height);
        }
        DeltaFrame {
            width: current.width,
            height: current.height,
            changed_blocks: changed,
            full_frame: false,
        }
    }
}

fn block_differs(
    current: &Frame,
    previous: &Frame,
    start_x: usize,
    start_y: usize,
    end_x: usize,
    end_y: usize,
) -> bool {
    let bpp = current.format.bytes_per_pixel();
    let stride = current.stride as usize;
    let left = start_x * bpp;
    let right = end_x * bpp;
    (start_y..end_y).any(|y| {
        let row = y * stride;
        current.payload[row + left..row + right] != previous.payload[row + left..row + right]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;

    fn make_frame(w: u32, h: u32, fill: u8) -> Frame {
        Frame::packed("d", w, h, PixelFormat::Bgra8, vec![fill; (w * h * 4) as usize])
    }

    #[test]
    fn first_frame_is_full() {
        let mut det = DeltaDetector::new(64);
        let delta = det.detect(&make_frame(128, 128, 0));
        assert!(delta.full_frame);
        assert_eq!(delta.bounding_box(), Some(Rect::new(0, 0, 128, 128)));
    }

    #[test]
    fn identical_frame_has_no_changes() {
        let mut det = DeltaDetector::new(64);
        let frame = make_frame(128, 128, 0xAA);
        det.detect(&frame);
        let delta = det.detect(&frame);
        assert!(delta.is_unchanged());
        assert_eq!(delta.bounding_box(), None);
    }

    #[test]
    fn single_pixel_change_detects_block() {
        let mut det = DeltaDetector::new(64);
        det.detect(&make_frame(128, 128, 0));

        let mut data = vec![0u8; 128 * 128 * 4];
        // Pixel (70, 10) lives in tile (1, 0).
        data[(10 * 128 + 70) * 4] = 0xFF;
        let delta = det.detect(&Frame::packed("d", 128, 128, PixelFormat::Bgra8, data));

        assert!(!delta.full_frame);
        assert_eq!(delta.changed_blocks, vec![Rect::new(64, 0, 64, 64)]);
        assert!((delta.change_ratio() - 0.25).abs() < 1e-6);
    }

    #[test]
    fn full_change_collapses_to_full_frame() {
        let mut det = DeltaDetector::new(64);
        det.detect(&make_frame(128, 128, 0));
        assert!(det.detect(&make_frame(128, 128, 0xFF)).full_frame);
    }

    #[test]
    fn resolution_change_and_reset_force_full_frame() {
        let mut det = DeltaDetector::new(64);
        det.detect(&make_frame(64, 64, 0));
        assert!(det.detect(&make_frame(32, 32, 0)).full_frame);
        det.reset();
        assert!(det.detect(&make_frame(32, 32, 0)).full_frame);
    }

    #[test]
    fn bounding_box_spans_changed_tiles() {
        let delta = DeltaFrame {
            width: 256,
            height: 256,
            changed_blocks: vec![Rect::new(0, 0, 64, 64), Rect::new(128, 64, 64, 64)],
            full_frame: false,
        };
        assert_eq!(delta.bounding_box(), Some(Rect::new(0, 0, 192, 128)));
    }
}
