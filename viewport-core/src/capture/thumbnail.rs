//! Aspect-preserving thumbnails of the latest capture.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use image::imageops::{self, FilterType};
use image::RgbaImage;

use crate::capture::encoder;
use crate::error::CoreError;
use crate::frame::{Canvas, Frame};

const THUMBNAIL_QUALITY: u8 = 70;

/// Largest `(w, h)` that fits in `max_w × max_h` with the source aspect
/// ratio. Sources are never upscaled; neither side drops below 1.
pub fn fit_within(width: u32, height: u32, max_w: u32, max_h: u32) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (0, 0);
    }
    let scale = (max_w.max(1) as f64 / width as f64)
        .min(max_h.max(1) as f64 / height as f64)
        .min(1.0);
    let w = ((width as f64 * scale).round() as u32).clamp(1, width);
    let h = ((height as f64 * scale).round() as u32).clamp(1, height);
    (w, h)
}

/// Downsample `frame` and encode it as JPEG. CPU bound; run it on the
/// blocking pool.
pub fn render(frame: &Frame, max_w: u32, max_h: u32) -> Result<Bytes, CoreError> {
    let canvas = frame.to_canvas();
    let (w, h) = fit_within(canvas.width, canvas.height, max_w, max_h);
    if w == 0 {
        return Err(CoreError::Encode("thumbnail of an empty frame".into()));
    }
    let source = RgbaImage::from_raw(canvas.width, canvas.height, canvas.pixels)
        .ok_or_else(|| CoreError::Encode("frame buffer smaller than its geometry".into()))?;
    let scaled = if (w, h) == (source.width(), source.height()) {
        source
    } else {
        imageops::resize(&source, w, h, FilterType::Triangle)
    };
    let small = Canvas {
        width: w,
        height: h,
        pixels: scaled.into_raw(),
    };
    Ok(Bytes::from(encoder::encode_jpeg(&small, THUMBNAIL_QUALITY)?))
}

struct Cached {
    at: Instant,
    request: (u32, u32),
    data: Bytes,
}

/// Rate limiter for thumbnail rendering. Requests inside the minimum
/// interval with the same bounds are served from the last result.
pub struct ThumbnailThrottle {
    min_interval: Duration,
    last: Mutex<Option<Cached>>,
}

impl ThumbnailThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    pub fn cached(&self, max_w: u32, max_h: u32) -> Option<Bytes> {
        let last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        last.as_ref()
            .filter(|c| c.request == (max_w, max_h) && c.at.elapsed() < self.min_interval)
            .map(|c| c.data.clone())
    }

    pub fn store(&self, max_w: u32, max_h: u32, data: Bytes) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(Cached {
            at: Instant::now(),
            request: (max_w, max_h),
            data,
        });
    }
}
