//! Per-viewer frame encoding.
//!
//! - **Jpeg**: lossy, `image_quality` maps straight to the JPEG quality.
//! - **Png**: lossless; quality picks the deflate effort.
//! - **Zstd**: packed BGRA rows (the raw capture layout) compressed with
//!   zstd; quality maps inversely onto levels 1..=9.

use std::io::Cursor;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{ExtendedColorType, ImageEncoder};

use crate::context::Codec;
use crate::error::CoreError;
use crate::frame::Canvas;

const MIN_ZSTD_LEVEL: i32 = 1;
const MAX_ZSTD_LEVEL: i32 = 9;

/// Encode `canvas` with the viewer's codec and quality (1..=100).
pub fn encode(canvas: &Canvas, codec: Codec, quality: u8) -> Result<Bytes, CoreError> {
    let quality = quality.clamp(1, 100);
    let data = match codec {
        Codec::Jpeg => encode_jpeg(canvas, quality)?,
        Codec::Png => encode_png(canvas, quality)?,
        Codec::Zstd => encode_zstd(canvas, quality)?,
    };
    Ok(Bytes::from(data))
}

/// Higher quality means faster, larger output; lower means more effort.
pub fn zstd_level(quality: u8) -> i32 {
    let q = quality.clamp(1, 100) as i32;
    let span = MAX_ZSTD_LEVEL - MIN_ZSTD_LEVEL;
    MIN_ZSTD_LEVEL + (100 - q) * span / 99
}

pub(crate) fn encode_jpeg(canvas: &Canvas, quality: u8) -> Result<Vec<u8>, CoreError> {
    // JPEG has no alpha channel.
    let rgb: Vec<u8> = canvas
        .pixels
        .chunks_exact(4)
        .flat_map(|px| [px[0], px[1], px[2]])
        .collect();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality).write_image(
        &rgb,
        canvas.width,
        canvas.height,
        ExtendedColorType::Rgb8,
    )?;
    Ok(out)
}

fn encode_png(canvas: &Canvas, quality: u8) -> Result<Vec<u8>, CoreError> {
    let compression = if quality >= 80 {
        CompressionType::Fast
    } else if quality >= 40 {
        CompressionType::Default
    } else {
        CompressionType::Best
    };
    let mut out = Cursor::new(Vec::new());
    PngEncoder::new_with_quality(&mut out, compression, FilterType::Adaptive).write_image(
        &canvas.pixels,
        canvas.width,
        canvas.height,
        ExtendedColorType::Rgba8,
    )?;
    Ok(out.into_inner())
}

fn encode_zstd(canvas: &Canvas, quality: u8) -> Result<Vec<u8>, CoreError> {
    let raw = canvas.to_bgra();
    zstd::encode_all(raw.as_slice(), zstd_level(quality))
        .map_err(|e| CoreError::Encode(format!("zstd encode failed: {e}")))
}
