use std::io::Cursor;
use std::sync::Arc;

use base64::Engine as _;
use bytes::Bytes;
use image::codecs::png::PngEncoder;
use image::{DynamicImage, ExtendedColorType, GenericImageView, ImageEncoder, ImageReader, Limits};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

#[derive(Debug, Error)]
pub enum PreviewError {
    #[error("failed to decode image: {source}")]
    Decode {
        #[from]
        source: image::ImageError,
    },

    #[error("png encoding failed: width={width}, height={height}, reason={reason}")]
    Encode {
        width: u32,
        height: u32,
        reason: String,
    },

    #[error("image too large: {width}x{height} = {pixels} pixels, max {max_pixels}")]
    ImageTooLarge {
        width: u32,
        height: u32,
        pixels: u64,
        max_pixels: u64,
    },

    #[error("input too large: {size} bytes, max {max_size}")]
    InputTooLarge { size: usize, max_size: usize },

    #[error("input bytes empty")]
    EmptyInput,

    #[error("preview job was cancelled")]
    Cancelled,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreviewConfig {
    pub max_input_bytes: usize,
    pub max_image_pixels: u64,
    pub max_alloc_bytes: u64,
    pub max_dimension: u32,
    /// Images with a longer edge are downscaled and re-encoded as PNG.
    pub max_edge: u32,
    pub max_concurrent_jobs: usize,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            max_input_bytes: 20 * 1024 * 1024,
            max_image_pixels: 50_000_000,
            max_alloc_bytes: 256 * 1024 * 1024,
            max_dimension: 12_000,
            max_edge: 320,
            max_concurrent_jobs: 2,
        }
    }
}

/// Builds `data:` URLs for image evidence thumbnails off the async executor.
pub struct PreviewGenerator {
    config: PreviewConfig,
    semaphore: Arc<Semaphore>,
}

impl PreviewGenerator {
    pub fn new(config: PreviewConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));
        Self { config, semaphore }
    }

    pub fn with_defaults() -> Self {
        Self::new(PreviewConfig::default())
    }

    /// Waits for a free job slot rather than rejecting; previews are
    /// best-effort and never block the bundle.
    #[instrument(skip(self, bytes), fields(input_size = bytes.len(), mime = %mime_type))]
    pub async fn data_url(&self, bytes: Bytes, mime_type: &str) -> Result<String, PreviewError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| PreviewError::Cancelled)?;

        let config = self.config.clone();
        let mime_type = mime_type.to_string();
        let result = tokio::task::spawn_blocking(move || Self::data_url_sync(&config, &bytes, &mime_type))
            .await
            .map_err(|_| PreviewError::Cancelled)?;

        if let Err(e) = &result {
            warn!(error = %e, "preview generation failed");
        }
        result
    }

    fn data_url_sync(config: &PreviewConfig, bytes: &[u8], mime_type: &str) -> Result<String, PreviewError> {
        let Some(img) = decode_image(config, bytes)? else {
            debug!("no decoder for this format, embedding as-is");
            return Ok(encode_data_url(mime_type, bytes));
        };
        let (w, h) = img.dimensions();

        if w.max(h) <= config.max_edge {
            debug!(width = w, height = h, "image small enough, embedding as-is");
            return Ok(encode_data_url(mime_type, bytes));
        }

        let thumbnail = img.thumbnail(config.max_edge, config.max_edge);
        let png = encode_png(&thumbnail)?;
        debug!(
            from_width = w,
            from_height = h,
            to_width = thumbnail.width(),
            to_height = thumbnail.height(),
            "image downscaled for preview"
        );
        Ok(encode_data_url("image/png", &png))
    }
}

impl Default for PreviewGenerator {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// `data:<mime>;base64,<payload>`
pub fn encode_data_url(mime_type: &str, bytes: &[u8]) -> String {
    format!(
        "data:{};base64,{}",
        mime_type,
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}

/// `Ok(None)` when the format is unrecognised (SVG, for one) or its decoder
/// is not compiled in.
fn decode_image(config: &PreviewConfig, raw_bytes: &[u8]) -> Result<Option<DynamicImage>, PreviewError> {
    if raw_bytes.is_empty() {
        return Err(PreviewError::EmptyInput);
    }

    if raw_bytes.len() > config.max_input_bytes {
        return Err(PreviewError::InputTooLarge {
            size: raw_bytes.len(),
            max_size: config.max_input_bytes,
        });
    }

    let mut reader = ImageReader::new(Cursor::new(raw_bytes))
        .with_guessed_format()
        .map_err(|e| PreviewError::Decode { source: e.into() })?;

    if !reader.format().is_some_and(|format| format.reading_enabled()) {
        return Ok(None);
    }

    let mut limits = Limits::default();
    limits.max_image_width = Some(config.max_dimension);
    limits.max_image_height = Some(config.max_dimension);
    limits.max_alloc = Some(config.max_alloc_bytes);
    reader.limits(limits);

    let img = reader.decode()?;
    let (w, h) = img.dimensions();
    let pixels = w as u64 * h as u64;

    if pixels > config.max_image_pixels {
        return Err(PreviewError::ImageTooLarge {
            width: w,
            height: h,
            pixels,
            max_pixels: config.max_image_pixels,
        });
    }

    Ok(Some(img))
}

fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, PreviewError> {
    let rgba = img.to_rgba8();
    let (width, height) = rgba.dimensions();

    let mut buffer = Vec::new();
    PngEncoder::new(&mut buffer)
        .write_image(rgba.as_raw(), width, height, ExtendedColorType::Rgba8)
        .map_err(|e| PreviewError::Encode {
            width,
            height,
            reason: e.to_string(),
        })?;

    Ok(buffer)
}

/// 1x1 GIF89a.
#[cfg(test)]
pub(crate) const TINY_GIF: &[u8] = b"GIF89a\x01\x00\x01\x00\x80\x00\x00\xff\xff\xff\x00\x00\x00!\xf9\x04\x01\x00\x00\x00\x00,\x00\x00\x00\x00\x01\x00\x01\x00\x00\x02\x02D\x01\x00;";

/// PNG signature followed by junk.
#[cfg(test)]
pub(crate) const CORRUPT_PNG: &[u8] = b"\x89PNG\r\n\x1a\nnot really a png";

#[cfg(test)]
pub(crate) fn create_test_png(width: u32, height: u32) -> Vec<u8> {
    use image::{ImageBuffer, Rgba};
    let img: ImageBuffer<Rgba<u8>, Vec<u8>> = ImageBuffer::from_fn(width, height, |x, y| {
        Rgba([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8, 255])
    });
    let mut buffer = Vec::new();
    PngEncoder::new(&mut buffer)
        .write_image(img.as_raw(), width, height, ExtendedColorType::Rgba8)
        .unwrap();
    buffer
}
