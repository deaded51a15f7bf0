//! Codec boundary.
//!
//! The queue only ever talks to [`Codec::transform`]; the pixel work behind it
//! is swappable. [`ImageCodec`] is the production backend built on the `image`
//! crate and runs entirely in-process.

use bytes::Bytes;
use image::codecs::avif::AvifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ExtendedColorType, GenericImageView, ImageEncoder, ImageFormat};

use crate::{OutputFormat, Settings, TransformError};

/// AVIF encoder speed (1 slowest .. 10 fastest).
const AVIF_SPEED: u8 = 6;

#[derive(Debug, Clone)]
pub struct TransformRequest {
    pub source: Bytes,
    pub mime: String,
    pub settings: Settings,
    /// Resize to this width before encoding, keeping the aspect ratio.
    pub resize_width: Option<u32>,
}

/// Encoded result plus the dimensions of the decoded source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformOutput {
    pub bytes: Bytes,
    pub width: u32,
    pub height: u32,
}

/// Stateless decode → (resize) → encode capability.
///
/// Implementations are called from the blocking thread pool and may take as
/// long as they need.
pub trait Codec: Send + Sync + 'static {
    fn transform(&self, request: &TransformRequest) -> Result<TransformOutput, TransformError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ImageCodec;

impl Codec for ImageCodec {
    fn transform(&self, request: &TransformRequest) -> Result<TransformOutput, TransformError> {
        let decoded = decode(&request.source, &request.mime)?;
        let (width, height) = decoded.dimensions();

        let encoded = match request.resize_width {
            Some(target_width) => {
                let resized = resize(&decoded, target_width);
                encode(&resized, request.settings.format, request.settings.quality)?
            }
            None => encode(&decoded, request.settings.format, request.settings.quality)?,
        };

        Ok(TransformOutput {
            bytes: Bytes::from(encoded),
            width,
            height,
        })
    }
}

pub fn decode(bytes: &[u8], mime: &str) -> Result<DynamicImage, TransformError> {
    let format = match mime {
        "image/jpeg" => ImageFormat::Jpeg,
        "image/png" => ImageFormat::Png,
        "image/webp" => ImageFormat::WebP,
        "image/avif" => ImageFormat::Avif,
        _ => {
            return Err(TransformError::Decode {
                mime: mime.to_owned(),
                message: "unsupported source format".to_owned(),
            })
        }
    };

    image::load_from_memory_with_format(bytes, format).map_err(|err| TransformError::Decode {
        mime: mime.to_owned(),
        message: err.to_string(),
    })
}

/// Height that keeps the aspect ratio when scaling `width` to `target_width`.
pub fn resized_height(width: u32, height: u32, target_width: u32) -> u32 {
    if width == 0 {
        return 0;
    }
    let scaled = (target_width as f64 * height as f64 / width as f64).round() as u32;
    scaled.max(1)
}

pub fn resize(image: &DynamicImage, target_width: u32) -> DynamicImage {
    let (width, height) = image.dimensions();
    let target_height = resized_height(width, height, target_width);
    image.resize_exact(target_width, target_height, FilterType::Lanczos3)
}

/// Encodes `image` as `format`. Quality applies to the lossy encoders (jpeg,
/// avif); the webp encoder is lossless and png has no quality knob.
pub fn encode(
    image: &DynamicImage,
    format: OutputFormat,
    quality: u8,
) -> Result<Vec<u8>, TransformError> {
    let mut out = Vec::new();
    let result = match format {
        OutputFormat::Jpeg => {
            let rgb = image.to_rgb8();
            JpegEncoder::new_with_quality(&mut out, quality).write_image(
                rgb.as_raw(),
                rgb.width(),
                rgb.height(),
                ExtendedColorType::Rgb8,
            )
        }
        OutputFormat::Png => {
            let rgba = image.to_rgba8();
            PngEncoder::new(&mut out).write_image(
                rgba.as_raw(),
                rgba.width(),
                rgba.height(),
                ExtendedColorType::Rgba8,
            )
        }
        OutputFormat::Webp => {
            let rgba = image.to_rgba8();
            WebPEncoder::new_lossless(&mut out).write_image(
                rgba.as_raw(),
                rgba.width(),
                rgba.height(),
                ExtendedColorType::Rgba8,
            )
        }
        OutputFormat::Avif => {
            let rgba = image.to_rgba8();
            AvifEncoder::new_with_speed_quality(&mut out, AVIF_SPEED, quality).write_image(
                rgba.as_raw(),
                rgba.width(),
                rgba.height(),
                ExtendedColorType::Rgba8,
            )
        }
    };

    result.map_err(|err| TransformError::Encode {
        format,
        message: err.to_string(),
    })?;
    Ok(out)
}
