//! Structural checks on an uploaded blob before it reaches the model.
//!
//! Checks run in a fixed order and stop at the first failure: byte length,
//! detected format, then pixel dimensions. The format is detected from the
//! bytes themselves; the declared filename and content type are only
//! compared against it for diagnostics.

use image::{ImageFormat, ImageReader};
use log::debug;
use std::io::Cursor;

use super::UploadedImage;
use super::error::ClassifyError;
use crate::config::LimitsConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupportedFormat {
    Jpeg,
    Png,
    Gif,
    Bmp,
    WebP,
}

impl SupportedFormat {
    pub const ALL: [SupportedFormat; 5] = [
        SupportedFormat::Jpeg,
        SupportedFormat::Png,
        SupportedFormat::Gif,
        SupportedFormat::Bmp,
        SupportedFormat::WebP,
    ];

    pub fn from_image_format(format: ImageFormat) -> Option<Self> {
        match format {
            ImageFormat::Jpeg => Some(SupportedFormat::Jpeg),
            ImageFormat::Png => Some(SupportedFormat::Png),
            ImageFormat::Gif => Some(SupportedFormat::Gif),
            ImageFormat::Bmp => Some(SupportedFormat::Bmp),
            ImageFormat::WebP => Some(SupportedFormat::WebP),
            _ => None,
        }
    }

    pub fn image_format(&self) -> ImageFormat {
        match self {
            SupportedFormat::Jpeg => ImageFormat::Jpeg,
            SupportedFormat::Png => ImageFormat::Png,
            SupportedFormat::Gif => ImageFormat::Gif,
            SupportedFormat::Bmp => ImageFormat::Bmp,
            SupportedFormat::WebP => ImageFormat::WebP,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SupportedFormat::Jpeg => "JPEG",
            SupportedFormat::Png => "PNG",
            SupportedFormat::Gif => "GIF",
            SupportedFormat::Bmp => "BMP",
            SupportedFormat::WebP => "WEBP",
        }
    }

    fn extensions(&self) -> &'static [&'static str] {
        match self {
            SupportedFormat::Jpeg => &["jpg", "jpeg"],
            SupportedFormat::Png => &["png"],
            SupportedFormat::Gif => &["gif"],
            SupportedFormat::Bmp => &["bmp"],
            SupportedFormat::WebP => &["webp"],
        }
    }

    fn mime_type(&self) -> &'static str {
        match self {
            SupportedFormat::Jpeg => "image/jpeg",
            SupportedFormat::Png => "image/png",
            SupportedFormat::Gif => "image/gif",
            SupportedFormat::Bmp => "image/bmp",
            SupportedFormat::WebP => "image/webp",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedImage {
    pub width: u32,
    pub height: u32,
    pub format: SupportedFormat,
}

#[derive(Debug, Clone)]
pub struct ImageValidator {
    max_file_size: usize,
    min_dimension: u32,
    max_dimension: u32,
}

impl ImageValidator {
    pub fn new(limits: &LimitsConfig) -> Self {
        Self {
            max_file_size: limits.max_file_size,
            min_dimension: limits.min_dimension,
            max_dimension: limits.max_dimension,
        }
    }

    pub fn validate(&self, image: &UploadedImage) -> Result<ValidatedImage, ClassifyError> {
        let size = image.size.max(image.data.len());
        if size > self.max_file_size {
            return Err(ClassifyError::FileTooLarge {
                size,
                limit: self.max_file_size,
            });
        }

        let detected = image::guess_format(&image.data)
            .map_err(|_| ClassifyError::UnsupportedFormat("unrecognized image data".into()))?;
        let format = SupportedFormat::from_image_format(detected).ok_or_else(|| {
            ClassifyError::UnsupportedFormat(format!("{:?} is not an accepted format", detected))
        })?;

        let (width, height) = ImageReader::with_format(Cursor::new(&image.data), detected)
            .into_dimensions()
            .map_err(|e| ClassifyError::UnsupportedFormat(format!("unreadable {} data: {}", format.name(), e)))?;

        let in_range = |v: u32| (self.min_dimension..=self.max_dimension).contains(&v);
        if !in_range(width) || !in_range(height) {
            return Err(ClassifyError::DimensionOutOfRange {
                width,
                height,
                min: self.min_dimension,
                max: self.max_dimension,
            });
        }

        if !declared_matches(image, format) {
            debug!(
                "Declared type of {} ({:?}) differs from detected {}",
                sanitize_filename(&image.filename),
                image.content_type,
                format.name()
            );
        }

        Ok(ValidatedImage {
            width,
            height,
            format,
        })
    }
}

fn declared_matches(image: &UploadedImage, format: SupportedFormat) -> bool {
    let extension_ok = image
        .filename
        .rsplit_once('.')
        .map(|(_, ext)| format.extensions().contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(true);
    let content_type_ok = image
        .content_type
        .as_deref()
        .map(|ct| ct.eq_ignore_ascii_case(format.mime_type()) || ct == "application/octet-stream")
        .unwrap_or(true);
    extension_ok && content_type_ok
}

/// Reduces a client-supplied filename to its last path component made of
/// letters, digits (any script), `.`, `_` and `-`. Whitespace becomes `_`.
pub fn sanitize_filename(raw: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or("");
    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    let trimmed = cleaned.trim_start_matches(['.', '_']);
    if trimmed.is_empty() {
        "unknown".to_string()
    } else {
        trimmed.to_string()
    }
}
