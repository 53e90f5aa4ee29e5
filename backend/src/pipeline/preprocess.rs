use image::imageops::{self, FilterType};
use ndarray::Array4;

use super::error::ClassifyError;
use super::validator::ValidatedImage;
use super::ImageTensor;
use crate::config::PreprocessingConfig;

/// Decodes a validated image and turns it into the model's input tensor.
/// Everything stays in memory.
#[derive(Debug, Clone)]
pub struct Preprocessor {
    input_size: u32,
    filter: FilterType,
    mean: [f32; 3],
    std: [f32; 3],
}

fn parse_filter(method: &str) -> Option<FilterType> {
    match method.to_ascii_lowercase().as_str() {
        "nearest" => Some(FilterType::Nearest),
        "triangle" | "bilinear" => Some(FilterType::Triangle),
        "catmull_rom" | "bicubic" => Some(FilterType::CatmullRom),
        "gaussian" => Some(FilterType::Gaussian),
        "lanczos3" | "lanczos" => Some(FilterType::Lanczos3),
        _ => None,
    }
}

impl Preprocessor {
    pub fn new(config: &PreprocessingConfig) -> Self {
        let filter = parse_filter(&config.resize_method).unwrap_or_else(|| {
            log::warn!(
                "Unknown resize_method '{}', falling back to catmull_rom",
                config.resize_method
            );
            FilterType::CatmullRom
        });
        Self {
            input_size: config.input_size,
            filter,
            mean: config.normalization.mean,
            std: config.normalization.std,
        }
    }

    pub fn input_size(&self) -> u32 {
        self.input_size
    }

    pub fn prepare(&self, validated: &ValidatedImage, data: &[u8]) -> Result<ImageTensor, ClassifyError> {
        let decoded = image::load_from_memory_with_format(data, validated.format.image_format())
            .map_err(|e| ClassifyError::DecodeError(e.to_string()))?;

        // Palette, greyscale and 16-bit inputs all collapse to 8-bit RGB; alpha is dropped.
        let rgb = decoded.to_rgb8();
        let size = self.input_size;
        let resized = imageops::resize(&rgb, size, size, self.filter);

        let side = size as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                let value = pixel[c] as f32 / 255.0;
                tensor[[0, c, y as usize, x as usize]] = (value - self.mean[c]) / self.std[c];
            }
        }
        Ok(tensor)
    }
}
