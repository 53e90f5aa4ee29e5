//! Fixtures shared by the unit tests: in-memory encoded images and a
//! deterministic model with call counters.

use chrono::Local;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use shared::{LogEntry, Prediction, RequestType};
use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::inference::labels::LabelSet;
use crate::inference::{ImageModel, ModelError};
use crate::pipeline::ImageTensor;

/// Gradient image encoded in `format`.
pub fn encode_image(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
    let rgb = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
    });
    let image = if format == ImageFormat::Gif {
        DynamicImage::ImageRgba8(DynamicImage::ImageRgb8(rgb).to_rgba8())
    } else {
        DynamicImage::ImageRgb8(rgb)
    };
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, format).unwrap();
    out.into_inner()
}

/// Image filled with one colour, so different fixtures give different scores.
pub fn encode_solid(width: u32, height: u32, colour: [u8; 3]) -> Vec<u8> {
    let rgb = RgbImage::from_pixel(width, height, Rgb(colour));
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(rgb)
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

pub fn truncated(mut data: Vec<u8>, keep: usize) -> Vec<u8> {
    data.truncate(keep);
    data
}

pub fn labels(n: usize) -> LabelSet {
    let text: String = (0..n).map(|i| format!("c{} class_{}\n", i, i)).collect();
    LabelSet::parse(&text).unwrap()
}

pub enum Behaviour {
    /// Scores derived from the mean intensity of the input.
    FromInput,
    /// Always the same vector.
    Fixed(Vec<f32>),
    /// Fails every call.
    Fail,
}

pub struct StubModel {
    num_classes: usize,
    behaviour: Behaviour,
    calls: AtomicUsize,
}

impl StubModel {
    pub fn new(num_classes: usize, behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            num_classes,
            behaviour,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ImageModel for StubModel {
    fn name(&self) -> &str {
        "stub"
    }

    fn predict(&self, input: &ImageTensor) -> Result<Vec<f32>, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behaviour {
            Behaviour::Fixed(scores) => Ok(scores.clone()),
            Behaviour::Fail => Err(ModelError::Backend("stub failure".into())),
            Behaviour::FromInput => {
                let mean = input.mean().unwrap_or(0.0);
                let raw: Vec<f32> = (0..self.num_classes)
                    .map(|i| 1.0 / (1.0 + (mean - i as f32 * 0.1).abs()))
                    .collect();
                let sum: f32 = raw.iter().sum();
                Ok(raw.into_iter().map(|v| v / sum).collect())
            }
        }
    }
}

pub fn log_entry(id: u64, class_name: &str, confidence: f32) -> LogEntry {
    let top = Prediction::new(format!("id_{}", class_name), class_name, confidence);
    LogEntry {
        id,
        timestamp: Local::now(),
        filename: format!("img_{}.png", id),
        request_type: RequestType::Single,
        top_prediction: top.clone(),
        total_predictions: 1,
        all_predictions: vec![top],
        processing_time: 0.01,
        user_ip: None,
    }
}
