pub mod classifier;
pub mod error;
pub mod orchestrator;
pub mod preprocess;
pub mod validator;

use ndarray::Array4;

/// NCHW input tensor, batch dimension of one.
pub type ImageTensor = Array4<f32>;

/// One uploaded file, owned by the request that received it.
#[derive(Debug, Clone)]
pub struct UploadedImage {
    pub filename: String,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
    /// Bytes received; can exceed `data.len()` when the upload was cut off at the size limit.
    pub size: usize,
}

impl UploadedImage {
    pub fn new(filename: impl Into<String>, content_type: Option<String>, data: Vec<u8>) -> Self {
        let size = data.len();
        Self {
            filename: filename.into(),
            content_type,
            data,
            size,
        }
    }
}

/// Requested number of predictions, already bounded to `[1, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopK(usize);

impl TopK {
    /// Falls back to `default` when the value is missing, unparseable or out of range.
    pub fn parse(raw: Option<&str>, default: usize, max: usize) -> Self {
        match raw.and_then(|v| v.trim().parse::<usize>().ok()) {
            Some(k) if (1..=max).contains(&k) => TopK(k),
            _ => TopK(default),
        }
    }

    pub fn new(k: usize) -> Self {
        TopK(k.max(1))
    }

    pub fn get(&self) -> usize {
        self.0
    }
}
