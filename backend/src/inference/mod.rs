pub mod labels;
#[cfg(feature = "torch")]
pub mod torch;

use crate::pipeline::ImageTensor;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Model loading failed: {0}")]
    Load(String),
    #[error("Inference backend error: {0}")]
    Backend(String),
    #[error("Model lock poisoned")]
    Poisoned,
}

/// A loaded classifier mapping a preprocessed tensor to one probability per class.
///
/// Implementations are created once at startup and shared across requests;
/// `predict` may be called concurrently, so backends that are not safe for
/// concurrent use must serialize the call internally.
pub trait ImageModel: Send + Sync {
    fn name(&self) -> &str;

    fn predict(&self, input: &ImageTensor) -> Result<Vec<f32>, ModelError>;
}
