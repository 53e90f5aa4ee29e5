use serde::Serialize;

/// Stable machine-readable error kinds reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    FileTooLarge,
    UnsupportedFormat,
    DimensionOutOfRange,
    DecodeError,
    InferenceError,
    BatchSizeExceeded,
    MissingInput,
    StorageError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::FileTooLarge => "file_too_large",
            ErrorKind::UnsupportedFormat => "unsupported_format",
            ErrorKind::DimensionOutOfRange => "dimension_out_of_range",
            ErrorKind::DecodeError => "decode_error",
            ErrorKind::InferenceError => "inference_error",
            ErrorKind::BatchSizeExceeded => "batch_size_exceeded",
            ErrorKind::MissingInput => "missing_input",
            ErrorKind::StorageError => "storage_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClassifyError {
    #[error("File size {size} bytes exceeds the maximum of {limit} bytes")]
    FileTooLarge { size: usize, limit: usize },
    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),
    #[error("Image dimensions {width}x{height} outside the allowed range [{min}, {max}]")]
    DimensionOutOfRange {
        width: u32,
        height: u32,
        min: u32,
        max: u32,
    },
    #[error("Failed to decode image: {0}")]
    DecodeError(String),
    #[error("Model inference failed: {0}")]
    InferenceError(String),
    #[error("Batch of {size} images exceeds the maximum of {limit} per request")]
    BatchSizeExceeded { size: usize, limit: usize },
    #[error("Missing input: {0}")]
    MissingInput(String),
    #[error("Prediction history unavailable: {0}")]
    StorageError(String),
}

impl ClassifyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClassifyError::FileTooLarge { .. } => ErrorKind::FileTooLarge,
            ClassifyError::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            ClassifyError::DimensionOutOfRange { .. } => ErrorKind::DimensionOutOfRange,
            ClassifyError::DecodeError(_) => ErrorKind::DecodeError,
            ClassifyError::InferenceError(_) => ErrorKind::InferenceError,
            ClassifyError::BatchSizeExceeded { .. } => ErrorKind::BatchSizeExceeded,
            ClassifyError::MissingInput(_) => ErrorKind::MissingInput,
            ClassifyError::StorageError(_) => ErrorKind::StorageError,
        }
    }

    /// Validation rejections, as opposed to failures after an image was accepted.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::FileTooLarge | ErrorKind::UnsupportedFormat | ErrorKind::DimensionOutOfRange
        )
    }

    /// Rejected before any per-item work begins.
    pub fn is_request_level(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::BatchSizeExceeded | ErrorKind::MissingInput
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings_match_serde() {
        let kinds = [
            ErrorKind::FileTooLarge,
            ErrorKind::UnsupportedFormat,
            ErrorKind::DimensionOutOfRange,
            ErrorKind::DecodeError,
            ErrorKind::InferenceError,
            ErrorKind::BatchSizeExceeded,
            ErrorKind::MissingInput,
            ErrorKind::StorageError,
        ];
        for kind in kinds {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn test_classification_of_errors() {
        let too_large = ClassifyError::FileTooLarge { size: 20, limit: 10 };
        assert!(too_large.is_rejection());
        assert!(!too_large.is_request_level());

        let batch = ClassifyError::BatchSizeExceeded { size: 11, limit: 10 };
        assert!(batch.is_request_level());
        assert!(!batch.is_rejection());

        let decode = ClassifyError::DecodeError("truncated".into());
        assert!(!decode.is_rejection());
        assert_eq!(decode.kind(), ErrorKind::DecodeError);
        assert_eq!(decode.to_string(), "Failed to decode image: truncated");
    }
}
