use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use strum_macros::Display;

/// Sentinel reported as the most common class when the log is empty.
pub const NO_DATA: &str = "N/A";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Prediction {
    pub class_id: String,
    pub class_name: String,
    pub confidence: f32,
    pub confidence_percentage: String,
}

impl Prediction {
    pub fn new(class_id: impl Into<String>, class_name: impl Into<String>, confidence: f32) -> Self {
        Self {
            class_id: class_id.into(),
            class_name: class_name.into(),
            confidence,
            confidence_percentage: format!("{:.2}%", confidence * 100.0),
        }
    }
}

#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RequestType {
    Single,
    Batch,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LogEntry {
    pub id: u64,
    pub timestamp: DateTime<Local>,
    pub filename: String,
    pub request_type: RequestType,
    pub top_prediction: Prediction,
    pub total_predictions: usize,
    pub all_predictions: Vec<Prediction>,
    pub processing_time: f64,
    pub user_ip: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Statistics {
    pub total_predictions: usize,
    pub today_predictions: usize,
    pub single_requests: usize,
    pub batch_requests: usize,
    pub average_confidence: f64,
    pub most_common_class: String,
}

impl Default for Statistics {
    fn default() -> Self {
        Self {
            total_predictions: 0,
            today_predictions: 0,
            single_requests: 0,
            batch_requests: 0,
            average_confidence: 0.0,
            most_common_class: NO_DATA.to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SingleClassificationResponse {
    pub status: String,
    pub filename: String,
    pub predictions: Vec<Prediction>,
    pub total_predictions: usize,
    pub processing_time: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BatchItemResult {
    pub image_index: usize,
    pub filename: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predictions: Option<Vec<Prediction>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct InvalidFile {
    pub index: usize,
    pub filename: String,
    pub error: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BatchClassificationResponse {
    pub status: String,
    pub total_images: usize,
    pub valid_images: usize,
    pub invalid_images: usize,
    pub successful_images: usize,
    pub results: Vec<BatchItemResult>,
    pub invalid_files: Vec<InvalidFile>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HistoryResponse {
    pub logs: Vec<LogEntry>,
    pub statistics: Statistics,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}
