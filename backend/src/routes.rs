use actix_files::Files;
use actix_multipart::Multipart;
use actix_web::http::StatusCode;
use actix_web::{HttpRequest, HttpResponse, web};
use chrono::NaiveDate;
use futures::{StreamExt, TryStreamExt};
use log::{info, warn};
use serde::Deserialize;
use serde_json::json;
use shared::{
    BatchClassificationResponse, BatchItemResult, ErrorResponse, InvalidFile,
    SingleClassificationResponse,
};

use crate::config::LimitsConfig;
use crate::history::store::StorageError;
use crate::pipeline::error::ClassifyError;
use crate::pipeline::orchestrator::{BatchOrchestrator, ClassificationOutcome};
use crate::pipeline::validator::SupportedFormat;
use crate::pipeline::{TopK, UploadedImage};

const SINGLE_FIELD: &str = "image";
const BATCH_FIELD: &str = "images";

/// Everything the handlers share, built once in `main`.
pub struct ApiState {
    pub orchestrator: BatchOrchestrator,
    pub limits: LimitsConfig,
}

impl ApiState {
    pub fn new(orchestrator: BatchOrchestrator, limits: LimitsConfig) -> Self {
        Self { orchestrator, limits }
    }

    fn top_k(&self, raw: Option<&str>) -> TopK {
        TopK::parse(raw, self.limits.default_top_k, self.limits.max_top_k)
    }
}

#[derive(Debug, Deserialize)]
struct ClassifyQuery {
    top_k: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<String>,
    date: Option<String>,
}

pub fn configure_routes(cfg: &mut web::ServiceConfig, static_dir: Option<String>) {
    cfg.service(web::resource("/api/classify").route(web::post().to(classify_single)))
        .service(web::resource("/api/classify/batch").route(web::post().to(classify_batch)))
        .service(
            web::resource("/api/history")
                .route(web::get().to(get_history))
                .route(web::delete().to(clear_history)),
        )
        .service(web::resource("/api/health").route(web::get().to(health)))
        .service(web::resource("/api/info").route(web::get().to(api_info)));

    if let Some(dir) = static_dir {
        info!("Serving static files from {}", dir);
        cfg.service(Files::new("/static", dir).index_file("index.html"));
    }
}

fn status_for(err: &ClassifyError) -> StatusCode {
    match err {
        ClassifyError::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        ClassifyError::UnsupportedFormat(_)
        | ClassifyError::DimensionOutOfRange { .. }
        | ClassifyError::DecodeError(_)
        | ClassifyError::BatchSizeExceeded { .. }
        | ClassifyError::MissingInput(_) => StatusCode::BAD_REQUEST,
        ClassifyError::InferenceError(_) | ClassifyError::StorageError(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn error_response(err: &ClassifyError) -> HttpResponse {
    HttpResponse::build(status_for(err)).json(ErrorResponse {
        error: err.kind().as_str().to_string(),
        message: err.to_string(),
    })
}

fn storage_failure(err: StorageError) -> HttpResponse {
    log::error!("Prediction history failure: {}", err);
    error_response(&ClassifyError::StorageError(err.to_string()))
}

fn client_ip(req: &HttpRequest) -> Option<String> {
    req.connection_info().realip_remote_addr().map(str::to_string)
}

/// What to do with matching file parts beyond `max_parts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExtraParts {
    /// Fail the whole upload with `BatchSizeExceeded`.
    Reject,
    /// Read past them without keeping any bytes.
    Skip,
}

#[derive(Debug, Clone, Copy)]
struct UploadLimits {
    max_file_size: usize,
    max_parts: usize,
    extra: ExtraParts,
}

fn malformed(err: impl std::fmt::Display) -> ClassifyError {
    ClassifyError::MissingInput(format!("malformed multipart body: {}", err))
}

async fn drain(field: &mut actix_multipart::Field) -> Result<(), ClassifyError> {
    while let Some(chunk) = field.next().await {
        chunk.map_err(malformed)?;
    }
    Ok(())
}

/// Collects the file parts named `field_name`. Parts without a filename are
/// skipped. Bytes past `max_file_size` are counted but not kept, so the
/// validator can still report the real size. A body that is not multipart,
/// or that ends before its first part, yields no images.
async fn read_images(
    mut payload: Multipart,
    field_name: &str,
    limits: UploadLimits,
) -> Result<Vec<UploadedImage>, ClassifyError> {
    let mut images = Vec::new();
    let mut matched = 0usize;

    loop {
        let mut field = match payload.try_next().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) if matched == 0 => {
                log::debug!("Multipart body without usable parts: {}", e);
                break;
            }
            Err(e) => return Err(malformed(e)),
        };

        let (name, filename) = match field.content_disposition() {
            Some(cd) => (
                cd.get_name().map(str::to_string),
                cd.get_filename().map(str::to_string),
            ),
            None => (None, None),
        };
        let filename = match filename.filter(|f| !f.is_empty()) {
            Some(f) if name.as_deref() == Some(field_name) => f,
            _ => {
                drain(&mut field).await?;
                continue;
            }
        };

        matched += 1;
        if matched > limits.max_parts {
            match limits.extra {
                ExtraParts::Reject => {
                    return Err(ClassifyError::BatchSizeExceeded {
                        size: matched,
                        limit: limits.max_parts,
                    });
                }
                ExtraParts::Skip => {
                    warn!("Ignoring extra upload {} beyond the first {}", filename, limits.max_parts);
                    drain(&mut field).await?;
                    continue;
                }
            }
        }
        let content_type = field.content_type().map(|m| m.to_string());

        let mut data = Vec::new();
        let mut size = 0usize;
        while let Some(chunk) = field.next().await {
            let chunk = chunk.map_err(malformed)?;
            size += chunk.len();
            if size <= limits.max_file_size {
                data.extend_from_slice(&chunk);
            }
        }
        images.push(UploadedImage {
            filename,
            content_type,
            data,
            size,
        });
    }
    Ok(images)
}

async fn classify_single(
    req: HttpRequest,
    state: web::Data<ApiState>,
    query: web::Query<ClassifyQuery>,
    payload: Multipart,
) -> HttpResponse {
    let limits = UploadLimits {
        max_file_size: state.limits.max_file_size,
        max_parts: 1,
        extra: ExtraParts::Skip,
    };
    let mut images = match read_images(payload, SINGLE_FIELD, limits).await {
        Ok(images) => images,
        Err(e) => {
            warn!("Upload rejected: {}", e);
            return error_response(&e);
        }
    };
    if images.is_empty() {
        return error_response(&ClassifyError::MissingInput("no image file provided".into()));
    }
    let image = images.swap_remove(0);

    let top_k = state.top_k(query.top_k.as_deref());
    let outcome = state
        .orchestrator
        .run_single(image, top_k, client_ip(&req))
        .await;

    match outcome.result {
        Ok(predictions) => HttpResponse::Ok().json(SingleClassificationResponse {
            status: "success".into(),
            filename: outcome.filename,
            total_predictions: predictions.len(),
            predictions,
            processing_time: outcome.processing_time,
        }),
        Err(e) => error_response(&e),
    }
}

fn item_result(outcome: &ClassificationOutcome) -> BatchItemResult {
    match &outcome.result {
        Ok(predictions) => BatchItemResult {
            image_index: outcome.index,
            filename: outcome.filename.clone(),
            status: "success".into(),
            predictions: Some(predictions.clone()),
            error: None,
            message: None,
        },
        Err(e) => BatchItemResult {
            image_index: outcome.index,
            filename: outcome.filename.clone(),
            status: "error".into(),
            predictions: None,
            error: Some(e.kind().as_str().to_string()),
            message: Some(e.to_string()),
        },
    }
}

async fn classify_batch(
    req: HttpRequest,
    state: web::Data<ApiState>,
    query: web::Query<ClassifyQuery>,
    payload: Multipart,
) -> HttpResponse {
    let limits = UploadLimits {
        max_file_size: state.limits.max_file_size,
        max_parts: state.limits.max_batch_size,
        extra: ExtraParts::Reject,
    };
    let batch = match read_images(payload, BATCH_FIELD, limits).await {
        Ok(images) => {
            let top_k = state.top_k(query.top_k.as_deref());
            state
                .orchestrator
                .run_batch(images, top_k, client_ip(&req))
                .await
        }
        Err(e) => Err(e),
    };
    let batch = match batch {
        Ok(batch) => batch,
        Err(e) if e.is_request_level() => {
            warn!("Batch rejected: {}", e);
            return error_response(&e);
        }
        Err(e) => {
            log::error!("Batch failed: {}", e);
            return error_response(&e);
        }
    };

    let invalid_files = batch
        .rejected()
        .filter_map(|o| {
            o.result.as_ref().err().map(|e| InvalidFile {
                index: o.index,
                filename: o.filename.clone(),
                error: e.kind().as_str().to_string(),
                message: e.to_string(),
            })
        })
        .collect();

    HttpResponse::Ok().json(BatchClassificationResponse {
        status: "success".into(),
        total_images: batch.total_images,
        valid_images: batch.valid_images,
        invalid_images: batch.invalid_images,
        successful_images: batch.successful_images,
        results: batch.outcomes.iter().map(item_result).collect(),
        invalid_files,
    })
}

async fn get_history(state: web::Data<ApiState>, query: web::Query<HistoryQuery>) -> HttpResponse {
    let limit = query.limit.as_deref().and_then(|v| v.trim().parse::<usize>().ok());
    let logger = state.orchestrator.logger();

    let result = match query.date.as_deref() {
        Some(raw) => match NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d") {
            Ok(date) => logger.query_date(date, limit),
            Err(_) => {
                return error_response(&ClassifyError::MissingInput(format!(
                    "invalid date '{}', expected YYYY-MM-DD",
                    raw
                )));
            }
        },
        None => logger.query(limit),
    };

    match result {
        Ok(history) => HttpResponse::Ok().json(history),
        Err(e) => storage_failure(e),
    }
}

async fn clear_history(state: web::Data<ApiState>) -> HttpResponse {
    match state.orchestrator.logger().clear() {
        Ok(()) => HttpResponse::Ok().json(json!({
            "status": "success",
            "message": "Prediction history cleared"
        })),
        Err(e) => storage_failure(e),
    }
}

async fn health(state: web::Data<ApiState>) -> HttpResponse {
    let pipeline = state.orchestrator.pipeline();
    let classifier = pipeline.classifier();
    let statistics = match state.orchestrator.logger().statistics() {
        Ok(statistics) => statistics,
        Err(e) => return storage_failure(e),
    };
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "model": classifier.model_name(),
        "num_classes": classifier.num_classes(),
        "pipeline": pipeline.counters(),
        "predictions_logged": statistics.total_predictions,
    }))
}

async fn api_info(state: web::Data<ApiState>) -> HttpResponse {
    let pipeline = state.orchestrator.pipeline();
    let formats: Vec<&str> = SupportedFormat::ALL.iter().map(|f| f.name()).collect();
    let limits = &state.limits;
    HttpResponse::Ok().json(json!({
        "name": "Image Classification API",
        "version": env!("CARGO_PKG_VERSION"),
        "model": pipeline.classifier().model_name(),
        "num_classes": pipeline.classifier().num_classes(),
        "input_size": pipeline.preprocessor().input_size(),
        "endpoints": {
            "POST /api/classify": "Classify one image (multipart field 'image', query 'top_k')",
            "POST /api/classify/batch": "Classify up to max_batch_size images (multipart field 'images')",
            "GET /api/history": "Prediction log and statistics (query 'limit', 'date')",
            "DELETE /api/history": "Clear the prediction log",
            "GET /api/health": "Service health and pipeline counters",
            "GET /api/info": "This document",
        },
        "supported_formats": formats,
        "limits": {
            "max_file_size": limits.max_file_size,
            "min_dimension": limits.min_dimension,
            "max_dimension": limits.max_dimension,
            "max_batch_size": limits.max_batch_size,
            "default_top_k": limits.default_top_k,
            "max_top_k": limits.max_top_k,
        },
    }))
}
