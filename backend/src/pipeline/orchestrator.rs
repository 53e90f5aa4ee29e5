//! Fans a request out over per-image pipelines and assembles the result.
//!
//! Each image runs Validating -> Preprocessing -> Classifying on the blocking
//! thread pool. A failure ends that image only; the assembled outcomes keep
//! upload order regardless of which image finished first. Successful
//! outcomes are written to the prediction log after the whole request is
//! done, and a log failure never turns a classification into an error.

use actix_web::web;
use futures::future::join_all;
use serde::Serialize;
use shared::{Prediction, RequestType};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::Semaphore;

use super::classifier::ClassifierAdapter;
use super::error::ClassifyError;
use super::preprocess::Preprocessor;
use super::validator::{ImageValidator, sanitize_filename};
use super::{TopK, UploadedImage};
use crate::history::logger::PredictionLogger;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemStage {
    Received,
    Validating,
    Rejected,
    Preprocessing,
    PreprocessFailed,
    Classifying,
    ClassifyFailed,
    Succeeded,
}

#[derive(Debug, Default)]
pub struct PipelineCounters {
    received: AtomicU64,
    rejected: AtomicU64,
    preprocessed: AtomicU64,
    classified: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub received: u64,
    pub rejected: u64,
    pub preprocessed: u64,
    pub classified: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl PipelineCounters {
    fn enter(&self, stage: ItemStage) {
        let counter = match stage {
            ItemStage::Received => &self.received,
            ItemStage::Rejected => &self.rejected,
            ItemStage::Preprocessing => &self.preprocessed,
            ItemStage::Classifying => &self.classified,
            ItemStage::Succeeded => &self.succeeded,
            ItemStage::PreprocessFailed | ItemStage::ClassifyFailed => &self.failed,
            ItemStage::Validating => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            received: self.received.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            preprocessed: self.preprocessed.load(Ordering::Relaxed),
            classified: self.classified.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationOutcome {
    /// Zero-based position in the upload.
    pub index: usize,
    pub filename: String,
    pub processing_time: f64,
    pub result: Result<Vec<Prediction>, ClassifyError>,
}

impl ClassificationOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn is_rejected(&self) -> bool {
        matches!(&self.result, Err(e) if e.is_rejection())
    }
}

#[derive(Debug, Clone)]
pub struct BatchResult {
    pub total_images: usize,
    pub valid_images: usize,
    pub invalid_images: usize,
    pub successful_images: usize,
    pub outcomes: Vec<ClassificationOutcome>,
}

impl BatchResult {
    fn assemble(outcomes: Vec<ClassificationOutcome>) -> Self {
        let invalid_images = outcomes.iter().filter(|o| o.is_rejected()).count();
        let successful_images = outcomes.iter().filter(|o| o.is_success()).count();
        Self {
            total_images: outcomes.len(),
            valid_images: outcomes.len() - invalid_images,
            invalid_images,
            successful_images,
            outcomes,
        }
    }

    /// Outcomes rejected by validation, in upload order.
    pub fn rejected(&self) -> impl Iterator<Item = &ClassificationOutcome> {
        self.outcomes.iter().filter(|o| o.is_rejected())
    }
}

/// Validator, preprocessor and classifier for a single image. Holds no
/// per-request state, so one instance serves every request.
pub struct Pipeline {
    validator: ImageValidator,
    preprocessor: Preprocessor,
    classifier: ClassifierAdapter,
    counters: PipelineCounters,
}

impl Pipeline {
    pub fn new(validator: ImageValidator, preprocessor: Preprocessor, classifier: ClassifierAdapter) -> Self {
        Self {
            validator,
            preprocessor,
            classifier,
            counters: PipelineCounters::default(),
        }
    }

    pub fn classifier(&self) -> &ClassifierAdapter {
        &self.classifier
    }

    pub fn preprocessor(&self) -> &Preprocessor {
        &self.preprocessor
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    fn transition(&self, index: usize, filename: &str, stage: ItemStage) {
        log::debug!("Image {} ({}): {:?}", index, filename, stage);
        self.counters.enter(stage);
    }

    pub fn process(&self, index: usize, image: &UploadedImage, top_k: TopK) -> ClassificationOutcome {
        let started = Instant::now();
        let filename = sanitize_filename(&image.filename);
        self.transition(index, &filename, ItemStage::Received);

        let result = self.run_stages(index, &filename, image, top_k);
        match &result {
            Ok(predictions) => {
                if let Some(top) = predictions.first() {
                    log::info!(
                        "Classified {} as {} ({})",
                        filename,
                        top.class_name,
                        top.confidence_percentage
                    );
                }
            }
            Err(e) if e.is_rejection() => log::warn!("Rejected {}: {}", filename, e),
            Err(e) => log::error!("Classification of {} failed: {}", filename, e),
        }

        ClassificationOutcome {
            index,
            filename,
            processing_time: started.elapsed().as_secs_f64(),
            result,
        }
    }

    fn run_stages(
        &self,
        index: usize,
        filename: &str,
        image: &UploadedImage,
        top_k: TopK,
    ) -> Result<Vec<Prediction>, ClassifyError> {
        self.transition(index, filename, ItemStage::Validating);
        let validated = self.validator.validate(image).inspect_err(|_| {
            self.transition(index, filename, ItemStage::Rejected);
        })?;

        self.transition(index, filename, ItemStage::Preprocessing);
        let tensor = self
            .preprocessor
            .prepare(&validated, &image.data)
            .inspect_err(|_| self.transition(index, filename, ItemStage::PreprocessFailed))?;

        self.transition(index, filename, ItemStage::Classifying);
        let predictions = self
            .classifier
            .classify(&tensor, top_k)
            .inspect_err(|_| self.transition(index, filename, ItemStage::ClassifyFailed))?;

        self.transition(index, filename, ItemStage::Succeeded);
        Ok(predictions)
    }
}

pub struct BatchOrchestrator {
    pipeline: Arc<Pipeline>,
    logger: Arc<PredictionLogger>,
    max_batch_size: usize,
    permits: Arc<Semaphore>,
}

impl BatchOrchestrator {
    pub fn new(
        pipeline: Arc<Pipeline>,
        logger: Arc<PredictionLogger>,
        max_batch_size: usize,
        max_parallel_items: usize,
    ) -> Self {
        Self {
            pipeline,
            logger,
            max_batch_size,
            permits: Arc::new(Semaphore::new(max_parallel_items)),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn logger(&self) -> &Arc<PredictionLogger> {
        &self.logger
    }

    pub async fn run_single(
        &self,
        image: UploadedImage,
        top_k: TopK,
        user_ip: Option<String>,
    ) -> ClassificationOutcome {
        let mut outcomes = self.process_all(vec![image], top_k).await;
        self.log_successes(&outcomes, RequestType::Single, user_ip).await;
        outcomes.remove(0)
    }

    pub async fn run_batch(
        &self,
        images: Vec<UploadedImage>,
        top_k: TopK,
        user_ip: Option<String>,
    ) -> Result<BatchResult, ClassifyError> {
        if images.is_empty() {
            return Err(ClassifyError::MissingInput("no images provided".into()));
        }
        if images.len() > self.max_batch_size {
            return Err(ClassifyError::BatchSizeExceeded {
                size: images.len(),
                limit: self.max_batch_size,
            });
        }

        let outcomes = self.process_all(images, top_k).await;
        self.log_successes(&outcomes, RequestType::Batch, user_ip).await;

        let result = BatchResult::assemble(outcomes);
        log::info!(
            "Batch finished: {} images, {} valid, {} invalid, {} classified",
            result.total_images,
            result.valid_images,
            result.invalid_images,
            result.successful_images
        );
        Ok(result)
    }

    async fn process_all(&self, images: Vec<UploadedImage>, top_k: TopK) -> Vec<ClassificationOutcome> {
        let tasks = images.into_iter().enumerate().map(|(index, image)| {
            let pipeline = self.pipeline.clone();
            let permits = self.permits.clone();
            async move {
                let filename = sanitize_filename(&image.filename);
                let permit = match permits.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => return worker_failure(index, filename, e.to_string()),
                };
                let joined = web::block(move || {
                    let outcome = pipeline.process(index, &image, top_k);
                    drop(permit);
                    outcome
                })
                .await;
                joined.unwrap_or_else(|e| worker_failure(index, filename, e.to_string()))
            }
        });
        join_all(tasks).await
    }

    async fn log_successes(&self, outcomes: &[ClassificationOutcome], request_type: RequestType, user_ip: Option<String>) {
        let successes: Vec<(String, Vec<Prediction>, f64)> = outcomes
            .iter()
            .filter_map(|o| {
                o.result
                    .as_ref()
                    .ok()
                    .map(|p| (o.filename.clone(), p.clone(), o.processing_time))
            })
            .collect();
        if successes.is_empty() {
            return;
        }

        let logger = self.logger.clone();
        let written = web::block(move || {
            for (filename, predictions, processing_time) in successes {
                if let Err(e) = logger.record(&filename, request_type, &predictions, processing_time, user_ip.as_deref()) {
                    log::error!("Failed to log prediction for {}: {}", filename, e);
                }
            }
        })
        .await;
        if let Err(e) = written {
            log::error!("Prediction logging task failed: {}", e);
        }
    }
}

fn worker_failure(index: usize, filename: String, reason: String) -> ClassificationOutcome {
    log::error!("Worker for image {} ({}) did not complete: {}", index, filename, reason);
    ClassificationOutcome {
        index,
        filename,
        processing_time: 0.0,
        result: Err(ClassifyError::InferenceError(format!("worker did not complete: {}", reason))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LimitsConfig, PreprocessingConfig};
    use crate::history::store::MemoryStore;
    use crate::test_support::{Behaviour, StubModel, encode_image, encode_solid, labels, truncated};
    use image::ImageFormat;

    struct Harness {
        orchestrator: BatchOrchestrator,
        model: Arc<StubModel>,
        logger: Arc<PredictionLogger>,
    }

    fn harness(behaviour: Behaviour) -> Harness {
        let model = StubModel::new(6, behaviour);
        let limits = LimitsConfig::default();
        let pipeline = Pipeline::new(
            ImageValidator::new(&limits),
            Preprocessor::new(&PreprocessingConfig::default()),
            ClassifierAdapter::new(model.clone(), Arc::new(labels(6))),
        );
        let logger = Arc::new(PredictionLogger::open(Box::new(MemoryStore::new()), 1000, 50).unwrap());
        Harness {
            orchestrator: BatchOrchestrator::new(Arc::new(pipeline), logger.clone(), limits.max_batch_size, 4),
            model,
            logger,
        }
    }

    fn solid(name: &str, shade: u8) -> UploadedImage {
        UploadedImage::new(name, Some("image/png".into()), encode_solid(48, 48, [shade, shade / 2, 255 - shade]))
    }

    #[actix_web::test]
    async fn test_single_success_is_logged() {
        let h = harness(Behaviour::FromInput);
        let outcome = h
            .orchestrator
            .run_single(solid("../cat.png", 200), TopK::new(3), Some("127.0.0.1".into()))
            .await;
        assert_eq!(outcome.filename, "cat.png");
        assert_eq!(outcome.result.as_ref().unwrap().len(), 3);

        let history = h.logger.query(None).unwrap();
        assert_eq!(history.logs.len(), 1);
        assert_eq!(history.logs[0].request_type, RequestType::Single);
        assert_eq!(history.logs[0].filename, "cat.png");
        assert_eq!(history.logs[0].user_ip.as_deref(), Some("127.0.0.1"));
    }

    #[actix_web::test]
    async fn test_oversized_never_reaches_preprocessing() {
        let h = harness(Behaviour::FromInput);
        let image = UploadedImage::new("huge.png", None, vec![0u8; 16 * 1024 * 1024 + 1]);
        let outcome = h.orchestrator.run_single(image, TopK::new(5), None).await;

        assert!(matches!(outcome.result, Err(ClassifyError::FileTooLarge { .. })));
        let counters = h.orchestrator.pipeline().counters();
        assert_eq!(counters.preprocessed, 0);
        assert_eq!(counters.rejected, 1);
        assert_eq!(h.model.calls(), 0);
        assert_eq!(h.logger.len().unwrap(), 0);
    }

    #[actix_web::test]
    async fn test_batch_isolates_corrupt_item() {
        let h = harness(Behaviour::FromInput);
        let good = encode_image(64, 64, ImageFormat::Png);
        let batch = vec![
            solid("a.png", 10),
            solid("b.png", 120),
            UploadedImage::new("broken.png", None, truncated(good.clone(), good.len() / 2)),
            solid("d.png", 240),
        ];
        let individual: Vec<ClassificationOutcome> = {
            let mut out = Vec::new();
            for image in batch.clone() {
                out.push(h.orchestrator.run_single(image, TopK::new(4), None).await);
            }
            out
        };
        h.logger.clear().unwrap();

        let result = h.orchestrator.run_batch(batch, TopK::new(4), None).await.unwrap();
        assert_eq!(result.outcomes.len(), 4);
        assert_eq!(result.total_images, 4);
        assert_eq!(result.valid_images, 4);
        assert_eq!(result.invalid_images, 0);
        assert_eq!(result.successful_images, 3);
        assert!(matches!(result.outcomes[2].result, Err(ClassifyError::DecodeError(_))));

        for (index, outcome) in result.outcomes.iter().enumerate() {
            assert_eq!(outcome.index, index);
            assert_eq!(outcome.filename, individual[index].filename);
            assert_eq!(outcome.result, individual[index].result);
        }

        let history = h.logger.query(None).unwrap();
        assert_eq!(history.logs.len(), 3);
        assert!(history.logs.iter().all(|e| e.request_type == RequestType::Batch));
        assert!(history.logs.iter().all(|e| e.filename != "broken.png"));
    }

    #[actix_web::test]
    async fn test_rejections_are_counted_separately() {
        let h = harness(Behaviour::FromInput);
        let batch = vec![
            UploadedImage::new("notes.txt", Some("text/plain".into()), b"hello".to_vec()),
            solid("ok.png", 90),
            UploadedImage::new("tiny.png", None, encode_image(8, 8, ImageFormat::Png)),
        ];
        let result = h.orchestrator.run_batch(batch, TopK::new(2), None).await.unwrap();
        assert_eq!(result.total_images, 3);
        assert_eq!(result.invalid_images, 2);
        assert_eq!(result.valid_images, 1);
        let rejected: Vec<usize> = result.rejected().map(|o| o.index).collect();
        assert_eq!(rejected, vec![0, 2]);
        assert!(result.outcomes[1].is_success());
    }

    #[actix_web::test]
    async fn test_batch_size_boundary() {
        let h = harness(Behaviour::FromInput);
        let ten: Vec<UploadedImage> = (0..10).map(|i| solid(&format!("{}.png", i), i * 20)).collect();
        let result = h.orchestrator.run_batch(ten, TopK::new(1), None).await.unwrap();
        assert_eq!(result.successful_images, 10);
        assert_eq!(h.logger.len().unwrap(), 10);

        let h = harness(Behaviour::FromInput);
        let eleven: Vec<UploadedImage> = (0..11).map(|i| solid(&format!("{}.png", i), i * 20)).collect();
        let err = h.orchestrator.run_batch(eleven, TopK::new(1), None).await.unwrap_err();
        assert_eq!(err, ClassifyError::BatchSizeExceeded { size: 11, limit: 10 });
        assert_eq!(h.logger.len().unwrap(), 0);
        assert_eq!(h.model.calls(), 0);
        assert_eq!(h.orchestrator.pipeline().counters().received, 0);
    }

    #[actix_web::test]
    async fn test_empty_batch_is_missing_input() {
        let h = harness(Behaviour::FromInput);
        let err = h.orchestrator.run_batch(Vec::new(), TopK::new(1), None).await.unwrap_err();
        assert!(matches!(err, ClassifyError::MissingInput(_)));
    }

    #[actix_web::test]
    async fn test_inference_failure_not_logged() {
        let h = harness(Behaviour::Fail);
        let result = h
            .orchestrator
            .run_batch(vec![solid("a.png", 1), solid("b.png", 2)], TopK::new(1), None)
            .await
            .unwrap();
        assert_eq!(result.successful_images, 0);
        assert!(result
            .outcomes
            .iter()
            .all(|o| matches!(o.result, Err(ClassifyError::InferenceError(_)))));
        assert_eq!(h.model.calls(), 2);
        assert_eq!(h.logger.len().unwrap(), 0);
        assert_eq!(h.orchestrator.pipeline().counters().failed, 2);
    }
}
