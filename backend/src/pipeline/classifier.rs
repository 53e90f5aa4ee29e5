use shared::Prediction;
use std::sync::Arc;

use super::error::ClassifyError;
use super::{ImageTensor, TopK};
use crate::inference::ImageModel;
use crate::inference::labels::LabelSet;

#[derive(Clone)]
pub struct ClassifierAdapter {
    model: Arc<dyn ImageModel>,
    labels: Arc<LabelSet>,
}

impl ClassifierAdapter {
    pub fn new(model: Arc<dyn ImageModel>, labels: Arc<LabelSet>) -> Self {
        Self { model, labels }
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    pub fn num_classes(&self) -> usize {
        self.labels.len()
    }

    /// Runs the model once and ranks its scores. Equal scores keep ascending
    /// class order so identical inputs always give identical output.
    pub fn classify(&self, tensor: &ImageTensor, top_k: TopK) -> Result<Vec<Prediction>, ClassifyError> {
        let scores = self
            .model
            .predict(tensor)
            .map_err(|e| ClassifyError::InferenceError(e.to_string()))?;

        if scores.len() != self.labels.len() {
            return Err(ClassifyError::InferenceError(format!(
                "model returned {} scores for {} classes",
                scores.len(),
                self.labels.len()
            )));
        }
        if let Some(bad) = scores.iter().find(|s| !s.is_finite() || **s < 0.0 || **s > 1.0) {
            return Err(ClassifyError::InferenceError(format!(
                "model returned a score outside [0, 1]: {}",
                bad
            )));
        }

        let mut order: Vec<usize> = (0..scores.len()).collect();
        order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

        let predictions = order
            .into_iter()
            .take(top_k.get())
            .filter_map(|index| {
                self.labels
                    .get(index)
                    .map(|label| Prediction::new(&label.class_id, &label.class_name, scores[index]))
            })
            .collect();
        Ok(predictions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Behaviour, StubModel, labels};
    use ndarray::Array4;

    fn tensor() -> ImageTensor {
        Array4::<f32>::zeros((1, 3, 4, 4))
    }

    fn build_adapter(num_labels: usize, behaviour: Behaviour) -> (ClassifierAdapter, Arc<StubModel>) {
        let model = StubModel::new(num_labels, behaviour);
        (
            ClassifierAdapter::new(model.clone(), Arc::new(labels(num_labels))),
            model,
        )
    }

    #[test]
    fn test_sorted_and_truncated() {
        let (adapter, model) = build_adapter(4, Behaviour::Fixed(vec![0.1, 0.6, 0.05, 0.25]));
        let predictions = adapter.classify(&tensor(), TopK::new(3)).unwrap();
        let names: Vec<&str> = predictions.iter().map(|p| p.class_name.as_str()).collect();
        assert_eq!(names, vec!["class_1", "class_3", "class_0"]);
        assert_eq!(predictions[0].class_id, "c1");
        assert_eq!(predictions[0].confidence_percentage, "60.00%");
        assert_eq!(model.calls(), 1);
    }

    #[test]
    fn test_top_k_larger_than_classes() {
        let (adapter, _) = build_adapter(3, Behaviour::Fixed(vec![0.2, 0.3, 0.5]));
        let predictions = adapter.classify(&tensor(), TopK::new(1000)).unwrap();
        assert_eq!(predictions.len(), 3);
        assert!(predictions.windows(2).all(|w| w[0].confidence >= w[1].confidence));
    }

    #[test]
    fn test_ties_break_by_class_index() {
        let (adapter, _) = build_adapter(5, Behaviour::Fixed(vec![0.1, 0.3, 0.1, 0.3, 0.2]));
        for _ in 0..5 {
            let predictions = adapter.classify(&tensor(), TopK::new(5)).unwrap();
            let ids: Vec<&str> = predictions.iter().map(|p| p.class_id.as_str()).collect();
            assert_eq!(ids, vec!["c1", "c3", "c4", "c0", "c2"]);
        }
    }

    #[test]
    fn test_wrong_class_count_is_inference_error() {
        let (adapter, _) = build_adapter(3, Behaviour::Fixed(vec![0.5, 0.5]));
        let err = adapter.classify(&tensor(), TopK::new(1)).unwrap_err();
        assert!(matches!(err, ClassifyError::InferenceError(_)));
    }

    #[test]
    fn test_non_probability_scores_rejected() {
        let (adapter, _) = build_adapter(2, Behaviour::Fixed(vec![f32::NAN, 0.5]));
        assert!(adapter.classify(&tensor(), TopK::new(1)).is_err());
        let (adapter, _) = build_adapter(2, Behaviour::Fixed(vec![3.0, -1.0]));
        assert!(adapter.classify(&tensor(), TopK::new(1)).is_err());
    }

    #[test]
    fn test_model_failure_not_retried() {
        let (adapter, model) = build_adapter(2, Behaviour::Fail);
        let err = adapter.classify(&tensor(), TopK::new(1)).unwrap_err();
        assert!(matches!(err, ClassifyError::InferenceError(_)));
        assert_eq!(model.calls(), 1);
    }
}
