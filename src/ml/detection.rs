//! Detection engine
//!
//! Scores a batch against the committed model for an id and condenses the
//! per-row decision values into the empirical verifiability score:
//!
//! ```text
//! evs = clamp(1 / (1 + exp(-k * mean(decision))), 0, 1)
//! ```
//!
//! A mean decision of zero (the fitted boundary) maps to 0.5, typical batches
//! approach 1 and anomalous batches approach 0. The mapping is monotonic in
//! the mean and deterministic for a given model and input.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use super::matrix::{validate_model_id, NumericMatrix};
use super::models::{Label, OutlierModel};
use super::registry::ModelRegistry;
use super::storage::ModelStore;
use super::training::TrainedModel;
use crate::error::{EngineError, Result};
use crate::models::DetectionOutput;

/// Detection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Logistic steepness k applied to the mean decision value
    #[serde(default = "default_score_steepness")]
    pub score_steepness: f64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            score_steepness: default_score_steepness(),
        }
    }
}

fn default_score_steepness() -> f64 {
    10.0
}

/// Result of scoring one batch
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionResult {
    pub labels: Vec<Label>,
    /// Per-row decision values (negative = beyond the boundary)
    pub raw_scores: Vec<f64>,
    pub verifiability_score: f64,
    /// Inference wall-clock time only
    pub processing_time_ms: f64,
}

impl DetectionResult {
    pub fn anomaly_count(&self) -> usize {
        self.labels.iter().filter(|l| l.is_anomalous()).count()
    }

    pub fn into_output(self, model_id: &str) -> DetectionOutput {
        DetectionOutput {
            model_id: model_id.to_string(),
            anomalies: self.labels,
            empirical_verifiability_score: self.verifiability_score,
            processing_time_ms: self.processing_time_ms,
        }
    }
}

/// Map per-row decision values to a batch score in [0, 1]
pub fn verifiability_score(decisions: &[f64], steepness: f64) -> f64 {
    if decisions.is_empty() {
        return 0.0;
    }
    // Dividing first keeps the mean finite for large finite inputs
    let n = decisions.len() as f64;
    let mean: f64 = decisions.iter().map(|d| d / n).sum();
    if mean.is_nan() {
        return 0.0;
    }
    if mean.is_infinite() {
        return if mean > 0.0 { 1.0 } else { 0.0 };
    }
    let score = 1.0 / (1.0 + (-steepness * mean).exp());
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

/// Score a validated batch; timing covers inference only
pub fn score_batch(model: &dyn OutlierModel, data: &NumericMatrix, steepness: f64) -> DetectionResult {
    let started = Instant::now();

    let raw_scores = model.decision_function(data);
    let labels = raw_scores
        .iter()
        .map(|&d| if d < 0.0 { Label::Anomalous } else { Label::Normal })
        .collect();
    let verifiability_score = verifiability_score(&raw_scores, steepness);

    DetectionResult {
        labels,
        raw_scores,
        verifiability_score,
        processing_time_ms: started.elapsed().as_secs_f64() * 1000.0,
    }
}

/// Detection engine
#[derive(Debug, Clone)]
pub struct Detector {
    registry: Arc<ModelRegistry>,
    store: Arc<ModelStore>,
    config: DetectionConfig,
}

impl Detector {
    pub fn new(registry: Arc<ModelRegistry>, store: Arc<ModelStore>, config: DetectionConfig) -> Self {
        Self {
            registry,
            store,
            config,
        }
    }

    /// Detect on an untyped payload
    pub async fn detect(&self, model_id: &str, data: &Value) -> Result<DetectionResult> {
        let matrix = NumericMatrix::from_json(data)?;
        self.detect_matrix(model_id, &matrix).await
    }

    /// Detect on a validated matrix
    pub async fn detect_matrix(&self, model_id: &str, data: &NumericMatrix) -> Result<DetectionResult> {
        validate_model_id(model_id)?;
        let model = self.resolve(model_id).await?;
        data.expect_cols(model.feature_count)?;

        let result = score_batch(&model.forest, data, self.config.score_steepness);
        debug!(
            "Model '{}' scored {} rows, {} anomalous, evs {:.4} in {:.3} ms",
            model_id,
            data.rows(),
            result.anomaly_count(),
            result.verifiability_score,
            result.processing_time_ms
        );
        Ok(result)
    }

    /// Committed model from memory, else a cold load from storage
    async fn resolve(&self, model_id: &str) -> Result<Arc<TrainedModel>> {
        if let Some(model) = self.registry.usable(model_id) {
            return Ok(model);
        }

        let store = Arc::clone(&self.store);
        let id = model_id.to_string();
        let loaded = tokio::task::spawn_blocking(move || store.load(&id))
            .await
            .map_err(|e| EngineError::Internal(format!("artifact load task failed: {}", e)))??;

        match loaded {
            Some(model) => {
                info!("Cold-loaded model '{}' from storage", model_id);
                Ok(self.registry.install(model))
            }
            None => Err(EngineError::ModelNotTrained(model_id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::models::{IsolationForest, ModelConfig};
    use crate::ml::registry::ModelState;
    use crate::ml::matrix::ValidationError;
    use serde_json::json;
    use tempfile::TempDir;

    fn train_into(registry: &ModelRegistry, id: &str, rows: &[Vec<f64>], contamination: f64) -> TrainedModel {
        let data = NumericMatrix::from_rows(rows).unwrap();
        let mut forest = IsolationForest::new(&ModelConfig::default());
        forest.fit(&data, contamination).unwrap();
        let model = TrainedModel::new(id, forest, &data, contamination);
        let ticket = registry.begin_training(id, contamination).unwrap();
        registry.commit_training(ticket, model.clone()).unwrap();
        model
    }

    fn scenario_rows() -> Vec<Vec<f64>> {
        vec![
            vec![1.0, 2.0],
            vec![1.1, 2.1],
            vec![100.0, 200.0],
            vec![1.2, 2.2],
        ]
    }

    fn detector(dir: &std::path::Path) -> (Detector, Arc<ModelRegistry>, Arc<ModelStore>) {
        let registry = Arc::new(ModelRegistry::new());
        let store = Arc::new(ModelStore::with_path(dir));
        let detector = Detector::new(Arc::clone(&registry), Arc::clone(&store), DetectionConfig::default());
        (detector, registry, store)
    }

    #[test]
    fn test_score_bounds() {
        assert_eq!(verifiability_score(&[0.0], 10.0), 0.5);
        assert!(verifiability_score(&[1e308, 1e308], 10.0) <= 1.0);
        assert!(verifiability_score(&[-1e308], 10.0) >= 0.0);
        assert_eq!(verifiability_score(&[], 10.0), 0.0);
        assert_eq!(verifiability_score(&[f64::NAN, 1.0], 10.0), 0.0);
    }

    #[test]
    fn test_score_saturates_at_extremes() {
        let typical = verifiability_score(&[1.0], 10.0);
        let huge = verifiability_score(&[f64::MAX, f64::MAX], 10.0);
        assert!(huge >= typical, "evs(MAX)={} evs(1)={}", huge, typical);
        assert_eq!(huge, 1.0);

        let tiny = verifiability_score(&[f64::MIN, f64::MIN], 10.0);
        assert_eq!(tiny, 0.0);

        assert_eq!(verifiability_score(&[f64::INFINITY], 10.0), 1.0);
        assert_eq!(verifiability_score(&[f64::NEG_INFINITY], 10.0), 0.0);
    }

    #[test]
    fn test_score_monotonic() {
        let low = verifiability_score(&[-0.2, -0.1], 10.0);
        let mid = verifiability_score(&[0.0, 0.05], 10.0);
        let high = verifiability_score(&[0.1, 0.2], 10.0);
        assert!(low < mid && mid < high);
    }

    #[tokio::test]
    async fn test_detect_scenario() {
        let temp = TempDir::new().unwrap();
        let (detector, registry, _) = detector(temp.path());
        train_into(&registry, "m", &scenario_rows(), 0.05);

        let result = detector
            .detect("m", &json!([[1.5, 2.5], [105, 210], [0.9, 1.9]]))
            .await
            .unwrap();

        assert_eq!(result.labels, vec![Label::Normal, Label::Anomalous, Label::Normal]);
        assert_eq!(result.raw_scores.len(), 3);
        assert!((0.0..=1.0).contains(&result.verifiability_score));
        assert!(result.processing_time_ms > 0.0);
        assert_eq!(result.anomaly_count(), 1);
    }

    #[tokio::test]
    async fn test_untrained_model_rejected() {
        let temp = TempDir::new().unwrap();
        let (detector, _, _) = detector(temp.path());

        let err = detector.detect("nonexistent", &json!([[1, 2]])).await.unwrap_err();
        assert!(matches!(err, EngineError::ModelNotTrained(ref id) if id == "nonexistent"));
    }

    #[tokio::test]
    async fn test_training_in_flight_without_model_rejected() {
        let temp = TempDir::new().unwrap();
        let (detector, registry, _) = detector(temp.path());
        let _ticket = registry.begin_training("busy", 0.1).unwrap();

        let err = detector.detect("busy", &json!([[1, 2]])).await.unwrap_err();
        assert!(matches!(err, EngineError::ModelNotTrained(_)));
    }

    #[tokio::test]
    async fn test_width_mismatch() {
        let temp = TempDir::new().unwrap();
        let (detector, registry, _) = detector(temp.path());
        train_into(&registry, "m", &scenario_rows(), 0.05);

        let err = detector.detect("m", &json!([[1, 2, 3]])).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::DimensionMismatch { expected: 2, got: 3 })
        ));
    }

    #[tokio::test]
    async fn test_cold_load_from_storage() {
        let temp = TempDir::new().unwrap();
        let (detector, registry, store) = detector(temp.path());

        let staging = ModelRegistry::new();
        let model = train_into(&staging, "cold", &scenario_rows(), 0.05);
        store.save(&model).unwrap();
        assert!(registry.get("cold").is_none());

        let result = detector.detect("cold", &json!([[105, 210]])).await.unwrap();
        assert_eq!(result.labels, vec![Label::Anomalous]);
        assert_eq!(registry.status("cold").state, ModelState::Trained);
        assert_eq!(registry.status("cold").row_count, Some(4));
    }

    #[tokio::test]
    async fn test_detection_is_deterministic() {
        let temp = TempDir::new().unwrap();
        let (detector, registry, _) = detector(temp.path());
        train_into(&registry, "a", &scenario_rows(), 0.05);
        train_into(&registry, "b", &scenario_rows(), 0.05);

        let batch = json!([[1.5, 2.5], [105, 210], [0.9, 1.9]]);
        let a = detector.detect("a", &batch).await.unwrap();
        let b = detector.detect("b", &batch).await.unwrap();
        assert_eq!(a.labels, b.labels);
        assert_eq!(a.raw_scores, b.raw_scores);
        assert_eq!(a.verifiability_score, b.verifiability_score);
    }

    #[tokio::test]
    async fn test_identical_rows_score_in_range() {
        let temp = TempDir::new().unwrap();
        let (detector, registry, _) = detector(temp.path());
        train_into(&registry, "flat", &vec![vec![5.0, 5.0]; 20], 0.1);

        let same = detector.detect("flat", &json!([[5, 5], [5, 5]])).await.unwrap();
        assert!((0.0..=1.0).contains(&same.verifiability_score));

        let extreme = detector
            .detect("flat", &json!([[1e300, -1e300], [-1e300, 1e300]]))
            .await
            .unwrap();
        assert!((0.0..=1.0).contains(&extreme.verifiability_score));
        assert_eq!(extreme.labels.len(), 2);
    }

    #[test]
    fn test_into_output() {
        let result = DetectionResult {
            labels: vec![Label::Normal],
            raw_scores: vec![0.1],
            verifiability_score: 0.73,
            processing_time_ms: 0.2,
        };
        let out = result.into_output("m");
        assert_eq!(out.model_id, "m");
        assert_eq!(out.anomalies, vec![Label::Normal]);
    }
}
