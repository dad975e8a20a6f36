use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;
use crate::ml::models::Label;
use crate::ml::registry::ModelState;

/// Model id used when a request omits one
pub const DEFAULT_MODEL_ID: &str = "default_model";

fn default_model_id() -> String {
    DEFAULT_MODEL_ID.to_string()
}

/// Training request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainRequest {
    /// Training samples, one list of features per row
    pub data: Value,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    /// Expected outlier fraction; the configured default applies when absent
    #[serde(default)]
    pub contamination: Option<f64>,
}

/// Detection request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectRequest {
    pub data: Value,
    #[serde(default = "default_model_id")]
    pub model_id: String,
}

/// Outcome of a training request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainingStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingResult {
    pub model_id: String,
    pub status: TrainingStatus,
    pub message: String,
}

impl TrainingResult {
    pub fn success(model_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
            status: TrainingStatus::Success,
            message: "Model trained and saved.".to_string(),
        }
    }

    /// Failure body; the message leads with the error kind
    pub fn failure(model_id: &str, error: &EngineError) -> Self {
        Self {
            model_id: model_id.to_string(),
            status: TrainingStatus::Failure,
            message: error.tagged_message(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TrainingStatus::Success
    }
}

/// Detection response body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionOutput {
    pub model_id: String,
    /// One label per input row: 1 normal, -1 anomalous
    pub anomalies: Vec<Label>,
    /// Batch typicality in [0, 1], higher is more typical
    pub empirical_verifiability_score: f64,
    pub processing_time_ms: f64,
}

/// Status response body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStatus {
    pub model_id: String,
    pub is_trained: bool,
    /// Rows used by the committed model's fit
    pub data_shape: Option<usize>,
    pub state: ModelState,
}

/// Liveness body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    /// Unix time in seconds
    pub timestamp: f64,
}

impl HealthStatus {
    pub fn operational() -> Self {
        Self {
            status: "operational".to_string(),
            timestamp: Utc::now().timestamp_millis() as f64 / 1000.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_defaults() {
        let req: TrainRequest = serde_json::from_value(json!({"data": [[1, 2]]})).unwrap();
        assert_eq!(req.model_id, "default_model");
        assert_eq!(req.contamination, None);

        let req: DetectRequest =
            serde_json::from_value(json!({"data": [[1, 2]], "model_id": "m", "contamination": 0.1}))
                .unwrap();
        assert_eq!(req.model_id, "m");
    }

    #[test]
    fn test_training_result_shape() {
        let json = serde_json::to_value(TrainingResult::success("m")).unwrap();
        assert_eq!(json, json!({"model_id": "m", "status": "Success", "message": "Model trained and saved."}));

        let failed = TrainingResult::failure("m", &EngineError::FitFailure("diverged".into()));
        assert!(!failed.is_success());
        assert_eq!(serde_json::to_value(&failed).unwrap()["status"], "Failure");
    }

    #[test]
    fn test_detection_output_shape() {
        let out = DetectionOutput {
            model_id: "m".into(),
            anomalies: vec![Label::Normal, Label::Anomalous],
            empirical_verifiability_score: 0.5,
            processing_time_ms: 1.25,
        };
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["anomalies"], json!([1, -1]));
        assert_eq!(json["empirical_verifiability_score"], 0.5);
    }

    #[test]
    fn test_status_shape() {
        let status = ModelStatus {
            model_id: "x".into(),
            is_trained: false,
            data_shape: None,
            state: ModelState::Untrained,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["data_shape"], Value::Null);
        assert_eq!(json["state"], "untrained");
    }

    #[test]
    fn test_health() {
        let health = HealthStatus::operational();
        assert_eq!(health.status, "operational");
        assert!(health.timestamp > 0.0);
    }
}
