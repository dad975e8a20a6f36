//! Anomaly model lifecycle engine
//!
//! Provides per-identifier outlier models: validation of numeric input,
//! training on a bounded worker pool, atomic registry updates, artifact
//! persistence, and batch scoring with an empirical verifiability score.
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use vie::ml::{Detector, DetectionConfig, ModelRegistry, ModelStore, Trainer, WorkerConfig, ModelConfig};
//!
//! let registry = Arc::new(ModelRegistry::new());
//! let store = Arc::new(ModelStore::with_path("models"));
//! let trainer = Trainer::new(registry.clone(), store.clone(), ModelConfig::default(), &WorkerConfig::default());
//! let detector = Detector::new(registry, store, DetectionConfig::default());
//!
//! trainer.train("sensor-a", &data, 0.05).await?;
//! let result = detector.detect("sensor-a", &batch).await?;
//! println!("evs = {:.3}", result.verifiability_score);
//! ```

pub mod detection;
pub mod matrix;
pub mod models;
pub mod registry;
pub mod storage;
pub mod training;

pub use detection::{score_batch, verifiability_score, DetectionConfig, DetectionResult, Detector};
pub use matrix::{validate_model_id, NumericMatrix, ValidationError};
pub use models::{IsolationForest, Label, ModelConfig, OutlierModel};
pub use registry::{ModelEntry, ModelRegistry, ModelState, RegistryStatus, TrainingTicket};
pub use storage::{ArtifactHeader, ModelStore, StorageConfig, MODEL_DIR};
pub use training::{TrainedModel, Trainer, WorkerConfig};
