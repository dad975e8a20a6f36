pub mod config;
pub mod error;
pub mod ml;
pub mod models;
pub mod service;

pub use config::Config;
pub use error::{EngineError, ErrorKind, ErrorResponse, Result};
pub use models::{
    DetectRequest, DetectionOutput, HealthStatus, ModelStatus, TrainRequest, TrainingResult,
    TrainingStatus,
};
pub use service::AnomalyService;
