//! Training orchestration
//!
//! Validates a training request, reserves the model id in the registry and
//! runs the fit plus artifact write on tokio's blocking pool. The number of
//! fits running at once is bounded by a semaphore. The job is detached from
//! the caller's future, so a caller that goes away mid-training cannot leave
//! the id stuck in `Training`.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{error, info};

use super::matrix::{validate_model_id, NumericMatrix};
use super::models::{check_contamination, IsolationForest, ModelConfig, OutlierModel};
use super::registry::{ModelRegistry, TrainingTicket};
use super::storage::ModelStore;
use crate::error::{EngineError, Result};
use crate::models::TrainingResult;

/// Fitted model bundle, as committed to the registry and persisted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainedModel {
    pub model_id: String,
    pub forest: IsolationForest,
    /// Rows used for the fit
    pub row_count: usize,
    /// Feature width used for the fit
    pub feature_count: usize,
    pub contamination: f64,
    pub trained_at: DateTime<Utc>,
    /// Crate version that produced the model
    pub version: String,
}

impl TrainedModel {
    pub fn new(
        model_id: &str,
        forest: IsolationForest,
        data: &NumericMatrix,
        contamination: f64,
    ) -> Self {
        Self {
            model_id: model_id.to_string(),
            forest,
            row_count: data.rows(),
            feature_count: data.cols(),
            contamination,
            trained_at: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Training worker pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Fits allowed to run at once (0 = auto)
    #[serde(default)]
    pub max_concurrent_training: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_training: 0, // Auto-detect
        }
    }
}

impl WorkerConfig {
    /// Get actual number of training slots
    pub fn actual_workers(&self) -> usize {
        if self.max_concurrent_training == 0 {
            num_cpus::get().max(1)
        } else {
            self.max_concurrent_training
        }
    }
}

/// Training orchestrator
#[derive(Debug, Clone)]
pub struct Trainer {
    registry: Arc<ModelRegistry>,
    store: Arc<ModelStore>,
    config: ModelConfig,
    permits: Arc<Semaphore>,
}

impl Trainer {
    pub fn new(
        registry: Arc<ModelRegistry>,
        store: Arc<ModelStore>,
        config: ModelConfig,
        workers: &WorkerConfig,
    ) -> Self {
        Self {
            registry,
            store,
            config,
            permits: Arc::new(Semaphore::new(workers.actual_workers())),
        }
    }

    /// Train from an untyped payload
    pub async fn train(
        &self,
        model_id: &str,
        data: &Value,
        contamination: f64,
    ) -> Result<TrainingResult> {
        let matrix = NumericMatrix::from_json(data)?;
        self.train_matrix(model_id, matrix, contamination).await
    }

    /// Train from a validated matrix
    ///
    /// Request faults (bad id, bad contamination, training already in flight)
    /// are returned as `Err` before any ticket exists. Fit and persistence
    /// faults mark the entry failed and come back as a `Failure` result.
    pub async fn train_matrix(
        &self,
        model_id: &str,
        matrix: NumericMatrix,
        contamination: f64,
    ) -> Result<TrainingResult> {
        validate_model_id(model_id)?;
        check_contamination(contamination).map_err(EngineError::InvalidParameter)?;

        let ticket = self.registry.begin_training(model_id, contamination)?;
        info!(
            "Training model '{}' with data shape {:?} and contamination {}",
            model_id,
            matrix.shape(),
            contamination
        );

        let job = tokio::spawn(Self::run_job(
            Arc::clone(&self.registry),
            Arc::clone(&self.store),
            self.config.clone(),
            Arc::clone(&self.permits),
            ticket,
            matrix,
        ));

        job.await
            .map_err(|e| EngineError::Internal(format!("training task for '{}' failed: {}", model_id, e)))
    }

    async fn run_job(
        registry: Arc<ModelRegistry>,
        store: Arc<ModelStore>,
        config: ModelConfig,
        permits: Arc<Semaphore>,
        ticket: TrainingTicket,
        matrix: NumericMatrix,
    ) -> TrainingResult {
        let model_id = ticket.model_id().to_string();
        let contamination = ticket.contamination();

        let outcome = match permits.acquire_owned().await {
            Ok(permit) => {
                let id = model_id.clone();
                let job = tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    fit_and_persist(&store, &config, &id, &matrix, contamination)
                });
                match job.await {
                    Ok(result) => result,
                    Err(e) if e.is_panic() => {
                        Err(EngineError::FitFailure(format!("training worker panicked: {}", e)))
                    }
                    Err(e) => Err(EngineError::Internal(format!("training worker failed: {}", e))),
                }
            }
            Err(e) => Err(EngineError::Internal(format!("training pool closed: {}", e))),
        };

        match outcome {
            Ok(model) => match registry.commit_training(ticket, model) {
                Ok(_) => TrainingResult::success(&model_id),
                Err(e) => {
                    error!("Could not commit model '{}': {}", model_id, e);
                    TrainingResult::failure(&model_id, &e)
                }
            },
            Err(e) => {
                error!("Error training model '{}': {}", model_id, e);
                if let Err(stale) = registry.fail_training(ticket, &e) {
                    error!("Could not record failure for '{}': {}", model_id, stale);
                }
                TrainingResult::failure(&model_id, &e)
            }
        }
    }
}

/// Fit a forest and write its artifact; runs on the blocking pool
fn fit_and_persist(
    store: &ModelStore,
    config: &ModelConfig,
    model_id: &str,
    data: &NumericMatrix,
    contamination: f64,
) -> Result<TrainedModel> {
    let started = Instant::now();

    let mut forest = IsolationForest::new(config);
    forest
        .fit(data, contamination)
        .map_err(EngineError::FitFailure)?;

    let model = TrainedModel::new(model_id, forest, data, contamination);
    store.save(&model)?;

    info!(
        "Model '{}' trained on {} rows in {:.1} ms and saved",
        model_id,
        model.row_count,
        started.elapsed().as_secs_f64() * 1000.0
    );
    Ok(model)
}
