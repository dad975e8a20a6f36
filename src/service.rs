//! Service composition root
//!
//! `AnomalyService` owns the registry, the artifact store and the two engines
//! built on them. Every request-shaped operation of the external contract is
//! a method here; routing layers hold an `Arc<AnomalyService>` and nothing
//! else.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::ml::models::check_contamination;
use crate::ml::{validate_model_id, Detector, ModelRegistry, ModelState, ModelStore, Trainer};
use crate::models::{
    DetectRequest, DetectionOutput, HealthStatus, ModelStatus, TrainRequest, TrainingResult,
};

pub struct AnomalyService {
    config: Config,
    registry: Arc<ModelRegistry>,
    store: Arc<ModelStore>,
    trainer: Trainer,
    detector: Detector,
}

impl AnomalyService {
    /// Build the service; loads stored models when `preload_on_start` is set
    pub fn new(config: Config) -> Result<Self> {
        let registry = Arc::new(ModelRegistry::new());
        let store = Arc::new(ModelStore::new(config.storage.clone()));
        store.init()?;

        let trainer = Trainer::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            config.model.clone(),
            &config.workers,
        );
        let detector = Detector::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            config.detection.clone(),
        );

        let service = Self {
            config,
            registry,
            store,
            trainer,
            detector,
        };

        if service.config.storage.preload_on_start {
            service.warm_start()?;
        }

        Ok(service)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Train (or retrain) the model named in the request
    pub async fn train(&self, request: TrainRequest) -> Result<TrainingResult> {
        let contamination = request
            .contamination
            .unwrap_or(self.config.model.default_contamination);
        check_contamination(contamination).map_err(EngineError::InvalidParameter)?;

        self.trainer
            .train(&request.model_id, &request.data, contamination)
            .await
    }

    /// Score a batch against a trained model
    pub async fn detect(&self, request: DetectRequest) -> Result<DetectionOutput> {
        let result = self
            .detector
            .detect(&request.model_id, &request.data)
            .await?;
        Ok(result.into_output(&request.model_id))
    }

    /// Status never fails; unknown or invalid ids report untrained
    pub fn status(&self, model_id: &str) -> ModelStatus {
        let snapshot = self.registry.status(model_id);
        if snapshot.state != ModelState::Untrained || validate_model_id(model_id).is_err() {
            return ModelStatus {
                model_id: model_id.to_string(),
                is_trained: snapshot.is_trained,
                data_shape: snapshot.row_count,
                state: snapshot.state,
            };
        }

        // Not in memory: report what a cold load would find from the header alone
        match self.store.peek(model_id) {
            Ok(Some(header)) => ModelStatus {
                model_id: model_id.to_string(),
                is_trained: true,
                data_shape: Some(header.row_count),
                state: ModelState::Trained,
            },
            Ok(None) => ModelStatus {
                model_id: model_id.to_string(),
                is_trained: false,
                data_shape: None,
                state: ModelState::Untrained,
            },
            Err(e) => {
                warn!("Error loading model '{}' for status: {}", model_id, e);
                ModelStatus {
                    model_id: model_id.to_string(),
                    is_trained: false,
                    data_shape: None,
                    state: ModelState::Untrained,
                }
            }
        }
    }

    /// Liveness; independent of registry state
    pub fn health(&self) -> HealthStatus {
        HealthStatus::operational()
    }

    /// Remove a model from memory and storage
    pub fn delete(&self, model_id: &str) -> Result<bool> {
        validate_model_id(model_id)?;
        let in_memory = self.registry.remove(model_id)?;
        let on_disk = self.store.delete(model_id)?;
        if in_memory || on_disk {
            info!("Deleted model '{}'", model_id);
        }
        Ok(in_memory || on_disk)
    }

    /// Ids known in memory or on disk
    pub fn list_models(&self) -> Result<Vec<String>> {
        let mut ids = self.store.list_models()?;
        ids.extend(self.registry.ids());
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    /// Load every stored artifact into the registry
    ///
    /// Unreadable artifacts are skipped with a warning; returns the number
    /// of models installed.
    pub fn warm_start(&self) -> Result<usize> {
        let mut loaded = 0;
        for id in self.store.list_models()? {
            match self.store.load(&id) {
                Ok(Some(model)) => {
                    self.registry.install(model);
                    loaded += 1;
                }
                Ok(None) => {}
                Err(e) => warn!("Skipping model '{}' during warm start: {}", id, e),
            }
        }
        info!(
            "Warm start loaded {} model(s) from {:?}",
            loaded,
            self.store.model_dir()
        );
        Ok(loaded)
    }
}
