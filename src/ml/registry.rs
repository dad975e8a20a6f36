//! Model Registry
//!
//! In-memory map from model id to lifecycle state and the last committed
//! model. Entries live in a sharded `DashMap`, so reads never wait on reads
//! and writes to different ids rarely touch the same shard lock. No lock is
//! held while a model is fitted or scored: readers clone the committed
//! `Arc<TrainedModel>` and release the shard immediately.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::training::TrainedModel;
use crate::error::{EngineError, Result};

/// Lifecycle state of a model id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    Untrained,
    Training,
    Trained,
    Failed,
}

impl ModelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelState::Untrained => "untrained",
            ModelState::Training => "training",
            ModelState::Trained => "trained",
            ModelState::Failed => "failed",
        }
    }
}

/// One registry entry
///
/// `committed` is the model detections are served from. It survives a
/// retrain in flight and a failed retrain, so `state` alone does not say
/// whether the id is usable; see [`ModelEntry::is_usable`].
#[derive(Debug, Clone)]
pub struct ModelEntry {
    pub id: String,
    pub state: ModelState,
    pub committed: Option<Arc<TrainedModel>>,
    /// Contamination of the in-flight or most recent training request
    pub contamination: Option<f64>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
    generation: u64,
}

impl ModelEntry {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            state: ModelState::Untrained,
            committed: None,
            contamination: None,
            last_error: None,
            updated_at: Utc::now(),
            generation: 0,
        }
    }

    pub fn is_usable(&self) -> bool {
        self.committed.is_some()
    }

    pub fn row_count(&self) -> Option<usize> {
        self.committed.as_ref().map(|m| m.row_count)
    }
}

/// Exclusive right to train one model id
///
/// Issued by [`ModelRegistry::begin_training`] and consumed by exactly one of
/// [`ModelRegistry::commit_training`] or [`ModelRegistry::fail_training`].
#[derive(Debug)]
#[must_use = "a training ticket must be committed or failed"]
pub struct TrainingTicket {
    model_id: String,
    contamination: f64,
    generation: u64,
}

impl TrainingTicket {
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn contamination(&self) -> f64 {
        self.contamination
    }
}

/// Snapshot answer for status queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStatus {
    pub state: ModelState,
    pub is_trained: bool,
    pub row_count: Option<usize>,
}

/// Concurrency-safe model registry
#[derive(Debug, Default)]
pub struct ModelRegistry {
    entries: DashMap<String, ModelEntry>,
    next_generation: AtomicU64,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clone of the entry for `id`
    pub fn get(&self, id: &str) -> Option<ModelEntry> {
        self.entries.get(id).map(|e| e.value().clone())
    }

    /// Committed model for `id`, if any
    pub fn usable(&self, id: &str) -> Option<Arc<TrainedModel>> {
        self.entries.get(id).and_then(|e| e.committed.clone())
    }

    /// Reserve `id` for training; at most one ticket per id is outstanding
    pub fn begin_training(&self, id: &str, contamination: f64) -> Result<TrainingTicket> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;

        match self.entries.entry(id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.state == ModelState::Training {
                    debug!("Rejected training ticket for '{}': already training", id);
                    return Err(EngineError::AlreadyTraining(id.to_string()));
                }
                entry.state = ModelState::Training;
                entry.contamination = Some(contamination);
                entry.generation = generation;
                entry.updated_at = Utc::now();
            }
            Entry::Vacant(vacant) => {
                let mut entry = ModelEntry::new(id);
                entry.state = ModelState::Training;
                entry.contamination = Some(contamination);
                entry.generation = generation;
                vacant.insert(entry);
            }
        }

        Ok(TrainingTicket {
            model_id: id.to_string(),
            contamination,
            generation,
        })
    }

    /// Swap in a freshly fitted model and mark the entry trained
    pub fn commit_training(
        &self,
        ticket: TrainingTicket,
        model: TrainedModel,
    ) -> Result<Arc<TrainedModel>> {
        let mut entry = self.current_entry(&ticket)?;
        let model = Arc::new(model);

        entry.committed = Some(Arc::clone(&model));
        entry.state = ModelState::Trained;
        entry.last_error = None;
        entry.updated_at = Utc::now();

        Ok(model)
    }

    /// Mark the entry failed; a previously committed model stays servable
    pub fn fail_training(&self, ticket: TrainingTicket, error: &EngineError) -> Result<()> {
        let mut entry = self.current_entry(&ticket)?;

        entry.state = ModelState::Failed;
        entry.last_error = Some(error.tagged_message());
        entry.updated_at = Utc::now();

        if entry.committed.is_some() {
            warn!(
                "Retrain of '{}' failed, keeping previous model: {}",
                ticket.model_id, error
            );
        }
        Ok(())
    }

    fn current_entry(
        &self,
        ticket: &TrainingTicket,
    ) -> Result<dashmap::mapref::one::RefMut<'_, String, ModelEntry>> {
        match self.entries.get_mut(&ticket.model_id) {
            Some(entry)
                if entry.generation == ticket.generation
                    && entry.state == ModelState::Training =>
            {
                Ok(entry)
            }
            _ => Err(EngineError::StaleTicket(ticket.model_id.clone())),
        }
    }

    /// Install a model recovered from storage
    ///
    /// A model already committed in memory is newer than anything on disk
    /// and wins. An in-flight training keeps its state and gets the loaded
    /// model as its fallback.
    pub fn install(&self, model: TrainedModel) -> Arc<TrainedModel> {
        let model = Arc::new(model);

        match self.entries.entry(model.model_id.clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if let Some(existing) = &entry.committed {
                    return Arc::clone(existing);
                }
                entry.committed = Some(Arc::clone(&model));
                if entry.state != ModelState::Training {
                    entry.state = ModelState::Trained;
                }
                entry.updated_at = Utc::now();
            }
            Entry::Vacant(vacant) => {
                let mut entry = ModelEntry::new(&model.model_id);
                entry.state = ModelState::Trained;
                entry.contamination = Some(model.contamination);
                entry.committed = Some(Arc::clone(&model));
                vacant.insert(entry);
            }
        }

        model
    }

    /// Snapshot status; unknown ids report untrained
    pub fn status(&self, id: &str) -> RegistryStatus {
        match self.entries.get(id) {
            Some(entry) => RegistryStatus {
                state: entry.state,
                is_trained: entry.is_usable(),
                row_count: entry.row_count(),
            },
            None => RegistryStatus {
                state: ModelState::Untrained,
                is_trained: false,
                row_count: None,
            },
        }
    }

    /// Drop an entry; refused while training is in flight
    pub fn remove(&self, id: &str) -> Result<bool> {
        if let Some(entry) = self.entries.get(id) {
            if entry.state == ModelState::Training {
                return Err(EngineError::AlreadyTraining(id.to_string()));
            }
        }
        Ok(self
            .entries
            .remove_if(id, |_, e| e.state != ModelState::Training)
            .is_some())
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::matrix::NumericMatrix;
    use crate::ml::models::{IsolationForest, OutlierModel};

    fn fitted(id: &str, rows: usize) -> TrainedModel {
        let data: Vec<Vec<f64>> = (0..rows).map(|i| vec![i as f64, (i * 2) as f64]).collect();
        let data = NumericMatrix::from_rows(&data).unwrap();
        let mut forest = IsolationForest::with_params(5, 16, 1);
        forest.fit(&data, 0.1).unwrap();
        TrainedModel::new(id, forest, &data, 0.1)
    }

    #[test]
    fn test_unknown_status_is_untrained() {
        let registry = ModelRegistry::new();
        let status = registry.status("nope");
        assert_eq!(status.state, ModelState::Untrained);
        assert!(!status.is_trained);
        assert_eq!(status.row_count, None);
        assert!(registry.get("nope").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_train_lifecycle() {
        let registry = ModelRegistry::new();
        let ticket = registry.begin_training("m", 0.1).unwrap();
        assert_eq!(ticket.model_id(), "m");
        assert_eq!(registry.status("m").state, ModelState::Training);
        assert!(!registry.status("m").is_trained);

        registry.commit_training(ticket, fitted("m", 10)).unwrap();
        let status = registry.status("m");
        assert_eq!(status.state, ModelState::Trained);
        assert!(status.is_trained);
        assert_eq!(status.row_count, Some(10));
    }

    #[test]
    fn test_second_ticket_rejected() {
        let registry = ModelRegistry::new();
        let ticket = registry.begin_training("m", 0.1).unwrap();
        assert!(matches!(
            registry.begin_training("m", 0.1),
            Err(EngineError::AlreadyTraining(_))
        ));

        // Other ids are independent
        let other = registry.begin_training("other", 0.2).unwrap();
        registry.fail_training(other, &EngineError::FitFailure("x".into())).unwrap();
        registry.fail_training(ticket, &EngineError::FitFailure("x".into())).unwrap();

        // A failed id can be retrained
        assert!(registry.begin_training("m", 0.1).is_ok());
    }

    #[test]
    fn test_retrain_serves_previous_model() {
        let registry = ModelRegistry::new();
        let ticket = registry.begin_training("m", 0.1).unwrap();
        registry.commit_training(ticket, fitted("m", 10)).unwrap();

        let ticket = registry.begin_training("m", 0.1).unwrap();
        let during = registry.usable("m").expect("previous model stays usable");
        assert_eq!(during.row_count, 10);

        registry.commit_training(ticket, fitted("m", 20)).unwrap();
        assert_eq!(registry.usable("m").unwrap().row_count, 20);
        // The reader's snapshot is untouched by the swap
        assert_eq!(during.row_count, 10);
    }

    #[test]
    fn test_failed_retrain_keeps_fallback() {
        let registry = ModelRegistry::new();
        let ticket = registry.begin_training("m", 0.1).unwrap();
        registry.commit_training(ticket, fitted("m", 10)).unwrap();

        let ticket = registry.begin_training("m", 0.1).unwrap();
        registry
            .fail_training(ticket, &EngineError::Persistence("disk full".into()))
            .unwrap();

        let entry = registry.get("m").unwrap();
        assert_eq!(entry.state, ModelState::Failed);
        assert!(entry.is_usable());
        assert!(entry.last_error.unwrap().starts_with("PersistenceError"));
        assert_eq!(registry.status("m").row_count, Some(10));
    }

    #[test]
    fn test_first_failure_is_not_usable() {
        let registry = ModelRegistry::new();
        let ticket = registry.begin_training("m", 0.1).unwrap();
        registry.fail_training(ticket, &EngineError::FitFailure("boom".into())).unwrap();

        let status = registry.status("m");
        assert_eq!(status.state, ModelState::Failed);
        assert!(!status.is_trained);
        assert!(registry.usable("m").is_none());
    }

    #[test]
    fn test_stale_ticket_rejected() {
        let registry = ModelRegistry::new();
        let ticket = registry.begin_training("m", 0.1).unwrap();
        registry.fail_training(ticket, &EngineError::FitFailure("x".into())).unwrap();
        assert!(registry.remove("m").unwrap());

        let fresh = registry.begin_training("m", 0.1).unwrap();
        let forged = TrainingTicket {
            model_id: "m".into(),
            contamination: 0.1,
            generation: 0,
        };
        assert!(matches!(
            registry.commit_training(forged, fitted("m", 5)),
            Err(EngineError::StaleTicket(_))
        ));
        registry.commit_training(fresh, fitted("m", 5)).unwrap();
    }

    #[test]
    fn test_install_does_not_clobber_memory() {
        let registry = ModelRegistry::new();
        registry.install(fitted("m", 10));
        assert_eq!(registry.status("m").state, ModelState::Trained);

        let kept = registry.install(fitted("m", 99));
        assert_eq!(kept.row_count, 10);
    }

    #[test]
    fn test_install_during_training_keeps_state() {
        let registry = ModelRegistry::new();
        let ticket = registry.begin_training("m", 0.1).unwrap();
        registry.install(fitted("m", 10));

        let status = registry.status("m");
        assert_eq!(status.state, ModelState::Training);
        assert!(status.is_trained);
        registry.commit_training(ticket, fitted("m", 12)).unwrap();
        assert_eq!(registry.status("m").row_count, Some(12));
    }

    #[test]
    fn test_remove_refused_while_training() {
        let registry = ModelRegistry::new();
        let ticket = registry.begin_training("m", 0.1).unwrap();
        assert!(matches!(registry.remove("m"), Err(EngineError::AlreadyTraining(_))));
        registry.commit_training(ticket, fitted("m", 10)).unwrap();
        assert!(registry.remove("m").unwrap());
        assert!(!registry.remove("m").unwrap());
        assert!(registry.ids().is_empty());
    }
}
