//! Outlier models
//!
//! The lifecycle code only talks to estimators through [`OutlierModel`];
//! the isolation forest is the one implementation shipped.

pub mod isolation_forest;

pub use isolation_forest::IsolationForest;

use serde::{Deserialize, Serialize};

use super::matrix::NumericMatrix;

/// Per-row verdict, serialized as the estimator's native `1` / `-1`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Label {
    Normal,
    Anomalous,
}

impl Label {
    pub fn as_i8(&self) -> i8 {
        match self {
            Label::Normal => 1,
            Label::Anomalous => -1,
        }
    }

    pub fn is_anomalous(&self) -> bool {
        matches!(self, Label::Anomalous)
    }
}

impl Serialize for Label {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i8(self.as_i8())
    }
}

impl<'de> Deserialize<'de> for Label {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match i8::deserialize(deserializer)? {
            1 => Ok(Label::Normal),
            -1 => Ok(Label::Anomalous),
            other => Err(serde::de::Error::custom(format!(
                "label must be 1 or -1, got {}",
                other
            ))),
        }
    }
}

/// Trait for fitted outlier estimators
pub trait OutlierModel: Send + Sync {
    /// Fit on a matrix with the expected outlier fraction
    fn fit(&mut self, data: &NumericMatrix, contamination: f64) -> Result<(), String>;

    /// Raw per-row score (higher = more normal)
    fn score_samples(&self, data: &NumericMatrix) -> Vec<f64>;

    /// Per-row score shifted so the decision boundary sits at zero
    fn decision_function(&self, data: &NumericMatrix) -> Vec<f64>;

    /// Per-row label derived from the decision boundary
    fn predict(&self, data: &NumericMatrix) -> Vec<Label> {
        self.decision_function(data)
            .into_iter()
            .map(|d| if d < 0.0 { Label::Anomalous } else { Label::Normal })
            .collect()
    }

    /// Feature width seen at fit time
    fn n_features(&self) -> Option<usize>;

    fn name(&self) -> &str;

    fn is_trained(&self) -> bool;
}

/// Estimator hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Number of trees in the ensemble
    #[serde(default = "default_num_trees")]
    pub num_trees: usize,
    /// Rows drawn per tree (capped at the training row count)
    #[serde(default = "default_max_samples")]
    pub max_samples: usize,
    /// Random seed for reproducibility
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Contamination used when a request omits it
    #[serde(default = "default_contamination")]
    pub default_contamination: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            num_trees: default_num_trees(),
            max_samples: default_max_samples(),
            seed: default_seed(),
            default_contamination: default_contamination(),
        }
    }
}

fn default_num_trees() -> usize {
    100
}

fn default_max_samples() -> usize {
    256
}

fn default_seed() -> u64 {
    42
}

pub(crate) fn default_contamination() -> f64 {
    0.01
}

/// Contamination must lie in (0, 0.5]
pub fn check_contamination(contamination: f64) -> Result<(), String> {
    if contamination.is_finite() && contamination > 0.0 && contamination <= 0.5 {
        Ok(())
    } else {
        Err(format!(
            "contamination must be in (0, 0.5], got {}",
            contamination
        ))
    }
}
