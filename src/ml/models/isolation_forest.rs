//! Isolation Forest implementation
//!
//! Anomaly detection using isolation trees. Anomalies are easier to isolate
//! and thus have shorter path lengths in the trees. Tree growth is driven by
//! a seeded RNG so identical data and configuration yield an identical forest.

use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::{check_contamination, ModelConfig, OutlierModel};
use crate::ml::matrix::NumericMatrix;

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Isolation Forest model for anomaly detection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationForest {
    /// Individual isolation trees
    trees: Vec<IsolationTree>,
    /// Number of trees
    num_trees: usize,
    /// Upper bound on rows per tree
    max_samples: usize,
    /// Rows actually drawn per tree at fit time
    sample_size: usize,
    /// RNG seed
    seed: u64,
    /// Average path length normalization factor, c(sample_size)
    avg_path_length: f64,
    /// Decision boundary in score_samples units
    offset: f64,
    /// Feature width seen at fit time
    n_features: usize,
    /// Whether the model is trained
    trained: bool,
}

impl Default for IsolationForest {
    fn default() -> Self {
        Self::new(&ModelConfig::default())
    }
}

impl IsolationForest {
    /// Create a new Isolation Forest
    pub fn new(config: &ModelConfig) -> Self {
        Self::with_params(config.num_trees, config.max_samples, config.seed)
    }

    /// Create with custom parameters
    pub fn with_params(num_trees: usize, max_samples: usize, seed: u64) -> Self {
        Self {
            trees: Vec::new(),
            num_trees,
            max_samples,
            sample_size: 0,
            seed,
            avg_path_length: 0.0,
            offset: 0.0,
            n_features: 0,
            trained: false,
        }
    }

    /// Average unsuccessful-search path length in a BST of n nodes, c(n)
    fn average_path_length(n: usize) -> f64 {
        match n {
            0 | 1 => 0.0,
            2 => 1.0,
            _ => {
                let n = n as f64;
                2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
            }
        }
    }

    /// Anomaly score in (0, 1]: 2^(-E[h(x)] / c(sample_size))
    fn anomaly_score(&self, sample: &[f64]) -> f64 {
        if self.trees.is_empty() || self.avg_path_length == 0.0 {
            return 0.5;
        }

        let total_path_length: f64 = self
            .trees
            .iter()
            .map(|tree| tree.path_length(sample))
            .sum();

        let avg_path = total_path_length / self.trees.len() as f64;

        2.0_f64.powf(-avg_path / self.avg_path_length)
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }

    pub fn num_trees(&self) -> usize {
        self.trees.len()
    }
}

impl OutlierModel for IsolationForest {
    fn fit(&mut self, data: &NumericMatrix, contamination: f64) -> Result<(), String> {
        check_contamination(contamination)?;
        if self.num_trees == 0 || self.max_samples == 0 {
            return Err("forest needs at least one tree and one sample per tree".to_string());
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let n_rows = data.rows();
        let n_features = data.cols();

        self.trees.clear();
        self.sample_size = self.max_samples.min(n_rows);
        self.avg_path_length = Self::average_path_length(self.sample_size);
        self.n_features = n_features;

        let max_depth = (self.sample_size as f64).log2().ceil() as usize;

        for _ in 0..self.num_trees {
            // Sample without replacement
            let sample: Vec<usize> = index::sample(&mut rng, n_rows, self.sample_size).into_vec();
            let tree = IsolationTree::build(data, sample, n_features, max_depth, &mut rng);
            self.trees.push(tree);
        }
        self.trained = true;

        // The boundary leaves `contamination` of the training rows below zero
        let mut train_scores = self.score_samples(data);
        train_scores.sort_by(|a, b| a.total_cmp(b));
        self.offset = percentile(&train_scores, contamination);

        if !self.offset.is_finite() {
            self.trained = false;
            return Err("non-finite decision offset".to_string());
        }

        Ok(())
    }

    fn score_samples(&self, data: &NumericMatrix) -> Vec<f64> {
        data.iter_rows().map(|row| -self.anomaly_score(row)).collect()
    }

    fn decision_function(&self, data: &NumericMatrix) -> Vec<f64> {
        self.score_samples(data)
            .into_iter()
            .map(|s| s - self.offset)
            .collect()
    }

    fn n_features(&self) -> Option<usize> {
        self.trained.then_some(self.n_features)
    }

    fn name(&self) -> &str {
        "IsolationForest"
    }

    fn is_trained(&self) -> bool {
        self.trained
    }
}

/// Linear-interpolated quantile of an ascending slice, q in [0, 1]
fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

/// A single isolation tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationTree {
    root: Option<Box<IsolationNode>>,
}

impl IsolationTree {
    /// Build an isolation tree from the given row indices
    fn build<R: Rng>(
        data: &NumericMatrix,
        rows: Vec<usize>,
        n_features: usize,
        max_depth: usize,
        rng: &mut R,
    ) -> Self {
        let root = Self::build_node(data, rows, n_features, 0, max_depth, rng);
        Self { root }
    }

    /// Recursively build tree nodes
    fn build_node<R: Rng>(
        data: &NumericMatrix,
        rows: Vec<usize>,
        n_features: usize,
        depth: usize,
        max_depth: usize,
        rng: &mut R,
    ) -> Option<Box<IsolationNode>> {
        if rows.is_empty() {
            return None;
        }

        // Terminal conditions
        if depth >= max_depth || rows.len() <= 1 {
            return Some(Box::new(IsolationNode::Leaf { size: rows.len() }));
        }

        // Randomly select feature
        let feature_idx = rng.random_range(0..n_features);

        let (min_val, max_val) = rows.iter().fold((f64::MAX, f64::MIN), |(lo, hi), &r| {
            let v = data.row(r)[feature_idx];
            (lo.min(v), hi.max(v))
        });

        // Constant feature at this node
        if max_val <= min_val {
            return Some(Box::new(IsolationNode::Leaf { size: rows.len() }));
        }

        // Random split point; interpolating stays finite even when max - min overflows
        let u: f64 = rng.random();
        let split_value = min_val * (1.0 - u) + max_val * u;

        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
            .into_iter()
            .partition(|&r| data.row(r)[feature_idx] < split_value);

        let left = Self::build_node(data, left_rows, n_features, depth + 1, max_depth, rng);
        let right = Self::build_node(data, right_rows, n_features, depth + 1, max_depth, rng);

        Some(Box::new(IsolationNode::Internal {
            feature_idx,
            split_value,
            left,
            right,
        }))
    }

    /// Calculate path length for a sample
    fn path_length(&self, sample: &[f64]) -> f64 {
        match &self.root {
            None => 0.0,
            Some(node) => Self::node_path_length(node, sample, 0),
        }
    }

    fn node_path_length(node: &IsolationNode, sample: &[f64], depth: usize) -> f64 {
        match node {
            IsolationNode::Leaf { size } => {
                // Unbuilt subtree below a leaf holding several rows
                depth as f64 + IsolationForest::average_path_length(*size)
            }
            IsolationNode::Internal {
                feature_idx,
                split_value,
                left,
                right,
            } => {
                let val = sample.get(*feature_idx).copied().unwrap_or(0.0);
                let next_node = if val < *split_value { left } else { right };

                match next_node {
                    Some(n) => Self::node_path_length(n, sample, depth + 1),
                    None => depth as f64 + 1.0,
                }
            }
        }
    }
}

/// Node in an isolation tree
#[derive(Debug, Clone, Serialize, Deserialize)]
enum IsolationNode {
    /// Internal node with split
    Internal {
        feature_idx: usize,
        split_value: f64,
        left: Option<Box<IsolationNode>>,
        right: Option<Box<IsolationNode>>,
    },
    /// Leaf node
    Leaf { size: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::models::Label;

    fn matrix(rows: &[&[f64]]) -> NumericMatrix {
        let rows: Vec<Vec<f64>> = rows.iter().map(|r| r.to_vec()).collect();
        NumericMatrix::from_rows(&rows).unwrap()
    }

    fn cluster_with_outlier() -> NumericMatrix {
        matrix(&[&[1.0, 2.0], &[1.1, 2.1], &[100.0, 200.0], &[1.2, 2.2]])
    }

    #[test]
    fn test_isolation_forest_creation() {
        let forest = IsolationForest::default();
        assert!(!forest.is_trained());
        assert_eq!(forest.name(), "IsolationForest");
        assert_eq!(forest.n_features(), None);
    }

    #[test]
    fn test_isolation_forest_training() {
        let mut forest = IsolationForest::with_params(10, 32, 7);
        let rows: Vec<Vec<f64>> = (0..100).map(|i| vec![50.0 + (i % 10) as f64; 4]).collect();
        let data = NumericMatrix::from_rows(&rows).unwrap();

        forest.fit(&data, 0.1).unwrap();

        assert!(forest.is_trained());
        assert_eq!(forest.num_trees(), 10);
        assert_eq!(forest.n_features(), Some(4));
        assert_eq!(forest.sample_size, 32);
    }

    #[test]
    fn test_outlier_is_flagged() {
        let mut forest = IsolationForest::default();
        forest.fit(&cluster_with_outlier(), 0.05).unwrap();

        let probe = matrix(&[&[1.5, 2.5], &[105.0, 210.0], &[0.9, 1.9]]);
        let labels = forest.predict(&probe);
        assert_eq!(labels, vec![Label::Normal, Label::Anomalous, Label::Normal]);

        let scores = forest.score_samples(&probe);
        assert!(scores[1] < scores[0]);
        assert!(scores[1] < scores[2]);
    }

    #[test]
    fn test_seeded_fit_is_deterministic() {
        let data = cluster_with_outlier();
        let mut a = IsolationForest::with_params(50, 256, 42);
        let mut b = IsolationForest::with_params(50, 256, 42);
        a.fit(&data, 0.05).unwrap();
        b.fit(&data, 0.05).unwrap();

        assert_eq!(a.decision_function(&data), b.decision_function(&data));
        assert_eq!(a.offset(), b.offset());
    }

    #[test]
    fn test_single_row_fit() {
        let mut forest = IsolationForest::default();
        forest.fit(&matrix(&[&[1.0, 2.0]]), 0.01).unwrap();

        // c(1) = 0 so every row scores the neutral 0.5
        let scores = forest.score_samples(&matrix(&[&[1.0, 2.0], &[9.0, 9.0]]));
        assert_eq!(scores, vec![-0.5, -0.5]);
        assert_eq!(forest.predict(&matrix(&[&[3.0, 4.0]])), vec![Label::Normal]);
    }

    #[test]
    fn test_fit_rejects_bad_contamination() {
        let mut forest = IsolationForest::default();
        assert!(forest.fit(&cluster_with_outlier(), 0.0).is_err());
        assert!(forest.fit(&cluster_with_outlier(), 0.75).is_err());
        assert!(!forest.is_trained());
    }

    #[test]
    fn test_zero_trees_is_fit_error() {
        let mut forest = IsolationForest::with_params(0, 256, 42);
        assert!(forest.fit(&cluster_with_outlier(), 0.1).is_err());
    }

    #[test]
    fn test_extreme_finite_range_fits() {
        let data = matrix(&[&[-1e308, 1.0], &[1e308, 2.0], &[0.0, 3.0]]);
        let mut forest = IsolationForest::default();
        forest.fit(&data, 0.1).unwrap();

        assert!(forest.is_trained());
        assert!(forest.offset().is_finite());
        assert!(forest.decision_function(&data).iter().all(|d| d.is_finite()));
    }

    #[test]
    fn test_average_path_length() {
        assert_eq!(IsolationForest::average_path_length(1), 0.0);
        assert_eq!(IsolationForest::average_path_length(2), 1.0);

        let c_10 = IsolationForest::average_path_length(10);
        let c_100 = IsolationForest::average_path_length(100);
        assert!(c_100 > c_10, "c(100)={} should be > c(10)={}", c_100, c_10);
    }

    #[test]
    fn test_percentile_interpolation() {
        let sorted = [0.0, 1.0, 2.0, 3.0];
        assert_eq!(percentile(&sorted, 0.0), 0.0);
        assert_eq!(percentile(&sorted, 1.0), 3.0);
        assert!((percentile(&sorted, 0.5) - 1.5).abs() < 1e-12);
        assert!(percentile(&[], 0.5).is_nan());
    }
}
