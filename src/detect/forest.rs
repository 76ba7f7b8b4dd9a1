//! Isolation forest: an ensemble of random partitioning trees.
//!
//! Points that are isolated after few random splits are outliers. The forest
//! scores a row by its average path length over all trees, normalised by the
//! expected path length of an unsuccessful BST search over the sub-sample.
//! The anomaly threshold is fixed at fit time from the training scores.

use crate::detect::DetectError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

const EULER_GAMMA: f64 = 0.577_215_664_9;

/// Training parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForestParams {
    /// Number of trees in the ensemble.
    pub n_trees: usize,
    /// Upper bound on the per-tree sub-sample.
    pub max_subsample: usize,
    /// Assumed anomalous fraction of the training sample.
    pub contamination: f64,
    /// Fixed seed for reproducible forests. `None` draws from OS entropy.
    pub seed: Option<u64>,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_trees: 100,
            max_subsample: 256,
            contamination: 0.10,
            seed: Some(42),
        }
    }
}

#[derive(Debug, Clone)]
enum Node {
    Split {
        feature: usize,
        value: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
    Leaf {
        depth: usize,
        size: usize,
    },
}

#[derive(Debug, Clone)]
struct IsolationTree {
    root: Node,
}

impl IsolationTree {
    fn grow(rows: &[&[f64]], depth: usize, height_limit: usize, rng: &mut StdRng) -> Node {
        if depth >= height_limit || rows.len() <= 1 {
            return Node::Leaf { depth, size: rows.len() };
        }

        // (feature, min, max) for every feature that still varies in this node
        let dim = rows[0].len();
        let splittable: Vec<(usize, f64, f64)> = (0..dim)
            .filter_map(|f| {
                let (lo, hi) = rows.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), r| {
                    (lo.min(r[f]), hi.max(r[f]))
                });
                (lo < hi).then_some((f, lo, hi))
            })
            .collect();

        if splittable.is_empty() {
            return Node::Leaf { depth, size: rows.len() };
        }

        let (feature, lo, hi) = splittable[rng.gen_range(0..splittable.len())];
        let value = rng.gen_range(lo..hi);
        let (left, right): (Vec<&[f64]>, Vec<&[f64]>) = rows.iter().copied().partition(|r| r[feature] < value);

        Node::Split {
            feature,
            value,
            left: Box::new(Self::grow(&left, depth + 1, height_limit, rng)),
            right: Box::new(Self::grow(&right, depth + 1, height_limit, rng)),
        }
    }

    fn path_length(&self, row: &[f64]) -> f64 {
        let mut node = &self.root;
        loop {
            match node {
                Node::Split { feature, value, left, right } => {
                    node = if row[*feature] < *value { left } else { right };
                }
                Node::Leaf { depth, size } => return *depth as f64 + average_path_length(*size),
            }
        }
    }
}

/// Expected path length of an unsuccessful search in a BST of `n` points.
pub fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

/// Score of the `k`-th most anomalous training point, `k = round(c * n)`.
///
/// When that score is shared with the next point the threshold moves up past
/// the whole tied block, so identical typical points are never flagged en masse.
pub fn contamination_threshold(scores: &[f64], contamination: f64) -> f64 {
    if scores.is_empty() {
        return f64::INFINITY;
    }
    let mut sorted = scores.to_vec();
    sorted.sort_by(|a, b| b.total_cmp(a));

    let n = sorted.len();
    let k = ((contamination * n as f64).round() as usize).clamp(1, n);
    let cut = sorted[k - 1];
    if k < n && sorted[k] == cut {
        sorted[..k]
            .iter()
            .rev()
            .copied()
            .find(|s| *s > cut)
            .unwrap_or(f64::INFINITY)
    } else {
        cut
    }
}

/// A trained forest plus its decision threshold. Immutable once built.
#[derive(Debug, Clone)]
pub struct IsolationForest {
    trees: Vec<IsolationTree>,
    subsample_size: usize,
    dimension: usize,
    threshold: f64,
}

impl IsolationForest {
    /// Build the forest over already-normalised rows and derive the threshold.
    pub fn fit(rows: &[Vec<f64>], params: &ForestParams) -> Result<Self, DetectError> {
        let first = rows
            .first()
            .ok_or_else(|| DetectError::InsufficientData("empty training sample".into()))?;
        let dimension = first.len();
        if let Some(bad) = rows.iter().find(|r| r.len() != dimension) {
            return Err(DetectError::DimensionMismatch { expected: dimension, got: bad.len() });
        }
        if rows.iter().all(|r| r == first) {
            return Err(DetectError::InsufficientData(format!(
                "all {} training points are identical",
                rows.len()
            )));
        }
        if params.n_trees == 0 {
            return Err(DetectError::InsufficientData("forest needs at least one tree".into()));
        }

        let mut rng = match params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let subsample_size = rows.len().min(params.max_subsample.max(2));
        let height_limit = ((subsample_size as f64).log2().ceil() as usize).max(1);

        let trees = (0..params.n_trees)
            .map(|_| {
                let sample: Vec<&[f64]> = rand::seq::index::sample(&mut rng, rows.len(), subsample_size)
                    .into_iter()
                    .map(|i| rows[i].as_slice())
                    .collect();
                IsolationTree {
                    root: IsolationTree::grow(&sample, 0, height_limit, &mut rng),
                }
            })
            .collect();

        let mut forest = Self {
            trees,
            subsample_size,
            dimension,
            threshold: f64::INFINITY,
        };

        let scores: Vec<f64> = rows.iter().map(|r| forest.score_unchecked(r)).collect();
        forest.threshold = contamination_threshold(&scores, params.contamination);
        Ok(forest)
    }

    fn score_unchecked(&self, row: &[f64]) -> f64 {
        let total: f64 = self.trees.iter().map(|t| t.path_length(row)).sum();
        let avg = total / self.trees.len() as f64;
        2f64.powf(-avg / average_path_length(self.subsample_size))
    }

    /// Anomaly score in `(0, 1]`; near 1 means isolated quickly.
    pub fn score(&self, row: &[f64]) -> Result<f64, DetectError> {
        if row.len() != self.dimension {
            return Err(DetectError::DimensionMismatch { expected: self.dimension, got: row.len() });
        }
        Ok(self.score_unchecked(row))
    }

    pub fn is_anomaly(&self, score: f64) -> bool {
        score >= self.threshold
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn subsample_size(&self) -> usize {
        self.subsample_size
    }
}
