//! Per-feature standardisation fitted once at training time.

use crate::detect::DetectError;
use serde::{Deserialize, Serialize};

/// Mean and population standard deviation per feature. Read-only after `fit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalerState {
    mean: Vec<f64>,
    std_dev: Vec<f64>,
}

impl ScalerState {
    pub fn dimension(&self) -> usize {
        self.mean.len()
    }

    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    pub fn std_dev(&self) -> &[f64] {
        &self.std_dev
    }

    fn check(&self, row: &[f64]) -> Result<(), DetectError> {
        if row.len() != self.dimension() {
            return Err(DetectError::DimensionMismatch {
                expected: self.dimension(),
                got: row.len(),
            });
        }
        Ok(())
    }

    /// Standardise a single row. A zero-variance feature divides by one.
    pub fn transform_row(&self, row: &[f64]) -> Result<Vec<f64>, DetectError> {
        self.check(row)?;
        Ok(row
            .iter()
            .zip(self.mean.iter().zip(&self.std_dev))
            .map(|(x, (m, s))| {
                let s = if *s == 0.0 { 1.0 } else { *s };
                (x - m) / s
            })
            .collect())
    }
}

/// Compute per-feature mean and standard deviation.
///
/// Every row must have the arity of the first one.
pub fn fit<R: AsRef<[f64]>>(rows: &[R]) -> Result<ScalerState, DetectError> {
    let first = rows
        .first()
        .ok_or_else(|| DetectError::InsufficientData("cannot fit scaler on an empty sample".into()))?;
    let dim = first.as_ref().len();
    let n = rows.len() as f64;

    let mut mean = vec![0.0; dim];
    for row in rows {
        let row = row.as_ref();
        if row.len() != dim {
            return Err(DetectError::DimensionMismatch { expected: dim, got: row.len() });
        }
        for (m, x) in mean.iter_mut().zip(row) {
            *m += x;
        }
    }
    mean.iter_mut().for_each(|m| *m /= n);

    let mut variance = vec![0.0; dim];
    for row in rows {
        for ((v, x), m) in variance.iter_mut().zip(row.as_ref()).zip(&mean) {
            *v += (x - m).powi(2);
        }
    }
    let std_dev = variance.into_iter().map(|v| (v / n).sqrt()).collect();

    Ok(ScalerState { mean, std_dev })
}

pub fn transform<R: AsRef<[f64]>>(rows: &[R], state: &ScalerState) -> Result<Vec<Vec<f64>>, DetectError> {
    rows.iter().map(|r| state.transform_row(r.as_ref())).collect()
}
