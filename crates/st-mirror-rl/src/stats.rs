// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Running observation statistics for input normalization.

use ndarray::{Array1, Array2, Axis};

use crate::{MirrorResult, MirrorRlError};

const CLIP_RANGE: f32 = 5.0;
const VAR_FLOOR: f32 = 1.0e-8;

/// Running mean/variance estimator over flattened observation rows.
///
/// The policy only ever reads `mean`/`std` during a forward pass; `update`
/// is driven by the external training loop. Both mirror branches normalize
/// through one shared instance.
#[derive(Clone, Debug, PartialEq)]
pub struct RunningMeanStd {
    mean: Array1<f32>,
    var: Array1<f32>,
    count: f64,
}

impl RunningMeanStd {
    pub fn new(dim: usize) -> MirrorResult<Self> {
        if dim == 0 {
            return Err(MirrorRlError::InvalidDimensions { rows: 1, cols: 0 });
        }
        Ok(Self {
            mean: Array1::zeros(dim),
            var: Array1::ones(dim),
            count: 1.0e-4,
        })
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    pub fn mean(&self) -> &Array1<f32> {
        &self.mean
    }

    pub fn var(&self) -> &Array1<f32> {
        &self.var
    }

    pub fn count(&self) -> f64 {
        self.count
    }

    pub fn std(&self) -> Array1<f32> {
        self.var.mapv(|v| v.max(VAR_FLOOR).sqrt())
    }

    /// Folds a batch of rows into the running estimate using the parallel
    /// variance merge, so the result is order-insensitive across batches.
    pub fn update(&mut self, batch: &Array2<f32>) -> MirrorResult<()> {
        if batch.ncols() != self.dim() {
            return Err(MirrorRlError::ShapeMismatch {
                left: batch.dim(),
                right: (batch.nrows(), self.dim()),
            });
        }
        if batch.nrows() == 0 {
            return Ok(());
        }
        let batch_count = batch.nrows() as f64;
        let batch_mean = batch.mean_axis(Axis(0)).ok_or(MirrorRlError::InvalidDimensions {
            rows: batch.nrows(),
            cols: batch.ncols(),
        })?;
        let mut batch_var = Array1::<f32>::zeros(self.dim());
        for row in batch.rows() {
            for (col, value) in row.iter().enumerate() {
                let delta = value - batch_mean[col];
                batch_var[col] += delta * delta;
            }
        }
        batch_var.mapv_inplace(|v| v / batch_count as f32);

        let total = self.count + batch_count;
        let delta = &batch_mean - &self.mean;
        let new_mean = &self.mean + &delta.mapv(|d| d * (batch_count / total) as f32);
        let m_a = self.var.mapv(|v| v * self.count as f32);
        let m_b = batch_var.mapv(|v| v * batch_count as f32);
        let correction =
            delta.mapv(|d| d * d * (self.count * batch_count / total) as f32);
        let new_var = (&m_a + &m_b + &correction).mapv(|v| v / total as f32);

        self.mean = new_mean;
        self.var = new_var;
        self.count = total;
        Ok(())
    }

    /// Overwrites the estimate from a checkpoint snapshot.
    pub fn restore(
        &mut self,
        mean: Array1<f32>,
        var: Array1<f32>,
        count: f64,
    ) -> MirrorResult<()> {
        if mean.len() != self.dim() || var.len() != self.dim() {
            return Err(MirrorRlError::ShapeMismatch {
                left: (1, mean.len()),
                right: (1, self.dim()),
            });
        }
        self.mean = mean;
        self.var = var;
        self.count = count;
        Ok(())
    }

    /// Normalizes rows with the current statistics and clips to `[-5, 5]`.
    pub fn normalize_clip(&self, rows: &Array2<f32>) -> MirrorResult<Array2<f32>> {
        if rows.ncols() != self.dim() {
            return Err(MirrorRlError::ShapeMismatch {
                left: rows.dim(),
                right: (rows.nrows(), self.dim()),
            });
        }
        let std = self.std();
        let mut out = rows.clone();
        for mut row in out.rows_mut() {
            for (col, value) in row.iter_mut().enumerate() {
                *value = ((*value - self.mean[col]) / std[col]).clamp(-CLIP_RANGE, CLIP_RANGE);
            }
        }
        Ok(out)
    }
}
