// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Action distribution heads and the concrete per-batch distributions.

use std::f32::consts::PI;

use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution as _, StandardNormal};

use crate::module::{Dense, ParamStore, Parameter};
use crate::spaces::ActionSpace;
use crate::{MirrorResult, MirrorRlError};

/// Parameter head selecting the distribution family from the action space:
/// categorical logits for discrete spaces, a diagonal Gaussian with a
/// state-independent log-std for continuous ones.
#[derive(Clone, Debug)]
pub enum DistributionHead {
    Categorical { logits: Dense },
    DiagGaussian { mean: Dense, logstd: Parameter },
}

impl DistributionHead {
    pub fn from_action_space(
        space: &ActionSpace,
        feature_dim: usize,
        init_scale: f32,
        rng: &mut StdRng,
    ) -> MirrorResult<Self> {
        match space {
            ActionSpace::Discrete { n } => Ok(DistributionHead::Categorical {
                logits: Dense::new("pd::logits", feature_dim, *n, init_scale, rng)?,
            }),
            ActionSpace::Continuous { dim } => Ok(DistributionHead::DiagGaussian {
                mean: Dense::new("pd::mean", feature_dim, *dim, init_scale, rng)?,
                logstd: Parameter::new("pd::logstd", Array2::zeros((1, *dim))),
            }),
        }
    }

    /// Width of one distribution parameter row.
    pub fn param_dim(&self) -> usize {
        match self {
            DistributionHead::Categorical { logits } => logits.output_dim(),
            DistributionHead::DiagGaussian { mean, .. } => mean.output_dim(),
        }
    }

    /// Projects latent rows to distribution parameter rows.
    pub fn params(&self, latent: &Array2<f32>) -> MirrorResult<Array2<f32>> {
        match self {
            DistributionHead::Categorical { logits } => logits.forward(latent),
            DistributionHead::DiagGaussian { mean, .. } => mean.forward(latent),
        }
    }

    /// Instantiates the concrete distribution for a block of parameter rows.
    pub fn distribution(&self, params: Array2<f32>) -> MirrorResult<Distribution> {
        if params.ncols() != self.param_dim() {
            return Err(MirrorRlError::ShapeMismatch {
                left: params.dim(),
                right: (params.nrows(), self.param_dim()),
            });
        }
        match self {
            DistributionHead::Categorical { .. } => {
                Ok(Distribution::Categorical { logits: params })
            }
            DistributionHead::DiagGaussian { logstd, .. } => Ok(Distribution::DiagGaussian {
                mean: params,
                logstd: logstd.value().row(0).to_owned(),
            }),
        }
    }
}

impl ParamStore for DistributionHead {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> MirrorResult<()>,
    ) -> MirrorResult<()> {
        match self {
            DistributionHead::Categorical { logits } => logits.visit_parameters(visitor),
            DistributionHead::DiagGaussian { mean, logstd } => {
                mean.visit_parameters(visitor)?;
                visitor(logstd)
            }
        }
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> MirrorResult<()>,
    ) -> MirrorResult<()> {
        match self {
            DistributionHead::Categorical { logits } => logits.visit_parameters_mut(visitor),
            DistributionHead::DiagGaussian { mean, logstd } => {
                mean.visit_parameters_mut(visitor)?;
                visitor(logstd)
            }
        }
    }
}

/// Concrete per-batch action distribution.
#[derive(Clone, Debug)]
pub enum Distribution {
    Categorical { logits: Array2<f32> },
    DiagGaussian { mean: Array2<f32>, logstd: Array1<f32> },
}

impl Distribution {
    pub fn batch(&self) -> usize {
        match self {
            Distribution::Categorical { logits } => logits.nrows(),
            Distribution::DiagGaussian { mean, .. } => mean.nrows(),
        }
    }

    /// Draws one action per row. Discrete actions come back as a single
    /// index column; continuous actions as `[batch, dim]` values.
    pub fn sample(&self, rng: &mut StdRng) -> Array2<f32> {
        match self {
            Distribution::Categorical { logits } => {
                let probs = softmax_rows(logits);
                let mut actions = Array2::zeros((logits.nrows(), 1));
                for (row, prob) in probs.rows().into_iter().enumerate() {
                    let draw: f32 = rng.gen();
                    let mut cumulative = 0.0f32;
                    let mut chosen = prob.len() - 1;
                    for (index, p) in prob.iter().enumerate() {
                        cumulative += p;
                        if draw <= cumulative {
                            chosen = index;
                            break;
                        }
                    }
                    actions[[row, 0]] = chosen as f32;
                }
                actions
            }
            Distribution::DiagGaussian { mean, logstd } => {
                let mut actions = mean.clone();
                for mut row in actions.rows_mut() {
                    for (col, value) in row.iter_mut().enumerate() {
                        let noise: f32 = StandardNormal.sample(rng);
                        *value += logstd[col].exp() * noise;
                    }
                }
                actions
            }
        }
    }

    /// Negative log-probability of an action batch under this distribution.
    pub fn neglogp(&self, actions: &Array2<f32>) -> MirrorResult<Array1<f32>> {
        if actions.nrows() != self.batch() {
            return Err(MirrorRlError::ShapeMismatch {
                left: actions.dim(),
                right: (self.batch(), actions.ncols()),
            });
        }
        match self {
            Distribution::Categorical { logits } => {
                if actions.ncols() != 1 {
                    return Err(MirrorRlError::ShapeMismatch {
                        left: actions.dim(),
                        right: (actions.nrows(), 1),
                    });
                }
                let mut out = Array1::zeros(logits.nrows());
                for (row, logit) in logits.rows().into_iter().enumerate() {
                    let action = actions[[row, 0]] as usize;
                    if action >= logit.len() {
                        return Err(MirrorRlError::InvalidValue {
                            label: "discrete action index out of range",
                        });
                    }
                    let max = logit.iter().fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
                    let lse =
                        logit.iter().map(|&v| (v - max).exp()).sum::<f32>().ln() + max;
                    out[row] = lse - logit[action];
                }
                Ok(out)
            }
            Distribution::DiagGaussian { mean, logstd } => {
                if actions.ncols() != mean.ncols() {
                    return Err(MirrorRlError::ShapeMismatch {
                        left: actions.dim(),
                        right: mean.dim(),
                    });
                }
                let mut out = Array1::zeros(mean.nrows());
                let constant = 0.5 * (2.0 * PI).ln() * mean.ncols() as f32;
                for row in 0..mean.nrows() {
                    let mut acc = constant;
                    for col in 0..mean.ncols() {
                        let std = logstd[col].exp();
                        let z = (actions[[row, col]] - mean[[row, col]]) / std;
                        acc += 0.5 * z * z + logstd[col];
                    }
                    out[row] = acc;
                }
                Ok(out)
            }
        }
    }
}

/// Numerically stable row-wise softmax.
pub fn softmax_rows(rows: &Array2<f32>) -> Array2<f32> {
    let mut out = rows.clone();
    for mut row in out.rows_mut() {
        let max = row.iter().fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let total: f32 = row.sum();
        row.mapv_inplace(|v| v / total);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;

    #[test]
    fn softmax_rows_sum_to_one() {
        let rows = array![[1.0f32, 2.0, 3.0], [-5.0, 0.0, 5.0]];
        let probs = softmax_rows(&rows);
        for row in probs.rows() {
            assert!((row.sum() - 1.0).abs() < 1.0e-5);
            assert!(row.iter().all(|&p| p >= 0.0));
        }
    }

    #[test]
    fn categorical_samples_stay_in_range() {
        let dist = Distribution::Categorical {
            logits: array![[0.0f32, 1.0, -1.0], [3.0, 0.0, 0.0]],
        };
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..32 {
            let actions = dist.sample(&mut rng);
            assert_eq!(actions.dim(), (2, 1));
            assert!(actions.iter().all(|&a| (0.0..3.0).contains(&a)));
        }
    }

    #[test]
    fn categorical_neglogp_matches_log_softmax() {
        let logits = array![[2.0f32, 0.0]];
        let dist = Distribution::Categorical {
            logits: logits.clone(),
        };
        let nlp = dist.neglogp(&array![[0.0f32]]).unwrap();
        let probs = softmax_rows(&logits);
        assert!((nlp[0] - (-probs[[0, 0]].ln())).abs() < 1.0e-5);
    }

    #[test]
    fn gaussian_neglogp_of_mean_is_the_constant_term() {
        let dist = Distribution::DiagGaussian {
            mean: array![[0.5f32, -0.5]],
            logstd: Array1::zeros(2),
        };
        let nlp = dist.neglogp(&array![[0.5f32, -0.5]]).unwrap();
        let expected = 0.5 * (2.0 * PI).ln() * 2.0;
        assert!((nlp[0] - expected).abs() < 1.0e-5);
    }

    #[test]
    fn head_builds_family_from_action_space() {
        let mut rng = StdRng::seed_from_u64(11);
        let head = DistributionHead::from_action_space(
            &ActionSpace::Continuous { dim: 2 },
            4,
            0.01,
            &mut rng,
        )
        .unwrap();
        let latent = Array2::zeros((3, 4));
        let params = head.params(&latent).unwrap();
        assert_eq!(params.dim(), (3, 2));
        let dist = head.distribution(params).unwrap();
        assert_eq!(dist.batch(), 3);
    }
}
