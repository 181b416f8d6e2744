// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Environment symmetry rules: the observation flip and the action-index
//! permutation that maps mirrored-branch distribution parameters back into
//! original-branch coordinates.

use std::collections::HashMap;
use std::sync::RwLock;

use ndarray::{Array2, ArrayD, Axis};
use once_cell::sync::Lazy;

use crate::{MirrorResult, MirrorRlError};

static RULES: Lazy<RwLock<HashMap<String, SymmetryRule>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Left-right symmetry description for one environment.
///
/// `perm` and `signs` act on distribution parameter columns: column `j` of
/// the mirrored output reads `signs[j] * params[.., perm[j]]`. Sign flips
/// cover quantities whose mirror image is a negation (lateral velocities),
/// the permutation covers left/right label swaps (paired leg torques).
#[derive(Clone, Debug, PartialEq)]
pub struct SymmetryRule {
    obs_axis: usize,
    perm: Vec<usize>,
    signs: Vec<f32>,
}

impl SymmetryRule {
    /// Builds a rule, validating that `perm` is a permutation and every
    /// sign is exactly `+1` or `-1`.
    pub fn new(obs_axis: usize, perm: Vec<usize>, signs: Vec<f32>) -> MirrorResult<Self> {
        if perm.len() != signs.len() {
            return Err(MirrorRlError::InvalidValue {
                label: "permutation and sign tables must have equal length",
            });
        }
        let mut seen = vec![false; perm.len()];
        for &index in &perm {
            if index >= perm.len() || seen[index] {
                return Err(MirrorRlError::InvalidValue {
                    label: "index table is not a permutation",
                });
            }
            seen[index] = true;
        }
        if signs.iter().any(|&s| s != 1.0 && s != -1.0) {
            return Err(MirrorRlError::InvalidValue {
                label: "signs must be +1 or -1",
            });
        }
        Ok(Self {
            obs_axis,
            perm,
            signs,
        })
    }

    /// Identity rule: the flip axis is still applied to observations but the
    /// action parameters map straight through.
    pub fn identity(dim: usize, obs_axis: usize) -> Self {
        Self {
            obs_axis,
            perm: (0..dim).collect(),
            signs: vec![1.0; dim],
        }
    }

    /// Axis of the batched observation reversed by the mirror transform.
    pub fn obs_axis(&self) -> usize {
        self.obs_axis
    }

    /// Width of the parameter rows this rule permutes.
    pub fn param_dim(&self) -> usize {
        self.perm.len()
    }

    /// Reindexes mirrored-branch distribution parameters into
    /// original-branch coordinates.
    pub fn mirror_modify(&self, params: &Array2<f32>) -> MirrorResult<Array2<f32>> {
        if params.ncols() != self.perm.len() {
            return Err(MirrorRlError::ShapeMismatch {
                left: params.dim(),
                right: (params.nrows(), self.perm.len()),
            });
        }
        let mut out = Array2::zeros(params.dim());
        for (target, (&source, &sign)) in self.perm.iter().zip(&self.signs).enumerate() {
            for row in 0..params.nrows() {
                out[[row, target]] = sign * params[[row, source]];
            }
        }
        Ok(out)
    }
}

/// Registers a rule under an environment identifier, replacing any previous
/// registration for that id.
pub fn register_symmetry_rule(id: impl Into<String>, rule: SymmetryRule) {
    RULES
        .write()
        .expect("symmetry registry poisoned")
        .insert(id.into(), rule);
}

/// Looks up a registered rule.
pub fn symmetry_rule(id: &str) -> MirrorResult<SymmetryRule> {
    RULES
        .read()
        .expect("symmetry registry poisoned")
        .get(id)
        .cloned()
        .ok_or_else(|| MirrorRlError::UnknownSymmetryRule {
            rule: id.to_string(),
        })
}

/// Reverses the designated spatial axis of a batched observation.
pub fn mirror_observation(observation: &ArrayD<f32>, axis: usize) -> MirrorResult<ArrayD<f32>> {
    if axis == 0 || axis >= observation.ndim() {
        return Err(MirrorRlError::UnsupportedConfiguration {
            reason: "mirror axis must name a non-batch axis of the observation",
        });
    }
    let mut mirrored = observation.clone();
    mirrored.invert_axis(Axis(axis));
    Ok(mirrored)
}

/// Default flip axis for an observation sample shape: axis 2 of the batched
/// tensor when the sample has spatial structure, otherwise the feature axis.
pub(crate) fn default_obs_axis(sample_shape: &[usize]) -> usize {
    if sample_shape.len() >= 2 {
        2
    } else {
        sample_shape.len().max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, ArrayD, IxDyn};

    #[test]
    fn mirror_of_mirror_is_identity() {
        let obs = ArrayD::from_shape_fn(IxDyn(&[2, 3, 4]), |idx| {
            (idx[0] * 100 + idx[1] * 10 + idx[2]) as f32
        });
        let once = mirror_observation(&obs, 2).unwrap();
        let twice = mirror_observation(&once, 2).unwrap();
        assert_eq!(obs, twice);
        assert_ne!(obs, once);
    }

    #[test]
    fn batch_axis_cannot_be_mirrored() {
        let obs = ArrayD::from_shape_vec(IxDyn(&[2, 2]), vec![0.0; 4]).unwrap();
        assert!(matches!(
            mirror_observation(&obs, 0),
            Err(MirrorRlError::UnsupportedConfiguration { .. })
        ));
    }

    #[test]
    fn mirror_modify_permutes_and_flips() {
        let rule = SymmetryRule::new(1, vec![1, 0, 2], vec![1.0, 1.0, -1.0]).unwrap();
        let params = array![[1.0f32, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let mapped = rule.mirror_modify(&params).unwrap();
        assert_eq!(mapped, array![[2.0f32, 1.0, -3.0], [5.0, 4.0, -6.0]]);
    }

    #[test]
    fn involutive_rule_round_trips() {
        let rule = SymmetryRule::new(1, vec![1, 0], vec![1.0, 1.0]).unwrap();
        let params = array![[0.25f32, -0.75]];
        let twice = rule
            .mirror_modify(&rule.mirror_modify(&params).unwrap())
            .unwrap();
        assert_eq!(params, twice);
    }

    #[test]
    fn malformed_rules_are_rejected() {
        assert!(SymmetryRule::new(1, vec![0, 0], vec![1.0, 1.0]).is_err());
        assert!(SymmetryRule::new(1, vec![0, 1], vec![1.0, 0.5]).is_err());
        assert!(SymmetryRule::new(1, vec![0, 1], vec![1.0]).is_err());
    }

    #[test]
    fn unknown_rule_lookup_fails() {
        assert!(matches!(
            symmetry_rule("never-registered"),
            Err(MirrorRlError::UnknownSymmetryRule { .. })
        ));
    }

    #[test]
    fn registry_round_trips() {
        let rule = SymmetryRule::new(1, vec![1, 0], vec![1.0, -1.0]).unwrap();
        register_symmetry_rule("walker-test", rule.clone());
        assert_eq!(symmetry_rule("walker-test").unwrap(), rule);
    }
}
