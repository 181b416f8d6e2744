// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Observation/action space descriptors and the observation encoder.

use ndarray::{Array2, ArrayD};

use crate::{MirrorResult, MirrorRlError};

/// Shape descriptor for the observations an environment emits.
#[derive(Clone, Debug, PartialEq)]
pub enum ObservationSpace {
    /// Floating-point observations of a fixed per-sample shape.
    Continuous { shape: Vec<usize> },
    /// A single integer observation in `[0, n)`, fed as one index per row.
    Discrete { n: usize },
}

impl ObservationSpace {
    /// Width of one encoded observation row.
    pub fn encoded_dim(&self) -> usize {
        match self {
            ObservationSpace::Continuous { shape } => shape.iter().product(),
            ObservationSpace::Discrete { n } => *n,
        }
    }

    /// Per-sample shape of the raw observation, excluding the batch axis.
    pub fn sample_shape(&self) -> &[usize] {
        match self {
            ObservationSpace::Continuous { shape } => shape,
            ObservationSpace::Discrete { .. } => &[],
        }
    }

    pub fn is_continuous(&self) -> bool {
        matches!(self, ObservationSpace::Continuous { .. })
    }
}

/// Descriptor for the actions the environment accepts.
#[derive(Clone, Debug, PartialEq)]
pub enum ActionSpace {
    Discrete { n: usize },
    Continuous { dim: usize },
}

impl ActionSpace {
    /// Width of the distribution parameter row produced by the policy head.
    pub fn param_dim(&self) -> usize {
        match self {
            ActionSpace::Discrete { n } => *n,
            ActionSpace::Continuous { dim } => *dim,
        }
    }

    /// Number of columns in a sampled action row.
    pub fn action_dim(&self) -> usize {
        match self {
            ActionSpace::Discrete { .. } => 1,
            ActionSpace::Continuous { dim } => *dim,
        }
    }
}

/// Static description of the environment a policy is built against.
#[derive(Clone, Debug, PartialEq)]
pub struct EnvSpec {
    pub id: String,
    pub observation_space: ObservationSpace,
    pub action_space: ActionSpace,
}

impl EnvSpec {
    pub fn new(
        id: impl Into<String>,
        observation_space: ObservationSpace,
        action_space: ActionSpace,
    ) -> Self {
        Self {
            id: id.into(),
            observation_space,
            action_space,
        }
    }
}

/// Encodes a batched raw observation into the `[batch, encoded_dim]` matrix
/// the feature networks consume. Continuous observations flatten; discrete
/// observations expand to one-hot rows.
pub fn encode_observation(
    space: &ObservationSpace,
    observation: &ArrayD<f32>,
) -> MirrorResult<Array2<f32>> {
    match space {
        ObservationSpace::Continuous { shape } => {
            let expected: usize = shape.iter().product();
            flatten_batch(observation, expected)
        }
        ObservationSpace::Discrete { n } => one_hot(observation, *n),
    }
}

/// Flattens `[batch, ...dims]` into `[batch, prod(dims)]`, validating the
/// per-sample width. Copies through logical order so mirrored (non-standard
/// layout) views flatten correctly.
pub(crate) fn flatten_batch(
    observation: &ArrayD<f32>,
    expected: usize,
) -> MirrorResult<Array2<f32>> {
    let shape = observation.shape();
    if shape.is_empty() {
        return Err(MirrorRlError::InvalidDimensions { rows: 0, cols: 0 });
    }
    let batch = shape[0];
    let width: usize = shape[1..].iter().product();
    if width != expected {
        return Err(MirrorRlError::ShapeMismatch {
            left: (batch, width),
            right: (batch, expected),
        });
    }
    let data: Vec<f32> = observation.iter().copied().collect();
    Array2::from_shape_vec((batch, width), data).map_err(|_| MirrorRlError::InvalidDimensions {
        rows: batch,
        cols: width,
    })
}

fn one_hot(observation: &ArrayD<f32>, n: usize) -> MirrorResult<Array2<f32>> {
    let shape = observation.shape();
    if shape.is_empty() {
        return Err(MirrorRlError::InvalidDimensions { rows: 0, cols: 0 });
    }
    let batch = shape[0];
    let width: usize = shape[1..].iter().product();
    if width != 1 && !shape[1..].is_empty() {
        return Err(MirrorRlError::ShapeMismatch {
            left: (batch, width),
            right: (batch, 1),
        });
    }
    let mut encoded = Array2::zeros((batch, n));
    for (row, value) in observation.iter().enumerate() {
        let index = *value as usize;
        if index >= n || *value < 0.0 {
            return Err(MirrorRlError::InvalidValue {
                label: "discrete observation index out of range",
            });
        }
        encoded[[row, index]] = 1.0;
    }
    Ok(encoded)
}
