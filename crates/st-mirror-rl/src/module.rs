// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Forward-only parameter primitives shared by networks and heads.

use std::collections::HashMap;

use ndarray::{Array2, ArrayView1};
use rand::rngs::StdRng;
use rand_distr::{Distribution as _, StandardNormal};

use crate::{MirrorResult, MirrorRlError};

/// Named tensor holding one learnable matrix.
#[derive(Clone, Debug, PartialEq)]
pub struct Parameter {
    name: String,
    value: Array2<f32>,
}

impl Parameter {
    /// Creates a new parameter with the provided value.
    pub fn new(name: impl Into<String>, value: Array2<f32>) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    /// Returns the identifier assigned to the parameter.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Provides an immutable view into the underlying value.
    pub fn value(&self) -> &Array2<f32> {
        &self.value
    }

    /// Provides a mutable view into the underlying value.
    pub fn value_mut(&mut self) -> &mut Array2<f32> {
        &mut self.value
    }

    /// Returns the `(rows, cols)` shape of the value.
    pub fn shape(&self) -> (usize, usize) {
        self.value.dim()
    }
}

/// Surface for walking the parameters of a network or head.
///
/// Both mirror branches read through the same store, so parameter sharing is
/// a property of construction rather than a runtime flag.
pub trait ParamStore {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> MirrorResult<()>,
    ) -> MirrorResult<()>;

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> MirrorResult<()>,
    ) -> MirrorResult<()>;

    /// Collects every parameter value keyed by name.
    fn state_dict(&self) -> MirrorResult<HashMap<String, Array2<f32>>> {
        let mut state = HashMap::new();
        self.visit_parameters(&mut |parameter| {
            state.insert(parameter.name().to_string(), parameter.value().clone());
            Ok(())
        })?;
        Ok(state)
    }

    /// Restores every parameter value from a state dict.
    fn load_state_dict(&mut self, state: &HashMap<String, Array2<f32>>) -> MirrorResult<()> {
        self.visit_parameters_mut(&mut |parameter| {
            let stored =
                state
                    .get(parameter.name())
                    .ok_or_else(|| MirrorRlError::MissingParameter {
                        name: parameter.name().to_string(),
                    })?;
            if stored.dim() != parameter.shape() {
                return Err(MirrorRlError::ShapeMismatch {
                    left: stored.dim(),
                    right: parameter.shape(),
                });
            }
            *parameter.value_mut() = stored.clone();
            Ok(())
        })
    }
}

/// Fully-connected projection with a bias row.
#[derive(Clone, Debug)]
pub struct Dense {
    weight: Parameter,
    bias: Parameter,
}

impl Dense {
    /// Creates a dense layer with normally distributed weights scaled by
    /// `init_scale / sqrt(input_dim)` and a zero bias.
    pub fn new(
        name: impl Into<String>,
        input_dim: usize,
        output_dim: usize,
        init_scale: f32,
        rng: &mut StdRng,
    ) -> MirrorResult<Self> {
        if input_dim == 0 || output_dim == 0 {
            return Err(MirrorRlError::InvalidDimensions {
                rows: input_dim,
                cols: output_dim,
            });
        }
        let name = name.into();
        let weight = init_matrix(input_dim, output_dim, init_scale, rng);
        let bias = Array2::zeros((1, output_dim));
        Ok(Self {
            weight: Parameter::new(format!("{name}::weight"), weight),
            bias: Parameter::new(format!("{name}::bias"), bias),
        })
    }

    pub fn input_dim(&self) -> usize {
        self.weight.shape().0
    }

    pub fn output_dim(&self) -> usize {
        self.weight.shape().1
    }

    /// Applies the projection to a `[batch, input_dim]` matrix.
    pub fn forward(&self, input: &Array2<f32>) -> MirrorResult<Array2<f32>> {
        if input.ncols() != self.input_dim() {
            return Err(MirrorRlError::ShapeMismatch {
                left: input.dim(),
                right: self.weight.shape(),
            });
        }
        let mut out = input.dot(self.weight.value());
        add_row_inplace(&mut out, self.bias.value().row(0));
        Ok(out)
    }
}

impl ParamStore for Dense {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> MirrorResult<()>,
    ) -> MirrorResult<()> {
        visitor(&self.weight)?;
        visitor(&self.bias)?;
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> MirrorResult<()>,
    ) -> MirrorResult<()> {
        visitor(&mut self.weight)?;
        visitor(&mut self.bias)?;
        Ok(())
    }
}

/// Normally distributed matrix scaled by `init_scale / sqrt(rows)`.
pub(crate) fn init_matrix(
    rows: usize,
    cols: usize,
    init_scale: f32,
    rng: &mut StdRng,
) -> Array2<f32> {
    let scale = init_scale / (rows as f32).sqrt();
    Array2::from_shape_fn((rows, cols), |_| {
        let draw: f32 = StandardNormal.sample(rng);
        draw * scale
    })
}

/// Adds a row vector to every row of a matrix.
pub(crate) fn add_row_inplace(matrix: &mut Array2<f32>, row: ArrayView1<f32>) {
    for mut target in matrix.rows_mut() {
        target += &row;
    }
}
