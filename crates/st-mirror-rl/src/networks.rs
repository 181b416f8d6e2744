// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Feature-extraction networks and their builder registry.

use std::collections::HashMap;
use std::sync::RwLock;

use ndarray::{s, Array1, Array2};
use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::module::{add_row_inplace, init_matrix, Dense, ParamStore, Parameter};
use crate::{MirrorResult, MirrorRlError};

/// Batch arithmetic for recurrent evaluation: `nbatch = nenv * nsteps`,
/// rows laid out step-major (all environments for step 0, then step 1, ...).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecurrentBatch {
    pub nenv: usize,
    pub nsteps: usize,
}

impl RecurrentBatch {
    /// Derives the layout, failing fast on batches that do not divide into
    /// a positive number of environments.
    pub fn resolve(nbatch: usize, nsteps: usize) -> MirrorResult<Self> {
        if nsteps == 0 || nbatch == 0 || nbatch % nsteps != 0 {
            return Err(MirrorRlError::InvalidBatchShape { nbatch, nsteps });
        }
        let nenv = nbatch / nsteps;
        if nenv == 0 {
            return Err(MirrorRlError::InvalidBatchShape { nbatch, nsteps });
        }
        Ok(Self { nenv, nsteps })
    }

    pub fn nbatch(&self) -> usize {
        self.nenv * self.nsteps
    }
}

/// A parameterized observation-to-latent map.
///
/// `forward` is a pure function of the stored parameters, so invoking it for
/// the original and the mirrored branch trivially shares every weight.
pub trait FeatureNetwork: ParamStore + Send + Sync {
    fn input_dim(&self) -> usize;
    fn feature_dim(&self) -> usize;

    fn is_recurrent(&self) -> bool {
        false
    }

    /// Width of one environment's recurrent state row; zero when stateless.
    fn state_dim(&self) -> usize {
        0
    }

    fn forward(&self, encoded: &Array2<f32>) -> MirrorResult<Array2<f32>>;

    /// Stateful forward over a step-major batch. Returns the latent rows and
    /// the next per-environment state.
    fn forward_recurrent(
        &self,
        _encoded: &Array2<f32>,
        _layout: &RecurrentBatch,
        _state: &Array2<f32>,
        _mask: &Array1<f32>,
    ) -> MirrorResult<(Array2<f32>, Array2<f32>)> {
        Err(MirrorRlError::UnsupportedConfiguration {
            reason: "network is not recurrent",
        })
    }

    /// Zero state for `nenv` environments; `None` when stateless.
    fn initial_state(&self, _nenv: usize) -> Option<Array2<f32>> {
        None
    }
}

/// Options threaded into a registered network builder. `scope` prefixes
/// parameter names so two instances of one architecture (policy scope `pi`,
/// copied value scope `vf`) keep disjoint state dicts.
#[derive(Clone, Debug)]
pub struct NetworkConfig {
    pub scope: String,
    pub input_dim: usize,
    pub num_layers: usize,
    pub num_hidden: usize,
    pub seed: u64,
}

pub type NetworkBuilderFn = fn(&NetworkConfig) -> MirrorResult<Box<dyn FeatureNetwork>>;

static BUILDERS: Lazy<RwLock<HashMap<String, NetworkBuilderFn>>> = Lazy::new(|| {
    let mut builders: HashMap<String, NetworkBuilderFn> = HashMap::new();
    builders.insert("mlp".to_string(), build_mlp);
    builders.insert("lstm".to_string(), build_lstm);
    RwLock::new(builders)
});

fn build_mlp(config: &NetworkConfig) -> MirrorResult<Box<dyn FeatureNetwork>> {
    Ok(Box::new(MlpNetwork::new(
        &config.scope,
        config.input_dim,
        config.num_layers,
        config.num_hidden,
        config.seed,
    )?))
}

fn build_lstm(config: &NetworkConfig) -> MirrorResult<Box<dyn FeatureNetwork>> {
    Ok(Box::new(MirrorLstmNetwork::new(
        &config.scope,
        config.input_dim,
        config.num_hidden,
        config.seed,
    )?))
}

/// Registers a builder under a name, replacing any previous registration.
pub fn register_network(name: impl Into<String>, builder: NetworkBuilderFn) {
    BUILDERS
        .write()
        .expect("network registry poisoned")
        .insert(name.into(), builder);
}

/// Looks up a registered builder.
pub fn network_builder(name: &str) -> MirrorResult<NetworkBuilderFn> {
    BUILDERS
        .read()
        .expect("network registry poisoned")
        .get(name)
        .copied()
        .ok_or_else(|| MirrorRlError::UnknownNetwork {
            name: name.to_string(),
        })
}

/// How the policy builder obtains its feature extractor.
pub enum NetworkSpec {
    /// A registered builder name plus its sizing knobs.
    Registered {
        name: String,
        num_layers: usize,
        num_hidden: usize,
    },
    /// A pre-built network supplied by the caller.
    Custom(Box<dyn FeatureNetwork>),
}

impl NetworkSpec {
    /// Registered spec with the conventional 2x64 tanh sizing.
    pub fn registered(name: impl Into<String>) -> Self {
        NetworkSpec::Registered {
            name: name.into(),
            num_layers: 2,
            num_hidden: 64,
        }
    }

    pub fn with_layers(self, num_layers: usize, num_hidden: usize) -> Self {
        match self {
            NetworkSpec::Registered { name, .. } => NetworkSpec::Registered {
                name,
                num_layers,
                num_hidden,
            },
            custom => custom,
        }
    }
}

/// Tanh multi-layer perceptron.
#[derive(Clone, Debug)]
pub struct MlpNetwork {
    input_dim: usize,
    feature_dim: usize,
    layers: Vec<Dense>,
}

impl MlpNetwork {
    pub fn new(
        scope: &str,
        input_dim: usize,
        num_layers: usize,
        num_hidden: usize,
        seed: u64,
    ) -> MirrorResult<Self> {
        if num_layers == 0 || num_hidden == 0 || input_dim == 0 {
            return Err(MirrorRlError::InvalidDimensions {
                rows: num_layers.max(input_dim),
                cols: num_hidden,
            });
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let mut layers = Vec::with_capacity(num_layers);
        let mut width = input_dim;
        for index in 0..num_layers {
            layers.push(Dense::new(
                format!("{scope}::mlp_fc{index}"),
                width,
                num_hidden,
                2.0f32.sqrt(),
                &mut rng,
            )?);
            width = num_hidden;
        }
        Ok(Self {
            input_dim,
            feature_dim: num_hidden,
            layers,
        })
    }
}

impl FeatureNetwork for MlpNetwork {
    fn input_dim(&self) -> usize {
        self.input_dim
    }

    fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    fn forward(&self, encoded: &Array2<f32>) -> MirrorResult<Array2<f32>> {
        let mut latent = encoded.clone();
        for layer in &self.layers {
            latent = layer.forward(&latent)?;
            latent.mapv_inplace(f32::tanh);
        }
        Ok(latent)
    }
}

impl ParamStore for MlpNetwork {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> MirrorResult<()>,
    ) -> MirrorResult<()> {
        for layer in &self.layers {
            layer.visit_parameters(visitor)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> MirrorResult<()>,
    ) -> MirrorResult<()> {
        for layer in &mut self.layers {
            layer.visit_parameters_mut(visitor)?;
        }
        Ok(())
    }
}

/// Single-layer LSTM over step-major batches with masked episode resets.
///
/// The recurrent state row for one environment is `[h ++ c]`, so
/// `state_dim == 2 * hidden_dim`.
#[derive(Clone, Debug)]
pub struct MirrorLstmNetwork {
    input_dim: usize,
    hidden_dim: usize,
    weight_ih: Parameter,
    weight_hh: Parameter,
    bias: Parameter,
}

impl MirrorLstmNetwork {
    pub fn new(scope: &str, input_dim: usize, hidden_dim: usize, seed: u64) -> MirrorResult<Self> {
        if input_dim == 0 || hidden_dim == 0 {
            return Err(MirrorRlError::InvalidDimensions {
                rows: input_dim,
                cols: hidden_dim,
            });
        }
        let mut rng = StdRng::seed_from_u64(seed);
        Ok(Self {
            input_dim,
            hidden_dim,
            weight_ih: Parameter::new(
                format!("{scope}::lstm::weight_ih"),
                init_matrix(input_dim, 4 * hidden_dim, 1.0, &mut rng),
            ),
            weight_hh: Parameter::new(
                format!("{scope}::lstm::weight_hh"),
                init_matrix(hidden_dim, 4 * hidden_dim, 1.0, &mut rng),
            ),
            bias: Parameter::new(
                format!("{scope}::lstm::bias"),
                Array2::zeros((1, 4 * hidden_dim)),
            ),
        })
    }

    fn sigmoid(value: f32) -> f32 {
        1.0 / (1.0 + (-value).exp())
    }
}

impl FeatureNetwork for MirrorLstmNetwork {
    fn input_dim(&self) -> usize {
        self.input_dim
    }

    fn feature_dim(&self) -> usize {
        self.hidden_dim
    }

    fn is_recurrent(&self) -> bool {
        true
    }

    fn state_dim(&self) -> usize {
        2 * self.hidden_dim
    }

    fn forward(&self, _encoded: &Array2<f32>) -> MirrorResult<Array2<f32>> {
        Err(MirrorRlError::UnsupportedConfiguration {
            reason: "recurrent network needs a step layout; use forward_recurrent",
        })
    }

    fn forward_recurrent(
        &self,
        encoded: &Array2<f32>,
        layout: &RecurrentBatch,
        state: &Array2<f32>,
        mask: &Array1<f32>,
    ) -> MirrorResult<(Array2<f32>, Array2<f32>)> {
        let nh = self.hidden_dim;
        let nenv = layout.nenv;
        let nbatch = layout.nbatch();
        if encoded.dim() != (nbatch, self.input_dim) {
            return Err(MirrorRlError::ShapeMismatch {
                left: encoded.dim(),
                right: (nbatch, self.input_dim),
            });
        }
        if state.dim() != (nenv, 2 * nh) {
            return Err(MirrorRlError::ShapeMismatch {
                left: state.dim(),
                right: (nenv, 2 * nh),
            });
        }
        if mask.len() != nbatch {
            return Err(MirrorRlError::ShapeMismatch {
                left: (mask.len(), 1),
                right: (nbatch, 1),
            });
        }

        let mut hidden = state.slice(s![.., 0..nh]).to_owned();
        let mut cell = state.slice(s![.., nh..2 * nh]).to_owned();
        let mut latent = Array2::zeros((nbatch, nh));

        for step in 0..layout.nsteps {
            let rows = encoded.slice(s![step * nenv..(step + 1) * nenv, ..]);
            for env in 0..nenv {
                let keep = 1.0 - mask[step * nenv + env];
                hidden.row_mut(env).mapv_inplace(|v| v * keep);
                cell.row_mut(env).mapv_inplace(|v| v * keep);
            }
            let mut gates = rows.dot(self.weight_ih.value());
            gates += &hidden.dot(self.weight_hh.value());
            add_row_inplace(&mut gates, self.bias.value().row(0));
            for env in 0..nenv {
                for unit in 0..nh {
                    let input_gate = Self::sigmoid(gates[[env, unit]]);
                    let forget_gate = Self::sigmoid(gates[[env, nh + unit]]);
                    let candidate = gates[[env, 2 * nh + unit]].tanh();
                    let output_gate = Self::sigmoid(gates[[env, 3 * nh + unit]]);
                    let next_cell = forget_gate * cell[[env, unit]] + input_gate * candidate;
                    cell[[env, unit]] = next_cell;
                    hidden[[env, unit]] = output_gate * next_cell.tanh();
                }
            }
            latent
                .slice_mut(s![step * nenv..(step + 1) * nenv, ..])
                .assign(&hidden);
        }

        let mut next_state = Array2::zeros((nenv, 2 * nh));
        next_state.slice_mut(s![.., 0..nh]).assign(&hidden);
        next_state.slice_mut(s![.., nh..2 * nh]).assign(&cell);
        Ok((latent, next_state))
    }

    fn initial_state(&self, nenv: usize) -> Option<Array2<f32>> {
        Some(Array2::zeros((nenv, 2 * self.hidden_dim)))
    }
}

impl ParamStore for MirrorLstmNetwork {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> MirrorResult<()>,
    ) -> MirrorResult<()> {
        visitor(&self.weight_ih)?;
        visitor(&self.weight_hh)?;
        visitor(&self.bias)?;
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> MirrorResult<()>,
    ) -> MirrorResult<()> {
        visitor(&mut self.weight_ih)?;
        visitor(&mut self.weight_hh)?;
        visitor(&mut self.bias)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_rejects_indivisible_batches() {
        assert!(matches!(
            RecurrentBatch::resolve(10, 3),
            Err(MirrorRlError::InvalidBatchShape {
                nbatch: 10,
                nsteps: 3
            })
        ));
        assert!(matches!(
            RecurrentBatch::resolve(5, 10),
            Err(MirrorRlError::InvalidBatchShape { .. })
        ));
        assert_eq!(
            RecurrentBatch::resolve(12, 3).unwrap(),
            RecurrentBatch { nenv: 4, nsteps: 3 }
        );
    }

    #[test]
    fn mlp_forward_shapes_and_determinism() {
        let net = MlpNetwork::new("pi", 4, 2, 8, 42).unwrap();
        let twin = MlpNetwork::new("pi", 4, 2, 8, 42).unwrap();
        let input = Array2::from_shape_fn((5, 4), |(r, c)| (r + c) as f32 * 0.1);
        let a = net.forward(&input).unwrap();
        let b = twin.forward(&input).unwrap();
        assert_eq!(a.dim(), (5, 8));
        assert_eq!(a, b);
    }

    #[test]
    fn same_parameters_same_latents() {
        // The shared-parameter contract: one store, two invocations.
        let net = MlpNetwork::new("pi", 3, 2, 6, 7).unwrap();
        let input = Array2::from_shape_fn((4, 3), |(r, c)| (r * 3 + c) as f32);
        assert_eq!(net.forward(&input).unwrap(), net.forward(&input).unwrap());
    }

    #[test]
    fn lstm_emits_latents_and_next_state() {
        let net = MirrorLstmNetwork::new("pi", 3, 5, 1).unwrap();
        let layout = RecurrentBatch::resolve(8, 4).unwrap();
        let encoded = Array2::from_shape_fn((8, 3), |(r, c)| (r + c) as f32 * 0.05);
        let state = net.initial_state(layout.nenv).unwrap();
        let mask = Array1::zeros(8);
        let (latent, next_state) = net
            .forward_recurrent(&encoded, &layout, &state, &mask)
            .unwrap();
        assert_eq!(latent.dim(), (8, 5));
        assert_eq!(next_state.dim(), (2, 10));
        assert!(next_state.iter().any(|&v| v != 0.0));
    }

    #[test]
    fn lstm_mask_resets_state() {
        let net = MirrorLstmNetwork::new("pi", 2, 3, 1).unwrap();
        let layout = RecurrentBatch::resolve(2, 2).unwrap();
        let encoded = Array2::from_elem((2, 2), 0.5);
        let warm = Array2::from_elem((1, 6), 0.9);
        let fresh = net.initial_state(1).unwrap();
        let reset_mask = Array1::ones(2);
        let (with_warm, _) = net
            .forward_recurrent(&encoded, &layout, &warm, &reset_mask)
            .unwrap();
        let (with_fresh, _) = net
            .forward_recurrent(&encoded, &layout, &fresh, &reset_mask)
            .unwrap();
        assert_eq!(with_warm, with_fresh);
    }

    #[test]
    fn plain_forward_on_recurrent_network_fails() {
        let net = MirrorLstmNetwork::new("pi", 2, 3, 1).unwrap();
        assert!(matches!(
            net.forward(&Array2::zeros((2, 2))),
            Err(MirrorRlError::UnsupportedConfiguration { .. })
        ));
    }

    #[test]
    fn unknown_builder_is_reported() {
        assert!(matches!(
            network_builder("transformer"),
            Err(MirrorRlError::UnknownNetwork { .. })
        ));
        assert!(network_builder("mlp").is_ok());
        assert!(network_builder("lstm").is_ok());
    }
}
