// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Mirror policy builder and the policy/value object it produces.
//!
//! The builder wires two forward paths through one parameter store: the
//! original observation and its mirrored counterpart. Both branches are
//! fused into a combined `[2*batch]` block for the distribution and value
//! heads, split back per branch, and compared to produce the mirror
//! consistency losses. Actions are only ever sampled from the original
//! branch.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ops::Range;
use std::path::Path;
use std::sync::{Arc, RwLock};

use ndarray::{concatenate, s, Array1, Array2, ArrayD, Axis, Ix1, Ix2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use crate::distributions::{softmax_rows, DistributionHead};
use crate::module::{Dense, ParamStore, Parameter};
use crate::networks::{
    network_builder, FeatureNetwork, NetworkConfig, NetworkSpec, RecurrentBatch,
};
use crate::spaces::{encode_observation, ActionSpace, EnvSpec};
use crate::stats::RunningMeanStd;
use crate::symmetry::{default_obs_axis, mirror_observation, symmetry_rule, SymmetryRule};
use crate::{io, MirrorResult, MirrorRlError};

const VALUE_COPY_SEED_OFFSET: u64 = 0x9e37_79b9_7f4a_7c15;

/// Source of the value-function latent.
pub enum ValueNetworkSpec {
    /// Value head reads the policy latent (default).
    Shared,
    /// Fresh copy of the registered policy architecture with its own
    /// parameters under the `vf` scope.
    Copy,
    /// Caller-supplied feature network.
    Custom(Box<dyn FeatureNetwork>),
}

/// Builder options beyond the environment and network choice.
pub struct MirrorPolicyConfig {
    pub value_network: ValueNetworkSpec,
    pub normalize_observations: bool,
    pub estimate_q: bool,
    /// Registered symmetry rule id; `None` selects the identity rule over
    /// the default flip axis.
    pub symmetry_rule: Option<String>,
    pub seed: u64,
    /// Initialization scale for the distribution head.
    pub init_scale: f32,
}

impl Default for MirrorPolicyConfig {
    fn default() -> Self {
        Self {
            value_network: ValueNetworkSpec::Shared,
            normalize_observations: false,
            estimate_q: false,
            symmetry_rule: None,
            seed: 0,
            init_scale: 0.01,
        }
    }
}

/// Scalar value head, or a per-discrete-action Q head.
#[derive(Clone, Debug)]
enum ValueHead {
    Scalar(Dense),
    Q(Dense),
}

impl ValueHead {
    fn forward(&self, latent: &Array2<f32>) -> MirrorResult<Array2<f32>> {
        match self {
            ValueHead::Scalar(head) | ValueHead::Q(head) => head.forward(latent),
        }
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> MirrorResult<()>,
    ) -> MirrorResult<()> {
        match self {
            ValueHead::Scalar(head) | ValueHead::Q(head) => head.visit_parameters(visitor),
        }
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> MirrorResult<()>,
    ) -> MirrorResult<()> {
        match self {
            ValueHead::Scalar(head) | ValueHead::Q(head) => head.visit_parameters_mut(visitor),
        }
    }
}

/// Shared parameter store behind every policy a factory produces.
struct PolicyCore {
    policy_network: Box<dyn FeatureNetwork>,
    value_network: Option<Box<dyn FeatureNetwork>>,
    pd_head: DistributionHead,
    value_head: ValueHead,
    rms: Option<RunningMeanStd>,
}

impl PolicyCore {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> MirrorResult<()>,
    ) -> MirrorResult<()> {
        self.policy_network.visit_parameters(visitor)?;
        if let Some(network) = &self.value_network {
            network.visit_parameters(visitor)?;
        }
        self.pd_head.visit_parameters(visitor)?;
        self.value_head.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> MirrorResult<()>,
    ) -> MirrorResult<()> {
        self.policy_network.visit_parameters_mut(visitor)?;
        if let Some(network) = &mut self.value_network {
            network.visit_parameters_mut(visitor)?;
        }
        self.pd_head.visit_parameters_mut(visitor)?;
        self.value_head.visit_parameters_mut(visitor)
    }

    fn state_dict(&self) -> MirrorResult<HashMap<String, Array2<f32>>> {
        let mut state = HashMap::new();
        self.visit_parameters(&mut |parameter| {
            state.insert(parameter.name().to_string(), parameter.value().clone());
            Ok(())
        })?;
        if let Some(rms) = &self.rms {
            state.insert(
                "rms::mean".to_string(),
                rms.mean().clone().insert_axis(Axis(0)),
            );
            state.insert(
                "rms::var".to_string(),
                rms.var().clone().insert_axis(Axis(0)),
            );
            state.insert(
                "rms::count".to_string(),
                Array2::from_elem((1, 1), rms.count() as f32),
            );
        }
        Ok(state)
    }

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
        })?;
        if let Some(rms) = &mut self.rms {
            let mean = state
                .get("rms::mean")
                .ok_or_else(|| MirrorRlError::MissingParameter {
                    name: "rms::mean".to_string(),
                })?;
            let var = state
                .get("rms::var")
                .ok_or_else(|| MirrorRlError::MissingParameter {
                    name: "rms::var".to_string(),
                })?;
            let count = state
                .get("rms::count")
                .ok_or_else(|| MirrorRlError::MissingParameter {
                    name: "rms::count".to_string(),
                })?;
            rms.restore(
                mean.row(0).to_owned(),
                var.row(0).to_owned(),
                count[[0, 0]] as f64,
            )?;
        }
        Ok(())
    }
}

/// Builds the shared policy core and returns a factory that stamps out
/// policies for different batch shapes against the same parameters.
pub fn build_mirror_policy(
    env: &EnvSpec,
    network: NetworkSpec,
    config: MirrorPolicyConfig,
) -> MirrorResult<MirrorPolicyFactory> {
    let encoded_dim = env.observation_space.encoded_dim();

    let registered = match &network {
        NetworkSpec::Registered {
            name,
            num_layers,
            num_hidden,
        } => Some((name.clone(), *num_layers, *num_hidden)),
        NetworkSpec::Custom(_) => None,
    };

    let policy_network: Box<dyn FeatureNetwork> = match network {
        NetworkSpec::Registered {
            name,
            num_layers,
            num_hidden,
        } => {
            let builder = network_builder(&name)?;
            builder(&NetworkConfig {
                scope: "pi".to_string(),
                input_dim: encoded_dim,
                num_layers,
                num_hidden,
                seed: config.seed,
            })?
        }
        NetworkSpec::Custom(custom) => {
            if custom.input_dim() != encoded_dim {
                return Err(MirrorRlError::ShapeMismatch {
                    left: (1, custom.input_dim()),
                    right: (1, encoded_dim),
                });
            }
            custom
        }
    };

    let rule = match &config.symmetry_rule {
        Some(id) => symmetry_rule(id)?,
        None => SymmetryRule::identity(
            env.action_space.param_dim(),
            default_obs_axis(env.observation_space.sample_shape()),
        ),
    };
    if rule.param_dim() != env.action_space.param_dim() {
        return Err(MirrorRlError::InvalidValue {
            label: "symmetry permutation width does not match the action distribution",
        });
    }
    let batched_rank = 1 + env.observation_space.sample_shape().len();
    if rule.obs_axis() == 0 || rule.obs_axis() >= batched_rank {
        return Err(MirrorRlError::UnsupportedConfiguration {
            reason: "mirror axis falls outside the observation rank",
        });
    }

    let value_network: Option<Box<dyn FeatureNetwork>> = match config.value_network {
        ValueNetworkSpec::Shared => None,
        ValueNetworkSpec::Copy => {
            if policy_network.is_recurrent() {
                return Err(MirrorRlError::UnsupportedConfiguration {
                    reason: "copied value networks do not support recurrent policies",
                });
            }
            let (name, num_layers, num_hidden) =
                registered.ok_or(MirrorRlError::UnsupportedConfiguration {
                    reason: "value network copy requires a registered policy network",
                })?;
            let builder = network_builder(&name)?;
            Some(builder(&NetworkConfig {
                scope: "vf".to_string(),
                input_dim: encoded_dim,
                num_layers,
                num_hidden,
                seed: config.seed.wrapping_add(VALUE_COPY_SEED_OFFSET),
            })?)
        }
        ValueNetworkSpec::Custom(custom) => {
            if custom.is_recurrent() {
                return Err(MirrorRlError::UnsupportedConfiguration {
                    reason: "recurrent value networks are not supported",
                });
            }
            if custom.input_dim() != encoded_dim {
                return Err(MirrorRlError::ShapeMismatch {
                    left: (1, custom.input_dim()),
                    right: (1, encoded_dim),
                });
            }
            Some(custom)
        }
    };

    let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(1));
    let pd_head = DistributionHead::from_action_space(
        &env.action_space,
        policy_network.feature_dim(),
        config.init_scale,
        &mut rng,
    )?;
    let vf_feature_dim = value_network
        .as_ref()
        .map(|network| network.feature_dim())
        .unwrap_or_else(|| policy_network.feature_dim());
    let value_head = if config.estimate_q {
        match env.action_space {
            ActionSpace::Discrete { n } => {
                ValueHead::Q(Dense::new("q", vf_feature_dim, n, 1.0, &mut rng)?)
            }
            ActionSpace::Continuous { .. } => {
                return Err(MirrorRlError::IncompatibleActionSpace {
                    operation: "q estimation",
                })
            }
        }
    } else {
        ValueHead::Scalar(Dense::new("vf", vf_feature_dim, 1, 1.0, &mut rng)?)
    };

    let rms = if config.normalize_observations && env.observation_space.is_continuous() {
        Some(RunningMeanStd::new(encoded_dim)?)
    } else {
        None
    };

    debug!(
        env = %env.id,
        feature_dim = policy_network.feature_dim(),
        recurrent = policy_network.is_recurrent(),
        normalized = rms.is_some(),
        "built mirror policy core"
    );

    Ok(MirrorPolicyFactory {
        env: env.clone(),
        rule,
        core: Arc::new(RwLock::new(PolicyCore {
            policy_network,
            value_network,
            pd_head,
            value_head,
            rms,
        })),
        seed: config.seed,
    })
}

/// Stamps out policies over one shared parameter store, so an acting policy
/// (`nbatch = nenv, nsteps = 1`) and a training policy
/// (`nbatch = nenv * nsteps`) always read identical weights.
pub struct MirrorPolicyFactory {
    env: EnvSpec,
    rule: SymmetryRule,
    core: Arc<RwLock<PolicyCore>>,
    seed: u64,
}

impl MirrorPolicyFactory {
    /// Builds a policy for one batch shape. `nsteps` only matters for
    /// recurrent networks, where the batch must divide into a positive
    /// number of environments; stateless policies accept any batch at
    /// evaluation time.
    pub fn policy(&self, nbatch: usize, nsteps: usize) -> MirrorResult<MirrorPolicy> {
        let recurrent = self
            .core
            .read()
            .expect("policy parameter store poisoned")
            .policy_network
            .is_recurrent();
        if nbatch == 0 {
            return Err(MirrorRlError::InvalidBatchShape { nbatch, nsteps });
        }
        let layout = if recurrent {
            let layout = RecurrentBatch::resolve(nbatch, nsteps)?;
            debug!(nenv = layout.nenv, nsteps = layout.nsteps, "recurrent mirror policy layout");
            Some(layout)
        } else {
            None
        };
        let extra_names: &'static [&'static str] = if recurrent {
            &["state", "mask"]
        } else {
            &[]
        };
        Ok(MirrorPolicy {
            env: self.env.clone(),
            rule: self.rule.clone(),
            core: Arc::clone(&self.core),
            layout,
            extra_names,
            rng: RefCell::new(StdRng::seed_from_u64(
                self.seed.wrapping_add(nbatch as u64),
            )),
        })
    }
}

/// Explicit row ranges of the two virtual branches inside a combined batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BranchRanges {
    pub original: Range<usize>,
    pub mirrored: Range<usize>,
}

impl BranchRanges {
    /// Derives the ranges from a combined row count, which must split into
    /// two equal halves.
    pub fn from_combined(rows: usize) -> MirrorResult<Self> {
        if rows == 0 || rows % 2 != 0 {
            return Err(MirrorRlError::ShapeMismatch {
                left: (rows, 1),
                right: (rows / 2 * 2, 1),
            });
        }
        Ok(Self {
            original: 0..rows / 2,
            mirrored: rows / 2..rows,
        })
    }

    /// Rows contributed by each branch.
    pub fn batch(&self) -> usize {
        self.original.len()
    }

    /// Splits a combined-batch matrix into its branch halves.
    pub fn split(&self, combined: &Array2<f32>) -> MirrorResult<(Array2<f32>, Array2<f32>)> {
        if combined.nrows() != self.mirrored.end {
            return Err(MirrorRlError::ShapeMismatch {
                left: combined.dim(),
                right: (self.mirrored.end, combined.ncols()),
            });
        }
        let original = combined
            .slice(s![self.original.start..self.original.end, ..])
            .to_owned();
        let mirrored = combined
            .slice(s![self.mirrored.start..self.mirrored.end, ..])
            .to_owned();
        Ok((original, mirrored))
    }
}

/// Named auxiliary feed tensors for an evaluation (recurrent state, mask).
#[derive(Clone, Debug, Default)]
pub struct Extras {
    entries: HashMap<String, ArrayD<f32>>,
}

impl Extras {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: ArrayD<f32>) {
        self.entries.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.entries.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|key| key.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Value output: one scalar per row, or one row of per-action Q values.
#[derive(Clone, Debug, PartialEq)]
pub enum ValueEstimate {
    Scalar(Array1<f32>),
    PerAction(Array2<f32>),
}

impl ValueEstimate {
    pub fn batch(&self) -> usize {
        match self {
            ValueEstimate::Scalar(values) => values.len(),
            ValueEstimate::PerAction(values) => values.nrows(),
        }
    }

    pub fn as_scalar(&self) -> MirrorResult<&Array1<f32>> {
        match self {
            ValueEstimate::Scalar(values) => Ok(values),
            ValueEstimate::PerAction(_) => Err(MirrorRlError::UnsupportedConfiguration {
                reason: "per-action value estimate has no scalar form",
            }),
        }
    }
}

/// Full result of one combined-batch forward pass.
#[derive(Clone, Debug)]
pub struct PolicyEvaluation {
    /// One action per original-branch row.
    pub actions: Array2<f32>,
    /// Original-branch value estimate.
    pub values: ValueEstimate,
    /// Next recurrent state of the original branch; `None` when stateless.
    pub next_state: Option<Array2<f32>>,
    /// Negative log-probability of `actions` under the original branch.
    pub neglogps: Array1<f32>,
    /// Per-row squared softmax gap between the branches' action parameters.
    pub policy_mirrorloss: Array1<f32>,
    /// Per-row squared gap between the branches' value estimates.
    pub value_mirrorloss: Array1<f32>,
    /// Row ranges of the combined batch the heads ran over.
    pub branches: BranchRanges,
}

/// Rollout-facing subset of an evaluation.
#[derive(Clone, Debug)]
pub struct StepOutput {
    pub actions: Array2<f32>,
    pub values: ValueEstimate,
    pub next_state: Option<Array2<f32>>,
    pub neglogps: Array1<f32>,
}

/// Policy/value object with twin mirror branches over shared parameters.
pub struct MirrorPolicy {
    env: EnvSpec,
    rule: SymmetryRule,
    core: Arc<RwLock<PolicyCore>>,
    layout: Option<RecurrentBatch>,
    extra_names: &'static [&'static str],
    rng: RefCell<StdRng>,
}

impl MirrorPolicy {
    pub fn is_recurrent(&self) -> bool {
        self.layout.is_some()
    }

    /// Zero recurrent state sized for this policy's environment count, or
    /// `None` for stateless networks.
    pub fn initial_state(&self) -> Option<Array2<f32>> {
        let layout = self.layout.as_ref()?;
        self.core
            .read()
            .expect("policy parameter store poisoned")
            .policy_network
            .initial_state(layout.nenv)
    }

    /// Runs the full twin-branch forward pass and returns every output the
    /// training objective needs, mirror losses included.
    pub fn evaluate(
        &self,
        observation: &ArrayD<f32>,
        extras: &Extras,
    ) -> MirrorResult<PolicyEvaluation> {
        for name in extras.names() {
            if !self.extra_names.contains(&name) {
                return Err(MirrorRlError::UnknownFeed {
                    name: name.to_string(),
                });
            }
        }
        let batch = observation.shape().first().copied().unwrap_or(0);
        if batch == 0 {
            return Err(MirrorRlError::InvalidDimensions { rows: 0, cols: 0 });
        }
        if let Some(layout) = &self.layout {
            if batch != layout.nbatch() {
                return Err(MirrorRlError::ShapeMismatch {
                    left: (batch, 1),
                    right: (layout.nbatch(), 1),
                });
            }
        }

        let core = self.core.read().expect("policy parameter store poisoned");

        let mirrored = mirror_observation(observation, self.rule.obs_axis())?;
        let mut encoded = encode_observation(&self.env.observation_space, observation)?;
        let mut encoded_mirror = encode_observation(&self.env.observation_space, &mirrored)?;
        if let Some(rms) = &core.rms {
            encoded = rms.normalize_clip(&encoded)?;
            encoded_mirror = rms.normalize_clip(&encoded_mirror)?;
        }

        let (latent, latent_mirror, next_state) = if let Some(layout) = &self.layout {
            let state = match extras.get("state") {
                Some(state) => state
                    .clone()
                    .into_dimensionality::<Ix2>()
                    .map_err(|_| MirrorRlError::InvalidValue {
                        label: "state feed must be rank 2",
                    })?,
                None => {
                    if extras.get("mask").is_some() {
                        return Err(MirrorRlError::MissingFeed { name: "state" });
                    }
                    core.policy_network.initial_state(layout.nenv).ok_or(
                        MirrorRlError::InvalidValue {
                            label: "recurrent network provided no initial state",
                        },
                    )?
                }
            };
            let expected_state = (layout.nenv, core.policy_network.state_dim());
            if state.dim() != expected_state {
                return Err(MirrorRlError::ShapeMismatch {
                    left: state.dim(),
                    right: expected_state,
                });
            }
            let mask = match extras.get("mask") {
                Some(mask) => mask
                    .clone()
                    .into_dimensionality::<Ix1>()
                    .map_err(|_| MirrorRlError::InvalidValue {
                        label: "mask feed must be rank 1",
                    })?,
                None => {
                    if extras.get("state").is_some() {
                        return Err(MirrorRlError::MissingFeed { name: "mask" });
                    }
                    Array1::zeros(batch)
                }
            };
            let (latent, next_state) =
                core.policy_network
                    .forward_recurrent(&encoded, layout, &state, &mask)?;
            // The mirrored branch runs with the same entry state; its next
            // state is discarded (only the original branch drives rollouts).
            let (latent_mirror, _) =
                core.policy_network
                    .forward_recurrent(&encoded_mirror, layout, &state, &mask)?;
            (latent, latent_mirror, Some(next_state))
        } else {
            (
                core.policy_network.forward(&encoded)?,
                core.policy_network.forward(&encoded_mirror)?,
                None,
            )
        };

        let (vf_latent, vf_latent_mirror) = match &core.value_network {
            Some(network) => (
                network.forward(&encoded)?,
                network.forward(&encoded_mirror)?,
            ),
            None => (latent.clone(), latent_mirror.clone()),
        };

        let combined = concatenate(Axis(0), &[latent.view(), latent_mirror.view()]).map_err(
            |_| MirrorRlError::ShapeMismatch {
                left: latent.dim(),
                right: latent_mirror.dim(),
            },
        )?;
        let combined_vf = concatenate(Axis(0), &[vf_latent.view(), vf_latent_mirror.view()])
            .map_err(|_| MirrorRlError::ShapeMismatch {
                left: vf_latent.dim(),
                right: vf_latent_mirror.dim(),
            })?;
        let branches = BranchRanges::from_combined(combined.nrows())?;
        if branches.batch() != batch {
            return Err(MirrorRlError::ShapeMismatch {
                left: (branches.batch(), 1),
                right: (batch, 1),
            });
        }

        let params_all = core.pd_head.params(&combined)?;
        let (pi, pi_mirror) = branches.split(&params_all)?;
        let pi_mirror = self.rule.mirror_modify(&pi_mirror)?;
        let policy_mirrorloss =
            row_mean_sq_diff(&softmax_rows(&pi), &softmax_rows(&pi_mirror));

        let vf_all = core.value_head.forward(&combined_vf)?;
        let (vf, vf_mirror) = branches.split(&vf_all)?;
        let (values, value_mirrorloss) = match &core.value_head {
            ValueHead::Scalar(_) => {
                let values = vf.column(0).to_owned();
                let mirrored_values = vf_mirror.column(0).to_owned();
                let loss = (&values - &mirrored_values).mapv(|delta| delta * delta);
                (ValueEstimate::Scalar(values), loss)
            }
            ValueHead::Q(_) => {
                let loss = row_mean_sq_diff(&vf, &vf_mirror);
                (ValueEstimate::PerAction(vf), loss)
            }
        };

        let distribution = core.pd_head.distribution(pi)?;
        let actions = distribution.sample(&mut self.rng.borrow_mut());
        let neglogps = distribution.neglogp(&actions)?;

        Ok(PolicyEvaluation {
            actions,
            values,
            next_state,
            neglogps,
            policy_mirrorloss,
            value_mirrorloss,
            branches,
        })
    }

    /// Computes next actions for a rollout step.
    pub fn step(&self, observation: &ArrayD<f32>, extras: &Extras) -> MirrorResult<StepOutput> {
        let evaluation = self.evaluate(observation, extras)?;
        Ok(StepOutput {
            actions: evaluation.actions,
            values: evaluation.values,
            next_state: evaluation.next_state,
            neglogps: evaluation.neglogps,
        })
    }

    /// Computes the original-branch value estimate only.
    pub fn values(
        &self,
        observation: &ArrayD<f32>,
        extras: &Extras,
    ) -> MirrorResult<ValueEstimate> {
        Ok(self.evaluate(observation, extras)?.values)
    }

    /// Folds a batch of raw observations into the shared normalization
    /// statistics. Fails when normalization was not requested at build time.
    pub fn update_observation_stats(&self, observation: &ArrayD<f32>) -> MirrorResult<()> {
        let mut core = self.core.write().expect("policy parameter store poisoned");
        let rows = encode_observation(&self.env.observation_space, observation)?;
        match &mut core.rms {
            Some(rms) => rms.update(&rows),
            None => Err(MirrorRlError::UnsupportedConfiguration {
                reason: "observation normalization is disabled for this policy",
            }),
        }
    }

    /// Snapshot of every parameter (and normalization state) by name.
    pub fn state_dict(&self) -> MirrorResult<HashMap<String, Array2<f32>>> {
        self.core
            .read()
            .expect("policy parameter store poisoned")
            .state_dict()
    }

    /// Restores a snapshot into the shared store; every policy from the same
    /// factory observes the new values.
    pub fn load_state_dict(&self, state: &HashMap<String, Array2<f32>>) -> MirrorResult<()> {
        self.core
            .write()
            .expect("policy parameter store poisoned")
            .load_state_dict(state)
    }

    /// Persists the parameter snapshot to disk.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> MirrorResult<()> {
        io::save_bincode(&self.state_dict()?, path)
    }

    /// Restores a snapshot persisted by [`MirrorPolicy::save`].
    pub fn load<P: AsRef<Path>>(&self, path: P) -> MirrorResult<()> {
        let state = io::load_bincode(path)?;
        self.load_state_dict(&state)
    }
}

fn row_mean_sq_diff(left: &Array2<f32>, right: &Array2<f32>) -> Array1<f32> {
    let cols = left.ncols().max(1) as f32;
    let mut out = Array1::zeros(left.nrows());
    for (row, (a, b)) in left.rows().into_iter().zip(right.rows()).enumerate() {
        let mut acc = 0.0f32;
        for (x, y) in a.iter().zip(b.iter()) {
            let delta = x - y;
            acc += delta * delta;
        }
        out[row] = acc / cols;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spaces::ObservationSpace;
    use ndarray::{ArrayD, IxDyn};

    fn continuous_env(obs_dim: usize, action_dim: usize) -> EnvSpec {
        EnvSpec::new(
            "test-env",
            ObservationSpace::Continuous {
                shape: vec![obs_dim],
            },
            ActionSpace::Continuous { dim: action_dim },
        )
    }

    fn discrete_env(obs_dim: usize, actions: usize) -> EnvSpec {
        EnvSpec::new(
            "test-env-discrete",
            ObservationSpace::Continuous {
                shape: vec![obs_dim],
            },
            ActionSpace::Discrete { n: actions },
        )
    }

    fn obs(batch: usize, dim: usize) -> ArrayD<f32> {
        ArrayD::from_shape_fn(IxDyn(&[batch, dim]), |idx| {
            (idx[0] * dim + idx[1]) as f32 * 0.1 - 0.5
        })
    }

    #[test]
    fn branch_ranges_split_evenly() {
        let ranges = BranchRanges::from_combined(16).unwrap();
        assert_eq!(ranges.original, 0..8);
        assert_eq!(ranges.mirrored, 8..16);
        assert_eq!(ranges.batch(), 8);
        assert!(matches!(
            BranchRanges::from_combined(7),
            Err(MirrorRlError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn branch_split_rejects_foreign_matrices() {
        let ranges = BranchRanges::from_combined(4).unwrap();
        let wrong = Array2::<f32>::zeros((6, 3));
        assert!(matches!(
            ranges.split(&wrong),
            Err(MirrorRlError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn combined_batch_is_twice_the_input_batch() {
        let env = continuous_env(4, 2);
        let factory = build_mirror_policy(
            &env,
            NetworkSpec::registered("mlp"),
            MirrorPolicyConfig::default(),
        )
        .unwrap();
        for batch in [1usize, 3, 8] {
            let policy = factory.policy(batch, 1).unwrap();
            let evaluation = policy.evaluate(&obs(batch, 4), &Extras::new()).unwrap();
            assert_eq!(evaluation.branches.original.len(), batch);
            assert_eq!(evaluation.branches.mirrored.len(), batch);
            assert_eq!(evaluation.branches.mirrored.end, 2 * batch);
        }
    }

    #[test]
    fn mirror_losses_are_non_negative() {
        let env = continuous_env(4, 2);
        let factory = build_mirror_policy(
            &env,
            NetworkSpec::registered("mlp"),
            MirrorPolicyConfig::default(),
        )
        .unwrap();
        let policy = factory.policy(6, 1).unwrap();
        let evaluation = policy.evaluate(&obs(6, 4), &Extras::new()).unwrap();
        assert!(evaluation.policy_mirrorloss.iter().all(|&l| l >= 0.0));
        assert!(evaluation.value_mirrorloss.iter().all(|&l| l >= 0.0));
    }

    #[test]
    fn symmetric_observations_yield_zero_mirror_loss() {
        // Palindromic rows are invariant under the feature-axis flip, and
        // the default rule is the identity permutation.
        let env = continuous_env(4, 2);
        let factory = build_mirror_policy(
            &env,
            NetworkSpec::registered("mlp"),
            MirrorPolicyConfig::default(),
        )
        .unwrap();
        let policy = factory.policy(3, 1).unwrap();
        let palindrome = ArrayD::from_shape_vec(
            IxDyn(&[3, 4]),
            vec![
                0.1, 0.7, 0.7, 0.1, //
                -0.3, 0.2, 0.2, -0.3, //
                1.0, 0.0, 0.0, 1.0,
            ],
        )
        .unwrap();
        let evaluation = policy.evaluate(&palindrome, &Extras::new()).unwrap();
        assert!(evaluation.policy_mirrorloss.iter().all(|&l| l == 0.0));
        assert!(evaluation.value_mirrorloss.iter().all(|&l| l == 0.0));
    }

    #[test]
    fn recurrent_batch_validation_fails_fast() {
        let env = continuous_env(4, 2);
        let factory = build_mirror_policy(
            &env,
            NetworkSpec::registered("lstm").with_layers(1, 8),
            MirrorPolicyConfig::default(),
        )
        .unwrap();
        assert!(matches!(
            factory.policy(10, 3),
            Err(MirrorRlError::InvalidBatchShape {
                nbatch: 10,
                nsteps: 3
            })
        ));
        assert!(matches!(
            factory.policy(5, 10),
            Err(MirrorRlError::InvalidBatchShape { .. })
        ));
        assert!(factory.policy(12, 3).is_ok());
    }

    #[test]
    fn q_estimation_requires_discrete_actions() {
        let env = continuous_env(4, 2);
        let config = MirrorPolicyConfig {
            estimate_q: true,
            ..MirrorPolicyConfig::default()
        };
        assert!(matches!(
            build_mirror_policy(&env, NetworkSpec::registered("mlp"), config),
            Err(MirrorRlError::IncompatibleActionSpace { .. })
        ));
    }

    #[test]
    fn q_estimation_emits_per_action_values() {
        let env = discrete_env(4, 3);
        let config = MirrorPolicyConfig {
            estimate_q: true,
            ..MirrorPolicyConfig::default()
        };
        let factory =
            build_mirror_policy(&env, NetworkSpec::registered("mlp"), config).unwrap();
        let policy = factory.policy(5, 1).unwrap();
        let evaluation = policy.evaluate(&obs(5, 4), &Extras::new()).unwrap();
        match &evaluation.values {
            ValueEstimate::PerAction(q) => assert_eq!(q.dim(), (5, 3)),
            ValueEstimate::Scalar(_) => panic!("expected per-action values"),
        }
        assert!(evaluation.values.as_scalar().is_err());
    }

    #[test]
    fn copied_value_network_rejects_recurrent_policies() {
        let env = continuous_env(4, 2);
        let config = MirrorPolicyConfig {
            value_network: ValueNetworkSpec::Copy,
            ..MirrorPolicyConfig::default()
        };
        assert!(matches!(
            build_mirror_policy(&env, NetworkSpec::registered("lstm").with_layers(1, 8), config),
            Err(MirrorRlError::UnsupportedConfiguration { .. })
        ));
    }

    #[test]
    fn unknown_symmetry_rule_fails_at_build() {
        let env = continuous_env(4, 2);
        let config = MirrorPolicyConfig {
            symmetry_rule: Some("never-registered-env".to_string()),
            ..MirrorPolicyConfig::default()
        };
        assert!(matches!(
            build_mirror_policy(&env, NetworkSpec::registered("mlp"), config),
            Err(MirrorRlError::UnknownSymmetryRule { .. })
        ));
    }

    #[test]
    fn unknown_extra_feed_is_rejected() {
        let env = continuous_env(4, 2);
        let factory = build_mirror_policy(
            &env,
            NetworkSpec::registered("mlp"),
            MirrorPolicyConfig::default(),
        )
        .unwrap();
        let policy = factory.policy(2, 1).unwrap();
        let mut extras = Extras::new();
        extras.insert("state", ArrayD::zeros(IxDyn(&[1, 16])));
        assert!(matches!(
            policy.evaluate(&obs(2, 4), &extras),
            Err(MirrorRlError::UnknownFeed { .. })
        ));
    }

    #[test]
    fn recurrent_policy_threads_state_and_reports_next_state() {
        let env = continuous_env(4, 2);
        let factory = build_mirror_policy(
            &env,
            NetworkSpec::registered("lstm").with_layers(1, 8),
            MirrorPolicyConfig::default(),
        )
        .unwrap();
        let policy = factory.policy(6, 3).unwrap();
        let mut extras = Extras::new();
        extras.insert(
            "state",
            policy.initial_state().unwrap().into_dyn(),
        );
        extras.insert("mask", ArrayD::zeros(IxDyn(&[6])));
        let evaluation = policy.evaluate(&obs(6, 4), &extras).unwrap();
        let next_state = evaluation.next_state.expect("recurrent next state");
        assert_eq!(next_state.dim(), (2, 16));
        assert_eq!(evaluation.actions.dim(), (6, 2));
    }

    #[test]
    fn recurrent_state_feed_width_is_validated() {
        let env = continuous_env(4, 2);
        let factory = build_mirror_policy(
            &env,
            NetworkSpec::registered("lstm").with_layers(1, 8),
            MirrorPolicyConfig::default(),
        )
        .unwrap();
        let policy = factory.policy(4, 2).unwrap();
        let mut extras = Extras::new();
        // nenv = 2 and state_dim = 16, so a 5-wide state row must fail.
        extras.insert("state", ArrayD::zeros(IxDyn(&[2, 5])));
        extras.insert("mask", ArrayD::zeros(IxDyn(&[4])));
        assert!(matches!(
            policy.evaluate(&obs(4, 4), &extras),
            Err(MirrorRlError::ShapeMismatch {
                left: (2, 5),
                right: (2, 16)
            })
        ));
    }

    #[test]
    fn extras_track_registered_contents() {
        let mut extras = Extras::new();
        assert!(extras.is_empty());
        extras.insert("state", ArrayD::zeros(IxDyn(&[1, 4])));
        assert!(!extras.is_empty());
        assert!(extras.get("state").is_some());
        assert!(extras.get("mask").is_none());
        assert_eq!(extras.names().collect::<Vec<_>>(), vec!["state"]);
    }

    #[test]
    fn half_supplied_recurrent_feed_is_rejected() {
        let env = continuous_env(4, 2);
        let factory = build_mirror_policy(
            &env,
            NetworkSpec::registered("lstm").with_layers(1, 8),
            MirrorPolicyConfig::default(),
        )
        .unwrap();
        let policy = factory.policy(4, 2).unwrap();
        let mut extras = Extras::new();
        extras.insert("mask", ArrayD::zeros(IxDyn(&[4])));
        assert!(matches!(
            policy.evaluate(&obs(4, 4), &extras),
            Err(MirrorRlError::MissingFeed { name: "state" })
        ));
    }

    #[test]
    fn factory_policies_share_parameters() {
        let env = continuous_env(4, 2);
        let factory = build_mirror_policy(
            &env,
            NetworkSpec::registered("mlp"),
            MirrorPolicyConfig::default(),
        )
        .unwrap();
        let acting = factory.policy(1, 1).unwrap();
        let training = factory.policy(8, 1).unwrap();
        assert_eq!(
            acting.state_dict().unwrap(),
            training.state_dict().unwrap()
        );

        // Zeroing through one policy is visible through the other.
        let mut state = acting.state_dict().unwrap();
        for tensor in state.values_mut() {
            tensor.fill(0.0);
        }
        acting.load_state_dict(&state).unwrap();
        assert_eq!(training.state_dict().unwrap(), state);
    }

    #[test]
    fn normalization_statistics_are_shared_and_persisted() {
        let env = continuous_env(4, 2);
        let config = MirrorPolicyConfig {
            normalize_observations: true,
            ..MirrorPolicyConfig::default()
        };
        let factory =
            build_mirror_policy(&env, NetworkSpec::registered("mlp"), config).unwrap();
        let policy = factory.policy(4, 1).unwrap();
        policy.update_observation_stats(&obs(4, 4)).unwrap();
        let state = policy.state_dict().unwrap();
        assert!(state.contains_key("rms::mean"));
        assert!(state.contains_key("rms::var"));
        assert!(state.contains_key("rms::count"));
        policy.load_state_dict(&state).unwrap();
    }
}
