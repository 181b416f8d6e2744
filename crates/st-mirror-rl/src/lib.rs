// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Mirror-symmetry regularized policy/value estimation.
//!
//! Environments with left-right symmetry (locomotion being the classic case)
//! admit a cheap auxiliary training signal: a policy evaluated on an
//! observation and on its mirrored counterpart should produce consistent
//! action distributions and value estimates. This crate builds the twin
//! forward paths against one shared parameter store, fuses both branches
//! into a single combined batch for the distribution and value heads, and
//! exposes the per-row consistency penalties alongside the usual
//! action/value/neglogp rollout surface.

use std::fmt;

pub mod distributions;
pub mod io;
pub mod module;
pub mod networks;
pub mod policy;
pub mod spaces;
pub mod stats;
pub mod symmetry;

pub use distributions::{softmax_rows, Distribution, DistributionHead};
pub use io::{load_bincode, load_json, save_bincode, save_json};
pub use module::{Dense, ParamStore, Parameter};
pub use networks::{
    network_builder, register_network, FeatureNetwork, MirrorLstmNetwork, MlpNetwork,
    NetworkConfig, NetworkSpec, RecurrentBatch,
};
pub use policy::{
    build_mirror_policy, BranchRanges, Extras, MirrorPolicy, MirrorPolicyConfig,
    MirrorPolicyFactory, PolicyEvaluation, StepOutput, ValueEstimate, ValueNetworkSpec,
};
pub use spaces::{encode_observation, ActionSpace, EnvSpec, ObservationSpace};
pub use stats::RunningMeanStd;
pub use symmetry::{mirror_observation, register_symmetry_rule, symmetry_rule, SymmetryRule};

/// Result alias used throughout the crate.
pub type MirrorResult<T> = Result<T, MirrorRlError>;

/// Errors emitted while constructing or evaluating mirror policies.
///
/// Everything here is a fail-fast construction or feed error; nothing is
/// retried internally. Callers are expected to fix the configuration and
/// rebuild.
#[derive(Clone, Debug, PartialEq)]
pub enum MirrorRlError {
    /// The requested symmetry rule was never registered.
    UnknownSymmetryRule { rule: String },
    /// The requested network builder was never registered.
    UnknownNetwork { name: String },
    /// Recurrent layout arithmetic failed: the batch does not divide into
    /// steps, or the effective environment count collapsed to zero.
    InvalidBatchShape { nbatch: usize, nsteps: usize },
    /// Two tensors that must agree in shape do not.
    ShapeMismatch {
        left: (usize, usize),
        right: (usize, usize),
    },
    /// The requested estimation mode does not apply to the action space.
    IncompatibleActionSpace { operation: &'static str },
    /// A combination of builder options is not supported.
    UnsupportedConfiguration { reason: &'static str },
    /// A constructor received a degenerate shape.
    InvalidDimensions { rows: usize, cols: usize },
    /// Generic validation failure for rule or feed contents.
    InvalidValue { label: &'static str },
    /// An extra feed tensor was supplied under a name the policy never
    /// registered at construction time.
    UnknownFeed { name: String },
    /// A recurrent evaluation was given only part of its state/mask feed.
    MissingFeed { name: &'static str },
    /// State-dict restore referenced a parameter the store does not hold.
    MissingParameter { name: String },
    /// Wrapper around I/O failures when persisting or restoring checkpoints.
    IoError { message: String },
    /// Wrapper around serde failures when snapshotting parameters.
    SerializationError { message: String },
}

impl fmt::Display for MirrorRlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirrorRlError::UnknownSymmetryRule { rule } => {
                write!(f, "symmetry rule '{rule}' is not registered")
            }
            MirrorRlError::UnknownNetwork { name } => {
                write!(f, "network builder '{name}' is not registered")
            }
            MirrorRlError::InvalidBatchShape { nbatch, nsteps } => write!(
                f,
                "batch size {nbatch} does not yield a positive whole number of environments for {nsteps} steps"
            ),
            MirrorRlError::ShapeMismatch { left, right } => {
                write!(f, "shape mismatch: left={left:?}, right={right:?}")
            }
            MirrorRlError::IncompatibleActionSpace { operation } => {
                write!(f, "{operation} requires a discrete action space")
            }
            MirrorRlError::UnsupportedConfiguration { reason } => {
                write!(f, "unsupported configuration: {reason}")
            }
            MirrorRlError::InvalidDimensions { rows, cols } => {
                write!(f, "invalid dimensions ({rows} x {cols}); both axes must be non-zero")
            }
            MirrorRlError::InvalidValue { label } => write!(f, "invalid value: {label}"),
            MirrorRlError::UnknownFeed { name } => {
                write!(f, "extra feed '{name}' was not registered at construction")
            }
            MirrorRlError::MissingFeed { name } => {
                write!(f, "recurrent evaluation requires the '{name}' feed")
            }
            MirrorRlError::MissingParameter { name } => {
                write!(f, "parameter '{name}' missing from the state dict")
            }
            MirrorRlError::IoError { message } => write!(f, "io failure: {message}"),
            MirrorRlError::SerializationError { message } => {
                write!(f, "serialization failure: {message}")
            }
        }
    }
}

impl std::error::Error for MirrorRlError {}
