//! # ap-optimizer
//!
//! Search side of Autopolicy.
//!
//! [`PolicyCodec`] maps runtime configs to continuous search points and
//! back. [`OptimizerAdapter`] gives the Bayesian, particle swarm and
//! evolution strategy algorithms one ask/tell interface, with seeded RNGs
//! and per-suggestion overhead accounting.

mod adapter;
mod bayesian;
mod codec;
mod evolution;
mod population;
mod swarm;

pub use adapter::{
    build_adapter, AdapterDescription, AdapterState, OptimizerAdapter, OptimizerSettings,
    OverheadClock, SampleIndex, Suggestion,
};
pub use bayesian::{BayesianAdapter, BayesianSettings, UtilityKind};
pub use codec::{round_to_index, PolicyCodec};
pub use evolution::{EvolutionAdapter, EvolutionSettings};
pub use swarm::{SwarmAdapter, SwarmSettings};
