//! The ask/tell contract shared by every optimizer, plus adapter selection.

use ap_types::{ApResult, OptimizerError, SearchPoint};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::bayesian::{BayesianAdapter, BayesianSettings};
use crate::codec::PolicyCodec;
use crate::evolution::{EvolutionAdapter, EvolutionSettings};
use crate::swarm::{SwarmAdapter, SwarmSettings};

/// Position of a suggestion in the optimizer's own sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleIndex {
    pub generation: usize,
    pub individual: usize,
}

/// A point to evaluate next.
#[derive(Debug, Clone, PartialEq)]
pub struct Suggestion {
    pub point: SearchPoint,
    pub sample: SampleIndex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdapterState {
    Ready,
    /// The algorithm reported convergence; no further suggestions.
    Exhausted,
}

/// Human-readable summary of an adapter, used for logs and file names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterDescription {
    pub method: String,
    pub seed: u64,
    pub hyperparameters: BTreeMap<String, f64>,
    pub generation: usize,
}

/// Uniform ask/tell interface over the search algorithms.
///
/// Scores are always minimized. Every adapter owns its RNG, so two adapters
/// built from the same settings and seed and fed the same `register`
/// sequence produce the same suggestions.
pub trait OptimizerAdapter: Send {
    /// Next point to evaluate.
    fn suggest(&mut self) -> ApResult<Suggestion>;

    /// Report the observed score for a previously suggested point.
    fn register(&mut self, point: &SearchPoint, score: f64) -> ApResult<()>;

    fn describe(&self) -> AdapterDescription;

    fn state(&self) -> AdapterState;

    /// Optimizer time accumulated since the last call, in seconds.
    fn take_overhead(&mut self) -> f64;
}

/// Accumulates time spent inside an adapter.
#[derive(Debug, Clone, Default)]
pub struct OverheadClock {
    pending: Duration,
}

impl OverheadClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn charge(&mut self, elapsed: Duration) {
        self.pending += elapsed;
    }

    pub fn charge_since(&mut self, started: Instant) {
        self.charge(started.elapsed());
    }

    pub fn pending(&self) -> Duration {
        self.pending
    }

    /// Return the accumulated seconds and reset.
    pub fn take(&mut self) -> f64 {
        std::mem::take(&mut self.pending).as_secs_f64()
    }
}

/// Which optimizer to run and with what hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum OptimizerSettings {
    Bayesian(BayesianSettings),
    Swarm(SwarmSettings),
    Evolution(EvolutionSettings),
}

impl OptimizerSettings {
    pub fn method(&self) -> &'static str {
        match self {
            Self::Bayesian(_) => "bayesian",
            Self::Swarm(_) => "swarm",
            Self::Evolution(_) => "evolution",
        }
    }

    /// Short tag used in ledger file names, e.g. `bo-ucb`.
    pub fn tag(&self) -> String {
        match self {
            Self::Bayesian(s) => format!("bo-{}", s.utility.as_str()),
            Self::Swarm(_) => "pso".to_string(),
            Self::Evolution(_) => "es".to_string(),
        }
    }
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self::Bayesian(BayesianSettings::default())
    }
}

/// Construct the adapter selected by `settings`.
pub fn build_adapter(
    settings: &OptimizerSettings,
    codec: &PolicyCodec,
    seed: u64,
) -> ApResult<Box<dyn OptimizerAdapter>> {
    if codec.dim() == 0 {
        return Err(OptimizerError::InvalidSettings {
            message: "knob space is empty".to_string(),
        }
        .into());
    }
    let bounds = codec.bounds();
    let adapter: Box<dyn OptimizerAdapter> = match settings {
        OptimizerSettings::Bayesian(s) => Box::new(BayesianAdapter::new(s.clone(), bounds, seed)?),
        OptimizerSettings::Swarm(s) => Box::new(SwarmAdapter::new(s.clone(), bounds, seed)?),
        OptimizerSettings::Evolution(s) => {
            Box::new(EvolutionAdapter::new(s.clone(), bounds, seed)?)
        }
    };
    tracing::debug!("Built {} adapter with seed {}", settings.method(), seed);
    Ok(adapter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ap_types::KnobSpace;

    fn codec() -> PolicyCodec {
        PolicyCodec::new(KnobSpace::openmp(&[10, 20, 40], &["r.cc@1", "r.cc@2"], 6).unwrap())
    }

    #[test]
    fn overhead_clock_resets_on_take() {
        let mut clock = OverheadClock::new();
        clock.charge(Duration::from_millis(250));
        clock.charge(Duration::from_millis(250));
        assert!((clock.take() - 0.5).abs() < 1e-9);
        assert_eq!(clock.take(), 0.0);
    }

    #[test]
    fn settings_select_by_method_tag() {
        let json = r#"{"method": "swarm", "population": 6, "w": 0.7}"#;
        let settings: OptimizerSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.method(), "swarm");
        match &settings {
            OptimizerSettings::Swarm(s) => {
                assert_eq!(s.population, 6);
                assert_eq!(s.w, 0.7);
                assert_eq!(s.c1, SwarmSettings::default().c1);
            }
            other => panic!("unexpected settings: {other:?}"),
        }
    }

    #[test]
    fn every_method_builds_and_suggests_in_bounds() {
        let codec = codec();
        let bounds = codec.bounds();
        for settings in [
            OptimizerSettings::Bayesian(BayesianSettings::default()),
            OptimizerSettings::Swarm(SwarmSettings::default()),
            OptimizerSettings::Evolution(EvolutionSettings::default()),
        ] {
            let mut adapter = build_adapter(&settings, &codec, 1337).unwrap();
            assert_eq!(adapter.state(), AdapterState::Ready);
            let suggestion = adapter.suggest().unwrap();
            assert_eq!(suggestion.point.dim(), codec.dim());
            for (x, (lo, hi)) in suggestion.point.coords().iter().zip(&bounds) {
                assert!(*x >= *lo && *x <= *hi, "{} out of [{lo}, {hi}]", x);
            }
            adapter.register(&suggestion.point, 3.0).unwrap();
            assert_eq!(adapter.describe().method, settings.method());
        }
    }

    #[test]
    fn tags_are_distinct() {
        let bo = OptimizerSettings::default().tag();
        let pso = OptimizerSettings::Swarm(SwarmSettings::default()).tag();
        let es = OptimizerSettings::Evolution(EvolutionSettings::default()).tag();
        assert_eq!(bo, "bo-ucb");
        assert_ne!(pso, es);
    }
}
