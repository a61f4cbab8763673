//! Evolution strategy adapter with weighted recombination and cumulative
//! step-size adaptation.
//!
//! The search runs in bound-normalized space `[0, 1]^n`; candidates are
//! clipped into the box before they are handed out, while the update uses
//! the unclipped steps.

use ap_types::{ApResult, OptimizerError, SearchPoint};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use crate::adapter::{
    AdapterDescription, AdapterState, OptimizerAdapter, OverheadClock, Suggestion,
};
use crate::population::Generation;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionSettings {
    /// Offspring per generation; `None` picks `4 + floor(3 ln n)`.
    pub population: Option<usize>,
    /// Initial step size as a fraction of each knob's range.
    pub sigma: f64,
    /// Initial mean in knob coordinates; `None` starts at the box center.
    pub initial_mean: Option<Vec<f64>>,
    pub max_generations: usize,
    /// Stop when recent best scores and the current generation both vary
    /// less than this.
    pub tol_fun: f64,
    /// Stop when the step size falls below this.
    pub tol_x: f64,
}

impl Default for EvolutionSettings {
    fn default() -> Self {
        Self {
            population: None,
            sigma: 0.3,
            initial_mean: None,
            max_generations: 100,
            tol_fun: 1e-11,
            tol_x: 1e-11,
        }
    }
}

#[derive(Debug)]
struct Strategy {
    lambda: usize,
    weights: Vec<f64>,
    mu_eff: f64,
    c_sigma: f64,
    d_sigma: f64,
    chi_n: f64,
}

impl Strategy {
    fn new(n: usize, lambda: usize) -> Self {
        let mu = (lambda / 2).max(1);
        let raw: Vec<f64> = (1..=mu)
            .map(|i| (mu as f64 + 0.5).ln() - (i as f64).ln())
            .collect();
        let total: f64 = raw.iter().sum();
        let weights: Vec<f64> = raw.iter().map(|w| w / total).collect();
        let mu_eff = 1.0 / weights.iter().map(|w| w * w).sum::<f64>();

        let n_f = n as f64;
        let c_sigma = (mu_eff + 2.0) / (n_f + mu_eff + 5.0);
        let d_sigma =
            1.0 + 2.0 * (((mu_eff - 1.0) / (n_f + 1.0)).sqrt() - 1.0).max(0.0) + c_sigma;
        let chi_n = n_f.sqrt() * (1.0 - 1.0 / (4.0 * n_f) + 1.0 / (21.0 * n_f * n_f));

        Self {
            lambda,
            weights,
            mu_eff,
            c_sigma,
            d_sigma,
            chi_n,
        }
    }
}

#[derive(Debug)]
pub struct EvolutionAdapter {
    settings: EvolutionSettings,
    bounds: Vec<(f64, f64)>,
    seed: u64,
    rng: ChaCha8Rng,
    strategy: Strategy,
    mean: Vec<f64>,
    sigma: f64,
    path: Vec<f64>,
    /// Unclipped standard-normal steps of the current generation.
    steps: Vec<Vec<f64>>,
    current: Option<Generation>,
    generations: usize,
    best_history: VecDeque<f64>,
    state: AdapterState,
    stop_reason: Option<String>,
    carry: Duration,
    clock: OverheadClock,
}

impl EvolutionAdapter {
    pub fn new(settings: EvolutionSettings, bounds: Vec<(f64, f64)>, seed: u64) -> ApResult<Self> {
        let n = bounds.len();
        let lambda = settings
            .population
            .unwrap_or_else(|| 4 + (3.0 * (n.max(1) as f64).ln()).floor() as usize);
        if lambda < 2 {
            return Err(OptimizerError::InvalidSettings {
                message: format!("evolution population must be at least 2, got {lambda}"),
            }
            .into());
        }
        if settings.sigma.is_nan() || settings.sigma <= 0.0 {
            return Err(OptimizerError::InvalidSettings {
                message: format!("sigma must be positive, got {}", settings.sigma),
            }
            .into());
        }

        let mean = match &settings.initial_mean {
            Some(x0) if x0.len() != n => {
                return Err(OptimizerError::InvalidSettings {
                    message: format!("initial mean has {} dims, expected {n}", x0.len()),
                }
                .into())
            }
            Some(x0) => x0
                .iter()
                .zip(&bounds)
                .map(|(x, (lo, hi))| normalize(*x, *lo, *hi))
                .collect(),
            None => vec![0.5; n],
        };

        Ok(Self {
            sigma: settings.sigma,
            strategy: Strategy::new(n, lambda),
            rng: ChaCha8Rng::seed_from_u64(seed),
            path: vec![0.0; n],
            mean,
            settings,
            bounds,
            seed,
            steps: Vec::new(),
            current: None,
            generations: 0,
            best_history: VecDeque::new(),
            state: AdapterState::Ready,
            stop_reason: None,
            carry: Duration::ZERO,
            clock: OverheadClock::new(),
        })
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    pub fn stop_reason(&self) -> Option<&str> {
        self.stop_reason.as_deref()
    }

    fn history_window(&self) -> usize {
        let n = self.bounds.len() as f64;
        10 + (30.0 * n / self.strategy.lambda as f64).ceil() as usize
    }

    fn start_generation(&mut self) -> Generation {
        let started = Instant::now();
        let n = self.bounds.len();
        self.steps = (0..self.strategy.lambda)
            .map(|_| {
                (0..n)
                    .map(|_| self.rng.sample(StandardNormal))
                    .collect::<Vec<f64>>()
            })
            .collect();

        let points = self
            .steps
            .iter()
            .map(|z: &Vec<f64>| {
                let coords = z
                    .iter()
                    .zip(&self.mean)
                    .zip(&self.bounds)
                    .map(|((zi, mi), (lo, hi))| {
                        let u = (mi + self.sigma * zi).clamp(0.0, 1.0);
                        lo + u * (hi - lo)
                    })
                    .collect();
                SearchPoint::new(coords)
            })
            .collect();

        let cost = std::mem::take(&mut self.carry) + started.elapsed();
        Generation::new(self.generations, points, cost)
    }

    fn finish_generation(&mut self, generation: &Generation) {
        let scores = generation.scores();
        let mut order: Vec<usize> = (0..scores.len()).collect();
        order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

        let n = self.bounds.len();
        let mut weighted = vec![0.0; n];
        for (w, &idx) in self.strategy.weights.iter().zip(&order) {
            for (acc, z) in weighted.iter_mut().zip(&self.steps[idx]) {
                *acc += w * z;
            }
        }

        for (m, step) in self.mean.iter_mut().zip(&weighted) {
            *m += self.sigma * step;
        }

        let Strategy {
            c_sigma,
            d_sigma,
            mu_eff,
            chi_n,
            ..
        } = self.strategy;
        let gain = (c_sigma * (2.0 - c_sigma) * mu_eff).sqrt();
        for (p, step) in self.path.iter_mut().zip(&weighted) {
            *p = (1.0 - c_sigma) * *p + gain * step;
        }
        let norm = self.path.iter().map(|p| p * p).sum::<f64>().sqrt();
        self.sigma *= ((c_sigma / d_sigma) * (norm / chi_n - 1.0)).exp();

        self.generations += 1;
        self.best_history.push_back(scores[order[0]]);
        let window = self.history_window();
        while self.best_history.len() > window {
            self.best_history.pop_front();
        }

        if let Some(reason) = self.check_stop(&scores) {
            tracing::info!(
                "Evolution strategy stopped after {} generations: {}",
                self.generations,
                reason
            );
            self.state = AdapterState::Exhausted;
            self.stop_reason = Some(reason);
        }
    }

    fn check_stop(&self, scores: &[f64]) -> Option<String> {
        if self.generations >= self.settings.max_generations {
            return Some(format!("max_generations {}", self.settings.max_generations));
        }
        if self.sigma < self.settings.tol_x {
            return Some(format!("sigma {:.3e} below tol_x", self.sigma));
        }
        if self.best_history.len() >= self.history_window() {
            let spread = |values: &mut dyn Iterator<Item = f64>| {
                let (lo, hi) = values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                    (lo.min(v), hi.max(v))
                });
                hi - lo
            };
            let history = spread(&mut self.best_history.iter().copied());
            let current = spread(&mut scores.iter().copied());
            if history < self.settings.tol_fun && current < self.settings.tol_fun {
                return Some(format!("score spread below tol_fun {}", self.settings.tol_fun));
            }
        }
        None
    }
}

fn normalize(x: f64, lo: f64, hi: f64) -> f64 {
    if hi > lo {
        ((x - lo) / (hi - lo)).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

impl OptimizerAdapter for EvolutionAdapter {
    fn suggest(&mut self) -> ApResult<Suggestion> {
        if self.state == AdapterState::Exhausted {
            return Err(OptimizerError::SearchExhausted {
                generations: self.generations,
                reason: self.stop_reason.clone().unwrap_or_default(),
            }
            .into());
        }

        if self.current.is_none() {
            let generation = self.start_generation();
            self.current = Some(generation);
        }

        let generation = self.current.as_mut().ok_or_else(|| {
            ap_types::internal_error!("evolution generation missing after start")
        })?;
        match generation.next_member() {
            Some((sample, point)) => {
                self.clock.charge(generation.share());
                Ok(Suggestion { point, sample })
            }
            None => Err(OptimizerError::PendingGeneration {
                generation: generation.index(),
                outstanding: generation.outstanding(),
            }
            .into()),
        }
    }

    fn register(&mut self, point: &SearchPoint, score: f64) -> ApResult<()> {
        let started = Instant::now();
        let generation = self.current.as_mut().ok_or_else(|| {
            OptimizerError::UnexpectedRegistration {
                message: "no generation has been suggested".to_string(),
            }
        })?;
        generation.record(point, score)?;

        if generation.is_complete() {
            if let Some(done) = self.current.take() {
                self.finish_generation(&done);
            }
            self.carry += started.elapsed();
            if self.state == AdapterState::Exhausted {
                // No further generation will absorb the update cost.
                self.clock.charge(std::mem::take(&mut self.carry));
            }
        } else {
            self.clock.charge_since(started);
        }
        Ok(())
    }

    fn describe(&self) -> AdapterDescription {
        let hyperparameters = BTreeMap::from([
            ("population".to_string(), self.strategy.lambda as f64),
            ("sigma".to_string(), self.settings.sigma),
            ("max_generations".to_string(), self.settings.max_generations as f64),
            ("tol_fun".to_string(), self.settings.tol_fun),
            ("tol_x".to_string(), self.settings.tol_x),
        ]);
        AdapterDescription {
            method: "evolution".to_string(),
            seed: self.seed,
            hyperparameters,
            generation: self.generations,
        }
    }

    fn state(&self) -> AdapterState {
        self.state
    }

    fn take_overhead(&mut self) -> f64 {
        self.clock.take()
    }
}
