//! Bayesian optimization with a Gaussian-process surrogate.
//!
//! Scores are minimized by the search loop; the surrogate maximizes their
//! negation. Coordinates are normalized to `[0, 1]` per dimension before
//! they reach the kernel, and targets are standardized, so one length
//! scale works across knob spaces of different cardinality.

use ap_types::{ApResult, OptimizerError, SearchPoint};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;

use crate::adapter::{
    AdapterDescription, AdapterState, OptimizerAdapter, OverheadClock, SampleIndex, Suggestion,
};

/// Acquisition function used to rank candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UtilityKind {
    /// Upper confidence bound: `mu + kappa * sigma`.
    #[default]
    Ucb,
    /// Expected improvement over the best target plus `xi`.
    Ei,
    /// Probability of improvement over the best target plus `xi`.
    Poi,
}

impl UtilityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ucb => "ucb",
            Self::Ei => "ei",
            Self::Poi => "poi",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BayesianSettings {
    pub utility: UtilityKind,
    pub kappa: f64,
    /// Multiplier applied to `kappa` after every suggestion once the delay
    /// has passed. `1.0` disables decay.
    pub kappa_decay: f64,
    pub kappa_decay_delay: usize,
    pub xi: f64,
    /// Random suggestions issued before the surrogate takes over.
    pub initial_points: usize,
    /// Random candidates scored by the acquisition function per suggestion.
    pub candidates: usize,
    /// RBF length scale in normalized coordinates.
    pub length_scale: f64,
    /// Diagonal noise added to the kernel matrix.
    pub noise: f64,
}

impl Default for BayesianSettings {
    fn default() -> Self {
        Self {
            utility: UtilityKind::Ucb,
            kappa: 2.576,
            kappa_decay: 1.0,
            kappa_decay_delay: 0,
            xi: 0.0,
            initial_points: 1,
            candidates: 1000,
            length_scale: 0.25,
            noise: 1e-6,
        }
    }
}

/// Standard normal CDF via the Abramowitz & Stegun 7.1.26 erf approximation.
fn normal_cdf(x: f64) -> f64 {
    if x >= 8.0 {
        return 1.0;
    }
    if x <= -8.0 {
        return 0.0;
    }
    let z = x.abs() / std::f64::consts::SQRT_2;
    let t = 1.0 / (1.0 + 0.327_591_1 * z);
    let poly = ((((1.061_405_429 * t - 1.453_152_027) * t + 1.421_413_741) * t - 0.284_496_736)
        * t
        + 0.254_829_592)
        * t;
    let erf = 1.0 - poly * (-z * z).exp();
    if x >= 0.0 {
        0.5 * (1.0 + erf)
    } else {
        0.5 * (1.0 - erf)
    }
}

fn normal_pdf(x: f64) -> f64 {
    const INV_SQRT_2PI: f64 = 0.398_942_280_401_432_7;
    INV_SQRT_2PI * (-0.5 * x * x).exp()
}

/// Lower-triangular Cholesky factor of a symmetric positive definite matrix.
fn cholesky(matrix: &[Vec<f64>]) -> Option<Vec<Vec<f64>>> {
    let n = matrix.len();
    let mut l = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..=i {
            let dot: f64 = (0..j).map(|k| l[i][k] * l[j][k]).sum();
            if i == j {
                let d = matrix[i][i] - dot;
                if d <= 0.0 || !d.is_finite() {
                    return None;
                }
                l[i][j] = d.sqrt();
            } else {
                l[i][j] = (matrix[i][j] - dot) / l[j][j];
            }
        }
    }
    Some(l)
}

/// Solve `L x = b` for lower-triangular `L`.
fn forward_solve(l: &[Vec<f64>], b: &[f64]) -> Vec<f64> {
    let mut x = vec![0.0; b.len()];
    for i in 0..b.len() {
        let dot: f64 = (0..i).map(|k| l[i][k] * x[k]).sum();
        x[i] = (b[i] - dot) / l[i][i];
    }
    x
}

/// Solve `L^T x = b` for lower-triangular `L`.
fn backward_solve(l: &[Vec<f64>], b: &[f64]) -> Vec<f64> {
    let n = b.len();
    let mut x = vec![0.0; n];
    for i in (0..n).rev() {
        let dot: f64 = (i + 1..n).map(|k| l[k][i] * x[k]).sum();
        x[i] = (b[i] - dot) / l[i][i];
    }
    x
}

/// Gaussian process posterior fitted to standardized targets.
#[derive(Debug)]
struct Posterior {
    inputs: Vec<Vec<f64>>,
    chol: Vec<Vec<f64>>,
    alpha: Vec<f64>,
    length_scale: f64,
    /// Best standardized target.
    best: f64,
}

impl Posterior {
    fn fit(inputs: &[Vec<f64>], targets: &[f64], length_scale: f64, noise: f64) -> ApResult<Self> {
        let n = targets.len();
        let mean = targets.iter().sum::<f64>() / n as f64;
        let var = targets.iter().map(|y| (y - mean).powi(2)).sum::<f64>() / n as f64;
        let std = if var > 0.0 { var.sqrt() } else { 1.0 };
        let ys: Vec<f64> = targets.iter().map(|y| (y - mean) / std).collect();

        let kernel: Vec<Vec<f64>> = inputs
            .iter()
            .map(|a| inputs.iter().map(|b| rbf(a, b, length_scale)).collect())
            .collect();

        let mut jitter = noise.max(1e-10);
        let chol = loop {
            let mut k = kernel.clone();
            for (i, row) in k.iter_mut().enumerate() {
                row[i] += jitter;
            }
            if let Some(l) = cholesky(&k) {
                break l;
            }
            jitter *= 10.0;
            if jitter > 1.0 {
                return Err(OptimizerError::Surrogate {
                    message: format!("kernel matrix of {n} observations is not positive definite"),
                }
                .into());
            }
        };

        let alpha = backward_solve(&chol, &forward_solve(&chol, &ys));
        let best = ys.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Ok(Self {
            inputs: inputs.to_vec(),
            chol,
            alpha,
            length_scale,
            best,
        })
    }

    /// Posterior mean and standard deviation at `x`.
    fn predict(&self, x: &[f64]) -> (f64, f64) {
        let k: Vec<f64> = self
            .inputs
            .iter()
            .map(|xi| rbf(x, xi, self.length_scale))
            .collect();
        let mu = k.iter().zip(&self.alpha).map(|(a, b)| a * b).sum();
        let v = forward_solve(&self.chol, &k);
        let var = 1.0 - v.iter().map(|vi| vi * vi).sum::<f64>();
        (mu, var.max(1e-12).sqrt())
    }
}

fn rbf(a: &[f64], b: &[f64], length_scale: f64) -> f64 {
    let sq: f64 = a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum();
    (-sq / (2.0 * length_scale * length_scale)).exp()
}

#[derive(Debug)]
pub struct BayesianAdapter {
    settings: BayesianSettings,
    bounds: Vec<(f64, f64)>,
    seed: u64,
    rng: ChaCha8Rng,
    kappa: f64,
    /// Normalized coordinates of every registered point.
    inputs: Vec<Vec<f64>>,
    /// Negated scores, maximized by the surrogate.
    targets: Vec<f64>,
    iteration: usize,
    clock: OverheadClock,
}

impl BayesianAdapter {
    pub fn new(settings: BayesianSettings, bounds: Vec<(f64, f64)>, seed: u64) -> ApResult<Self> {
        if settings.candidates == 0 {
            return Err(OptimizerError::InvalidSettings {
                message: "candidates must be positive".to_string(),
            }
            .into());
        }
        if settings.length_scale.is_nan() || settings.length_scale <= 0.0 {
            return Err(OptimizerError::InvalidSettings {
                message: format!("length_scale must be positive, got {}", settings.length_scale),
            }
            .into());
        }

        Ok(Self {
            kappa: settings.kappa,
            rng: ChaCha8Rng::seed_from_u64(seed),
            settings,
            bounds,
            seed,
            inputs: Vec::new(),
            targets: Vec::new(),
            iteration: 0,
            clock: OverheadClock::new(),
        })
    }

    /// Current exploration weight after decay.
    pub fn kappa(&self) -> f64 {
        self.kappa
    }

    pub fn observations(&self) -> usize {
        self.targets.len()
    }

    fn normalize(&self, point: &SearchPoint) -> Vec<f64> {
        point
            .coords()
            .iter()
            .zip(&self.bounds)
            .map(|(x, (lo, hi))| if hi > lo { (x - lo) / (hi - lo) } else { 0.0 })
            .collect()
    }

    fn denormalize(&self, unit: &[f64]) -> SearchPoint {
        let coords = unit
            .iter()
            .zip(&self.bounds)
            .map(|(u, (lo, hi))| lo + u.clamp(0.0, 1.0) * (hi - lo))
            .collect();
        SearchPoint::new(coords)
    }

    fn random_unit(&mut self) -> Vec<f64> {
        (0..self.bounds.len()).map(|_| self.rng.gen::<f64>()).collect()
    }

    fn utility(&self, mu: f64, sigma: f64, best: f64) -> f64 {
        match self.settings.utility {
            UtilityKind::Ucb => mu + self.kappa * sigma,
            UtilityKind::Ei => {
                let improvement = mu - best - self.settings.xi;
                let z = improvement / sigma;
                improvement * normal_cdf(z) + sigma * normal_pdf(z)
            }
            UtilityKind::Poi => normal_cdf((mu - best - self.settings.xi) / sigma),
        }
    }

    /// Highest-utility candidate among uniform samples and perturbations
    /// of the incumbent.
    fn maximize_acquisition(&mut self, posterior: &Posterior) -> Vec<f64> {
        let incumbent = self
            .targets
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| self.inputs[i].clone());

        let local = self.settings.candidates / 4;
        let mut best: Option<(Vec<f64>, f64)> = None;
        for i in 0..self.settings.candidates {
            let candidate = match (&incumbent, i < local) {
                (Some(center), true) => center
                    .iter()
                    .map(|c| {
                        let step: f64 = self.rng.sample(StandardNormal);
                        (c + 0.1 * step).clamp(0.0, 1.0)
                    })
                    .collect(),
                _ => self.random_unit(),
            };
            let (mu, sigma) = posterior.predict(&candidate);
            let score = self.utility(mu, sigma, posterior.best);
            if best.as_ref().map_or(true, |(_, s)| score > *s) {
                best = Some((candidate, score));
            }
        }
        best.map(|(c, _)| c).unwrap_or_else(|| self.random_unit())
    }

    fn decay_kappa(&mut self) {
        if self.settings.kappa_decay < 1.0 && self.iteration > self.settings.kappa_decay_delay {
            self.kappa *= self.settings.kappa_decay;
        }
    }
}

impl OptimizerAdapter for BayesianAdapter {
    fn suggest(&mut self) -> ApResult<Suggestion> {
        let started = Instant::now();
        let unit = if self.targets.len() < self.settings.initial_points.max(1) {
            self.random_unit()
        } else {
            let posterior = Posterior::fit(
                &self.inputs,
                &self.targets,
                self.settings.length_scale,
                self.settings.noise,
            )?;
            self.maximize_acquisition(&posterior)
        };

        let sample = SampleIndex {
            generation: self.iteration,
            individual: 0,
        };
        self.iteration += 1;
        self.decay_kappa();

        let point = self.denormalize(&unit);
        self.clock.charge_since(started);
        Ok(Suggestion { point, sample })
    }

    /// Any point may be registered; duplicates are kept as separate
    /// observations.
    fn register(&mut self, point: &SearchPoint, score: f64) -> ApResult<()> {
        let started = Instant::now();
        if point.dim() != self.bounds.len() {
            return Err(OptimizerError::UnexpectedRegistration {
                message: format!(
                    "point has {} dims, adapter expects {}",
                    point.dim(),
                    self.bounds.len()
                ),
            }
            .into());
        }
        if !score.is_finite() {
            return Err(OptimizerError::UnexpectedRegistration {
                message: format!("score {score} is not finite"),
            }
            .into());
        }
        let unit = self.normalize(point);
        self.inputs.push(unit);
        self.targets.push(-score);
        self.clock.charge_since(started);
        Ok(())
    }

    fn describe(&self) -> AdapterDescription {
        let hyperparameters = BTreeMap::from([
            ("kappa".to_string(), self.kappa),
            ("kappa_decay".to_string(), self.settings.kappa_decay),
            (
                "kappa_decay_delay".to_string(),
                self.settings.kappa_decay_delay as f64,
            ),
            ("xi".to_string(), self.settings.xi),
            ("length_scale".to_string(), self.settings.length_scale),
        ]);
        AdapterDescription {
            method: "bayesian".to_string(),
            seed: self.seed,
            hyperparameters,
            generation: self.iteration,
        }
    }

    fn state(&self) -> AdapterState {
        AdapterState::Ready
    }

    fn take_overhead(&mut self) -> f64 {
        self.clock.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds() -> Vec<(f64, f64)> {
        vec![(0.0, 9.0), (0.0, 1.0), (0.0, 2.0)]
    }

    fn objective(point: &SearchPoint) -> f64 {
        let c = point.coords();
        1.0 + (c[0] - 6.0).powi(2) + 3.0 * (c[2] - 1.0).powi(2)
    }

    fn settings() -> BayesianSettings {
        BayesianSettings {
            candidates: 200,
            ..Default::default()
        }
    }

    #[test]
    fn normal_cdf_matches_reference_values() {
        assert!((normal_cdf(0.0) - 0.5).abs() < 1e-7);
        assert!((normal_cdf(1.96) - 0.975_002).abs() < 1e-5);
        assert!((normal_cdf(-1.0) - 0.158_655).abs() < 1e-5);
    }

    #[test]
    fn cholesky_solves_small_system() {
        let m = vec![vec![4.0, 2.0], vec![2.0, 3.0]];
        let l = cholesky(&m).unwrap();
        let x = backward_solve(&l, &forward_solve(&l, &[2.0, 1.0]));
        // [4 2; 2 3] x = [2 1] => x = [0.5, 0]
        assert!((x[0] - 0.5).abs() < 1e-12);
        assert!(x[1].abs() < 1e-12);
        assert!(cholesky(&[vec![0.0]]).is_none());
    }

    #[test]
    fn posterior_interpolates_observations() {
        let inputs = vec![vec![0.0], vec![0.5], vec![1.0]];
        let targets = vec![1.0, 3.0, 2.0];
        let posterior = Posterior::fit(&inputs, &targets, 0.25, 1e-8).unwrap();
        let (mu_mid, sigma_mid) = posterior.predict(&[0.5]);
        let (_, sigma_gap) = posterior.predict(&[0.25]);
        assert!(mu_mid > 0.9, "standardized mean at the maximum: {mu_mid}");
        assert!(sigma_mid < sigma_gap);
    }

    #[test]
    fn same_seed_same_suggestions() {
        let mut a = BayesianAdapter::new(settings(), bounds(), 11).unwrap();
        let mut b = BayesianAdapter::new(settings(), bounds(), 11).unwrap();
        for _ in 0..8 {
            let sa = a.suggest().unwrap();
            let sb = b.suggest().unwrap();
            assert_eq!(sa, sb);
            a.register(&sa.point, objective(&sa.point)).unwrap();
            b.register(&sb.point, objective(&sb.point)).unwrap();
        }
    }

    #[test]
    fn suggestions_stay_in_bounds_and_count_iterations() {
        let mut adapter = BayesianAdapter::new(settings(), bounds(), 2).unwrap();
        for i in 0..6 {
            let s = adapter.suggest().unwrap();
            assert_eq!(s.sample.generation, i);
            for (x, (lo, hi)) in s.point.coords().iter().zip(bounds()) {
                assert!(*x >= lo && *x <= hi);
            }
            adapter.register(&s.point, objective(&s.point)).unwrap();
        }
        assert_eq!(adapter.observations(), 6);
    }

    #[test]
    fn duplicate_registrations_are_tolerated() {
        let mut adapter = BayesianAdapter::new(settings(), bounds(), 4).unwrap();
        let point = SearchPoint::new(vec![3.0, 1.0, 0.0]);
        adapter.register(&point, 2.0).unwrap();
        adapter.register(&point, 2.5).unwrap();
        adapter.register(&point, 1.5).unwrap();
        adapter.suggest().unwrap();
    }

    #[test]
    fn kappa_decays_after_delay() {
        let s = BayesianSettings {
            kappa_decay: 0.5,
            kappa_decay_delay: 2,
            ..settings()
        };
        let mut adapter = BayesianAdapter::new(s, bounds(), 9).unwrap();
        for _ in 0..2 {
            let p = adapter.suggest().unwrap();
            adapter.register(&p.point, objective(&p.point)).unwrap();
        }
        assert_eq!(adapter.kappa(), 2.576);
        let p = adapter.suggest().unwrap();
        adapter.register(&p.point, objective(&p.point)).unwrap();
        assert_eq!(adapter.kappa(), 1.288);
    }

    #[test]
    fn rejects_non_finite_scores() {
        let mut adapter = BayesianAdapter::new(settings(), bounds(), 4).unwrap();
        let s = adapter.suggest().unwrap();
        assert!(adapter.register(&s.point, f64::NAN).is_err());
    }

    #[test]
    fn utility_serializes_lowercase() {
        let json = serde_json::to_string(&UtilityKind::Ei).unwrap();
        assert_eq!(json, "\"ei\"");
        let s: BayesianSettings = serde_json::from_str(r#"{"utility": "poi", "xi": 0.1}"#).unwrap();
        assert_eq!(s.utility, UtilityKind::Poi);
        assert_eq!(s.kappa, 2.576);
    }
}
