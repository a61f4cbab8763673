//! Particle swarm adapter.

use ap_types::{ApResult, OptimizerError, SearchPoint};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::adapter::{
    AdapterDescription, AdapterState, OptimizerAdapter, OverheadClock, Suggestion,
};
use crate::population::Generation;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmSettings {
    /// Particles per generation.
    pub population: usize,
    /// Inertia weight.
    pub w: f64,
    /// Cognitive (personal-best) coefficient.
    pub c1: f64,
    /// Social (global-best) coefficient.
    pub c2: f64,
}

impl Default for SwarmSettings {
    fn default() -> Self {
        Self {
            population: 10,
            w: 0.8,
            c1: 0.5,
            c2: 0.5,
        }
    }
}

#[derive(Debug, Clone)]
struct Particle {
    position: Vec<f64>,
    velocity: Vec<f64>,
    best_position: Vec<f64>,
    best_score: f64,
}

#[derive(Debug)]
pub struct SwarmAdapter {
    settings: SwarmSettings,
    bounds: Vec<(f64, f64)>,
    seed: u64,
    rng: ChaCha8Rng,
    particles: Vec<Particle>,
    global_best: Option<(Vec<f64>, f64)>,
    current: Option<Generation>,
    generations: usize,
    /// Update cost carried into the next generation's share.
    carry: Duration,
    clock: OverheadClock,
}

impl SwarmAdapter {
    pub fn new(settings: SwarmSettings, bounds: Vec<(f64, f64)>, seed: u64) -> ApResult<Self> {
        if settings.population == 0 {
            return Err(OptimizerError::InvalidSettings {
                message: "swarm population must be positive".to_string(),
            }
            .into());
        }

        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let particles = (0..settings.population)
            .map(|_| {
                let position: Vec<f64> = bounds
                    .iter()
                    .map(|(lo, hi)| lo + rng.gen::<f64>() * (hi - lo))
                    .collect();
                let velocity = bounds
                    .iter()
                    .map(|(lo, hi)| {
                        let span = hi - lo;
                        (rng.gen::<f64>() * 2.0 - 1.0) * span
                    })
                    .collect();
                Particle {
                    best_position: position.clone(),
                    position,
                    velocity,
                    best_score: f64::INFINITY,
                }
            })
            .collect();

        Ok(Self {
            settings,
            bounds,
            seed,
            rng,
            particles,
            global_best: None,
            current: None,
            generations: 0,
            carry: Duration::ZERO,
            clock: OverheadClock::new(),
        })
    }

    /// Best position and score seen so far.
    pub fn global_best(&self) -> Option<(&[f64], f64)> {
        self.global_best
            .as_ref()
            .map(|(pos, score)| (pos.as_slice(), *score))
    }

    fn start_generation(&mut self) -> Generation {
        let started = Instant::now();
        if self.generations > 0 {
            self.move_particles();
        }
        let points = self
            .particles
            .iter()
            .map(|p| SearchPoint::new(p.position.clone()))
            .collect();
        let cost = std::mem::take(&mut self.carry) + started.elapsed();
        Generation::new(self.generations, points, cost)
    }

    fn move_particles(&mut self) {
        let Some((global, _)) = self.global_best.clone() else {
            return;
        };
        let SwarmSettings { w, c1, c2, .. } = self.settings;

        for particle in &mut self.particles {
            for d in 0..self.bounds.len() {
                let (lo, hi) = self.bounds[d];
                let span = hi - lo;
                let r1: f64 = self.rng.gen();
                let r2: f64 = self.rng.gen();
                let x = particle.position[d];
                let v = w * particle.velocity[d]
                    + c1 * r1 * (particle.best_position[d] - x)
                    + c2 * r2 * (global[d] - x);
                let v = v.clamp(-span, span);
                particle.velocity[d] = v;
                particle.position[d] = (x + v).clamp(lo, hi);
            }
        }
    }

    fn finish_generation(&mut self, generation: &Generation) {
        for (particle, score) in self.particles.iter_mut().zip(generation.scores()) {
            if score < particle.best_score {
                particle.best_score = score;
                particle.best_position = particle.position.clone();
            }
        }
        let best = self
            .particles
            .iter()
            .min_by(|a, b| a.best_score.total_cmp(&b.best_score));
        if let Some(best) = best {
            let improved = self
                .global_best
                .as_ref()
                .map_or(true, |(_, score)| best.best_score < *score);
            if improved {
                self.global_best = Some((best.best_position.clone(), best.best_score));
            }
        }
        self.generations += 1;
    }
}

impl OptimizerAdapter for SwarmAdapter {
    fn suggest(&mut self) -> ApResult<Suggestion> {
        if self.current.is_none() {
            let generation = self.start_generation();
            tracing::debug!(
                "Swarm generation {} ready ({} particles)",
                generation.index(),
                generation.points().len()
            );
            self.current = Some(generation);
        }

        let generation = self.current.as_mut().ok_or_else(|| {
            ap_types::internal_error!("swarm generation missing after start")
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
        } else {
            self.clock.charge_since(started);
        }
        Ok(())
    }

    fn describe(&self) -> AdapterDescription {
        let hyperparameters = BTreeMap::from([
            ("population".to_string(), self.settings.population as f64),
            ("w".to_string(), self.settings.w),
            ("c1".to_string(), self.settings.c1),
            ("c2".to_string(), self.settings.c2),
        ]);
        AdapterDescription {
            method: "swarm".to_string(),
            seed: self.seed,
            hyperparameters,
            generation: self.generations,
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
        vec![(0.0, 9.0), (0.0, 1.0), (0.0, 2.0), (0.0, 21.0)]
    }

    fn objective(point: &SearchPoint) -> f64 {
        let c = point.coords();
        (c[0] - 7.0).powi(2) + (c[3] - 3.0).powi(2) + c[1]
    }

    #[test]
    fn same_seed_same_trajectory() {
        let settings = SwarmSettings {
            population: 4,
            ..Default::default()
        };
        let mut a = SwarmAdapter::new(settings.clone(), bounds(), 42).unwrap();
        let mut b = SwarmAdapter::new(settings, bounds(), 42).unwrap();

        for _ in 0..20 {
            let sa = a.suggest().unwrap();
            let sb = b.suggest().unwrap();
            assert_eq!(sa, sb);
            let score = objective(&sa.point);
            a.register(&sa.point, score).unwrap();
            b.register(&sb.point, score).unwrap();
        }
    }

    #[test]
    fn sample_index_tracks_generation() {
        let settings = SwarmSettings {
            population: 3,
            ..Default::default()
        };
        let mut swarm = SwarmAdapter::new(settings, bounds(), 7).unwrap();
        let mut samples = Vec::new();
        for _ in 0..6 {
            let s = swarm.suggest().unwrap();
            samples.push((s.sample.generation, s.sample.individual));
            swarm.register(&s.point, objective(&s.point)).unwrap();
        }
        assert_eq!(samples, vec![(0, 0), (0, 1), (0, 2), (1, 0), (1, 1), (1, 2)]);
        assert_eq!(swarm.describe().generation, 2);
    }

    #[test]
    fn positions_stay_in_bounds() {
        let settings = SwarmSettings {
            population: 5,
            w: 1.2,
            c1: 1.5,
            c2: 1.5,
        };
        let mut swarm = SwarmAdapter::new(settings, bounds(), 3).unwrap();
        for _ in 0..50 {
            let s = swarm.suggest().unwrap();
            for (x, (lo, hi)) in s.point.coords().iter().zip(bounds()) {
                assert!(*x >= lo && *x <= hi);
            }
            swarm.register(&s.point, objective(&s.point)).unwrap();
        }
        let (_, best) = swarm.global_best().unwrap();
        assert!(best.is_finite());
    }

    #[test]
    fn suggest_without_register_fails_at_generation_end() {
        let settings = SwarmSettings {
            population: 2,
            ..Default::default()
        };
        let mut swarm = SwarmAdapter::new(settings, bounds(), 1).unwrap();
        swarm.suggest().unwrap();
        swarm.suggest().unwrap();
        let err = swarm.suggest().unwrap_err();
        assert!(err.to_string().contains("awaits 2"));
    }

    #[test]
    fn zero_population_rejected() {
        let settings = SwarmSettings {
            population: 0,
            ..Default::default()
        };
        assert!(SwarmAdapter::new(settings, bounds(), 1).is_err());
    }
}
