//! Generation bookkeeping shared by the population-based adapters.

use ap_types::{ApResult, OptimizerError, SearchPoint};
use std::time::Duration;

use crate::adapter::SampleIndex;

/// One generation of candidates, handed out one at a time.
#[derive(Debug, Clone)]
pub(crate) struct Generation {
    index: usize,
    points: Vec<SearchPoint>,
    scores: Vec<Option<f64>>,
    next: usize,
    /// Optimizer time attributed to each member.
    share: Duration,
}

impl Generation {
    /// `cost` is the optimizer time spent producing this generation; it is
    /// split evenly across the members.
    pub(crate) fn new(index: usize, points: Vec<SearchPoint>, cost: Duration) -> Self {
        let share = cost / points.len().max(1) as u32;
        let scores = vec![None; points.len()];
        Self {
            index,
            points,
            scores,
            next: 0,
            share,
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn share(&self) -> Duration {
        self.share
    }

    pub(crate) fn points(&self) -> &[SearchPoint] {
        &self.points
    }

    /// Hand out the next member, or `None` once all have been suggested.
    pub(crate) fn next_member(&mut self) -> Option<(SampleIndex, SearchPoint)> {
        let point = self.points.get(self.next)?.clone();
        let sample = SampleIndex {
            generation: self.index,
            individual: self.next,
        };
        self.next += 1;
        Some((sample, point))
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.scores[..self.next].iter().filter(|s| s.is_none()).count()
    }

    /// Attach a score to the earliest handed-out, unscored member equal to
    /// `point`.
    pub(crate) fn record(&mut self, point: &SearchPoint, score: f64) -> ApResult<()> {
        let slot = (0..self.next)
            .find(|&i| self.scores[i].is_none() && self.points[i] == *point)
            .ok_or_else(|| OptimizerError::UnexpectedRegistration {
                message: format!(
                    "no pending member of generation {} matches {:?}",
                    self.index,
                    point.coords()
                ),
            })?;
        self.scores[slot] = Some(score);
        Ok(())
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.scores.iter().all(Option::is_some)
    }

    /// Scores in member order; only meaningful once complete.
    pub(crate) fn scores(&self) -> Vec<f64> {
        self.scores.iter().map(|s| s.unwrap_or(f64::INFINITY)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generation() -> Generation {
        let points = vec![
            SearchPoint::new(vec![0.0]),
            SearchPoint::new(vec![1.0]),
            SearchPoint::new(vec![2.0]),
        ];
        Generation::new(4, points, Duration::from_millis(300))
    }

    #[test]
    fn members_drain_in_order() {
        let mut g = generation();
        let (s0, p0) = g.next_member().unwrap();
        assert_eq!(s0, SampleIndex { generation: 4, individual: 0 });
        assert_eq!(p0.coords(), &[0.0]);
        g.next_member().unwrap();
        g.next_member().unwrap();
        assert!(g.next_member().is_none());
        assert_eq!(g.share(), Duration::from_millis(100));
    }

    #[test]
    fn record_requires_a_pending_match() {
        let mut g = generation();
        let (_, p0) = g.next_member().unwrap();
        assert!(g.record(&SearchPoint::new(vec![1.0]), 1.0).is_err());
        g.record(&p0, 5.0).unwrap();
        assert!(g.record(&p0, 5.0).is_err());
        assert_eq!(g.outstanding(), 0);
        assert!(!g.is_complete());
    }

    #[test]
    fn complete_after_all_scored() {
        let mut g = generation();
        while let Some((_, p)) = g.next_member() {
            g.record(&p, p[0] * 2.0).unwrap();
        }
        assert!(g.is_complete());
        assert_eq!(g.scores(), vec![0.0, 2.0, 4.0]);
    }
}
