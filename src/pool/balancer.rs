// ABOUTME: Connection selection strategies for the pool manager
// ABOUTME: Round-robin cursor, least in-flight operations and health-weighted random draw

use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use serde::{Deserialize, Serialize};

/// How the pool picks a connection when no preferred server applies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadBalancingStrategy {
    /// Pool-wide cursor, skipping unusable connections
    #[default]
    RoundRobin,
    /// Fewest operations in flight
    LeastConnections,
    /// Random draw weighted by health and load
    HealthWeighted,
}

/// What the pool does when the chosen connection fails a request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailoverStrategy {
    /// Retry right away on the next best connection
    Immediate,
    /// Leave recovery to each connection's breaker; later calls route around it
    #[default]
    CircuitBreaker,
}

/// Selection view of one registered connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    /// Serving calls and not excluded for this request
    pub eligible: bool,
    /// Serving, but in degraded mode
    pub degraded: bool,
    /// Operations in flight on the connection
    pub in_flight: usize,
}

impl Candidate {
    /// Selection weight: 1 when healthy, `health_threshold` when degraded,
    /// divided by (1 + in-flight operations)
    #[allow(clippy::cast_precision_loss)]
    fn weight(&self, health_threshold: f64) -> f64 {
        if !self.eligible {
            return 0.0;
        }
        let base = if self.degraded { health_threshold } else { 1.0 };
        base / (1.0 + self.in_flight as f64)
    }
}

/// Picks a candidate index according to a strategy
#[derive(Debug, Default)]
pub struct Balancer {
    cursor: AtomicUsize,
}

impl Balancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the selected candidate, or `None` when nothing is eligible
    pub fn select(
        &self,
        strategy: LoadBalancingStrategy,
        candidates: &[Candidate],
        health_threshold: f64,
    ) -> Option<usize> {
        self.select_with(strategy, candidates, health_threshold, &mut rand::thread_rng())
    }

    /// Like [`Balancer::select`] with a caller-supplied RNG
    pub fn select_with<R: Rng + ?Sized>(
        &self,
        strategy: LoadBalancingStrategy,
        candidates: &[Candidate],
        health_threshold: f64,
        rng: &mut R,
    ) -> Option<usize> {
        match strategy {
            LoadBalancingStrategy::RoundRobin => self.round_robin(candidates),
            LoadBalancingStrategy::LeastConnections => least_connections(candidates),
            LoadBalancingStrategy::HealthWeighted => {
                health_weighted(candidates, health_threshold, rng)
            }
        }
    }

    fn round_robin(&self, candidates: &[Candidate]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        let len = candidates.len();
        let start = self.cursor.load(Ordering::Relaxed) % len;
        let chosen = (0..len)
            .map(|i| (start + i) % len)
            .find(|&index| candidates[index].eligible)?;
        // Resume after the chosen slot so a skipped server's turn is not
        // handed to its neighbour
        self.cursor.store(chosen + 1, Ordering::Relaxed);
        Some(chosen)
    }
}

fn least_connections(candidates: &[Candidate]) -> Option<usize> {
    candidates
        .iter()
        .enumerate()
        .filter(|(_, candidate)| candidate.eligible)
        .min_by_key(|(_, candidate)| candidate.in_flight)
        .map(|(index, _)| index)
}

fn health_weighted<R: Rng + ?Sized>(
    candidates: &[Candidate],
    health_threshold: f64,
    rng: &mut R,
) -> Option<usize> {
    let weights: Vec<f64> = candidates
        .iter()
        .map(|candidate| candidate.weight(health_threshold))
        .collect();
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        // Every eligible candidate weighs zero (degraded with a zero threshold)
        return least_connections(candidates);
    }

    let mut point = rng.gen_range(0.0..total);
    for (index, weight) in weights.iter().enumerate() {
        if *weight <= 0.0 {
            continue;
        }
        if point < *weight {
            return Some(index);
        }
        point -= weight;
    }

    // Float rounding left the point past the last bucket
    weights.iter().rposition(|weight| *weight > 0.0)
}
