use std::sync::atomic::{AtomicUsize, Ordering};

use quasar_common::{Endpoint, PoolKind};

/// A viable endpoint presented to the routing strategy.
pub struct Candidate<'a> {
    pub endpoint: &'a Endpoint,
    /// Requests this gateway currently has outstanding against the endpoint.
    pub in_flight: u64,
}

/// Trait for pluggable routing strategies.
/// The Router filters candidates (health, circuit, retry exclusions) and
/// presents survivors in pool order; the strategy picks one.
pub trait RoutingStrategy: Send + Sync {
    /// Select one candidate from the list. Returns the index into `candidates`.
    fn select(&self, pool: PoolKind, candidates: &[Candidate]) -> Option<usize>;

    /// Human-readable name for logging / metrics.
    fn name(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// RoundRobin: the n-th selection in a pool takes candidate n mod len (default)
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RoundRobin {
    generate: AtomicUsize,
    embed: AtomicUsize,
}

impl RoutingStrategy for RoundRobin {
    fn select(&self, pool: PoolKind, candidates: &[Candidate]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let cursor = match pool {
            PoolKind::Generate => &self.generate,
            PoolKind::Embed => &self.embed,
        };
        Some(cursor.fetch_add(1, Ordering::Relaxed) % candidates.len())
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

// ---------------------------------------------------------------------------
// LeastInFlight: fewest outstanding requests; ties go to the earliest in pool order
// ---------------------------------------------------------------------------

pub struct LeastInFlight;

impl RoutingStrategy for LeastInFlight {
    fn select(&self, _pool: PoolKind, candidates: &[Candidate]) -> Option<usize> {
        let mut best_idx: Option<usize> = None;
        let mut best = u64::MAX;

        for (i, c) in candidates.iter().enumerate() {
            if c.in_flight < best {
                best = c.in_flight;
                best_idx = Some(i);
            }
        }

        best_idx
    }

    fn name(&self) -> &'static str {
        "least_in_flight"
    }
}

pub fn parse_strategy(name: &str) -> Result<Box<dyn RoutingStrategy>, String> {
    match name {
        "round_robin" => Ok(Box::new(RoundRobin::default())),
        "least_in_flight" => Ok(Box::new(LeastInFlight)),
        other => Err(format!(
            "unknown routing strategy '{other}', expected one of: round_robin, least_in_flight"
        )),
    }
}
