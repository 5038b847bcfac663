use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use quasar_common::{now_ms, Endpoint, HealthStatus, PoolKind};

pub mod breaker;
pub mod health;
pub mod limiter;
pub mod pool;
pub mod prober;
pub mod strategy;

pub use breaker::{BreakerConfig, BreakerPermit, CircuitBreakers, CircuitState, CircuitView};
pub use health::HealthState;
pub use limiter::{LimitRejection, Limiter, LimiterConfig, RateLimitPolicy, StreamPermit};
pub use pool::UpstreamPools;
pub use prober::{HealthConfig, HealthProbe, HealthProber, HttpHealthProbe};
pub use strategy::{parse_strategy, Candidate, LeastInFlight, RoundRobin, RoutingStrategy};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    /// Every endpoint in the pool is unhealthy, stale, circuit-open or already tried.
    #[error("no viable endpoint in {pool} pool ({members} configured)")]
    NoViableEndpoint { pool: PoolKind, members: usize },
}

struct InFlight(Arc<AtomicU64>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A chosen endpoint plus its breaker admission. Pass it back to
/// [`Router::record_outcome`] once the call's fate is known; dropping it instead
/// (client went away) leaves the breaker untouched.
pub struct Selection {
    pub endpoint: Arc<Endpoint>,
    permit: BreakerPermit,
    _in_flight: InFlight,
}

impl Selection {
    pub fn endpoint_id(&self) -> &str {
        &self.endpoint.id
    }

    pub fn is_trial(&self) -> bool {
        self.permit.is_trial()
    }
}

impl std::fmt::Debug for Selection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selection")
            .field("endpoint", &self.endpoint.id)
            .field("trial", &self.permit.is_trial())
            .finish()
    }
}

pub struct Router {
    pools: Arc<UpstreamPools>,
    health: Arc<HealthState>,
    breakers: CircuitBreakers,
    strategy: Box<dyn RoutingStrategy>,
    in_flight: DashMap<String, Arc<AtomicU64>>,
    route_health_skipped_total: AtomicU64,
    route_circuit_skipped_total: AtomicU64,
    route_no_endpoint_total: AtomicU64,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("strategy", &self.strategy.name())
            .finish()
    }
}

impl Router {
    pub fn new(
        pools: Arc<UpstreamPools>,
        health: Arc<HealthState>,
        breaker: BreakerConfig,
        strategy: Box<dyn RoutingStrategy>,
    ) -> Arc<Self> {
        tracing::info!(
            strategy = strategy.name(),
            failure_threshold = breaker.failure_threshold,
            cooldown_ms = breaker.cooldown.as_millis() as u64,
            "router initialized"
        );
        Arc::new(Self {
            pools,
            health,
            breakers: CircuitBreakers::new(breaker),
            strategy,
            in_flight: DashMap::new(),
            route_health_skipped_total: AtomicU64::new(0),
            route_circuit_skipped_total: AtomicU64::new(0),
            route_no_endpoint_total: AtomicU64::new(0),
        })
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn pools(&self) -> &Arc<UpstreamPools> {
        &self.pools
    }

    pub fn health(&self) -> &Arc<HealthState> {
        &self.health
    }

    pub fn breakers(&self) -> &CircuitBreakers {
        &self.breakers
    }

    pub fn route_health_skipped_total(&self) -> u64 {
        self.route_health_skipped_total.load(Ordering::Relaxed)
    }

    pub fn route_circuit_skipped_total(&self) -> u64 {
        self.route_circuit_skipped_total.load(Ordering::Relaxed)
    }

    pub fn route_no_endpoint_total(&self) -> u64 {
        self.route_no_endpoint_total.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self, endpoint_id: &str) -> u64 {
        self.in_flight
            .get(endpoint_id)
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Healthy, or never probed yet (cold start). Stale snapshots read as unknown
    /// and are rejected.
    pub fn is_health_eligible(&self, endpoint_id: &str, now_ms: u64) -> bool {
        matches!(
            self.health.effective_status(endpoint_id, now_ms),
            None | Some(HealthStatus::Healthy)
        )
    }

    pub fn select(
        &self,
        pool: PoolKind,
        prefer: Option<&str>,
        exclude: &HashSet<String>,
    ) -> Result<Selection, RouteError> {
        self.select_at(pool, prefer, exclude, now_ms())
    }

    /// Picks one endpoint of `pool`, skipping ids in `exclude`. When `prefer`
    /// names a viable endpoint it wins over the strategy.
    pub fn select_at(
        &self,
        pool: PoolKind,
        prefer: Option<&str>,
        exclude: &HashSet<String>,
        now_ms: u64,
    ) -> Result<Selection, RouteError> {
        let members = self.pools.members(pool);
        let mut lost_race: HashSet<String> = HashSet::new();

        loop {
            let viable: Vec<&Arc<Endpoint>> = members
                .iter()
                .filter(|ep| {
                    if exclude.contains(&ep.id) || lost_race.contains(&ep.id) {
                        return false;
                    }
                    if !self.is_health_eligible(&ep.id, now_ms) {
                        self.route_health_skipped_total.fetch_add(1, Ordering::Relaxed);
                        return false;
                    }
                    if !self.breakers.is_selectable(&ep.id, now_ms) {
                        self.route_circuit_skipped_total.fetch_add(1, Ordering::Relaxed);
                        return false;
                    }
                    true
                })
                .collect();

            if viable.is_empty() {
                self.route_no_endpoint_total.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(pool=%pool, members = members.len(), excluded = exclude.len(), "no viable endpoint");
                return Err(RouteError::NoViableEndpoint {
                    pool,
                    members: members.len(),
                });
            }

            let preferred = prefer.and_then(|id| viable.iter().position(|ep| ep.id == id));
            let idx = match preferred {
                Some(i) => i,
                None => {
                    let candidates: Vec<Candidate> = viable
                        .iter()
                        .map(|ep| Candidate {
                            endpoint: ep,
                            in_flight: self.in_flight(&ep.id),
                        })
                        .collect();
                    self.strategy
                        .select(pool, &candidates)
                        .filter(|i| *i < viable.len())
                        .unwrap_or(0)
                }
            };
            let chosen = viable[idx];

            // Another request may have claimed the half-open trial since the filter ran.
            let Some(permit) = self.breakers.try_acquire(&chosen.id, now_ms) else {
                lost_race.insert(chosen.id.clone());
                continue;
            };

            let counter = self
                .in_flight
                .entry(chosen.id.clone())
                .or_insert_with(|| Arc::new(AtomicU64::new(0)))
                .clone();
            counter.fetch_add(1, Ordering::AcqRel);

            if permit.is_trial() {
                tracing::info!(endpoint=%chosen.id, "routing half-open trial request");
            }
            return Ok(Selection {
                endpoint: chosen.clone(),
                permit,
                _in_flight: InFlight(counter),
            });
        }
    }

    /// Post-call hook: the only place circuit state moves on call outcomes.
    pub fn record_outcome(&self, selection: Selection, success: bool) {
        self.record_outcome_at(selection, success, now_ms());
    }

    pub fn record_outcome_at(&self, selection: Selection, success: bool, now_ms: u64) {
        let Selection { permit, .. } = selection;
        self.breakers.record(permit, success, now_ms);
    }

    /// Drops per-endpoint routing state after an endpoint leaves its pool.
    pub fn forget_endpoint(&self, endpoint_id: &str) {
        self.breakers.forget(endpoint_id);
        self.in_flight.remove(endpoint_id);
    }
}
