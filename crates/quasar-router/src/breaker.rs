use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

fn decode(v: u8) -> CircuitState {
    match v {
        OPEN => CircuitState::Open,
        HALF_OPEN => CircuitState::HalfOpen,
        _ => CircuitState::Closed,
    }
}

#[derive(Debug, Default)]
struct EndpointCircuit {
    state: AtomicU8,
    failures: AtomicU32,
    opened_at_ms: AtomicU64,
    /// Set while the single half-open trial request is in flight.
    trial_in_flight: AtomicBool,
    /// Bumped on every open and close.
    generation: AtomicU64,
}

/// Admission ticket for one upstream call. Hand it back through the router's
/// post-call hook; dropping an unresolved trial frees the trial slot.
#[derive(Debug)]
pub struct BreakerPermit {
    endpoint_id: String,
    trial: bool,
    generation: u64,
    circuit: Arc<EndpointCircuit>,
    resolved: bool,
}

impl BreakerPermit {
    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    pub fn is_trial(&self) -> bool {
        self.trial
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if self.trial && !self.resolved {
            self.circuit.trial_in_flight.store(false, Ordering::Release);
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitView {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened_at_ms: Option<u64>,
    pub trial_in_flight: bool,
}

/// Per-endpoint circuit breakers.
///
/// State lives in atomics so admission checks on the hot path never take a
/// lock shared with unrelated endpoints.
pub struct CircuitBreakers {
    cfg: BreakerConfig,
    circuits: DashMap<String, Arc<EndpointCircuit>>,
    opened_total: AtomicU64,
}

impl CircuitBreakers {
    pub fn new(cfg: BreakerConfig) -> Self {
        Self {
            cfg,
            circuits: DashMap::new(),
            opened_total: AtomicU64::new(0),
        }
    }

    pub fn opened_total(&self) -> u64 {
        self.opened_total.load(Ordering::Relaxed)
    }

    fn circuit(&self, endpoint_id: &str) -> Arc<EndpointCircuit> {
        if let Some(c) = self.circuits.get(endpoint_id) {
            return c.clone();
        }
        self.circuits
            .entry(endpoint_id.to_string())
            .or_default()
            .clone()
    }

    fn cooled_down(&self, c: &EndpointCircuit, now_ms: u64) -> bool {
        now_ms.saturating_sub(c.opened_at_ms.load(Ordering::Acquire))
            >= self.cfg.cooldown.as_millis() as u64
    }

    pub fn view(&self, endpoint_id: &str) -> CircuitView {
        let Some(c) = self.circuits.get(endpoint_id).map(|c| c.clone()) else {
            return CircuitView {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at_ms: None,
                trial_in_flight: false,
            };
        };
        let state = decode(c.state.load(Ordering::Acquire));
        CircuitView {
            state,
            consecutive_failures: c.failures.load(Ordering::Acquire),
            opened_at_ms: (state != CircuitState::Closed).then(|| c.opened_at_ms.load(Ordering::Acquire)),
            trial_in_flight: c.trial_in_flight.load(Ordering::Acquire),
        }
    }

    /// Whether a request could be admitted right now, without claiming anything.
    pub fn is_selectable(&self, endpoint_id: &str, now_ms: u64) -> bool {
        let Some(c) = self.circuits.get(endpoint_id).map(|c| c.clone()) else {
            return true;
        };
        match c.state.load(Ordering::Acquire) {
            CLOSED => true,
            OPEN => self.cooled_down(&c, now_ms) && !c.trial_in_flight.load(Ordering::Acquire),
            _ => !c.trial_in_flight.load(Ordering::Acquire),
        }
    }

    /// Claims admission. Closed circuits always admit; an open circuit past its
    /// cooldown (or a half-open one) admits exactly one trial at a time.
    pub(crate) fn try_acquire(&self, endpoint_id: &str, now_ms: u64) -> Option<BreakerPermit> {
        let circuit = self.circuit(endpoint_id);
        let generation = circuit.generation.load(Ordering::Acquire);
        let trial = match circuit.state.load(Ordering::Acquire) {
            CLOSED => false,
            OPEN if !self.cooled_down(&circuit, now_ms) => return None,
            _ => {
                if circuit
                    .trial_in_flight
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    return None;
                }
                if circuit
                    .state
                    .compare_exchange(OPEN, HALF_OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    tracing::info!(endpoint=%endpoint_id, "circuit half-open, admitting trial request");
                }
                true
            }
        };
        Some(BreakerPermit {
            endpoint_id: endpoint_id.to_string(),
            trial,
            generation,
            circuit,
            resolved: false,
        })
    }

    /// Post-call transition. Only the router calls this.
    pub(crate) fn record(&self, mut permit: BreakerPermit, success: bool, now_ms: u64) {
        permit.resolved = true;
        let c = permit.circuit.clone();

        if permit.trial {
            if success {
                c.failures.store(0, Ordering::Release);
                c.generation.fetch_add(1, Ordering::AcqRel);
                c.state.store(CLOSED, Ordering::Release);
                tracing::info!(endpoint=%permit.endpoint_id, "circuit closed after successful trial");
            } else {
                c.opened_at_ms.store(now_ms, Ordering::Release);
                c.generation.fetch_add(1, Ordering::AcqRel);
                c.state.store(OPEN, Ordering::Release);
                self.opened_total.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(endpoint=%permit.endpoint_id, "trial request failed, circuit re-opened");
            }
            c.trial_in_flight.store(false, Ordering::Release);
            return;
        }

        // Outcomes of calls admitted under an earlier open/close cycle do not move it.
        if c.state.load(Ordering::Acquire) != CLOSED || c.generation.load(Ordering::Acquire) != permit.generation {
            return;
        }

        if success {
            c.failures.store(0, Ordering::Release);
            return;
        }

        let failures = c.failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures < self.cfg.failure_threshold {
            return;
        }
        // Stamp before publishing OPEN so no reader pairs OPEN with an old timestamp.
        c.opened_at_ms.store(now_ms, Ordering::Release);
        if c
            .state
            .compare_exchange(CLOSED, OPEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            c.failures.store(0, Ordering::Release);
            c.generation.fetch_add(1, Ordering::AcqRel);
            self.opened_total.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                endpoint=%permit.endpoint_id,
                failures,
                cooldown_ms = self.cfg.cooldown.as_millis() as u64,
                "circuit opened"
            );
        }
    }

    pub fn forget(&self, endpoint_id: &str) {
        self.circuits.remove(endpoint_id);
    }
}
