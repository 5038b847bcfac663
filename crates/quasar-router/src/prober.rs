use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use quasar_common::{now_ms, Endpoint, HealthSnapshot, HealthStatus};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::health::HealthState;
use crate::pool::UpstreamPools;

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub ttl: Duration,
    pub poll_interval: Duration,
    pub probe_timeout: Duration,
    /// Consecutive failures before an endpoint is `unhealthy` rather than `degraded`.
    pub unhealthy_threshold: u32,
    pub path: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            poll_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(3),
            unhealthy_threshold: 3,
            path: "/health".to_string(),
        }
    }
}

/// One health check against one endpoint. Returns the observed latency.
#[async_trait::async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, endpoint: &Endpoint) -> Result<Duration, String>;
}

pub struct HttpHealthProbe {
    client: reqwest::Client,
    path: String,
}

impl HttpHealthProbe {
    pub fn new(client: reqwest::Client, path: &str) -> Self {
        Self {
            client,
            path: path.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, endpoint: &Endpoint) -> Result<Duration, String> {
        let started = Instant::now();
        let mut req = self.client.get(endpoint.url(&self.path));
        if let Some(token) = endpoint.auth_token.as_deref() {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await.map_err(|e| e.to_string())?;
        let status = resp.status();
        if status.is_success() {
            Ok(started.elapsed())
        } else {
            Err(format!("health check returned {status}"))
        }
    }
}

/// Applies one probe outcome to the previous snapshot.
pub fn next_snapshot(
    prev: Option<&HealthSnapshot>,
    outcome: Result<Duration, String>,
    now_ms: u64,
    unhealthy_threshold: u32,
) -> HealthSnapshot {
    match outcome {
        Ok(latency) => HealthSnapshot {
            status: HealthStatus::Healthy,
            last_checked_ms: now_ms,
            last_success_ms: Some(now_ms),
            latency_ms: Some(latency.as_millis() as u64),
            consecutive_failures: 0,
            last_error: None,
        },
        Err(err) => {
            let failures = prev
                .map(|p| p.consecutive_failures)
                .unwrap_or(0)
                .saturating_add(1);
            let status = if failures >= unhealthy_threshold {
                HealthStatus::Unhealthy
            } else {
                HealthStatus::Degraded
            };
            HealthSnapshot {
                status,
                last_checked_ms: now_ms,
                last_success_ms: prev.and_then(|p| p.last_success_ms),
                latency_ms: prev.and_then(|p| p.latency_ms),
                consecutive_failures: failures,
                last_error: Some(err),
            }
        }
    }
}

pub struct HealthProber {
    pools: Arc<UpstreamPools>,
    state: Arc<HealthState>,
    probe: Arc<dyn HealthProbe>,
    cfg: HealthConfig,
    cycle_lock: Mutex<()>,
}

impl HealthProber {
    pub fn new(
        pools: Arc<UpstreamPools>,
        state: Arc<HealthState>,
        probe: Arc<dyn HealthProbe>,
        cfg: HealthConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            pools,
            state,
            probe,
            cfg,
            cycle_lock: Mutex::new(()),
        })
    }

    /// Probes every endpoint concurrently and publishes one snapshot set.
    /// Cycles never overlap, so publications are ordered.
    pub async fn run_cycle(&self) -> usize {
        let _cycle = self.cycle_lock.lock().await;
        let endpoints = self.pools.all();
        let prev = self.state.snapshot();
        let timeout = self.cfg.probe_timeout;

        let outcomes = join_all(endpoints.iter().map(|ep| {
            let probe = self.probe.clone();
            async move {
                let outcome = match tokio::time::timeout(timeout, probe.probe(ep)).await {
                    Ok(res) => res,
                    Err(_) => Err(format!("health check timed out after {}ms", timeout.as_millis())),
                };
                (ep.id.clone(), outcome)
            }
        }))
        .await;

        let now = now_ms();
        let mut next = HashMap::with_capacity(outcomes.len());
        for (id, outcome) in outcomes {
            let before = prev.get(&id);
            let snap = next_snapshot(before, outcome, now, self.cfg.unhealthy_threshold);
            if before.map(|b| b.status) != Some(snap.status) {
                tracing::info!(
                    endpoint=%id,
                    status=?snap.status,
                    failures = snap.consecutive_failures,
                    error = snap.last_error.as_deref().unwrap_or(""),
                    "endpoint health changed"
                );
            }
            next.insert(id, snap);
        }

        let live: HashSet<String> = self.pools.all().iter().map(|e| e.id.clone()).collect();
        let probed = next.len();
        self.state.publish(next, &live);
        probed
    }

    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.cfg.poll_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("health prober stopped");
                        break;
                    }
                    _ = tick.tick() => {
                        let probed = self.run_cycle().await;
                        tracing::debug!(probed, "health cycle complete");
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use quasar_common::PoolKind;

    /// Fails for any endpoint whose URL contains "down"; sleeps for "slow".
    struct ScriptedProbe {
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self, endpoint: &Endpoint) -> Result<Duration, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if endpoint.base_url.contains("slow") {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            if endpoint.base_url.contains("down") {
                return Err("connection refused".into());
            }
            Ok(Duration::from_millis(2))
        }
    }

    fn setup(urls: &[&str]) -> (Arc<UpstreamPools>, Arc<HealthState>, Arc<HealthProber>) {
        let pools = Arc::new(UpstreamPools::new(
            urls.iter()
                .map(|u| Endpoint::from_config(PoolKind::Generate, u, None))
                .collect(),
        ));
        let state = Arc::new(HealthState::new(Duration::from_secs(30)));
        let cfg = HealthConfig {
            probe_timeout: Duration::from_millis(100),
            unhealthy_threshold: 2,
            ..HealthConfig::default()
        };
        let prober = HealthProber::new(
            pools.clone(),
            state.clone(),
            Arc::new(ScriptedProbe {
                calls: AtomicU32::new(0),
            }),
            cfg,
        );
        (pools, state, prober)
    }

    #[test]
    fn failure_counts_degrade_then_unhealthy() {
        let first = next_snapshot(None, Err("x".into()), 10, 3);
        assert_eq!(first.status, HealthStatus::Degraded);
        let second = next_snapshot(Some(&first), Err("x".into()), 20, 3);
        assert_eq!(second.status, HealthStatus::Degraded);
        let third = next_snapshot(Some(&second), Err("x".into()), 30, 3);
        assert_eq!(third.status, HealthStatus::Unhealthy);
        assert_eq!(third.consecutive_failures, 3);

        let ok = next_snapshot(Some(&third), Ok(Duration::from_millis(7)), 40, 3);
        assert_eq!(ok.status, HealthStatus::Healthy);
        assert_eq!(ok.consecutive_failures, 0);
        assert_eq!(ok.last_success_ms, Some(40));
        assert_eq!(ok.latency_ms, Some(7));
    }

    #[tokio::test]
    async fn slow_endpoint_does_not_hold_up_the_cycle() {
        let (pools, state, prober) = setup(&["http://up", "http://slow", "http://down"]);
        let started = Instant::now();
        assert_eq!(prober.run_cycle().await, 3);
        assert!(started.elapsed() < Duration::from_secs(2));

        let id = |u: &str| pools.all().into_iter().find(|e| e.base_url == u).unwrap().id.clone();
        assert_eq!(state.get(&id("http://up")).unwrap().status, HealthStatus::Healthy);
        let slow = state.get(&id("http://slow")).unwrap();
        assert_eq!(slow.status, HealthStatus::Degraded);
        assert!(slow.last_error.unwrap().contains("timed out"));

        prober.run_cycle().await;
        assert_eq!(state.get(&id("http://down")).unwrap().status, HealthStatus::Unhealthy);
        assert_eq!(state.cycles(), 2);
    }

    #[tokio::test]
    async fn removed_endpoints_leave_the_snapshot() {
        let (pools, state, prober) = setup(&["http://up", "http://other"]);
        prober.run_cycle().await;
        assert_eq!(state.snapshot().len(), 2);

        let other = pools.all()[1].id.clone();
        pools.remove(&other);
        prober.run_cycle().await;
        assert_eq!(state.snapshot().len(), 1);
        assert!(state.get(&other).is_none());
    }

    #[tokio::test]
    async fn spawned_loop_stops_on_cancel() {
        let (_pools, state, prober) = setup(&["http://up"]);
        let cancel = CancellationToken::new();
        let handle = prober.spawn(cancel.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert!(state.cycles() >= 1);
    }
}
