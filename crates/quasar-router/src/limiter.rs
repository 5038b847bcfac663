//! Per-client admission control: one rate policy plus a concurrent-stream cap.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
pub enum RateLimitPolicy {
    Disabled,
    /// Refills `rps` tokens per second up to `burst`.
    TokenBucket { rps: f64, burst: u32 },
    /// At most `max_requests` in any trailing `window`.
    SlidingWindow { max_requests: u32, window: Duration },
}

#[derive(Debug, Clone)]
pub struct LimiterConfig {
    pub policy: RateLimitPolicy,
    /// `None` disables the stream cap.
    pub max_concurrent_streams: Option<u32>,
    /// Idle clients with no open streams are evicted after this long.
    pub idle_ttl: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            policy: RateLimitPolicy::Disabled,
            max_concurrent_streams: None,
            idle_ttl: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LimitRejection {
    #[error("rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    #[error("too many concurrent streams (limit {limit})")]
    ConcurrencyLimitExceeded { limit: u32 },
}

/// Whole seconds for a `Retry-After` header, never zero.
pub fn retry_after_secs(d: Duration) -> u64 {
    d.as_secs_f64().ceil().max(1.0) as u64
}

#[derive(Debug)]
enum RateState {
    Bucket { tokens: f64, last_refill: Instant },
    Window { hits: VecDeque<Instant> },
    None,
}

#[derive(Debug)]
struct ClientState {
    rate: RateState,
    streams: Arc<AtomicU32>,
    last_seen: Instant,
}

/// Held for the lifetime of one streaming response. Dropping it frees the slot,
/// whichever way the response ends.
#[derive(Debug)]
pub struct StreamPermit {
    streams: Arc<AtomicU32>,
}

impl Drop for StreamPermit {
    fn drop(&mut self) {
        self.streams.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct Limiter {
    cfg: LimiterConfig,
    clients: DashMap<String, ClientState>,
    rate_rejected_total: AtomicU64,
    concurrency_rejected_total: AtomicU64,
}

impl Limiter {
    pub fn new(cfg: LimiterConfig) -> Arc<Self> {
        tracing::info!(
            policy = ?cfg.policy,
            max_concurrent_streams = cfg.max_concurrent_streams,
            "limiter initialized"
        );
        Arc::new(Self {
            cfg,
            clients: DashMap::new(),
            rate_rejected_total: AtomicU64::new(0),
            concurrency_rejected_total: AtomicU64::new(0),
        })
    }

    pub fn rate_rejected_total(&self) -> u64 {
        self.rate_rejected_total.load(Ordering::Relaxed)
    }

    pub fn concurrency_rejected_total(&self) -> u64 {
        self.concurrency_rejected_total.load(Ordering::Relaxed)
    }

    pub fn tracked_clients(&self) -> usize {
        self.clients.len()
    }

    fn new_client(&self, now: Instant) -> ClientState {
        let rate = match &self.cfg.policy {
            RateLimitPolicy::Disabled => RateState::None,
            RateLimitPolicy::TokenBucket { burst, .. } => RateState::Bucket {
                tokens: f64::from(*burst),
                last_refill: now,
            },
            RateLimitPolicy::SlidingWindow { .. } => RateState::Window {
                hits: VecDeque::new(),
            },
        };
        ClientState {
            rate,
            streams: Arc::new(AtomicU32::new(0)),
            last_seen: now,
        }
    }

    pub fn check_rate(&self, client_key: &str) -> Result<(), LimitRejection> {
        self.check_rate_at(client_key, Instant::now())
    }

    pub fn check_rate_at(&self, client_key: &str, now: Instant) -> Result<(), LimitRejection> {
        if self.cfg.policy == RateLimitPolicy::Disabled {
            return Ok(());
        }

        let mut entry = self
            .clients
            .entry(client_key.to_string())
            .or_insert_with(|| self.new_client(now));
        entry.last_seen = now;

        let verdict = match (&self.cfg.policy, &mut entry.rate) {
            (RateLimitPolicy::TokenBucket { rps, burst }, RateState::Bucket { tokens, last_refill }) => {
                let elapsed = now.saturating_duration_since(*last_refill).as_secs_f64();
                *tokens = (*tokens + elapsed * rps).min(f64::from(*burst));
                *last_refill = now;
                if *tokens >= 1.0 {
                    *tokens -= 1.0;
                    Ok(())
                } else {
                    let wait = if *rps > 0.0 { (1.0 - *tokens) / rps } else { 1.0 };
                    Err(Duration::from_secs_f64(wait))
                }
            }
            (RateLimitPolicy::SlidingWindow { max_requests, window }, RateState::Window { hits }) => {
                while let Some(front) = hits.front() {
                    if now.saturating_duration_since(*front) >= *window {
                        hits.pop_front();
                    } else {
                        break;
                    }
                }
                if (hits.len() as u32) < *max_requests {
                    hits.push_back(now);
                    Ok(())
                } else {
                    let oldest = hits.front().copied().unwrap_or(now);
                    Err(window.saturating_sub(now.saturating_duration_since(oldest)))
                }
            }
            _ => Ok(()),
        };

        verdict.map_err(|retry_after| {
            self.rate_rejected_total.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(client=%client_key, retry_after_ms = retry_after.as_millis() as u64, "rate limited");
            LimitRejection::RateLimited { retry_after }
        })
    }

    /// Reserves a streaming slot for `client_key`.
    pub fn acquire_stream(&self, client_key: &str) -> Result<Option<StreamPermit>, LimitRejection> {
        let Some(limit) = self.cfg.max_concurrent_streams else {
            return Ok(None);
        };
        let now = Instant::now();
        // The entry guard is held across the increment so eviction cannot interleave.
        let mut entry = self
            .clients
            .entry(client_key.to_string())
            .or_insert_with(|| self.new_client(now));
        entry.last_seen = now;

        let streams = entry.streams.clone();
        let mut current = streams.load(Ordering::Acquire);
        loop {
            if current >= limit {
                self.concurrency_rejected_total.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(client=%client_key, limit, "concurrent stream limit reached");
                return Err(LimitRejection::ConcurrencyLimitExceeded { limit });
            }
            match streams.compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        drop(entry);
        Ok(Some(StreamPermit { streams }))
    }

    pub fn active_streams(&self, client_key: &str) -> u32 {
        self.clients
            .get(client_key)
            .map(|c| c.streams.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Evicts idle clients without open streams. Returns how many were removed.
    pub fn gc(&self, now: Instant) -> usize {
        let before = self.clients.len();
        let ttl = self.cfg.idle_ttl;
        self.clients.retain(|_, c| {
            c.streams.load(Ordering::Acquire) > 0 || now.saturating_duration_since(c.last_seen) < ttl
        });
        before.saturating_sub(self.clients.len())
    }

    pub fn spawn_gc(self: Arc<Self>, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        let evicted = self.gc(Instant::now());
                        if evicted > 0 {
                            tracing::debug!(evicted, remaining = self.clients.len(), "limiter gc");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(policy: RateLimitPolicy, streams: Option<u32>) -> Arc<Limiter> {
        Limiter::new(LimiterConfig {
            policy,
            max_concurrent_streams: streams,
            idle_ttl: Duration::from_secs(60),
        })
    }

    #[test]
    fn burst_of_25_with_rps_10_burst_20_rejects_exactly_5() {
        let l = limiter(RateLimitPolicy::TokenBucket { rps: 10.0, burst: 20 }, None);
        let now = Instant::now();
        let rejected = (0..25)
            .filter(|_| l.check_rate_at("key", now).is_err())
            .count();
        assert_eq!(rejected, 5);
        assert_eq!(l.rate_rejected_total(), 5);
    }

    #[test]
    fn bucket_refills_over_time() {
        let l = limiter(RateLimitPolicy::TokenBucket { rps: 10.0, burst: 2 }, None);
        let t0 = Instant::now();
        assert!(l.check_rate_at("k", t0).is_ok());
        assert!(l.check_rate_at("k", t0).is_ok());
        match l.check_rate_at("k", t0) {
            Err(LimitRejection::RateLimited { retry_after }) => {
                assert!(retry_after <= Duration::from_millis(100));
                assert_eq!(retry_after_secs(retry_after), 1);
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
        assert!(l.check_rate_at("k", t0 + Duration::from_millis(100)).is_ok());
        assert!(l.check_rate_at("k", t0 + Duration::from_millis(100)).is_err());
    }

    #[test]
    fn sliding_window_counts_trailing_requests() {
        let l = limiter(
            RateLimitPolicy::SlidingWindow {
                max_requests: 3,
                window: Duration::from_secs(10),
            },
            None,
        );
        let t0 = Instant::now();
        for i in 0..3 {
            assert!(l.check_rate_at("k", t0 + Duration::from_secs(i)).is_ok());
        }
        let err = l.check_rate_at("k", t0 + Duration::from_secs(5)).unwrap_err();
        assert_eq!(
            err,
            LimitRejection::RateLimited {
                retry_after: Duration::from_secs(5)
            }
        );
        assert!(l.check_rate_at("k", t0 + Duration::from_secs(10)).is_ok());
        assert!(l.check_rate_at("other", t0).is_ok());
    }

    #[test]
    fn disabled_policy_admits_everything() {
        let l = limiter(RateLimitPolicy::Disabled, None);
        let now = Instant::now();
        assert!((0..1000).all(|_| l.check_rate_at("k", now).is_ok()));
        assert!(l.acquire_stream("k").unwrap().is_none());
    }

    #[test]
    fn stream_cap_admits_five_rejects_sixth_and_frees_on_drop() {
        let l = limiter(RateLimitPolicy::Disabled, Some(5));
        let mut permits: Vec<_> = (0..5).map(|_| l.acquire_stream("k").unwrap()).collect();
        assert_eq!(l.active_streams("k"), 5);
        assert_eq!(
            l.acquire_stream("k").unwrap_err(),
            LimitRejection::ConcurrencyLimitExceeded { limit: 5 }
        );

        permits.pop();
        assert_eq!(l.active_streams("k"), 4);
        assert!(l.acquire_stream("k").is_ok());
        assert!(l.acquire_stream("another").is_ok());
    }

    #[test]
    fn gc_keeps_clients_with_open_streams() {
        let l = limiter(RateLimitPolicy::TokenBucket { rps: 1.0, burst: 1 }, Some(2));
        let now = Instant::now();
        l.check_rate_at("idle", now).unwrap();
        let _held = l.acquire_stream("busy").unwrap();
        assert_eq!(l.tracked_clients(), 2);

        assert_eq!(l.gc(now + Duration::from_secs(3600)), 1);
        assert_eq!(l.tracked_clients(), 1);
        assert_eq!(l.active_streams("busy"), 1);
    }
}
