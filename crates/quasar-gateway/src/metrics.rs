use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    body::Body,
    extract::State,
    http::{header, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use quasar_common::{LifecycleState, RequestOutcome, UsageSource};

use crate::state::AppState;

#[derive(Debug, Default)]
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub requests_inflight: AtomicU64,
    pub status_2xx: AtomicU64,
    pub status_4xx: AtomicU64,
    pub status_5xx: AtomicU64,
    pub retry_total: AtomicU64,
    pub retry_success_total: AtomicU64,
    pub upstream_timeout_total: AtomicU64,
    pub upstream_connect_total: AtomicU64,
    pub upstream_5xx_total: AtomicU64,
    pub upstream_other_total: AtomicU64,
    pub body_too_large_total: AtomicU64,
    pub streams_completed_total: AtomicU64,
    pub streams_failed_total: AtomicU64,
    pub streams_cancelled_total: AtomicU64,
    pub usage_reported_total: AtomicU64,
    pub usage_estimated_total: AtomicU64,
    pub ttft_ms_sum: AtomicU64,
    pub ttft_count: AtomicU64,
    pub latency_ms_sum: AtomicU64,
    pub latency_count: AtomicU64,
}

impl Metrics {
    pub fn record_upstream_error(&self, kind: &str) {
        let counter = match kind {
            "timeout" => &self.upstream_timeout_total,
            "connect" => &self.upstream_connect_total,
            "status_5xx" => &self.upstream_5xx_total,
            _ => &self.upstream_other_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stream(&self, outcome: RequestOutcome) {
        let counter = match outcome {
            RequestOutcome::Completed => &self.streams_completed_total,
            RequestOutcome::Failed => &self.streams_failed_total,
            RequestOutcome::Cancelled => &self.streams_cancelled_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_usage_source(&self, source: Option<UsageSource>) {
        match source {
            Some(UsageSource::Reported) => self.usage_reported_total.fetch_add(1, Ordering::Relaxed),
            Some(UsageSource::Estimated) => self.usage_estimated_total.fetch_add(1, Ordering::Relaxed),
            None => 0,
        };
    }

    pub fn record_timing(&self, ttft_ms: Option<u64>, latency_ms: u64) {
        if let Some(t) = ttft_ms {
            self.ttft_ms_sum.fetch_add(t, Ordering::Relaxed);
            self.ttft_count.fetch_add(1, Ordering::Relaxed);
        }
        self.latency_ms_sum.fetch_add(latency_ms, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
    }
}

fn line(out: &mut String, name: &str, value: u64) {
    let _ = writeln!(out, "quasar_{name} {value}");
}

pub fn render(st: &AppState) -> String {
    let m = &st.metrics;
    let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
    let mut out = String::new();

    line(&mut out, "requests_total", load(&m.requests_total));
    line(&mut out, "requests_inflight", load(&m.requests_inflight));
    line(&mut out, "responses_2xx", load(&m.status_2xx));
    line(&mut out, "responses_4xx", load(&m.status_4xx));
    line(&mut out, "responses_5xx", load(&m.status_5xx));
    line(&mut out, "retry_total", load(&m.retry_total));
    line(&mut out, "retry_success_total", load(&m.retry_success_total));
    for (kind, counter) in [
        ("timeout", &m.upstream_timeout_total),
        ("connect", &m.upstream_connect_total),
        ("status_5xx", &m.upstream_5xx_total),
        ("other", &m.upstream_other_total),
    ] {
        let _ = writeln!(out, "quasar_upstream_errors_total{{kind=\"{kind}\"}} {}", load(counter));
    }
    line(&mut out, "body_too_large_total", load(&m.body_too_large_total));
    for (outcome, counter) in [
        ("completed", &m.streams_completed_total),
        ("failed", &m.streams_failed_total),
        ("cancelled", &m.streams_cancelled_total),
    ] {
        let _ = writeln!(out, "quasar_streams_total{{outcome=\"{outcome}\"}} {}", load(counter));
    }
    let _ = writeln!(out, "quasar_usage_records_total{{source=\"reported\"}} {}", load(&m.usage_reported_total));
    let _ = writeln!(out, "quasar_usage_records_total{{source=\"estimated\"}} {}", load(&m.usage_estimated_total));
    line(&mut out, "ttft_ms_sum", load(&m.ttft_ms_sum));
    line(&mut out, "ttft_ms_count", load(&m.ttft_count));
    line(&mut out, "latency_ms_sum", load(&m.latency_ms_sum));
    line(&mut out, "latency_ms_count", load(&m.latency_count));

    line(&mut out, "route_health_skipped_total", st.router.route_health_skipped_total());
    line(&mut out, "route_circuit_skipped_total", st.router.route_circuit_skipped_total());
    line(&mut out, "route_no_endpoint_total", st.router.route_no_endpoint_total());
    line(&mut out, "circuit_opened_total", st.router.breakers().opened_total());
    line(&mut out, "health_cycles_total", st.router.health().cycles());
    line(&mut out, "rate_limited_total", st.limiter.rate_rejected_total());
    line(&mut out, "concurrency_rejected_total", st.limiter.concurrency_rejected_total());
    line(&mut out, "limiter_tracked_clients", st.limiter.tracked_clients() as u64);
    let running = st
        .orchestrator
        .states()
        .iter()
        .filter(|s| s.state == LifecycleState::Running)
        .count();
    line(&mut out, "models_running", running as u64);
    for (state, count) in st.orchestrator.transitions_total() {
        let _ = writeln!(out, "quasar_lifecycle_transitions_total{{to=\"{state}\"}} {count}");
    }
    out
}

pub async fn metrics_handler(State(st): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        render(&st),
    )
}

pub async fn track_requests(
    State(st): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, std::convert::Infallible> {
    st.metrics.requests_inflight.fetch_add(1, Ordering::Relaxed);
    let resp = next.run(req).await;
    st.metrics.requests_inflight.fetch_sub(1, Ordering::Relaxed);
    st.metrics.requests_total.fetch_add(1, Ordering::Relaxed);

    let status = resp.status().as_u16();
    if status >= 500 {
        st.metrics.status_5xx.fetch_add(1, Ordering::Relaxed);
    } else if status >= 400 {
        st.metrics.status_4xx.fetch_add(1, Ordering::Relaxed);
    } else if status >= 200 {
        st.metrics.status_2xx.fetch_add(1, Ordering::Relaxed);
    }

    Ok(resp)
}
