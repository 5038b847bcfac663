use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use quasar_common::UsageRecord;

use crate::types::UsageSink;

/// Emits each record as a structured `tracing` event under the `usage` target.
#[derive(Debug, Clone, Default)]
pub struct LogUsageSink;

impl UsageSink for LogUsageSink {
    fn record(&self, r: UsageRecord) {
        let usage = r.usage.unwrap_or_default();
        let completed_at = DateTime::<Utc>::from_timestamp_millis(r.completed_at_ms as i64)
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
            .unwrap_or_default();
        tracing::info!(
            target: "usage",
            request_id = %r.request_id,
            principal = %r.principal,
            model = %r.model,
            pool = %r.pool,
            endpoint = r.endpoint_id.as_deref().unwrap_or("-"),
            stream = r.stream,
            status = r.status,
            outcome = ?r.outcome,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            total_tokens = usage.total_tokens,
            usage_source = r.usage_source.map(|s| s.as_str()).unwrap_or("none"),
            ttft_ms = r.ttft_ms,
            latency_ms = r.latency_ms,
            chunks = r.chunks,
            completed_at = %completed_at,
            "request completed"
        );
    }
}

/// Keeps records in memory for inspection in tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryUsageSink {
    records: Arc<Mutex<Vec<UsageRecord>>>,
}

impl MemoryUsageSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<UsageRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl UsageSink for MemoryUsageSink {
    fn record(&self, record: UsageRecord) {
        if let Ok(mut guard) = self.records.lock() {
            guard.push(record);
        }
    }
}
