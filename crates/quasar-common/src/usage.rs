use serde::{Deserialize, Serialize};

use crate::endpoint::PoolKind;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// Reads an OpenAI-style `usage` object. Embedding responses omit
    /// `completion_tokens`.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        let usage = value.get("usage")?;
        if usage.is_null() {
            return None;
        }
        let prompt = usage.get("prompt_tokens").and_then(|v| v.as_u64())?;
        let completion = usage
            .get("completion_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let total = usage
            .get("total_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(prompt + completion);
        Some(Self {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: total,
        })
    }
}

/// Whether the counts came from the upstream or from the chars-per-token heuristic.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UsageSource {
    Reported,
    Estimated,
}

impl UsageSource {
    pub fn as_str(self) -> &'static str {
        match self {
            UsageSource::Reported => "reported",
            UsageSource::Estimated => "estimated",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestOutcome {
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageRecord {
    pub request_id: String,
    pub principal: String,
    pub model: String,
    pub pool: PoolKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_id: Option<String>,
    pub stream: bool,
    pub status: u16,
    pub outcome: RequestOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_source: Option<UsageSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttft_ms: Option<u64>,
    pub latency_ms: u64,
    pub chunks: u64,
    pub completed_at_ms: u64,
}

/// Rough token count for `chars` characters of text.
pub fn estimate_tokens(chars: usize, chars_per_token: f64) -> u64 {
    if chars == 0 || chars_per_token <= 0.0 {
        return 0;
    }
    (chars as f64 / chars_per_token).ceil() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_reported_usage() {
        let body = serde_json::json!({
            "usage": {"prompt_tokens": 12, "completion_tokens": 30, "total_tokens": 42}
        });
        assert_eq!(Usage::from_json(&body), Some(Usage::new(12, 30)));
    }

    #[test]
    fn embedding_usage_has_no_completion() {
        let body = serde_json::json!({"usage": {"prompt_tokens": 7, "total_tokens": 7}});
        assert_eq!(Usage::from_json(&body), Some(Usage::new(7, 0)));
        assert_eq!(Usage::from_json(&serde_json::json!({"usage": null})), None);
        assert_eq!(Usage::from_json(&serde_json::json!({})), None);
    }

    #[test]
    fn estimate_rounds_up() {
        assert_eq!(estimate_tokens(0, 4.0), 0);
        assert_eq!(estimate_tokens(1, 4.0), 1);
        assert_eq!(estimate_tokens(8, 4.0), 2);
        assert_eq!(estimate_tokens(9, 4.0), 3);
    }
}
