use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    #[default]
    Generate,
    Embed,
}

impl PoolKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PoolKind::Generate => "generate",
            PoolKind::Embed => "embed",
        }
    }
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PoolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "generate" => Ok(PoolKind::Generate),
            "embed" | "embedding" | "embeddings" => Ok(PoolKind::Embed),
            other => Err(format!("unknown pool kind '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EndpointSource {
    /// Listed in configuration at startup.
    Static,
    /// Brought up by the lifecycle orchestrator.
    Managed { model_id: String },
}

/// One upstream base URL. Endpoints are immutable; pools replace them wholesale.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub id: String,
    pub base_url: String,
    #[serde(default, skip_serializing)]
    pub auth_token: Option<String>,
    pub pool: PoolKind,
    pub source: EndpointSource,
}

impl Endpoint {
    pub fn from_config(pool: PoolKind, base_url: &str, auth_token: Option<String>) -> Self {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        Self {
            id: format!("{}:{}", pool, base_url),
            base_url,
            auth_token,
            pool,
            source: EndpointSource::Static,
        }
    }

    pub fn managed(pool: PoolKind, model_id: &str, base_url: &str) -> Self {
        Self {
            id: Self::managed_id(model_id),
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token: None,
            pool,
            source: EndpointSource::Managed {
                model_id: model_id.to_string(),
            },
        }
    }

    /// Pool id of the endpoint backing a managed model.
    pub fn managed_id(model_id: &str) -> String {
        format!("managed:{model_id}")
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub fn managed_model(&self) -> Option<&str> {
        match &self.source {
            EndpointSource::Managed { model_id } => Some(model_id),
            EndpointSource::Static => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub last_checked_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl HealthSnapshot {
    /// Status as consumers must see it: anything older than `ttl_ms` is `Unknown`.
    pub fn effective_status(&self, now_ms: u64, ttl_ms: u64) -> HealthStatus {
        if now_ms.saturating_sub(self.last_checked_ms) > ttl_ms {
            HealthStatus::Unknown
        } else {
            self.status
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(status: HealthStatus, last_checked_ms: u64) -> HealthSnapshot {
        HealthSnapshot {
            status,
            last_checked_ms,
            last_success_ms: Some(last_checked_ms),
            latency_ms: Some(3),
            consecutive_failures: 0,
            last_error: None,
        }
    }

    #[test]
    fn stale_snapshot_is_unknown() {
        let snap = snapshot(HealthStatus::Healthy, 1_000);
        assert_eq!(snap.effective_status(5_000, 10_000), HealthStatus::Healthy);
        assert_eq!(snap.effective_status(11_000, 10_000), HealthStatus::Healthy);
        assert_eq!(snap.effective_status(11_001, 10_000), HealthStatus::Unknown);
    }

    #[test]
    fn endpoint_ids_are_stable() {
        let a = Endpoint::from_config(PoolKind::Generate, "http://a:8000/", None);
        assert_eq!(a.base_url, "http://a:8000");
        assert_eq!(a.id, "generate:http://a:8000");
        assert_eq!(a.url("/v1/models"), "http://a:8000/v1/models");

        let m = Endpoint::managed(PoolKind::Embed, "bge", "http://127.0.0.1:9000");
        assert_eq!(m.id, "managed:bge");
        assert_eq!(m.managed_model(), Some("bge"));
    }

    #[test]
    fn pool_kind_parses_aliases() {
        assert_eq!("embeddings".parse::<PoolKind>().unwrap(), PoolKind::Embed);
        assert!("rerank".parse::<PoolKind>().is_err());
    }
}
