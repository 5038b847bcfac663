use std::time::Duration;

use async_trait::async_trait;

#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// One check against `base_url`; true when the engine serves requests.
    async fn is_ready(&self, base_url: &str, path: &str) -> bool;
}

pub struct HttpReadiness {
    client: reqwest::Client,
}

impl HttpReadiness {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ReadinessProbe for HttpReadiness {
    async fn is_ready(&self, base_url: &str, path: &str) -> bool {
        let url = format!("{}{}", base_url.trim_end_matches('/'), path);
        match self
            .client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::trace!(%url, error = %e, "readiness check failed");
                false
            }
        }
    }
}

/// Exponential delay between readiness polls.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub factor: f64,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            factor: 1.5,
            max: Duration::from_secs(5),
        }
    }
}

impl Backoff {
    /// Delay before poll `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let scaled = self.initial.as_secs_f64() * self.factor.powi(attempt.min(64) as i32);
        Duration::from_secs_f64(scaled.min(self.max.as_secs_f64()))
    }
}
