use std::sync::Arc;

use quasar_common::auth::AuthConfig;
use quasar_engine::Orchestrator;
use quasar_registry::{ModelRegistry, UsageSink};
use quasar_router::{HealthProber, Limiter, Router};

use crate::config::ProxyConfig;
use crate::metrics::Metrics;

#[derive(Clone)]
pub struct AppState {
    pub router: Arc<Router>,
    pub prober: Arc<HealthProber>,
    pub limiter: Arc<Limiter>,
    pub orchestrator: Arc<Orchestrator>,
    pub registry: Arc<dyn ModelRegistry>,
    pub usage: Arc<dyn UsageSink>,
    pub http: reqwest::Client,
    pub proxy: Arc<ProxyConfig>,
    pub auth: AuthConfig,
    pub metrics: Arc<Metrics>,
}

impl AsRef<AuthConfig> for AppState {
    fn as_ref(&self) -> &AuthConfig {
        &self.auth
    }
}
