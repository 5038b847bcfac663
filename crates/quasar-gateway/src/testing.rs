//! In-process gateway and upstream servers for handler tests.

use std::convert::Infallible;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::header;
use axum::response::Response;
use bytes::Bytes;
use quasar_common::auth::parse_auth_tokens;
use quasar_common::{Endpoint, EngineType, ModelConfig, PoolKind, UsageRecord};
use quasar_engine::{
    Backoff, ContainerRuntime, ContainerStatus, LaunchSpec, Orchestrator, OrchestratorSettings, ReadinessProbe,
    StaticGpus,
};
use quasar_registry::{MemoryRegistry, MemoryUsageSink};
use quasar_router::{
    BreakerConfig, HealthConfig, HealthProber, HealthState, HttpHealthProbe, Limiter, LimiterConfig, RoundRobin,
    UpstreamPools,
};

use crate::config::ProxyConfig;
use crate::metrics::Metrics;
use crate::state::AppState;

pub struct Options {
    pub generate: Vec<String>,
    pub embed: Vec<String>,
    pub limiter: LimiterConfig,
    pub proxy: ProxyConfig,
    pub breaker: BreakerConfig,
    /// `token:role,...`; auth is disabled when `None`.
    pub auth: Option<&'static str>,
    pub models: Vec<ModelConfig>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            generate: Vec::new(),
            embed: Vec::new(),
            limiter: LimiterConfig::default(),
            proxy: ProxyConfig {
                retry_backoff: Duration::ZERO,
                ..ProxyConfig::default()
            },
            breaker: BreakerConfig::default(),
            auth: None,
            models: Vec::new(),
        }
    }
}

pub struct TestGateway {
    pub url: String,
    pub st: AppState,
    pub usage: MemoryUsageSink,
    pub client: reqwest::Client,
    pub models_dir: tempfile::TempDir,
}

impl TestGateway {
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.url, path)
    }

    pub async fn post_json(&self, path: &str, body: serde_json::Value) -> reqwest::Response {
        self.client.post(self.endpoint(path)).json(&body).send().await.unwrap()
    }

    /// Usage records are written when a stream ends, after the client saw the body.
    pub async fn wait_for_records(&self, n: usize) -> Vec<UsageRecord> {
        for _ in 0..200 {
            let records = self.usage.records();
            if records.len() >= n {
                return records;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {n} usage records, got {}", self.usage.records().len());
    }
}

/// Container runtime that reports every launched container as running.
#[derive(Default)]
pub struct NoopRuntime {
    live: std::sync::Mutex<Vec<String>>,
}

#[async_trait]
impl ContainerRuntime for NoopRuntime {
    async fn run(&self, spec: &LaunchSpec) -> anyhow::Result<()> {
        self.live.lock().unwrap().push(spec.container_name.clone());
        Ok(())
    }

    async fn status(&self, name: &str) -> anyhow::Result<ContainerStatus> {
        let running = self.live.lock().unwrap().iter().any(|n| n == name);
        Ok(if running {
            ContainerStatus::Running
        } else {
            ContainerStatus::NotFound
        })
    }

    async fn logs(&self, _name: &str, _tail: usize) -> anyhow::Result<String> {
        Ok("INFO engine ready\n".to_string())
    }

    async fn stop(&self, _name: &str, _grace: Duration) -> anyhow::Result<()> {
        Ok(())
    }

    async fn remove(&self, name: &str) -> anyhow::Result<()> {
        self.live.lock().unwrap().retain(|n| n != name);
        Ok(())
    }
}

pub struct AlwaysReady;

#[async_trait]
impl ReadinessProbe for AlwaysReady {
    async fn is_ready(&self, _base_url: &str, _path: &str) -> bool {
        true
    }
}

/// A vLLM-shaped weights directory under `base`.
pub fn write_safetensors(base: &Path, name: &str) {
    let dir = base.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("config.json"), b"{}").unwrap();
    std::fs::write(dir.join("model.safetensors"), [0u8; 1024]).unwrap();
}

pub fn vllm_model(id: &str, path: &str) -> ModelConfig {
    ModelConfig::new(id, EngineType::Vllm, path)
}

pub fn static_id(pool: PoolKind, url: &str) -> String {
    Endpoint::from_config(pool, url, None).id
}

/// Serves `app` on an ephemeral local port and returns its base URL.
pub async fn serve(app: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

pub fn port_of(url: &str) -> u16 {
    url.rsplit(':').next().unwrap().parse().unwrap()
}

pub fn sse_response(chunks: Vec<&'static str>, hang: bool) -> Response {
    let head = futures_util::stream::iter(
        chunks
            .into_iter()
            .map(|c| Ok::<_, Infallible>(Bytes::from_static(c.as_bytes()))),
    );
    let body = if hang {
        use futures_util::StreamExt;
        Body::from_stream(head.chain(futures_util::stream::pending()))
    } else {
        Body::from_stream(head)
    };
    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .body(body)
        .unwrap()
}

pub async fn spawn_gateway(opts: Options) -> TestGateway {
    let models_dir = tempfile::tempdir().unwrap();

    let mut endpoints: Vec<Endpoint> = opts
        .generate
        .iter()
        .map(|u| Endpoint::from_config(PoolKind::Generate, u, None))
        .collect();
    endpoints.extend(opts.embed.iter().map(|u| Endpoint::from_config(PoolKind::Embed, u, None)));

    let health_cfg = HealthConfig::default();
    let pools = Arc::new(UpstreamPools::new(endpoints));
    let health = Arc::new(HealthState::new(health_cfg.ttl));
    let router = quasar_router::Router::new(
        pools.clone(),
        health.clone(),
        opts.breaker.clone(),
        Box::new(RoundRobin::default()),
    );
    let http = reqwest::Client::new();
    let prober = HealthProber::new(
        pools,
        health,
        Arc::new(HttpHealthProbe::new(http.clone(), &health_cfg.path)),
        health_cfg,
    );

    let registry = Arc::new(MemoryRegistry::with_models(opts.models));
    let settings = OrchestratorSettings {
        models_base_dir: models_dir.path().to_path_buf(),
        readiness_timeout: Duration::from_secs(5),
        backoff: Backoff {
            initial: Duration::from_millis(5),
            factor: 2.0,
            max: Duration::from_millis(20),
        },
        ..OrchestratorSettings::default()
    };
    let orchestrator = Orchestrator::new(
        settings,
        registry.clone(),
        Arc::new(NoopRuntime::default()),
        Arc::new(AlwaysReady),
        Arc::new(StaticGpus::uniform(1, 81920)),
        router.clone(),
    );

    let usage = MemoryUsageSink::new();
    let st = AppState {
        router,
        prober,
        limiter: Limiter::new(opts.limiter),
        orchestrator,
        registry,
        usage: Arc::new(usage.clone()),
        http: http.clone(),
        proxy: Arc::new(opts.proxy),
        auth: parse_auth_tokens(opts.auth),
        metrics: Arc::new(Metrics::default()),
    };

    let url = serve(crate::build_app(st.clone())).await;
    TestGateway {
        url,
        st,
        usage,
        client: http,
        models_dir,
    }
}
