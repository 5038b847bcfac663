mod args;
mod config;
mod error;
mod handlers;
mod metrics;
mod proxy;
mod request_id;
mod sse;
mod state;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use anyhow::Context;
use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};
use clap::Parser;
use quasar_common::auth::{auth_middleware, parse_auth_from_env, AuthConfig};
use quasar_engine::{DockerCli, GpuInventory, HttpReadiness, NvidiaSmi, Orchestrator, StaticGpus};
use quasar_registry::{FileRegistry, LogUsageSink, MemoryRegistry, ModelRegistry, UsageSink};
use quasar_router::{parse_strategy, HealthProber, HealthState, HttpHealthProbe, Limiter, UpstreamPools};
use tokio_util::sync::CancellationToken;

use crate::args::Args;
use crate::config::GatewayConfig;
use crate::handlers::healthz;
use crate::metrics::{metrics_handler, track_requests, Metrics};
use crate::request_id::assign_request_id;
use crate::state::AppState;

pub(crate) fn build_app(st: AppState) -> Router {
    let inference = Router::new()
        .route("/v1/chat/completions", post(proxy::chat_completions))
        .route("/v1/completions", post(proxy::completions))
        .route("/v1/embeddings", post(proxy::embeddings))
        .route("/v1/models", get(handlers::v1_models));

    let admin = Router::new()
        .route("/upstreams", get(handlers::list_upstreams))
        .route("/upstreams/refresh-health", post(handlers::refresh_health))
        .route("/models", get(handlers::list_models))
        .route("/models/:id", put(handlers::put_model).delete(handlers::delete_model))
        .route("/models/:id/start", post(handlers::start_model))
        .route("/models/:id/stop", post(handlers::stop_model))
        .route("/models/:id/apply", post(handlers::apply_model))
        .route("/models/:id/dry-run", post(handlers::dry_run_model))
        .route("/models/:id/readiness", get(handlers::model_readiness))
        .route("/models/:id/logs", get(handlers::model_logs));

    let authed = inference
        .merge(admin)
        .layer(middleware::from_fn_with_state(st.clone(), auth_middleware::<AppState>));

    let public = Router::new()
        .route("/healthz", get(healthz))
        .route("/health", get(healthz))
        .route("/metrics", get(metrics_handler));

    public
        .merge(authed)
        .layer(middleware::from_fn_with_state(st.clone(), track_requests))
        .layer(middleware::from_fn(assign_request_id))
        .with_state(st)
}

async fn open_registry(cfg: &GatewayConfig) -> anyhow::Result<Arc<dyn ModelRegistry>> {
    Ok(match &cfg.registry_path {
        Some(path) => Arc::new(FileRegistry::open(path).await?),
        None => {
            tracing::warn!("no --registry-path given; model configs live in memory only");
            Arc::new(MemoryRegistry::new())
        }
    })
}

async fn build_state(cfg: &GatewayConfig, auth: AuthConfig) -> anyhow::Result<AppState> {
    let http = reqwest::Client::builder()
        .connect_timeout(cfg.connect_timeout)
        .timeout(cfg.upstream_timeout)
        .build()
        .context("build upstream http client")?;

    let pools = Arc::new(UpstreamPools::new(cfg.endpoints.clone()));
    let health = Arc::new(HealthState::new(cfg.health.ttl));
    let strategy = parse_strategy(&cfg.strategy).map_err(anyhow::Error::msg)?;
    let router = quasar_router::Router::new(pools.clone(), health.clone(), cfg.breaker.clone(), strategy);

    let probe_client = reqwest::Client::builder()
        .timeout(cfg.health.probe_timeout)
        .build()
        .context("build health probe client")?;
    let prober = HealthProber::new(
        pools,
        health,
        Arc::new(HttpHealthProbe::new(probe_client, &cfg.health.path)),
        cfg.health.clone(),
    );

    let registry = open_registry(cfg).await?;
    let gpus: Arc<dyn GpuInventory> = match cfg.gpu_total_mb {
        Some(mb) => Arc::new(StaticGpus::uniform(cfg.gpu_count, mb)),
        None => Arc::new(NvidiaSmi),
    };
    let orchestrator = Orchestrator::new(
        cfg.orchestrator.clone(),
        registry.clone(),
        Arc::new(DockerCli::new(cfg.docker_bin.clone())),
        Arc::new(HttpReadiness::new(http.clone())),
        gpus,
        router.clone(),
    );
    let usage: Arc<dyn UsageSink> = Arc::new(LogUsageSink);

    Ok(AppState {
        router,
        prober,
        limiter: Limiter::new(cfg.limiter.clone()),
        orchestrator,
        registry,
        usage,
        http,
        proxy: Arc::new(cfg.proxy.clone()),
        auth,
        metrics: Arc::new(Metrics::default()),
    })
}

async fn shutdown_signal(cancel: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        return;
    }
    tracing::info!("shutdown requested");
    cancel.cancel();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = GatewayConfig::from_args(&args).context("invalid configuration")?;

    let otel = quasar_common::telemetry::init_tracing(
        "quasar-gateway",
        cfg.otlp_endpoint.as_deref(),
        cfg.otlp_token.as_deref(),
        cfg.log_format,
    );

    let auth = parse_auth_from_env();
    let st = build_state(&cfg, auth).await?;

    let cancel = CancellationToken::new();
    let prober_task = st.prober.clone().spawn(cancel.child_token());
    let gc_task = st
        .limiter
        .clone()
        .spawn_gc(cfg.limiter.idle_ttl.min(std::time::Duration::from_secs(60)), cancel.child_token());
    let supervisor_task = st
        .orchestrator
        .spawn_supervisor(cfg.supervise_interval, cancel.child_token());

    let app = build_app(st.clone());
    let listener = tokio::net::TcpListener::bind(&cfg.listen_addr)
        .await
        .with_context(|| format!("bind {}", cfg.listen_addr))?;
    tracing::info!(
        addr = %cfg.listen_addr,
        endpoints = cfg.endpoints.len(),
        strategy = %cfg.strategy,
        "quasar gateway listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await
        .context("serve")?;

    cancel.cancel();
    let _ = tokio::join!(prober_task, gc_task, supervisor_task);

    if cfg.stop_models_on_exit {
        tracing::info!("stopping managed models");
        st.orchestrator.shutdown_all().await;
    }
    if let Some(provider) = otel {
        if let Err(e) = provider.shutdown() {
            tracing::warn!(error = %e, "failed to flush traces");
        }
    }
    Ok(())
}
