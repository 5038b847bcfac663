use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use quasar_common::telemetry::LogFormat;
use quasar_common::{Endpoint, PoolKind};
use quasar_engine::{LaunchSettings, OrchestratorSettings};
use quasar_router::{parse_strategy, BreakerConfig, HealthConfig, LimiterConfig, RateLimitPolicy};

use crate::args::Args;

/// Knobs of the inference proxy itself.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub max_body_bytes: usize,
    /// Total upstream attempts per request; the second one goes to a different endpoint.
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub token_estimation: bool,
    pub chars_per_token: f64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: 10 * 1024 * 1024,
            max_attempts: 2,
            retry_backoff: Duration::from_millis(50),
            token_estimation: true,
            chars_per_token: 4.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen_addr: String,
    pub endpoints: Vec<Endpoint>,
    pub strategy: String,
    pub health: HealthConfig,
    pub breaker: BreakerConfig,
    pub limiter: LimiterConfig,
    pub proxy: ProxyConfig,
    pub orchestrator: OrchestratorSettings,
    pub connect_timeout: Duration,
    pub upstream_timeout: Duration,
    pub registry_path: Option<PathBuf>,
    pub docker_bin: String,
    pub gpu_total_mb: Option<u64>,
    pub gpu_count: u32,
    pub supervise_interval: Duration,
    pub stop_models_on_exit: bool,
    pub log_format: LogFormat,
    pub otlp_endpoint: Option<String>,
    pub otlp_token: Option<String>,
}

impl GatewayConfig {
    pub fn from_args(args: &Args) -> Result<Self> {
        let token = args.upstream_token.clone().filter(|t| !t.is_empty());
        let mut endpoints = parse_pool(&args.generate_pool, PoolKind::Generate, token.clone())
            .context("QUASAR_GENERATE_POOL")?;
        endpoints.extend(parse_pool(&args.embed_pool, PoolKind::Embed, token).context("QUASAR_EMBED_POOL")?);

        if args.health_check_ttl_sec == 0 {
            bail!("HEALTH_CHECK_TTL_SEC must be positive");
        }
        if args.health_poll_sec == 0 || args.health_poll_sec >= args.health_check_ttl_sec {
            bail!(
                "HEALTH_POLL_SEC ({}) must be positive and shorter than HEALTH_CHECK_TTL_SEC ({})",
                args.health_poll_sec,
                args.health_check_ttl_sec
            );
        }
        if !args.health_path.starts_with('/') {
            bail!("HEALTH_PATH must start with '/'");
        }
        if args.health_unhealthy_threshold == 0 {
            bail!("HEALTH_UNHEALTHY_THRESHOLD must be positive");
        }
        if args.cb_failure_threshold == 0 {
            bail!("CB_FAILURE_THRESHOLD must be positive");
        }
        if args.cb_cooldown_sec == 0 {
            bail!("CB_COOLDOWN_SEC must be positive");
        }
        if !(args.chars_per_token > 0.0) {
            bail!("CHARS_PER_TOKEN must be positive");
        }
        if args.max_body_bytes == 0 {
            bail!("MAX_BODY_BYTES must be positive");
        }
        if !(args.vram_safety_margin > 0.0 && args.vram_safety_margin <= 1.0) {
            bail!("VRAM_SAFETY_MARGIN must be in (0, 1]");
        }
        if args.engine_supervise_sec == 0 {
            bail!("ENGINE_SUPERVISE_SEC must be positive");
        }
        parse_strategy(&args.routing_strategy).map_err(anyhow::Error::msg)?;

        let log_format = args.log_format.parse::<LogFormat>().map_err(anyhow::Error::msg)?;

        let orchestrator = OrchestratorSettings {
            models_base_dir: args.models_base_dir.clone(),
            launch: LaunchSettings {
                port_base: args.engine_port_base,
                gpus: Some(args.engine_gpus.trim().to_string()).filter(|g| !g.is_empty()),
                vllm_image: args.vllm_image.clone(),
                llamacpp_image: args.llamacpp_image.clone(),
            },
            engine_host: args.engine_host.clone(),
            readiness_timeout: Duration::from_secs(args.engine_ready_timeout_sec),
            stop_grace: Duration::from_secs(args.engine_stop_grace_sec),
            log_tail_lines: args.engine_log_tail,
            vram_safety_margin: args.vram_safety_margin,
            ..OrchestratorSettings::default()
        };

        Ok(Self {
            listen_addr: args.listen_addr.clone(),
            endpoints,
            strategy: args.routing_strategy.clone(),
            health: HealthConfig {
                ttl: Duration::from_secs(args.health_check_ttl_sec),
                poll_interval: Duration::from_secs(args.health_poll_sec),
                probe_timeout: Duration::from_millis(args.health_timeout_ms.max(1)),
                unhealthy_threshold: args.health_unhealthy_threshold,
                path: args.health_path.clone(),
            },
            breaker: BreakerConfig {
                failure_threshold: args.cb_failure_threshold,
                cooldown: Duration::from_secs(args.cb_cooldown_sec),
            },
            limiter: LimiterConfig {
                policy: parse_rate_policy(args)?,
                max_concurrent_streams: Some(args.max_concurrent_streams_per_id).filter(|n| *n > 0),
                idle_ttl: Duration::from_secs(args.limiter_idle_sec.max(1)),
            },
            proxy: ProxyConfig {
                max_body_bytes: args.max_body_bytes,
                retry_backoff: Duration::from_millis(args.retry_backoff_ms),
                token_estimation: args.token_estimation_enabled,
                chars_per_token: args.chars_per_token,
                ..ProxyConfig::default()
            },
            orchestrator,
            connect_timeout: Duration::from_secs(args.upstream_connect_timeout_sec.max(1)),
            upstream_timeout: Duration::from_secs(args.upstream_timeout_sec.max(1)),
            registry_path: args.registry_path.clone(),
            docker_bin: args.docker_bin.clone(),
            gpu_total_mb: args.gpu_total_mb,
            gpu_count: args.gpu_count,
            supervise_interval: Duration::from_secs(args.engine_supervise_sec),
            stop_models_on_exit: args.stop_models_on_exit,
            log_format,
            otlp_endpoint: args.otlp_endpoint.clone().filter(|s| !s.is_empty()),
            otlp_token: args.otlp_token.clone().filter(|s| !s.is_empty()),
        })
    }
}

fn parse_rate_policy(args: &Args) -> Result<RateLimitPolicy> {
    match args.rate_limit_mode.to_ascii_lowercase().as_str() {
        "token_bucket" | "bucket" => {
            if !(args.rate_limit_rps > 0.0) || args.rate_limit_burst == 0 {
                bail!("RATE_LIMIT_RPS and RATE_LIMIT_BURST must be positive");
            }
            Ok(RateLimitPolicy::TokenBucket {
                rps: args.rate_limit_rps,
                burst: args.rate_limit_burst,
            })
        }
        "sliding_window" | "window" => {
            if args.rate_limit_window_sec == 0 || args.rate_limit_max_requests == 0 {
                bail!("RATE_LIMIT_WINDOW_SEC and RATE_LIMIT_MAX_REQUESTS must be positive");
            }
            Ok(RateLimitPolicy::SlidingWindow {
                max_requests: args.rate_limit_max_requests,
                window: Duration::from_secs(args.rate_limit_window_sec),
            })
        }
        "off" | "disabled" | "none" => Ok(RateLimitPolicy::Disabled),
        other => bail!("unknown RATE_LIMIT_MODE '{other}' (expected token_bucket, sliding_window or off)"),
    }
}

/// Splits a comma-separated URL list into pool members. Duplicates are dropped.
pub fn parse_pool(raw: &str, pool: PoolKind, auth_token: Option<String>) -> Result<Vec<Endpoint>> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let url = reqwest::Url::parse(entry).with_context(|| format!("invalid upstream url '{entry}'"))?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            bail!("upstream url '{entry}' must be http(s) with a host");
        }
        let endpoint = Endpoint::from_config(pool, entry, auth_token.clone());
        if seen.insert(endpoint.id.clone()) {
            out.push(endpoint);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["quasar-gateway"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = GatewayConfig::from_args(&args(&[])).unwrap();
        assert!(cfg.endpoints.is_empty());
        assert_eq!(cfg.health.ttl, Duration::from_secs(30));
        assert_eq!(
            cfg.limiter.policy,
            RateLimitPolicy::TokenBucket { rps: 10.0, burst: 20 }
        );
        assert_eq!(cfg.proxy.max_attempts, 2);
        assert_eq!(cfg.orchestrator.launch.gpus.as_deref(), Some("all"));
    }

    #[test]
    fn pools_are_parsed_and_deduplicated() {
        let cfg = GatewayConfig::from_args(&args(&[
            "--generate-pool",
            "http://a:8000/, http://b:8000,http://a:8000",
            "--embed-pool",
            "http://e:9000",
            "--upstream-token",
            "secret",
        ]))
        .unwrap();
        let ids: Vec<&str> = cfg.endpoints.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["generate:http://a:8000", "generate:http://b:8000", "embed:http://e:9000"]
        );
        assert!(cfg.endpoints.iter().all(|e| e.auth_token.as_deref() == Some("secret")));
    }

    #[test]
    fn rejects_nonsense() {
        assert!(GatewayConfig::from_args(&args(&["--health-check-ttl-sec", "0"])).is_err());
        assert!(GatewayConfig::from_args(&args(&["--health-poll-sec", "30"])).is_err());
        assert!(GatewayConfig::from_args(&args(&["--cb-failure-threshold", "0"])).is_err());
        assert!(GatewayConfig::from_args(&args(&["--rate-limit-mode", "leaky"])).is_err());
        assert!(GatewayConfig::from_args(&args(&["--generate-pool", "ftp://x"])).is_err());
        assert!(GatewayConfig::from_args(&args(&["--routing-strategy", "random"])).is_err());
        assert!(GatewayConfig::from_args(&args(&["--log-format", "xml"])).is_err());
    }

    #[test]
    fn sliding_window_and_disabled_cap() {
        let cfg = GatewayConfig::from_args(&args(&[
            "--rate-limit-mode",
            "sliding_window",
            "--rate-limit-window-sec",
            "10",
            "--rate-limit-max-requests",
            "3",
            "--max-concurrent-streams-per-id",
            "0",
            "--engine-gpus",
            "",
        ]))
        .unwrap();
        assert_eq!(
            cfg.limiter.policy,
            RateLimitPolicy::SlidingWindow {
                max_requests: 3,
                window: Duration::from_secs(10)
            }
        );
        assert_eq!(cfg.limiter.max_concurrent_streams, None);
        assert_eq!(cfg.orchestrator.launch.gpus, None);
    }
}
