use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(author, version, about)]
pub struct Args {
    #[arg(long, env = "QUASAR_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Comma-separated base URLs of text-generation upstreams.
    #[arg(long, env = "QUASAR_GENERATE_POOL", default_value = "")]
    pub generate_pool: String,

    /// Comma-separated base URLs of embedding upstreams.
    #[arg(long, env = "QUASAR_EMBED_POOL", default_value = "")]
    pub embed_pool: String,

    /// Bearer token sent to static upstreams.
    #[arg(long, env = "QUASAR_UPSTREAM_TOKEN")]
    pub upstream_token: Option<String>,

    /// round_robin | least_in_flight
    #[arg(long, env = "ROUTING_STRATEGY", default_value = "round_robin")]
    pub routing_strategy: String,

    #[arg(long, env = "HEALTH_CHECK_TTL_SEC", default_value_t = 30)]
    pub health_check_ttl_sec: u64,

    #[arg(long, env = "HEALTH_POLL_SEC", default_value_t = 10)]
    pub health_poll_sec: u64,

    #[arg(long, env = "HEALTH_PATH", default_value = "/health")]
    pub health_path: String,

    #[arg(long, env = "HEALTH_TIMEOUT_MS", default_value_t = 3000)]
    pub health_timeout_ms: u64,

    #[arg(long, env = "HEALTH_UNHEALTHY_THRESHOLD", default_value_t = 3)]
    pub health_unhealthy_threshold: u32,

    #[arg(long, env = "CB_FAILURE_THRESHOLD", default_value_t = 5)]
    pub cb_failure_threshold: u32,

    #[arg(long, env = "CB_COOLDOWN_SEC", default_value_t = 30)]
    pub cb_cooldown_sec: u64,

    /// token_bucket | sliding_window | off
    #[arg(long, env = "RATE_LIMIT_MODE", default_value = "token_bucket")]
    pub rate_limit_mode: String,

    #[arg(long, env = "RATE_LIMIT_RPS", default_value_t = 10.0)]
    pub rate_limit_rps: f64,

    #[arg(long, env = "RATE_LIMIT_BURST", default_value_t = 20)]
    pub rate_limit_burst: u32,

    #[arg(long, env = "RATE_LIMIT_WINDOW_SEC", default_value_t = 60)]
    pub rate_limit_window_sec: u64,

    #[arg(long, env = "RATE_LIMIT_MAX_REQUESTS", default_value_t = 600)]
    pub rate_limit_max_requests: u32,

    /// 0 disables the cap.
    #[arg(long, env = "MAX_CONCURRENT_STREAMS_PER_ID", default_value_t = 8)]
    pub max_concurrent_streams_per_id: u32,

    #[arg(long, env = "LIMITER_IDLE_SEC", default_value_t = 600)]
    pub limiter_idle_sec: u64,

    #[arg(long, env = "TOKEN_ESTIMATION_ENABLED", default_value_t = true, action = clap::ArgAction::Set)]
    pub token_estimation_enabled: bool,

    #[arg(long, env = "CHARS_PER_TOKEN", default_value_t = 4.0)]
    pub chars_per_token: f64,

    #[arg(long, env = "MAX_BODY_BYTES", default_value_t = 10 * 1024 * 1024)]
    pub max_body_bytes: usize,

    #[arg(long, env = "UPSTREAM_CONNECT_TIMEOUT_SEC", default_value_t = 3)]
    pub upstream_connect_timeout_sec: u64,

    #[arg(long, env = "UPSTREAM_TIMEOUT_SEC", default_value_t = 300)]
    pub upstream_timeout_sec: u64,

    /// Pause before the single retry on another endpoint.
    #[arg(long, env = "RETRY_BACKOFF_MS", default_value_t = 50)]
    pub retry_backoff_ms: u64,

    #[arg(long, env = "MODELS_BASE_DIR", default_value = "/models")]
    pub models_base_dir: PathBuf,

    /// JSON file holding model configs. In-memory registry when unset.
    #[arg(long, env = "QUASAR_REGISTRY_PATH")]
    pub registry_path: Option<PathBuf>,

    #[arg(long, env = "DOCKER_BIN", default_value = "docker")]
    pub docker_bin: String,

    #[arg(long, env = "ENGINE_PORT_BASE", default_value_t = 18000)]
    pub engine_port_base: u16,

    /// Host the gateway uses to reach engine containers.
    #[arg(long, env = "ENGINE_HOST", default_value = "127.0.0.1")]
    pub engine_host: String,

    /// Value for `docker run --gpus`. Empty runs without GPUs.
    #[arg(long, env = "ENGINE_GPUS", default_value = "all")]
    pub engine_gpus: String,

    #[arg(long, env = "VLLM_IMAGE")]
    pub vllm_image: Option<String>,

    #[arg(long, env = "LLAMACPP_IMAGE")]
    pub llamacpp_image: Option<String>,

    #[arg(long, env = "ENGINE_READY_TIMEOUT_SEC", default_value_t = 600)]
    pub engine_ready_timeout_sec: u64,

    #[arg(long, env = "ENGINE_STOP_GRACE_SEC", default_value_t = 10)]
    pub engine_stop_grace_sec: u64,

    #[arg(long, env = "ENGINE_LOG_TAIL", default_value_t = 200)]
    pub engine_log_tail: usize,

    #[arg(long, env = "ENGINE_SUPERVISE_SEC", default_value_t = 5)]
    pub engine_supervise_sec: u64,

    #[arg(long, env = "VRAM_SAFETY_MARGIN", default_value_t = 0.9)]
    pub vram_safety_margin: f64,

    /// Per-device memory for hosts without nvidia-smi.
    #[arg(long, env = "GPU_TOTAL_MB")]
    pub gpu_total_mb: Option<u64>,

    #[arg(long, env = "GPU_COUNT", default_value_t = 1)]
    pub gpu_count: u32,

    #[arg(long, env = "QUASAR_STOP_MODELS_ON_EXIT", default_value_t = false)]
    pub stop_models_on_exit: bool,

    /// text | json
    #[arg(long, env = "QUASAR_LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// OTLP/HTTP endpoint for trace export.
    #[arg(long, env = "QUASAR_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    #[arg(long, env = "QUASAR_OTLP_TOKEN")]
    pub otlp_token: Option<String>,
}
