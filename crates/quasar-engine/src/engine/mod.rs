pub mod llamacpp;
pub mod vllm;

use std::collections::HashSet;

use quasar_common::{EngineType, ModelConfig};
use serde::Serialize;
use tokio::net::TcpListener;

use crate::validate::ResolvedWeights;

/// Container-side mount point for the model weights.
pub const MODEL_MOUNT: &str = "/model";
/// Container-side mount point for speculative draft weights.
pub const DRAFT_MOUNT: &str = "/draft";

/// Operator-level launch knobs that are not part of a model's config.
#[derive(Debug, Clone)]
pub struct LaunchSettings {
    /// First host port handed out when a model has no explicit `port`.
    pub port_base: u16,
    /// Value for `docker run --gpus`; `None` omits the flag.
    pub gpus: Option<String>,
    pub vllm_image: Option<String>,
    pub llamacpp_image: Option<String>,
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self {
            port_base: 18000,
            gpus: Some("all".to_string()),
            vllm_image: None,
            llamacpp_image: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mount {
    pub host: String,
    pub container: String,
    pub read_only: bool,
}

/// Fully resolved container invocation for one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchSpec {
    pub model_id: String,
    pub image: String,
    pub container_name: String,
    pub host_port: u16,
    pub container_port: u16,
    pub mounts: Vec<Mount>,
    pub env: Vec<(String, String)>,
    pub gpus: Option<String>,
    pub labels: Vec<(String, String)>,
    /// Arguments passed to the image entrypoint.
    pub args: Vec<String>,
}

impl LaunchSpec {
    /// Arguments for `docker`, starting at `run`.
    pub fn docker_args(&self) -> Vec<String> {
        let mut out: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            self.container_name.clone(),
        ];
        if let Some(gpus) = self.gpus.as_deref() {
            out.push("--gpus".into());
            out.push(gpus.to_string());
        }
        out.push("-p".into());
        out.push(format!("{}:{}", self.host_port, self.container_port));
        for m in &self.mounts {
            out.push("-v".into());
            if m.read_only {
                out.push(format!("{}:{}:ro", m.host, m.container));
            } else {
                out.push(format!("{}:{}", m.host, m.container));
            }
        }
        for (k, v) in &self.env {
            out.push("-e".into());
            out.push(format!("{k}={v}"));
        }
        for (k, v) in &self.labels {
            out.push("--label".into());
            out.push(format!("{k}={v}"));
        }
        out.push(self.image.clone());
        out.extend(self.args.iter().cloned());
        out
    }

    pub fn docker_argv(&self) -> Vec<String> {
        let mut argv = vec!["docker".to_string()];
        argv.extend(self.docker_args());
        argv
    }

    /// Copy-pasteable shell form of [`docker_argv`](Self::docker_argv).
    pub fn command_line(&self) -> String {
        self.docker_argv()
            .iter()
            .map(|a| shell_quote(a))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./:=,@%+".contains(&b));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Inputs to an engine's argument builder.
pub struct EngineContext<'a> {
    pub config: &'a ModelConfig,
    pub weights: &'a ResolvedWeights,
    pub draft: Option<&'a ResolvedWeights>,
    pub host_port: u16,
}

pub trait Engine: Send + Sync {
    fn engine_type(&self) -> EngineType;

    fn default_image(&self) -> &'static str;

    /// Port the server listens on inside the container.
    fn container_port(&self) -> u16;

    fn readiness_path(&self) -> &'static str {
        "/health"
    }

    /// Arguments for the engine server, in the order it should receive them.
    fn engine_args(&self, ctx: &EngineContext<'_>) -> Vec<String>;

    fn launch_spec(&self, ctx: &EngineContext<'_>, settings: &LaunchSettings) -> LaunchSpec {
        let cfg = ctx.config;
        let image = cfg
            .docker_image
            .clone()
            .or_else(|| match self.engine_type() {
                EngineType::Vllm => settings.vllm_image.clone(),
                EngineType::LlamaCpp => settings.llamacpp_image.clone(),
            })
            .unwrap_or_else(|| self.default_image().to_string());

        let mut mounts = vec![Mount {
            host: ctx.weights.mount_dir.display().to_string(),
            container: MODEL_MOUNT.to_string(),
            read_only: true,
        }];
        if let Some(draft) = ctx.draft {
            mounts.push(Mount {
                host: draft.mount_dir.display().to_string(),
                container: DRAFT_MOUNT.to_string(),
                read_only: true,
            });
        }

        LaunchSpec {
            model_id: cfg.id.clone(),
            image,
            container_name: container_name(&cfg.id),
            host_port: ctx.host_port,
            container_port: self.container_port(),
            mounts,
            env: vec![("HF_HUB_OFFLINE".to_string(), "1".to_string())],
            gpus: settings.gpus.clone(),
            labels: vec![
                ("quasar.model".to_string(), cfg.id.clone()),
                ("quasar.engine".to_string(), self.engine_type().to_string()),
            ],
            args: self.engine_args(ctx),
        }
    }
}

/// Container name for a model. Bytes docker rejects are written as `_xx` hex
/// and `_` itself as `__`, so distinct ids never share a container.
pub fn container_name(model_id: &str) -> String {
    let mut name = String::with_capacity(model_id.len() + 7);
    name.push_str("quasar-");
    for b in model_id.bytes() {
        match b {
            b'_' => name.push_str("__"),
            b if b.is_ascii_alphanumeric() || b == b'.' || b == b'-' => name.push(b as char),
            b => name.push_str(&format!("_{b:02x}")),
        }
    }
    name
}

/// First port in `[start, start + max_tries)` that is neither reserved nor bound.
pub async fn find_available_port(
    start_port: u16,
    max_tries: u16,
    reserved: &HashSet<u16>,
) -> anyhow::Result<u16> {
    let mut port = start_port;
    for _ in 0..max_tries {
        if !reserved.contains(&port) {
            if let Ok(listener) = TcpListener::bind(("0.0.0.0", port)).await {
                drop(listener);
                return Ok(port);
            }
        }
        port = match port.checked_add(1) {
            Some(p) => p,
            None => break,
        };
    }
    anyhow::bail!(
        "no available port found in range [{}, {}]",
        start_port,
        start_port.saturating_add(max_tries)
    );
}

pub fn create_engine(engine_type: EngineType) -> Box<dyn Engine> {
    match engine_type {
        EngineType::Vllm => Box::new(vllm::VllmEngine),
        EngineType::LlamaCpp => Box::new(llamacpp::LlamaCppEngine),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::validate::WeightsLayout;
    use std::path::PathBuf;

    pub(crate) fn weights(dir: &str, entry: Option<&str>) -> ResolvedWeights {
        ResolvedWeights {
            path: PathBuf::from(dir),
            layout: match entry {
                Some(_) => WeightsLayout::GgufFile,
                None => WeightsLayout::SafetensorsDir { shards: 1 },
            },
            mount_dir: PathBuf::from(dir),
            entry_file: entry.map(str::to_string),
            total_bytes: 0,
            arch: None,
        }
    }

    #[test]
    fn container_names_are_docker_safe() {
        assert_eq!(container_name("qwen2.5-7b"), "quasar-qwen2.5-7b");
        assert_eq!(container_name("org/model name"), "quasar-org_2fmodel_20name");
        assert_eq!(container_name("my_model"), "quasar-my__model");
    }

    #[test]
    fn distinct_ids_never_share_a_container() {
        let ids = ["org/m", "org-m", "org_m", "org_2fm", "org m", "org.m", "orgm"];
        let names: HashSet<String> = ids.iter().map(|id| container_name(id)).collect();
        assert_eq!(names.len(), ids.len());
    }

    #[test]
    fn docker_args_layout() {
        let cfg = ModelConfig::new("m1", EngineType::Vllm, "m1");
        let w = weights("/models/m1", None);
        let engine = create_engine(EngineType::Vllm);
        let spec = engine.launch_spec(
            &EngineContext {
                config: &cfg,
                weights: &w,
                draft: None,
                host_port: 18001,
            },
            &LaunchSettings::default(),
        );
        let args = spec.docker_args();
        assert_eq!(&args[..4], ["run", "-d", "--name", "quasar-m1"]);
        let joined = args.join(" ");
        assert!(joined.contains("--gpus all"));
        assert!(joined.contains("-p 18001:8000"));
        assert!(joined.contains("-v /models/m1:/model:ro"));
        assert!(joined.contains("--label quasar.model=m1"));
        let image_pos = args.iter().position(|a| a == &spec.image).unwrap();
        assert_eq!(args[image_pos + 1], "--model");
        assert!(spec.command_line().starts_with("docker run -d --name quasar-m1"));
    }

    #[test]
    fn image_precedence() {
        let mut cfg = ModelConfig::new("m1", EngineType::LlamaCpp, "m1.gguf");
        let w = weights("/models", Some("m1.gguf"));
        let engine = create_engine(EngineType::LlamaCpp);
        let ctx = |cfg: &ModelConfig, s: &LaunchSettings| {
            engine
                .launch_spec(
                    &EngineContext {
                        config: cfg,
                        weights: &w,
                        draft: None,
                        host_port: 1,
                    },
                    s,
                )
                .image
        };
        let mut settings = LaunchSettings::default();
        assert_eq!(ctx(&cfg, &settings), engine.default_image());
        settings.llamacpp_image = Some("local/llama:dev".into());
        assert_eq!(ctx(&cfg, &settings), "local/llama:dev");
        cfg.docker_image = Some("pinned:1".into());
        assert_eq!(ctx(&cfg, &settings), "pinned:1");
    }

    #[test]
    fn shell_quoting() {
        assert_eq!(shell_quote("--port"), "--port");
        assert_eq!(shell_quote(r#"{"a":1}"#), r#"'{"a":1}'"#);
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[tokio::test]
    async fn port_search_skips_reserved_and_bound() {
        let held = std::net::TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let busy = held.local_addr().unwrap().port();
        let mut reserved = HashSet::new();
        reserved.insert(busy.wrapping_add(1));
        let port = find_available_port(busy, 8, &reserved).await.unwrap();
        assert_ne!(port, busy);
        assert_ne!(port, busy.wrapping_add(1));
    }
}
