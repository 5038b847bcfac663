use quasar_common::EngineType;

use super::{Engine, EngineContext, DRAFT_MOUNT, MODEL_MOUNT};

pub const LLAMACPP_IMAGE: &str = "ghcr.io/ggml-org/llama.cpp:server-cuda";
const LLAMACPP_PORT: u16 = 8080;

/// llama.cpp `llama-server`. Offloads every layer to the GPU.
pub struct LlamaCppEngine;

impl Engine for LlamaCppEngine {
    fn engine_type(&self) -> EngineType {
        EngineType::LlamaCpp
    }

    fn default_image(&self) -> &'static str {
        LLAMACPP_IMAGE
    }

    fn container_port(&self) -> u16 {
        LLAMACPP_PORT
    }

    fn engine_args(&self, ctx: &EngineContext<'_>) -> Vec<String> {
        let cfg = ctx.config;
        let entry = ctx.weights.entry_file.as_deref().unwrap_or_default();
        let mut args: Vec<String> = vec![
            "-m".into(),
            format!("{MODEL_MOUNT}/{entry}"),
            "--alias".into(),
            cfg.served_name.clone(),
            "--host".into(),
            "0.0.0.0".into(),
            "--port".into(),
            LLAMACPP_PORT.to_string(),
        ];
        if let Some(ctx_len) = cfg.context_length {
            args.push("-c".into());
            args.push(ctx_len.to_string());
        }
        args.push("-ngl".into());
        args.push("999".into());

        if let (Some(spec), Some(draft)) = (cfg.speculative.as_ref(), ctx.draft) {
            let draft_entry = draft.entry_file.as_deref().unwrap_or_default();
            args.push("-md".into());
            args.push(format!("{DRAFT_MOUNT}/{draft_entry}"));
            args.push("-ngld".into());
            args.push("999".into());
            args.push("--draft-max".into());
            args.push(spec.num_speculative_tokens.to_string());
        }
        if cfg.pool == quasar_common::PoolKind::Embed {
            args.push("--embeddings".into());
        }
        args.extend(cfg.extra_args.iter().cloned());
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::weights;
    use quasar_common::{ModelConfig, PoolKind, SpeculativeConfig};

    #[test]
    fn builds_llama_server_args() {
        let mut cfg = ModelConfig::new("tiny", EngineType::LlamaCpp, "gguf/tiny-00001-of-00002.gguf");
        cfg.served_name = "tiny-chat".into();
        cfg.context_length = Some(4096);
        cfg.speculative = Some(SpeculativeConfig {
            draft_model_path: Some("gguf/draft.gguf".into()),
            num_speculative_tokens: 8,
        });
        let w = weights("/models/gguf", Some("tiny-00001-of-00002.gguf"));
        let d = weights("/models/gguf", Some("draft.gguf"));
        let args = LlamaCppEngine.engine_args(&EngineContext {
            config: &cfg,
            weights: &w,
            draft: Some(&d),
            host_port: 18000,
        });
        assert_eq!(
            args,
            [
                "-m",
                "/model/tiny-00001-of-00002.gguf",
                "--alias",
                "tiny-chat",
                "--host",
                "0.0.0.0",
                "--port",
                "8080",
                "-c",
                "4096",
                "-ngl",
                "999",
                "-md",
                "/draft/draft.gguf",
                "-ngld",
                "999",
                "--draft-max",
                "8",
            ]
        );
    }

    #[test]
    fn embed_pool_enables_embeddings() {
        let mut cfg = ModelConfig::new("emb", EngineType::LlamaCpp, "emb.gguf");
        cfg.pool = PoolKind::Embed;
        let w = weights("/models", Some("emb.gguf"));
        let args = LlamaCppEngine.engine_args(&EngineContext {
            config: &cfg,
            weights: &w,
            draft: None,
            host_port: 1,
        });
        assert!(args.contains(&"--embeddings".to_string()));
    }
}
