use quasar_common::EngineType;

use super::{Engine, EngineContext, DRAFT_MOUNT, MODEL_MOUNT};

pub const VLLM_IMAGE: &str = "vllm/vllm-openai:latest";
const VLLM_PORT: u16 = 8000;

pub struct VllmEngine;

impl Engine for VllmEngine {
    fn engine_type(&self) -> EngineType {
        EngineType::Vllm
    }

    fn default_image(&self) -> &'static str {
        VLLM_IMAGE
    }

    fn container_port(&self) -> u16 {
        VLLM_PORT
    }

    fn engine_args(&self, ctx: &EngineContext<'_>) -> Vec<String> {
        let cfg = ctx.config;
        let mut vllm_args: Vec<String> = vec![
            "--model".into(),
            MODEL_MOUNT.into(),
            "--served-model-name".into(),
            cfg.served_name.clone(),
            "--host".into(),
            "0.0.0.0".into(),
            "--port".into(),
            VLLM_PORT.to_string(),
        ];
        if let Some(v) = cfg.context_length {
            vllm_args.push("--max-model-len".into());
            vllm_args.push(v.to_string());
        }
        if let Some(q) = cfg.quantization.as_deref() {
            vllm_args.push("--quantization".into());
            vllm_args.push(q.into());
        }
        if let Some(v) = cfg.gpu_memory_utilization {
            vllm_args.push("--gpu-memory-utilization".into());
            vllm_args.push(v.to_string());
        }
        if let Some(tp) = cfg.tensor_parallel_size {
            vllm_args.push("--tensor-parallel-size".into());
            vllm_args.push(tp.to_string());
        }
        if let Some(spec) = cfg.speculative.as_ref() {
            // Without a draft model fall back to n-gram prompt lookup.
            let json = if ctx.draft.is_some() {
                serde_json::json!({
                    "model": DRAFT_MOUNT,
                    "num_speculative_tokens": spec.num_speculative_tokens,
                })
            } else {
                serde_json::json!({
                    "method": "ngram",
                    "num_speculative_tokens": spec.num_speculative_tokens,
                    "prompt_lookup_max": 4,
                })
            };
            vllm_args.push("--speculative-config".into());
            vllm_args.push(json.to_string());
        }
        vllm_args.extend(cfg.extra_args.iter().cloned());
        vllm_args
    }
}
