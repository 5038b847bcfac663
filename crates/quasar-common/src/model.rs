use std::fmt;

use serde::{Deserialize, Serialize};

use crate::endpoint::PoolKind;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EngineType {
    #[serde(rename = "vllm")]
    Vllm,
    #[serde(rename = "llamacpp")]
    LlamaCpp,
}

impl EngineType {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineType::Vllm => "vllm",
            EngineType::LlamaCpp => "llamacpp",
        }
    }
}

impl fmt::Display for EngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpeculativeConfig {
    /// Draft model weights, resolved against the models base directory like `model_path`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft_model_path: Option<String>,

    #[serde(default = "default_speculative_tokens")]
    pub num_speculative_tokens: u32,
}

fn default_speculative_tokens() -> u32 {
    5
}

/// Durable description of one locally managed backend instance.
///
/// Owned by the admin layer; the orchestrator only reads it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    /// Registry key (e.g. "qwen2-5-7b"). Used in admin URLs and container names.
    pub id: String,

    pub engine_type: EngineType,

    /// Name clients put in the `model` field and the engine serves under.
    pub served_name: String,

    /// Weights location, relative to the models base directory unless absolute.
    /// A directory of safetensors for vLLM, a `.gguf` file (or the first part of a
    /// multi-part set) for llama.cpp.
    pub model_path: String,

    /// Which pool the running instance joins.
    #[serde(default)]
    pub pool: PoolKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_length: Option<u32>,

    /// vLLM quantization method ("awq", "gptq", "fp8", ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speculative: Option<SpeculativeConfig>,

    /// GGUF quantization type ("q4_k_m", "q8_0", "f16", ...). Inferred from the file
    /// name when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gguf_weight_format: Option<String>,

    /// Parameter count in billions. Read from the weights' `config.json` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param_count_b: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_memory_utilization: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tensor_parallel_size: Option<u32>,

    /// Host port; a free port is picked when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_image: Option<String>,

    /// Appended verbatim to the engine command line.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl ModelConfig {
    pub fn new(id: &str, engine_type: EngineType, model_path: &str) -> Self {
        Self {
            id: id.to_string(),
            engine_type,
            served_name: id.to_string(),
            model_path: model_path.to_string(),
            pool: PoolKind::Generate,
            context_length: None,
            quantization: None,
            speculative: None,
            gguf_weight_format: None,
            param_count_b: None,
            gpu_memory_utilization: None,
            tensor_parallel_size: None,
            port: None,
            docker_image: None,
            extra_args: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_deserializes_with_defaults() {
        let cfg: ModelConfig = serde_json::from_str(
            r#"{"id":"tiny","engine_type":"llamacpp","served_name":"tiny","model_path":"tiny.gguf"}"#,
        )
        .unwrap();
        assert_eq!(cfg.engine_type, EngineType::LlamaCpp);
        assert_eq!(cfg.pool, PoolKind::Generate);
        assert!(cfg.extra_args.is_empty());
        assert!(cfg.speculative.is_none());
    }

    #[test]
    fn speculative_defaults_token_count() {
        let spec: SpeculativeConfig = serde_json::from_str(r#"{"draft_model_path":"draft"}"#).unwrap();
        assert_eq!(spec.num_speculative_tokens, 5);
    }
}
