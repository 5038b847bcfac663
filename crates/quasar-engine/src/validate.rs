//! Pre-flight checks shared by `dry-run` and `start`: weights path shape,
//! base-directory containment, launch command and a VRAM estimate.

use std::path::{Component, Path, PathBuf};

use quasar_common::{EngineType, ModelConfig};
use serde::{Deserialize, Serialize};

use crate::engine::{Engine, EngineContext, LaunchSettings, LaunchSpec};
use crate::gpu::GpuInfo;

const MIB: u64 = 1024 * 1024;
const DEFAULT_CONTEXT: u32 = 4096;
/// Fallback KV-cache footprint per token per billion parameters when the
/// architecture is unknown (GGUF files carry no config.json).
const KV_BYTES_PER_TOKEN_PER_B_PARAMS: f64 = 16_384.0;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("model path is empty")]
    EmptyPath,
    #[error("models base directory '{base}' is not accessible: {reason}")]
    BaseDir { base: String, reason: String },
    #[error("model path '{path}' does not exist")]
    NotFound { path: String },
    #[error("model path '{path}' escapes the models base directory")]
    EscapesBase { path: String },
    #[error("'{path}' is not a valid {expected}: {reason}")]
    WrongShape {
        path: String,
        expected: &'static str,
        reason: String,
    },
    #[error("multi-part GGUF set '{path}' is incomplete: missing part {missing} of {total}")]
    IncompleteGguf { path: String, missing: u32, total: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WeightsLayout {
    SafetensorsDir { shards: usize },
    GgufFile,
    GgufMultiPart { parts: u32 },
}

/// Architecture fields read from a Hugging Face `config.json`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ArchInfo {
    pub hidden_size: Option<u64>,
    pub num_hidden_layers: Option<u64>,
    pub num_attention_heads: Option<u64>,
    pub num_key_value_heads: Option<u64>,
    pub head_dim: Option<u64>,
    pub intermediate_size: Option<u64>,
    pub vocab_size: Option<u64>,
    pub max_position_embeddings: Option<u32>,
    #[serde(default)]
    pub tie_word_embeddings: bool,
}

impl ArchInfo {
    fn head_dim(&self) -> Option<u64> {
        self.head_dim.or_else(|| {
            let heads = self.num_attention_heads.filter(|h| *h > 0)?;
            Some(self.hidden_size? / heads)
        })
    }

    fn kv_heads(&self) -> Option<u64> {
        self.num_key_value_heads.or(self.num_attention_heads)
    }

    /// Dense decoder parameter count; `None` when a field is missing.
    pub fn param_count(&self) -> Option<u64> {
        let h = self.hidden_size?;
        let layers = self.num_hidden_layers?;
        let heads = self.num_attention_heads?;
        let inter = self.intermediate_size?;
        let vocab = self.vocab_size?;
        let head_dim = self.head_dim()?;
        let kv_heads = self.kv_heads()?;

        let q_and_o = 2 * h * heads * head_dim;
        let k_and_v = 2 * h * kv_heads * head_dim;
        let mlp = 3 * h * inter;
        let embeddings = vocab * h * if self.tie_word_embeddings { 1 } else { 2 };
        Some(layers * (q_and_o + k_and_v + mlp) + embeddings)
    }

    /// Bytes of fp16 K and V per token across all layers.
    pub fn kv_bytes_per_token(&self) -> Option<u64> {
        Some(2 * self.num_hidden_layers? * self.kv_heads()? * self.head_dim()? * 2)
    }
}

/// A weights location that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedWeights {
    pub path: PathBuf,
    pub layout: WeightsLayout,
    /// Host directory mounted into the container.
    pub mount_dir: PathBuf,
    /// File inside `mount_dir` the engine loads (first part for multi-part GGUF).
    pub entry_file: Option<String>,
    pub total_bytes: u64,
    pub arch: Option<ArchInfo>,
}

fn display(p: &Path) -> String {
    p.display().to_string()
}

/// Lexically resolves `.` and `..`; used only when the path does not exist.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Resolves `raw` against `base_dir` and checks it has the shape `engine` loads.
pub fn resolve_weights(
    base_dir: &Path,
    raw: &str,
    engine: EngineType,
) -> Result<ResolvedWeights, ValidationError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ValidationError::EmptyPath);
    }
    let base = base_dir
        .canonicalize()
        .map_err(|e| ValidationError::BaseDir {
            base: display(base_dir),
            reason: e.to_string(),
        })?;

    let candidate = if Path::new(raw).is_absolute() {
        PathBuf::from(raw)
    } else {
        base.join(raw)
    };

    let canonical = match candidate.canonicalize() {
        Ok(p) => p,
        Err(_) => {
            if !normalize(&candidate).starts_with(&base) {
                return Err(ValidationError::EscapesBase { path: raw.to_string() });
            }
            return Err(ValidationError::NotFound { path: raw.to_string() });
        }
    };
    // Canonical comparison also catches symlinks pointing outside the base.
    if !canonical.starts_with(&base) {
        return Err(ValidationError::EscapesBase { path: raw.to_string() });
    }

    match engine {
        EngineType::Vllm => safetensors_dir(canonical),
        EngineType::LlamaCpp => gguf(canonical),
    }
}

fn file_size(p: &Path) -> u64 {
    std::fs::metadata(p).map(|m| m.len()).unwrap_or(0)
}

fn safetensors_dir(dir: PathBuf) -> Result<ResolvedWeights, ValidationError> {
    let shape_err = |reason: String| ValidationError::WrongShape {
        path: display(&dir),
        expected: "safetensors model directory",
        reason,
    };
    if !dir.is_dir() {
        return Err(shape_err("not a directory".into()));
    }

    let entries = std::fs::read_dir(&dir).map_err(|e| shape_err(e.to_string()))?;
    let mut shards = 0usize;
    let mut total_bytes = 0u64;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("safetensors") {
            shards += 1;
            total_bytes += file_size(&path);
        }
    }
    if shards == 0 {
        return Err(shape_err("no .safetensors files found".into()));
    }

    let index = dir.join("model.safetensors.index.json");
    if index.is_file() {
        let raw = std::fs::read(&index).map_err(|e| shape_err(e.to_string()))?;
        let parsed: serde_json::Value = serde_json::from_slice(&raw)
            .map_err(|e| shape_err(format!("unreadable model.safetensors.index.json: {e}")))?;
        if let Some(map) = parsed.get("weight_map").and_then(|m| m.as_object()) {
            let mut files: Vec<&str> = map.values().filter_map(|v| v.as_str()).collect();
            files.sort_unstable();
            files.dedup();
            if let Some(missing) = files.iter().find(|f| !dir.join(f).is_file()) {
                return Err(shape_err(format!("shard '{missing}' listed in the index is missing")));
            }
        }
    }

    let config = dir.join("config.json");
    if !config.is_file() {
        return Err(shape_err("config.json not found".into()));
    }
    let arch = std::fs::read(&config)
        .ok()
        .and_then(|raw| serde_json::from_slice::<ArchInfo>(&raw).ok());

    Ok(ResolvedWeights {
        mount_dir: dir.clone(),
        path: dir,
        layout: WeightsLayout::SafetensorsDir { shards },
        entry_file: None,
        total_bytes,
        arch,
    })
}

/// Splits `name-00002-of-00005` into (`name`, 2, 5, digit width).
fn split_part_suffix(stem: &str) -> Option<(&str, u32, u32, usize)> {
    let (head, total) = stem.rsplit_once("-of-")?;
    let (prefix, part) = head.rsplit_once('-')?;
    if part.is_empty() || total.is_empty() {
        return None;
    }
    if !part.bytes().all(|b| b.is_ascii_digit()) || !total.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let part_n: u32 = part.parse().ok()?;
    let total_n: u32 = total.parse().ok()?;
    if part_n == 0 || total_n == 0 || part_n > total_n {
        return None;
    }
    Some((prefix, part_n, total_n, part.len()))
}

fn gguf(path: PathBuf) -> Result<ResolvedWeights, ValidationError> {
    let shape_err = |reason: &str| ValidationError::WrongShape {
        path: display(&path),
        expected: "GGUF file",
        reason: reason.to_string(),
    };
    if path.is_dir() {
        return Err(shape_err("is a directory, point at the .gguf file"));
    }
    let is_gguf = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("gguf"))
        .unwrap_or(false);
    if !is_gguf {
        return Err(shape_err("file extension is not .gguf"));
    }

    let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();

    let (layout, entry, total_bytes) = match split_part_suffix(stem) {
        Some((prefix, _, total, width)) => {
            let mut bytes = 0u64;
            for i in 1..=total {
                let part = dir.join(format!("{prefix}-{i:0width$}-of-{total:0width$}.gguf"));
                if !part.is_file() {
                    return Err(ValidationError::IncompleteGguf {
                        path: display(&path),
                        missing: i,
                        total,
                    });
                }
                bytes += file_size(&part);
            }
            let first = format!("{prefix}-{:0width$}-of-{total:0width$}.gguf", 1);
            (WeightsLayout::GgufMultiPart { parts: total }, first, bytes)
        }
        None => {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            (WeightsLayout::GgufFile, name, file_size(&path))
        }
    };

    let mut magic = [0u8; 4];
    let header_ok = std::fs::File::open(dir.join(&entry))
        .and_then(|mut f| std::io::Read::read_exact(&mut f, &mut magic))
        .is_ok();
    if !header_ok || &magic != b"GGUF" {
        return Err(shape_err("missing GGUF magic header"));
    }

    Ok(ResolvedWeights {
        path,
        layout,
        mount_dir: dir,
        entry_file: Some(entry),
        total_bytes,
        arch: None,
    })
}

// ---------------------------------------------------------------------------
// VRAM estimate
// ---------------------------------------------------------------------------

/// Approximate storage per parameter for a vLLM quantization method.
pub fn bytes_per_param_for_quantization(quantization: Option<&str>) -> f64 {
    match quantization.map(|q| q.to_ascii_lowercase()) {
        None => 2.0,
        Some(q) => match q.as_str() {
            "fp8" | "int8" | "w8a8" | "fbgemm_fp8" | "experts_int8" => 1.0,
            "awq" | "awq_marlin" | "gptq" | "gptq_marlin" | "marlin" | "bitsandbytes" | "compressed-tensors" => 0.5625,
            "fp32" => 4.0,
            _ => 2.0,
        },
    }
}

/// Average bytes per parameter for a GGUF quantization type.
pub fn bytes_per_param_for_gguf(format: &str) -> f64 {
    let bits = match format.to_ascii_lowercase().as_str() {
        "f32" => 32.0,
        "f16" | "bf16" => 16.0,
        "q8_0" => 8.5,
        "q6_k" => 6.56,
        "q5_k_m" | "q5_k_s" | "q5_0" | "q5_1" => 5.5,
        "q4_k_m" => 4.85,
        "q4_k_s" | "q4_0" | "q4_1" | "iq4_xs" | "iq4_nl" => 4.5,
        "q3_k_l" | "q3_k_m" | "q3_k_s" => 3.9,
        "q2_k" | "iq2_xs" | "iq2_xxs" => 2.96,
        _ => 4.85,
    };
    bits / 8.0
}

/// Picks a quantization tag such as `Q4_K_M` out of a GGUF file name.
pub fn gguf_format_from_name(name: &str) -> Option<String> {
    const KNOWN: [&str; 20] = [
        "iq2_xxs", "iq2_xs", "iq4_xs", "iq4_nl", "q3_k_l", "q3_k_m", "q3_k_s", "q4_k_m", "q4_k_s",
        "q5_k_m", "q5_k_s", "q2_k", "q6_k", "q4_0", "q4_1", "q5_0", "q5_1", "q8_0", "bf16", "f16",
    ];
    let lower = name.to_ascii_lowercase();
    KNOWN
        .iter()
        .find(|k| lower.contains(*k))
        .map(|k| k.to_string())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VramEstimate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param_count_b: Option<f64>,
    pub bytes_per_param: f64,
    /// "config", "config.json" or "file_size".
    pub weights_basis: &'static str,
    pub context_length: u32,
    pub weights_mb: u64,
    pub kv_cache_mb: u64,
    pub draft_mb: u64,
    pub overhead_mb: u64,
    pub required_mb: u64,
    /// Summed total memory of the devices the engine will use.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_total_mb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usable_mb: Option<u64>,
    pub safety_margin: f64,
}

fn overhead_mb(engine: EngineType) -> u64 {
    match engine {
        EngineType::Vllm => 1536,
        EngineType::LlamaCpp => 512,
    }
}

pub fn estimate_vram(
    config: &ModelConfig,
    weights: &ResolvedWeights,
    draft: Option<&ResolvedWeights>,
    gpus: &[GpuInfo],
    default_margin: f64,
) -> VramEstimate {
    let arch = weights.arch.as_ref();

    let bytes_per_param = match config.engine_type {
        EngineType::Vllm => bytes_per_param_for_quantization(config.quantization.as_deref()),
        EngineType::LlamaCpp => {
            let format = config
                .gguf_weight_format
                .clone()
                .or_else(|| weights.entry_file.as_deref().and_then(gguf_format_from_name));
            bytes_per_param_for_gguf(format.as_deref().unwrap_or("q4_k_m"))
        }
    };

    let arch_params = arch.and_then(|a| a.param_count()).map(|p| p as f64 / 1e9);
    let (param_count_b, weights_bytes, weights_basis) =
        match (config.param_count_b, arch_params, config.engine_type) {
            (Some(b), _, _) => (Some(b), b * 1e9 * bytes_per_param, "config"),
            (None, Some(b), EngineType::Vllm) => (Some(b), b * 1e9 * bytes_per_param, "config.json"),
            (None, params, _) => (params, weights.total_bytes as f64, "file_size"),
        };

    let context_length = config
        .context_length
        .or_else(|| arch.and_then(|a| a.max_position_embeddings))
        .unwrap_or(DEFAULT_CONTEXT);
    let kv_per_token = arch
        .and_then(|a| a.kv_bytes_per_token())
        .map(|b| b as f64)
        .or_else(|| param_count_b.map(|b| b * KV_BYTES_PER_TOKEN_PER_B_PARAMS))
        .unwrap_or_else(|| {
            // Last resort: scale from on-disk size at ~4.85 bits/param.
            let approx_b = weights.total_bytes as f64 / (4.85 / 8.0) / 1e9;
            approx_b * KV_BYTES_PER_TOKEN_PER_B_PARAMS
        });
    let kv_bytes = kv_per_token * f64::from(context_length);

    let weights_mb = (weights_bytes / MIB as f64).ceil() as u64;
    let kv_cache_mb = (kv_bytes / MIB as f64).ceil() as u64;
    let draft_mb = draft.map(|d| d.total_bytes.div_ceil(MIB)).unwrap_or(0);
    let overhead_mb = overhead_mb(config.engine_type);
    let required_mb = weights_mb + kv_cache_mb + draft_mb + overhead_mb;

    let safety_margin = match config.engine_type {
        EngineType::Vllm => config
            .gpu_memory_utilization
            .map(f64::from)
            .unwrap_or(default_margin),
        EngineType::LlamaCpp => default_margin,
    };
    let devices = config.tensor_parallel_size.unwrap_or(1).max(1) as usize;
    let device_total_mb = if gpus.is_empty() {
        None
    } else {
        Some(gpus.iter().take(devices).map(|g| g.memory_total_mb).sum::<u64>())
    };
    let usable_mb = device_total_mb.map(|t| (t as f64 * safety_margin).floor() as u64);

    VramEstimate {
        param_count_b,
        bytes_per_param,
        weights_basis,
        context_length,
        weights_mb,
        kv_cache_mb,
        draft_mb,
        overhead_mb,
        required_mb,
        device_total_mb,
        usable_mb,
        safety_margin,
    }
}

// ---------------------------------------------------------------------------
// Dry-run report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningCategory {
    Vram,
    Gpu,
    Config,
}

/// Non-fatal finding. Never blocks a start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceWarning {
    pub severity: Severity,
    pub category: WarningCategory,
    pub title: String,
    pub message: String,
}

impl ResourceWarning {
    fn new(severity: Severity, category: WarningCategory, title: &str, message: String) -> Self {
        Self {
            severity,
            category,
            title: title.to_string(),
            message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeightsSummary {
    pub path: String,
    pub layout: WeightsLayout,
    pub size_mb: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DryRunReport {
    pub model_id: String,
    pub engine_type: EngineType,
    pub image: String,
    pub container_name: String,
    /// argv of the container runtime invocation.
    pub command: Vec<String>,
    pub command_line: String,
    pub weights: WeightsSummary,
    pub vram: VramEstimate,
    pub warnings: Vec<ResourceWarning>,
}

/// Everything `start` needs after validation passed.
#[derive(Debug, Clone)]
pub struct Preflight {
    pub weights: ResolvedWeights,
    pub draft: Option<ResolvedWeights>,
    pub vram: VramEstimate,
    pub warnings: Vec<ResourceWarning>,
}

pub fn preflight(
    config: &ModelConfig,
    base_dir: &Path,
    gpus: &[GpuInfo],
    safety_margin: f64,
) -> Result<Preflight, ValidationError> {
    let weights = resolve_weights(base_dir, &config.model_path, config.engine_type)?;
    let draft = match config
        .speculative
        .as_ref()
        .and_then(|s| s.draft_model_path.as_deref())
    {
        Some(p) => Some(resolve_weights(base_dir, p, config.engine_type)?),
        None => None,
    };
    let vram = estimate_vram(config, &weights, draft.as_ref(), gpus, safety_margin);
    let warnings = collect_warnings(config, &weights, &vram, gpus);
    Ok(Preflight {
        weights,
        draft,
        vram,
        warnings,
    })
}

fn collect_warnings(
    config: &ModelConfig,
    weights: &ResolvedWeights,
    vram: &VramEstimate,
    gpus: &[GpuInfo],
) -> Vec<ResourceWarning> {
    let mut out = Vec::new();

    match (vram.device_total_mb, vram.usable_mb) {
        (Some(total), _) if vram.required_mb > total => out.push(ResourceWarning::new(
            Severity::Critical,
            WarningCategory::Vram,
            "Model does not fit in device memory",
            format!(
                "estimated {} MiB required but the selected devices have {} MiB in total; \
                 reduce context_length, use a smaller quantization or add GPUs",
                vram.required_mb, total
            ),
        )),
        (Some(_), Some(usable)) if vram.required_mb > usable => out.push(ResourceWarning::new(
            Severity::Warning,
            WarningCategory::Vram,
            "VRAM estimate exceeds safety margin",
            format!(
                "estimated {} MiB required, {} MiB usable at {:.0}% of device memory",
                vram.required_mb,
                usable,
                vram.safety_margin * 100.0
            ),
        )),
        (None, _) => out.push(ResourceWarning::new(
            Severity::Info,
            WarningCategory::Gpu,
            "GPU memory unknown",
            "no GPU inventory available, VRAM check skipped".to_string(),
        )),
        _ => {}
    }

    if let Some(tp) = config.tensor_parallel_size {
        if !gpus.is_empty() && tp as usize > gpus.len() {
            out.push(ResourceWarning::new(
                Severity::Warning,
                WarningCategory::Gpu,
                "Tensor parallel size exceeds GPU count",
                format!("tensor_parallel_size={tp} but only {} GPU(s) detected", gpus.len()),
            ));
        }
    }

    if let (Some(ctx), Some(max)) = (
        config.context_length,
        weights.arch.as_ref().and_then(|a| a.max_position_embeddings),
    ) {
        if ctx > max {
            out.push(ResourceWarning::new(
                Severity::Warning,
                WarningCategory::Config,
                "Context length above model maximum",
                format!("context_length={ctx} exceeds max_position_embeddings={max}"),
            ));
        }
    }

    if config.engine_type == EngineType::LlamaCpp && config.quantization.is_some() {
        out.push(ResourceWarning::new(
            Severity::Info,
            WarningCategory::Config,
            "quantization is ignored for llama.cpp",
            "GGUF weights carry their own quantization; set gguf_weight_format instead".to_string(),
        ));
    }

    if let Some(spec) = config.speculative.as_ref() {
        if spec.draft_model_path.is_none() && config.engine_type == EngineType::LlamaCpp {
            out.push(ResourceWarning::new(
                Severity::Warning,
                WarningCategory::Config,
                "Speculative decoding without a draft model",
                "llama.cpp needs draft_model_path; speculative settings will be ignored".to_string(),
            ));
        }
    }

    out
}

/// Builds the dry-run preview. Uses the configured port or `settings.port_base`
/// so repeated calls with an unchanged config return the same command.
pub fn dry_run(
    config: &ModelConfig,
    engine: &dyn Engine,
    settings: &LaunchSettings,
    base_dir: &Path,
    gpus: &[GpuInfo],
    safety_margin: f64,
) -> Result<DryRunReport, ValidationError> {
    let pre = preflight(config, base_dir, gpus, safety_margin)?;
    let port = config.port.unwrap_or(settings.port_base);
    let spec: LaunchSpec = engine.launch_spec(
        &EngineContext {
            config,
            weights: &pre.weights,
            draft: pre.draft.as_ref(),
            host_port: port,
        },
        settings,
    );
    let command = spec.docker_argv();
    Ok(DryRunReport {
        model_id: config.id.clone(),
        engine_type: config.engine_type,
        image: spec.image.clone(),
        container_name: spec.container_name.clone(),
        command_line: spec.command_line(),
        command,
        weights: WeightsSummary {
            path: display(&pre.weights.path),
            layout: pre.weights.layout,
            size_mb: pre.weights.total_bytes.div_ceil(MIB),
        },
        vram: pre.vram,
        warnings: pre.warnings,
    })
}
