//! Maps engine container logs to a known failure cause.

use quasar_common::{Diagnosis, DiagnosisKind};

const PORT_CONFLICT: &[&str] = &[
    "address already in use",
    "port is already allocated",
    "bind for 0.0.0.0",
    "couldn't bind http server socket",
    "failed to bind",
];

const OUT_OF_MEMORY: &[&str] = &[
    "cuda out of memory",
    "outofmemoryerror",
    "cuda error: out of memory",
    "cudamalloc failed",
    "failed to allocate",
    "not enough memory",
    "no available memory for the cache blocks",
    "is larger than the available kv cache memory",
    "insufficient memory",
];

const MISSING_WEIGHTS: &[&str] = &[
    "no such file or directory",
    "does not appear to have a file named",
    "failed to load model",
    "unable to load model",
    "error loading model",
    "is not a valid model identifier",
    "repository not found",
    "invalid magic",
    "not a gguf file",
];

fn matches(haystack: &str, needles: &[&str]) -> Option<String> {
    needles
        .iter()
        .find(|n| haystack.contains(*n))
        .map(|n| n.to_string())
}

fn last_meaningful_line(logs: &str) -> Option<&str> {
    logs.lines().rev().map(str::trim).find(|l| !l.is_empty())
}

/// Classifies `logs`. Port conflicts win over OOM since a failed bind often
/// prints allocator noise on the way down.
pub fn diagnose(logs: &str) -> Diagnosis {
    let lower = logs.to_ascii_lowercase();

    if let Some(hit) = matches(&lower, PORT_CONFLICT) {
        return Diagnosis {
            kind: DiagnosisKind::PortConflict,
            title: "Port conflict".to_string(),
            message: format!("the engine could not bind its port ({hit})"),
            suggested_fixes: vec![
                "set a different `port` in the model config".to_string(),
                "stop the process or container already using the port".to_string(),
            ],
        };
    }

    if let Some(hit) = matches(&lower, OUT_OF_MEMORY) {
        return Diagnosis {
            kind: DiagnosisKind::OutOfMemory,
            title: "GPU out of memory".to_string(),
            message: format!("the engine ran out of device memory ({hit})"),
            suggested_fixes: vec![
                "lower context_length".to_string(),
                "use a smaller quantization".to_string(),
                "increase tensor_parallel_size or free GPU memory".to_string(),
                "lower gpu_memory_utilization if other processes share the GPU".to_string(),
            ],
        };
    }

    if let Some(hit) = matches(&lower, MISSING_WEIGHTS) {
        return Diagnosis {
            kind: DiagnosisKind::MissingWeights,
            title: "Model weights not loadable".to_string(),
            message: format!("the engine could not find or read the weights ({hit})"),
            suggested_fixes: vec![
                "check model_path relative to the models base directory".to_string(),
                "run dry-run to validate the weights layout".to_string(),
            ],
        };
    }

    Diagnosis {
        kind: DiagnosisKind::Unknown,
        title: "Unrecognized failure".to_string(),
        message: last_meaningful_line(logs)
            .unwrap_or("container produced no logs")
            .to_string(),
        suggested_fixes: vec!["inspect the full container logs".to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_vllm_oom() {
        let d = diagnose(
            "INFO loading weights\n\
             torch.OutOfMemoryError: CUDA out of memory. Tried to allocate 2.00 GiB\n",
        );
        assert_eq!(d.kind, DiagnosisKind::OutOfMemory);
        assert!(!d.suggested_fixes.is_empty());
    }

    #[test]
    fn recognizes_llamacpp_missing_file() {
        let d = diagnose(
            "llama_model_load: error loading model: failed to open /model/x.gguf: No such file or directory\n",
        );
        assert_eq!(d.kind, DiagnosisKind::MissingWeights);
    }

    #[test]
    fn port_conflict_takes_priority() {
        let d = diagnose("ERROR: [Errno 98] error while attempting to bind: address already in use\nfailed to allocate\n");
        assert_eq!(d.kind, DiagnosisKind::PortConflict);
    }

    #[test]
    fn unknown_uses_last_line() {
        let d = diagnose("starting\nsegfault at 0x0\n\n");
        assert_eq!(d.kind, DiagnosisKind::Unknown);
        assert_eq!(d.message, "segfault at 0x0");
        assert_eq!(diagnose("").message, "container produced no logs");
    }
}
