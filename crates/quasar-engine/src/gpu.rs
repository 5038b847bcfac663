use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GpuInfo {
    pub index: u32,
    pub name: String,
    pub memory_total_mb: u64,
    pub memory_used_mb: u64,
}

#[async_trait]
pub trait GpuInventory: Send + Sync {
    /// Empty when no device information is available.
    async fn gpus(&self) -> Vec<GpuInfo>;
}

/// Queries `nvidia-smi` on every call.
pub struct NvidiaSmi;

#[async_trait]
impl GpuInventory for NvidiaSmi {
    async fn gpus(&self) -> Vec<GpuInfo> {
        let output = Command::new("nvidia-smi")
            .arg("--query-gpu=index,name,memory.total,memory.used")
            .arg("--format=csv,noheader,nounits")
            .output()
            .await;

        let Ok(output) = output else {
            tracing::debug!("nvidia-smi not available");
            return Vec::new();
        };
        if !output.status.success() {
            return Vec::new();
        }
        parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
    }
}

pub fn parse_nvidia_smi(stdout: &str) -> Vec<GpuInfo> {
    let mut out = Vec::new();
    for (idx, line) in stdout.lines().enumerate() {
        let parts: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
        if parts.len() < 4 {
            continue;
        }
        let Ok(total) = parts[2].parse::<u64>() else {
            continue;
        };
        out.push(GpuInfo {
            index: parts[0].parse().unwrap_or(idx as u32),
            name: parts[1].to_string(),
            memory_total_mb: total,
            memory_used_mb: parts[3].parse().unwrap_or(0),
        });
    }
    out
}

/// Fixed inventory, e.g. from `GPU_TOTAL_MB` on hosts without nvidia-smi.
pub struct StaticGpus(pub Vec<GpuInfo>);

impl StaticGpus {
    pub fn uniform(count: u32, memory_total_mb: u64) -> Self {
        Self(
            (0..count)
                .map(|index| GpuInfo {
                    index,
                    name: "static".to_string(),
                    memory_total_mb,
                    memory_used_mb: 0,
                })
                .collect(),
        )
    }
}

#[async_trait]
impl GpuInventory for StaticGpus {
    async fn gpus(&self) -> Vec<GpuInfo> {
        self.0.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_csv_rows() {
        let out = parse_nvidia_smi(
            "0, NVIDIA A100-SXM4-80GB, 81920, 1024\n1, NVIDIA A100-SXM4-80GB, 81920, [N/A]\ngarbage\n",
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].memory_total_mb, 81920);
        assert_eq!(out[0].memory_used_mb, 1024);
        assert_eq!(out[1].index, 1);
        assert_eq!(out[1].memory_used_mb, 0);
    }

    #[tokio::test]
    async fn static_inventory() {
        let gpus = StaticGpus::uniform(2, 24576).gpus().await;
        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[1].index, 1);
    }
}
