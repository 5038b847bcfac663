use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use quasar_common::ModelConfig;
use tokio::sync::RwLock;

use crate::types::ModelRegistry;

/// Registry persisted as a JSON array of [`ModelConfig`].
///
/// Every mutation rewrites the whole file through a temp file and a rename, so a
/// crash never leaves a half-written registry behind.
#[derive(Debug, Clone)]
pub struct FileRegistry {
    path: PathBuf,
    inner: Arc<RwLock<BTreeMap<String, ModelConfig>>>,
}

impl FileRegistry {
    /// Loads `path`, or starts empty when the file does not exist yet.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let models: Vec<ModelConfig> = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("parse model registry {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("read model registry {}", path.display()));
            }
        };

        let mut map = BTreeMap::new();
        for m in models {
            if map.insert(m.id.clone(), m).is_some() {
                tracing::warn!(path=%path.display(), "duplicate model id in registry, keeping last");
            }
        }
        tracing::info!(path=%path.display(), models = map.len(), "model registry loaded");

        Ok(Self {
            path,
            inner: Arc::new(RwLock::new(map)),
        })
    }

    async fn persist(&self, map: &BTreeMap<String, ModelConfig>) -> Result<()> {
        let models: Vec<&ModelConfig> = map.values().collect();
        let bytes = serde_json::to_vec_pretty(&models)?;

        let tmp = self.path.with_extension("json.tmp");
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("rename {} -> {}", tmp.display(), self.path.display()))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ModelRegistry for FileRegistry {
    async fn get(&self, id: &str) -> Result<Option<ModelConfig>> {
        Ok(self.inner.read().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<ModelConfig>> {
        Ok(self.inner.read().await.values().cloned().collect())
    }

    async fn put(&self, config: ModelConfig) -> Result<Option<ModelConfig>> {
        let mut guard = self.inner.write().await;
        let mut next = guard.clone();
        let prev = next.insert(config.id.clone(), config);
        self.persist(&next).await?;
        *guard = next;
        Ok(prev)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let mut guard = self.inner.write().await;
        if !guard.contains_key(id) {
            return Ok(false);
        }
        let mut next = guard.clone();
        next.remove(id);
        self.persist(&next).await?;
        *guard = next;
        Ok(true)
    }
}
