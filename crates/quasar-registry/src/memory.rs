use std::{collections::BTreeMap, sync::Arc};

use anyhow::Result;
use quasar_common::ModelConfig;
use tokio::sync::RwLock;

use crate::types::ModelRegistry;

#[derive(Debug, Clone, Default)]
pub struct MemoryRegistry {
    inner: Arc<RwLock<BTreeMap<String, ModelConfig>>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_models(models: impl IntoIterator<Item = ModelConfig>) -> Self {
        let map = models.into_iter().map(|m| (m.id.clone(), m)).collect();
        Self {
            inner: Arc::new(RwLock::new(map)),
        }
    }
}

#[async_trait::async_trait]
impl ModelRegistry for MemoryRegistry {
    async fn get(&self, id: &str) -> Result<Option<ModelConfig>> {
        Ok(self.inner.read().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<ModelConfig>> {
        Ok(self.inner.read().await.values().cloned().collect())
    }

    async fn put(&self, config: ModelConfig) -> Result<Option<ModelConfig>> {
        Ok(self.inner.write().await.insert(config.id.clone(), config))
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.inner.write().await.remove(id).is_some())
    }
}
