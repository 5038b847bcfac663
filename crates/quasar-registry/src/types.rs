use anyhow::Result;
use quasar_common::{ModelConfig, UsageRecord};

/// Read/write access to durable model configurations.
///
/// CRUD belongs to the admin layer; the orchestrator only calls `get`/`list`.
#[async_trait::async_trait]
pub trait ModelRegistry: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<ModelConfig>>;

    /// All entries, ordered by id.
    async fn list(&self) -> Result<Vec<ModelConfig>>;

    /// Inserts or replaces. Returns the previous entry.
    async fn put(&self, config: ModelConfig) -> Result<Option<ModelConfig>>;

    async fn delete(&self, id: &str) -> Result<bool>;
}

/// Destination for per-request usage records.
pub trait UsageSink: Send + Sync {
    fn record(&self, record: UsageRecord);
}
