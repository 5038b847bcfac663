pub mod context;
pub mod endpoint;
pub mod lifecycle;
pub mod model;
pub mod usage;

pub use context::{RequestContext, RequestId};
pub use endpoint::{Endpoint, EndpointSource, HealthSnapshot, HealthStatus, PoolKind};
pub use lifecycle::{Diagnosis, DiagnosisKind, FailureKind, LifecycleState, ModelRuntimeState};
pub use model::{EngineType, ModelConfig, SpeculativeConfig};
pub use usage::{RequestOutcome, Usage, UsageRecord, UsageSource};

pub mod auth;
pub mod telemetry;

use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
