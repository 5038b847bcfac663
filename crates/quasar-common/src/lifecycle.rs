use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    #[default]
    Stopped,
    Starting,
    Loading,
    Running,
    Failed,
    Stopping,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Stopped => "stopped",
            LifecycleState::Starting => "starting",
            LifecycleState::Loading => "loading",
            LifecycleState::Running => "running",
            LifecycleState::Failed => "failed",
            LifecycleState::Stopping => "stopping",
        }
    }

    /// A start or stop is in flight.
    pub fn is_transitioning(self) -> bool {
        matches!(
            self,
            LifecycleState::Starting | LifecycleState::Loading | LifecycleState::Stopping
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosisKind {
    OutOfMemory,
    MissingWeights,
    PortConflict,
    Unknown,
}

/// Why a model ended up `failed`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The container runtime refused to create or start the container.
    ContainerStart,
    /// The container exited before or after becoming ready.
    ContainerExited,
    ReadinessTimeout,
}

/// Human-readable explanation of why an engine failed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Diagnosis {
    pub kind: DiagnosisKind,
    pub title: String,
    pub message: String,
    pub suggested_fixes: Vec<String>,
}

/// Runtime view of one managed model. Reset to [`ModelRuntimeState::stopped`]
/// when a stop completes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelRuntimeState {
    pub model_id: String,
    pub state: LifecycleState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnosis: Option<Diagnosis>,
}

impl ModelRuntimeState {
    pub fn stopped(model_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
            state: LifecycleState::Stopped,
            container_name: None,
            base_url: None,
            port: None,
            started_at_ms: None,
            failure: None,
            last_error: None,
            diagnosis: None,
        }
    }
}
