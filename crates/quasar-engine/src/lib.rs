//! Managed inference engines: launch command construction, pre-flight
//! validation, container control and the lifecycle state machine.

pub mod diagnose;
pub mod engine;
pub mod gpu;
pub mod orchestrator;
pub mod readiness;
pub mod runtime;
pub mod validate;

pub use diagnose::diagnose;
pub use engine::{container_name, create_engine, Engine, LaunchSettings, LaunchSpec};
pub use gpu::{GpuInfo, GpuInventory, NvidiaSmi, StaticGpus};
pub use orchestrator::{
    LifecycleError, LogSource, LogsReport, Orchestrator, OrchestratorSettings, ReadinessReport,
};
pub use readiness::{Backoff, HttpReadiness, ReadinessProbe};
pub use runtime::{ContainerRuntime, ContainerStatus, DockerCli};
pub use validate::{
    DryRunReport, ResourceWarning, Severity, ValidationError, VramEstimate, WarningCategory,
};
