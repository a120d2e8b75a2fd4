//! Supervised periodic execution and detection localization.
//!
//! Every long-running loop in the coprocessor (camera acquisition, the
//! detection pipeline and the health supervisor) is a [`PeriodicTask`] on its
//! own OS thread. They share state only through last-write-wins snapshots and
//! the supervisor's registry.

pub mod capture;
pub mod localize;
pub mod periodic;
pub mod pipeline;
pub mod retry;
pub mod supervisor;

pub use capture::{CameraLoop, FrameSource, Snapshot};
pub use localize::{DepthSampling, LocalizeError, Localized, localize};
pub use periodic::PeriodicTask;
pub use pipeline::{
    Pipeline, PipelineRegistry, PipelineRunner, Publisher, RegistryError,
    TelemetryOptions, VisionCliArgs, VisionConfig,
};
pub use retry::{InitOutcome, RetryError, RetryPolicy, safe_init};
pub use supervisor::{
    ComponentHealth, ComponentStatus, ComponentSupervisor, HealthSummary, OverallStatus,
};
