//! Pipeline wiring: configuration, the pipeline registry, the runner loop and
//! the telemetry/heartbeat plumbing shared by every loop.

pub mod config;
pub mod registry;
pub mod runner;
pub mod telemetry;
pub mod watchdog;

pub use config::{
    CadenceConfig, CaptureConfig, DetectionConfig, RuntimeOptions, TelemetryOptions,
    VisionCliArgs, VisionConfig,
};
pub use registry::{
    DetectionDepthPipeline, EngineFactory, Pipeline, PipelineContext, PipelineRegistry,
    RegistryError,
};
pub use runner::{PipelineOutput, PipelineRunner, Publisher};
pub use watchdog::Heartbeat;
