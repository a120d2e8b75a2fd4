//! Configuration parsing for the perception coprocessor.
//!
//! This module owns translation of CLI arguments into a `VisionConfig` struct
//! which the camera, pipeline and supervisor use without re-parsing flags.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Result, anyhow, bail};
use clap::Args;

use crate::{
    localize::DepthSampling,
    pipeline::registry::{BUILTIN_PIPELINES, DETECTION_DEPTH},
    retry::RetryPolicy,
};

#[derive(Clone, Debug)]
/// Canonical configuration shared by every loop in the coprocessor.
pub struct VisionConfig {
    pub capture: CaptureConfig,
    pub detection: DetectionConfig,
    pub cadence: CadenceConfig,
    /// Telemetry and instrumentation options.
    pub telemetry: TelemetryOptions,
    pub runtime: RuntimeOptions,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Upper bound on a single sensor frame wait.
    pub frame_timeout: Duration,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DetectionConfig {
    /// Registry name of the pipeline to run.
    pub pipeline: String,
    pub confidence: f32,
    pub iou: f32,
    pub sampling: DepthSampling,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CadenceConfig {
    pub pipeline_interval: Duration,
    pub supervisor_interval: Duration,
    pub max_recovery_attempts: u32,
    /// Tries of a recovery handler within one recovery attempt.
    pub recovery_retries: u32,
    pub init_attempts: u32,
    pub stop_timeout: Duration,
    /// How long a loop may go without a heartbeat before it is unhealthy.
    pub stale_after: Duration,
}

impl CadenceConfig {
    /// Short backoff for recovery handlers: 250 ms, 500 ms, capped at 1 s.
    pub fn recovery_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.recovery_retries, Duration::from_millis(250))
            .with_backoff(2.0, Duration::from_secs(1))
    }
}

#[derive(Clone, Debug, Default)]
/// Optional telemetry knobs for tracing and runtime inspection.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing pipeline spans.
    pub chrome_trace_path: Option<PathBuf>,
    /// Serve Prometheus metrics on this address.
    pub metrics_addr: Option<SocketAddr>,
}

#[derive(Clone, Debug, Default)]
pub struct RuntimeOptions {
    /// Exit after this long; run until Ctrl+C otherwise.
    pub duration: Option<Duration>,
    /// Append detection messages to this file instead of stdout.
    pub output_path: Option<PathBuf>,
    /// Write the last annotated frame as JPEG on shutdown.
    pub snapshot_path: Option<PathBuf>,
    pub summary_interval: Duration,
    pub verbose: bool,
}

/// CLI arguments accepted by the `run` subcommand.
#[derive(Debug, Default, Args)]
pub struct VisionCliArgs {
    /// Capture width in pixels.
    #[arg(long = "width", value_name = "PX")]
    pub width: Option<u32>,
    /// Capture height in pixels.
    #[arg(long = "height", value_name = "PX")]
    pub height: Option<u32>,
    /// Capture frame rate.
    #[arg(long = "fps", value_name = "FPS")]
    pub fps: Option<u32>,
    /// Maximum wait for a single frame from the sensor.
    #[arg(long = "frame-timeout-ms", value_name = "MS")]
    pub frame_timeout_ms: Option<u64>,

    /// Pipeline to run (detection-depth, passthrough, idle).
    #[arg(long = "pipeline", value_name = "NAME")]
    pub pipeline: Option<String>,
    /// Minimum detection confidence (0-1).
    #[arg(long = "confidence", value_name = "SCORE")]
    pub confidence: Option<f32>,
    /// IoU above which same-class boxes are suppressed (0-1).
    #[arg(long = "iou", value_name = "IOU")]
    pub iou: Option<f32>,
    /// Depth sampling inside each box (nearest, median).
    #[arg(long = "sampling", value_name = "MODE")]
    pub sampling: Option<String>,

    /// Wait between pipeline iterations.
    #[arg(long = "pipeline-interval-ms", value_name = "MS")]
    pub pipeline_interval_ms: Option<u64>,
    /// Wait between supervisor health checks.
    #[arg(long = "supervisor-interval-ms", value_name = "MS")]
    pub supervisor_interval_ms: Option<u64>,
    /// Recoveries attempted per component before it is marked failed.
    #[arg(long = "max-recovery-attempts", value_name = "N")]
    pub max_recovery_attempts: Option<u32>,
    /// Tries of a recovery handler before the recovery attempt counts as failed.
    #[arg(long = "recovery-retries", value_name = "N")]
    pub recovery_retries: Option<u32>,
    /// Attempts made to initialize each component at startup.
    #[arg(long = "init-attempts", value_name = "N")]
    pub init_attempts: Option<u32>,
    /// Maximum wait for a loop to stop.
    #[arg(long = "stop-timeout-ms", value_name = "MS")]
    pub stop_timeout_ms: Option<u64>,

    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
    /// Serve Prometheus metrics on HOST:PORT.
    #[arg(long = "metrics-addr", value_name = "ADDR")]
    pub metrics_addr: Option<SocketAddr>,

    /// Stop after this many seconds.
    #[arg(long = "duration-secs", value_name = "SECS")]
    pub duration_secs: Option<u64>,
    /// Write detection messages (JSON lines) to PATH instead of stdout.
    #[arg(long = "output", value_name = "PATH")]
    pub output: Option<PathBuf>,
    /// Write the last annotated frame as JPEG to PATH on shutdown.
    #[arg(long = "snapshot", value_name = "PATH")]
    pub snapshot: Option<PathBuf>,
    /// Seconds between health summary log lines.
    #[arg(long = "summary-interval-secs", value_name = "SECS")]
    pub summary_interval_secs: Option<u64>,
    /// Enable verbose logging (frame drops, detections).
    #[arg(long = "verbose", action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
}

impl TryFrom<VisionCliArgs> for VisionConfig {
    type Error = anyhow::Error;

    fn try_from(args: VisionCliArgs) -> Result<Self> {
        let width = args.width.unwrap_or(640);
        let height = args.height.unwrap_or(480);
        if width == 0 || height == 0 {
            bail!("Capture width and height must be positive integers");
        }
        let fps = args.fps.unwrap_or(30);
        if !(1..=300).contains(&fps) {
            bail!("--fps must be between 1 and 300");
        }
        let frame_timeout = positive_millis("--frame-timeout-ms", args.frame_timeout_ms, 5_000)?;

        let pipeline = args.pipeline.unwrap_or_else(|| DETECTION_DEPTH.to_owned());
        if !BUILTIN_PIPELINES.contains(&pipeline.as_str()) {
            bail!(
                "Unknown pipeline {pipeline:?}. Available: {}",
                BUILTIN_PIPELINES.join(", ")
            );
        }
        let confidence = args.confidence.unwrap_or(0.5);
        if !(0.0..=1.0).contains(&confidence) {
            bail!("--confidence must be between 0 and 1");
        }
        let iou = args.iou.unwrap_or(0.45);
        if !(0.0..=1.0).contains(&iou) {
            bail!("--iou must be between 0 and 1");
        }
        let sampling = match args.sampling.as_deref() {
            Some(mode) => mode.parse::<DepthSampling>().map_err(|err| anyhow!(err))?,
            None => DepthSampling::default(),
        };

        let pipeline_interval = positive_millis("--pipeline-interval-ms", args.pipeline_interval_ms, 10)?;
        let supervisor_interval =
            positive_millis("--supervisor-interval-ms", args.supervisor_interval_ms, 5_000)?;
        let stop_timeout = positive_millis("--stop-timeout-ms", args.stop_timeout_ms, 5_000)?;
        let max_recovery_attempts = args.max_recovery_attempts.unwrap_or(3);
        let recovery_retries = args.recovery_retries.unwrap_or(2);
        if recovery_retries == 0 {
            bail!("--recovery-retries must be at least 1");
        }
        let init_attempts = args.init_attempts.unwrap_or(3);
        if init_attempts == 0 {
            bail!("--init-attempts must be at least 1");
        }

        let summary_interval = Duration::from_secs(args.summary_interval_secs.unwrap_or(10));
        if summary_interval.is_zero() {
            bail!("--summary-interval-secs must be at least 1");
        }
        let duration = match args.duration_secs {
            Some(0) => bail!("--duration-secs must be at least 1"),
            Some(secs) => Some(Duration::from_secs(secs)),
            None => None,
        };

        Ok(Self {
            capture: CaptureConfig {
                width,
                height,
                fps,
                frame_timeout,
            },
            detection: DetectionConfig {
                pipeline,
                confidence,
                iou,
                sampling,
            },
            cadence: CadenceConfig {
                pipeline_interval,
                supervisor_interval,
                max_recovery_attempts,
                recovery_retries,
                init_attempts,
                stop_timeout,
                stale_after: frame_timeout.max(supervisor_interval) * 2,
            },
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace,
                metrics_addr: args.metrics_addr,
            },
            runtime: RuntimeOptions {
                duration,
                output_path: args.output,
                snapshot_path: args.snapshot,
                summary_interval,
                verbose: args.verbose,
            },
        })
    }
}

fn positive_millis(flag: &str, value: Option<u64>, default: u64) -> Result<Duration> {
    match value.unwrap_or(default) {
        0 => bail!("{flag} must be at least 1"),
        ms => Ok(Duration::from_millis(ms)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = VisionConfig::try_from(VisionCliArgs::default()).expect("defaults");
        assert_eq!((config.capture.width, config.capture.height), (640, 480));
        assert_eq!(config.capture.frame_timeout, Duration::from_secs(5));
        assert_eq!(config.detection.pipeline, DETECTION_DEPTH);
        assert_eq!(config.detection.sampling, DepthSampling::Nearest);
        assert_eq!(config.cadence.supervisor_interval, Duration::from_secs(5));
        assert_eq!(config.cadence.max_recovery_attempts, 3);
        let recovery = config.cadence.recovery_policy();
        assert_eq!(recovery.max_attempts, 2);
        assert_eq!(recovery.delay_for_attempt(1), Duration::from_millis(250));
        assert_eq!(recovery.delay_for_attempt(4), Duration::from_secs(1));
        assert_eq!(config.cadence.stop_timeout, Duration::from_secs(5));
        assert!(config.runtime.duration.is_none());
    }

    #[test]
    fn flags_override_defaults() {
        let args = VisionCliArgs {
            width: Some(320),
            height: Some(240),
            pipeline: Some("passthrough".into()),
            sampling: Some("median".into()),
            duration_secs: Some(3),
            ..VisionCliArgs::default()
        };
        let config = VisionConfig::try_from(args).expect("valid");
        assert_eq!(config.capture.width, 320);
        assert_eq!(config.detection.pipeline, "passthrough");
        assert_eq!(config.detection.sampling, DepthSampling::Median);
        assert_eq!(config.runtime.duration, Some(Duration::from_secs(3)));
    }

    #[test]
    fn rejects_out_of_range_values() {
        let cases = [
            VisionCliArgs {
                width: Some(0),
                ..VisionCliArgs::default()
            },
            VisionCliArgs {
                confidence: Some(1.5),
                ..VisionCliArgs::default()
            },
            VisionCliArgs {
                pipeline: Some("apriltag".into()),
                ..VisionCliArgs::default()
            },
            VisionCliArgs {
                sampling: Some("mean".into()),
                ..VisionCliArgs::default()
            },
            VisionCliArgs {
                pipeline_interval_ms: Some(0),
                ..VisionCliArgs::default()
            },
            VisionCliArgs {
                recovery_retries: Some(0),
                ..VisionCliArgs::default()
            },
            VisionCliArgs {
                init_attempts: Some(0),
                ..VisionCliArgs::default()
            },
        ];
        for args in cases {
            let debug = format!("{args:?}");
            assert!(VisionConfig::try_from(args).is_err(), "accepted {debug}");
        }
    }
}
