//! Coprocessor lifecycle: bring up camera, pipeline and publisher, supervise
//! them, and shut down in order.

use std::{
    fs,
    path::Path,
    sync::{
        Arc, Once,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use ml_core::InferenceEngine;
use tracing::{debug, error, info, info_span, warn};
use video_ingest::{SyntheticScene, SyntheticSensor};
use vision::{
    CameraLoop, ComponentSupervisor, FrameSource, OverallStatus, PipelineRegistry, PipelineRunner,
    Publisher, RetryPolicy, VisionConfig, safe_init,
    pipeline::{
        EngineFactory, Pipeline, PipelineContext, registry::IdlePipeline, runner::PipelineOutput, telemetry,
    },
};

use crate::{
    demo::DemoEngine,
    publish::{JsonLinesPublisher, PublishTarget},
};

const SHUTDOWN_POLL: Duration = Duration::from_millis(100);
const SNAPSHOT_QUALITY: u8 = 85;

/// Run until Ctrl+C or the configured duration elapses.
pub fn run(config: VisionConfig) -> Result<()> {
    let _telemetry_guard = telemetry::enter_runtime(&config.telemetry, config.runtime.verbose);
    if let Err(err) = telemetry::init_metrics(&config.telemetry) {
        warn!("metrics disabled: {err:#}");
    }

    let span = info_span!(
        "coprocessor",
        pipeline = %config.detection.pipeline,
        width = config.capture.width,
        height = config.capture.height,
        fps = config.capture.fps
    );
    let _span_guard = span.enter();

    let shutdown = install_shutdown_handler();
    let policy = RetryPolicy::initialization(config.cadence.init_attempts);
    let stale_after = config.cadence.stale_after;

    let camera = Arc::new(CameraLoop::new(
        Box::new(SyntheticSensor::new(demo_scene(&config))),
        config.capture.frame_timeout,
    ));
    let camera_init = safe_init("camera", &policy, || camera.start());
    if let Some(err) = camera_init.error {
        warn!("camera unavailable at startup, supervisor will retry: {err}");
    }

    let target = match config.runtime.output_path.clone() {
        Some(path) => PublishTarget::File(path),
        None => PublishTarget::Stdout,
    };
    let publisher = match safe_init("publisher", &policy, || JsonLinesPublisher::open(target.clone()))
        .into_parts()
    {
        (Some(publisher), _) => Arc::new(publisher),
        (None, err) => {
            warn!(
                "falling back to stdout publisher: {}",
                err.unwrap_or_default()
            );
            Arc::new(JsonLinesPublisher::open(PublishTarget::Stdout)?)
        }
    };

    let registry = PipelineRegistry::with_builtins();
    let (width, height) = (config.capture.width, config.capture.height);
    let engine: EngineFactory = Arc::new(move || -> Result<Box<dyn InferenceEngine>> {
        Ok(Box::new(DemoEngine::new(width, height)))
    });
    let context = PipelineContext {
        detection: config.detection.clone(),
        engine: Some(engine),
    };
    let pipeline: Box<dyn Pipeline> = safe_init("pipeline", &policy, || {
        Ok(registry.build(&config.detection.pipeline, &context)?)
    })
    .or_fallback(Box::new(IdlePipeline))
    .value
    .context("pipeline unavailable")?;

    let runner = Arc::new(
        PipelineRunner::new(
            camera.clone(),
            pipeline,
            publisher.clone() as Arc<dyn Publisher>,
            config.cadence.pipeline_interval,
        )
        .with_stop_timeout(config.cadence.stop_timeout),
    );

    let supervisor = ComponentSupervisor::with_recovery_policy(
        config.cadence.supervisor_interval,
        config.cadence.max_recovery_attempts,
        config.cadence.recovery_policy(),
    );
    register_components(&supervisor, &camera, &runner, &publisher, stale_after);

    if let Err(err) = runner.start() {
        error!("failed to start pipeline runner: {err}");
    }
    supervisor
        .start()
        .context("failed to spawn supervisor thread")?;
    info!(
        pipeline = %runner.pipeline_name(),
        pipelines = ?registry.names(),
        "coprocessor running"
    );

    wait_for_shutdown(&config, &shutdown, &supervisor);

    info!("shutting down");
    supervisor.stop();
    runner.stop();
    camera.stop();

    let summary = supervisor.summary();
    info!(
        status = %summary.status,
        cycles = runner.cycles(),
        frames = camera.frames_captured(),
        published = publisher.publish_count(),
        publish_errors = publisher.error_count(),
        "coprocessor stopped"
    );
    if let Some(handle) = telemetry::prometheus_handle() {
        debug!("final metrics:\n{}", handle.render());
    }

    if let Some(path) = config.runtime.snapshot_path.as_deref() {
        write_snapshot(&runner.output(), path)?;
    }
    Ok(())
}

fn demo_scene(config: &VisionConfig) -> SyntheticScene {
    let (width, height) = (config.capture.width, config.capture.height);
    let block = (width / 8).max(4).min(width).min(height);
    SyntheticScene {
        width,
        height,
        fps: config.capture.fps,
        block: (
            width.saturating_sub(block) / 2,
            height.saturating_sub(block) / 2,
            block,
            block,
        ),
        block_depth_mm: 1500,
        background_depth_mm: 0,
        drift_px: 2,
    }
}

fn register_components(
    supervisor: &ComponentSupervisor,
    camera: &Arc<CameraLoop>,
    runner: &Arc<PipelineRunner>,
    publisher: &Arc<JsonLinesPublisher>,
    stale_after: Duration,
) {
    let (check, recover) = (camera.clone(), camera.clone());
    supervisor.register_with_recovery(
        "camera",
        move || Ok(check.is_connected() && !check.heartbeat().is_stale(stale_after)),
        move || recover.restart(),
    );

    let (check, recover) = (runner.clone(), runner.clone());
    supervisor.register_with_recovery(
        "pipeline",
        move || Ok(check.is_running() && !check.heartbeat().is_stale(stale_after)),
        move || recover.restart(),
    );

    let (check, recover) = (publisher.clone(), publisher.clone());
    supervisor.register_with_recovery(
        "publisher",
        move || Ok(check.is_healthy()),
        move || recover.reopen(),
    );
}

fn install_shutdown_handler() -> Arc<AtomicBool> {
    static CTRL_HANDLER: Once = Once::new();

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_shutdown = shutdown.clone();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || {
            handler_shutdown.store(true, Ordering::SeqCst);
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });
    shutdown
}

fn wait_for_shutdown(config: &VisionConfig, shutdown: &AtomicBool, supervisor: &ComponentSupervisor) {
    let started = Instant::now();
    let mut last_summary = Instant::now();
    loop {
        if shutdown.load(Ordering::SeqCst) {
            info!("Ctrl+C received");
            return;
        }
        if config
            .runtime
            .duration
            .is_some_and(|duration| started.elapsed() >= duration)
        {
            info!("run duration elapsed");
            return;
        }
        if last_summary.elapsed() >= config.runtime.summary_interval {
            last_summary = Instant::now();
            log_summary(supervisor);
        }
        thread::sleep(SHUTDOWN_POLL);
    }
}

fn log_summary(supervisor: &ComponentSupervisor) {
    let summary = supervisor.summary();
    let failing: Vec<&str> = summary
        .components
        .values()
        .filter(|c| c.last_error.is_some() || c.consecutive_failures > 0)
        .map(|c| c.name.as_str())
        .collect();
    if summary.status == OverallStatus::Healthy {
        info!(
            status = %summary.status,
            components = summary.total_components,
            "health summary"
        );
    } else {
        warn!(
            status = %summary.status,
            healthy = summary.healthy,
            degraded = summary.degraded,
            failed = summary.failed,
            failing = ?failing,
            "health summary"
        );
    }
    if let Ok(json) = serde_json::to_string(&summary) {
        debug!("health detail: {json}");
    }
}

fn write_snapshot(output: &PipelineOutput, path: &Path) -> Result<()> {
    let Some(frame) = output.frame.as_ref() else {
        warn!("no frame processed, skipping snapshot");
        return Ok(());
    };
    let image = ml_core::overlay::annotate(
        &frame.to_bgr8(),
        frame.width,
        frame.height,
        &output.detections,
    )?;
    let jpeg = ml_core::overlay::encode_jpeg(&image, SNAPSHOT_QUALITY)?;
    fs::write(path, jpeg).with_context(|| format!("failed to write {}", path.display()))?;
    info!(path = %path.display(), detections = output.detections.len(), "snapshot written");
    Ok(())
}
