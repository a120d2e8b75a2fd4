//! Periodic "read frame, run pipeline, publish" loop.

use std::{
    io,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::Result;
use ml_core::Detection;
use tracing::{debug, info, info_span, warn};
use video_ingest::ColorFrame;

use crate::{
    capture::FrameSource,
    periodic::{PeriodicTask, panic_message},
    pipeline::{
        registry::Pipeline,
        watchdog::{Heartbeat, STARTUP_GRACE},
    },
};

pub const DEFAULT_PIPELINE_INTERVAL: Duration = Duration::from_millis(10);

/// Downstream consumer of each cycle's detections.
///
/// Called on the pipeline thread; a slow sink slows the pipeline.
pub trait Publisher: Send + Sync {
    fn publish(&self, detections: &[Detection]) -> Result<()>;
}

/// Result of the most recent successful cycle.
#[derive(Debug, Clone, Default)]
pub struct PipelineOutput {
    pub frame: Option<Arc<ColorFrame>>,
    pub detections: Vec<Detection>,
}

impl PipelineOutput {
    pub fn frame_number(&self) -> Option<u64> {
        self.frame.as_ref().map(|frame| frame.frame_number)
    }
}

struct RunnerShared {
    source: Arc<dyn FrameSource>,
    pipeline: Mutex<Box<dyn Pipeline>>,
    publisher: Arc<dyn Publisher>,
    output: Mutex<Arc<PipelineOutput>>,
    heartbeat: Heartbeat,
    cycles: AtomicU64,
    errors: AtomicU64,
    publish_errors: AtomicU64,
}

impl RunnerShared {
    fn output(&self) -> Arc<PipelineOutput> {
        self.output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn run_cycle(&self) {
        let span = info_span!("pipeline.cycle");
        let _guard = span.enter();
        let started = Instant::now();

        let Some((color, depth)) = self.source.latest_frames() else {
            self.heartbeat.beat();
            return;
        };
        if self.output().frame_number() == Some(color.frame_number) {
            self.heartbeat.beat();
            return;
        }

        let mut pipeline = self.pipeline.lock().unwrap_or_else(PoisonError::into_inner);
        let detections = match pipeline.process(&color, &depth) {
            Ok(detections) => detections,
            Err(err) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("pipeline_errors_total").increment(1);
                warn!(frame = color.frame_number, "pipeline cycle failed: {err:#}");
                return;
            }
        };
        let publishes = pipeline.publishes();
        drop(pipeline);

        let output = Arc::new(PipelineOutput {
            frame: Some(color),
            detections,
        });
        *self.output.lock().unwrap_or_else(PoisonError::into_inner) = output.clone();

        if publishes {
            self.publish(&output.detections);
        }

        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.heartbeat.beat();
        metrics::counter!("pipeline_cycles_total").increment(1);
        metrics::gauge!("pipeline_detections").set(output.detections.len() as f64);
        metrics::histogram!("pipeline_cycle_seconds").record(started.elapsed().as_secs_f64());
        debug!(
            frame = output.frame_number(),
            detections = output.detections.len(),
            "pipeline cycle complete"
        );
    }

    fn publish(&self, detections: &[Detection]) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.publisher.publish(detections)));
        let failure = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(err)) => format!("{err:#}"),
            Err(payload) => format!("panicked: {}", panic_message(&*payload)),
        };
        self.publish_errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("pipeline_publish_errors_total").increment(1);
        warn!("publishing detections failed: {failure}");
    }
}

/// Runs a [`Pipeline`] against a [`FrameSource`] on its own task.
///
/// Each cycle takes the latest cached frames, skips frames it already
/// processed, stores the result (last write wins) and hands it to the
/// publisher. Pipeline errors only abort the current cycle.
pub struct PipelineRunner {
    shared: Arc<RunnerShared>,
    task: PeriodicTask,
}

impl PipelineRunner {
    pub fn new(
        source: Arc<dyn FrameSource>,
        pipeline: Box<dyn Pipeline>,
        publisher: Arc<dyn Publisher>,
        interval: Duration,
    ) -> Self {
        info!(pipeline = pipeline.name(), "initializing pipeline runner");
        let shared = Arc::new(RunnerShared {
            source,
            pipeline: Mutex::new(pipeline),
            publisher,
            output: Mutex::new(Arc::new(PipelineOutput::default())),
            heartbeat: Heartbeat::new("pipeline"),
            cycles: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            publish_errors: AtomicU64::new(0),
        });
        let cycle_shared = shared.clone();
        let task = PeriodicTask::new("pipeline", interval, move || cycle_shared.run_cycle());
        Self { shared, task }
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.task = self.task.with_stop_timeout(timeout);
        self
    }

    pub fn pipeline_name(&self) -> String {
        self.shared
            .pipeline
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .name()
            .to_owned()
    }

    /// Swap the running pipeline; takes effect on the next cycle.
    pub fn set_pipeline(&self, pipeline: Box<dyn Pipeline>) {
        info!(pipeline = pipeline.name(), "switching pipeline");
        *self
            .shared
            .pipeline
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = pipeline;
    }

    /// Latest output; never blocks on a running cycle.
    pub fn output(&self) -> Arc<PipelineOutput> {
        self.shared.output()
    }

    pub fn cycles(&self) -> u64 {
        self.shared.cycles.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.shared.errors.load(Ordering::Relaxed)
    }

    pub fn publish_errors(&self) -> u64 {
        self.shared.publish_errors.load(Ordering::Relaxed)
    }

    pub fn heartbeat(&self) -> &Heartbeat {
        &self.shared.heartbeat
    }

    /// Run one cycle on the calling thread.
    pub fn run_cycle(&self) {
        self.shared.run_cycle();
    }

    pub fn start(&self) -> io::Result<()> {
        if !self.task.is_running() {
            self.shared.heartbeat.rearm(STARTUP_GRACE);
        }
        self.task.start()
    }

    pub fn stop(&self) {
        self.task.stop();
    }

    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }

    /// Stop and start again, used as the supervisor's recovery action.
    pub fn restart(&self) -> Result<bool> {
        info!(pipeline = %self.pipeline_name(), "restarting pipeline runner");
        self.stop();
        self.start()?;
        Ok(self.is_running())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use video_ingest::{DepthFrame, FrameFormat, Intrinsics};

    use crate::{
        capture::Snapshot,
        pipeline::registry::{IdlePipeline, PassthroughPipeline},
    };

    struct StaticSource {
        frames: Mutex<Option<Snapshot>>,
    }

    impl StaticSource {
        fn new() -> Self {
            Self {
                frames: Mutex::new(None),
            }
        }

        fn push(&self, frame_number: u64) {
            let color = ColorFrame {
                data: vec![0; 4 * 4 * 3],
                width: 4,
                height: 4,
                timestamp_ms: 0,
                frame_number,
                format: FrameFormat::Bgr8,
            };
            let depth = DepthFrame {
                data: vec![1000; 16],
                width: 4,
                height: 4,
                depth_scale: 0.001,
                intrinsics: Intrinsics::new(2.0, 2.0, 2.0, 2.0, 4, 4),
                timestamp_ms: 0,
                frame_number,
            };
            *self.frames.lock().unwrap() = Some((Arc::new(color), Arc::new(depth)));
        }
    }

    impl FrameSource for StaticSource {
        fn latest_frames(&self) -> Option<Snapshot> {
            self.frames.lock().unwrap().clone()
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn start(&self) -> Result<()> {
            Ok(())
        }

        fn stop(&self) {}
    }

    #[derive(Default)]
    struct RecordingPublisher {
        published: Mutex<Vec<usize>>,
        fail: AtomicBool,
        panic: AtomicBool,
    }

    impl Publisher for RecordingPublisher {
        fn publish(&self, detections: &[Detection]) -> Result<()> {
            if self.panic.load(Ordering::SeqCst) {
                panic!("sink exploded");
            }
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("sink closed");
            }
            self.published.lock().unwrap().push(detections.len());
            Ok(())
        }
    }

    struct FailingPipeline;

    impl Pipeline for FailingPipeline {
        fn name(&self) -> &str {
            "failing"
        }

        fn process(&mut self, _: &ColorFrame, _: &DepthFrame) -> Result<Vec<Detection>> {
            anyhow::bail!("inference hiccup")
        }
    }

    fn runner(
        pipeline: Box<dyn Pipeline>,
    ) -> (PipelineRunner, Arc<StaticSource>, Arc<RecordingPublisher>) {
        let source = Arc::new(StaticSource::new());
        let publisher = Arc::new(RecordingPublisher::default());
        let runner = PipelineRunner::new(
            source.clone(),
            pipeline,
            publisher.clone(),
            Duration::from_millis(1),
        );
        (runner, source, publisher)
    }

    #[test]
    fn no_frame_means_no_work() {
        let (runner, _source, publisher) = runner(Box::new(PassthroughPipeline));
        runner.run_cycle();
        assert_eq!(runner.cycles(), 0);
        assert!(publisher.published.lock().unwrap().is_empty());
        assert!(runner.output().frame.is_none());
    }

    #[test]
    fn publishes_once_per_new_frame() {
        let (runner, source, publisher) = runner(Box::new(PassthroughPipeline));
        source.push(1);
        runner.run_cycle();
        runner.run_cycle();
        source.push(2);
        runner.run_cycle();
        assert_eq!(runner.cycles(), 2);
        assert_eq!(*publisher.published.lock().unwrap(), vec![0, 0]);
        assert_eq!(runner.output().frame_number(), Some(2));
    }

    #[test]
    fn idle_pipeline_never_publishes() {
        let (runner, source, publisher) = runner(Box::new(IdlePipeline));
        source.push(1);
        runner.run_cycle();
        assert_eq!(runner.cycles(), 1);
        assert!(publisher.published.lock().unwrap().is_empty());
    }

    #[test]
    fn pipeline_errors_abort_only_the_cycle() {
        let (runner, source, publisher) = runner(Box::new(FailingPipeline));
        source.push(1);
        runner.run_cycle();
        assert_eq!(runner.errors(), 1);
        assert_eq!(runner.cycles(), 0);

        runner.set_pipeline(Box::new(PassthroughPipeline));
        runner.run_cycle();
        assert_eq!(runner.cycles(), 1);
        assert_eq!(publisher.published.lock().unwrap().len(), 1);
    }

    #[test]
    fn publisher_errors_and_panics_are_contained() {
        let (runner, source, publisher) = runner(Box::new(PassthroughPipeline));
        publisher.fail.store(true, Ordering::SeqCst);
        source.push(1);
        runner.run_cycle();

        publisher.fail.store(false, Ordering::SeqCst);
        publisher.panic.store(true, Ordering::SeqCst);
        source.push(2);
        runner.run_cycle();

        assert_eq!(runner.publish_errors(), 2);
        assert_eq!(runner.cycles(), 2);
        assert_eq!(runner.output().frame_number(), Some(2));
    }

    #[test]
    fn runs_on_its_own_task_and_restarts() {
        let (runner, source, publisher) = runner(Box::new(PassthroughPipeline));
        source.push(1);
        runner.start().expect("start");
        let deadline = Instant::now() + Duration::from_secs(2);
        while runner.cycles() == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(runner.cycles(), 1);

        assert!(runner.restart().expect("restart"));
        source.push(2);
        let deadline = Instant::now() + Duration::from_secs(2);
        while runner.cycles() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        runner.stop();
        assert!(!runner.is_running());
        assert_eq!(*publisher.published.lock().unwrap(), vec![0, 0]);
    }
}
