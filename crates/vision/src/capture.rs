//! Camera acquisition loop caching the latest color + depth snapshot.

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use video_ingest::{CaptureError, ColorFrame, DepthFrame, DepthSensor};

use crate::{
    periodic::PeriodicTask,
    pipeline::watchdog::{Heartbeat, STARTUP_GRACE},
};

/// Wait between acquisition iterations; the sensor wait paces the loop.
pub const DEFAULT_CAPTURE_INTERVAL: Duration = Duration::from_millis(10);
pub const DEFAULT_FRAME_TIMEOUT: Duration = Duration::from_secs(5);
/// Minimum gap between reconnect attempts of a dropped sensor.
const RECONNECT_BACKOFF: Duration = Duration::from_millis(500);

/// Color and depth frames captured together.
pub type Snapshot = (Arc<ColorFrame>, Arc<DepthFrame>);

/// Read side of a camera: cached snapshots, never blocking.
pub trait FrameSource: Send + Sync {
    /// The most recent color/depth pair, taken atomically.
    fn latest_frames(&self) -> Option<Snapshot>;

    fn is_connected(&self) -> bool;

    fn start(&self) -> Result<()>;

    fn stop(&self);
}

struct CameraShared {
    sensor: Mutex<Box<dyn DepthSensor>>,
    latest: Mutex<Option<Snapshot>>,
    opened: AtomicBool,
    connected: AtomicBool,
    frames: AtomicU64,
    timeouts: AtomicU64,
    frame_timeout: Duration,
    heartbeat: Heartbeat,
}

impl CameraShared {
    fn open_sensor(&self, sensor: &mut dyn DepthSensor) -> Result<(), CaptureError> {
        match sensor.open() {
            Ok(()) => {
                self.opened.store(true, Ordering::SeqCst);
                self.connected.store(true, Ordering::SeqCst);
                info!(sensor = %sensor.describe(), "depth sensor opened");
                Ok(())
            }
            Err(err) => {
                self.opened.store(false, Ordering::SeqCst);
                self.connected.store(sensor.is_connected(), Ordering::SeqCst);
                Err(err)
            }
        }
    }

    fn acquire(&self, next_reconnect: &mut Option<Instant>) {
        let mut sensor = self.sensor.lock().unwrap_or_else(PoisonError::into_inner);

        if !self.opened.load(Ordering::SeqCst) {
            if next_reconnect.is_some_and(|at| Instant::now() < at) {
                return;
            }
            if let Err(err) = self.open_sensor(&mut **sensor) {
                debug!("depth sensor reconnect failed: {err}");
                *next_reconnect = Some(Instant::now() + RECONNECT_BACKOFF);
                return;
            }
            *next_reconnect = None;
        }

        match sensor.wait_for_frames(self.frame_timeout) {
            Ok(frames) => {
                let snapshot = (Arc::new(frames.color), Arc::new(frames.depth));
                *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
                self.connected.store(true, Ordering::SeqCst);
                self.frames.fetch_add(1, Ordering::Relaxed);
                self.heartbeat.beat();
                metrics::counter!("capture_frames_total").increment(1);
            }
            Err(err) if err.is_transient() => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("capture_timeouts_total").increment(1);
                debug!("frame wait failed: {err}");
            }
            Err(err) => {
                warn!("depth sensor lost: {err}");
                sensor.close();
                self.opened.store(false, Ordering::SeqCst);
                self.connected.store(sensor.is_connected(), Ordering::SeqCst);
                *next_reconnect = Some(Instant::now() + RECONNECT_BACKOFF);
            }
        }
    }
}

/// Owns a [`DepthSensor`] and keeps the newest frame pair available.
///
/// Only the acquisition task touches the sensor while running. Readers get
/// `Arc` snapshots that stay valid after newer frames replace them.
pub struct CameraLoop {
    shared: Arc<CameraShared>,
    task: PeriodicTask,
}

impl CameraLoop {
    pub fn new(sensor: Box<dyn DepthSensor>, frame_timeout: Duration) -> Self {
        Self::with_interval(sensor, frame_timeout, DEFAULT_CAPTURE_INTERVAL)
    }

    pub fn with_interval(
        sensor: Box<dyn DepthSensor>,
        frame_timeout: Duration,
        interval: Duration,
    ) -> Self {
        let shared = Arc::new(CameraShared {
            sensor: Mutex::new(sensor),
            latest: Mutex::new(None),
            opened: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            frames: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            frame_timeout,
            heartbeat: Heartbeat::new("capture"),
        });
        let loop_shared = shared.clone();
        let mut next_reconnect = None;
        let task = PeriodicTask::new("camera", interval, move || {
            loop_shared.acquire(&mut next_reconnect);
        })
        .with_stop_timeout(frame_timeout + Duration::from_secs(1));
        Self { shared, task }
    }

    pub fn frames_captured(&self) -> u64 {
        self.shared.frames.load(Ordering::Relaxed)
    }

    pub fn frame_timeouts(&self) -> u64 {
        self.shared.timeouts.load(Ordering::Relaxed)
    }

    pub fn heartbeat(&self) -> &Heartbeat {
        &self.shared.heartbeat
    }

    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }

    /// Stop, close and reopen the sensor, then resume acquisition.
    ///
    /// Returns `Ok(false)` when the sensor is still not connected.
    pub fn restart(&self) -> Result<bool> {
        info!("restarting camera loop");
        FrameSource::stop(self);
        match FrameSource::start(self) {
            Ok(()) => Ok(self.is_connected()),
            Err(err) if !self.is_connected() => {
                warn!("camera restart failed: {err:#}");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }
}

impl FrameSource for CameraLoop {
    fn latest_frames(&self) -> Option<Snapshot> {
        self.shared
            .latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Open the sensor and start acquiring. A no-op when already running.
    fn start(&self) -> Result<()> {
        if self.task.is_running() {
            return Ok(());
        }
        {
            let mut sensor = self
                .shared
                .sensor
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !self.shared.opened.load(Ordering::SeqCst) {
                let description = sensor.describe();
                self.shared
                    .open_sensor(&mut **sensor)
                    .with_context(|| format!("failed to open {description}"))?;
            }
        }
        self.shared.heartbeat.rearm(STARTUP_GRACE);
        self.task.start().context("failed to spawn camera thread")
    }

    fn stop(&self) {
        self.task.stop();
        let mut sensor = self
            .shared
            .sensor
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.shared.opened.swap(false, Ordering::SeqCst) {
            sensor.close();
            debug!("depth sensor closed");
        }
        self.shared.connected.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use video_ingest::{SyntheticScene, SyntheticSensor};

    fn scene() -> SyntheticScene {
        SyntheticScene {
            width: 64,
            height: 48,
            fps: 200,
            block: (10, 10, 8, 8),
            block_depth_mm: 1200,
            background_depth_mm: 0,
            drift_px: 0,
        }
    }

    fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn caches_latest_snapshot() {
        let camera = CameraLoop::with_interval(
            Box::new(SyntheticSensor::new(scene())),
            Duration::from_millis(200),
            Duration::from_millis(1),
        );
        assert!(camera.latest_frames().is_none());
        camera.start().expect("start");
        assert!(wait_for(Duration::from_secs(2), || camera.frames_captured() >= 2));
        assert!(camera.is_connected());

        let (color, depth) = camera.latest_frames().expect("snapshot");
        assert_eq!(depth.get(12, 12), Some(1200));
        assert_eq!((color.width, color.height), (64, 48));

        camera.stop();
        assert!(!camera.is_connected());
        assert!(!camera.is_running());
        // Snapshots survive a stop.
        assert!(camera.latest_frames().is_some());
    }

    #[test]
    fn color_and_depth_always_come_from_the_same_frame() {
        let camera = CameraLoop::with_interval(
            Box::new(SyntheticSensor::new(scene())),
            Duration::from_millis(200),
            Duration::from_millis(1),
        );
        camera.start().expect("start");
        let deadline = Instant::now() + Duration::from_millis(300);
        let mut samples = 0;
        while Instant::now() < deadline {
            if let Some((color, depth)) = camera.latest_frames() {
                assert_eq!(color.frame_number, depth.frame_number);
                samples += 1;
            }
            thread::sleep(Duration::from_millis(1));
        }
        camera.stop();
        assert!(samples > 0);
    }

    #[test]
    fn start_fails_when_sensor_is_unplugged() {
        let sensor = SyntheticSensor::new(scene());
        sensor.control().unplug();
        let camera = CameraLoop::new(Box::new(sensor), Duration::from_millis(50));
        assert!(camera.start().is_err());
        assert!(!camera.is_running());
    }

    #[test]
    fn tracks_disconnect_and_recovers_through_restart() {
        let sensor = SyntheticSensor::new(scene());
        let control = sensor.control();
        let camera = CameraLoop::with_interval(
            Box::new(sensor),
            Duration::from_millis(100),
            Duration::from_millis(1),
        );
        camera.start().expect("start");
        assert!(wait_for(Duration::from_secs(2), || camera.frames_captured() >= 1));

        control.unplug();
        assert!(wait_for(Duration::from_secs(2), || !camera.is_connected()));
        assert!(!camera.restart().expect("restart"));

        control.plug();
        assert!(camera.restart().expect("restart"));
        let before = camera.frames_captured();
        assert!(wait_for(Duration::from_secs(2), || camera.frames_captured() > before));
        camera.stop();
    }

    #[test]
    fn dropped_frames_count_as_timeouts() {
        let sensor = SyntheticSensor::new(scene());
        sensor.control().drop_frames(2);
        let camera = CameraLoop::with_interval(
            Box::new(sensor),
            Duration::from_millis(20),
            Duration::from_millis(1),
        );
        camera.start().expect("start");
        assert!(wait_for(Duration::from_secs(2), || camera.frames_captured() >= 1));
        camera.stop();
        assert_eq!(camera.frame_timeouts(), 2);
    }
}
