//! Synthetic depth camera rendering a bright block at a known depth.
//!
//! Used for demos and tests where no hardware is attached. A
//! [`SyntheticControl`] handle can unplug the device or inject dropped frames
//! from another thread.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use chrono::Utc;
use tracing::debug;

use crate::{
    sensor::DepthSensor,
    types::{CaptureError, ColorFrame, DepthFrame, FrameFormat, FrameSet, Intrinsics},
};

/// Scene rendered by the synthetic camera.
#[derive(Debug, Clone)]
pub struct SyntheticScene {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Block position `(left, top, width, height)` at frame zero.
    pub block: (u32, u32, u32, u32),
    pub block_depth_mm: u16,
    /// Depth of the background, zero renders "no depth".
    pub background_depth_mm: u16,
    /// Horizontal drift of the block in pixels per frame.
    pub drift_px: u32,
}

impl Default for SyntheticScene {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
            block: (280, 200, 80, 80),
            block_depth_mm: 1500,
            background_depth_mm: 0,
            drift_px: 0,
        }
    }
}

impl SyntheticScene {
    pub fn intrinsics(&self) -> Intrinsics {
        let focal = self.width as f32 * 0.78;
        Intrinsics::new(
            focal,
            focal,
            self.width as f32 / 2.0,
            self.height as f32 / 2.0,
            self.width,
            self.height,
        )
    }

    fn block_at(&self, frame_number: u64) -> (u32, u32, u32, u32) {
        let (left, top, w, h) = self.block;
        if self.drift_px == 0 {
            return (left, top, w, h);
        }
        let span = u64::from(self.width.saturating_sub(w).max(1));
        let offset = (u64::from(left) + frame_number * u64::from(self.drift_px)) % span;
        (offset as u32, top, w, h)
    }
}

/// Shared switches for fault injection.
#[derive(Debug, Clone)]
pub struct SyntheticControl {
    connected: Arc<AtomicBool>,
    drop_next: Arc<AtomicU32>,
}

impl SyntheticControl {
    pub fn unplug(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn plug(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    /// Make the next `count` frame waits time out.
    pub fn drop_frames(&self, count: u32) {
        self.drop_next.store(count, Ordering::SeqCst);
    }
}

pub struct SyntheticSensor {
    scene: SyntheticScene,
    control: SyntheticControl,
    opened: bool,
    frame_number: u64,
    last_frame: Option<Instant>,
}

impl SyntheticSensor {
    pub fn new(scene: SyntheticScene) -> Self {
        Self {
            scene,
            control: SyntheticControl {
                connected: Arc::new(AtomicBool::new(true)),
                drop_next: Arc::new(AtomicU32::new(0)),
            },
            opened: false,
            frame_number: 0,
            last_frame: None,
        }
    }

    pub fn control(&self) -> SyntheticControl {
        self.control.clone()
    }

    pub fn scene(&self) -> &SyntheticScene {
        &self.scene
    }

    fn frame_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.scene.fps.max(1)))
    }

    /// Render the frame set for `frame_number` without pacing.
    pub fn render(&self, frame_number: u64) -> FrameSet {
        let scene = &self.scene;
        let (bx, by, bw, bh) = scene.block_at(frame_number);
        let pixels = scene.width as usize * scene.height as usize;
        let mut color = vec![32u8; pixels * 3];
        let mut depth = vec![scene.background_depth_mm; pixels];

        for y in by..(by + bh).min(scene.height) {
            for x in bx..(bx + bw).min(scene.width) {
                let idx = y as usize * scene.width as usize + x as usize;
                color[idx * 3..idx * 3 + 3].copy_from_slice(&[240, 240, 240]);
                depth[idx] = scene.block_depth_mm;
            }
        }

        let timestamp_ms = Utc::now().timestamp_millis();
        FrameSet {
            color: ColorFrame {
                data: color,
                width: scene.width,
                height: scene.height,
                timestamp_ms,
                frame_number,
                format: FrameFormat::Bgr8,
            },
            depth: DepthFrame {
                data: depth,
                width: scene.width,
                height: scene.height,
                depth_scale: 0.001,
                intrinsics: scene.intrinsics(),
                timestamp_ms,
                frame_number,
            },
        }
    }
}

impl DepthSensor for SyntheticSensor {
    fn describe(&self) -> String {
        format!(
            "synthetic {}x{}@{}",
            self.scene.width, self.scene.height, self.scene.fps
        )
    }

    fn open(&mut self) -> Result<(), CaptureError> {
        if !self.is_connected() {
            return Err(CaptureError::Open {
                uri: self.describe(),
            });
        }
        self.opened = true;
        self.last_frame = None;
        debug!(sensor = %self.describe(), "synthetic sensor opened");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.control.connected.load(Ordering::SeqCst)
    }

    fn wait_for_frames(&mut self, timeout: Duration) -> Result<FrameSet, CaptureError> {
        if !self.is_connected() {
            self.opened = false;
            return Err(CaptureError::NotConnected);
        }
        if !self.opened {
            return Err(CaptureError::Incomplete("sensor not opened"));
        }

        let dropped = self
            .control
            .drop_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if dropped {
            thread::sleep(timeout.min(self.frame_period()));
            return Err(CaptureError::Timeout(timeout));
        }

        let period = self.frame_period();
        if let Some(last) = self.last_frame {
            let due = last + period;
            let now = Instant::now();
            if due > now {
                let wait = due - now;
                if wait > timeout {
                    thread::sleep(timeout);
                    return Err(CaptureError::Timeout(timeout));
                }
                thread::sleep(wait);
            }
        }
        self.last_frame = Some(Instant::now());

        let frames = self.render(self.frame_number);
        self.frame_number = self.frame_number.wrapping_add(1);
        Ok(frames)
    }

    fn close(&mut self) {
        if self.opened {
            debug!(sensor = %self.describe(), "synthetic sensor closed");
        }
        self.opened = false;
    }
}
