use std::time::Duration;

use anyhow::Error;
use thiserror::Error;

/// Raw color frame captured from a sensor.
#[derive(Debug, Clone)]
pub struct ColorFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp_ms: i64,
    pub frame_number: u64,
    pub format: FrameFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
    /// Single-channel infrared.
    Gray8,
}

impl FrameFormat {
    pub fn channels(self) -> usize {
        match self {
            FrameFormat::Bgr8 => 3,
            FrameFormat::Gray8 => 1,
        }
    }
}

impl ColorFrame {
    /// Expand to BGR8, duplicating the gray channel for infrared frames.
    pub fn to_bgr8(&self) -> Vec<u8> {
        match self.format {
            FrameFormat::Bgr8 => self.data.clone(),
            FrameFormat::Gray8 => self.data.iter().flat_map(|v| [*v, *v, *v]).collect(),
        }
    }
}

/// Pinhole intrinsics of the stream the depth map is aligned to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Intrinsics {
    pub fx: f32,
    pub fy: f32,
    pub ppx: f32,
    pub ppy: f32,
    pub width: u32,
    pub height: u32,
}

impl Intrinsics {
    pub const fn new(fx: f32, fy: f32, ppx: f32, ppy: f32, width: u32, height: u32) -> Self {
        Self {
            fx,
            fy,
            ppx,
            ppy,
            width,
            height,
        }
    }

    /// Deproject a pixel at `depth` meters into camera space (no distortion).
    pub fn deproject(&self, pixel: (f32, f32), depth: f32) -> [f32; 3] {
        let x = (pixel.0 - self.ppx) / self.fx;
        let y = (pixel.1 - self.ppy) / self.fy;
        [depth * x, depth * y, depth]
    }
}

/// Raw depth frame, row-major, in sensor units.
///
/// Zero is the sensor's "no depth" value.
#[derive(Debug, Clone)]
pub struct DepthFrame {
    pub data: Vec<u16>,
    pub width: u32,
    pub height: u32,
    /// Meters per depth unit.
    pub depth_scale: f32,
    pub intrinsics: Intrinsics,
    pub timestamp_ms: i64,
    pub frame_number: u64,
}

impl DepthFrame {
    pub fn get(&self, x: u32, y: u32) -> Option<u16> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.data
            .get(y as usize * self.width as usize + x as usize)
            .copied()
    }

    /// Row slice `[x0, x1)` of row `y`.
    pub fn row(&self, y: u32, x0: u32, x1: u32) -> Option<&[u16]> {
        if y >= self.height || x0 > x1 || x1 > self.width {
            return None;
        }
        let start = y as usize * self.width as usize;
        self.data.get(start + x0 as usize..start + x1 as usize)
    }

    pub fn is_consistent(&self) -> bool {
        self.data.len() == self.width as usize * self.height as usize
    }
}

/// Color and depth captured together.
#[derive(Debug, Clone)]
pub struct FrameSet {
    pub color: ColorFrame,
    pub depth: DepthFrame,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open depth sensor {uri:?}")]
    Open { uri: String },
    #[error("no depth sensor connected")]
    NotConnected,
    #[error("no frame within {0:?}")]
    Timeout(Duration),
    #[error("incomplete frame set: {0}")]
    Incomplete(&'static str),
    #[error(transparent)]
    Other(#[from] Error),
}

impl CaptureError {
    /// Timeouts and partial frame sets are expected hiccups, not faults.
    pub fn is_transient(&self) -> bool {
        matches!(self, CaptureError::Timeout(_) | CaptureError::Incomplete(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deprojects_principal_point_onto_the_axis() {
        let intr = Intrinsics::new(500.0, 500.0, 320.0, 240.0, 640, 480);
        assert_eq!(intr.deproject((320.0, 240.0), 2.0), [0.0, 0.0, 2.0]);
        assert_eq!(intr.deproject((420.0, 140.0), 2.0), [0.4, -0.4, 2.0]);
    }

    #[test]
    fn depth_rows_are_bounds_checked() {
        let depth = DepthFrame {
            data: (0..12).collect(),
            width: 4,
            height: 3,
            depth_scale: 0.001,
            intrinsics: Intrinsics::new(1.0, 1.0, 0.0, 0.0, 4, 3),
            timestamp_ms: 0,
            frame_number: 0,
        };
        assert_eq!(depth.row(1, 1, 3), Some(&[5u16, 6][..]));
        assert_eq!(depth.row(3, 0, 1), None);
        assert_eq!(depth.row(0, 2, 5), None);
        assert_eq!(depth.get(3, 2), Some(11));
        assert!(depth.is_consistent());
    }

    #[test]
    fn gray_frames_expand_to_bgr() {
        let frame = ColorFrame {
            data: vec![7, 9],
            width: 2,
            height: 1,
            timestamp_ms: 0,
            frame_number: 0,
            format: FrameFormat::Gray8,
        };
        assert_eq!(frame.to_bgr8(), vec![7, 7, 7, 9, 9, 9]);
    }
}
