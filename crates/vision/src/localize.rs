//! Box + depth map to a 3D point in camera space.

use ml_core::{Point3, Rect};
use thiserror::Error;
use video_ingest::DepthFrame;

#[derive(Debug, Error, PartialEq)]
pub enum LocalizeError {
    #[error("depth buffer holds {got} samples, expected {expected} for {width}x{height}")]
    BufferSize {
        got: usize,
        expected: usize,
        width: u32,
        height: u32,
    },
    #[error("invalid focal length fx={fx} fy={fy}")]
    FocalLength { fx: f32, fy: f32 },
    #[error("invalid depth scale {0}")]
    DepthScale(f32),
}

/// How a single depth is picked from the samples inside a box.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DepthSampling {
    /// Closest valid sample, deprojected at its own pixel.
    #[default]
    Nearest,
    /// Median of the valid samples, deprojected at the box center.
    Median,
}

impl std::str::FromStr for DepthSampling {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nearest" => Ok(DepthSampling::Nearest),
            "median" => Ok(DepthSampling::Median),
            other => Err(format!("unknown depth sampling {other:?} (nearest, median)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Localized {
    /// Camera-space position in meters.
    pub point: Point3,
    /// Pixel the point was deprojected from.
    pub pixel: (u32, u32),
    pub depth_raw: u16,
    pub depth_mm: f32,
}

/// Localize `rect` in `depth`.
///
/// Only non-zero samples count. When the box holds none, there is no 3D
/// position and `Ok(None)` is returned rather than a point at the origin.
pub fn localize(
    rect: &Rect,
    depth: &DepthFrame,
    sampling: DepthSampling,
) -> Result<Option<Localized>, LocalizeError> {
    validate(depth)?;

    let Some(rect) = rect.clamped(depth.width, depth.height) else {
        return Ok(None);
    };
    // Clamped edges are within the frame and non-negative.
    let (left, top, right, bottom) = (
        rect.left as u32,
        rect.top as u32,
        rect.right as u32,
        rect.bottom as u32,
    );
    let (cx, cy) = rect.center();
    let center = (cx as u32, cy as u32);

    let sample = match sampling {
        DepthSampling::Nearest => nearest(depth, left, top, right, bottom),
        DepthSampling::Median => median(depth, left, top, right, bottom).map(|raw| (center, raw)),
    };
    let (pixel, raw) = sample.unwrap_or((center, 0));
    if raw == 0 {
        return Ok(None);
    }

    let meters = f32::from(raw) * depth.depth_scale;
    let [x, y, z] = depth
        .intrinsics
        .deproject((pixel.0 as f32, pixel.1 as f32), meters);
    Ok(Some(Localized {
        point: Point3 { x, y, z },
        pixel,
        depth_raw: raw,
        depth_mm: meters * 1000.0,
    }))
}

fn validate(depth: &DepthFrame) -> Result<(), LocalizeError> {
    if !depth.is_consistent() {
        return Err(LocalizeError::BufferSize {
            got: depth.data.len(),
            expected: depth.width as usize * depth.height as usize,
            width: depth.width,
            height: depth.height,
        });
    }
    let (fx, fy) = (depth.intrinsics.fx, depth.intrinsics.fy);
    if !fx.is_finite() || !fy.is_finite() || fx == 0.0 || fy == 0.0 {
        return Err(LocalizeError::FocalLength { fx, fy });
    }
    if !depth.depth_scale.is_finite() || depth.depth_scale <= 0.0 {
        return Err(LocalizeError::DepthScale(depth.depth_scale));
    }
    Ok(())
}

/// Row-major scan of `[top, bottom) x [left, right)`; the first minimum wins.
fn nearest(
    depth: &DepthFrame,
    left: u32,
    top: u32,
    right: u32,
    bottom: u32,
) -> Option<((u32, u32), u16)> {
    let mut best: Option<((u32, u32), u16)> = None;
    for y in top..bottom {
        let row = depth.row(y, left, right)?;
        for (dx, &value) in row.iter().enumerate() {
            if value == 0 {
                continue;
            }
            if best.is_none_or(|(_, current)| value < current) {
                best = Some(((left + dx as u32, y), value));
            }
        }
    }
    best
}

fn median(depth: &DepthFrame, left: u32, top: u32, right: u32, bottom: u32) -> Option<u16> {
    let mut samples: Vec<u16> = (top..bottom)
        .filter_map(|y| depth.row(y, left, right))
        .flat_map(|row| row.iter().copied().filter(|&v| v != 0))
        .collect();
    if samples.is_empty() {
        return None;
    }
    let mid = samples.len() / 2;
    let (_, value, _) = samples.select_nth_unstable(mid);
    Some(*value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use video_ingest::Intrinsics;

    fn frame(width: u32, height: u32, fill: u16) -> DepthFrame {
        DepthFrame {
            data: vec![fill; width as usize * height as usize],
            width,
            height,
            depth_scale: 0.001,
            intrinsics: Intrinsics::new(500.0, 500.0, 320.0, 240.0, width, height),
            timestamp_ms: 0,
            frame_number: 0,
        }
    }

    fn set(depth: &mut DepthFrame, x: u32, y: u32, value: u16) {
        let idx = (y * depth.width + x) as usize;
        depth.data[idx] = value;
    }

    #[test]
    fn all_zero_crop_has_no_position() {
        let depth = frame(64, 48, 0);
        let result = localize(&Rect::new(5, 5, 20, 20), &depth, DepthSampling::Nearest);
        assert_eq!(result, Ok(None));
        let result = localize(&Rect::new(5, 5, 20, 20), &depth, DepthSampling::Median);
        assert_eq!(result, Ok(None));
    }

    #[test]
    fn nearest_picks_minimum_valid_sample_and_its_pixel() {
        let mut depth = frame(64, 48, 0);
        set(&mut depth, 10, 12, 1800);
        set(&mut depth, 14, 15, 900);
        set(&mut depth, 16, 16, 900);
        set(&mut depth, 40, 40, 100);

        let hit = localize(&Rect::new(5, 5, 20, 20), &depth, DepthSampling::Nearest)
            .unwrap()
            .expect("valid depth");
        assert_eq!(hit.pixel, (14, 15));
        assert_eq!(hit.depth_raw, 900);
        assert!((hit.depth_mm - 900.0).abs() < 1e-3);
        assert!((hit.point.z - 0.9).abs() < 1e-6);
    }

    #[test]
    fn crop_excludes_right_and_bottom_edges() {
        let mut depth = frame(64, 48, 0);
        set(&mut depth, 20, 10, 500);
        set(&mut depth, 10, 20, 500);
        let result = localize(&Rect::new(5, 5, 20, 20), &depth, DepthSampling::Nearest);
        assert_eq!(result, Ok(None));
    }

    #[test]
    fn median_uses_box_center() {
        let mut depth = frame(64, 48, 0);
        set(&mut depth, 6, 6, 1000);
        set(&mut depth, 7, 6, 2000);
        set(&mut depth, 8, 6, 3000);

        let hit = localize(&Rect::new(4, 4, 12, 12), &depth, DepthSampling::Median)
            .unwrap()
            .expect("valid depth");
        assert_eq!(hit.depth_raw, 2000);
        assert_eq!(hit.pixel, (8, 8));
    }

    #[test]
    fn deprojection_follows_pinhole_model() {
        let mut depth = frame(640, 480, 0);
        set(&mut depth, 420, 140, 2000);
        let hit = localize(&Rect::new(410, 130, 430, 150), &depth, DepthSampling::Nearest)
            .unwrap()
            .expect("valid depth");
        assert!((hit.point.x - 0.4).abs() < 1e-5);
        assert!((hit.point.y + 0.4).abs() < 1e-5);
        assert!((hit.point.z - 2.0).abs() < 1e-6);
    }

    #[test]
    fn rect_outside_frame_is_not_localized() {
        let depth = frame(64, 48, 1000);
        let result = localize(&Rect::new(100, 100, 120, 120), &depth, DepthSampling::Nearest);
        assert_eq!(result, Ok(None));
    }

    #[test]
    fn inconsistent_buffer_is_an_error() {
        let mut depth = frame(64, 48, 1000);
        depth.data.truncate(10);
        let err = localize(&Rect::new(0, 0, 10, 10), &depth, DepthSampling::Nearest).unwrap_err();
        assert!(matches!(err, LocalizeError::BufferSize { got: 10, expected: 3072, .. }));
    }

    #[test]
    fn bad_focal_length_is_an_error() {
        let mut depth = frame(64, 48, 1000);
        depth.intrinsics.fx = 0.0;
        assert!(matches!(
            localize(&Rect::new(0, 0, 10, 10), &depth, DepthSampling::Nearest),
            Err(LocalizeError::FocalLength { .. })
        ));
        depth.intrinsics.fx = f32::NAN;
        assert!(localize(&Rect::new(0, 0, 10, 10), &depth, DepthSampling::Nearest).is_err());
    }

    #[test]
    fn sampling_parses_from_cli_names() {
        assert_eq!("median".parse::<DepthSampling>(), Ok(DepthSampling::Median));
        assert_eq!("nearest".parse::<DepthSampling>(), Ok(DepthSampling::Nearest));
        assert!("closest".parse::<DepthSampling>().is_err());
    }
}
