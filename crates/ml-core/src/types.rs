use serde::Serialize;

/// Axis-aligned box in integer pixel coordinates (`x1, y1, x2, y2`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub const fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// A rect is usable only when it has strictly positive width and height.
    pub fn is_valid(&self) -> bool {
        self.left < self.right && self.top < self.bottom
    }

    /// Edges are widened before subtracting so extreme coordinates cannot
    /// overflow.
    pub fn width(&self) -> i64 {
        i64::from(self.right) - i64::from(self.left)
    }

    pub fn height(&self) -> i64 {
        i64::from(self.bottom) - i64::from(self.top)
    }

    pub fn area(&self) -> i64 {
        if !self.is_valid() {
            return 0;
        }
        self.width().saturating_mul(self.height())
    }

    /// Integer center, rounded towards the top-left like the sensor grid.
    pub fn center(&self) -> (i32, i32) {
        // Midpoint of two i32 values always fits back into i32.
        (
            (i64::from(self.left) + self.width() / 2) as i32,
            (i64::from(self.top) + self.height() / 2) as i32,
        )
    }

    /// Clamp every edge into `[0, width-1] x [0, height-1]`.
    ///
    /// Returns `None` when the clamped rect is degenerate; such rects are
    /// dropped rather than repaired.
    pub fn clamped(&self, width: u32, height: u32) -> Option<Rect> {
        if width == 0 || height == 0 {
            return None;
        }
        let max_x = width.saturating_sub(1).min(i32::MAX as u32) as i32;
        let max_y = height.saturating_sub(1).min(i32::MAX as u32) as i32;
        let rect = Rect {
            left: self.left.clamp(0, max_x),
            top: self.top.clamp(0, max_y),
            right: self.right.clamp(0, max_x),
            bottom: self.bottom.clamp(0, max_y),
        };
        rect.is_valid().then_some(rect)
    }

    pub fn intersection_area(&self, other: &Rect) -> i64 {
        let x1 = self.left.max(other.left);
        let y1 = self.top.max(other.top);
        let x2 = self.right.min(other.right);
        let y2 = self.bottom.min(other.bottom);
        if x2 <= x1 || y2 <= y1 {
            return 0;
        }
        (i64::from(x2) - i64::from(x1)).saturating_mul(i64::from(y2) - i64::from(y1))
    }
}

/// Point in the camera frame, meters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Point3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Point3 {
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// Single detection produced by one inference cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub rect: Rect,
    pub class_id: i64,
    pub confidence: f32,
    /// 3D position in camera space, absent when no valid depth was sampled.
    pub point: Option<Point3>,
    /// Depth of the sampled pixel in millimeters.
    pub depth_mm: Option<f32>,
}

impl Detection {
    pub fn new(rect: Rect, class_id: i64, confidence: f32) -> Self {
        Self {
            rect,
            class_id,
            confidence,
            point: None,
            depth_mm: None,
        }
    }

    /// Attach a localization result, consuming the 2D-only detection.
    pub fn with_position(mut self, point: Point3, depth_mm: f32) -> Self {
        self.point = Some(point);
        self.depth_mm = Some(depth_mm);
        self
    }
}
