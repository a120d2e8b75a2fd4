use std::time::Duration;

use crate::types::{CaptureError, FrameSet};

/// Driver side of a color + depth camera.
///
/// A sensor is owned by exactly one acquisition loop; nothing else touches
/// the handle. `wait_for_frames` must honour `timeout` so a dead device
/// cannot hang its caller.
pub trait DepthSensor: Send {
    /// Human readable identifier used in logs.
    fn describe(&self) -> String;

    fn open(&mut self) -> Result<(), CaptureError>;

    fn is_connected(&self) -> bool;

    fn wait_for_frames(&mut self, timeout: Duration) -> Result<FrameSet, CaptureError>;

    fn close(&mut self);
}

impl<S: DepthSensor + ?Sized> DepthSensor for Box<S> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    fn open(&mut self) -> Result<(), CaptureError> {
        (**self).open()
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn wait_for_frames(&mut self, timeout: Duration) -> Result<FrameSet, CaptureError> {
        (**self).wait_for_frames(timeout)
    }

    fn close(&mut self) {
        (**self).close()
    }
}
