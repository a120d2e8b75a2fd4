//! Frame types and sensor drivers feeding the perception pipeline.
//!
//! Physical drivers implement [`DepthSensor`]; the acquisition loop that owns
//! a sensor lives in the `vision` crate.

mod sensor;
mod synthetic;
mod types;

pub use sensor::DepthSensor;
pub use synthetic::{SyntheticControl, SyntheticScene, SyntheticSensor};
pub use types::{CaptureError, ColorFrame, DepthFrame, FrameFormat, FrameSet, Intrinsics};
