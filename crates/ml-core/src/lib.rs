//! Detection post-processing shared by every pipeline.
//!
//! The inference engine itself is an external collaborator behind
//! [`InferenceEngine`]; this crate owns everything around it: input
//! preparation, dequantization, confidence filtering, box clipping,
//! class-aware non-max suppression and the annotated overlay.

pub mod detector;
pub mod nms;
pub mod overlay;
pub mod tensor;
pub mod types;

pub use detector::{DetectError, Detector, ImageView, InferenceEngine};
pub use nms::{iou, non_max_suppression};
pub use tensor::{DType, InputTensor, Quantization, RawTensor, TensorData, TensorSpec};
pub use types::{Detection, Point3, Rect};
