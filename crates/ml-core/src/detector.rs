use anyhow::Result;
use thiserror::Error;
use tracing::debug;

use crate::{
    nms::non_max_suppression,
    tensor::{DType, InputTensor, RawTensor, TensorData, TensorSpec},
    types::{Detection, Rect},
};

/// Upper bound on detections returned for a single frame.
pub const MAX_DETECTIONS: usize = 512;

/// Tensor-in/tensor-out model runtime.
///
/// Outputs are expected in SSD post-processed order: boxes `[1, N, 4]` as
/// pixel `x1, y1, x2, y2`, scores `[1, N]`, classes `[1, N]`. Each output
/// carries its own quantization parameters.
pub trait InferenceEngine: Send {
    fn input_spec(&self) -> &TensorSpec;

    fn run(&mut self, input: &InputTensor) -> Result<Vec<RawTensor>>;
}

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("unexpected frame buffer size: got {got} bytes, expected {expected}")]
    BufferSize { got: usize, expected: usize },
    #[error("frame size {width}x{height} does not match detector input {input_width}x{input_height}")]
    InputSize {
        width: u32,
        height: u32,
        input_width: usize,
        input_height: usize,
    },
    #[error("detector input must have 3 channels, engine expects {0}")]
    Channels(usize),
    #[error("engine input is int8 but carries no quantization parameters")]
    InputQuantization,
    #[error("inference failed: {0:#}")]
    Inference(anyhow::Error),
    #[error("malformed model output: {0}")]
    MalformedOutput(String),
}

/// Borrowed BGR8 interleaved image.
#[derive(Debug, Clone, Copy)]
pub struct ImageView<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
}

impl<'a> ImageView<'a> {
    pub fn new(data: &'a [u8], width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
        }
    }
}

/// Detector wrapping an inference engine with pre- and post-processing.
pub struct Detector {
    engine: Box<dyn InferenceEngine>,
    max_detections: usize,
    frames: u64,
}

impl Detector {
    pub fn new(engine: Box<dyn InferenceEngine>) -> Self {
        Self {
            engine,
            max_detections: MAX_DETECTIONS,
            frames: 0,
        }
    }

    /// Run the full detection pass over one frame.
    ///
    /// Returns surviving detections in NMS keep order, highest confidence
    /// first. An empty list is a normal result.
    pub fn detect(
        &mut self,
        image: ImageView<'_>,
        confidence_threshold: f32,
        iou_threshold: f32,
    ) -> Result<Vec<Detection>, DetectError> {
        let input = self.prepare_input(image)?;
        let outputs = self.engine.run(&input).map_err(DetectError::Inference)?;
        let candidates = decode_candidates(&outputs, image.width, image.height, confidence_threshold)?;
        let candidate_count = candidates.len();

        let mut detections = non_max_suppression(candidates, iou_threshold);
        detections.truncate(self.max_detections);

        self.frames = self.frames.wrapping_add(1);
        if self.frames % 100 == 0 {
            debug!(
                frames = self.frames,
                candidates = candidate_count,
                kept = detections.len(),
                "detector heartbeat"
            );
        }

        Ok(detections)
    }

    /// Convert a BGR frame into the engine's input layout (RGB, NHWC).
    fn prepare_input(&self, image: ImageView<'_>) -> Result<InputTensor, DetectError> {
        let spec = self.engine.input_spec();
        if spec.channels() != 3 {
            return Err(DetectError::Channels(spec.channels()));
        }
        if (image.width as usize, image.height as usize) != (spec.width(), spec.height()) {
            return Err(DetectError::InputSize {
                width: image.width,
                height: image.height,
                input_width: spec.width(),
                input_height: spec.height(),
            });
        }
        let expected = (image.width as usize) * (image.height as usize) * 3;
        if image.data.len() != expected {
            return Err(DetectError::BufferSize {
                got: image.data.len(),
                expected,
            });
        }

        let rgb = image
            .data
            .chunks_exact(3)
            .flat_map(|px| [px[2], px[1], px[0]]);
        let data = match spec.dtype {
            DType::U8 => TensorData::U8(rgb.collect()),
            DType::I8 => {
                let q = spec.quantization;
                if q.is_disabled() {
                    return Err(DetectError::InputQuantization);
                }
                TensorData::I8(
                    rgb.map(|v| q.quantize(f32::from(v) / 255.0).round().clamp(-128.0, 127.0) as i8)
                        .collect(),
                )
            }
            DType::F32 => TensorData::F32(rgb.map(|v| f32::from(v) / 255.0).collect()),
        };

        Ok(InputTensor {
            shape: spec.shape,
            data,
        })
    }
}

/// Decode raw boxes/scores/classes into confidence-filtered, clipped candidates.
pub fn decode_candidates(
    outputs: &[RawTensor],
    width: u32,
    height: u32,
    confidence_threshold: f32,
) -> Result<Vec<Detection>, DetectError> {
    let [boxes, scores, classes] = match outputs {
        [boxes, scores, classes, ..] => [boxes, scores, classes],
        _ => {
            return Err(DetectError::MalformedOutput(format!(
                "expected boxes, scores and classes tensors, got {} output(s)",
                outputs.len()
            )));
        }
    };

    if boxes.shape.len() != 3 || boxes.shape[0] != 1 || boxes.shape[2] != 4 {
        return Err(DetectError::MalformedOutput(format!(
            "boxes tensor must be [1, N, 4], got {:?}",
            boxes.shape
        )));
    }
    let count = boxes.shape[1];
    for (name, tensor, expected) in [
        ("boxes", boxes, count * 4),
        ("scores", scores, count),
        ("classes", classes, count),
    ] {
        if tensor.element_count() != expected || tensor.data.len() != expected {
            return Err(DetectError::MalformedOutput(format!(
                "{name} tensor has shape {:?} with {} element(s), expected {expected}",
                tensor.shape,
                tensor.data.len()
            )));
        }
    }

    let max_x = width.saturating_sub(1) as f32;
    let max_y = height.saturating_sub(1) as f32;
    let mut candidates = Vec::new();

    for i in 0..count {
        let Some(score) = scores.value(i) else {
            continue;
        };
        if !score.is_finite() || score < confidence_threshold {
            continue;
        }

        let coords: Option<Vec<f32>> = (0..4).map(|k| boxes.value(i * 4 + k)).collect();
        let Some(coords) = coords else {
            continue;
        };
        if coords.iter().any(|c| !c.is_finite()) {
            continue;
        }

        let x1 = coords[0].clamp(0.0, max_x);
        let y1 = coords[1].clamp(0.0, max_y);
        let x2 = coords[2].clamp(0.0, max_x);
        let y2 = coords[3].clamp(0.0, max_y);
        if x1 >= x2 || y1 >= y2 {
            continue;
        }

        let rect = Rect::new(
            x1.round() as i32,
            y1.round() as i32,
            x2.round() as i32,
            y2.round() as i32,
        );
        if !rect.is_valid() {
            continue;
        }

        let class_id = classes.value(i).map(|c| c.round() as i64).unwrap_or(0);
        candidates.push(Detection::new(rect, class_id, score.min(1.0)));
    }

    Ok(candidates)
}
