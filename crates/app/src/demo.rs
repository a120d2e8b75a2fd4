//! Stand-in inference engine for running without a model.
//!
//! Finds the bounding box of bright pixels and reports it as a single class-0
//! detection. Scores come back as quantized `u8` like an edge accelerator
//! would return them.

use anyhow::{Result, bail};
use ml_core::{DType, InferenceEngine, InputTensor, Quantization, RawTensor, TensorData, TensorSpec};

/// Luma above which a pixel belongs to the target.
const BRIGHT_LUMA: u32 = 200;
/// Fewer bright pixels than this is treated as noise.
const MIN_PIXELS: usize = 16;

pub struct DemoEngine {
    spec: TensorSpec,
}

impl DemoEngine {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            spec: TensorSpec::nhwc(height as usize, width as usize, DType::U8),
        }
    }
}

impl InferenceEngine for DemoEngine {
    fn input_spec(&self) -> &TensorSpec {
        &self.spec
    }

    fn run(&mut self, input: &InputTensor) -> Result<Vec<RawTensor>> {
        let TensorData::U8(rgb) = &input.data else {
            bail!("demo engine expects u8 input, got {:?}", input.data.dtype());
        };
        let width = self.spec.width();

        let mut bright = 0usize;
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (usize::MAX, usize::MAX, 0, 0);
        for (idx, px) in rgb.chunks_exact(3).enumerate() {
            let luma = (u32::from(px[0]) * 299 + u32::from(px[1]) * 587 + u32::from(px[2]) * 114) / 1000;
            if luma <= BRIGHT_LUMA {
                continue;
            }
            let (x, y) = (idx % width, idx / width);
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
            bright += 1;
        }

        if bright < MIN_PIXELS {
            return Ok(outputs(&[], &[]));
        }

        let area = (max_x + 1 - min_x) * (max_y + 1 - min_y);
        let fill = bright as f32 / area as f32;
        let score = (fill * 255.0).round().clamp(0.0, 255.0) as u8;
        let rect = [
            min_x as f32,
            min_y as f32,
            (max_x + 1) as f32,
            (max_y + 1) as f32,
        ];
        Ok(outputs(&[rect], &[score]))
    }
}

fn outputs(boxes: &[[f32; 4]], scores: &[u8]) -> Vec<RawTensor> {
    let n = boxes.len();
    vec![
        RawTensor::f32(vec![1, n, 4], boxes.iter().flatten().copied().collect()),
        RawTensor::new(
            vec![1, n],
            TensorData::U8(scores.to_vec()),
            Quantization::new(1.0 / 255.0, 0),
        ),
        RawTensor::new(vec![1, n], TensorData::U8(vec![0; n]), Quantization::new(0.0, 0)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use ml_core::{Detector, detector::ImageView};

    fn frame(width: u32, height: u32, block: (u32, u32, u32, u32)) -> Vec<u8> {
        let mut bgr = vec![20u8; (width * height * 3) as usize];
        let (bx, by, bw, bh) = block;
        for y in by..by + bh {
            for x in bx..bx + bw {
                let idx = ((y * width + x) * 3) as usize;
                bgr[idx..idx + 3].fill(250);
            }
        }
        bgr
    }

    #[test]
    fn detects_bright_block() {
        let bgr = frame(64, 48, (10, 8, 12, 6));
        let mut detector = Detector::new(Box::new(DemoEngine::new(64, 48)));
        let detections = detector
            .detect(ImageView::new(&bgr, 64, 48), 0.5, 0.45)
            .expect("detect");
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].rect, ml_core::Rect::new(10, 8, 22, 14));
        assert_eq!(detections[0].class_id, 0);
        assert!((detections[0].confidence - 1.0).abs() < 1e-6);
    }

    #[test]
    fn dark_frame_yields_nothing() {
        let bgr = vec![10u8; 64 * 48 * 3];
        let mut detector = Detector::new(Box::new(DemoEngine::new(64, 48)));
        let detections = detector
            .detect(ImageView::new(&bgr, 64, 48), 0.5, 0.45)
            .expect("detect");
        assert!(detections.is_empty());
    }
}
