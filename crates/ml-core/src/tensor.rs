//! Host-side tensors exchanged with the inference engine.

/// Element type of a tensor as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    U8,
    I8,
    F32,
}

/// Affine quantization parameters attached to a tensor.
///
/// A `scale` of exactly zero marks a tensor that is already real-valued.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Quantization {
    pub scale: f32,
    pub zero_point: i32,
}

impl Quantization {
    pub const fn new(scale: f32, zero_point: i32) -> Self {
        Self { scale, zero_point }
    }

    pub fn is_disabled(&self) -> bool {
        self.scale == 0.0
    }

    pub fn dequantize(&self, raw: f32) -> f32 {
        if self.is_disabled() {
            return raw;
        }
        (raw - self.zero_point as f32) * self.scale
    }

    /// Inverse of [`Quantization::dequantize`], before rounding.
    pub fn quantize(&self, real: f32) -> f32 {
        if self.is_disabled() {
            return real;
        }
        real / self.scale + self.zero_point as f32
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    U8(Vec<u8>),
    I8(Vec<i8>),
    F32(Vec<f32>),
}

impl TensorData {
    pub fn dtype(&self) -> DType {
        match self {
            TensorData::U8(_) => DType::U8,
            TensorData::I8(_) => DType::I8,
            TensorData::F32(_) => DType::F32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::U8(v) => v.len(),
            TensorData::I8(v) => v.len(),
            TensorData::F32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Raw output tensor, possibly quantized.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTensor {
    pub shape: Vec<usize>,
    pub data: TensorData,
    pub quantization: Quantization,
}

impl RawTensor {
    pub fn new(shape: Vec<usize>, data: TensorData, quantization: Quantization) -> Self {
        Self {
            shape,
            data,
            quantization,
        }
    }

    pub fn f32(shape: Vec<usize>, data: Vec<f32>) -> Self {
        Self::new(shape, TensorData::F32(data), Quantization::default())
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Real value at flat index `idx`.
    ///
    /// 8-bit integer tensors go through the affine dequantization; float
    /// tensors pass through untouched.
    pub fn value(&self, idx: usize) -> Option<f32> {
        match &self.data {
            TensorData::U8(v) => v
                .get(idx)
                .map(|raw| self.quantization.dequantize(f32::from(*raw))),
            TensorData::I8(v) => v
                .get(idx)
                .map(|raw| self.quantization.dequantize(f32::from(*raw))),
            TensorData::F32(v) => v.get(idx).copied(),
        }
    }

    /// Dequantize the whole tensor.
    pub fn to_f32(&self) -> Vec<f32> {
        (0..self.data.len())
            .filter_map(|idx| self.value(idx))
            .collect()
    }
}

/// Static description of the engine input, `[batch, height, width, channels]`.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorSpec {
    pub shape: [usize; 4],
    pub dtype: DType,
    pub quantization: Quantization,
}

impl TensorSpec {
    pub fn nhwc(height: usize, width: usize, dtype: DType) -> Self {
        Self {
            shape: [1, height, width, 3],
            dtype,
            quantization: Quantization::default(),
        }
    }

    pub fn height(&self) -> usize {
        self.shape[1]
    }

    pub fn width(&self) -> usize {
        self.shape[2]
    }

    pub fn channels(&self) -> usize {
        self.shape[3]
    }
}

/// Preprocessed input handed to the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct InputTensor {
    pub shape: [usize; 4],
    pub data: TensorData,
}
