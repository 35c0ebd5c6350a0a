use ndarray::{Array4, ArrayView4};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Width and height of the model input, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSize {
    pub width: u32,
    pub height: u32,
}

impl InputSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of pixels in one channel plane.
    pub fn plane_len(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl Default for InputSize {
    /// ArcFace canonical crop.
    fn default() -> Self {
        Self::new(112, 112)
    }
}

/// Planar float tensor of shape `[1, 3, H, W]` (NCHW, channels R, G, B).
#[derive(Debug, Clone)]
pub struct Tensor {
    data: Array4<f32>,
}

impl Tensor {
    /// Wrap a planar buffer. Fails unless `data.len() == 3 * H * W`.
    pub fn from_planar(size: InputSize, data: Vec<f32>) -> Result<Self, ndarray::ShapeError> {
        let shape = (1, 3, size.height as usize, size.width as usize);
        Ok(Self {
            data: Array4::from_shape_vec(shape, data)?,
        })
    }

    /// `[1, 3, H, W]`.
    pub fn shape(&self) -> [usize; 4] {
        let s = self.data.shape();
        [s[0], s[1], s[2], s[3]]
    }

    /// Flat planar buffer: the R plane, then G, then B.
    pub fn as_slice(&self) -> &[f32] {
        // Built from a Vec in standard layout, so always contiguous.
        self.data.as_slice().unwrap_or(&[])
    }

    pub fn view(&self) -> ArrayView4<'_, f32> {
        self.data.view()
    }

    /// The contiguous plane for channel `c` (0 = R, 1 = G, 2 = B).
    pub fn plane(&self, c: usize) -> &[f32] {
        let [_, _, h, w] = self.shape();
        let plane = h * w;
        self.as_slice().get(c * plane..(c + 1) * plane).unwrap_or(&[])
    }
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("embedding blob length {0} is not a multiple of 4")]
    BadLength(usize),
}

/// Face embedding vector (512-dimensional for the InsightFace w600k models).
///
/// Immutable once produced. Can be kept as a reference long after the
/// session that produced it is gone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_mbf").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn with_model_version(mut self, version: impl Into<String>) -> Self {
        self.model_version = Some(version.into());
        self
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn model_version(&self) -> Option<&str> {
        self.model_version.as_deref()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Cosine similarity against another embedding. See [`crate::matcher::compare`].
    pub fn similarity(&self, other: &Embedding) -> Result<f32, crate::matcher::SimilarityError> {
        crate::matcher::compare(self, other)
    }

    /// Raw little-endian `f32` blob, bit-exact.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Decode a blob written by [`to_le_bytes`](Self::to_le_bytes).
    pub fn from_le_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() % 4 != 0 {
            return Err(CodecError::BadLength(bytes.len()));
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Self::new(values))
    }
}
