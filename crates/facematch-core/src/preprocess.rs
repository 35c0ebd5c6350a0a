//! Face crop → NCHW float tensor.
//!
//! Resizes an RGBA pixel source to the model input size (no letterboxing,
//! the caller has already cropped the face), drops alpha, normalizes each
//! channel and writes the R, G and B planes one after another.

use crate::types::{InputSize, Tensor};
use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbaImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// --- ArcFace / InsightFace normalization ---
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // NOT 128.0: ArcFace uses symmetric normalization

const RGBA_CHANNELS: usize = 4;

#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("invalid input image: {0}")]
    InvalidInput(String),
}

/// A rectangular pixel region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// The whole surface of a `width × height` source.
    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    fn fits_within(&self, width: u32, height: u32) -> bool {
        self.x.checked_add(self.width).is_some_and(|r| r <= width)
            && self.y.checked_add(self.height).is_some_and(|b| b <= height)
    }
}

/// Anything with fixed dimensions that can hand out RGBA bytes for a region.
pub trait PixelSource {
    /// `(width, height)` in pixels.
    fn dimensions(&self) -> (u32, u32);

    /// Interleaved R, G, B, A bytes for `rect`, row-major.
    fn read_rgba(&self, rect: Rect) -> Result<Vec<u8>, PreprocessError>;
}

fn check_rect(rect: Rect, width: u32, height: u32) -> Result<(), PreprocessError> {
    if rect.fits_within(width, height) {
        Ok(())
    } else {
        Err(PreprocessError::InvalidInput(format!(
            "region {rect:?} exceeds {width}x{height} source"
        )))
    }
}

impl PixelSource for RgbaImage {
    fn dimensions(&self) -> (u32, u32) {
        (self.width(), self.height())
    }

    fn read_rgba(&self, rect: Rect) -> Result<Vec<u8>, PreprocessError> {
        check_rect(rect, self.width(), self.height())?;
        Ok(imageops::crop_imm(self, rect.x, rect.y, rect.width, rect.height)
            .to_image()
            .into_raw())
    }
}

impl PixelSource for DynamicImage {
    fn dimensions(&self) -> (u32, u32) {
        (self.width(), self.height())
    }

    fn read_rgba(&self, rect: Rect) -> Result<Vec<u8>, PreprocessError> {
        check_rect(rect, self.width(), self.height())?;
        Ok(imageops::crop_imm(self, rect.x, rect.y, rect.width, rect.height)
            .to_image()
            .into_raw())
    }
}

/// A raw RGBA buffer with known dimensions (e.g. a decoded camera frame).
#[derive(Clone)]
pub struct RgbaFrame {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

impl RgbaFrame {
    /// Fails unless `data.len() == width * height * 4`.
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Result<Self, PreprocessError> {
        let expected = width as usize * height as usize * RGBA_CHANNELS;
        if data.len() != expected {
            return Err(PreprocessError::InvalidInput(format!(
                "RGBA buffer length: expected {expected}, got {}",
                data.len()
            )));
        }
        Ok(Self { data, width, height })
    }
}

impl PixelSource for RgbaFrame {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn read_rgba(&self, rect: Rect) -> Result<Vec<u8>, PreprocessError> {
        check_rect(rect, self.width, self.height)?;
        let stride = self.width as usize * RGBA_CHANNELS;
        let row_len = rect.width as usize * RGBA_CHANNELS;
        let mut out = Vec::with_capacity(row_len * rect.height as usize);
        for y in rect.y as usize..(rect.y + rect.height) as usize {
            let start = y * stride + rect.x as usize * RGBA_CHANNELS;
            out.extend_from_slice(&self.data[start..start + row_len]);
        }
        Ok(out)
    }
}

/// Per-channel affine normalization `v' = (v - mean) / std`.
///
/// Must match the normalization the embedding model was trained with.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Normalization {
    pub mean: f32,
    pub std: f32,
}

impl Default for Normalization {
    fn default() -> Self {
        Self {
            mean: ARCFACE_MEAN,
            std: ARCFACE_STD,
        }
    }
}

impl Normalization {
    #[inline]
    pub fn apply(&self, value: u8) -> f32 {
        (value as f32 - self.mean) / self.std
    }
}

/// Converts pixel sources into model input tensors.
#[derive(Debug, Clone)]
pub struct Preprocessor {
    size: InputSize,
    normalization: Normalization,
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self {
            size: InputSize::default(),
            normalization: Normalization::default(),
        }
    }
}

impl Preprocessor {
    pub fn new(size: InputSize, normalization: Normalization) -> Result<Self, PreprocessError> {
        if size.width == 0 || size.height == 0 {
            return Err(PreprocessError::InvalidInput(format!(
                "target size {}x{} has a zero dimension",
                size.width, size.height
            )));
        }
        if !(normalization.std.is_finite() && normalization.std != 0.0 && normalization.mean.is_finite()) {
            return Err(PreprocessError::InvalidInput(format!(
                "unusable normalization {normalization:?}"
            )));
        }
        Ok(Self { size, normalization })
    }

    pub fn input_size(&self) -> InputSize {
        self.size
    }

    pub fn normalization(&self) -> Normalization {
        self.normalization
    }

    /// Produce a `[1, 3, H, W]` tensor from `source`.
    pub fn preprocess<S: PixelSource + ?Sized>(&self, source: &S) -> Result<Tensor, PreprocessError> {
        let (width, height) = source.dimensions();
        if width == 0 || height == 0 {
            return Err(PreprocessError::InvalidInput(format!(
                "source has zero dimension ({width}x{height})"
            )));
        }

        let full = source.read_rgba(Rect::full(width, height))?;
        let expected = width as usize * height as usize * RGBA_CHANNELS;
        if full.len() != expected {
            return Err(PreprocessError::InvalidInput(format!(
                "source returned {} RGBA bytes for {width}x{height}, expected {expected}",
                full.len()
            )));
        }

        let rgba = if (width, height) == (self.size.width, self.size.height) {
            full
        } else {
            let image = RgbaImage::from_raw(width, height, full).ok_or_else(|| {
                PreprocessError::InvalidInput(format!("RGBA buffer does not fit {width}x{height}"))
            })?;
            // Stretch to the target size; aspect ratio is not preserved.
            imageops::resize(&image, self.size.width, self.size.height, FilterType::Triangle).into_raw()
        };

        self.to_tensor(&rgba)
    }

    /// Normalize an RGBA buffer of exactly the target size into planar layout.
    fn to_tensor(&self, rgba: &[u8]) -> Result<Tensor, PreprocessError> {
        let plane = self.size.plane_len();
        if rgba.len() != plane * RGBA_CHANNELS {
            return Err(PreprocessError::InvalidInput(format!(
                "RGBA buffer length: expected {}, got {}",
                plane * RGBA_CHANNELS,
                rgba.len()
            )));
        }

        let mut data = vec![0.0f32; 3 * plane];
        let (r_plane, rest) = data.split_at_mut(plane);
        let (g_plane, b_plane) = rest.split_at_mut(plane);

        for (i, px) in rgba.chunks_exact(RGBA_CHANNELS).enumerate() {
            // Alpha (px[3]) is dropped.
            r_plane[i] = self.normalization.apply(px[0]);
            g_plane[i] = self.normalization.apply(px[1]);
            b_plane[i] = self.normalization.apply(px[2]);
        }

        Tensor::from_planar(self.size, data)
            .map_err(|e| PreprocessError::InvalidInput(format!("tensor shape: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    const SIZE: u32 = 112;

    fn solid(width: u32, height: u32, px: [u8; 4]) -> RgbaImage {
        RgbaImage::from_pixel(width, height, Rgba(px))
    }

    #[test]
    fn test_preprocess_output_shape() {
        let tensor = Preprocessor::default().preprocess(&solid(SIZE, SIZE, [128, 128, 128, 255])).unwrap();
        assert_eq!(tensor.shape(), [1, 3, SIZE as usize, SIZE as usize]);
        assert_eq!(tensor.as_slice().len(), 3 * (SIZE * SIZE) as usize);
    }

    #[test]
    fn test_mid_gray_normalizes_near_zero() {
        let tensor = Preprocessor::default().preprocess(&solid(SIZE, SIZE, [127, 127, 127, 255])).unwrap();
        for c in 0..3 {
            let v = tensor.plane(c)[0];
            assert!((v - (-0.0039)).abs() < 1e-4, "channel {c}: {v}");
        }
    }

    #[test]
    fn test_pure_red_normalizes_to_extremes() {
        let tensor = Preprocessor::default().preprocess(&solid(SIZE, SIZE, [255, 0, 0, 255])).unwrap();
        assert_eq!(tensor.view()[[0, 0, 5, 7]], 1.0);
        assert_eq!(tensor.view()[[0, 1, 5, 7]], -1.0);
        assert_eq!(tensor.view()[[0, 2, 5, 7]], -1.0);
    }

    #[test]
    fn test_planes_in_rgb_order() {
        // 2x2 image with distinct channel values per pixel.
        let size = InputSize::new(2, 2);
        let pre = Preprocessor::new(size, Normalization { mean: 0.0, std: 1.0 }).unwrap();
        let data: Vec<u8> = vec![
            10, 20, 30, 0, //
            11, 21, 31, 0, //
            12, 22, 32, 0, //
            13, 23, 33, 0,
        ];
        let frame = RgbaFrame::new(data, 2, 2).unwrap();
        let tensor = pre.preprocess(&frame).unwrap();
        assert_eq!(
            tensor.as_slice(),
            &[10.0, 11.0, 12.0, 13.0, 20.0, 21.0, 22.0, 23.0, 30.0, 31.0, 32.0, 33.0]
        );
    }

    #[test]
    fn test_alpha_is_ignored() {
        let pre = Preprocessor::default();
        let opaque = pre.preprocess(&solid(SIZE, SIZE, [40, 90, 200, 255])).unwrap();
        let clear = pre.preprocess(&solid(SIZE, SIZE, [40, 90, 200, 0])).unwrap();
        assert_eq!(opaque.as_slice(), clear.as_slice());
    }

    #[test]
    fn test_values_stay_in_unit_range() {
        let size = InputSize::new(16, 16);
        let pre = Preprocessor::new(size, Normalization::default()).unwrap();
        let data: Vec<u8> = (0..16 * 16 * 4).map(|i| (i % 256) as u8).collect();
        let tensor = pre.preprocess(&RgbaFrame::new(data, 16, 16).unwrap()).unwrap();
        assert!(tensor.as_slice().iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn test_resize_to_target() {
        let tensor = Preprocessor::default().preprocess(&solid(300, 180, [255, 0, 0, 255])).unwrap();
        assert_eq!(tensor.shape(), [1, 3, 112, 112]);
        // A solid image stays solid after bilinear resampling.
        assert!(tensor.plane(0).iter().all(|&v| (v - 1.0).abs() < 1e-6));
        assert!(tensor.plane(2).iter().all(|&v| (v + 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_dynamic_image_source() {
        let image = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(64, 64, image::Rgb([255, 0, 0])));
        let tensor = Preprocessor::default().preprocess(&image).unwrap();
        assert_eq!(tensor.shape(), [1, 3, 112, 112]);
        assert!((tensor.plane(0)[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_zero_dimension_rejected() {
        let empty = RgbaImage::new(0, 10);
        assert!(matches!(
            Preprocessor::default().preprocess(&empty),
            Err(PreprocessError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_short_buffer_rejected() {
        assert!(RgbaFrame::new(vec![0; 15], 2, 2).is_err());
    }

    #[test]
    fn test_lying_source_rejected() {
        struct Liar;
        impl PixelSource for Liar {
            fn dimensions(&self) -> (u32, u32) {
                (20, 20)
            }
            fn read_rgba(&self, _rect: Rect) -> Result<Vec<u8>, PreprocessError> {
                Ok(vec![0; 8])
            }
        }
        assert!(Preprocessor::default().preprocess(&Liar).is_err());
    }

    #[test]
    fn test_oversized_buffer_rejected_on_both_paths() {
        struct Padded(u32);
        impl PixelSource for Padded {
            fn dimensions(&self) -> (u32, u32) {
                (self.0, self.0)
            }
            fn read_rgba(&self, _rect: Rect) -> Result<Vec<u8>, PreprocessError> {
                Ok(vec![0; (self.0 * self.0 * 4 + 4) as usize])
            }
        }
        let p = Preprocessor::default();
        // Exact target size, then a size that needs resizing.
        for side in [SIZE, 20] {
            assert!(matches!(
                p.preprocess(&Padded(side)),
                Err(PreprocessError::InvalidInput(_))
            ));
        }
    }

    #[test]
    fn test_frame_subregion() {
        // 3x2 frame; read the 2x1 region starting at (1, 1).
        let data: Vec<u8> = (0..24).collect();
        let frame = RgbaFrame::new(data, 3, 2).unwrap();
        let region = frame.read_rgba(Rect::new(1, 1, 2, 1)).unwrap();
        assert_eq!(region, (16..24).collect::<Vec<u8>>());
        assert!(frame.read_rgba(Rect::new(2, 0, 2, 1)).is_err());
    }

    #[test]
    fn test_invalid_configuration() {
        assert!(Preprocessor::new(InputSize::new(0, 112), Normalization::default()).is_err());
        assert!(Preprocessor::new(InputSize::default(), Normalization { mean: 127.5, std: 0.0 }).is_err());
    }
}
