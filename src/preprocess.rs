//! Image preprocessing: decode, force RGB, resize to the model resolution,
//! rescale intensities and add the batch axis.

use image::{imageops::FilterType, DynamicImage, RgbImage};
use ndarray::Array4;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("image could not be decoded: {0}")]
    Decode(#[source] image::ImageError),

    #[error("image could not be converted to RGB: {0}")]
    ColorConversion(String),
}

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Per-channel intensity rescaling, `value = pixel * alpha + beta`.
///
/// Built from `scale`, `mean` and `std` so that
/// `value = (pixel * scale - mean) / std`.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalization {
    alpha: [f32; 3],
    beta: [f32; 3],
}

impl Normalization {
    pub fn new(scale: f32, mean: [f32; 3], std: [f32; 3]) -> Option<Self> {
        if scale <= 0.0 || std.iter().any(|s| *s <= 0.0) {
            return None;
        }
        Some(Self::from_parts(scale, mean, std))
    }

    fn from_parts(scale: f32, mean: [f32; 3], std: [f32; 3]) -> Self {
        let alpha = std.map(|s| scale / s);
        let beta = [0, 1, 2].map(|c| -mean[c] / std[c]);
        Self { alpha, beta }
    }

    /// `[0, 255] -> [0, 1]`
    pub fn unit() -> Self {
        Self {
            alpha: [1.0 / 255.0; 3],
            beta: [0.0; 3],
        }
    }

    /// `[0, 255] -> [-1, 1]`
    pub fn symmetric() -> Self {
        Self {
            alpha: [1.0 / 127.5; 3],
            beta: [-1.0; 3],
        }
    }

    pub fn imagenet() -> Self {
        Self::from_parts(1.0 / 255.0, IMAGENET_MEAN, IMAGENET_STD)
    }

    /// Pixels passed through unchanged, for graphs that rescale internally.
    pub fn raw() -> Self {
        Self {
            alpha: [1.0; 3],
            beta: [0.0; 3],
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "unit" => Some(Self::unit()),
            "symmetric" => Some(Self::symmetric()),
            "imagenet" => Some(Self::imagenet()),
            "raw" => Some(Self::raw()),
            _ => None,
        }
    }

    #[inline]
    fn apply(&self, channel: usize, value: u8) -> f32 {
        value as f32 * self.alpha[channel] + self.beta[channel]
    }
}

#[derive(Debug, Clone)]
pub struct Preprocessor {
    width: u32,
    height: u32,
    normalization: Normalization,
}

impl Preprocessor {
    pub fn new(input_size: (u32, u32), normalization: Normalization) -> Self {
        Self {
            width: input_size.0,
            height: input_size.1,
            normalization,
        }
    }

    pub fn input_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Turns raw upload bytes into an NHWC `[1, height, width, 3]` tensor.
    pub fn preprocess(&self, image_data: &[u8]) -> Result<Array4<f32>, PreprocessError> {
        let img = image::load_from_memory(image_data).map_err(PreprocessError::Decode)?;
        let rgb = to_rgb(img)?;

        let resized = image::imageops::resize(&rgb, self.width, self.height, FilterType::CatmullRom);

        let mut tensor = Array4::<f32>::zeros((1, self.height as usize, self.width as usize, 3));
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, y as usize, x as usize, c]] = self.normalization.apply(c, pixel[c]);
            }
        }

        Ok(tensor)
    }
}

fn to_rgb(img: DynamicImage) -> Result<RgbImage, PreprocessError> {
    let color = img.color();
    let rgb = match img {
        DynamicImage::ImageRgb8(rgb) => rgb,
        other => other.to_rgb8(),
    };

    let (width, height) = rgb.dimensions();
    if width == 0 || height == 0 || rgb.as_raw().len() != width as usize * height as usize * 3 {
        return Err(PreprocessError::ColorConversion(format!(
            "{color:?} image of {width}x{height} has no usable pixels"
        )));
    }
    Ok(rgb)
}
