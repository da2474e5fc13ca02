use image::{imageops, imageops::FilterType};
use ndarray::prelude::*;
use nshare::AsNdarray3;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SegError};
use crate::fetcher::SourceImage;

/// A prompt location in original image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 2]", into = "[f32; 2]")]
pub struct PromptPoint {
    pub x: f32,
    pub y: f32,
}

impl PromptPoint {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// The default prompt: the middle of the image.
    pub fn center_of(width: u32, height: u32) -> Self {
        Self::new(width as f32 / 2.0, height as f32 / 2.0)
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl From<[f32; 2]> for PromptPoint {
    fn from([x, y]: [f32; 2]) -> Self {
        Self::new(x, y)
    }
}

impl From<PromptPoint> for [f32; 2] {
    fn from(point: PromptPoint) -> Self {
        [point.x, point.y]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// What the postprocessor needs to undo the model-side resize and padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeMetadata {
    pub original_size: ImageSize,
    pub reshaped_size: ImageSize,
    pub pad_size: u32,
}

/// Tensors for one request plus the size bookkeeping.
#[derive(Debug, Clone)]
pub struct ModelInput {
    /// `(1, 3, pad, pad)`, normalized, zero padded at the bottom and right.
    pub pixel_values: Array4<f32>,
    /// `(1, 1, points, 2)` in resized-image coordinates.
    pub input_points: Array4<f32>,
    /// `(1, 1, points)`, all foreground.
    pub input_labels: Array3<i64>,
    pub metadata: SizeMetadata,
}

/// SAM image/prompt processor. Immutable once built, shared by all requests.
#[derive(Debug, Clone)]
pub struct Processor {
    pub longest_edge: u32,
    pub pad_size: u32,
    pub rescale_factor: f32,
    pub image_mean: [f32; 3],
    pub image_std: [f32; 3],
    pub resample: FilterType,
}

impl Default for Processor {
    fn default() -> Self {
        Self::with_size(1024)
    }
}

impl Processor {
    pub const fn with_size(size: u32) -> Self {
        Self {
            longest_edge: size,
            pad_size: size,
            rescale_factor: 1.0 / 255.0,
            image_mean: [0.485, 0.456, 0.406],
            image_std: [0.229, 0.224, 0.225],
            resample: FilterType::Triangle,
        }
    }

    /// Size after scaling the longest side to `longest_edge`.
    pub fn reshaped_size(&self, original: ImageSize) -> ImageSize {
        let longest = original.width.max(original.height) as f64;
        let scale = f64::from(self.longest_edge) / longest;
        let scaled = |side: u32| ((f64::from(side) * scale + 0.5).floor() as u32).max(1);
        ImageSize::new(scaled(original.width), scaled(original.height))
    }

    pub fn prepare(&self, image: &SourceImage, points: &[PromptPoint]) -> Result<ModelInput> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(SegError::preprocess(
                "image size check",
                format!("image has an empty dimension ({width}x{height})"),
            ));
        }
        if points.is_empty() {
            return Err(SegError::preprocess(
                "prompt check",
                "at least one prompt point is required",
            ));
        }
        if let Some(point) = points.iter().find(|p| !p.is_finite()) {
            return Err(SegError::preprocess(
                "prompt check",
                format!("prompt point {point:?} is not finite"),
            ));
        }
        if self.pad_size < self.longest_edge {
            return Err(SegError::preprocess(
                "processor check",
                format!(
                    "pad size {} is smaller than the longest edge {}",
                    self.pad_size, self.longest_edge
                ),
            ));
        }

        let original_size = ImageSize::new(width, height);
        let reshaped_size = self.reshaped_size(original_size);
        let pixel_values = self.pixel_values(image, reshaped_size);

        let scale_x = reshaped_size.width as f32 / width as f32;
        let scale_y = reshaped_size.height as f32 / height as f32;
        let input_points = Array4::from_shape_fn((1, 1, points.len(), 2), |(_, _, i, axis)| {
            if axis == 0 {
                points[i].x * scale_x
            } else {
                points[i].y * scale_y
            }
        });
        let input_labels = Array3::<i64>::ones((1, 1, points.len()));

        Ok(ModelInput {
            pixel_values,
            input_points,
            input_labels,
            metadata: SizeMetadata {
                original_size,
                reshaped_size,
                pad_size: self.pad_size,
            },
        })
    }

    fn pixel_values(&self, image: &SourceImage, size: ImageSize) -> Array4<f32> {
        let rgb = image.image().to_rgb8();
        let resized = imageops::resize(&rgb, size.width, size.height, self.resample);
        // (channel, height, width)
        let channels = resized.as_ndarray3();

        let pad = self.pad_size as usize;
        let (h, w) = (size.height as usize, size.width as usize);
        let mut tensor = Array4::<f32>::zeros((1, 3, pad, pad));
        for (c, plane) in channels.axis_iter(Axis(0)).enumerate() {
            let (mean, std) = (self.image_mean[c], self.image_std[c]);
            let rescale = self.rescale_factor;
            tensor
                .slice_mut(s![0, c, ..h, ..w])
                .assign(&plane.mapv(|v| (f32::from(v) * rescale - mean) / std));
        }
        tensor
    }
}
