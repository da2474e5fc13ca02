use image::{imageops, imageops::FilterType, DynamicImage, GrayImage, ImageBuffer, Luma, Rgb, RgbImage};
use ndarray::prelude::*;

use crate::errors::{Result, SegError};
use crate::preprocess::{ImageSize, SizeMetadata};
use crate::runtime::RawPrediction;

/// Logits above this are foreground.
pub const MASK_THRESHOLD: f32 = 0.0;

/// Rendered 8-bit mask at the source image's size.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskImage {
    image: DynamicImage,
}

impl MaskImage {
    pub const fn new(image: DynamicImage) -> Self {
        Self { image }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.image.width(), self.image.height())
    }

    pub fn channels(&self) -> u8 {
        self.image.color().channel_count()
    }

    pub const fn image(&self) -> &DynamicImage {
        &self.image
    }
}

/// Turn mask logits into a displayable image of the original size.
///
/// Only the first batch element is used. Three or more mask channels become
/// the R, G and B planes of the output; a single channel becomes grayscale.
/// Each plane is upsampled to the padded model resolution, cropped to the
/// resized image area, upsampled again to the original size and thresholded
/// at [`MASK_THRESHOLD`] to 0 or 255.
pub fn render(prediction: &RawPrediction, metadata: &SizeMetadata) -> Result<MaskImage> {
    let masks = prediction
        .masks()
        .view()
        .into_dimensionality::<Ix4>()
        .map_err(|e| {
            SegError::postprocess(
                format!("rank check of shape {:?}", prediction.shape()),
                e,
            )
        })?;
    let (batch, channels, height, width) = masks.dim();
    if batch == 0 || channels == 0 || height == 0 || width == 0 {
        return Err(SegError::postprocess(
            "shape check",
            format!("prediction has an empty axis: {:?}", masks.shape()),
        ));
    }
    check_metadata(metadata)?;

    let selected = masks.index_axis(Axis(0), 0);
    let used = if channels >= 3 { 3 } else { 1 };
    let planes = (0..used)
        .map(|c| upscale_plane(selected.index_axis(Axis(0), c), metadata))
        .collect::<Result<Vec<_>>>()?;

    let ImageSize { width, height } = metadata.original_size;
    let image = match <[GrayImage; 3]>::try_from(planes) {
        Ok([red, green, blue]) => DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            Rgb([
                red.get_pixel(x, y)[0],
                green.get_pixel(x, y)[0],
                blue.get_pixel(x, y)[0],
            ])
        })),
        Err(mut planes) => DynamicImage::ImageLuma8(planes.remove(0)),
    };
    Ok(MaskImage::new(image))
}

fn check_metadata(metadata: &SizeMetadata) -> Result<()> {
    let SizeMetadata {
        original_size,
        reshaped_size,
        pad_size,
    } = *metadata;
    if original_size.width == 0 || original_size.height == 0 {
        return Err(SegError::postprocess(
            "size metadata check",
            "original size has an empty dimension",
        ));
    }
    if reshaped_size.width == 0
        || reshaped_size.height == 0
        || reshaped_size.width > pad_size
        || reshaped_size.height > pad_size
    {
        return Err(SegError::postprocess(
            "size metadata check",
            format!("reshaped size {reshaped_size:?} does not fit the {pad_size}px padded input"),
        ));
    }
    Ok(())
}

fn upscale_plane(logits: ArrayView2<f32>, metadata: &SizeMetadata) -> Result<GrayImage> {
    let (h, w) = logits.dim();
    let low_res: ImageBuffer<Luma<f32>, Vec<f32>> =
        ImageBuffer::from_raw(w as u32, h as u32, logits.iter().copied().collect())
            .ok_or_else(|| SegError::postprocess("mask buffer creation", "buffer too small"))?;

    let pad = metadata.pad_size;
    let padded = imageops::resize(&low_res, pad, pad, FilterType::Triangle);
    let ImageSize {
        width: reshaped_width,
        height: reshaped_height,
    } = metadata.reshaped_size;
    let cropped = imageops::crop_imm(&padded, 0, 0, reshaped_width, reshaped_height).to_image();

    let ImageSize { width, height } = metadata.original_size;
    let full = imageops::resize(&cropped, width, height, FilterType::Triangle);
    Ok(GrayImage::from_fn(width, height, |x, y| {
        let Luma([logit]) = *full.get_pixel(x, y);
        Luma([if logit > MASK_THRESHOLD { u8::MAX } else { 0 }])
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GenericImageView;

    fn metadata(original: (u32, u32), reshaped: (u32, u32), pad: u32) -> SizeMetadata {
        SizeMetadata {
            original_size: ImageSize::new(original.0, original.1),
            reshaped_size: ImageSize::new(reshaped.0, reshaped.1),
            pad_size: pad,
        }
    }

    /// Positive inside the reshaped area, negative in the padding.
    fn prediction(channels: usize, side: usize, content_rows: usize) -> RawPrediction {
        let masks = Array4::from_shape_fn((1, channels, side, side), |(_, c, y, _)| {
            let value = if y < content_rows { 4.0 } else { -4.0 };
            if c == 1 {
                -value
            } else {
                value
            }
        });
        RawPrediction::new(masks.into_dyn())
    }

    #[test]
    fn test_output_matches_original_size() -> Result<()> {
        for (original, reshaped) in [((50, 25), (64, 32)), ((7, 300), (2, 64)), ((64, 64), (64, 64))] {
            let mask = render(&prediction(3, 16, 8), &metadata(original, reshaped, 64))?;
            assert_eq!(mask.dimensions(), original);
        }
        Ok(())
    }

    #[test]
    fn test_padding_is_cropped_away() -> Result<()> {
        // top half of the padded input holds the image, so the whole output is foreground
        let mask = render(&prediction(1, 16, 8), &metadata((50, 25), (64, 32), 64))?;
        assert_eq!(mask.channels(), 1);
        assert!(mask.image().to_luma8().pixels().all(|p| p[0] == 255));
        Ok(())
    }

    #[test]
    fn test_three_channels_become_rgb() -> Result<()> {
        let mask = render(&prediction(3, 16, 8), &metadata((50, 25), (64, 32), 64))?;
        assert_eq!(mask.channels(), 3);
        let rgb = mask.image().to_rgb8();
        assert_eq!(rgb.get_pixel(10, 10), &Rgb([255, 0, 255]));
        Ok(())
    }

    #[test]
    fn test_render_is_deterministic() -> Result<()> {
        let masks = Array4::from_shape_fn((1, 3, 16, 16), |(_, c, y, x)| {
            ((x * 7 + y * 13 + c * 5) % 11) as f32 - 5.0
        });
        let prediction = RawPrediction::new(masks.into_dyn());
        let meta = metadata((33, 21), (64, 41), 64);
        let a = render(&prediction, &meta)?;
        let b = render(&prediction, &meta)?;
        assert_eq!(a.image().as_bytes(), b.image().as_bytes());
        Ok(())
    }

    #[test]
    fn test_values_are_binary() -> Result<()> {
        let masks = Array4::from_shape_fn((1, 1, 8, 8), |(_, _, y, x)| x as f32 - y as f32);
        let mask = render(
            &RawPrediction::new(masks.into_dyn()),
            &metadata((40, 40), (32, 32), 32),
        )?;
        assert!(mask.image().as_bytes().iter().all(|&v| v == 0 || v == 255));
        assert_eq!(mask.image().get_pixel(39, 0)[0], 255);
        assert_eq!(mask.image().get_pixel(0, 39)[0], 0);
        Ok(())
    }

    #[test]
    fn test_wrong_rank_is_postprocess_error() {
        let prediction = RawPrediction::new(ArrayD::zeros(IxDyn(&[1, 3, 16])));
        let err = render(&prediction, &metadata((10, 10), (16, 16), 16)).unwrap_err();
        assert!(matches!(err, SegError::Postprocess { .. }));
    }

    #[test]
    fn test_empty_batch_is_postprocess_error() {
        let prediction = RawPrediction::new(ArrayD::zeros(IxDyn(&[0, 3, 16, 16])));
        let err = render(&prediction, &metadata((10, 10), (16, 16), 16)).unwrap_err();
        assert!(matches!(err, SegError::Postprocess { .. }));
    }

    #[test]
    fn test_oversized_reshape_is_rejected() {
        let err = render(&prediction(1, 4, 2), &metadata((10, 10), (32, 32), 16)).unwrap_err();
        assert!(matches!(err, SegError::Postprocess { .. }));
    }
}
