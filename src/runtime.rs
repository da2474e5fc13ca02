use std::sync::Arc;
use std::time::Instant;

use ndarray::prelude::*;
use tracing::{debug, info, trace, warn};

use crate::config::ModelConfig;
use crate::device::ExecutionDevice;
use crate::errors::{Result, SegError};
use crate::model::OrtSamModel;
use crate::preprocess::ModelInput;
use crate::traits::SegmentationModel;

/// Mask logits, nominally `(batch, channels, height, width)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPrediction {
    masks: ArrayD<f32>,
}

impl RawPrediction {
    pub const fn new(masks: ArrayD<f32>) -> Self {
        Self { masks }
    }

    pub fn shape(&self) -> &[usize] {
        self.masks.shape()
    }

    pub const fn masks(&self) -> &ArrayD<f32> {
        &self.masks
    }
}

/// Calls `release_caches` on the model when dropped, whichever way the run ended.
struct CacheReleaseScope<'a, M: SegmentationModel + ?Sized> {
    model: &'a M,
}

impl<'a, M: SegmentationModel + ?Sized> CacheReleaseScope<'a, M> {
    fn enter(model: &'a M) -> Self {
        Self { model }
    }
}

impl<M: SegmentationModel + ?Sized> Drop for CacheReleaseScope<'_, M> {
    fn drop(&mut self) {
        self.model.release_caches();
        trace!(device = %self.model.device(), "released device caches");
    }
}

/// Owns the process-wide model. Cheap to clone; clones share the same model.
pub struct ModelRuntime<M: SegmentationModel> {
    model: Arc<M>,
}

impl<M: SegmentationModel> Clone for ModelRuntime<M> {
    fn clone(&self) -> Self {
        Self {
            model: Arc::clone(&self.model),
        }
    }
}

impl ModelRuntime<OrtSamModel> {
    /// Select the device and load the ONNX sessions. Meant to run once at startup.
    pub fn initialize(config: &ModelConfig) -> Result<Self> {
        let start = Instant::now();
        let device = config.device.select(config.device_id)?;
        let model = OrtSamModel::load(config, device)?;
        info!(
            model_id = %config.model_id,
            %device,
            input_size = model.input_size(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "model runtime initialized"
        );
        Ok(Self::new(model))
    }
}

impl<M: SegmentationModel> ModelRuntime<M> {
    pub fn new(model: M) -> Self {
        Self {
            model: Arc::new(model),
        }
    }

    pub fn device(&self) -> ExecutionDevice {
        self.model.device()
    }

    pub fn input_size(&self) -> u32 {
        self.model.input_size()
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Run inference on one prepared input.
    ///
    /// Device caches are released before this returns, on error as well as on
    /// success.
    pub fn infer(&self, input: &ModelInput) -> Result<RawPrediction> {
        let _scope = CacheReleaseScope::enter(self.model.as_ref());
        self.check_input(input)?;

        let start = Instant::now();
        let prediction = self.model.predict(input).inspect_err(|e| {
            warn!(error = %e.report(), "inference failed");
        })?;
        if prediction.shape().len() != 4 {
            return Err(SegError::inference(
                "prediction shape check",
                format!(
                    "expected mask logits of rank 4, model returned shape {:?}",
                    prediction.shape()
                ),
            ));
        }
        debug!(
            shape = ?prediction.shape(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "inference finished"
        );
        Ok(prediction)
    }

    fn check_input(&self, input: &ModelInput) -> Result<()> {
        let size = self.model.input_size() as usize;
        let expected = [1, 3, size, size];
        if input.pixel_values.shape() != expected {
            return Err(SegError::inference(
                "input shape check",
                format!(
                    "pixel values have shape {:?}, model expects {:?}",
                    input.pixel_values.shape(),
                    expected
                ),
            ));
        }

        let points = input.input_points.shape();
        let labels = input.input_labels.shape();
        if points[0] != 1 || points[1] != 1 || points[3] != 2 || points[2] == 0 {
            return Err(SegError::inference(
                "input shape check",
                format!("prompt points have shape {points:?}, expected (1, 1, N, 2)"),
            ));
        }
        if labels != &points[..3] {
            return Err(SegError::inference(
                "input shape check",
                format!("prompt labels have shape {labels:?}, points have {points:?}"),
            ));
        }
        Ok(())
    }
}
