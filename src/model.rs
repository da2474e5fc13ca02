use std::path::Path;
use std::time::Instant;

use ndarray::prelude::*;
use ort::{
    execution_providers::{
        CPUExecutionProvider, CUDAExecutionProvider, ExecutionProviderDispatch,
        TensorRTExecutionProvider,
    },
    session::{builder::GraphOptimizationLevel, RunOptions, Session},
    value::{DynValue, TensorRef},
};
use parking_lot::Mutex;
use tracing::debug;

use crate::{
    config::ModelConfig,
    device::ExecutionDevice,
    errors::{BoxError, Result, SegError},
    preprocess::ModelInput,
    runtime::RawPrediction,
    traits::SegmentationModel,
};

const DEFAULT_IMAGE_SIZE: u32 = 1024;

// vision encoder
const PIXEL_VALUES: &str = "pixel_values";
const IMAGE_EMBEDDINGS: &str = "image_embeddings";
const IMAGE_POSITIONAL_EMBEDDINGS: &str = "image_positional_embeddings";
// prompt encoder + mask decoder
const INPUT_POINTS: &str = "input_points";
const INPUT_LABELS: &str = "input_labels";
const PRED_MASKS: &str = "pred_masks";

struct SamSessions {
    encoder: Session,
    decoder: Session,
    run_options: RunOptions,
}

/// Segment Anything exported as two ONNX graphs (vision encoder, prompt
/// encoder + mask decoder), bound to one execution device.
///
/// Both sessions sit behind one lock, so runs on the device never interleave.
pub struct OrtSamModel {
    image_size: u32,
    device: ExecutionDevice,
    sessions: Mutex<SamSessions>,
}

impl OrtSamModel {
    pub fn load(config: &ModelConfig, device: ExecutionDevice) -> Result<Self> {
        for path in [&config.encoder_path, &config.decoder_path] {
            if !path.is_file() {
                return Err(SegError::model_load(
                    format!("weights lookup for {}", config.model_id),
                    format!("{} does not exist", path.display()),
                ));
            }
        }

        let encoder = build_session(&config.encoder_path, device)?;
        let decoder = build_session(&config.decoder_path, device)?;

        let image_size = encoder
            .inputs
            .first()
            .and_then(|input| input.input_type.tensor_shape())
            .and_then(|shape| shape.get(2).copied())
            .filter(|&side| side > 0)
            .map_or(DEFAULT_IMAGE_SIZE, |side| side as u32);

        let mut run_options = RunOptions::new()
            .map_err(|e| SegError::model_load("run options creation", e))?;
        run_options
            .add_config_entry(
                "memory.enable_memory_arena_shrinkage",
                device.arena_shrinkage_target(),
            )
            .map_err(|e| SegError::model_load("arena shrinkage setup", e))?;

        let mut sessions = SamSessions {
            encoder,
            decoder,
            run_options,
        };

        // warm up
        let start = Instant::now();
        let side = image_size as usize;
        let pixel_values = Array4::<f32>::zeros((1, 3, side, side));
        let center = image_size as f32 / 2.0;
        let input_points = Array4::from_elem((1, 1, 1, 2), center);
        let input_labels = Array3::<i64>::ones((1, 1, 1));
        run(
            &mut sessions,
            pixel_values.view(),
            input_points.view(),
            input_labels.view(),
        )
        .map_err(|e| SegError::model_load("warm-up run", e.report()))?;
        debug!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            "warm-up run finished"
        );

        Ok(Self {
            image_size,
            device,
            sessions: Mutex::new(sessions),
        })
    }
}

impl SegmentationModel for OrtSamModel {
    fn input_size(&self) -> u32 {
        self.image_size
    }

    fn device(&self) -> ExecutionDevice {
        self.device
    }

    fn predict(&self, input: &ModelInput) -> Result<RawPrediction> {
        let mut sessions = self.sessions.lock();
        let masks = run(
            &mut sessions,
            input.pixel_values.view(),
            input.input_points.view(),
            input.input_labels.view(),
        )?;
        Ok(RawPrediction::new(masks))
    }

    /// ONNX Runtime shrinks its arenas at the end of every run through the
    /// run option set in `load`; nothing else outlives a run.
    fn release_caches(&self) {}
}

fn load_error<E>(path: &Path, operation: &'static str) -> impl FnOnce(E) -> SegError
where
    E: Into<BoxError>,
{
    let operation = format!("{operation} ({})", path.display());
    move |e| SegError::model_load(operation, e)
}

fn build_session(path: &Path, device: ExecutionDevice) -> Result<Session> {
    Session::builder()
        .map_err(load_error(path, "session builder initialization"))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(load_error(path, "graph optimization setup"))?
        .with_execution_providers(execution_providers(device))
        .map_err(load_error(path, "execution provider registration"))?
        .with_memory_pattern(true)
        .map_err(load_error(path, "memory pattern setup"))?
        .commit_from_file(path)
        .map_err(load_error(path, "model file load"))
}

fn execution_providers(device: ExecutionDevice) -> Vec<ExecutionProviderDispatch> {
    match device {
        ExecutionDevice::Cpu => vec![CPUExecutionProvider::default().build()],
        ExecutionDevice::Cuda { device_id } => {
            let mut providers = Vec::with_capacity(2);
            if cfg!(feature = "tensorrt") {
                providers.push(
                    TensorRTExecutionProvider::default()
                        .with_device_id(device_id)
                        .build(),
                );
            }
            providers.push(
                CUDAExecutionProvider::default()
                    .with_device_id(device_id)
                    .build()
                    .error_on_failure(),
            );
            providers
        }
    }
}

fn extract(value: Option<&DynValue>, name: &str) -> Result<ArrayD<f32>> {
    let value = value.ok_or_else(|| {
        SegError::inference("output lookup", format!("model has no output `{name}`"))
    })?;
    let array = value
        .try_extract_array::<f32>()
        .map_err(|e| SegError::inference(format!("`{name}` extraction"), e))?;
    Ok(array.to_owned())
}

fn run(
    sessions: &mut SamSessions,
    pixel_values: ArrayView4<f32>,
    input_points: ArrayView4<f32>,
    input_labels: ArrayView3<i64>,
) -> Result<ArrayD<f32>> {
    let SamSessions {
        encoder,
        decoder,
        run_options,
    } = sessions;

    let pixel_values = pixel_values.as_standard_layout();
    let pixel_tensor = TensorRef::from_array_view(&pixel_values)
        .map_err(|e| SegError::inference("pixel tensor creation", e))?;
    let encoded = encoder
        .run_with_options(ort::inputs![PIXEL_VALUES => pixel_tensor], run_options)
        .map_err(|e| SegError::inference("vision encoder run", e))?;
    let image_embeddings = extract(encoded.get(IMAGE_EMBEDDINGS), IMAGE_EMBEDDINGS)?;
    let positional_embeddings = extract(
        encoded.get(IMAGE_POSITIONAL_EMBEDDINGS),
        IMAGE_POSITIONAL_EMBEDDINGS,
    )?;
    drop(encoded);

    let input_points = input_points.as_standard_layout();
    let input_labels = input_labels.as_standard_layout();
    let image_embeddings = image_embeddings.as_standard_layout();
    let positional_embeddings = positional_embeddings.as_standard_layout();
    let tensor_error = |e: ort::Error| SegError::inference("decoder tensor creation", e);
    let decoded = decoder
        .run_with_options(
            ort::inputs![
                INPUT_POINTS => TensorRef::from_array_view(&input_points).map_err(tensor_error)?,
                INPUT_LABELS => TensorRef::from_array_view(&input_labels).map_err(tensor_error)?,
                IMAGE_EMBEDDINGS => TensorRef::from_array_view(&image_embeddings).map_err(tensor_error)?,
                IMAGE_POSITIONAL_EMBEDDINGS => TensorRef::from_array_view(&positional_embeddings).map_err(tensor_error)?,
            ],
            run_options,
        )
        .map_err(|e| SegError::inference("mask decoder run", e))?;
    first_point_batch(extract(decoded.get(PRED_MASKS), PRED_MASKS)?)
}

/// (batch, point_batch, masks, h, w) -> (batch, masks, h, w) at point batch 0.
/// Rank-4 masks pass through.
fn first_point_batch(masks: ArrayD<f32>) -> Result<ArrayD<f32>> {
    match masks.ndim() {
        4 => Ok(masks),
        5 if masks.len_of(Axis(1)) > 0 => Ok(masks.index_axis_move(Axis(1), 0)),
        _ => Err(SegError::inference(
            "prediction shape check",
            format!("`{PRED_MASKS}` has unexpected shape {:?}", masks.shape()),
        )),
    }
}
