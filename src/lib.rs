pub mod config;
pub mod device;
pub mod errors;
pub mod fetcher;
pub mod model;
pub mod pipeline;
pub mod postprocess;
pub mod preprocess;
pub mod request;
pub mod runtime;
pub mod serve;
pub mod store;
pub mod traits;

pub mod mocks;

pub use config::{Config, ModelConfig};
pub use device::{DevicePolicy, ExecutionDevice};
pub use errors::{ErrorKind, Result, SegError, StatusClass};
pub use fetcher::{ImageFetcher, SourceImage};
pub use model::OrtSamModel;
pub use pipeline::SegmentationPipeline;
pub use postprocess::MaskImage;
pub use preprocess::{ModelInput, Processor, PromptPoint};
pub use request::{InferenceRequest, InferenceResponse};
pub use runtime::{ModelRuntime, RawPrediction};
pub use store::{ArtifactReference, BlobArtifactStore, StorageLocation};
pub use traits::*;

/// The production wiring: HTTP fetcher, ONNX Runtime SAM, object store.
pub type SamPipeline = SegmentationPipeline<ImageFetcher, OrtSamModel, BlobArtifactStore>;

#[cfg(test)]
pub use mocks::*;
