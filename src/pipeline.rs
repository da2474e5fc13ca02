use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinError;
use tracing::{debug, error, info, instrument, warn};

use crate::errors::{Result, SegError, StatusClass};
use crate::fetcher::SourceImage;
use crate::postprocess::{self, MaskImage};
use crate::preprocess::{Processor, PromptPoint};
use crate::request::{InferenceRequest, InferenceResponse};
use crate::runtime::ModelRuntime;
use crate::store::ArtifactReference;
use crate::traits::{ArtifactStore, ImageSource, SegmentationModel};

/// Request orchestration: fetch, prepare, infer, render, store.
///
/// Holds only read-only state, so one pipeline serves any number of concurrent
/// requests. CPU-bound stages run on Tokio's blocking pool.
pub struct SegmentationPipeline<F, M, S>
where
    M: SegmentationModel + 'static,
{
    fetcher: F,
    processor: Arc<Processor>,
    runtime: ModelRuntime<M>,
    store: S,
}

impl<F, M, S> SegmentationPipeline<F, M, S>
where
    F: ImageSource,
    M: SegmentationModel + 'static,
    S: ArtifactStore,
{
    /// Uses a processor sized for the model's input.
    pub fn new(fetcher: F, runtime: ModelRuntime<M>, store: S) -> Self {
        let processor = Processor::with_size(runtime.input_size());
        Self::with_processor(fetcher, processor, runtime, store)
    }

    pub fn with_processor(
        fetcher: F,
        processor: Processor,
        runtime: ModelRuntime<M>,
        store: S,
    ) -> Self {
        Self {
            fetcher,
            processor: Arc::new(processor),
            runtime,
            store,
        }
    }

    pub const fn runtime(&self) -> &ModelRuntime<M> {
        &self.runtime
    }

    pub const fn fetcher(&self) -> &F {
        &self.fetcher
    }

    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Run one request to completion and return the stored mask's reference.
    ///
    /// Requests with the wrong content type are rejected before any fetch,
    /// inference or upload happens.
    pub async fn handle(&self, request: &InferenceRequest) -> Result<ArtifactReference> {
        let payload = request.payload()?;

        let start = Instant::now();
        let source = self.fetcher.fetch(&payload.image_url).await?;
        let points = payload.prompt_points(source.width(), source.height());
        debug!(
            stage = "fetch",
            elapsed_ms = start.elapsed().as_millis() as u64
        );

        let mask = self.segment(source, points).await?;

        let start = Instant::now();
        let reference = self.store.store(&mask).await?;
        debug!(
            stage = "store",
            elapsed_ms = start.elapsed().as_millis() as u64
        );
        Ok(reference)
    }

    /// [`handle`](Self::handle) plus the mapping to a response body and status.
    #[instrument(skip_all, fields(content_type = %request.content_type))]
    pub async fn respond(&self, request: &InferenceRequest) -> InferenceResponse {
        let start = Instant::now();
        let result = self.handle(request).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(reference) => info!(%reference, elapsed_ms, "segmentation succeeded"),
            Err(e) => {
                let kind = e.kind();
                if kind.status_class() == StatusClass::ClientFault {
                    warn!(%kind, error = %e.report(), elapsed_ms, "request rejected");
                } else {
                    error!(%kind, error = %e.report(), elapsed_ms, "segmentation failed");
                }
            }
        }
        InferenceResponse::from_result(&result)
    }

    async fn segment(&self, source: SourceImage, points: Vec<PromptPoint>) -> Result<MaskImage> {
        let processor = Arc::clone(&self.processor);
        let start = Instant::now();
        let input = blocking(
            move || processor.prepare(&source, &points),
            |e| SegError::preprocess("preprocessing task", e),
        )
        .await?;
        debug!(
            stage = "preprocess",
            elapsed_ms = start.elapsed().as_millis() as u64
        );

        let runtime = self.runtime.clone();
        let metadata = input.metadata;
        let prediction = blocking(
            move || runtime.infer(&input),
            |e| SegError::inference("inference task", e),
        )
        .await?;

        let start = Instant::now();
        let mask = blocking(
            move || postprocess::render(&prediction, &metadata),
            |e| SegError::postprocess("postprocessing task", e),
        )
        .await?;
        debug!(
            stage = "postprocess",
            elapsed_ms = start.elapsed().as_millis() as u64
        );
        Ok(mask)
    }
}

/// Run `task` on the blocking pool; a panic or cancellation becomes `on_join`.
async fn blocking<T, W, E>(task: W, on_join: E) -> Result<T>
where
    T: Send + 'static,
    W: FnOnce() -> Result<T> + Send + 'static,
    E: FnOnce(JoinError) -> SegError,
{
    tokio::task::spawn_blocking(task).await.map_err(on_join)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::mocks::MockSegmentationModel;
    use crate::request::ResponseBody;
    use async_trait::async_trait;
    use image::{DynamicImage, Rgb, RgbImage};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use url::Url;

    struct StaticSource {
        image: Option<DynamicImage>,
        calls: AtomicUsize,
    }

    impl StaticSource {
        fn serving(image: DynamicImage) -> Self {
            Self {
                image: Some(image),
                calls: AtomicUsize::new(0),
            }
        }

        fn unreachable() -> Self {
            Self {
                image: None,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ImageSource for StaticSource {
        async fn fetch(&self, url: &Url) -> Result<SourceImage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.image
                .clone()
                .map(SourceImage::new)
                .ok_or_else(|| SegError::RemoteFetch {
                    url: url.to_string(),
                    status: Some(404),
                    source: "server responded with 404 Not Found".into(),
                })
        }
    }

    #[derive(Default)]
    struct RecordingStore {
        masks: Mutex<Vec<MaskImage>>,
    }

    #[async_trait]
    impl ArtifactStore for RecordingStore {
        async fn store(&self, mask: &MaskImage) -> Result<ArtifactReference> {
            let mut masks = self.masks.lock();
            masks.push(mask.clone());
            Ok(ArtifactReference::new(format!(
                "memory://test/{}.jpg",
                masks.len()
            )))
        }
    }

    type TestPipeline = SegmentationPipeline<StaticSource, MockSegmentationModel, RecordingStore>;

    fn pipeline(source: StaticSource, model: MockSegmentationModel) -> TestPipeline {
        SegmentationPipeline::new(source, ModelRuntime::new(model), RecordingStore::default())
    }

    fn white(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([255, 255, 255])))
    }

    fn request() -> InferenceRequest {
        InferenceRequest::json(r#"{"image_url": "https://images.example.com/cat.png"}"#)
    }

    #[tokio::test]
    async fn test_handle_stores_mask_at_original_size() -> Result<()> {
        let pipeline = pipeline(
            StaticSource::serving(white(40, 20)),
            MockSegmentationModel::new(64),
        );
        let reference = pipeline.handle(&request()).await?;
        assert_eq!(reference.as_str(), "memory://test/1.jpg");

        let masks = pipeline.store().masks.lock();
        assert_eq!(masks.len(), 1);
        assert_eq!(masks[0].dimensions(), (40, 20));
        assert_eq!(masks[0].image().to_rgb8().get_pixel(5, 5), &Rgb([255, 255, 0]));
        assert_eq!(pipeline.runtime().model().release_calls(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_wrong_content_type_has_no_side_effects() {
        let pipeline = pipeline(
            StaticSource::serving(white(8, 8)),
            MockSegmentationModel::new(64),
        );
        let request = InferenceRequest::new("image/png", request().body);
        let response = pipeline.respond(&request).await;

        assert_eq!(response.status, StatusClass::ClientFault);
        assert!(matches!(
            response.body,
            ResponseBody::Failure {
                kind: ErrorKind::UnsupportedContentType,
                ..
            }
        ));
        assert_eq!(pipeline.fetcher().calls.load(Ordering::SeqCst), 0);
        assert_eq!(pipeline.runtime().model().predict_calls(), 0);
        assert!(pipeline.store().masks.lock().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_failure_skips_inference_and_upload() {
        let pipeline = pipeline(StaticSource::unreachable(), MockSegmentationModel::new(64));
        let response = pipeline.respond(&request()).await;

        assert_eq!(response.status, StatusClass::ServerFault);
        assert_eq!(response.http_status(), 500);
        assert!(matches!(
            response.body,
            ResponseBody::Failure {
                kind: ErrorKind::RemoteFetch,
                ..
            }
        ));
        assert_eq!(pipeline.runtime().model().predict_calls(), 0);
        assert!(pipeline.store().masks.lock().is_empty());
    }

    #[tokio::test]
    async fn test_inference_failure_releases_caches_and_skips_upload() {
        let pipeline = pipeline(
            StaticSource::serving(white(16, 16)),
            MockSegmentationModel::new(64).failing(),
        );
        let err = pipeline.handle(&request()).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Inference);
        assert_eq!(pipeline.runtime().model().release_calls(), 1);
        assert!(pipeline.store().masks.lock().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_body_is_client_fault() {
        let pipeline = pipeline(
            StaticSource::serving(white(8, 8)),
            MockSegmentationModel::new(64),
        );
        let response = pipeline
            .respond(&InferenceRequest::json(r#"{"image_url": 42}"#))
            .await;
        assert_eq!(response.status, StatusClass::ClientFault);
        assert_eq!(pipeline.fetcher().calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_success_response_body() {
        let pipeline = pipeline(
            StaticSource::serving(white(12, 30)),
            MockSegmentationModel::new(64),
        );
        let response = pipeline.respond(&request()).await;
        assert_eq!(response.status, StatusClass::Success);
        assert_eq!(response.body_json(), r#"{"s3_url":"memory://test/1.jpg"}"#);
    }
}
