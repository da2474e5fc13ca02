use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use image::{DynamicImage, GenericImageView, ImageError};
use reqwest::Client;
use tracing::{debug, instrument};
use url::Url;

use crate::errors::{Result, SegError};
use crate::traits::ImageSource;

/// A decoded raster owned by a single request.
#[derive(Debug, Clone)]
pub struct SourceImage {
    image: DynamicImage,
}

impl SourceImage {
    pub const fn new(image: DynamicImage) -> Self {
        Self { image }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    pub const fn image(&self) -> &DynamicImage {
        &self.image
    }
}

/// HTTP image fetcher. One attempt per call, bounded by `timeout`.
#[derive(Clone)]
pub struct ImageFetcher {
    client: Client,
    timeout: Duration,
}

impl ImageFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .user_agent(concat!("sam-seg/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SegError::Configuration {
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self::with_client(client, timeout))
    }

    pub const fn with_client(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn download(&self, url: &Url) -> Result<Bytes> {
        let remote_error = |status: Option<u16>, source: crate::errors::BoxError| {
            SegError::RemoteFetch {
                url: url.to_string(),
                status,
                source,
            }
        };

        let response = self
            .client
            .get(url.clone())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| remote_error(None, e.into()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(remote_error(
                Some(status.as_u16()),
                format!("server responded with {status}").into(),
            ));
        }

        response
            .bytes()
            .await
            .map_err(|e| remote_error(Some(status.as_u16()), e.into()))
    }
}

/// Decode fetched bytes on the blocking pool.
pub async fn decode(url: &Url, body: Bytes) -> Result<SourceImage> {
    let source_url = url.to_string();
    let task_url = source_url.clone();
    tokio::task::spawn_blocking(move || {
        image::load_from_memory(&body)
            .map(SourceImage::new)
            .map_err(|source| SegError::Decode {
                url: task_url,
                source,
            })
    })
    .await
    .map_err(|e| SegError::Decode {
        url: source_url,
        source: ImageError::IoError(std::io::Error::other(e)),
    })?
}

#[async_trait]
impl ImageSource for ImageFetcher {
    #[instrument(skip_all, fields(url = %url))]
    async fn fetch(&self, url: &Url) -> Result<SourceImage> {
        let start = Instant::now();
        let body = self.download(url).await?;
        let size = body.len();
        let image = decode(url, body).await?;
        debug!(
            bytes = size,
            width = image.width(),
            height = image.height(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "fetched source image"
        );
        Ok(image)
    }
}
