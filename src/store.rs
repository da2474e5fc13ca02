use std::fmt;
use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use object_store::{
    aws::AmazonS3Builder, local::LocalFileSystem, memory::InMemory, path::Path, ObjectStore,
    PutPayload,
};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, instrument};
use url::Url;

use crate::config::Config;
use crate::errors::{Result, SegError};
use crate::postprocess::MaskImage;
use crate::traits::ArtifactStore;

/// URI of a stored mask, e.g. `s3://bucket/20240501120000-1a2b3c4d5e6f7a8b.jpg`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ArtifactReference(String);

impl ArtifactReference {
    pub fn new(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parsed destination: `s3://bucket[/prefix]`, `memory://name[/prefix]` or
/// `file:///directory`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLocation {
    scheme: String,
    bucket: String,
    prefix: Option<String>,
}

impl StorageLocation {
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = |reason: String| SegError::Configuration {
            message: format!("invalid storage location `{raw}`: {reason}"),
        };
        let url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
        let path = url.path().trim_matches('/');

        match url.scheme() {
            scheme @ ("s3" | "memory") => {
                let bucket = url
                    .host_str()
                    .filter(|host| !host.is_empty())
                    .ok_or_else(|| invalid("missing bucket name".to_string()))?;
                Ok(Self {
                    scheme: scheme.to_string(),
                    bucket: bucket.to_string(),
                    prefix: (!path.is_empty()).then(|| path.to_string()),
                })
            }
            "file" => {
                if path.is_empty() {
                    return Err(invalid("missing directory".to_string()));
                }
                let directory = url
                    .to_file_path()
                    .map_err(|()| invalid("not a local directory".to_string()))?;
                let directory = directory.to_string_lossy();
                Ok(Self {
                    scheme: "file".to_string(),
                    bucket: directory.trim_end_matches('/').to_string(),
                    prefix: None,
                })
            }
            other => Err(invalid(format!("unsupported scheme `{other}`"))),
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    pub fn base_url(&self) -> String {
        format!("{}://{}", self.scheme, self.bucket)
    }

    pub fn object_path(&self, name: &str) -> Path {
        match &self.prefix {
            Some(prefix) => Path::from(format!("{prefix}/{name}")),
            None => Path::from(name),
        }
    }

    pub fn reference_for(&self, path: &Path) -> ArtifactReference {
        ArtifactReference(format!("{}/{}", self.base_url(), path))
    }

    /// Open the backing object store. S3 credentials and region come from the
    /// usual `AWS_*` environment variables.
    pub fn connect(&self) -> Result<Arc<dyn ObjectStore>> {
        let connect_error = |e: object_store::Error| SegError::Configuration {
            message: format!("could not open storage {}: {e}", self.base_url()),
        };
        match self.scheme.as_str() {
            "s3" => {
                let store = AmazonS3Builder::from_env()
                    .with_bucket_name(&self.bucket)
                    .build()
                    .map_err(connect_error)?;
                Ok(Arc::new(store))
            }
            "file" => {
                std::fs::create_dir_all(&self.bucket).map_err(|e| SegError::Configuration {
                    message: format!("could not create {}: {e}", self.bucket),
                })?;
                let store = LocalFileSystem::new_with_prefix(&self.bucket).map_err(connect_error)?;
                Ok(Arc::new(store))
            }
            _ => Ok(Arc::new(InMemory::new())),
        }
    }
}

/// `<UTC timestamp>-<first 8 bytes of SHA-256 as hex>.jpg`
pub fn artifact_name(timestamp: DateTime<Utc>, contents: &[u8]) -> String {
    let digest = Sha256::digest(contents);
    let hash: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    format!("{}-{hash}.jpg", timestamp.format("%Y%m%d%H%M%S"))
}

/// Uploads JPEG-encoded masks through `object_store`.
pub struct BlobArtifactStore {
    store: Arc<dyn ObjectStore>,
    location: StorageLocation,
    upload_timeout: Duration,
    jpeg_quality: u8,
}

impl BlobArtifactStore {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        location: StorageLocation,
        upload_timeout: Duration,
        jpeg_quality: u8,
    ) -> Self {
        Self {
            store,
            location,
            upload_timeout,
            jpeg_quality,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let location = config.storage_location()?;
        let store = location.connect()?;
        info!(location = %location.base_url(), "artifact store ready");
        Ok(Self::new(
            store,
            location,
            config.upload_timeout(),
            config.jpeg_quality,
        ))
    }

    /// JPEG-encode and name the mask on the blocking pool.
    async fn encode(&self, mask: &MaskImage) -> Result<(Vec<u8>, Path)> {
        let mask = mask.clone();
        let quality = self.jpeg_quality;
        let location = self.location.clone();
        tokio::task::spawn_blocking(move || {
            let bytes = encode_jpeg(&mask, quality)?;
            let path = location.object_path(&artifact_name(Utc::now(), &bytes));
            Ok::<_, SegError>((bytes, path))
        })
        .await
        .map_err(|e| SegError::storage("jpeg encoding task", e))?
    }
}

pub fn encode_jpeg(mask: &MaskImage, quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    mask.image()
        .write_with_encoder(JpegEncoder::new_with_quality(&mut buffer, quality))
        .map_err(|e| SegError::storage("jpeg encoding", e))?;
    Ok(buffer.into_inner())
}

#[async_trait]
impl ArtifactStore for BlobArtifactStore {
    #[instrument(skip_all, fields(location = %self.location.base_url()))]
    async fn store(&self, mask: &MaskImage) -> Result<ArtifactReference> {
        let start = Instant::now();
        let (bytes, path) = self.encode(mask).await?;
        let size = bytes.len();

        match tokio::time::timeout(
            self.upload_timeout,
            self.store.put(&path, PutPayload::from(bytes)),
        )
        .await
        {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(SegError::storage(format!("upload of {path}"), e)),
            Err(_) => {
                return Err(SegError::storage(
                    format!("upload of {path}"),
                    format!("not acknowledged within {:?}", self.upload_timeout),
                ))
            }
        }

        let reference = self.location.reference_for(&path);
        info!(
            %reference,
            bytes = size,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "mask uploaded"
        );
        Ok(reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use image::{DynamicImage, GrayImage, Luma};

    fn mask(width: u32, height: u32) -> MaskImage {
        MaskImage::new(DynamicImage::ImageLuma8(GrayImage::from_fn(
            width,
            height,
            |x, _| Luma([if x % 2 == 0 { 255 } else { 0 }]),
        )))
    }

    fn memory_store(url: &str) -> (Arc<InMemory>, BlobArtifactStore) {
        let memory = Arc::new(InMemory::new());
        let store = BlobArtifactStore::new(
            memory.clone(),
            StorageLocation::parse(url).unwrap(),
            Duration::from_secs(5),
            90,
        );
        (memory, store)
    }

    #[test]
    fn test_parse_locations() -> Result<()> {
        let s3 = StorageLocation::parse("s3://masks/sam/output/")?;
        assert_eq!(s3.scheme(), "s3");
        assert_eq!(s3.bucket(), "masks");
        assert_eq!(s3.prefix(), Some("sam/output"));
        assert_eq!(s3.base_url(), "s3://masks");

        let file = StorageLocation::parse("file:///tmp/masks")?;
        assert_eq!(file.base_url(), "file:///tmp/masks");
        assert_eq!(file.prefix(), None);

        let spaced = StorageLocation::parse("file:///tmp/sam%20masks/")?;
        assert_eq!(spaced.bucket(), "/tmp/sam masks");

        assert!(StorageLocation::parse("gs://bucket").is_err());
        assert!(StorageLocation::parse("s3://").is_err());
        assert!(StorageLocation::parse("not a url").is_err());
        Ok(())
    }

    #[test]
    fn test_artifact_name_format() {
        let timestamp = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 45).unwrap();
        let name = artifact_name(timestamp, b"mask bytes");
        let (stamp, rest) = name.split_once('-').unwrap();
        assert_eq!(stamp, "20240501123045");
        let hash = rest.strip_suffix(".jpg").unwrap();
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));

        // same second, different content
        assert_ne!(name, artifact_name(timestamp, b"other mask bytes"));
    }

    #[tokio::test]
    async fn test_store_uploads_before_returning() -> Result<()> {
        let (memory, store) = memory_store("s3://masks/sam");
        let reference = store.store(&mask(20, 10)).await?;

        let key = reference
            .as_str()
            .strip_prefix("s3://masks/")
            .expect("reference names the bucket");
        assert!(key.starts_with("sam/"));
        assert!(key.ends_with(".jpg"));

        let stored = memory
            .get(&Path::from(key))
            .await
            .map_err(|e| SegError::storage("test read", e))?
            .bytes()
            .await
            .map_err(|e| SegError::storage("test read", e))?;
        let decoded = image::load_from_memory(&stored).expect("stored object is a jpeg");
        assert_eq!((decoded.width(), decoded.height()), (20, 10));
        Ok(())
    }

    #[tokio::test]
    async fn test_rgb_masks_encode() -> Result<()> {
        let (_, store) = memory_store("memory://scratch");
        let rgb = MaskImage::new(DynamicImage::new_rgb8(8, 8));
        let reference = store.store(&rgb).await?;
        assert!(reference.as_str().starts_with("memory://scratch/"));
        Ok(())
    }

    #[tokio::test]
    async fn test_upload_failure_is_storage_error() -> Result<()> {
        let dir = tempfile::tempdir().map_err(|e| SegError::storage("tempdir", e))?;
        let root = dir.path().join("masks");
        std::fs::create_dir_all(&root).map_err(|e| SegError::storage("mkdir", e))?;
        let local = LocalFileSystem::new_with_prefix(&root)
            .map_err(|e| SegError::storage("local store", e))?;

        // the store's root turns into a plain file, so every write fails
        std::fs::remove_dir(&root).map_err(|e| SegError::storage("rmdir", e))?;
        std::fs::write(&root, b"not a directory").map_err(|e| SegError::storage("write", e))?;

        let store = BlobArtifactStore::new(
            Arc::new(local),
            StorageLocation::parse(&format!("file://{}", root.display()))?,
            Duration::from_secs(5),
            90,
        );
        let err = store.store(&mask(4, 4)).await.unwrap_err();
        assert!(matches!(err, SegError::Storage { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_file_location_writes_to_disk() -> Result<()> {
        let dir = tempfile::tempdir().map_err(|e| SegError::storage("tempdir", e))?;
        let root = dir.path().join("mask output");
        let url = Url::from_file_path(&root).expect("absolute path");
        let location = StorageLocation::parse(url.as_str())?;
        assert_eq!(location.bucket(), root.to_string_lossy());
        let store = BlobArtifactStore::new(location.connect()?, location, Duration::from_secs(5), 80);

        let reference = store.store(&mask(6, 6)).await?;
        let file = reference
            .as_str()
            .strip_prefix("file://")
            .expect("file reference");
        assert!(std::path::Path::new(file).is_file());
        Ok(())
    }

    #[test]
    fn test_encode_jpeg_keeps_size() -> Result<()> {
        let bytes = encode_jpeg(&mask(24, 9), 75)?;
        assert_eq!(&bytes[..2], &[0xff, 0xd8]);
        let decoded = image::load_from_memory(&bytes).expect("valid jpeg");
        assert_eq!((decoded.width(), decoded.height()), (24, 9));
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_store_on_single_threaded_runtime() -> Result<()> {
        let (memory, store) = memory_store("s3://masks");
        let reference = store.store(&mask(16, 16)).await?;
        let key = reference.as_str().strip_prefix("s3://masks/").unwrap();
        let listing = memory
            .list_with_delimiter(None)
            .await
            .map_err(|e| SegError::storage("test list", e))?;
        assert_eq!(listing.objects.len(), 1);
        assert_eq!(listing.objects[0].location.as_ref(), key);
        Ok(())
    }
}
