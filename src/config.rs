use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::device::DevicePolicy;
use crate::errors::{Result, SegError};
use crate::request::JSON_CONTENT_TYPE;
use crate::store::StorageLocation;

#[derive(Parser, Clone, Debug)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Directory holding the exported SAM ONNX files
    #[arg(short, long, env = "SAM_MODEL_DIR")]
    pub model_dir: PathBuf,

    #[arg(long, env = "SAM_MODEL_ID", default_value = "facebook/sam-vit-base")]
    pub model_id: String,

    #[arg(long, env = "SAM_ENCODER_FILE", default_value = "vision_encoder.onnx")]
    pub encoder_file: String,

    #[arg(
        long,
        env = "SAM_DECODER_FILE",
        default_value = "prompt_encoder_mask_decoder.onnx"
    )]
    pub decoder_file: String,

    #[arg(long, env = "SAM_DEVICE", value_enum, default_value_t = DevicePolicy::Auto)]
    pub device: DevicePolicy,

    #[arg(short, long, env = "SAM_DEVICE_ID", default_value_t = 0)]
    pub device_id: i32,

    /// S3 bucket receiving the masks
    #[arg(short, long, env = "BUCKET_NAME")]
    pub bucket_name: Option<String>,

    /// Full storage URL (`s3://`, `file://`, `memory://`), overrides the bucket name
    #[arg(long, env = "STORAGE_URL")]
    pub storage_url: Option<String>,

    #[arg(long, env = "FETCH_TIMEOUT_SECS", default_value_t = 30)]
    pub fetch_timeout_secs: u64,

    #[arg(long, env = "UPLOAD_TIMEOUT_SECS", default_value_t = 60)]
    pub upload_timeout_secs: u64,

    #[arg(long, env = "JPEG_QUALITY", default_value_t = 90, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub jpeg_quality: u8,

    #[arg(long, env = "MAX_CONCURRENCY", default_value_t = 4)]
    pub max_concurrency: usize,

    /// Content type declared for every request read from stdin
    #[arg(long, default_value = JSON_CONTENT_TYPE)]
    pub content_type: String,
}

impl Config {
    pub fn model_config(&self) -> ModelConfig {
        ModelConfig {
            model_id: self.model_id.clone(),
            encoder_path: self.model_dir.join(&self.encoder_file),
            decoder_path: self.model_dir.join(&self.decoder_file),
            device: self.device,
            device_id: self.device_id,
        }
    }

    pub fn storage_location(&self) -> Result<StorageLocation> {
        match (&self.storage_url, &self.bucket_name) {
            (Some(url), _) => StorageLocation::parse(url),
            (None, Some(bucket)) => StorageLocation::parse(&format!("s3://{bucket}")),
            (None, None) => Err(SegError::Configuration {
                message: "either --bucket-name (BUCKET_NAME) or --storage-url (STORAGE_URL) must be set"
                    .to_string(),
            }),
        }
    }

    pub const fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub const fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }
}

/// モデルランタイムの初期化に必要な設定
#[derive(Clone, Debug)]
pub struct ModelConfig {
    pub model_id: String,
    pub encoder_path: PathBuf,
    pub decoder_path: PathBuf,
    pub device: DevicePolicy,
    pub device_id: i32,
}
