use std::sync::Arc;

use anyhow::{ensure, Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sam_seg::serve::serve_lines;
use sam_seg::{
    BlobArtifactStore, Config, ImageFetcher, ModelRuntime, SamPipeline, SegmentationPipeline,
};

/// Reads one JSON request body per stdin line and writes one response line per
/// request to stdout, in completion order.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();
    ensure!(
        config.model_dir.is_dir(),
        "Model directory does not exist: {}",
        config.model_dir.display()
    );
    ensure!(config.max_concurrency > 0, "--max-concurrency must be at least 1");

    let model_config = config.model_config();
    let runtime = tokio::task::spawn_blocking(move || ModelRuntime::initialize(&model_config))
        .await
        .context("Model initialization task failed")?
        .context("Failed to load the segmentation model")?;
    let store =
        BlobArtifactStore::from_config(&config).context("Failed to open the artifact store")?;
    let fetcher =
        ImageFetcher::new(config.fetch_timeout()).context("Failed to build the image fetcher")?;

    let pipeline: Arc<SamPipeline> = Arc::new(SegmentationPipeline::new(fetcher, runtime, store));
    info!(
        device = %pipeline.runtime().device(),
        max_concurrency = config.max_concurrency,
        "ready for requests on stdin"
    );

    let summary = serve_lines(
        pipeline,
        tokio::io::stdin(),
        tokio::io::stdout(),
        &config.content_type,
        config.max_concurrency,
    )
    .await
    .context("Failed to serve requests")?;

    info!(requests = summary.requests, "input exhausted, shutting down");
    Ok(())
}
