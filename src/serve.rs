use std::io;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};

use crate::pipeline::SegmentationPipeline;
use crate::request::InferenceRequest;
use crate::traits::{ArtifactStore, ImageSource, SegmentationModel};

/// What a finished [`serve_lines`] run hands back.
#[derive(Debug)]
pub struct ServeSummary<W> {
    /// Request lines read from the input.
    pub requests: usize,
    pub output: W,
}

/// Read one request body per line and write one JSON response per line, in
/// completion order.
///
/// At most `max_concurrency` requests are in flight. Nothing is kept for a
/// request once its response has been queued, so a long input stream runs in
/// bounded memory. Reading stops early when the output side has failed.
pub async fn serve_lines<R, W, F, M, S>(
    pipeline: Arc<SegmentationPipeline<F, M, S>>,
    input: R,
    mut output: W,
    content_type: &str,
    max_concurrency: usize,
) -> io::Result<ServeSummary<W>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
    F: ImageSource + 'static,
    M: SegmentationModel + 'static,
    S: ArtifactStore + 'static,
{
    let limit = max_concurrency.max(1);
    let permits = Arc::new(Semaphore::new(limit));
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            output.write_all(line.as_bytes()).await?;
            output.write_all(b"\n").await?;
            output.flush().await?;
        }
        Ok::<_, io::Error>(output)
    });

    let mut lines = BufReader::new(input).lines();
    let mut requests = 0usize;
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let permit = Arc::clone(&permits)
            .acquire_owned()
            .await
            .map_err(io::Error::other)?;
        if tx.is_closed() {
            warn!(requests, "response output closed, no longer reading requests");
            break;
        }

        let request = InferenceRequest::new(content_type, line);
        let pipeline = Arc::clone(&pipeline);
        let tx = tx.clone();
        let index = requests;
        requests += 1;

        tokio::spawn(async move {
            let _permit = permit;
            let response = pipeline.respond(&request).await;
            let line = serde_json::json!({
                "request": index,
                "status": response.http_status(),
                "body": response.body,
            });
            if tx.send(line.to_string()).is_err() {
                warn!(request = index, "response output closed, response dropped");
            }
        });
    }

    // every permit back means every spawned request has finished
    let _all = permits
        .acquire_many(limit as u32)
        .await
        .map_err(io::Error::other)?;
    drop(tx);

    let output = writer.await.map_err(io::Error::other)??;
    debug!(requests, "input exhausted");
    Ok(ServeSummary { requests, output })
}
