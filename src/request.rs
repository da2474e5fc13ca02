use bytes::Bytes;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::{ErrorKind, Result, SegError, StatusClass};
use crate::preprocess::PromptPoint;
use crate::store::ArtifactReference;

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// What the request layer hands to the pipeline.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub content_type: String,
    pub body: Bytes,
}

impl InferenceRequest {
    pub fn new(content_type: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            content_type: content_type.into(),
            body: body.into(),
        }
    }

    pub fn json(body: impl Into<Bytes>) -> Self {
        Self::new(JSON_CONTENT_TYPE, body)
    }

    /// Compares the media type only, so `application/json; charset=utf-8` passes.
    pub fn is_json(&self) -> bool {
        self.content_type
            .split(';')
            .next()
            .is_some_and(|essence| essence.trim().eq_ignore_ascii_case(JSON_CONTENT_TYPE))
    }

    pub fn payload(&self) -> Result<SegmentationPayload> {
        if !self.is_json() {
            return Err(SegError::UnsupportedContentType {
                content_type: self.content_type.clone(),
            });
        }
        let payload: SegmentationPayload =
            serde_json::from_slice(&self.body).map_err(|e| SegError::MalformedRequest {
                reason: e.to_string(),
            })?;
        payload.validate()?;
        Ok(payload)
    }
}

/// JSON body: `{"image_url": "...", "input_points": [[x, y], ...]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationPayload {
    pub image_url: Url,
    /// Pixel coordinates in the source image; the image centre when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_points: Option<Vec<PromptPoint>>,
}

impl SegmentationPayload {
    fn validate(&self) -> Result<()> {
        if !matches!(self.image_url.scheme(), "http" | "https") {
            return Err(SegError::MalformedRequest {
                reason: format!(
                    "image_url must be http or https, got `{}`",
                    self.image_url.scheme()
                ),
            });
        }
        if let Some(points) = &self.input_points {
            if points.is_empty() {
                return Err(SegError::MalformedRequest {
                    reason: "input_points must not be empty when given".to_string(),
                });
            }
            if let Some(point) = points.iter().find(|p| !p.is_finite() || p.x < 0.0 || p.y < 0.0) {
                return Err(SegError::MalformedRequest {
                    reason: format!("invalid prompt point {point:?}"),
                });
            }
        }
        Ok(())
    }

    /// Prompt points for an image of the given size.
    pub fn prompt_points(&self, width: u32, height: u32) -> Vec<PromptPoint> {
        match &self.input_points {
            Some(points) => points.clone(),
            None => vec![PromptPoint::center_of(width, height)],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResponseBody {
    Success {
        s3_url: ArtifactReference,
    },
    Failure {
        kind: ErrorKind,
        message: String,
    },
}

/// What the pipeline hands back to the request layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InferenceResponse {
    pub status: StatusClass,
    pub body: ResponseBody,
}

impl InferenceResponse {
    pub fn from_result(result: &Result<ArtifactReference>) -> Self {
        match result {
            Ok(reference) => Self {
                status: StatusClass::Success,
                body: ResponseBody::Success {
                    s3_url: reference.clone(),
                },
            },
            Err(err) => Self::from_error(err),
        }
    }

    pub fn from_error(err: &SegError) -> Self {
        let kind = err.kind();
        Self {
            status: kind.status_class(),
            body: ResponseBody::Failure {
                kind,
                message: err.report(),
            },
        }
    }

    pub const fn http_status(&self) -> u16 {
        self.status.http_status()
    }

    pub fn body_json(&self) -> String {
        serde_json::to_string(&self.body).unwrap_or_else(|_| {
            r#"{"kind":"InferenceError","message":"response serialization failed"}"#.to_string()
        })
    }
}
