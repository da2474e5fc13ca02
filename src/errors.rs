use serde::Serialize;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Tagged errors for every stage of the segmentation pipeline.
///
/// Each variant names the stage that failed and keeps the underlying cause as
/// its `source`, so the response boundary can report the whole chain without
/// the caller parsing strings. Stage constructors (`SegError::inference`, ...)
/// accept anything convertible into a boxed error, including plain messages.
#[derive(Error, Debug)]
pub enum SegError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Unsupported content type: {content_type}")]
    UnsupportedContentType { content_type: String },

    #[error("Malformed request: {reason}")]
    MalformedRequest { reason: String },

    #[error("Remote fetch failed for {url}")]
    RemoteFetch {
        url: String,
        status: Option<u16>,
        #[source]
        source: BoxError,
    },

    #[error("Could not decode image fetched from {url}")]
    Decode {
        url: String,
        #[source]
        source: image::ImageError,
    },

    #[error("Preprocessing error: {operation} failed")]
    Preprocess {
        operation: String,
        #[source]
        source: BoxError,
    },

    #[error("Model load error: {operation} failed")]
    ModelLoad {
        operation: String,
        #[source]
        source: BoxError,
    },

    #[error("Inference error: {operation} failed")]
    Inference {
        operation: String,
        #[source]
        source: BoxError,
    },

    #[error("Postprocessing error: {operation} failed")]
    Postprocess {
        operation: String,
        #[source]
        source: BoxError,
    },

    #[error("Storage error: {operation} failed")]
    Storage {
        operation: String,
        #[source]
        source: BoxError,
    },
}

pub type Result<T> = std::result::Result<T, SegError>;

impl SegError {
    pub fn preprocess(operation: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Preprocess {
            operation: operation.into(),
            source: source.into(),
        }
    }

    pub fn model_load(operation: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::ModelLoad {
            operation: operation.into(),
            source: source.into(),
        }
    }

    pub fn inference(operation: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Inference {
            operation: operation.into(),
            source: source.into(),
        }
    }

    pub fn postprocess(operation: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Postprocess {
            operation: operation.into(),
            source: source.into(),
        }
    }

    pub fn storage(operation: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Storage {
            operation: operation.into(),
            source: source.into(),
        }
    }

    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::UnsupportedContentType { .. } => ErrorKind::UnsupportedContentType,
            Self::MalformedRequest { .. } => ErrorKind::MalformedRequest,
            Self::RemoteFetch { .. } => ErrorKind::RemoteFetch,
            Self::Decode { .. } => ErrorKind::Decode,
            Self::Preprocess { .. } => ErrorKind::Preprocess,
            Self::ModelLoad { .. } => ErrorKind::ModelLoad,
            Self::Inference { .. } => ErrorKind::Inference,
            Self::Postprocess { .. } => ErrorKind::Postprocess,
            Self::Storage { .. } => ErrorKind::Storage,
        }
    }

    /// The error and all of its sources joined with `": "`.
    pub fn report(&self) -> String {
        let mut message = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        message
    }
}

/// Shape errors surface while moving tensors in and out of the runtime, so
/// they are reported as inference failures.
impl From<ndarray::ShapeError> for SegError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::inference("tensor shape conversion", err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    #[serde(rename = "ConfigurationError")]
    Configuration,
    #[serde(rename = "UnsupportedContentTypeError")]
    UnsupportedContentType,
    #[serde(rename = "MalformedRequestError")]
    MalformedRequest,
    #[serde(rename = "RemoteFetchError")]
    RemoteFetch,
    #[serde(rename = "DecodeError")]
    Decode,
    #[serde(rename = "PreprocessError")]
    Preprocess,
    #[serde(rename = "ModelLoadError")]
    ModelLoad,
    #[serde(rename = "InferenceError")]
    Inference,
    #[serde(rename = "PostprocessError")]
    Postprocess,
    #[serde(rename = "StorageError")]
    Storage,
}

/// Coarse outcome signal handed to the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusClass {
    Success,
    ClientFault,
    ServerFault,
}

impl StatusClass {
    pub const fn http_status(self) -> u16 {
        match self {
            Self::Success => 200,
            Self::ClientFault => 400,
            Self::ServerFault => 500,
        }
    }
}

/// Error kind to status mapping consumed at the response boundary.
pub const STATUS_TABLE: [(ErrorKind, StatusClass); 10] = [
    (ErrorKind::Configuration, StatusClass::ServerFault),
    (ErrorKind::UnsupportedContentType, StatusClass::ClientFault),
    (ErrorKind::MalformedRequest, StatusClass::ClientFault),
    (ErrorKind::RemoteFetch, StatusClass::ServerFault),
    (ErrorKind::Decode, StatusClass::ClientFault),
    (ErrorKind::Preprocess, StatusClass::ServerFault),
    (ErrorKind::ModelLoad, StatusClass::ServerFault),
    (ErrorKind::Inference, StatusClass::ServerFault),
    (ErrorKind::Postprocess, StatusClass::ServerFault),
    (ErrorKind::Storage, StatusClass::ServerFault),
];

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "ConfigurationError",
            Self::UnsupportedContentType => "UnsupportedContentTypeError",
            Self::MalformedRequest => "MalformedRequestError",
            Self::RemoteFetch => "RemoteFetchError",
            Self::Decode => "DecodeError",
            Self::Preprocess => "PreprocessError",
            Self::ModelLoad => "ModelLoadError",
            Self::Inference => "InferenceError",
            Self::Postprocess => "PostprocessError",
            Self::Storage => "StorageError",
        }
    }

    pub fn status_class(self) -> StatusClass {
        STATUS_TABLE
            .iter()
            .find(|(kind, _)| *kind == self)
            .map_or(StatusClass::ServerFault, |(_, status)| *status)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
