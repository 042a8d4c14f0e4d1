use std::sync::Arc;

/// Terminal failure of an image or data task.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineError {
    #[error("data loading failed: {0}")]
    DataLoadingFailed(Arc<LoadError>),

    #[error("failed to decode image data")]
    DecodingFailed,

    #[error("failed to process image")]
    ProcessingFailed,
}

impl PipelineError {
    pub fn data_loading_failed(error: LoadError) -> Self {
        Self::DataLoadingFailed(Arc::new(error))
    }

    /// The underlying load error, if the failure happened while loading.
    pub fn load_error(&self) -> Option<&LoadError> {
        match self {
            Self::DataLoadingFailed(error) => Some(error),
            _ => None,
        }
    }
}

/// Failure reported by a data loader.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("response status code was unacceptable: {0}")]
    StatusCodeUnacceptable(u16),

    #[error("response contained no data")]
    EmptyResponse,

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("load cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl LoadError {
    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn other(reason: impl Into<String>) -> Self {
        Self::Other(reason.into())
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::StatusCodeUnacceptable(code) => Some(*code),
            Self::Network { source } => source.status().map(|status| status.as_u16()),
            _ => None,
        }
    }
}

/// Disk cache failure. Logged by the pipeline, never surfaced to callers.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl CacheError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
