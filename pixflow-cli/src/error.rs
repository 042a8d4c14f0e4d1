use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Cache error: {0}")]
    Cache(#[from] pixflow::CacheError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] pixflow::PipelineError),

    #[error("Failed to encode {0}")]
    Encode(String),

    #[error("Load cancelled: {0}")]
    Cancelled(String),

    #[error("Task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("{failed} of {total} images failed")]
    Failures { failed: usize, total: usize },
}

pub type Result<T> = std::result::Result<T, AppError>;
