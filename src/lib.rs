use thiserror::Error;

pub type Result<T> = std::result::Result<T, RagError>;

#[derive(Error, Debug)]
pub enum RagError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Data integrity error: {0}")]
    DataIntegrity(String),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Throttled: {0}")]
    Throttled(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Coarse error class shown to a user; the full error goes to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Connectivity,
    Busy,
    Data,
    Request,
}

impl std::fmt::Display for ErrorCategory {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Configuration => "configuration problem",
            Self::Connectivity => "service unreachable",
            Self::Busy => "service busy, try again later",
            Self::Data => "stored data problem",
            Self::Request => "invalid request",
        };
        f.write_str(label)
    }
}

impl RagError {
    #[inline]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Throttled(_) => ErrorCategory::Busy,
            Self::Connection(_) | Self::Timeout(_) | Self::Embedding(_) => {
                ErrorCategory::Connectivity
            }
            Self::DataIntegrity(_) | Self::DimensionMismatch { .. } | Self::Io(_) => {
                ErrorCategory::Data
            }
            Self::InvalidArgument(_) | Self::Other(_) => ErrorCategory::Request,
        }
    }

    /// Whether retrying the same call may succeed. Timeouts and throttling
    /// are retryable, rejected credentials are not.
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Throttled(_))
    }
}

pub mod backends;
pub mod commands;
pub mod config;
pub mod database;
pub mod embeddings;
pub mod eval;
pub mod http;
pub mod index;
pub mod models;
pub mod retriever;

#[cfg(test)]
mod test_support;
