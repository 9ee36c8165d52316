// feed_ingestor/src/error.rs
// Defines custom error types for the feed_ingestor crate.

use thiserror::Error;

#[derive(Debug, Error,)]
pub enum IngestorError {
    #[error("Failed to connect to database: {0}")]
    ConnectionError(String,),
    #[error("Invalid configuration: {0}")]
    ConfigurationError(String,),
    #[error("Database specific error: {0}")]
    DatabaseError(String,),
    #[error("Failed to fetch feed: {0}")]
    FetchError(String,),
    #[error("Failed to decompress feed: {0}")]
    DecompressError(String,),
    /// Fatal tokenizer failure. `line` is 1-based.
    #[error("XML parse error at line {line}: {reason}")]
    ParseError { line: u64, reason: String, },
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error,),
    #[error("Other error: {0}")]
    Other(String,),
}

impl IngestorError {
    pub fn is_transient(&self,) -> bool {
        match self {
            IngestorError::ConnectionError(_,) => true,
            IngestorError::DatabaseError(msg,) | IngestorError::FetchError(msg,) => {
                let m = msg.to_lowercase();
                m.contains("timeout",)
                    || m.contains("timed out",)
                    || m.contains("connection",)
                    || m.contains("busy",)
                    || m.contains("server selection",)
                    || m.contains("connection reset",)
                    || m.contains("service unavailable",)
                    || m.contains("bad gateway",)
                    || m.contains("gateway timeout",)
            },
            _ => false,
        }
    }
}

pub type Result<T,> = std::result::Result<T, IngestorError,>;
