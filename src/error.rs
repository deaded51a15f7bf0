use std::path::PathBuf;
use std::time::Duration;

use crate::OutputFormat;

/// Failures scoped to a single item. They are recorded on the item and never
/// abort the drain loop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransformError {
    #[error("Failed to decode {mime} image: {message}")]
    Decode { mime: String, message: String },

    #[error("Failed to encode {format} image: {message}")]
    Encode {
        format: OutputFormat,
        message: String,
    },

    #[error("Worker terminated before replying")]
    WorkerTerminated,

    #[error("Transform timed out after {0:?}")]
    TimedOut(Duration),
}

/// Files rejected before they reach the queue.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Unsupported image format for {name}: {mime}")]
    UnsupportedFormat { name: String, mime: String },

    #[error("Failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
