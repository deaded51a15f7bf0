use std::path::Path;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod archive;
pub mod client;
pub mod codec;
pub mod error;
pub mod formats;
pub mod queue;
pub mod registry;
pub mod server;
pub mod settings;
pub mod telemetry;
pub mod worker;

pub use client::{QueueHandle, ResizedExport, UploadReport};
pub use codec::{Codec, ImageCodec, TransformOutput, TransformRequest};
pub use error::{TransformError, UploadError};
pub use formats::OutputFormat;
pub use registry::{Item, ItemView, Registry};
pub use server::{QueueConfig, QueueEvent};

/// Target encoding captured when a job is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub format: OutputFormat,
    pub quality: u8,
}

impl Settings {
    /// Quality is clamped to `1..=100`.
    pub fn new(format: OutputFormat, quality: u8) -> Self {
        Self {
            format,
            quality: quality.clamp(1, 100),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::new(OutputFormat::Webp, 80)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Queued,
    Processing,
    Done,
    Error,
}

/// Unit of work handed from the queue to the worker executor.
///
/// `generation` identifies which submission of the item this job belongs to;
/// every re-submission after a settings change bumps it.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub source: Bytes,
    pub mime: String,
    pub settings: Settings,
    pub generation: u64,
}

/// A user supplied file, before it becomes an item.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub name: String,
    pub mime: String,
    pub bytes: Bytes,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, mime: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            mime: mime.into(),
            bytes: bytes.into(),
        }
    }

    /// Reads a file from disk, guessing its MIME type from the extension.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, UploadError> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await.map_err(|source| UploadError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        let mime = formats::mime_from_path(path).unwrap_or(formats::UNKNOWN_MIME);

        Ok(Self::new(name, mime, bytes))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSize {
    pub key: &'static str,
    pub width: u32,
}

pub const DEVICE_SIZES: [DeviceSize; 4] = [
    DeviceSize {
        key: "mobile",
        width: 640,
    },
    DeviceSize {
        key: "tablet",
        width: 768,
    },
    DeviceSize {
        key: "laptop",
        width: 1280,
    },
    DeviceSize {
        key: "desktop",
        width: 1920,
    },
];

pub fn device_size(key: &str) -> Option<&'static DeviceSize> {
    DEVICE_SIZES.iter().find(|device| device.key == key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_clamp_quality() {
        assert_eq!(Settings::new(OutputFormat::Avif, 0).quality, 1);
        assert_eq!(Settings::new(OutputFormat::Avif, 250).quality, 100);
        assert_eq!(Settings::default(), Settings::new(OutputFormat::Webp, 80));
    }

    #[test]
    fn device_lookup() {
        assert_eq!(device_size("tablet").map(|d| d.width), Some(768));
        assert!(device_size("watch").is_none());
    }

    #[tokio::test]
    async fn source_file_from_path_guesses_mime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.JPG");
        std::fs::write(&path, b"jpeg-bytes").unwrap();

        let file = SourceFile::from_path(&path).await.unwrap();
        assert_eq!(file.name, "photo.JPG");
        assert_eq!(file.mime, "image/jpeg");
        assert_eq!(&file.bytes[..], b"jpeg-bytes");
    }

    #[tokio::test]
    async fn source_file_from_missing_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = SourceFile::from_path(dir.path().join("nope.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Read { .. }));
    }
}
