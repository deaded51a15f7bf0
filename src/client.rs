//! Client side of the queue.
//!
//! [`QueueHandle`] is what a UI or CLI holds. Mutations are fire-and-forget
//! messages to the coordinator task; reads return a consistent snapshot.

use std::sync::Arc;

use anyhow::{anyhow, Context, Error};
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, Instrument};
use uuid::Uuid;

use crate::archive::{build_archive, resized_file_name};
use crate::codec::{Codec, TransformRequest};
use crate::formats::is_accepted_mime;
use crate::registry::ItemView;
use crate::server::{self, Command, QueueConfig, QueueEvent, Upload};
use crate::{device_size, Settings, SourceFile, Status, UploadError};

#[derive(Debug, Default)]
pub struct UploadReport {
    pub accepted: Vec<Uuid>,
    pub rejected: Vec<UploadError>,
}

#[derive(Debug, Clone)]
pub struct ResizedExport {
    pub file_name: String,
    pub bytes: Bytes,
    pub width: u32,
}

#[derive(Clone)]
pub struct QueueHandle {
    send_to_server: mpsc::UnboundedSender<Command>,
    codec: Arc<dyn Codec>,
    output_suffix: String,
}

impl QueueHandle {
    /// Starts a session: the coordinator task and its worker executor.
    ///
    /// The session ends when `cancel_token` is cancelled or every handle has
    /// been dropped.
    pub fn spawn(
        cancel_token: CancellationToken,
        config: QueueConfig,
        codec: Arc<dyn Codec>,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<QueueEvent>,
        JoinHandle<Result<(), Error>>,
    ) {
        // Channel for sending commands to the coordinator
        let (send_to_server, recv_from_client) = mpsc::unbounded_channel();

        // Channel for queue events coming back
        let (send_to_client, recv_from_server) = mpsc::unbounded_channel();

        let handle = Self {
            send_to_server,
            codec: codec.clone(),
            output_suffix: config.output_suffix.clone(),
        };

        let server_spawn = tokio::spawn(
            async move {
                let result =
                    server::serve(cancel_token, config, codec, recv_from_client, send_to_client)
                        .await;
                if let Err(err) = &result {
                    error!("Error running coordinator: {}", err);
                }
                result
            }
            .instrument(info_span!("coordinator")),
        );

        (handle, recv_from_server, server_spawn)
    }

    fn send(&self, command: Command) -> Result<(), Error> {
        self.send_to_server
            .send(command)
            .map_err(|_| anyhow!("Queue has shut down"))
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, Error> {
        let (reply, recv_reply) = oneshot::channel();
        self.send(command(reply))?;
        recv_reply
            .await
            .map_err(|_| anyhow!("Queue shut down before replying"))
    }

    /// Registers accepted files as queued items and returns right away.
    /// Files with an unsupported type are reported and never enqueued.
    pub fn upload(&self, files: Vec<SourceFile>) -> Result<UploadReport, Error> {
        let mut report = UploadReport::default();
        let mut uploads = Vec::with_capacity(files.len());

        for file in files {
            if !is_accepted_mime(&file.mime) {
                debug!(message = "Rejected upload", name = %file.name, mime = %file.mime);
                report.rejected.push(UploadError::UnsupportedFormat {
                    name: file.name,
                    mime: file.mime,
                });
                continue;
            }
            let id = Uuid::new_v4();
            report.accepted.push(id);
            uploads.push(Upload { id, file });
        }

        if !uploads.is_empty() {
            self.send(Command::Upload(uploads))?;
        }
        Ok(report)
    }

    pub fn delete(&self, id: Uuid) -> Result<(), Error> {
        self.send(Command::Delete(id))
    }

    pub fn update_settings(&self, settings: Settings) -> Result<(), Error> {
        self.send(Command::UpdateSettings(settings))
    }

    pub async fn settings(&self) -> Result<Settings, Error> {
        self.request(Command::CurrentSettings).await
    }

    pub async fn items(&self) -> Result<Vec<ItemView>, Error> {
        self.request(Command::Items).await
    }

    pub async fn done_count(&self) -> Result<usize, Error> {
        let items = self.items().await?;
        Ok(items
            .iter()
            .filter(|item| item.status == Status::Done)
            .count())
    }

    /// Zips the result of every `Done` item. `None` when there is nothing to
    /// package.
    pub async fn download_all(&self) -> Result<Option<Vec<u8>>, Error> {
        let entries = self.request(Command::DoneEntries).await?;
        if entries.is_empty() {
            return Ok(None);
        }

        let archive = tokio::task::spawn_blocking(move || build_archive(&entries))
            .await
            .context("Archive task failed")??;
        Ok(Some(archive))
    }

    /// Re-encodes the original upload of `id` at a device width with the
    /// current settings. Item state is not touched.
    pub async fn export_resized(&self, id: Uuid, device_key: &str) -> Result<ResizedExport, Error> {
        let device =
            device_size(device_key).ok_or_else(|| anyhow!("Unknown device size: {}", device_key))?;
        let source = self
            .request(|reply| Command::Source(id, reply))
            .await?
            .ok_or_else(|| anyhow!("Item {} does not exist", id))?;
        let settings = self.settings().await?;

        let file_name =
            resized_file_name(&source.name, &self.output_suffix, settings.format, device.key);
        let request = TransformRequest {
            source: source.bytes,
            mime: source.mime,
            settings,
            resize_width: Some(device.width),
        };
        let codec = self.codec.clone();
        let output = tokio::task::spawn_blocking(move || codec.transform(&request))
            .await
            .context("Resize task failed")??;

        Ok(ResizedExport {
            file_name,
            bytes: output.bytes,
            width: device.width,
        })
    }
}
