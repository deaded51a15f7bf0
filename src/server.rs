use crate::archive::{optimized_file_name, ArchiveEntry, DEFAULT_SUFFIX};
use crate::codec::{Codec, TransformOutput, TransformRequest};
use crate::queue::JobQueue;
use crate::registry::{ItemView, Registry, ReplyOutcome, TransitionError};
use crate::settings::SettingsStore;
use crate::worker::{PendingReply, WorkerHandle};
use crate::{Job, Settings, SourceFile, Status, TransformError};
use anyhow::Error;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::*;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub initial_settings: Settings,
    /// `None` waits for the executor forever.
    pub transform_timeout: Option<Duration>,
    /// Appended to the base name of every exported file.
    pub output_suffix: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            initial_settings: Settings::default(),
            transform_timeout: None,
            output_suffix: DEFAULT_SUFFIX.to_owned(),
        }
    }
}

#[derive(Debug)]
pub struct Upload {
    pub id: Uuid,
    pub file: SourceFile,
}

/// Requests from the client side. Each one is handled to completion before
/// the next message or worker reply is looked at.
#[derive(Debug)]
pub enum Command {
    Upload(Vec<Upload>),
    Delete(Uuid),
    UpdateSettings(Settings),
    Items(oneshot::Sender<Vec<ItemView>>),
    CurrentSettings(oneshot::Sender<Settings>),
    DoneEntries(oneshot::Sender<Vec<ArchiveEntry>>),
    Source(Uuid, oneshot::Sender<Option<SourceFile>>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Queued(Uuid),
    Processing(Uuid),
    Done(Uuid),
    Failed(Uuid, String),
    Removed(Uuid),
    SettingsChanged(Settings),
    /// The queue ran dry after doing some work.
    Idle,
}

struct InFlight {
    item_id: Uuid,
    generation: u64,
    settings: Settings,
    reply: PendingReply,
    deadline: Option<(Instant, Duration)>,
}

struct Coordinator {
    registry: Registry,
    queue: JobQueue,
    settings: SettingsStore,
    worker: WorkerHandle,
    in_flight: Option<InFlight>,
    busy: bool,
    transform_timeout: Option<Duration>,
    output_suffix: String,
    send_to_client: mpsc::UnboundedSender<QueueEvent>,
}

impl Coordinator {
    fn emit(&self, event: QueueEvent) {
        if self.send_to_client.send(event).is_err() {
            trace!("No client listening for queue events");
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Upload(uploads) => self.upload(uploads),
            Command::Delete(id) => self.delete(id),
            Command::UpdateSettings(settings) => self.update_settings(settings),
            Command::Items(reply) => {
                let _ = reply.send(self.registry.views());
            }
            Command::CurrentSettings(reply) => {
                let _ = reply.send(self.settings.current());
            }
            Command::DoneEntries(reply) => {
                let _ = reply.send(self.done_entries());
            }
            Command::Source(id, reply) => {
                let source = self.registry.get(id).map(|item| {
                    SourceFile::new(item.name.clone(), item.mime.clone(), item.source.clone())
                });
                let _ = reply.send(source);
            }
        }
    }

    fn upload(&mut self, uploads: Vec<Upload>) {
        let settings = self.settings.current();
        let mut jobs = Vec::with_capacity(uploads.len());
        for Upload { id, file } in uploads {
            debug!(message = "Queued upload", item_id = %id, name = %file.name, size = file.bytes.len());
            jobs.push(self.registry.insert(id, file, settings));
            self.emit(QueueEvent::Queued(id));
        }
        self.queue.enqueue(jobs);
        self.pump();
    }

    fn delete(&mut self, id: Uuid) {
        let was_pending = self.queue.remove_by_id(id);
        if self.registry.remove(id).is_none() {
            debug!(message = "Delete of unknown item", item_id = %id);
            return;
        }
        let in_flight = self.in_flight.as_ref().is_some_and(|f| f.item_id == id);
        debug!(message = "Removed item", item_id = %id, was_pending, in_flight);
        self.emit(QueueEvent::Removed(id));
        self.pump();
    }

    fn update_settings(&mut self, settings: Settings) {
        if !self.settings.update(settings) {
            debug!(message = "Settings unchanged", settings = ?settings);
            return;
        }
        let dropped = self.queue.clear();
        let jobs = self.registry.requeue_active(settings);
        info!(
            message = "Settings changed, resubmitting",
            version = self.settings.version(),
            settings = ?settings,
            dropped,
            resubmitted = jobs.len()
        );

        self.emit(QueueEvent::SettingsChanged(settings));
        for job in &jobs {
            self.emit(QueueEvent::Queued(job.id));
        }
        self.queue.enqueue(jobs);
        self.pump();
    }

    /// Dispatches the next live job unless one is already with the worker.
    fn pump(&mut self) {
        while self.in_flight.is_none() {
            let Some(job) = self.queue.pop() else {
                break;
            };
            if let Err(err) = self.registry.begin(&job) {
                debug!(message = "Skipping job", item_id = %job.id, reason = %err);
                continue;
            }
            self.dispatch(job);
        }

        if self.busy && self.in_flight.is_none() && self.queue.is_empty() {
            self.busy = false;
            debug!("Queue drained");
            self.emit(QueueEvent::Idle);
        }
    }

    fn dispatch(&mut self, job: Job) {
        let Job {
            id,
            source,
            mime,
            settings,
            generation,
        } = job;
        let request_id = Uuid::new_v4();
        debug!(message = "Dispatching job", item_id = %id, request_id = %request_id, generation);
        self.emit(QueueEvent::Processing(id));

        let reply = self.worker.dispatch(
            request_id,
            id,
            TransformRequest {
                source,
                mime,
                settings,
                resize_width: None,
            },
        );
        self.busy = true;
        self.in_flight = Some(InFlight {
            item_id: id,
            generation,
            settings,
            reply,
            deadline: self
                .transform_timeout
                .map(|timeout| (Instant::now() + timeout, timeout)),
        });
    }

    fn apply_reply(&mut self, result: Result<TransformOutput, TransformError>) {
        let Some(InFlight {
            item_id,
            generation,
            settings,
            reply,
            ..
        }) = self.in_flight.take()
        else {
            return;
        };
        let request_id = reply.request_id();

        let applied = match result {
            Ok(output) => self
                .registry
                .complete(item_id, generation, settings, output)
                .map(|outcome| (outcome, None)),
            Err(err) => {
                let message = err.to_string();
                self.registry
                    .fail(item_id, generation, message.clone())
                    .map(|outcome| (outcome, Some(message)))
            }
        };

        match applied {
            Ok((ReplyOutcome::Done, _)) => {
                debug!(message = "Completed job", item_id = %item_id, request_id = %request_id);
                self.emit(QueueEvent::Done(item_id));
            }
            Ok((ReplyOutcome::Failed, message)) => {
                let message = message.unwrap_or_default();
                debug!(message = "Failed job", item_id = %item_id, request_id = %request_id, error = %message);
                self.emit(QueueEvent::Failed(item_id, message));
            }
            Ok((ReplyOutcome::Superseded, _)) => {
                debug!(message = "Reply superseded by newer settings", item_id = %item_id, request_id = %request_id);
            }
            Err(TransitionError::NotFound(_)) => {
                debug!(message = "Discarding reply for removed item", item_id = %item_id, request_id = %request_id);
            }
            Err(err) => {
                warn!(message = "Discarding reply", item_id = %item_id, request_id = %request_id, reason = %err);
            }
        }
    }

    fn done_entries(&self) -> Vec<ArchiveEntry> {
        self.registry
            .ordered()
            .into_iter()
            .filter(|item| item.status == Status::Done)
            .filter_map(|item| {
                item.result.as_ref().map(|result| ArchiveEntry {
                    file_name: optimized_file_name(
                        &item.name,
                        &self.output_suffix,
                        result.settings.format,
                    ),
                    bytes: result.bytes.clone(),
                })
            })
            .collect()
    }
}

/// Resolves with the reply for the in-flight job, or never if nothing is
/// in flight.
async fn next_reply(in_flight: &mut Option<InFlight>) -> Result<TransformOutput, TransformError> {
    let Some(in_flight) = in_flight else {
        return std::future::pending().await;
    };
    match in_flight.deadline {
        Some((deadline, timeout)) => tokio::time::timeout_at(deadline, in_flight.reply.wait())
            .await
            .unwrap_or(Err(TransformError::TimedOut(timeout))),
        None => in_flight.reply.wait().await,
    }
}

pub async fn serve(
    cancel_token: CancellationToken,
    config: QueueConfig,
    codec: Arc<dyn Codec>,
    mut recv_from_client: mpsc::UnboundedReceiver<Command>,
    send_to_client: mpsc::UnboundedSender<QueueEvent>,
) -> Result<(), Error> {
    let worker_token = cancel_token.child_token();
    let (worker, worker_join) = WorkerHandle::spawn(worker_token.clone(), codec);

    let mut coordinator = Coordinator {
        registry: Registry::new(),
        queue: JobQueue::new(),
        settings: SettingsStore::new(config.initial_settings),
        worker,
        in_flight: None,
        busy: false,
        transform_timeout: config.transform_timeout,
        output_suffix: config.output_suffix,
        send_to_client,
    };

    loop {
        tokio::select! {
            biased;
            // Handle cancellation
            _ = cancel_token.cancelled() => {
                debug!("Coordinator Cancelled");
                break;
            },
            // Client requests go first so deletions and settings changes
            // land before the next dispatch.
            chan_msg = recv_from_client.recv() => {
                match chan_msg {
                    None => {
                        debug!("Client channel closed, exiting");
                        break;
                    },
                    Some(command) => coordinator.handle(command),
                }
            },
            // Handle the reply for the job in flight
            result = next_reply(&mut coordinator.in_flight) => {
                coordinator.apply_reply(result);
                coordinator.pump();
            },
        }
    }

    worker_token.cancel();
    worker_join.await?;

    info!("Coordinator stopped.");

    Ok(())
}
