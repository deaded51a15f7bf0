use crate::codec::{Codec, TransformOutput, TransformRequest};
use crate::TransformError;
use async_channel::Receiver;
use std::{fmt::Debug, sync::Arc, time::Instant};
use tokio::{sync::oneshot, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::*;
use uuid::Uuid;

/// One transform round-trip. The executor owns `transform` (and its source
/// buffer) until it answers on `reply`.
pub struct WorkRequest {
    pub request_id: Uuid,
    pub item_id: Uuid,
    pub transform: TransformRequest,
    reply: oneshot::Sender<WorkReply>,
}

impl Debug for WorkRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkRequest")
            .field("request_id", &self.request_id)
            .field("item_id", &self.item_id)
            .field("mime", &self.transform.mime)
            .field("settings", &self.transform.settings)
            .finish()
    }
}

#[derive(Debug)]
pub struct WorkReply {
    pub request_id: Uuid,
    pub result: Result<TransformOutput, TransformError>,
}

/// Sending side of the executor channel. It does not limit how many requests
/// are outstanding; the coordinator only ever dispatches one at a time.
#[derive(Clone, Debug)]
pub struct WorkerHandle {
    send_to_worker: async_channel::Sender<WorkRequest>,
}

impl WorkerHandle {
    pub fn spawn(cancel_token: CancellationToken, codec: Arc<dyn Codec>) -> (Self, JoinHandle<()>) {
        let (send_to_worker, recv_from_coordinator) = async_channel::unbounded::<WorkRequest>();
        let join_handle = tokio::spawn(
            async move {
                start(cancel_token, recv_from_coordinator, codec).await;
            }
            .instrument(info_span!("worker")),
        );

        (Self { send_to_worker }, join_handle)
    }

    /// Hands a request to the executor without waiting for it.
    ///
    /// If the executor is gone the request is dropped together with its reply
    /// sender, so the returned [`PendingReply`] resolves to
    /// [`TransformError::WorkerTerminated`].
    pub fn dispatch(
        &self,
        request_id: Uuid,
        item_id: Uuid,
        transform: TransformRequest,
    ) -> PendingReply {
        let (reply, recv_reply) = oneshot::channel();
        let request = WorkRequest {
            request_id,
            item_id,
            transform,
            reply,
        };
        if let Err(err) = self.send_to_worker.try_send(request) {
            debug!(message = "Worker unavailable", request = ?err.into_inner());
        }

        PendingReply {
            request_id,
            recv_reply,
        }
    }

    pub async fn submit(
        &self,
        item_id: Uuid,
        transform: TransformRequest,
    ) -> Result<TransformOutput, TransformError> {
        self.dispatch(Uuid::new_v4(), item_id, transform)
            .wait()
            .await
    }
}

/// Single-slot reply for one dispatched request.
#[derive(Debug)]
pub struct PendingReply {
    request_id: Uuid,
    recv_reply: oneshot::Receiver<WorkReply>,
}

impl PendingReply {
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Cancel safe; must not be polled again once it has returned.
    pub async fn wait(&mut self) -> Result<TransformOutput, TransformError> {
        match (&mut self.recv_reply).await {
            Ok(reply) => {
                debug_assert_eq!(reply.request_id, self.request_id);
                reply.result
            }
            Err(_) => Err(TransformError::WorkerTerminated),
        }
    }
}

pub async fn start(
    cancel_token: CancellationToken,
    recv_from_coordinator: Receiver<WorkRequest>,
    codec: Arc<dyn Codec>,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                debug!("Worker Cancelled");
                break;
            },
            request = recv_from_coordinator.recv() => {
                match request {
                    Err(_) => {
                        debug!("Coordinator channel closed, exiting");
                        break;
                    },
                    Ok(WorkRequest { request_id, item_id, transform, mut reply }) => {
                        // A dropped receiver means the coordinator gave up on
                        // this request (timeout); the blocking transform is
                        // left to finish on its own and its output is lost.
                        let result = tokio::select! {
                            biased;
                            _ = cancel_token.cancelled() => Err(TransformError::WorkerTerminated),
                            _ = reply.closed() => {
                                warn!(message = "Request abandoned by coordinator", request_id = %request_id, item_id = %item_id);
                                continue;
                            },
                            result = process(codec.clone(), request_id, item_id, transform) => result,
                        };
                        if reply.send(WorkReply { request_id, result }).is_err() {
                            debug!(message = "Reply receiver dropped, discarding result", request_id = %request_id);
                        }
                    }
                }
            }
        }
    }

    // Anything still waiting in the inbox will never run.
    recv_from_coordinator.close();
    while let Ok(request) = recv_from_coordinator.try_recv() {
        let _ = request.reply.send(WorkReply {
            request_id: request.request_id,
            result: Err(TransformError::WorkerTerminated),
        });
    }
    info!("Worker stopped.");
}

#[instrument(skip(codec, transform), fields(request_id = %request_id, item_id = %item_id))]
async fn process(
    codec: Arc<dyn Codec>,
    request_id: Uuid,
    item_id: Uuid,
    transform: TransformRequest,
) -> Result<TransformOutput, TransformError> {
    let started = Instant::now();
    let result = match tokio::task::spawn_blocking(move || codec.transform(&transform)).await {
        Ok(result) => result,
        Err(err) => {
            error!(message = "Transform task aborted", error = ?err);
            Err(TransformError::WorkerTerminated)
        }
    };

    match &result {
        Ok(output) => debug!(
            message = "Transform finished",
            elapsed_ms = started.elapsed().as_millis() as u64,
            size = output.bytes.len()
        ),
        Err(err) => debug!(message = "Transform failed", error = %err),
    }
    result
}
