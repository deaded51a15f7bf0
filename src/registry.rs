//! Item registry and the per-item status machine.
//!
//! ```text
//! Queued ──begin──▶ Processing ──complete──▶ Done
//!   ▲                    │    └────fail────▶ Error
//!   └──── requeue ───────┴──────── Done
//! ```
//!
//! `Error` is sticky: only deleting the item gets rid of it. Removal is
//! possible from every state.

use std::collections::HashMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::codec::TransformOutput;
use crate::{Job, OutputFormat, Settings, SourceFile, Status};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("Item {0} does not exist")]
    NotFound(Uuid),

    #[error("Item {id} cannot start processing while {status:?}")]
    NotQueued { id: Uuid, status: Status },

    #[error("Item {id} cannot accept a reply while {status:?}")]
    NotProcessing { id: Uuid, status: Status },

    #[error("Job generation {job} for item {id} is superseded by generation {current}")]
    Superseded { id: Uuid, job: u64, current: u64 },
}

/// What applying a worker reply did to the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    Done,
    Failed,
    /// The item was re-queued while the request was in flight. A successful
    /// result is kept as the visible output but the status stays `Queued`.
    Superseded,
}

#[derive(Debug, Clone)]
pub struct ItemResult {
    pub bytes: Bytes,
    pub settings: Settings,
}

#[derive(Debug, Clone)]
pub struct Item {
    pub id: Uuid,
    pub name: String,
    pub mime: String,
    /// The original upload. Every submission decodes from these bytes.
    pub source: Bytes,
    pub width: u32,
    pub height: u32,
    /// Settings of the latest submission.
    pub target: Settings,
    pub result: Option<ItemResult>,
    pub status: Status,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    generation: u64,
    seq: u64,
}

impl Item {
    pub fn original_size(&self) -> u64 {
        self.source.len() as u64
    }

    fn job(&self) -> Job {
        Job {
            id: self.id,
            source: self.source.clone(),
            mime: self.mime.clone(),
            settings: self.target,
            generation: self.generation,
        }
    }

    pub fn view(&self) -> ItemView {
        ItemView {
            id: self.id,
            name: self.name.clone(),
            mime: self.mime.clone(),
            original_size: self.original_size(),
            width: self.width,
            height: self.height,
            status: self.status,
            error: self.error.clone(),
            has_result: self.result.is_some(),
            result_size: self.result.as_ref().map(|r| r.bytes.len() as u64),
            result_format: self.result.as_ref().map(|r| r.settings.format),
            result_quality: self.result.as_ref().map(|r| r.settings.quality),
            target_format: self.target.format,
            target_quality: self.target.quality,
            quality_applies: self.target.format.honors_quality(),
            created_at: self.created_at,
        }
    }
}

/// Read-only snapshot of an item for rendering.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemView {
    pub id: Uuid,
    pub name: String,
    pub mime: String,
    pub original_size: u64,
    pub width: u32,
    pub height: u32,
    pub status: Status,
    pub error: Option<String>,
    pub has_result: bool,
    pub result_size: Option<u64>,
    pub result_format: Option<OutputFormat>,
    pub result_quality: Option<u8>,
    pub target_format: OutputFormat,
    pub target_quality: u8,
    /// False when the target encoder ignores `target_quality`.
    pub quality_applies: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct Registry {
    items: HashMap<Uuid, Item>,
    next_seq: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a freshly uploaded file as `Queued` and returns its first job.
    pub fn insert(&mut self, id: Uuid, file: SourceFile, settings: Settings) -> Job {
        let seq = self.next_seq;
        self.next_seq += 1;

        let item = Item {
            id,
            name: file.name,
            mime: file.mime,
            source: file.bytes,
            width: 0,
            height: 0,
            target: settings,
            result: None,
            status: Status::Queued,
            error: None,
            created_at: Utc::now(),
            generation: 1,
            seq,
        };
        let job = item.job();
        self.items.insert(id, item);
        job
    }

    pub fn remove(&mut self, id: Uuid) -> Option<Item> {
        self.items.remove(&id)
    }

    pub fn get(&self, id: Uuid) -> Option<&Item> {
        self.items.get(&id)
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.items.contains_key(&id)
    }

    /// `Queued → Processing`, only for the item's latest job.
    pub fn begin(&mut self, job: &Job) -> Result<(), TransitionError> {
        let item = self
            .items
            .get_mut(&job.id)
            .ok_or(TransitionError::NotFound(job.id))?;

        if job.generation != item.generation {
            return Err(TransitionError::Superseded {
                id: job.id,
                job: job.generation,
                current: item.generation,
            });
        }
        if item.status != Status::Queued {
            return Err(TransitionError::NotQueued {
                id: job.id,
                status: item.status,
            });
        }

        item.status = Status::Processing;
        item.target = job.settings;
        Ok(())
    }

    pub fn complete(
        &mut self,
        id: Uuid,
        generation: u64,
        settings: Settings,
        output: TransformOutput,
    ) -> Result<ReplyOutcome, TransitionError> {
        let item = self.items.get_mut(&id).ok_or(TransitionError::NotFound(id))?;

        let superseded = item.generation > generation;
        if !superseded && item.status != Status::Processing {
            return Err(TransitionError::NotProcessing {
                id,
                status: item.status,
            });
        }

        item.width = output.width;
        item.height = output.height;
        item.result = Some(ItemResult {
            bytes: output.bytes,
            settings,
        });

        if superseded {
            return Ok(ReplyOutcome::Superseded);
        }
        item.status = Status::Done;
        item.error = None;
        Ok(ReplyOutcome::Done)
    }

    pub fn fail(
        &mut self,
        id: Uuid,
        generation: u64,
        message: String,
    ) -> Result<ReplyOutcome, TransitionError> {
        let item = self.items.get_mut(&id).ok_or(TransitionError::NotFound(id))?;

        if item.generation > generation {
            return Ok(ReplyOutcome::Superseded);
        }
        if item.status != Status::Processing {
            return Err(TransitionError::NotProcessing {
                id,
                status: item.status,
            });
        }

        item.status = Status::Error;
        item.error = Some(message);
        Ok(ReplyOutcome::Failed)
    }

    /// Resets every `Queued`, `Processing` and `Done` item to `Queued` under
    /// `settings` and returns their new jobs in upload order. `Error` items
    /// are left alone. Previous results stay visible until replaced.
    pub fn requeue_active(&mut self, settings: Settings) -> Vec<Job> {
        let mut active: Vec<&mut Item> = self
            .items
            .values_mut()
            .filter(|item| item.status != Status::Error)
            .collect();
        active.sort_by_key(|item| item.seq);

        active
            .into_iter()
            .map(|item| {
                item.status = Status::Queued;
                item.target = settings;
                item.generation += 1;
                item.job()
            })
            .collect()
    }

    /// Items in upload order.
    pub fn ordered(&self) -> Vec<&Item> {
        let mut items: Vec<&Item> = self.items.values().collect();
        items.sort_by_key(|item| item.seq);
        items
    }

    pub fn views(&self) -> Vec<ItemView> {
        self.ordered().into_iter().map(Item::view).collect()
    }

    pub fn done_count(&self) -> usize {
        self.items
            .values()
            .filter(|item| item.status == Status::Done)
            .count()
    }
}
