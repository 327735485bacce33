//! Core data model: served models and batches of inference work

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Identity and serving parameters of one model.
///
/// Equality and hashing are by `(name, address)`; the remaining fields are
/// serving hints. Immutable after creation, shared as `Arc<ModelSpec>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    /// Provisioning address the backend starts compute units from.
    pub address: String,
    /// Stateless models accept any instance; stateful ones require session
    /// affinity.
    pub stateless: bool,
    #[serde(default = "default_batch_size")]
    pub default_batch_size: usize,
    /// Whether instances of this model must be placed on a GPU host.
    #[serde(default)]
    pub gpu_affinity: bool,
}

impl ModelSpec {
    pub fn new(name: impl Into<String>, address: impl Into<String>, stateless: bool) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            address: address.into(),
            stateless,
            default_batch_size: default_batch_size(),
            gpu_affinity: false,
        })
    }
}

impl PartialEq for ModelSpec {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.address == other.address
    }
}

impl Eq for ModelSpec {}

impl Hash for ModelSpec {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.address.hash(state);
    }
}

fn default_batch_size() -> usize {
    32
}

/// Lifecycle status of a batch.
///
/// `Error` marks a retriable failure on its way back into the queue;
/// `Failed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Creating,
    Created,
    InQueue,
    SentToModel,
    Processed,
    Done,
    Error,
    Failed,
}

/// One item inside a batch. The payload is opaque to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItem {
    pub request_id: String,
    pub payload: Vec<u8>,
}

/// A unit of work: an ordered group of items routed and processed together.
///
/// A batch has exactly one owner at a time (the upstream batcher, the work
/// queue, or one instance), and moves between owners by value over queue and
/// channel boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: u64,
    pub items: Vec<BatchItem>,
    pub model: Arc<ModelSpec>,
    /// Set iff the model is stateful.
    pub session_id: Option<String>,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub retries: u32,
    pub error: Option<String>,
}

impl Batch {
    pub fn new(
        id: u64,
        items: Vec<BatchItem>,
        model: Arc<ModelSpec>,
        session_id: Option<String>,
    ) -> Self {
        // Session ids are meaningless for stateless models.
        let session_id = if model.stateless { None } else { session_id };
        Self {
            id,
            items,
            model,
            session_id,
            status: BatchStatus::Created,
            created_at: Utc::now(),
            queued_at: None,
            started_at: None,
            processed_at: None,
            retries: 0,
            error: None,
        }
    }

    /// Number of items in the batch.
    pub fn size(&self) -> usize {
        self.items.len()
    }

    /// Transition to `status`, stamping the matching timestamp.
    pub fn set_status(&mut self, status: BatchStatus) {
        match status {
            BatchStatus::InQueue => self.queued_at = Some(Utc::now()),
            BatchStatus::SentToModel => self.started_at = Some(Utc::now()),
            BatchStatus::Processed => self.processed_at = Some(Utc::now()),
            _ => {}
        }
        self.status = status;
    }

    /// Time spent processing, once both endpoints are stamped.
    pub fn processing_latency(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.processed_at) {
            (Some(started), Some(processed)) => Some(processed - started),
            _ => None,
        }
    }

    /// Attach a failure reason. The output queue reclassifies errored
    /// batches to `Failed` on completion.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.error = Some(reason.into());
    }
}
