//! Serving-instance handles and the provisioning backend interface

use crate::error::HealthError;
use crate::model::{Batch, BatchStatus, ModelSpec};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock, mpsc};

/// A live handle to one running copy of a model.
///
/// Identity is the provisioning-assigned name. The `lock` flag means
/// "currently processing a batch" and has a single writer at a time: set by
/// dispatch (or decrease-selection), cleared by the result combiner or the
/// retriable-error path.
pub struct Instance {
    pub name: String,
    pub model: Arc<ModelSpec>,
    /// Bound session id; `None` until a stateful session claims the
    /// instance. Binding is one-way and sticky.
    session: RwLock<Option<String>>,
    locked: AtomicBool,
    running: AtomicBool,
    /// Copy of the batch currently in flight, kept for requeue on failure.
    in_flight: Mutex<Option<Batch>>,
    sender: mpsc::Sender<Batch>,
    /// Response stream, taken exactly once by the result combiner.
    receiver: Mutex<Option<mpsc::Receiver<Batch>>>,
    last_sent: RwLock<Instant>,
    last_received: RwLock<Instant>,
}

impl Instance {
    pub fn new(
        name: impl Into<String>,
        model: Arc<ModelSpec>,
        sender: mpsc::Sender<Batch>,
        receiver: mpsc::Receiver<Batch>,
    ) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            name: name.into(),
            model,
            session: RwLock::new(None),
            locked: AtomicBool::new(false),
            running: AtomicBool::new(true),
            in_flight: Mutex::new(None),
            sender,
            receiver: Mutex::new(Some(receiver)),
            last_sent: RwLock::new(now),
            last_received: RwLock::new(now),
        })
    }

    /// Reserve the instance for one batch. Returns false if already held.
    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub async fn session(&self) -> Option<String> {
        self.session.read().await.clone()
    }

    /// Bind a session to this instance. One-way: fails if already bound.
    pub async fn bind_session(&self, session: &str) -> bool {
        let mut bound = self.session.write().await;
        if bound.is_some() {
            return false;
        }
        *bound = Some(session.to_string());
        tracing::debug!(
            instance = %self.name,
            model = %self.model.name,
            session,
            "Session bound to instance"
        );
        true
    }

    /// Send a batch to the compute unit. The caller must hold the lock.
    ///
    /// A copy stays in `in_flight` so failure handling can requeue or fail
    /// the batch without cooperation from the unit.
    pub async fn dispatch(&self, mut batch: Batch) -> Result<()> {
        batch.set_status(BatchStatus::SentToModel);
        *self.in_flight.lock().await = Some(batch.clone());
        *self.last_sent.write().await = Instant::now();

        self.sender
            .send(batch)
            .await
            .with_context(|| format!("Compute unit channel closed for instance '{}'", self.name))
    }

    /// Take the in-flight copy, if any.
    pub async fn take_in_flight(&self) -> Option<Batch> {
        self.in_flight.lock().await.take()
    }

    pub async fn mark_received(&self) {
        *self.last_received.write().await = Instant::now();
    }

    pub async fn idle_since_sent(&self) -> Duration {
        self.last_sent.read().await.elapsed()
    }

    pub async fn idle_since_received(&self) -> Duration {
        self.last_received.read().await.elapsed()
    }

    /// Hand the response stream to the result combiner. Second call fails.
    pub async fn take_receiver(&self) -> Result<mpsc::Receiver<Batch>> {
        self.receiver
            .lock()
            .await
            .take()
            .with_context(|| format!("Receiver already taken for instance '{}'", self.name))
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("name", &self.name)
            .field("model", &self.model.name)
            .field("locked", &self.is_locked())
            .field("running", &self.is_running())
            .finish()
    }
}

impl PartialEq for Instance {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Instance {}

// ============================================================================
// Provisioning backend interface
// ============================================================================

/// Interface to the compute-provisioning backend.
///
/// Concrete container-engine and orchestrator backends live outside this
/// crate; the scheduler depends only on this trait.
#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    /// Whether the backend has capacity for one more instance of `model`.
    async fn can_create_instance(&self, model: &ModelSpec) -> bool;

    /// Start a compute unit and return its handle. May fail with a
    /// capacity or API error.
    async fn start_instance(&self, model: Arc<ModelSpec>) -> Result<Arc<Instance>>;

    /// Stop a compute unit. Idempotent against "already gone".
    async fn stop_instance(&self, instance: &Instance) -> Result<()>;

    /// Probe whether the underlying compute unit is still alive. An
    /// unhealthy outcome carries a classified reason.
    async fn is_instance_running(&self, instance: &Instance) -> (bool, Option<HealthError>);

    /// Hard ceiling on the total instance count across all models.
    fn max_running_instances(&self) -> usize;
}

// ============================================================================
// Mock implementation for testing
// ============================================================================
