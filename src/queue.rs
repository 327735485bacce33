//! Tagged work queues: partitioned input side, ordered output side

use crate::error::QueueError;
use crate::model::{Batch, BatchStatus, ModelSpec};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};

/// Key of one input partition: a model plus, for stateful models, the
/// session the work belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    pub model: Arc<ModelSpec>,
    pub session: Option<String>,
}

#[derive(Debug, Default)]
struct Partition {
    batches: VecDeque<Batch>,
    /// Sum of `size()` over the enqueued batches.
    pending_items: usize,
}

/// One observed batch completion, consumed by the throughput checkers.
#[derive(Debug, Clone)]
pub struct LatencySample {
    pub model: Arc<ModelSpec>,
    pub items: usize,
    pub latency: Duration,
}

/// Pending inference work partitioned by `(model, session)`, plus the
/// ordered queue of completed and failed batches on the way back out.
pub struct WorkQueue {
    input: RwLock<HashMap<PartitionKey, Partition>>,
    completed: Mutex<VecDeque<Batch>>,
    latency: Mutex<Vec<LatencySample>>,
    output_ready: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            input: RwLock::new(HashMap::new()),
            completed: Mutex::new(VecDeque::new()),
            latency: Mutex::new(Vec::new()),
            output_ready: Notify::new(),
        }
    }

    /// Append a batch to its partition, creating the partition on demand.
    ///
    /// A batch re-entering with status `Error` has its retry counter bumped
    /// before it is queued again.
    pub async fn enqueue(&self, mut batch: Batch) {
        if batch.status == BatchStatus::Error {
            batch.retries += 1;
        }
        batch.set_status(BatchStatus::InQueue);

        let key = PartitionKey {
            model: batch.model.clone(),
            // Stateless partitions are never split by session.
            session: if batch.model.stateless {
                None
            } else {
                batch.session_id.clone()
            },
        };

        let mut input = self.input.write().await;
        let partition = input.entry(key).or_default();
        partition.pending_items += batch.size();

        tracing::debug!(
            batch = batch.id,
            model = %batch.model.name,
            session = ?batch.session_id,
            retries = batch.retries,
            pending_items = partition.pending_items,
            "Batch enqueued"
        );
        crate::metrics::record_batch_enqueued(&batch.model.name);

        let model = batch.model.clone();
        partition.batches.push_back(batch);
        crate::metrics::update_queue_depth(&model.name, Self::model_depth(&input, &model));
    }

    /// Total pending items for a model across the (locked) partition map.
    fn model_depth(input: &HashMap<PartitionKey, Partition>, model: &Arc<ModelSpec>) -> usize {
        input
            .iter()
            .filter(|(key, _)| key.model == *model)
            .map(|(_, partition)| partition.pending_items)
            .sum()
    }

    /// Pop the oldest batch from the matching partition.
    ///
    /// Popping the last batch deletes the partition. A missing or empty
    /// partition yields `QueueError::EmptyPartition`.
    pub async fn dequeue_nonblocking(
        &self,
        model: &Arc<ModelSpec>,
        session: Option<&str>,
    ) -> Result<Batch, QueueError> {
        let key = PartitionKey {
            model: model.clone(),
            session: session.map(String::from),
        };

        let mut input = self.input.write().await;
        let Some(partition) = input.get_mut(&key) else {
            return Err(QueueError::EmptyPartition {
                model: model.name.clone(),
                session: session.map(String::from),
            });
        };

        let batch = partition.batches.pop_front().ok_or_else(|| {
            QueueError::EmptyPartition {
                model: model.name.clone(),
                session: session.map(String::from),
            }
        })?;
        partition.pending_items -= batch.size();

        if partition.batches.is_empty() {
            input.remove(&key);
        }
        crate::metrics::update_queue_depth(&model.name, Self::model_depth(&input, model));

        Ok(batch)
    }

    /// All partitions currently holding work.
    pub async fn partitions(&self) -> Vec<PartitionKey> {
        self.input.read().await.keys().cloned().collect()
    }

    /// Partitions holding work for one model.
    pub async fn partitions_for_model(&self, model: &Arc<ModelSpec>) -> Vec<PartitionKey> {
        self.input
            .read()
            .await
            .keys()
            .filter(|key| key.model == *model)
            .cloned()
            .collect()
    }

    /// All `(session, model)` pairs with pending stateful work.
    pub async fn session_partitions(&self) -> Vec<(String, Arc<ModelSpec>)> {
        self.input
            .read()
            .await
            .keys()
            .filter_map(|key| {
                key.session
                    .as_ref()
                    .map(|session| (session.clone(), key.model.clone()))
            })
            .collect()
    }

    /// Stateless models with at least one pending item.
    pub async fn stateless_models_with_pending(&self) -> Vec<Arc<ModelSpec>> {
        let input = self.input.read().await;
        let mut models: Vec<Arc<ModelSpec>> = Vec::new();
        for key in input.keys() {
            if key.model.stateless && !models.contains(&key.model) {
                models.push(key.model.clone());
            }
        }
        models
    }

    /// Total pending items across all of a model's partitions.
    pub async fn pending_items(&self, model: &Arc<ModelSpec>) -> usize {
        self.input
            .read()
            .await
            .iter()
            .filter(|(key, _)| key.model == *model)
            .map(|(_, partition)| partition.pending_items)
            .sum()
    }

    /// Pending items in one exact partition (0 if absent).
    pub async fn partition_pending(&self, model: &Arc<ModelSpec>, session: Option<&str>) -> usize {
        let key = PartitionKey {
            model: model.clone(),
            session: session.map(String::from),
        };
        self.input
            .read()
            .await
            .get(&key)
            .map(|partition| partition.pending_items)
            .unwrap_or(0)
    }

    /// Hand a finished batch to the output side.
    ///
    /// Computes the processing latency for the throughput checkers and
    /// reclassifies the batch to `Failed` if a failure reason is attached.
    pub async fn complete(&self, mut batch: Batch) {
        if let Some(latency) = batch.processing_latency()
            && let Ok(latency) = latency.to_std()
        {
            self.latency.lock().await.push(LatencySample {
                model: batch.model.clone(),
                items: batch.size(),
                latency,
            });
        }

        let failed = batch.error.is_some();
        batch.set_status(if failed {
            BatchStatus::Failed
        } else {
            BatchStatus::Done
        });

        tracing::debug!(
            batch = batch.id,
            model = %batch.model.name,
            failed,
            "Batch completed"
        );
        crate::metrics::record_batch_completed(&batch.model.name, failed);

        self.completed.lock().await.push_back(batch);
        self.output_ready.notify_one();
    }

    /// Drain the latency samples accumulated since the last call.
    pub async fn take_latency_samples(&self) -> Vec<LatencySample> {
        std::mem::take(&mut *self.latency.lock().await)
    }

    /// Non-blocking pop from the output queue.
    pub async fn pop_completed(&self) -> Option<Batch> {
        self.completed.lock().await.pop_front()
    }

    /// Await the next completed batch (send-loop entry point).
    pub async fn next_completed(&self) -> Batch {
        loop {
            if let Some(batch) = self.pop_completed().await {
                return batch;
            }
            self.output_ready.notified().await;
        }
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BatchItem;

    fn items(n: usize) -> Vec<BatchItem> {
        (0..n)
            .map(|i| BatchItem {
                request_id: format!("r{}", i),
                payload: Vec::new(),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_enqueue_dequeue_fifo() {
        let queue = WorkQueue::new();
        let model = ModelSpec::new("bert", "registry/bert:1", true);

        queue.enqueue(Batch::new(1, items(2), model.clone(), None)).await;
        queue.enqueue(Batch::new(2, items(3), model.clone(), None)).await;

        let first = queue.dequeue_nonblocking(&model, None).await.unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(first.status, BatchStatus::InQueue);

        let second = queue.dequeue_nonblocking(&model, None).await.unwrap();
        assert_eq!(second.id, 2);
    }

    #[tokio::test]
    async fn test_pending_items_accounting() {
        let queue = WorkQueue::new();
        let model = ModelSpec::new("bert", "registry/bert:1", true);

        queue.enqueue(Batch::new(1, items(2), model.clone(), None)).await;
        queue.enqueue(Batch::new(2, items(3), model.clone(), None)).await;
        assert_eq!(queue.pending_items(&model).await, 5);

        queue.dequeue_nonblocking(&model, None).await.unwrap();
        assert_eq!(queue.pending_items(&model).await, 3);

        queue.dequeue_nonblocking(&model, None).await.unwrap();
        assert_eq!(queue.pending_items(&model).await, 0);
    }

    #[tokio::test]
    async fn test_last_dequeue_deletes_partition() {
        let queue = WorkQueue::new();
        let model = ModelSpec::new("bert", "registry/bert:1", true);

        queue.enqueue(Batch::new(1, items(1), model.clone(), None)).await;
        assert_eq!(queue.partitions().await.len(), 1);

        queue.dequeue_nonblocking(&model, None).await.unwrap();
        assert!(queue.partitions().await.is_empty());
    }

    #[tokio::test]
    async fn test_dequeue_empty_partition_fails() {
        let queue = WorkQueue::new();
        let model = ModelSpec::new("bert", "registry/bert:1", true);

        let err = queue.dequeue_nonblocking(&model, None).await.unwrap_err();
        assert!(matches!(err, QueueError::EmptyPartition { .. }));
    }

    #[tokio::test]
    async fn test_stateful_sessions_partition_separately() {
        let queue = WorkQueue::new();
        let model = ModelSpec::new("chat", "registry/chat:1", false);

        queue
            .enqueue(Batch::new(1, items(1), model.clone(), Some("a".to_string())))
            .await;
        queue
            .enqueue(Batch::new(2, items(1), model.clone(), Some("b".to_string())))
            .await;

        assert_eq!(queue.partitions_for_model(&model).await.len(), 2);

        let pairs = queue.session_partitions().await;
        assert_eq!(pairs.len(), 2);

        // Dequeue from session "b" leaves "a" untouched.
        let batch = queue.dequeue_nonblocking(&model, Some("b")).await.unwrap();
        assert_eq!(batch.id, 2);
        assert_eq!(queue.partition_pending(&model, Some("a")).await, 1);
    }

    #[tokio::test]
    async fn test_error_reentry_bumps_retries() {
        let queue = WorkQueue::new();
        let model = ModelSpec::new("bert", "registry/bert:1", true);

        let mut batch = Batch::new(1, items(1), model.clone(), None);
        queue.enqueue(batch.clone()).await;
        batch = queue.dequeue_nonblocking(&model, None).await.unwrap();
        assert_eq!(batch.retries, 0);

        batch.set_status(BatchStatus::Error);
        queue.enqueue(batch).await;
        let batch = queue.dequeue_nonblocking(&model, None).await.unwrap();
        assert_eq!(batch.retries, 1);
        assert_eq!(batch.status, BatchStatus::InQueue);
    }

    #[tokio::test]
    async fn test_complete_records_latency_and_status() {
        let queue = WorkQueue::new();
        let model = ModelSpec::new("bert", "registry/bert:1", true);

        let mut batch = Batch::new(1, items(4), model.clone(), None);
        batch.set_status(BatchStatus::SentToModel);
        batch.set_status(BatchStatus::Processed);
        queue.complete(batch).await;

        let samples = queue.take_latency_samples().await;
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].items, 4);

        // Samples are drained on read.
        assert!(queue.take_latency_samples().await.is_empty());

        let done = queue.pop_completed().await.unwrap();
        assert_eq!(done.status, BatchStatus::Done);
    }

    #[tokio::test]
    async fn test_complete_with_error_reclassifies_failed() {
        let queue = WorkQueue::new();
        let model = ModelSpec::new("bert", "registry/bert:1", true);

        let mut batch = Batch::new(1, items(1), model, None);
        batch.fail("compute unit exited");
        queue.complete(batch).await;

        let failed = queue.pop_completed().await.unwrap();
        assert_eq!(failed.status, BatchStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("compute unit exited"));
    }

    #[tokio::test]
    async fn test_next_completed_wakes_on_push() {
        let queue = Arc::new(WorkQueue::new());
        let model = ModelSpec::new("bert", "registry/bert:1", true);

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next_completed().await })
        };

        queue.complete(Batch::new(9, items(1), model, None)).await;
        let batch = waiter.await.unwrap();
        assert_eq!(batch.id, 9);
    }
}
