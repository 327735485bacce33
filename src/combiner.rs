//! Result fan-in: merges per-instance response streams into the output queue

use crate::instance::Instance;
use crate::model::{Batch, BatchStatus};
use crate::queue::WorkQueue;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::{StreamExt, StreamMap, wrappers::ReceiverStream};

enum CombinerCommand {
    Attach {
        instance: Arc<Instance>,
        receiver: mpsc::Receiver<Batch>,
    },
    Detach {
        name: String,
        ack: oneshot::Sender<()>,
    },
}

/// Cheap-to-clone handle used by the registry to attach and detach
/// instances from the fan-in.
#[derive(Clone)]
pub struct CombinerHandle {
    commands: mpsc::Sender<CombinerCommand>,
}

impl CombinerHandle {
    pub async fn attach(
        &self,
        instance: Arc<Instance>,
        receiver: mpsc::Receiver<Batch>,
    ) -> Result<()> {
        self.commands
            .send(CombinerCommand::Attach { instance, receiver })
            .await
            .context("Result combiner is gone")
    }

    /// Detach an instance and wait until the combiner has dropped its
    /// stream. Completes immediately if the combiner already shut down.
    pub async fn detach(&self, name: &str) -> Result<()> {
        let (ack, done) = oneshot::channel();
        if self
            .commands
            .send(CombinerCommand::Detach {
                name: name.to_string(),
                ack,
            })
            .await
            .is_err()
        {
            return Ok(());
        }
        let _ = done.await;
        Ok(())
    }
}

/// Merges the response streams of all live instances into a single ordered
/// delivery to the output queue.
///
/// One outstanding receive per instance; instances come and go through the
/// command channel without blocking or losing in-flight completions for
/// the others.
pub struct ResultCombiner {
    queue: Arc<WorkQueue>,
    commands: mpsc::Receiver<CombinerCommand>,
    streams: StreamMap<String, ReceiverStream<Batch>>,
    instances: HashMap<String, Arc<Instance>>,
}

impl ResultCombiner {
    pub fn new(queue: Arc<WorkQueue>) -> (Self, CombinerHandle) {
        let (tx, rx) = mpsc::channel(64);
        (
            Self {
                queue,
                commands: rx,
                streams: StreamMap::new(),
                instances: HashMap::new(),
            },
            CombinerHandle { commands: tx },
        )
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(CombinerCommand::Attach { instance, receiver }) => {
                            tracing::debug!(instance = %instance.name, "Fan-in attached");
                            self.streams
                                .insert(instance.name.clone(), ReceiverStream::new(receiver));
                            self.instances.insert(instance.name.clone(), instance);
                        }
                        Some(CombinerCommand::Detach { name, ack }) => {
                            // Dropping the stream closes the channel.
                            self.streams.remove(&name);
                            self.instances.remove(&name);
                            tracing::debug!(instance = %name, "Fan-in detached");
                            let _ = ack.send(());
                        }
                        None => break,
                    }
                }
                Some((name, batch)) = self.streams.next(), if !self.streams.is_empty() => {
                    self.route(name, batch).await;
                }
            }
        }
        tracing::debug!("Result combiner stopped");
    }

    async fn route(&mut self, source: String, mut batch: Batch) {
        if let Some(instance) = self.instances.get(&source) {
            instance.mark_received().await;
            instance.take_in_flight().await;
            instance.unlock();
        }
        batch.set_status(BatchStatus::Processed);
        self.queue.complete(batch).await;
    }
}
