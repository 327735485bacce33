//! Scheduler wiring: the cooperative loops sharing the queue and registry

use crate::analyzer::LoadAnalyzer;
use crate::combiner::ResultCombiner;
use crate::config::SchedulerConfig;
use crate::health::{AlertManager, CooldownTracker, HealthMonitor};
use crate::instance::ProvisioningBackend;
use crate::model::{Batch, BatchStatus};
use crate::queue::WorkQueue;
use crate::registry::InstanceRegistry;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::interval;

/// The scheduler core.
///
/// Owns the work queue and instance registry (the only shared mutable
/// state) and runs six cooperative loops over them: receive, dispatch,
/// load-analyzer tick, health tick, result fan-in, and send. All state is
/// in-memory and rebuilt from scratch on restart.
pub struct Scheduler {
    config: SchedulerConfig,
    queue: Arc<WorkQueue>,
    registry: Arc<InstanceRegistry>,
    backend: Arc<dyn ProvisioningBackend>,
    alerts: Arc<AlertManager>,
    cooldowns: Arc<CooldownTracker>,
    combiner: ResultCombiner,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, backend: Arc<dyn ProvisioningBackend>) -> Result<Self> {
        config.validate()?;

        let queue = Arc::new(WorkQueue::new());
        let (combiner, combiner_handle) = ResultCombiner::new(queue.clone());
        let registry = Arc::new(InstanceRegistry::new(combiner_handle));
        let alerts = Arc::new(AlertManager::new(queue.clone(), config.max_batch_retries));
        let cooldowns = Arc::new(CooldownTracker::new(Duration::from_secs(
            config.cooldown_secs,
        )));

        Ok(Self {
            config,
            queue,
            registry,
            backend,
            alerts,
            cooldowns,
            combiner,
        })
    }

    pub fn queue(&self) -> Arc<WorkQueue> {
        self.queue.clone()
    }

    pub fn registry(&self) -> Arc<InstanceRegistry> {
        self.registry.clone()
    }

    /// Run until the shutdown channel flips (or its sender is dropped).
    ///
    /// Batches arrive already deserialized on `inbound`; completed and
    /// failed batches leave on `outbound`.
    pub async fn run(
        self,
        inbound: mpsc::Receiver<Batch>,
        outbound: mpsc::Sender<Batch>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut tasks: JoinSet<()> = JoinSet::new();

        tasks.spawn(self.combiner.run());

        let queue = self.queue.clone();
        tasks.spawn(receive_loop(inbound, queue));

        let queue = self.queue.clone();
        let registry = self.registry.clone();
        let dispatch_tick = Duration::from_millis(self.config.dispatch_interval_ms);
        tasks.spawn(async move {
            let mut ticker = interval(dispatch_tick);
            loop {
                ticker.tick().await;
                dispatch_cycle(&queue, &registry).await;
            }
        });

        let analyzer = LoadAnalyzer::new(
            &self.config,
            self.queue.clone(),
            self.registry.clone(),
            self.backend.clone(),
            self.alerts.clone(),
            self.cooldowns.clone(),
        );
        tasks.spawn(analyzer.run());

        let monitor = Arc::new(HealthMonitor::new(
            self.registry.clone(),
            self.backend.clone(),
            self.alerts.clone(),
            self.cooldowns.clone(),
            self.config.health_check_interval_secs,
            self.config.health_check_initial_delay_secs,
            self.config.connection_idle_timeout_secs,
        ));
        tasks.spawn(monitor.run());

        tasks.spawn(send_loop(self.queue.clone(), outbound));

        tracing::info!(
            analyzer_interval_ms = self.config.analyzer_interval_ms,
            dispatch_interval_ms = self.config.dispatch_interval_ms,
            max_instances = self.backend.max_running_instances(),
            "Scheduler started"
        );

        let _ = shutdown.changed().await;
        tracing::info!("Scheduler shutting down");
        tasks.shutdown().await;

        Ok(())
    }
}

/// Deserialized batches land on the work queue.
async fn receive_loop(mut inbound: mpsc::Receiver<Batch>, queue: Arc<WorkQueue>) {
    while let Some(batch) = inbound.recv().await {
        queue.enqueue(batch).await;
    }
    tracing::debug!("Inbound channel closed, receive loop stopped");
}

/// One dispatch pass over every known partition. Returns the number of
/// batches handed to instances.
///
/// Reserve-then-dequeue: the instance is locked before the non-blocking
/// dequeue so a drained partition just releases the reservation. Stateful
/// partitions without a bound instance are skipped until a checker binds
/// one.
pub async fn dispatch_cycle(queue: &Arc<WorkQueue>, registry: &Arc<InstanceRegistry>) -> usize {
    let mut dispatched = 0;

    for key in queue.partitions().await {
        let session = key.session.as_deref();
        let Some(instance) = registry.get_for_dispatch(&key.model, session).await else {
            continue;
        };
        if !instance.try_lock() {
            continue;
        }

        match queue.dequeue_nonblocking(&key.model, session).await {
            Ok(batch) => {
                if let Err(e) = instance.dispatch(batch).await {
                    tracing::warn!(
                        instance = %instance.name,
                        error = %e,
                        "Dispatch failed, requeueing batch"
                    );
                    instance.unlock();
                    if let Some(mut batch) = instance.take_in_flight().await {
                        batch.set_status(BatchStatus::Error);
                        queue.enqueue(batch).await;
                    }
                } else {
                    dispatched += 1;
                }
            }
            // Partition drained between enumeration and dequeue.
            Err(_) => instance.unlock(),
        }
    }

    dispatched
}

/// Drain the output queue to the downstream transport.
async fn send_loop(queue: Arc<WorkQueue>, outbound: mpsc::Sender<Batch>) {
    loop {
        let batch = queue.next_completed().await;
        if outbound.send(batch).await.is_err() {
            tracing::debug!("Outbound channel closed, send loop stopped");
            break;
        }
    }
}
