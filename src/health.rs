//! Health checking and error recovery for serving instances

use crate::error::HealthError;
use crate::instance::{Instance, ProvisioningBackend};
use crate::model::{Batch, BatchStatus, ModelSpec};
use crate::queue::WorkQueue;
use crate::registry::InstanceRegistry;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{interval, sleep};

/// Outcome of one health probe for one instance.
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub instance: Arc<Instance>,
    pub is_running: bool,
    pub reason: Option<HealthError>,
}

impl HealthStatus {
    pub fn healthy(instance: Arc<Instance>) -> Self {
        Self {
            instance,
            is_running: true,
            reason: None,
        }
    }

    pub fn unhealthy(instance: Arc<Instance>, reason: HealthError) -> Self {
        Self {
            instance,
            is_running: false,
            reason: Some(reason),
        }
    }
}

/// One liveness probe, run against every live instance each tick.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    fn name(&self) -> &'static str;

    async fn check(&self, instance: &Arc<Instance>) -> HealthStatus;
}

/// Flags instances that went silent mid-batch.
///
/// An unlocked instance is trivially healthy; a locked one must have seen
/// either a send or a receive inside the idle window.
pub struct ConnectionLivenessChecker {
    idle_timeout: Duration,
}

impl ConnectionLivenessChecker {
    pub fn new(idle_timeout: Duration) -> Self {
        Self { idle_timeout }
    }
}

#[async_trait]
impl HealthChecker for ConnectionLivenessChecker {
    fn name(&self) -> &'static str {
        "connection-liveness"
    }

    async fn check(&self, instance: &Arc<Instance>) -> HealthStatus {
        if !instance.is_locked() {
            return HealthStatus::healthy(instance.clone());
        }

        let since_sent = instance.idle_since_sent().await;
        let since_received = instance.idle_since_received().await;
        if since_sent < self.idle_timeout || since_received < self.idle_timeout {
            HealthStatus::healthy(instance.clone())
        } else {
            HealthStatus::unhealthy(
                instance.clone(),
                HealthError::Fatal(format!(
                    "connection idle timeout: no traffic for {}s while processing",
                    since_received.as_secs()
                )),
            )
        }
    }
}

/// Asks the provisioning backend whether the compute unit is still alive.
pub struct ProvisioningLivenessChecker {
    backend: Arc<dyn ProvisioningBackend>,
}

impl ProvisioningLivenessChecker {
    pub fn new(backend: Arc<dyn ProvisioningBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl HealthChecker for ProvisioningLivenessChecker {
    fn name(&self) -> &'static str {
        "provisioning-liveness"
    }

    async fn check(&self, instance: &Arc<Instance>) -> HealthStatus {
        let (running, reason) = self.backend.is_instance_running(instance).await;
        if running {
            HealthStatus::healthy(instance.clone())
        } else {
            let reason = reason
                .unwrap_or_else(|| HealthError::Fatal("compute unit not running".to_string()));
            HealthStatus::unhealthy(instance.clone(), reason)
        }
    }
}

// ============================================================================
// Cool-down tracking
// ============================================================================

#[derive(Debug, Clone)]
struct CooldownState {
    last_failure: Instant,
    failures: u32,
}

/// Per-model fatal-failure bookkeeping.
///
/// A model inside its cool-down window is ineligible for fresh scale-ups.
pub struct CooldownTracker {
    window: Duration,
    state: DashMap<Arc<ModelSpec>, CooldownState>,
}

impl CooldownTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: DashMap::new(),
        }
    }

    pub fn record_failure(&self, model: &Arc<ModelSpec>) {
        let mut entry = self.state.entry(model.clone()).or_insert(CooldownState {
            last_failure: Instant::now(),
            failures: 0,
        });
        entry.last_failure = Instant::now();
        entry.failures += 1;
    }

    pub fn is_cooling_down(&self, model: &Arc<ModelSpec>) -> bool {
        self.state
            .get(model)
            .map(|state| state.last_failure.elapsed() < self.window)
            .unwrap_or(false)
    }

    pub fn failures(&self, model: &Arc<ModelSpec>) -> u32 {
        self.state.get(model).map(|state| state.failures).unwrap_or(0)
    }
}

// ============================================================================
// Alert manager
// ============================================================================

/// Routes recovered and failed batches back through the work queue.
pub struct AlertManager {
    queue: Arc<WorkQueue>,
    max_batch_retries: u32,
}

impl AlertManager {
    pub fn new(queue: Arc<WorkQueue>, max_batch_retries: u32) -> Self {
        Self {
            queue,
            max_batch_retries,
        }
    }

    /// Resubmit a batch after a retriable fault.
    ///
    /// The queue bumps the retry counter on re-entry; a batch that already
    /// spent its budget is failed outright instead of recirculating.
    pub async fn resubmit(&self, mut batch: Batch) {
        if batch.retries >= self.max_batch_retries {
            tracing::warn!(
                batch = batch.id,
                model = %batch.model.name,
                retries = batch.retries,
                "Retry budget exhausted, failing batch"
            );
            self.fail(
                batch,
                &format!("retry budget exhausted after {} attempts", self.max_batch_retries),
            )
            .await;
            return;
        }

        batch.set_status(BatchStatus::Error);
        self.queue.enqueue(batch).await;
    }

    /// Emit a failure response for a batch.
    pub async fn fail(&self, mut batch: Batch, reason: &str) {
        batch.fail(reason);
        self.queue.complete(batch).await;
    }
}

// ============================================================================
// Error processing
// ============================================================================

impl HealthError {
    /// Apply the recovery path for this fault class.
    ///
    /// Retriable: the instance stays registered; its lock is released and
    /// the in-flight batch goes back to the work queue. Fatal: the instance
    /// is torn down, the model enters cool-down, and the in-flight batch
    /// (if any) gets a failure response.
    pub async fn process(
        &self,
        registry: &InstanceRegistry,
        instance: &Arc<Instance>,
        alerts: &AlertManager,
        cooldowns: &CooldownTracker,
    ) -> anyhow::Result<()> {
        match self {
            HealthError::Retriable(reason) => {
                tracing::warn!(
                    instance = %instance.name,
                    model = %instance.model.name,
                    reason = %reason,
                    "Retriable instance fault, requeueing in-flight batch"
                );
                crate::metrics::record_instance_fault(&instance.model.name, false);

                instance.unlock();
                if let Some(batch) = instance.take_in_flight().await {
                    alerts.resubmit(batch).await;
                }
            }
            HealthError::Fatal(reason) => {
                tracing::error!(
                    instance = %instance.name,
                    model = %instance.model.name,
                    reason = %reason,
                    "Fatal instance fault, tearing instance down"
                );
                crate::metrics::record_instance_fault(&instance.model.name, true);

                instance.set_running(false);
                registry.remove(instance).await?;
                cooldowns.record_failure(&instance.model);

                // No in-flight batch means nothing to answer for.
                if let Some(batch) = instance.take_in_flight().await {
                    alerts
                        .fail(batch, &format!("instance '{}' failed: {}", instance.name, reason))
                        .await;
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Health monitor
// ============================================================================

/// Periodic health sweep over all live instances.
pub struct HealthMonitor {
    registry: Arc<InstanceRegistry>,
    checkers: Vec<Box<dyn HealthChecker>>,
    alerts: Arc<AlertManager>,
    cooldowns: Arc<CooldownTracker>,
    check_interval: Duration,
    initial_delay: Duration,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        backend: Arc<dyn ProvisioningBackend>,
        alerts: Arc<AlertManager>,
        cooldowns: Arc<CooldownTracker>,
        check_interval_secs: u64,
        initial_delay_secs: u64,
        connection_idle_timeout_secs: u64,
    ) -> Self {
        let checkers: Vec<Box<dyn HealthChecker>> = vec![
            Box::new(ConnectionLivenessChecker::new(Duration::from_secs(
                connection_idle_timeout_secs,
            ))),
            Box::new(ProvisioningLivenessChecker::new(backend)),
        ];
        Self {
            registry,
            checkers,
            alerts,
            cooldowns,
            check_interval: Duration::from_secs(check_interval_secs),
            initial_delay: Duration::from_secs(initial_delay_secs),
        }
    }

    /// Start the monitoring loop
    pub async fn run(self: Arc<Self>) {
        sleep(self.initial_delay).await;

        let mut ticker = interval(self.check_interval);
        tracing::info!(
            interval_secs = self.check_interval.as_secs(),
            "Health monitoring started"
        );

        loop {
            ticker.tick().await;
            self.check_all_instances().await;
        }
    }

    /// One sweep: probe every instance with every checker concurrently and
    /// process the first unhealthy outcome per instance.
    pub async fn check_all_instances(&self) {
        for instance in self.registry.list().await {
            let probes = self.checkers.iter().map(|checker| checker.check(&instance));
            let statuses = futures::future::join_all(probes).await;

            for status in statuses {
                if let Some(reason) = status.reason {
                    if let Err(e) = reason
                        .process(&self.registry, &instance, &self.alerts, &self.cooldowns)
                        .await
                    {
                        tracing::error!(
                            instance = %instance.name,
                            error = %e,
                            "Failed to process instance fault"
                        );
                    }
                    break;
                }
            }
        }
    }
}
