//! Scaling triggers and the conflict-resolution pipeline

use crate::health::AlertManager;
use crate::instance::{Instance, ProvisioningBackend};
use crate::model::ModelSpec;
use crate::registry::InstanceRegistry;
use std::collections::HashMap;
use std::sync::Arc;

/// One desired scaling action, not yet applied.
///
/// Triggers are produced every analyzer tick, applied at most once, and
/// never persisted.
#[derive(Debug, Clone)]
pub enum Trigger {
    Increase { model: Arc<ModelSpec> },
    Decrease { instance: Arc<Instance> },
}

impl Trigger {
    pub fn model(&self) -> &Arc<ModelSpec> {
        match self {
            Trigger::Increase { model } => model,
            Trigger::Decrease { instance } => &instance.model,
        }
    }

    pub fn is_stateless(&self) -> bool {
        self.model().stateless
    }

    pub fn is_increase(&self) -> bool {
        matches!(self, Trigger::Increase { .. })
    }
}

/// Collects the tick's triggers, resolves capacity conflicts, and applies
/// the survivors against the provisioning backend.
pub struct TriggerPipeline {
    registry: Arc<InstanceRegistry>,
    backend: Arc<dyn ProvisioningBackend>,
    alerts: Arc<AlertManager>,
    max_model_percent: f64,
}

impl TriggerPipeline {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        backend: Arc<dyn ProvisioningBackend>,
        alerts: Arc<AlertManager>,
        max_model_percent: f64,
    ) -> Self {
        Self {
            registry,
            backend,
            alerts,
            max_model_percent,
        }
    }

    /// Filter the tick's triggers down to a conflict-free set.
    ///
    /// Fixed priority order, each phase draft-applying against per-model
    /// running counts:
    /// 1. stateful decreases: always safe, kept unconditionally;
    /// 2. stateful increases: capacity-conflicting ones dropped;
    /// 3. stateless decreases: at most one per tick;
    /// 4. stateless increases: same conflict removal as 2.
    pub async fn optimize(&self, triggers: Vec<Trigger>) -> Vec<Trigger> {
        let mut counts = self.registry.counts_per_model().await;
        let max_instances = self.backend.max_running_instances();

        let mut stateful_decreases = Vec::new();
        let mut stateful_increases = Vec::new();
        let mut stateless_decreases = Vec::new();
        let mut stateless_increases = Vec::new();
        for trigger in triggers {
            match (trigger.is_stateless(), trigger.is_increase()) {
                (false, false) => stateful_decreases.push(trigger),
                (false, true) => stateful_increases.push(trigger),
                (true, false) => stateless_decreases.push(trigger),
                (true, true) => stateless_increases.push(trigger),
            }
        }

        let mut kept = Vec::new();

        // Freeing stuck sessions is always safe.
        for trigger in stateful_decreases {
            Self::draft_decrease(&mut counts, trigger.model());
            kept.push(trigger);
        }

        self.admit_increases(stateful_increases, &mut counts, max_instances, &mut kept);

        // A single decrease per tick avoids over-correcting; the losers'
        // reservations are released.
        let mut decrease_taken = false;
        for trigger in stateless_decreases {
            if !decrease_taken {
                decrease_taken = true;
                Self::draft_decrease(&mut counts, trigger.model());
                kept.push(trigger);
            } else if let Trigger::Decrease { instance } = &trigger {
                tracing::debug!(
                    instance = %instance.name,
                    model = %instance.model.name,
                    "Dropping surplus stateless decrease trigger"
                );
                crate::metrics::record_trigger_dropped("decrease");
                instance.unlock();
            }
        }

        self.admit_increases(stateless_increases, &mut counts, max_instances, &mut kept);

        kept
    }

    fn draft_decrease(counts: &mut HashMap<Arc<ModelSpec>, usize>, model: &Arc<ModelSpec>) {
        if let Some(count) = counts.get_mut(model) {
            *count = count.saturating_sub(1);
        }
    }

    /// Greedy conflict removal: admit increases in order, dropping any that
    /// would push the draft counts past the global maximum or the
    /// per-model share.
    fn admit_increases(
        &self,
        triggers: Vec<Trigger>,
        counts: &mut HashMap<Arc<ModelSpec>, usize>,
        max_instances: usize,
        kept: &mut Vec<Trigger>,
    ) {
        let model_cap = (max_instances as f64 * self.max_model_percent / 100.0).floor() as usize;
        // A nonzero budget always admits at least one instance per model.
        let model_cap = model_cap.max(1);

        for trigger in triggers {
            let model = trigger.model().clone();
            let total: usize = counts.values().sum();
            let model_count = counts.get(&model).copied().unwrap_or(0);

            if total + 1 > max_instances || model_count + 1 > model_cap {
                tracing::debug!(
                    model = %model.name,
                    total,
                    model_count,
                    max_instances,
                    model_cap,
                    "Dropping increase trigger on capacity conflict"
                );
                crate::metrics::record_trigger_dropped("increase");
                continue;
            }

            *counts.entry(model).or_insert(0) += 1;
            kept.push(trigger);
        }
    }

    /// Execute the surviving triggers in order. Returns the applied count.
    ///
    /// Backend API errors are not escalated: the checker's intent is simply
    /// not realized this tick and will re-fire on the next one.
    pub async fn apply(&self, triggers: Vec<Trigger>) -> usize {
        let mut applied = 0;

        for trigger in triggers {
            match trigger {
                Trigger::Increase { model } => {
                    if !self.backend.can_create_instance(&model).await {
                        tracing::debug!(
                            model = %model.name,
                            "Backend reports no capacity, skipping increase"
                        );
                        continue;
                    }
                    match self.backend.start_instance(model.clone()).await {
                        Ok(instance) => match self.registry.add(instance.clone()).await {
                            Ok(()) => {
                                crate::metrics::record_instance_started(&model.name);
                                applied += 1;
                            }
                            Err(e) => {
                                tracing::error!(
                                    instance = %instance.name,
                                    error = %e,
                                    "Failed to register started instance, stopping it"
                                );
                                let _ = self.backend.stop_instance(&instance).await;
                            }
                        },
                        Err(e) => {
                            tracing::warn!(
                                model = %model.name,
                                error = %e,
                                "Failed to start instance"
                            );
                        }
                    }
                }
                Trigger::Decrease { instance } => {
                    match self.backend.stop_instance(&instance).await {
                        Ok(()) => {
                            if let Err(e) = self.registry.remove(&instance).await {
                                tracing::error!(
                                    instance = %instance.name,
                                    error = %e,
                                    "Failed to deregister stopped instance"
                                );
                            }
                            // Teardown never silently drops work.
                            if let Some(batch) = instance.take_in_flight().await {
                                self.alerts.resubmit(batch).await;
                            }
                            crate::metrics::record_instance_stopped(&instance.model.name);
                            applied += 1;
                        }
                        Err(e) => {
                            tracing::warn!(
                                instance = %instance.name,
                                error = %e,
                                "Failed to stop instance"
                            );
                            // Release the selection reservation so dispatch
                            // can use the instance again.
                            if instance.model.stateless {
                                instance.unlock();
                            }
                        }
                    }
                }
            }
        }

        applied
    }
}
