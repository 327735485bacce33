//! Load analyzer: runs the checkers and the trigger pipeline on a tick

use crate::checkers::{
    CheckContext, EnoughResourcesChecker, LoadChecker, RunningMeanStatelessChecker,
    StatefulChecker,
};
use crate::config::SchedulerConfig;
use crate::health::{AlertManager, CooldownTracker};
use crate::instance::ProvisioningBackend;
use crate::queue::WorkQueue;
use crate::registry::InstanceRegistry;
use crate::triggers::{Trigger, TriggerPipeline};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

/// Ticks the load checkers and feeds their triggers through the pipeline.
pub struct LoadAnalyzer {
    checkers: Vec<Box<dyn LoadChecker>>,
    pipeline: TriggerPipeline,
    ctx: CheckContext,
    tick: Duration,
}

impl LoadAnalyzer {
    pub fn new(
        config: &SchedulerConfig,
        queue: Arc<WorkQueue>,
        registry: Arc<InstanceRegistry>,
        backend: Arc<dyn ProvisioningBackend>,
        alerts: Arc<AlertManager>,
        cooldowns: Arc<CooldownTracker>,
    ) -> Self {
        let checkers: Vec<Box<dyn LoadChecker>> = vec![
            Box::new(EnoughResourcesChecker),
            Box::new(StatefulChecker::new(Duration::from_secs(
                config.idle_keep_secs,
            ))),
            Box::new(RunningMeanStatelessChecker::new(
                config.latency_window,
                config.min_threshold_secs,
                config.max_threshold_secs,
            )),
        ];
        let pipeline = TriggerPipeline::new(
            registry.clone(),
            backend,
            alerts,
            config.max_model_percent,
        );
        Self {
            checkers,
            pipeline,
            ctx: CheckContext {
                queue,
                registry,
                cooldowns,
            },
            tick: Duration::from_millis(config.analyzer_interval_ms),
        }
    }

    /// One tick: collect triggers from every checker, optimize, apply.
    /// Returns the number of applied triggers.
    pub async fn run_once(&mut self) -> usize {
        let mut triggers: Vec<Trigger> = Vec::new();
        for checker in &mut self.checkers {
            let produced = checker.check(&self.ctx).await;
            if !produced.is_empty() {
                tracing::debug!(
                    checker = checker.name(),
                    count = produced.len(),
                    "Checker produced triggers"
                );
            }
            triggers.extend(produced);
        }

        if triggers.is_empty() {
            return 0;
        }

        let survivors = self.pipeline.optimize(triggers).await;
        let applied = self.pipeline.apply(survivors).await;
        if applied > 0 {
            crate::metrics::record_triggers_applied(applied);
        }
        applied
    }

    pub async fn run(mut self) {
        let mut ticker = interval(self.tick);
        tracing::info!(
            interval_ms = self.tick.as_millis() as u64,
            "Load analyzer started"
        );
        loop {
            ticker.tick().await;
            self.run_once().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combiner::ResultCombiner;
    use crate::instance::mocks::MockProvisioner;
    use crate::model::{Batch, BatchItem, ModelSpec};

    async fn analyzer_fixture(
        max_instances: usize,
    ) -> (LoadAnalyzer, Arc<WorkQueue>, Arc<InstanceRegistry>) {
        let queue = Arc::new(WorkQueue::new());
        let (combiner, handle) = ResultCombiner::new(queue.clone());
        tokio::spawn(combiner.run());
        let registry = Arc::new(InstanceRegistry::new(handle));
        let backend = Arc::new(MockProvisioner::new(max_instances));
        let alerts = Arc::new(AlertManager::new(queue.clone(), 3));
        let cooldowns = Arc::new(CooldownTracker::new(Duration::from_secs(60)));
        let config = SchedulerConfig {
            max_model_percent: 100.0,
            ..Default::default()
        };
        let analyzer = LoadAnalyzer::new(
            &config,
            queue.clone(),
            registry.clone(),
            backend,
            alerts,
            cooldowns,
        );
        (analyzer, queue, registry)
    }

    #[tokio::test]
    async fn test_tick_scales_stateless_model_from_zero() {
        let (mut analyzer, queue, registry) = analyzer_fixture(4).await;
        let model = ModelSpec::new("bert", "registry/bert:1", true);

        queue
            .enqueue(Batch::new(
                1,
                vec![BatchItem {
                    request_id: "r1".to_string(),
                    payload: Vec::new(),
                }],
                model.clone(),
                None,
            ))
            .await;

        let applied = analyzer.run_once().await;
        assert_eq!(applied, 1);
        assert_eq!(registry.count_for_model(&model).await, 1);

        // Second tick: the model is served, nothing more to do.
        assert_eq!(analyzer.run_once().await, 0);
    }

    #[tokio::test]
    async fn test_tick_serves_stateful_session() {
        let (mut analyzer, queue, registry) = analyzer_fixture(4).await;
        let model = ModelSpec::new("chat", "registry/chat:1", false);

        queue
            .enqueue(Batch::new(
                1,
                vec![BatchItem {
                    request_id: "r1".to_string(),
                    payload: Vec::new(),
                }],
                model.clone(),
                Some("a".to_string()),
            ))
            .await;

        // First tick scales up; the binding happens on a later tick once
        // the instance exists.
        assert_eq!(analyzer.run_once().await, 1);
        analyzer.run_once().await;
        assert!(
            registry
                .get_for_dispatch(&model, Some("a"))
                .await
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_idle_tick_is_a_noop() {
        let (mut analyzer, _queue, registry) = analyzer_fixture(4).await;
        assert_eq!(analyzer.run_once().await, 0);
        assert_eq!(registry.count().await, 0);
    }
}
