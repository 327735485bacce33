//! Load checkers: pure functions from queue/registry state to triggers

use crate::health::CooldownTracker;
use crate::model::ModelSpec;
use crate::queue::WorkQueue;
use crate::registry::InstanceRegistry;
use crate::triggers::Trigger;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Shared read-only view handed to every checker each tick.
pub struct CheckContext {
    pub queue: Arc<WorkQueue>,
    pub registry: Arc<InstanceRegistry>,
    pub cooldowns: Arc<CooldownTracker>,
}

/// One load checker. The closed set of three runs every analyzer tick.
#[async_trait]
pub trait LoadChecker: Send {
    fn name(&self) -> &'static str;

    async fn check(&mut self, ctx: &CheckContext) -> Vec<Trigger>;
}

/// Ensures every stateless model with pending work has at least one
/// instance.
pub struct EnoughResourcesChecker;

#[async_trait]
impl LoadChecker for EnoughResourcesChecker {
    fn name(&self) -> &'static str {
        "enough-resources"
    }

    async fn check(&mut self, ctx: &CheckContext) -> Vec<Trigger> {
        let mut triggers = Vec::new();
        for model in ctx.queue.stateless_models_with_pending().await {
            if ctx.cooldowns.is_cooling_down(&model) {
                continue;
            }
            if ctx.registry.count_for_model(&model).await == 0 {
                triggers.push(Trigger::Increase { model });
            }
        }
        triggers
    }
}

/// Keeps stateful sessions served: binds free instances in place, scales up
/// for unserved sessions, and scales down sessions gone idle.
pub struct StatefulChecker {
    idle_keep: Duration,
}

impl StatefulChecker {
    pub fn new(idle_keep: Duration) -> Self {
        Self { idle_keep }
    }
}

#[async_trait]
impl LoadChecker for StatefulChecker {
    fn name(&self) -> &'static str {
        "stateful"
    }

    async fn check(&mut self, ctx: &CheckContext) -> Vec<Trigger> {
        let mut triggers = Vec::new();

        for (session, model) in ctx.queue.session_partitions().await {
            if ctx
                .registry
                .get_for_dispatch(&model, Some(&session))
                .await
                .is_some()
            {
                continue;
            }
            // An unbound instance serves the session without any scaling.
            if let Some(instance) = ctx.registry.bind_session(&model, &session).await {
                tracing::debug!(
                    instance = %instance.name,
                    model = %model.name,
                    session = %session,
                    "Bound idle instance to pending session"
                );
                continue;
            }
            if !ctx.cooldowns.is_cooling_down(&model) {
                triggers.push(Trigger::Increase { model });
            }
        }

        // Sessions that stopped sending free their instance.
        for (session, instance) in ctx.registry.session_instances().await {
            if instance.idle_since_sent().await > self.idle_keep {
                tracing::debug!(
                    instance = %instance.name,
                    session = %session,
                    "Session idle past keep window, releasing instance"
                );
                triggers.push(Trigger::Decrease { instance });
            }
        }

        triggers
    }
}

/// Scales stateless models on estimated queue drain time.
///
/// Keeps a bounded per-model window of observed per-item latency, fed from
/// the output queue's samples (drained each tick). Drain estimate =
/// `pending_items * mean_latency / max(1, running)`. Estimates at or above
/// `max_threshold` scale up; a fully drained queue with the estimate under
/// `min_threshold` and more than one instance running scales down.
pub struct RunningMeanStatelessChecker {
    window: usize,
    min_threshold: f64,
    max_threshold: f64,
    samples: HashMap<Arc<ModelSpec>, VecDeque<f64>>,
}

impl RunningMeanStatelessChecker {
    pub fn new(window: usize, min_threshold: f64, max_threshold: f64) -> Self {
        Self {
            window,
            min_threshold,
            max_threshold,
            samples: HashMap::new(),
        }
    }

    fn mean_latency(&self, model: &Arc<ModelSpec>) -> f64 {
        match self.samples.get(model) {
            Some(window) if !window.is_empty() => {
                window.iter().sum::<f64>() / window.len() as f64
            }
            _ => 0.0,
        }
    }

    fn absorb_samples(&mut self, samples: Vec<crate::queue::LatencySample>) {
        for sample in samples {
            if !sample.model.stateless {
                continue;
            }
            let per_item = sample.latency.as_secs_f64() / sample.items.max(1) as f64;
            let window = self.samples.entry(sample.model).or_default();
            window.push_back(per_item);
            while window.len() > self.window {
                window.pop_front();
            }
        }
    }
}

#[async_trait]
impl LoadChecker for RunningMeanStatelessChecker {
    fn name(&self) -> &'static str {
        "running-mean"
    }

    async fn check(&mut self, ctx: &CheckContext) -> Vec<Trigger> {
        self.absorb_samples(ctx.queue.take_latency_samples().await);

        // Evaluate every stateless model that is running or has work.
        let mut models: Vec<Arc<ModelSpec>> = ctx
            .registry
            .running_models()
            .await
            .into_iter()
            .filter(|model| model.stateless)
            .collect();
        for model in ctx.queue.stateless_models_with_pending().await {
            if !models.contains(&model) {
                models.push(model);
            }
        }

        let mut triggers = Vec::new();
        for model in models {
            let pending = ctx.queue.pending_items(&model).await;
            let running = ctx.registry.count_for_model(&model).await;
            let mean = self.mean_latency(&model);
            let drain = pending as f64 * mean / running.max(1) as f64;

            if drain >= self.max_threshold {
                if !ctx.cooldowns.is_cooling_down(&model) {
                    tracing::debug!(
                        model = %model.name,
                        pending,
                        running,
                        drain_secs = drain,
                        "Drain estimate above threshold, scaling up"
                    );
                    triggers.push(Trigger::Increase { model });
                }
            } else if pending == 0 && drain < self.min_threshold && running > 1 {
                // Lock the victim now so a concurrent dispatch cannot pick
                // it between selection and application.
                for instance in ctx.registry.instances_for_model(&model).await {
                    if instance.try_lock() {
                        triggers.push(Trigger::Decrease { instance });
                        break;
                    }
                }
            }
        }

        triggers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combiner::ResultCombiner;
    use crate::instance::ProvisioningBackend;
    use crate::instance::mocks::MockProvisioner;
    use crate::model::{Batch, BatchItem, BatchStatus};

    struct Fixture {
        ctx: CheckContext,
        backend: Arc<MockProvisioner>,
    }

    async fn fixture() -> Fixture {
        let queue = Arc::new(WorkQueue::new());
        let (combiner, handle) = ResultCombiner::new(queue.clone());
        tokio::spawn(combiner.run());
        Fixture {
            ctx: CheckContext {
                queue,
                registry: Arc::new(InstanceRegistry::new(handle)),
                cooldowns: Arc::new(CooldownTracker::new(Duration::from_secs(60))),
            },
            backend: Arc::new(MockProvisioner::new(16)),
        }
    }

    fn batch_of(model: &Arc<ModelSpec>, id: u64, items: usize, session: Option<&str>) -> Batch {
        Batch::new(
            id,
            (0..items)
                .map(|i| BatchItem {
                    request_id: format!("r{}-{}", id, i),
                    payload: Vec::new(),
                })
                .collect(),
            model.clone(),
            session.map(String::from),
        )
    }

    async fn add_instances(f: &Fixture, model: &Arc<ModelSpec>, n: usize) {
        for _ in 0..n {
            let instance = f.backend.start_instance(model.clone()).await.unwrap();
            f.ctx.registry.add(instance).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_enough_resources_scales_from_zero() {
        let f = fixture().await;
        let model = ModelSpec::new("bert", "registry/bert:1", true);
        f.ctx.queue.enqueue(batch_of(&model, 1, 2, None)).await;

        let mut checker = EnoughResourcesChecker;
        let triggers = checker.check(&f.ctx).await;
        assert_eq!(triggers.len(), 1);
        assert!(triggers[0].is_increase());
    }

    #[tokio::test]
    async fn test_enough_resources_respects_cooldown_and_running() {
        let f = fixture().await;
        let model = ModelSpec::new("bert", "registry/bert:1", true);
        f.ctx.queue.enqueue(batch_of(&model, 1, 2, None)).await;

        let mut checker = EnoughResourcesChecker;

        // Already running: no trigger.
        add_instances(&f, &model, 1).await;
        assert!(checker.check(&f.ctx).await.is_empty());

        // Cooling down with zero instances: still no trigger.
        let instance = f.ctx.registry.instances_for_model(&model).await[0].clone();
        f.ctx.registry.remove(&instance).await.unwrap();
        f.ctx.cooldowns.record_failure(&model);
        assert!(checker.check(&f.ctx).await.is_empty());
    }

    #[tokio::test]
    async fn test_stateful_binds_in_place_without_trigger() {
        let f = fixture().await;
        let model = ModelSpec::new("chat", "registry/chat:1", false);
        add_instances(&f, &model, 1).await;
        f.ctx.queue.enqueue(batch_of(&model, 1, 1, Some("a"))).await;

        let mut checker = StatefulChecker::new(Duration::from_secs(300));
        let triggers = checker.check(&f.ctx).await;
        assert!(triggers.is_empty());

        // The pending session now has a bound instance.
        assert!(
            f.ctx
                .registry
                .get_for_dispatch(&model, Some("a"))
                .await
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_stateful_scales_up_when_no_instance_free() {
        let f = fixture().await;
        let model = ModelSpec::new("chat", "registry/chat:1", false);
        f.ctx.queue.enqueue(batch_of(&model, 1, 1, Some("a"))).await;

        let mut checker = StatefulChecker::new(Duration::from_secs(300));
        let triggers = checker.check(&f.ctx).await;
        assert_eq!(triggers.len(), 1);
        assert!(triggers[0].is_increase());
        assert!(!triggers[0].is_stateless());
    }

    #[tokio::test]
    async fn test_stateful_releases_idle_sessions() {
        let f = fixture().await;
        let model = ModelSpec::new("chat", "registry/chat:1", false);
        add_instances(&f, &model, 1).await;
        f.ctx.registry.bind_session(&model, "a").await.unwrap();

        // Zero keep window: any bound session counts as idle.
        let mut checker = StatefulChecker::new(Duration::from_secs(0));
        let triggers = checker.check(&f.ctx).await;
        assert_eq!(triggers.len(), 1);
        assert!(!triggers[0].is_increase());
    }

    #[tokio::test]
    async fn test_running_mean_no_trigger_inside_band() {
        let f = fixture().await;
        let model = ModelSpec::new("bert", "registry/bert:1", true);
        add_instances(&f, &model, 2).await;
        // 2 pending items, mean latency 1s/item, 2 instances: drain = 1s.
        f.ctx.queue.enqueue(batch_of(&model, 1, 2, None)).await;

        let mut checker = RunningMeanStatelessChecker::new(16, 5.0, 10.0);
        checker.absorb_samples(vec![crate::queue::LatencySample {
            model: model.clone(),
            items: 1,
            latency: Duration::from_secs(1),
        }]);

        assert!(checker.check(&f.ctx).await.is_empty());
    }

    #[tokio::test]
    async fn test_running_mean_scales_up_past_threshold() {
        let f = fixture().await;
        let model = ModelSpec::new("bert", "registry/bert:1", true);
        add_instances(&f, &model, 1).await;
        // 10 pending items, mean 1s/item, 1 instance: drain = 10s >= 10.
        f.ctx.queue.enqueue(batch_of(&model, 1, 10, None)).await;

        let mut checker = RunningMeanStatelessChecker::new(16, 5.0, 10.0);
        checker.absorb_samples(vec![crate::queue::LatencySample {
            model: model.clone(),
            items: 1,
            latency: Duration::from_secs(1),
        }]);

        let triggers = checker.check(&f.ctx).await;
        assert_eq!(triggers.len(), 1);
        assert!(triggers[0].is_increase());
    }

    #[tokio::test]
    async fn test_running_mean_scales_down_drained_model() {
        let f = fixture().await;
        let model = ModelSpec::new("bert", "registry/bert:1", true);
        add_instances(&f, &model, 2).await;

        let mut checker = RunningMeanStatelessChecker::new(16, 5.0, 10.0);
        let triggers = checker.check(&f.ctx).await;
        assert_eq!(triggers.len(), 1);
        assert!(!triggers[0].is_increase());

        // The selected victim is locked against concurrent dispatch.
        if let Trigger::Decrease { instance } = &triggers[0] {
            assert!(instance.is_locked());
        }
    }

    #[tokio::test]
    async fn test_running_mean_never_scales_down_last_instance() {
        let f = fixture().await;
        let model = ModelSpec::new("bert", "registry/bert:1", true);
        add_instances(&f, &model, 1).await;

        let mut checker = RunningMeanStatelessChecker::new(16, 5.0, 10.0);
        assert!(checker.check(&f.ctx).await.is_empty());
    }

    #[tokio::test]
    async fn test_running_mean_zero_min_disables_scale_down() {
        let f = fixture().await;
        let model = ModelSpec::new("bert", "registry/bert:1", true);
        add_instances(&f, &model, 2).await;

        let mut checker = RunningMeanStatelessChecker::new(16, 0.0, 10.0);
        assert!(checker.check(&f.ctx).await.is_empty());
    }

    #[tokio::test]
    async fn test_running_mean_window_is_bounded() {
        let model = ModelSpec::new("bert", "registry/bert:1", true);
        let mut checker = RunningMeanStatelessChecker::new(2, 5.0, 10.0);

        let sample = |secs| crate::queue::LatencySample {
            model: model.clone(),
            items: 1,
            latency: Duration::from_secs(secs),
        };
        checker.absorb_samples(vec![sample(100), sample(2), sample(4)]);

        // The window keeps the 2 newest samples: mean = 3s.
        assert_eq!(checker.mean_latency(&model), 3.0);
    }
}
