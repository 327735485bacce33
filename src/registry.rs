//! Thread-safe instance registry with round-robin and sticky routing

use crate::combiner::CombinerHandle;
use crate::instance::Instance;
use crate::model::ModelSpec;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};

/// Events that occur during instance lifecycle
#[derive(Debug, Clone)]
pub enum InstanceEvent {
    /// Instance was added to the registry
    Added(String),
    /// Instance was removed from the registry
    Removed(String),
}

#[derive(Default)]
struct RegistryState {
    instances: HashMap<Arc<ModelSpec>, Vec<Arc<Instance>>>,
    /// Round-robin cursor per stateless model.
    cursors: HashMap<Arc<ModelSpec>, usize>,
}

/// Maps each model to its live serving instances.
///
/// Stateless models are served round-robin; stateful models route by bound
/// session. The registry is mutated only by trigger application, health
/// error processing, and session binding. It never initiates scaling.
pub struct InstanceRegistry {
    state: RwLock<RegistryState>,
    combiner: CombinerHandle,
    event_tx: broadcast::Sender<InstanceEvent>,
}

impl InstanceRegistry {
    pub fn new(combiner: CombinerHandle) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            state: RwLock::new(RegistryState::default()),
            combiner,
            event_tx,
        }
    }

    /// Subscribe to lifecycle events
    pub fn subscribe_events(&self) -> broadcast::Receiver<InstanceEvent> {
        self.event_tx.subscribe()
    }

    /// Register an instance and hook its response stream into the fan-in.
    pub async fn add(&self, instance: Arc<Instance>) -> Result<()> {
        let receiver = instance.take_receiver().await?;
        self.combiner.attach(instance.clone(), receiver).await?;

        let mut state = self.state.write().await;
        state
            .instances
            .entry(instance.model.clone())
            .or_default()
            .push(instance.clone());
        let total: usize = state.instances.values().map(Vec::len).sum();
        drop(state);

        tracing::info!(
            instance = %instance.name,
            model = %instance.model.name,
            total_instances = total,
            "Instance added to registry"
        );
        crate::metrics::update_instance_count(total);

        let _ = self
            .event_tx
            .send(InstanceEvent::Added(instance.name.clone()));

        Ok(())
    }

    /// Remove an instance, detaching its fan-in subscription first.
    ///
    /// Awaited: a scale-down is not complete until the fan-in has dropped
    /// the instance's stream. Idempotent: removing an unknown instance is
    /// a no-op.
    pub async fn remove(&self, instance: &Arc<Instance>) -> Result<()> {
        let mut state = self.state.write().await;
        let mut found = false;
        if let Some(list) = state.instances.get_mut(&instance.model) {
            let before = list.len();
            list.retain(|i| i.name != instance.name);
            found = list.len() < before;
            if list.is_empty() {
                state.instances.remove(&instance.model);
                state.cursors.remove(&instance.model);
            }
        }
        let total: usize = state.instances.values().map(Vec::len).sum();
        // Drop the write lock before awaiting the fan-in detach.
        drop(state);

        if !found {
            return Ok(());
        }

        self.combiner.detach(&instance.name).await?;

        tracing::info!(
            instance = %instance.name,
            model = %instance.model.name,
            total_instances = total,
            "Instance removed from registry"
        );
        crate::metrics::update_instance_count(total);

        let _ = self
            .event_tx
            .send(InstanceEvent::Removed(instance.name.clone()));

        Ok(())
    }

    /// Select an instance for dispatch.
    ///
    /// Stateless: next instance in round-robin order, cursor wrapping
    /// modulo the current count. Stateful: the instance bound to the
    /// session, or `None` if no binding exists yet.
    pub async fn get_for_dispatch(
        &self,
        model: &Arc<ModelSpec>,
        session: Option<&str>,
    ) -> Option<Arc<Instance>> {
        match session {
            None => {
                let mut state = self.state.write().await;
                let len = match state.instances.get(model) {
                    Some(list) if !list.is_empty() => list.len(),
                    _ => return None,
                };
                let cursor = state.cursors.entry(model.clone()).or_insert(0);
                let index = *cursor % len;
                *cursor = index + 1;
                state.instances.get(model).map(|list| list[index].clone())
            }
            Some(session) => {
                let state = self.state.read().await;
                let list = state.instances.get(model)?;
                for instance in list {
                    if instance.session().await.as_deref() == Some(session) {
                        return Some(instance.clone());
                    }
                }
                None
            }
        }
    }

    /// Find an unbound instance of a stateful model.
    pub async fn find_unbound(&self, model: &Arc<ModelSpec>) -> Option<Arc<Instance>> {
        let state = self.state.read().await;
        let list = state.instances.get(model)?;
        for instance in list {
            if instance.session().await.is_none() {
                return Some(instance.clone());
            }
        }
        None
    }

    /// Bind a session to an unbound instance in place.
    pub async fn bind_session(
        &self,
        model: &Arc<ModelSpec>,
        session: &str,
    ) -> Option<Arc<Instance>> {
        // Re-check under binding: another session may have claimed the
        // instance between lookup and bind.
        loop {
            let candidate = self.find_unbound(model).await?;
            if candidate.bind_session(session).await {
                return Some(candidate);
            }
        }
    }

    /// All models with at least one running instance.
    pub async fn running_models(&self) -> Vec<Arc<ModelSpec>> {
        self.state.read().await.instances.keys().cloned().collect()
    }

    /// All bound `(session, instance)` pairs.
    pub async fn session_instances(&self) -> Vec<(String, Arc<Instance>)> {
        let state = self.state.read().await;
        let mut pairs = Vec::new();
        for list in state.instances.values() {
            for instance in list {
                if let Some(session) = instance.session().await {
                    pairs.push((session, instance.clone()));
                }
            }
        }
        pairs
    }

    pub async fn list(&self) -> Vec<Arc<Instance>> {
        self.state
            .read()
            .await
            .instances
            .values()
            .flatten()
            .cloned()
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.state
            .read()
            .await
            .instances
            .values()
            .map(Vec::len)
            .sum()
    }

    pub async fn instances_for_model(&self, model: &Arc<ModelSpec>) -> Vec<Arc<Instance>> {
        self.state
            .read()
            .await
            .instances
            .get(model)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn count_for_model(&self, model: &Arc<ModelSpec>) -> usize {
        self.state
            .read()
            .await
            .instances
            .get(model)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub async fn counts_per_model(&self) -> HashMap<Arc<ModelSpec>, usize> {
        self.state
            .read()
            .await
            .instances
            .iter()
            .map(|(model, list)| (model.clone(), list.len()))
            .collect()
    }
}
