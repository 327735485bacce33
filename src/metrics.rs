//! Scheduler metrics
//!
//! Counters and gauges go through the `metrics` facade; installing an
//! exporter is the embedding application's job.

/// Record a batch entering the work queue
pub fn record_batch_enqueued(model: &str) {
    metrics::counter!("scheduler_batches_enqueued_total",
        "model" => model.to_string()
    )
    .increment(1);
}

/// Record a batch leaving through the output queue
pub fn record_batch_completed(model: &str, failed: bool) {
    metrics::counter!("scheduler_batches_completed_total",
        "model" => model.to_string(),
        "outcome" => if failed { "failed" } else { "done" }
    )
    .increment(1);
}

/// Record a scale-up that started an instance
pub fn record_instance_started(model: &str) {
    metrics::counter!("scheduler_instances_started_total",
        "model" => model.to_string()
    )
    .increment(1);
}

/// Record a scale-down that stopped an instance
pub fn record_instance_stopped(model: &str) {
    metrics::counter!("scheduler_instances_stopped_total",
        "model" => model.to_string()
    )
    .increment(1);
}

/// Record a classified instance fault
pub fn record_instance_fault(model: &str, fatal: bool) {
    metrics::counter!("scheduler_instance_faults_total",
        "model" => model.to_string(),
        "class" => if fatal { "fatal" } else { "retriable" }
    )
    .increment(1);
}

/// Record a trigger dropped by conflict resolution
pub fn record_trigger_dropped(kind: &'static str) {
    metrics::counter!("scheduler_triggers_dropped_total", "kind" => kind).increment(1);
}

/// Record triggers applied in one analyzer tick
pub fn record_triggers_applied(count: usize) {
    metrics::counter!("scheduler_triggers_applied_total").increment(count as u64);
}

/// Update the total instance count gauge
pub fn update_instance_count(count: usize) {
    metrics::gauge!("scheduler_instances_count").set(count as f64);
}

/// Update a model's pending-item gauge
pub fn update_queue_depth(model: &str, depth: usize) {
    metrics::gauge!("scheduler_queue_depth",
        "model" => model.to_string()
    )
    .set(depth as f64);
}
