//! Observability metrics for the controller.
//!
//! Metrics go through the `metrics` crate facade; without an installed
//! recorder every call is a no-op.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `tideway_queue_depth` | Gauge | controller | Keys ready in the event queue |
//! | `tideway_reconciles_total` | Counter | controller, event, result | Handler outcomes |
//! | `tideway_reconcile_duration_seconds` | Histogram | controller | Handler latency |
//! | `tideway_admission_decisions_total` | Counter | decision | Admission outcomes |
//! | `tideway_running_runs` | Gauge | scope | Runs holding an admission slot |
//! | `tideway_pending_runs` | Gauge | scope | Runs waiting for a slot |
//! | `tideway_run_timeouts_total` | Counter | - | Runs failed by the timeout sweep |
//! | `tideway_gc_deletions_total` | Counter | kind | Objects deleted by garbage collection |
//! | `tideway_sweep_errors_total` | Counter | processor | Per-item sweep failures |
//! | `tideway_sweep_duration_seconds` | Histogram | processor | Sweep latency |
//! | `tideway_events_published_total` | Counter | result | Run events shipped to the broker |
//!
//! ## Usage
//!
//! ```rust,no_run
//! use tideway_controller::metrics::ControllerMetrics;
//!
//! let metrics = ControllerMetrics::new();
//! metrics.record_reconcile("workflow-run", "update", "success");
//! metrics.set_queue_depth("workflow-run", 3);
//! ```

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Gauge: Keys ready in the event queue.
    pub const QUEUE_DEPTH: &str = "tideway_queue_depth";
    /// Counter: Handler invocations by outcome.
    pub const RECONCILES_TOTAL: &str = "tideway_reconciles_total";
    /// Histogram: Handler latency in seconds.
    pub const RECONCILE_DURATION_SECONDS: &str = "tideway_reconcile_duration_seconds";
    /// Counter: Admission decisions.
    pub const ADMISSION_DECISIONS_TOTAL: &str = "tideway_admission_decisions_total";
    /// Gauge: Runs holding an admission slot.
    pub const RUNNING_RUNS: &str = "tideway_running_runs";
    /// Gauge: Runs waiting for an admission slot.
    pub const PENDING_RUNS: &str = "tideway_pending_runs";
    /// Counter: Runs failed by the timeout sweep.
    pub const RUN_TIMEOUTS_TOTAL: &str = "tideway_run_timeouts_total";
    /// Counter: Objects deleted by garbage collection.
    pub const GC_DELETIONS_TOTAL: &str = "tideway_gc_deletions_total";
    /// Counter: Per-item sweep failures.
    pub const SWEEP_ERRORS_TOTAL: &str = "tideway_sweep_errors_total";
    /// Histogram: Sweep latency in seconds.
    pub const SWEEP_DURATION_SECONDS: &str = "tideway_sweep_duration_seconds";
    /// Counter: Run events shipped to the broker.
    pub const EVENTS_PUBLISHED_TOTAL: &str = "tideway_events_published_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Controller registration name.
    pub const CONTROLLER: &str = "controller";
    /// Event type (create, update, delete).
    pub const EVENT: &str = "event";
    /// Result status (success, transient, permanent).
    pub const RESULT: &str = "result";
    /// Admission decision (admitted, queued, already_running).
    pub const DECISION: &str = "decision";
    /// Admission scope.
    pub const SCOPE: &str = "scope";
    /// Resource kind.
    pub const KIND: &str = "kind";
    /// Periodic processor name (timeout, gc).
    pub const PROCESSOR: &str = "processor";
}

/// High-level interface for recording controller metrics.
///
/// Cheap to clone and share across tasks.
#[derive(Debug, Clone, Default)]
pub struct ControllerMetrics;

impl ControllerMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Sets the queue depth for a controller.
    #[allow(clippy::cast_precision_loss)] // Gauge values are typically small
    pub fn set_queue_depth(&self, controller: &str, depth: usize) {
        gauge!(
            names::QUEUE_DEPTH,
            labels::CONTROLLER => controller.to_string(),
        )
        .set(depth as f64);
    }

    /// Records one handler outcome.
    pub fn record_reconcile(&self, controller: &str, event: &str, result: &str) {
        counter!(
            names::RECONCILES_TOTAL,
            labels::CONTROLLER => controller.to_string(),
            labels::EVENT => event.to_string(),
            labels::RESULT => result.to_string(),
        )
        .increment(1);
    }

    /// Records handler latency.
    pub fn observe_reconcile_duration(&self, controller: &str, duration: Duration) {
        histogram!(
            names::RECONCILE_DURATION_SECONDS,
            labels::CONTROLLER => controller.to_string(),
        )
        .record(duration.as_secs_f64());
    }

    /// Records an admission decision.
    pub fn record_admission(&self, decision: &str) {
        counter!(
            names::ADMISSION_DECISIONS_TOTAL,
            labels::DECISION => decision.to_string(),
        )
        .increment(1);
    }

    /// Sets the running and pending counts of an admission scope.
    #[allow(clippy::cast_precision_loss)] // Gauge values are typically small
    pub fn set_scope_occupancy(&self, scope: &str, running: usize, pending: usize) {
        gauge!(names::RUNNING_RUNS, labels::SCOPE => scope.to_string()).set(running as f64);
        gauge!(names::PENDING_RUNS, labels::SCOPE => scope.to_string()).set(pending as f64);
    }

    /// Records a run failed by the timeout sweep.
    pub fn record_timeout(&self) {
        counter!(names::RUN_TIMEOUTS_TOTAL).increment(1);
    }

    /// Records objects deleted by garbage collection.
    pub fn record_gc_deletions(&self, kind: &str, count: usize) {
        counter!(
            names::GC_DELETIONS_TOTAL,
            labels::KIND => kind.to_string(),
        )
        .increment(count as u64);
    }

    /// Records a per-item sweep failure.
    pub fn record_sweep_error(&self, processor: &str) {
        counter!(
            names::SWEEP_ERRORS_TOTAL,
            labels::PROCESSOR => processor.to_string(),
        )
        .increment(1);
    }

    /// Records sweep latency.
    pub fn observe_sweep_duration(&self, processor: &str, duration: Duration) {
        histogram!(
            names::SWEEP_DURATION_SECONDS,
            labels::PROCESSOR => processor.to_string(),
        )
        .record(duration.as_secs_f64());
    }

    /// Records a run event publish outcome.
    pub fn record_event_published(&self, result: &str) {
        counter!(
            names::EVENTS_PUBLISHED_TOTAL,
            labels::RESULT => result.to_string(),
        )
        .increment(1);
    }
}

/// RAII guard for timing operations.
///
/// Automatically records duration when dropped.
///
/// ## Example
///
/// ```rust,no_run
/// use tideway_controller::metrics::{ControllerMetrics, TimingGuard};
///
/// let metrics = ControllerMetrics::new();
///
/// {
///     let _guard = TimingGuard::new(|duration| {
///         metrics.observe_sweep_duration("gc", duration);
///     });
///
///     // Do work...
/// } // Duration recorded automatically on drop
/// ```
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Creates a new timing guard that will call `on_drop` with the elapsed duration.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Returns the elapsed time since the guard was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}

/// Creates a timing guard that records a sweep's duration for `processor`.
#[must_use]
pub fn time_sweep(processor: &'static str) -> TimingGuard<impl FnOnce(Duration)> {
    TimingGuard::new(move |duration| {
        histogram!(
            names::SWEEP_DURATION_SECONDS,
            labels::PROCESSOR => processor,
        )
        .record(duration.as_secs_f64());
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_a_noop() {
        let metrics = ControllerMetrics::new();
        metrics.set_queue_depth("workflow-run", 4);
        metrics.record_reconcile("pod", "delete", "success");
        metrics.observe_reconcile_duration("pod", Duration::from_millis(3));
        metrics.record_admission("queued");
        metrics.set_scope_occupancy("ci", 2, 7);
        metrics.record_timeout();
        metrics.record_gc_deletions("Pod", 3);
        metrics.record_sweep_error("gc");
        metrics.record_event_published("delivered");
    }

    #[test]
    fn timing_guard_reports_on_drop() {
        let mut recorded = None;
        {
            let _guard = TimingGuard::new(|d| recorded = Some(d));
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(recorded.is_some_and(|d| d >= Duration::from_millis(5)));
    }

    #[test]
    fn sweep_timer_records() {
        let guard = time_sweep("timeout");
        assert!(guard.elapsed() < Duration::from_secs(60));
    }
}
