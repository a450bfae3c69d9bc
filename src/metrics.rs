//! Prometheus metrics for fan-out execution
//!
//! Metrics are collected in a private registry and rendered in the text
//! exposition format once a run finishes (`--metrics-file`).
//!
//! # Available Metrics
//!
//! - `aerobench_fanout_tasks_total{phase, status}` - Counter of finished tasks
//! - `aerobench_fanout_task_duration_seconds{phase}` - Histogram of task durations
//! - `aerobench_fanout_active_tasks` - Gauge of currently running actions

use crate::error::Result;
use crate::models::TaskStatus;
use prometheus::{CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::time::Duration;

/// Histogram bucket boundaries for task durations (in seconds).
/// Installs and YCSB runs routinely take minutes.
const TASK_DURATION_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0];

/// Metrics shared by every fan-out of a run
#[derive(Clone)]
pub struct FanOutMetrics {
    registry: Registry,
    tasks_total: CounterVec,
    task_duration: HistogramVec,
    active_tasks: Gauge,
}

impl FanOutMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let tasks_total = CounterVec::new(
            Opts::new(
                "aerobench_fanout_tasks_total",
                "Total number of fan-out tasks by outcome",
            ),
            &["phase", "status"],
        )?;

        let task_duration = HistogramVec::new(
            HistogramOpts::new(
                "aerobench_fanout_task_duration_seconds",
                "Fan-out task duration in seconds",
            )
            .buckets(TASK_DURATION_BUCKETS.to_vec()),
            &["phase"],
        )?;

        let active_tasks = Gauge::with_opts(Opts::new(
            "aerobench_fanout_active_tasks",
            "Actions currently running",
        ))?;

        registry.register(Box::new(tasks_total.clone()))?;
        registry.register(Box::new(task_duration.clone()))?;
        registry.register(Box::new(active_tasks.clone()))?;

        Ok(Self {
            registry,
            tasks_total,
            task_duration,
            active_tasks,
        })
    }

    /// Record one finished task
    pub fn record_task(&self, phase: &str, status: TaskStatus, duration: Duration) {
        self.tasks_total
            .with_label_values(&[phase, &status.to_string()])
            .inc();
        self.task_duration
            .with_label_values(&[phase])
            .observe(duration.as_secs_f64());
    }

    /// Mark an action as running until the returned guard is dropped
    pub fn track_active(&self) -> ActiveTaskGuard {
        self.active_tasks.inc();
        ActiveTaskGuard {
            gauge: self.active_tasks.clone(),
        }
    }

    pub fn tasks_total(&self, phase: &str, status: TaskStatus) -> f64 {
        self.tasks_total
            .with_label_values(&[phase, &status.to_string()])
            .get()
    }

    pub fn active_tasks(&self) -> f64 {
        self.active_tasks.get()
    }

    /// Render all metrics in Prometheus text format
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| crate::error::AeroBenchError::Other(format!("metrics not UTF-8: {}", e)))
    }
}

/// Decrements the active-task gauge on drop, including when a task panics
pub struct ActiveTaskGuard {
    gauge: Gauge,
}

impl Drop for ActiveTaskGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_task_counts_by_status() {
        let metrics = FanOutMetrics::new().unwrap();
        metrics.record_task("prepare", TaskStatus::Success, Duration::from_millis(20));
        metrics.record_task("prepare", TaskStatus::Success, Duration::from_millis(30));
        metrics.record_task("prepare", TaskStatus::Failed, Duration::from_secs(2));

        assert_eq!(metrics.tasks_total("prepare", TaskStatus::Success), 2.0);
        assert_eq!(metrics.tasks_total("prepare", TaskStatus::Failed), 1.0);
        assert_eq!(metrics.tasks_total("cleanup", TaskStatus::Success), 0.0);
    }

    #[test]
    fn test_active_guard_balances_gauge() {
        let metrics = FanOutMetrics::new().unwrap();
        {
            let _a = metrics.track_active();
            let _b = metrics.track_active();
            assert_eq!(metrics.active_tasks(), 2.0);
        }
        assert_eq!(metrics.active_tasks(), 0.0);
    }

    #[test]
    fn test_render_text_format() {
        let metrics = FanOutMetrics::new().unwrap();
        metrics.record_task("cleanup", TaskStatus::Cancelled, Duration::from_secs(1));

        let text = metrics.render().unwrap();
        assert!(text.contains("aerobench_fanout_tasks_total"));
        assert!(text.contains("phase=\"cleanup\""));
        assert!(text.contains("status=\"cancelled\""));
        assert!(text.contains("aerobench_fanout_task_duration_seconds_bucket"));
    }
}
