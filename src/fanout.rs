//! Parallel fan-out of one action per target
//!
//! [`FanOut::run_all`] spawns every [`Task`] onto its own tokio task, waits
//! for all of them and returns an [`OutcomeSet`] in submission order. A
//! failing task never short-circuits the others: once everything has
//! finished, any failures are reported together in an [`AggregateError`]
//! that still carries the complete outcome set.
//!
//! # Cancellation
//!
//! Every action receives a [`CancellationToken`]. When the caller's token is
//! cancelled (or the optional deadline passes) running actions get a grace
//! period to wind down on their own; after that their futures are dropped.
//! Either way the executor joins every unit before returning, and the
//! affected tasks are reported as [`Outcome::Cancelled`].
//!
//! # Example
//!
//! ```no_run
//! use aerobench::fanout::{FanOut, Task};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let tasks = ["a", "b", "c"]
//!     .into_iter()
//!     .map(|name| {
//!         Task::new(name.to_string(), |target, _cancel| async move {
//!             Ok(target.len())
//!         })
//!     })
//!     .collect();
//!
//! let outcomes = FanOut::new("example").run_all(tasks).await?;
//! assert_eq!(outcomes.len(), 3);
//! # Ok(())
//! # }
//! ```

use crate::error::{AeroBenchError, TargetFailure};
use crate::metrics::FanOutMetrics;
use crate::models::TaskStatus;
use futures::future::{join_all, BoxFuture, FutureExt};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

/// Grace period granted to cancelled actions before they are dropped
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(10);

/// Anything an action can be run against
pub trait Target: Send + Sync + 'static {
    /// Label used in logs and failure reports
    fn label(&self) -> String;
}

impl Target for String {
    fn label(&self) -> String {
        self.clone()
    }
}

impl Target for &'static str {
    fn label(&self) -> String {
        (*self).to_string()
    }
}

impl<T: Target + ?Sized> Target for Arc<T> {
    fn label(&self) -> String {
        self.as_ref().label()
    }
}

type Action<T, R> =
    Box<dyn FnOnce(T, CancellationToken) -> BoxFuture<'static, anyhow::Result<R>> + Send>;

/// A target bound to the action to run on it
pub struct Task<T, R> {
    target: T,
    action: Action<T, R>,
}

impl<T, R> Task<T, R>
where
    T: Target + Clone,
    R: Send + 'static,
{
    pub fn new<F, Fut>(target: T, action: F) -> Self
    where
        F: FnOnce(T, CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        Self {
            target,
            action: Box::new(move |target, cancel| action(target, cancel).boxed()),
        }
    }

    pub fn target(&self) -> &T {
        &self.target
    }
}

/// What happened to a single task
#[derive(Debug)]
pub enum Outcome<R> {
    Success(R),
    Failed(anyhow::Error),
    Cancelled,
}

impl<R> Outcome<R> {
    pub fn status(&self) -> TaskStatus {
        match self {
            Outcome::Success(_) => TaskStatus::Success,
            Outcome::Failed(_) => TaskStatus::Failed,
            Outcome::Cancelled => TaskStatus::Cancelled,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn error(&self) -> Option<&anyhow::Error> {
        match self {
            Outcome::Failed(e) => Some(e),
            _ => None,
        }
    }

    pub fn value(&self) -> Option<&R> {
        match self {
            Outcome::Success(v) => Some(v),
            _ => None,
        }
    }

    fn describe_failure(&self) -> Option<String> {
        match self {
            Outcome::Success(_) => None,
            Outcome::Failed(e) => Some(format!("{:#}", e)),
            Outcome::Cancelled => Some("cancelled".to_string()),
        }
    }
}

impl<R> From<anyhow::Result<R>> for Outcome<R> {
    fn from(result: anyhow::Result<R>) -> Self {
        match result {
            Ok(value) => Outcome::Success(value),
            Err(e) => Outcome::Failed(e),
        }
    }
}

/// Outcome of one task, paired with the target it ran against
#[derive(Debug)]
pub struct TaskOutcome<T, R> {
    /// Position of the task in the submitted list
    pub index: usize,
    pub target: T,
    pub outcome: Outcome<R>,
    pub duration: Duration,
}

/// Serializable view of a task outcome, used for persistence and reports
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct OutcomeSummary {
    pub index: usize,
    pub target: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration: Duration,
}

/// All task outcomes of one fan-out, in submission order
pub struct OutcomeSet<T, R> {
    outcomes: Vec<TaskOutcome<T, R>>,
}

// Targets such as `HostRef` have no `Debug`; print labels and statuses instead
impl<T: Target, R> std::fmt::Debug for OutcomeSet<T, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(
                self.outcomes
                    .iter()
                    .map(|o| (o.target.label(), o.outcome.status())),
            )
            .finish()
    }
}

impl<T, R> Default for OutcomeSet<T, R> {
    fn default() -> Self {
        Self {
            outcomes: Vec::new(),
        }
    }
}

impl<T: Target, R> OutcomeSet<T, R> {
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskOutcome<T, R>> {
        self.outcomes.iter()
    }

    pub fn get(&self, index: usize) -> Option<&TaskOutcome<T, R>> {
        self.outcomes.get(index)
    }

    pub fn failed(&self) -> impl Iterator<Item = &TaskOutcome<T, R>> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.outcome, Outcome::Failed(_)))
    }

    pub fn cancelled(&self) -> impl Iterator<Item = &TaskOutcome<T, R>> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.outcome, Outcome::Cancelled))
    }

    pub fn failed_count(&self) -> usize {
        self.failed().count()
    }

    pub fn cancelled_count(&self) -> usize {
        self.cancelled().count()
    }

    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.outcome.is_success())
    }

    /// Every failed target with its error message; cancelled targets are not failures
    pub fn target_failures(&self) -> Vec<TargetFailure> {
        self.failed()
            .filter_map(|o| {
                o.outcome.describe_failure().map(|message| TargetFailure {
                    target: o.target.label(),
                    message,
                })
            })
            .collect()
    }

    pub fn summaries(&self) -> Vec<OutcomeSummary> {
        self.outcomes
            .iter()
            .map(|o| OutcomeSummary {
                index: o.index,
                target: o.target.label(),
                status: o.outcome.status(),
                error: o.outcome.describe_failure(),
                duration: o.duration,
            })
            .collect()
    }

    /// Successful values in submission order; failed and cancelled tasks are skipped
    pub fn into_values(self) -> Vec<R> {
        self.outcomes
            .into_iter()
            .filter_map(|o| match o.outcome {
                Outcome::Success(v) => Some(v),
                _ => None,
            })
            .collect()
    }

    pub fn into_outcomes(self) -> Vec<TaskOutcome<T, R>> {
        self.outcomes
    }
}

/// Returned by [`FanOut::run_all`] when at least one task failed or was cancelled
pub struct AggregateError<T, R> {
    phase: String,
    outcomes: OutcomeSet<T, R>,
}

impl<T: Target, R> AggregateError<T, R> {
    pub fn phase(&self) -> &str {
        &self.phase
    }

    pub fn outcomes(&self) -> &OutcomeSet<T, R> {
        &self.outcomes
    }

    pub fn into_outcomes(self) -> OutcomeSet<T, R> {
        self.outcomes
    }

    /// Tasks whose action returned an error
    pub fn failures(&self) -> impl Iterator<Item = &TaskOutcome<T, R>> {
        self.outcomes.failed()
    }

    pub fn failure_count(&self) -> usize {
        self.outcomes.failed_count()
    }

    pub fn cancelled_count(&self) -> usize {
        self.outcomes.cancelled_count()
    }

    pub fn target_failures(&self) -> Vec<TargetFailure> {
        self.outcomes.target_failures()
    }
}

impl<T: Target, R> std::fmt::Display for AggregateError<T, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} of {} task(s) failed",
            self.phase,
            self.failure_count(),
            self.outcomes.len()
        )?;
        if self.cancelled_count() > 0 {
            write!(f, ", {} cancelled", self.cancelled_count())?;
        }
        for failure in self.target_failures() {
            write!(f, "; {}", failure)?;
        }
        for cancelled in self.outcomes.cancelled() {
            write!(f, "; [{}] cancelled", cancelled.target.label())?;
        }
        Ok(())
    }
}

impl<T: Target, R> std::fmt::Debug for AggregateError<T, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateError")
            .field("phase", &self.phase)
            .field("tasks", &self.outcomes.len())
            .field("failures", &self.target_failures())
            .field("cancelled", &self.cancelled_count())
            .finish()
    }
}

impl<T: Target, R> std::error::Error for AggregateError<T, R> {}

impl<T: Target, R> From<AggregateError<T, R>> for AeroBenchError {
    fn from(err: AggregateError<T, R>) -> Self {
        AeroBenchError::Phase {
            failures: err.target_failures(),
            cancelled: err.cancelled_count(),
            phase: err.phase,
        }
    }
}

/// Runs a batch of tasks concurrently
#[derive(Clone)]
pub struct FanOut {
    phase: String,
    max_parallel: Option<usize>,
    deadline: Option<Duration>,
    cancel_grace: Duration,
    cancel: CancellationToken,
    metrics: Option<Arc<FanOutMetrics>>,
}

impl FanOut {
    /// Create an unbounded executor; `phase` labels logs, metrics and errors
    pub fn new(phase: impl Into<String>) -> Self {
        Self {
            phase: phase.into(),
            max_parallel: None,
            deadline: None,
            cancel_grace: DEFAULT_CANCEL_GRACE,
            cancel: CancellationToken::new(),
            metrics: None,
        }
    }

    pub fn max_parallel(mut self, limit: Option<usize>) -> Self {
        self.max_parallel = limit.map(|n| n.max(1));
        self
    }

    pub fn deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn metrics(mut self, metrics: Option<Arc<FanOutMetrics>>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn phase(&self) -> &str {
        &self.phase
    }

    /// Run every task concurrently and wait for all of them.
    ///
    /// Returns the full outcome set when every task succeeded, otherwise an
    /// [`AggregateError`] wrapping the same set.
    pub async fn run_all<T, R>(
        &self,
        tasks: Vec<Task<T, R>>,
    ) -> Result<OutcomeSet<T, R>, AggregateError<T, R>>
    where
        T: Target + Clone,
        R: Send + 'static,
    {
        let total = tasks.len();
        if total == 0 {
            debug!(phase = %self.phase, "No tasks to dispatch");
            return Ok(OutcomeSet::default());
        }

        let span = info_span!("fanout", phase = %self.phase, tasks = total);
        self.dispatch(tasks).instrument(span).await
    }

    /// Run the same action against every target
    pub async fn for_each<T, R, F, Fut>(
        &self,
        targets: impl IntoIterator<Item = T>,
        action: F,
    ) -> Result<OutcomeSet<T, R>, AggregateError<T, R>>
    where
        T: Target + Clone,
        R: Send + 'static,
        F: Fn(T, CancellationToken) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let tasks = targets
            .into_iter()
            .map(|target| Task::new(target, action.clone()))
            .collect();
        self.run_all(tasks).await
    }

    async fn dispatch<T, R>(
        &self,
        tasks: Vec<Task<T, R>>,
    ) -> Result<OutcomeSet<T, R>, AggregateError<T, R>>
    where
        T: Target + Clone,
        R: Send + 'static,
    {
        let total = tasks.len();
        info!("Dispatching {} task(s)", total);

        // Child token: a deadline stops this fan-out without cancelling the caller
        let cancel = self.cancel.child_token();
        let deadline_timer = self.deadline.map(|limit| {
            let token = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                warn!("Deadline of {:?} exceeded, cancelling remaining tasks", limit);
                token.cancel();
            })
        });

        let semaphore = self.max_parallel.map(|n| Arc::new(Semaphore::new(n)));

        let mut targets = Vec::with_capacity(total);
        let mut handles = Vec::with_capacity(total);
        for (index, task) in tasks.into_iter().enumerate() {
            targets.push(task.target.clone());
            let unit = Unit {
                index,
                label: task.target.label(),
                cancel: cancel.clone(),
                grace: self.cancel_grace,
                semaphore: semaphore.clone(),
                metrics: self.metrics.clone(),
            };
            handles.push(tokio::spawn(unit.run(task).in_current_span()));
        }

        let joined = join_all(handles).await;

        if let Some(timer) = deadline_timer {
            timer.abort();
        }

        let outcomes: Vec<_> = targets
            .into_iter()
            .zip(joined)
            .enumerate()
            .map(|(index, (target, joined))| {
                let (outcome, duration) = joined.unwrap_or_else(|e| {
                    warn!(index, target = %target.label(), "Task aborted: {}", e);
                    (
                        Outcome::Failed(anyhow::anyhow!("task panicked or was aborted: {}", e)),
                        Duration::ZERO,
                    )
                });
                TaskOutcome {
                    index,
                    target,
                    outcome,
                    duration,
                }
            })
            .collect();

        let set = OutcomeSet { outcomes };

        if let Some(metrics) = &self.metrics {
            for o in set.iter() {
                metrics.record_task(&self.phase, o.outcome.status(), o.duration);
            }
        }

        let failed = set.failed_count();
        let cancelled = set.cancelled_count();
        if failed == 0 && cancelled == 0 {
            info!("All {} task(s) succeeded", total);
            Ok(set)
        } else {
            warn!(failed, cancelled, "{} of {} task(s) did not succeed", failed + cancelled, total);
            Err(AggregateError {
                phase: self.phase.clone(),
                outcomes: set,
            })
        }
    }
}

/// Per-task execution unit spawned by the executor
struct Unit {
    index: usize,
    label: String,
    cancel: CancellationToken,
    grace: Duration,
    semaphore: Option<Arc<Semaphore>>,
    metrics: Option<Arc<FanOutMetrics>>,
}

impl Unit {
    async fn run<T, R>(self, task: Task<T, R>) -> (Outcome<R>, Duration)
    where
        T: Target + Clone,
        R: Send + 'static,
    {
        let _permit = match &self.semaphore {
            Some(semaphore) => tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!(index = self.index, target = %self.label, "Cancelled before start");
                    return (Outcome::Cancelled, Duration::ZERO);
                }
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            },
            None => None,
        };

        if self.cancel.is_cancelled() {
            return (Outcome::Cancelled, Duration::ZERO);
        }

        let _active = self.metrics.as_ref().map(|m| m.track_active());
        debug!(index = self.index, target = %self.label, "Task started");

        let start = Instant::now();
        let Task { target, action } = task;
        let outcome = drive(action(target, self.cancel.clone()), &self.cancel, self.grace).await;
        let duration = start.elapsed();

        match &outcome {
            Outcome::Success(_) => {
                debug!(index = self.index, target = %self.label, ?duration, "Task succeeded")
            }
            Outcome::Failed(e) => {
                warn!(index = self.index, target = %self.label, error = %format!("{:#}", e), "Task failed")
            }
            Outcome::Cancelled => {
                warn!(index = self.index, target = %self.label, "Task cancelled")
            }
        }

        (outcome, duration)
    }
}

/// Poll an action to completion, honouring cancellation with a grace period
async fn drive<R>(
    mut action: BoxFuture<'static, anyhow::Result<R>>,
    cancel: &CancellationToken,
    grace: Duration,
) -> Outcome<R> {
    tokio::select! {
        biased;
        result = &mut action => return settle(result, cancel),
        _ = cancel.cancelled() => {}
    }

    match tokio::time::timeout(grace, &mut action).await {
        // Finished its work before it noticed the cancellation
        Ok(Ok(value)) => Outcome::Success(value),
        Ok(Err(e)) => {
            debug!("Action stopped after cancellation: {:#}", e);
            Outcome::Cancelled
        }
        Err(_) => {
            debug!("Action ignored cancellation for {:?}, dropping it", grace);
            Outcome::Cancelled
        }
    }
}

/// Errors raised after cancellation, or carrying [`AeroBenchError::Cancelled`], count as cancelled
fn settle<R>(result: anyhow::Result<R>, cancel: &CancellationToken) -> Outcome<R> {
    match result {
        Ok(value) => Outcome::Success(value),
        Err(e) if cancel.is_cancelled() || is_cancellation(&e) => {
            debug!("Action stopped on cancellation: {:#}", e);
            Outcome::Cancelled
        }
        Err(e) => Outcome::Failed(e),
    }
}

fn is_cancellation(e: &anyhow::Error) -> bool {
    e.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<AeroBenchError>(),
            Some(AeroBenchError::Cancelled)
        )
    })
}
