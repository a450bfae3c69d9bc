//! The aerospike_ycsb benchmark lifecycle
//!
//! ```text
//! check_prerequisites -> prepare -> run -> cleanup
//! ```
//!
//! `prepare` starts an Aerospike cluster on the `workers` group and installs
//! YCSB on the `clients` group in a single fan-out. `run` drives YCSB from
//! every client. `cleanup` stops and removes the servers. Every phase that
//! touches hosts goes through [`FanOut`], so one slow or broken host never
//! hides the outcome of the others.

use crate::config::validate_config;
use crate::error::{AeroBenchError, Result};
use crate::fanout::{FanOut, OutcomeSet, Target, Task, DEFAULT_CANCEL_GRACE};
use crate::hosts::{total_memory_kb, HostRef, VmGroups};
use crate::metrics::FanOutMetrics;
use crate::models::{BenchmarkConfig, ExecutorSettings, Sample, CLIENTS_GROUP, WORKERS_GROUP};
use crate::packages::aerospike::{self, memory_size_kb};
use crate::packages::ycsb::{self, YcsbExecutor};
use crate::state::{ResultStore, RunStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// YCSB database binding the benchmark drives
pub const DATABASE: &str = "aerospike";

/// Everything a phase needs besides the hosts and the config
#[derive(Clone)]
pub struct PhaseContext {
    pub cancel: CancellationToken,
    /// Token for cleanup during [`execute`]; independent of `cancel` so a
    /// cancelled run still tears its servers down
    pub cleanup_cancel: CancellationToken,
    pub metrics: Option<Arc<FanOutMetrics>>,
    pub store: Option<ResultStore>,
    pub run_id: Option<String>,
    pub settings: ExecutorSettings,
}

impl PhaseContext {
    pub fn new(settings: ExecutorSettings) -> Self {
        Self {
            cancel: CancellationToken::new(),
            cleanup_cancel: CancellationToken::new(),
            metrics: None,
            store: None,
            run_id: None,
            settings,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_cleanup_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cleanup_cancel = cancel;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<FanOutMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_store(mut self, store: ResultStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Executor for one phase, configured from the shared settings
    pub fn fanout(&self, phase: &str) -> FanOut {
        FanOut::new(phase)
            .max_parallel(self.settings.max_parallel)
            .deadline(self.settings.phase_timeout_secs.map(Duration::from_secs))
            .cancel_grace(
                self.settings
                    .cancel_grace_secs
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_CANCEL_GRACE),
            )
            .cancel_token(self.cancel.clone())
            .metrics(self.metrics.clone())
    }

    /// Run one fan-out and persist its outcomes, successful or not
    pub async fn run_phase<T, R>(
        &self,
        phase: &str,
        tasks: Vec<Task<T, R>>,
    ) -> Result<OutcomeSet<T, R>>
    where
        T: Target + Clone,
        R: Send + 'static,
    {
        match self.fanout(phase).run_all(tasks).await {
            Ok(outcomes) => {
                self.record(phase, &outcomes);
                Ok(outcomes)
            }
            Err(err) => {
                self.record(phase, err.outcomes());
                Err(err.into())
            }
        }
    }

    fn record<T: Target, R>(&self, phase: &str, outcomes: &OutcomeSet<T, R>) {
        if let (Some(store), Some(run_id)) = (&self.store, &self.run_id) {
            if let Err(e) = store.record_outcomes(run_id, phase, &outcomes.summaries()) {
                warn!(phase, "Failed to record phase outcomes: {}", e);
            }
        }
    }
}

/// Validate the configuration before any host is touched
pub fn check_prerequisites(config: &BenchmarkConfig) -> Result<()> {
    validate_config(config)?;
    ycsb::check_prerequisites(&config.ycsb)
}

/// Start the Aerospike cluster and install YCSB on the clients
pub async fn prepare(
    groups: &VmGroups,
    config: &BenchmarkConfig,
    ctx: &PhaseContext,
) -> Result<YcsbExecutor> {
    let clients = groups.require(CLIENTS_GROUP)?;
    let workers = groups.require(WORKERS_GROUP)?;

    let seed_ips: Arc<Vec<String>> = Arc::new(workers.iter().map(|w| w.internal_ip()).collect());
    info!(
        workers = workers.len(),
        clients = clients.len(),
        "Preparing Aerospike cluster with seeds {:?}",
        seed_ips
    );

    let mut tasks: Vec<Task<HostRef, ()>> = Vec::with_capacity(workers.len() + clients.len());
    for worker in workers {
        let server = config.aerospike.clone();
        let seeds = seed_ips.clone();
        tasks.push(Task::new(worker.clone(), move |host: HostRef, cancel| async move {
            aerospike::configure_and_start(host.as_ref(), &server, &seeds, &cancel).await?;
            Ok::<_, anyhow::Error>(())
        }));
    }
    for client in clients {
        let loader = config.ycsb.clone();
        tasks.push(Task::new(client.clone(), move |host: HostRef, cancel| async move {
            ycsb::install(host.as_ref(), &loader, &cancel).await?;
            Ok::<_, anyhow::Error>(())
        }));
    }

    ctx.run_phase("prepare", tasks).await?;

    Ok(YcsbExecutor::new(DATABASE, config.ycsb.clone())
        .with_parameter("as.host", workers[0].internal_ip())
        .with_parameter("as.namespace", config.aerospike.namespace.clone()))
}

/// Metadata attached to every sample of a run
pub fn run_metadata(
    config: &BenchmarkConfig,
    clients: usize,
    workers: usize,
    worker_memory_kb: u64,
) -> BTreeMap<String, Value> {
    BTreeMap::from([
        ("ycsb_client_vms".to_string(), Value::from(clients)),
        ("num_vms".to_string(), Value::from(workers)),
        (
            "storage_type".to_string(),
            Value::from(config.aerospike.storage_type.to_string()),
        ),
        (
            "memory_size".to_string(),
            Value::from(memory_size_kb(
                worker_memory_kb,
                config.aerospike.memory_fraction,
            )),
        ),
        (
            "service_threads".to_string(),
            Value::from(config.aerospike.service_threads),
        ),
        (
            "replication_factor".to_string(),
            Value::from(config.aerospike.replication_factor),
        ),
    ])
}

/// Load and run every workload, returning samples tagged with run metadata
pub async fn run(
    groups: &VmGroups,
    config: &BenchmarkConfig,
    executor: &YcsbExecutor,
    ctx: &PhaseContext,
) -> Result<Vec<Sample>> {
    let clients = groups.require(CLIENTS_GROUP)?;
    let workers = groups.require(WORKERS_GROUP)?;

    let worker_memory_kb = total_memory_kb(workers[0].as_ref(), &ctx.cancel).await?;
    let metadata = run_metadata(config, clients.len(), workers.len(), worker_memory_kb);

    let mut samples = executor.load_and_run(clients, ctx).await?;
    for sample in &mut samples {
        sample
            .metadata
            .extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    Ok(samples)
}

/// Stop Aerospike on every worker and remove its installation
pub async fn cleanup(groups: &VmGroups, config: &BenchmarkConfig, ctx: &PhaseContext) -> Result<()> {
    let workers = groups.require(WORKERS_GROUP)?;
    let tasks = workers
        .iter()
        .map(|worker| {
            let server = config.aerospike.clone();
            Task::new(worker.clone(), move |host: HostRef, cancel| async move {
                aerospike::stop(host.as_ref(), &server, &cancel).await?;
                Ok::<_, anyhow::Error>(())
            })
        })
        .collect();

    ctx.run_phase("cleanup", tasks).await?;
    Ok(())
}

/// Result of a complete benchmark run
#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkReport {
    pub run_id: Option<String>,
    pub benchmark: String,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub samples: Vec<Sample>,
}

/// Run the whole lifecycle
///
/// Cleanup runs once `prepare` has started, whatever happened afterwards,
/// unless `skip_cleanup` is set. It uses `ctx.cleanup_cancel`, so cancelling
/// the run does not cancel the teardown. The first error wins; a cleanup
/// failure after an earlier failure is only logged.
pub async fn execute(
    groups: &VmGroups,
    config: &BenchmarkConfig,
    ctx: &PhaseContext,
    skip_cleanup: bool,
) -> Result<BenchmarkReport> {
    check_prerequisites(config)?;

    let mut ctx = ctx.clone();
    if let Some(store) = &ctx.store {
        ctx.run_id = Some(store.start_run(config)?);
    }
    let run_id = ctx.run_id.clone();
    info!(benchmark = %config.name, run_id = ?run_id, "Starting benchmark");

    let started_at = Utc::now();
    let start = Instant::now();

    let outcome = async {
        let executor = prepare(groups, config, &ctx).await?;
        let samples = run(groups, config, &executor, &ctx).await?;
        if let (Some(store), Some(run_id)) = (&ctx.store, &ctx.run_id) {
            store.record_samples(run_id, &samples)?;
        }
        Ok::<_, AeroBenchError>(samples)
    }
    .await;

    let cleaned = if skip_cleanup {
        info!("Skipping cleanup; Aerospike is left running on the workers");
        Ok(())
    } else {
        let cleanup_ctx = ctx.clone().with_cancel(ctx.cleanup_cancel.clone());
        cleanup(groups, config, &cleanup_ctx).await
    };

    let result = match (outcome, cleaned) {
        (Ok(samples), Ok(())) => Ok(samples),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(cleanup_err)) => {
            error!("Cleanup failed as well: {}", cleanup_err);
            Err(e)
        }
    };

    let status = match &result {
        Ok(_) => RunStatus::Succeeded,
        Err(_) if ctx.cancel.is_cancelled() => RunStatus::Cancelled,
        Err(_) => RunStatus::Failed,
    };
    if let (Some(store), Some(run_id)) = (&ctx.store, &run_id) {
        if let Err(e) = store.finish_run(run_id, status) {
            warn!("Failed to record run status: {}", e);
        }
    }
    info!(status = %status, duration = ?start.elapsed(), "Benchmark finished");

    Ok(BenchmarkReport {
        run_id,
        benchmark: config.name.clone(),
        started_at,
        duration: start.elapsed(),
        samples: result?,
    })
}
