//! CLI interface for aerobench

use crate::benchmark::{check_prerequisites, cleanup, execute, PhaseContext};
use crate::config::{apply_overrides, build_groups, load_config, validate_config, Overrides};
use crate::error::AeroBenchError;
use crate::fanout::Outcome;
use crate::hosts::{run_checked, HostRef};
use crate::logging::{init_logging, LogConfig, LogFormat, LogLevel};
use crate::metrics::FanOutMetrics;
use crate::models::{BenchmarkConfig, DataDiskType, StorageType, CLIENTS_GROUP, WORKERS_GROUP};
use crate::state::ResultStore;
use crate::templates;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// aerobench - Aerospike + YCSB benchmark driver
#[derive(Parser, Debug)]
#[command(name = "aerobench")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run YCSB against an Aerospike cluster", long_about = None)]
pub struct Cli {
    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty", global = true)]
    pub log_format: String,

    /// Database path for run history and samples
    #[arg(long = "db", default_value = "aerobench.db", global = true)]
    pub db_path: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the full benchmark: prepare, run, cleanup
    Run {
        #[command(flatten)]
        config: ConfigArgs,

        /// Leave Aerospike running on the workers afterwards
        #[arg(long)]
        skip_cleanup: bool,

        /// Write the JSON report to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Write Prometheus metrics for the run to a file
        #[arg(long)]
        metrics_file: Option<PathBuf>,
    },

    /// Validate the effective configuration without touching any host
    Validate {
        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Print the effective configuration as YAML
    ShowConfig {
        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Run an ad-hoc command on every host of a group
    Exec {
        #[command(flatten)]
        config: ConfigArgs,

        /// Host group (workers or clients)
        #[arg(short, long)]
        group: String,

        /// Command to run, after `--`
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Stop and remove Aerospike on the workers
    Cleanup {
        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Show recent benchmark runs
    History {
        /// Number of records to show
        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,
    },

    /// Show the samples and phase outcomes of a run
    Samples {
        /// Run ID (see `aerobench history`)
        #[arg(long)]
        run: String,
    },

    /// Generate example cluster configurations
    Template {
        /// Template type (omit to list available templates)
        #[arg(short = 't', long = "type")]
        template_type: Option<TemplateType>,

        /// Write output to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Config file plus the command-line overrides layered on top of it
#[derive(Args, Debug, Clone, Default)]
pub struct ConfigArgs {
    /// Path to the cluster YAML file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Machine type for the Aerospike servers, on every cloud
    #[arg(long)]
    pub server_machine_type: Option<String>,

    /// Machine type for the YCSB clients, on every cloud
    #[arg(long)]
    pub client_machine_type: Option<String>,

    /// Number of Aerospike servers
    #[arg(long)]
    pub aerospike_vms: Option<usize>,

    /// Number of YCSB client VMs
    #[arg(long)]
    pub ycsb_client_vms: Option<usize>,

    /// Where Aerospike keeps namespace data
    #[arg(long, value_enum)]
    pub storage_type: Option<StorageArg>,

    /// Disk type backing the servers' data disks
    #[arg(long, value_enum)]
    pub data_disk_type: Option<DiskTypeArg>,

    /// Maximum number of hosts acted on at once
    #[arg(long)]
    pub max_parallel: Option<usize>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StorageArg {
    Memory,
    Disk,
}

impl From<StorageArg> for StorageType {
    fn from(arg: StorageArg) -> Self {
        match arg {
            StorageArg::Memory => StorageType::Memory,
            StorageArg::Disk => StorageType::Disk,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum DiskTypeArg {
    Local,
    Persistent,
}

impl From<DiskTypeArg> for DataDiskType {
    fn from(arg: DiskTypeArg) -> Self {
        match arg {
            DiskTypeArg::Local => DataDiskType::Local,
            DiskTypeArg::Persistent => DataDiskType::Persistent,
        }
    }
}

/// Available template types for the `template` subcommand.
#[derive(Debug, Clone, ValueEnum)]
pub enum TemplateType {
    /// Everything on this machine
    Local,
    /// Servers and clients over SSH
    Ssh,
    /// Disk-backed namespace
    Disk,
}

impl ConfigArgs {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            server_machine_type: self.server_machine_type.clone(),
            client_machine_type: self.client_machine_type.clone(),
            aerospike_vms: self.aerospike_vms,
            ycsb_client_vms: self.ycsb_client_vms,
            storage_type: self.storage_type.map(Into::into),
            data_disk_type: self.data_disk_type.map(Into::into),
            max_parallel: self.max_parallel,
        }
    }

    /// Load every config layer and apply the overrides
    pub fn load(&self) -> anyhow::Result<BenchmarkConfig> {
        let mut config = load_config(self.config.as_deref())?;
        apply_overrides(&mut config, &self.overrides());
        Ok(config)
    }
}

impl Cli {
    /// Initialize logging based on CLI arguments
    pub fn init_logging(&self) -> anyhow::Result<()> {
        let config = LogConfig {
            level: LogLevel::from(self.log_level.as_str()),
            format: LogFormat::from(self.log_format.as_str()),
        };

        init_logging(&config)
    }

    /// Execute the CLI command
    pub async fn execute(&self) -> anyhow::Result<()> {
        match &self.command {
            Commands::Run {
                config,
                skip_cleanup,
                output,
                metrics_file,
            } => {
                self.run_benchmark(config, *skip_cleanup, output.as_deref(), metrics_file.as_deref())
                    .await?;
            }
            Commands::Validate { config } => {
                self.validate(config)?;
            }
            Commands::ShowConfig { config } => {
                print!("{}", serde_yaml::to_string(&config.load()?)?);
            }
            Commands::Exec {
                config,
                group,
                command,
            } => {
                self.exec_command(config, group, command).await?;
            }
            Commands::Cleanup { config } => {
                self.cleanup(config).await?;
            }
            Commands::History { limit } => {
                self.show_history(*limit)?;
            }
            Commands::Samples { run } => {
                self.show_samples(run)?;
            }
            Commands::Template {
                template_type,
                output,
            } => {
                self.handle_template(template_type.as_ref(), output.as_ref())?;
            }
        }
        Ok(())
    }

    /// Run the whole benchmark lifecycle once
    async fn run_benchmark(
        &self,
        args: &ConfigArgs,
        skip_cleanup: bool,
        output: Option<&Path>,
        metrics_file: Option<&Path>,
    ) -> anyhow::Result<()> {
        let config = args.load()?;
        check_prerequisites(&config)?;

        let store = ResultStore::open(&self.db_path)?;
        let interrupted = store.recover_interrupted()?;
        if !interrupted.is_empty() {
            warn!("Marked {} interrupted run(s) as failed", interrupted.len());
        }

        let groups = build_groups(&config)?;
        let metrics = Arc::new(FanOutMetrics::new()?);
        let cancel = CancellationToken::new();
        let cleanup_cancel = CancellationToken::new();
        watch_signals(cancel.clone(), Some(cleanup_cancel.clone()))?;

        let ctx = PhaseContext::new(config.executor.clone())
            .with_cancel(cancel)
            .with_cleanup_cancel(cleanup_cancel)
            .with_metrics(metrics.clone())
            .with_store(store);

        let result = execute(&groups, &config, &ctx, skip_cleanup).await;

        if let Some(path) = metrics_file {
            std::fs::write(path, metrics.render()?)?;
            info!("Metrics written to {}", path.display());
        }

        let report = serde_json::to_string_pretty(&result?)?;
        match output {
            Some(path) => {
                std::fs::write(path, report)?;
                println!("Report written to {}", path.display());
            }
            None => println!("{report}"),
        }
        Ok(())
    }

    /// Validate a configuration without touching any host
    fn validate(&self, args: &ConfigArgs) -> anyhow::Result<()> {
        let config = args.load()?;
        check_prerequisites(&config)?;

        let workers = &config.vm_groups.workers;
        let clients = &config.vm_groups.clients;
        info!("Configuration '{}' is valid", config.name);

        println!("Configuration '{}' is valid", config.name);
        println!("{}: {} host(s)", WORKERS_GROUP, workers.hosts.len());
        println!("{}: {} host(s)", CLIENTS_GROUP, clients.hosts.len());
        println!("Storage: {}", config.aerospike.storage_type);
        println!("Workloads: {}", config.ycsb.workloads.join(", "));

        Ok(())
    }

    /// Run an ad-hoc command on one group and report every host
    async fn exec_command(
        &self,
        args: &ConfigArgs,
        group: &str,
        command: &[String],
    ) -> anyhow::Result<()> {
        let config = args.load()?;
        validate_config(&config)?;
        let groups = build_groups(&config)?;
        let hosts = groups.require(group)?.to_vec();

        let cancel = CancellationToken::new();
        watch_signals(cancel.clone(), None)?;
        let ctx = PhaseContext::new(config.executor.clone()).with_cancel(cancel);

        let command = Arc::new(command.join(" "));
        let result = ctx
            .fanout("exec")
            .for_each(hosts, move |host: HostRef, cancel| {
                let command = command.clone();
                async move { Ok::<_, anyhow::Error>(run_checked(host.as_ref(), &command, &cancel).await?) }
            })
            .await;

        let outcomes = match &result {
            Ok(outcomes) => outcomes,
            Err(err) => err.outcomes(),
        };
        for task in outcomes.iter() {
            let name = task.target.name();
            match &task.outcome {
                Outcome::Success(output) => {
                    println!("[{}] ok ({:?})", name, task.duration);
                    print!("{}", output.stdout);
                }
                Outcome::Failed(e) => println!("[{}] failed: {:#}", name, e),
                Outcome::Cancelled => println!("[{}] cancelled", name),
            }
        }

        result.map_err(AeroBenchError::from)?;
        Ok(())
    }

    /// Stop Aerospike on every worker, e.g. after `run --skip-cleanup`
    async fn cleanup(&self, args: &ConfigArgs) -> anyhow::Result<()> {
        let config = args.load()?;
        validate_config(&config)?;
        let groups = build_groups(&config)?;

        let cancel = CancellationToken::new();
        watch_signals(cancel.clone(), None)?;
        let ctx = PhaseContext::new(config.executor.clone()).with_cancel(cancel);

        cleanup(&groups, &config, &ctx).await?;
        println!("Aerospike stopped on {} worker(s)", groups.get(WORKERS_GROUP).len());
        Ok(())
    }

    /// Show recent runs, newest first
    fn show_history(&self, limit: usize) -> anyhow::Result<()> {
        let store = ResultStore::open(&self.db_path)?;
        let runs = store.list_runs(limit)?;

        if runs.is_empty() {
            println!("No runs found");
            return Ok(());
        }

        println!(
            "{:<38} {:<18} {:<20} {:<10} {:<12}",
            "ID", "Benchmark", "Started", "Status", "Duration"
        );
        println!("{:-<100}", "");

        for run in &runs {
            let started = run
                .started_at
                .with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S");
            let duration = run
                .completed_at
                .map(|completed| format_duration((completed - run.started_at).num_seconds()))
                .unwrap_or_else(|| "N/A".to_string());

            println!(
                "{:<38} {:<18} {:<20} {:<10} {:<12}",
                run.id,
                run.benchmark,
                started,
                run.status.to_string(),
                duration
            );
        }

        Ok(())
    }

    /// Show the samples and per-host phase outcomes of one run
    fn show_samples(&self, run_id: &str) -> anyhow::Result<()> {
        let store = ResultStore::open(&self.db_path)?;
        let run = store
            .get_run(run_id)?
            .ok_or_else(|| anyhow::anyhow!("Run '{}' not found", run_id))?;

        println!("Run {} ({}, {})", run.id, run.benchmark, run.status);
        println!();

        let samples = store.get_samples(run_id)?;
        if samples.is_empty() {
            println!("No samples recorded");
        } else {
            println!("{:<40} {:>16} {:<12}", "Metric", "Value", "Unit");
            println!("{:-<70}", "");
            for sample in &samples {
                println!("{:<40} {:>16.2} {:<12}", sample.metric, sample.value, sample.unit);
            }
        }

        let outcomes = store.get_outcomes(run_id)?;
        if !outcomes.is_empty() {
            println!();
            println!("{:<20} {:<24} {:<10} {}", "Phase", "Host", "Status", "Error");
            println!("{:-<80}", "");
            for record in &outcomes {
                println!(
                    "{:<20} {:<24} {:<10} {}",
                    record.phase,
                    record.outcome.target,
                    record.outcome.status.to_string(),
                    record.outcome.error.as_deref().unwrap_or("")
                );
            }
        }

        Ok(())
    }

    /// Handle the `template` subcommand.
    fn handle_template(
        &self,
        template_type: Option<&TemplateType>,
        output: Option<&PathBuf>,
    ) -> anyhow::Result<()> {
        let Some(tt) = template_type else {
            println!("Available templates:\n");
            let header_type = "TYPE";
            let header_desc = "DESCRIPTION";
            println!("{header_type:<12} {header_desc}");
            println!("{}", "-".repeat(60));
            for info in templates::list_templates() {
                println!("{:<12} {}", info.name, info.description);
            }
            println!();
            println!("Usage: aerobench template --type <TYPE> [-o <FILE>]");
            return Ok(());
        };

        let type_name = match tt {
            TemplateType::Local => "local",
            TemplateType::Ssh => "ssh",
            TemplateType::Disk => "disk",
        };

        let content = templates::get_template(type_name)
            .ok_or_else(|| anyhow::anyhow!("Unknown template type: {}", type_name))?;

        if let Some(path) = output {
            use std::fs::OpenOptions;
            use std::io::Write as _;
            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
                .map_err(|e| {
                    if e.kind() == std::io::ErrorKind::AlreadyExists {
                        anyhow::anyhow!(
                            "File '{}' already exists. Remove it first or choose a different name.",
                            path.display()
                        )
                    } else {
                        e.into()
                    }
                })?;
            file.write_all(content.as_bytes())?;
            println!("Template written to {}", path.display());
        } else {
            print!("{content}");
        }

        Ok(())
    }
}

/// Cancel `cancel` on the first SIGINT or SIGTERM and `cleanup`, if given,
/// on the second
fn watch_signals(
    cancel: CancellationToken,
    cleanup: Option<CancellationToken>,
) -> anyhow::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| AeroBenchError::Other(format!("Failed to setup SIGTERM handler: {}", e)))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| AeroBenchError::Other(format!("Failed to setup SIGINT handler: {}", e)))?;

    tokio::spawn(async move {
        for token in std::iter::once(cancel).chain(cleanup) {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = sigint.recv() => info!("Received SIGINT"),
            }
            token.cancel();
            warn!("Cancelling; signal again to cancel the next stage");
        }
    });
    Ok(())
}

/// Format duration in seconds to human-readable string
fn format_duration(seconds: i64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!(
            "{}h {}m {}s",
            seconds / 3600,
            (seconds % 3600) / 60,
            seconds % 60
        )
    }
}
