//! YCSB load generator
//!
//! Every client host runs its own YCSB process. The load stage splits the
//! key space between the clients with `insertstart`/`insertcount`; the run
//! stage splits the operation count. Results from all clients of a stage
//! are combined into one set of samples.
//!
//! YCSB reports one `[GROUP], Statistic(unit), value` line per statistic:
//!
//! ```text
//! [OVERALL], RunTime(ms), 10110
//! [OVERALL], Throughput(ops/sec), 98.91
//! [READ], Operations, 511
//! [READ], AverageLatency(us), 423.3
//! [READ], Return=OK, 511
//! ```

use crate::benchmark::PhaseContext;
use crate::error::{AeroBenchError, Result};
use crate::fanout::Task;
use crate::hosts::{run_checked, Host, HostRef};
use crate::models::{Sample, YcsbConfig};
use crate::packages::{apt_install, install_retry};
use crate::retry::retry_with_backoff;
use serde_json::Value;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Core workloads shipped with YCSB
pub const KNOWN_WORKLOADS: &[&str] = &[
    "workloada",
    "workloadb",
    "workloadc",
    "workloadd",
    "workloade",
    "workloadf",
];

const JAVA_PACKAGES: &[&str] = &["default-jdk-headless", "curl"];

pub fn release_url(version: &str) -> String {
    format!(
        "https://github.com/brianfrankcooper/YCSB/releases/download/{0}/ycsb-{0}.tar.gz",
        version
    )
}

/// Reject settings YCSB cannot run with
pub fn check_prerequisites(config: &YcsbConfig) -> Result<()> {
    if config.workloads.is_empty() {
        return Err(AeroBenchError::Validation(
            "at least one YCSB workload is required".to_string(),
        ));
    }
    for workload in &config.workloads {
        if !KNOWN_WORKLOADS.contains(&workload.as_str()) {
            return Err(AeroBenchError::Validation(format!(
                "unknown YCSB workload '{}' (expected one of {})",
                workload,
                KNOWN_WORKLOADS.join(", ")
            )));
        }
    }
    if config.record_count == 0 || config.operation_count == 0 {
        return Err(AeroBenchError::Validation(
            "YCSB record and operation counts must be positive".to_string(),
        ));
    }
    if config.threads_per_client == 0 {
        return Err(AeroBenchError::Validation(
            "YCSB needs at least one thread per client".to_string(),
        ));
    }
    for property in &config.properties {
        if !property.contains('=') {
            return Err(AeroBenchError::Validation(format!(
                "YCSB property '{}' is not of the form key=value",
                property
            )));
        }
    }
    Ok(())
}

/// Install a JDK and unpack the YCSB release into the install dir
pub async fn install(host: &dyn Host, config: &YcsbConfig, cancel: &CancellationToken) -> Result<()> {
    info!(host = %host.name(), version = %config.version, "Installing YCSB");
    apt_install(host, JAVA_PACKAGES, cancel).await?;

    let download = format!(
        "mkdir -p {dir} && curl -fsSL {url} | tar -xzf - -C {dir} --strip-components=1",
        dir = config.install_dir,
        url = release_url(&config.version)
    );
    let download = download.as_str();
    let operation = format!("YCSB download on {}", host.name());
    retry_with_backoff(&install_retry(), &operation, cancel, || {
        run_checked(host, download, cancel)
    })
    .await?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Load,
    Run,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Load => write!(f, "load"),
            Stage::Run => write!(f, "run"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Statistic {
    pub value: f64,
    pub unit: String,
}

/// Parsed YCSB report: group (lower-cased) to statistic name to value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct YcsbResult {
    pub groups: BTreeMap<String, BTreeMap<String, Statistic>>,
}

impl YcsbResult {
    pub fn get(&self, group: &str, statistic: &str) -> Option<f64> {
        self.groups
            .get(group)
            .and_then(|stats| stats.get(statistic))
            .map(|s| s.value)
    }

    /// One sample per statistic, named `"<group> <statistic>"`
    pub fn to_samples(&self, metadata: &BTreeMap<String, Value>) -> Vec<Sample> {
        let mut samples = Vec::new();
        for (group, stats) in &self.groups {
            for (name, stat) in stats {
                let mut sample = Sample::new(format!("{} {}", group, name), stat.value, &stat.unit);
                sample.metadata = metadata.clone();
                samples.push(sample);
            }
        }
        samples
    }
}

/// Split `Throughput(ops/sec)` into `("Throughput", "ops/sec")`
fn split_unit(statistic: &str) -> (&str, &str) {
    match statistic.split_once('(') {
        Some((name, rest)) => (name, rest.trim_end_matches(')')),
        None => (statistic, ""),
    }
}

/// Parse the summary YCSB prints on stdout
///
/// Per-return-code counters and histogram buckets are skipped.
pub fn parse_output(output: &str) -> Result<YcsbResult> {
    let mut result = YcsbResult::default();

    for line in output.lines().map(str::trim) {
        if !line.starts_with('[') {
            continue;
        }
        let parts: Vec<&str> = line.splitn(3, ',').map(str::trim).collect();
        let [group, statistic, value] = parts.as_slice() else {
            debug!("Skipping malformed YCSB line: {}", line);
            continue;
        };

        if statistic.starts_with("Return=")
            || statistic.starts_with('>')
            || statistic.parse::<u64>().is_ok()
        {
            continue;
        }

        let group = group.trim_start_matches('[').trim_end_matches(']').to_lowercase();
        let value: f64 = value
            .parse()
            .map_err(|_| AeroBenchError::YcsbParse(format!("invalid value in line '{}'", line)))?;
        // YCSB prints NaN latencies for operations that never ran
        if !value.is_finite() {
            debug!("Skipping non-finite YCSB value: {}", line);
            continue;
        }
        let (name, unit) = split_unit(statistic);

        result.groups.entry(group).or_default().insert(
            name.to_string(),
            Statistic {
                value,
                unit: unit.to_string(),
            },
        );
    }

    if !result.groups.contains_key("overall") {
        return Err(AeroBenchError::YcsbParse(
            "no [OVERALL] section in YCSB output".to_string(),
        ));
    }
    Ok(result)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Combine {
    Sum,
    WeightedMean,
    Max,
    Min,
    Mean,
}

fn combine_rule(statistic: &str) -> Combine {
    match statistic {
        "Operations" | "Throughput" => Combine::Sum,
        "AverageLatency" => Combine::WeightedMean,
        "MaxLatency" | "RunTime" => Combine::Max,
        "MinLatency" => Combine::Min,
        s if s.ends_with("PercentileLatency") => Combine::Max,
        _ => Combine::Mean,
    }
}

/// Merge the reports of clients that ran the same stage concurrently
///
/// Operations and throughput add up and average latency is weighted by
/// each client's operation count. Max and percentile latencies and the run
/// time take the slowest client, min latency the fastest.
pub fn combine(results: &[YcsbResult]) -> YcsbResult {
    // (value, operations of that client's group)
    let mut collected: BTreeMap<(&str, &str), Vec<(f64, f64)>> = BTreeMap::new();
    let mut units: BTreeMap<(&str, &str), &str> = BTreeMap::new();

    for result in results {
        for (group, stats) in &result.groups {
            let weight = stats.get("Operations").map(|s| s.value).unwrap_or(0.0);
            for (name, stat) in stats {
                let key = (group.as_str(), name.as_str());
                collected.entry(key).or_default().push((stat.value, weight));
                units.entry(key).or_insert(stat.unit.as_str());
            }
        }
    }

    let mut combined = YcsbResult::default();
    for ((group, name), values) in collected {
        let value = match combine_rule(name) {
            Combine::Sum => values.iter().map(|(v, _)| v).sum(),
            Combine::Max => values.iter().map(|(v, _)| *v).fold(f64::MIN, f64::max),
            Combine::Min => values.iter().map(|(v, _)| *v).fold(f64::MAX, f64::min),
            Combine::Mean => mean(&values),
            Combine::WeightedMean => {
                let total: f64 = values.iter().map(|(_, w)| w).sum();
                if total > 0.0 {
                    values.iter().map(|(v, w)| v * w).sum::<f64>() / total
                } else {
                    mean(&values)
                }
            }
        };
        let unit = units.get(&(group, name)).copied().unwrap_or_default();
        combined.groups.entry(group.to_string()).or_default().insert(
            name.to_string(),
            Statistic {
                value,
                unit: unit.to_string(),
            },
        );
    }
    combined
}

fn mean(values: &[(f64, f64)]) -> f64 {
    values.iter().map(|(v, _)| v).sum::<f64>() / values.len() as f64
}

/// Drives YCSB on a set of client hosts against one database binding
#[derive(Debug, Clone)]
pub struct YcsbExecutor {
    /// YCSB database binding, e.g. `aerospike`
    pub database: String,
    /// `-p` properties every invocation gets, e.g. `as.host`
    pub parameters: BTreeMap<String, String>,
    pub config: YcsbConfig,
}

impl YcsbExecutor {
    pub fn new(database: impl Into<String>, config: YcsbConfig) -> Self {
        Self {
            database: database.into(),
            parameters: BTreeMap::new(),
            config,
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Full shell command for one YCSB invocation
    pub fn command(&self, stage: Stage, workload: &str, extra: &[(&str, u64)]) -> String {
        let dir = &self.config.install_dir;
        let mut command = format!(
            "{dir}/bin/ycsb.sh {stage} {db} -s -P {dir}/workloads/{workload} -threads {threads} -p recordcount={records}",
            dir = dir,
            stage = stage,
            db = self.database,
            workload = workload,
            threads = self.config.threads_per_client,
            records = self.config.record_count,
        );
        for (key, value) in &self.parameters {
            command.push_str(&format!(" -p {}={}", key, value));
        }
        for property in &self.config.properties {
            command.push_str(&format!(" -p {}", property));
        }
        for (key, value) in extra {
            command.push_str(&format!(" -p {}={}", key, value));
        }
        command
    }

    /// `(insertstart, insertcount)` per client; the last one takes the remainder
    pub fn load_ranges(&self, clients: usize) -> Vec<(u64, u64)> {
        if clients == 0 {
            return Vec::new();
        }
        let clients = clients as u64;
        let per_client = self.config.record_count / clients;
        (0..clients)
            .map(|i| {
                let start = i * per_client;
                let count = if i == clients - 1 {
                    self.config.record_count - start
                } else {
                    per_client
                };
                (start, count)
            })
            .collect()
    }

    pub fn operations_per_client(&self, clients: usize) -> u64 {
        (self.config.operation_count / clients.max(1) as u64).max(1)
    }

    /// Load the database, then run every workload, from all clients at once
    pub async fn load_and_run(&self, clients: &[HostRef], ctx: &PhaseContext) -> Result<Vec<Sample>> {
        if clients.is_empty() {
            return Err(AeroBenchError::Validation("YCSB needs at least one client".to_string()));
        }
        if self.config.record_count < clients.len() as u64 {
            return Err(AeroBenchError::Validation(format!(
                "record_count {} cannot be split across {} clients",
                self.config.record_count,
                clients.len()
            )));
        }
        let first_workload = self
            .config
            .workloads
            .first()
            .ok_or_else(|| AeroBenchError::Validation("no YCSB workloads configured".to_string()))?;

        let mut samples = Vec::new();

        let commands = self
            .load_ranges(clients.len())
            .into_iter()
            .map(|(start, count)| {
                self.command(
                    Stage::Load,
                    first_workload,
                    &[("insertstart", start), ("insertcount", count)],
                )
            })
            .collect();
        let loaded = self.stage(clients, "ycsb-load", commands, ctx).await?;
        samples.extend(loaded.to_samples(&stage_metadata(Stage::Load, first_workload, clients.len())));

        let operations = self.operations_per_client(clients.len());
        for workload in &self.config.workloads {
            let command = self.command(Stage::Run, workload, &[("operationcount", operations)]);
            let commands = vec![command; clients.len()];
            let phase = format!("ycsb-run-{}", workload);
            let result = self.stage(clients, &phase, commands, ctx).await?;
            samples.extend(result.to_samples(&stage_metadata(Stage::Run, workload, clients.len())));
        }

        info!(samples = samples.len(), "YCSB finished");
        Ok(samples)
    }

    /// Run one command per client in a single fan-out and combine the reports
    async fn stage(
        &self,
        clients: &[HostRef],
        phase: &str,
        commands: Vec<String>,
        ctx: &PhaseContext,
    ) -> Result<YcsbResult> {
        let tasks = clients
            .iter()
            .cloned()
            .zip(commands)
            .map(|(host, command)| {
                Task::new(host, move |host: HostRef, cancel| async move {
                    let output = run_checked(host.as_ref(), &command, &cancel).await?;
                    Ok::<_, anyhow::Error>(parse_output(&output.stdout)?)
                })
            })
            .collect();

        let outcomes = ctx.run_phase(phase, tasks).await?;
        Ok(combine(&outcomes.into_values()))
    }
}

fn stage_metadata(stage: Stage, workload: &str, clients: usize) -> BTreeMap<String, Value> {
    BTreeMap::from([
        ("stage".to_string(), Value::from(stage.to_string())),
        ("workload".to_string(), Value::from(workload)),
        ("clients".to_string(), Value::from(clients)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hosts::testing::{output, scripted};
    use crate::models::ExecutorSettings;
    use std::sync::Arc;

    const CLIENT_OUTPUT: &str = "\
Loading workload...
[OVERALL], RunTime(ms), 10000
[OVERALL], Throughput(ops/sec), 100.0
[READ], Operations, 300
[READ], AverageLatency(us), 200.0
[READ], MinLatency(us), 50
[READ], MaxLatency(us), 9000
[READ], 95thPercentileLatency(us), 400
[READ], Return=OK, 300
[READ], 0, 120
[READ], >1000, 3
";

    fn executor(record_count: u64) -> YcsbExecutor {
        YcsbExecutor::new(
            "aerospike",
            YcsbConfig {
                record_count,
                operation_count: 1000,
                ..Default::default()
            },
        )
        .with_parameter("as.host", "10.0.0.1")
        .with_parameter("as.namespace", "test")
    }

    fn stat(value: f64, unit: &str) -> Statistic {
        Statistic {
            value,
            unit: unit.to_string(),
        }
    }

    #[test]
    fn test_parse_output() {
        let result = parse_output(CLIENT_OUTPUT).unwrap();
        assert_eq!(result.get("overall", "RunTime"), Some(10000.0));
        assert_eq!(result.groups["overall"]["Throughput"], stat(100.0, "ops/sec"));
        assert_eq!(result.get("read", "Operations"), Some(300.0));
        assert_eq!(result.groups["read"]["AverageLatency"].unit, "us");
        assert_eq!(result.get("read", "95thPercentileLatency"), Some(400.0));
        assert!(result.get("read", "Return=OK").is_none());
        assert!(result.get("read", "0").is_none());
        assert_eq!(result.groups["read"].len(), 5);
    }

    #[test]
    fn test_parse_output_requires_overall() {
        let err = parse_output("[READ], Operations, 10\n").unwrap_err();
        assert!(matches!(err, AeroBenchError::YcsbParse(_)));
        assert!(parse_output("").is_err());
    }

    #[test]
    fn test_parse_output_rejects_bad_value() {
        let err = parse_output("[OVERALL], RunTime(ms), soon\n").unwrap_err();
        assert!(err.to_string().contains("RunTime"));
    }

    #[test]
    fn test_parse_output_skips_non_finite_values() {
        let result = parse_output(
            "[OVERALL], RunTime(ms), 1000\n\
             [UPDATE], Operations, 0\n\
             [UPDATE], AverageLatency(us), NaN\n\
             [UPDATE], MinLatency(us), inf\n",
        )
        .unwrap();
        assert_eq!(result.get("update", "Operations"), Some(0.0));
        assert!(result.get("update", "AverageLatency").is_none());
        assert!(result.get("update", "MinLatency").is_none());
        assert!(result
            .to_samples(&BTreeMap::new())
            .iter()
            .all(|s| s.value.is_finite()));
    }

    #[test]
    fn test_combine_across_clients() {
        let a = parse_output(CLIENT_OUTPUT).unwrap();
        let b = parse_output(
            "[OVERALL], RunTime(ms), 12000\n\
             [OVERALL], Throughput(ops/sec), 50.0\n\
             [READ], Operations, 100\n\
             [READ], AverageLatency(us), 600.0\n\
             [READ], MinLatency(us), 20\n\
             [READ], MaxLatency(us), 5000\n\
             [READ], 95thPercentileLatency(us), 700\n",
        )
        .unwrap();

        let combined = combine(&[a, b]);
        assert_eq!(combined.get("overall", "Throughput"), Some(150.0));
        assert_eq!(combined.get("overall", "RunTime"), Some(12000.0));
        assert_eq!(combined.get("read", "Operations"), Some(400.0));
        // (200 * 300 + 600 * 100) / 400
        assert_eq!(combined.get("read", "AverageLatency"), Some(300.0));
        assert_eq!(combined.get("read", "MinLatency"), Some(20.0));
        assert_eq!(combined.get("read", "MaxLatency"), Some(9000.0));
        assert_eq!(combined.get("read", "95thPercentileLatency"), Some(700.0));
        assert_eq!(combined.groups["overall"]["Throughput"].unit, "ops/sec");
    }

    #[test]
    fn test_combine_single_client_is_identity() {
        let a = parse_output(CLIENT_OUTPUT).unwrap();
        assert_eq!(combine(&[a.clone()]), a);
    }

    #[test]
    fn test_samples_named_by_group() {
        let result = parse_output(CLIENT_OUTPUT).unwrap();
        let samples = result.to_samples(&stage_metadata(Stage::Run, "workloada", 2));
        let throughput = samples
            .iter()
            .find(|s| s.metric == "overall Throughput")
            .unwrap();
        assert_eq!(throughput.unit, "ops/sec");
        assert_eq!(throughput.metadata["stage"], "run");
        assert_eq!(throughput.metadata["workload"], "workloada");
        assert!(samples.iter().any(|s| s.metric == "read AverageLatency"));
    }

    #[test]
    fn test_load_ranges_cover_every_record() {
        let ranges = executor(10).load_ranges(3);
        assert_eq!(ranges, vec![(0, 3), (3, 3), (6, 4)]);
        assert_eq!(executor(1000).operations_per_client(3), 333);
    }

    #[test]
    fn test_no_clients_get_no_ranges() {
        assert!(executor(10).load_ranges(0).is_empty());
        assert_eq!(executor(1000).operations_per_client(0), 1000);
    }

    #[test]
    fn test_command_line() {
        let mut exec = executor(500);
        exec.config.properties = vec!["as.timeout=1000".to_string()];
        let command = exec.command(Stage::Load, "workloada", &[("insertstart", 0), ("insertcount", 250)]);
        assert!(command.starts_with("ycsb/bin/ycsb.sh load aerospike -s -P ycsb/workloads/workloada"));
        assert!(command.contains("-threads 32"));
        assert!(command.contains("-p recordcount=500"));
        assert!(command.contains("-p as.host=10.0.0.1"));
        assert!(command.contains("-p as.namespace=test"));
        assert!(command.contains("-p as.timeout=1000"));
        assert!(command.ends_with("-p insertstart=0 -p insertcount=250"));
    }

    #[test]
    fn test_check_prerequisites() {
        assert!(check_prerequisites(&YcsbConfig::default()).is_ok());

        let config = YcsbConfig {
            workloads: vec!["workloadz".to_string()],
            ..Default::default()
        };
        assert!(check_prerequisites(&config).is_err());

        let config = YcsbConfig {
            record_count: 0,
            ..Default::default()
        };
        assert!(check_prerequisites(&config).is_err());

        let config = YcsbConfig {
            properties: vec!["novalue".to_string()],
            ..Default::default()
        };
        assert!(check_prerequisites(&config).is_err());
    }

    #[tokio::test]
    async fn test_install_downloads_release() {
        let (host, recorder) = scripted("c0", "10.0.1.1", |_| output(0, "", ""));
        install(&host, &YcsbConfig::default(), &CancellationToken::new())
            .await
            .unwrap();

        let commands = recorder.commands();
        assert!(commands[0].contains("default-jdk-headless"));
        assert!(commands[1].contains(&release_url("0.17.0")));
        assert!(commands[1].contains("tar -xzf - -C ycsb"));
    }

    #[tokio::test]
    async fn test_load_and_run_splits_work_between_clients() {
        let mut clients: Vec<HostRef> = Vec::new();
        let mut recorders = Vec::new();
        for (name, ip) in [("c0", "10.0.1.1"), ("c1", "10.0.1.2")] {
            let (host, recorder) = scripted(name, ip, |_| output(0, CLIENT_OUTPUT, ""));
            clients.push(Arc::new(host));
            recorders.push(recorder);
        }

        let mut exec = executor(1000);
        exec.config.workloads = vec!["workloada".to_string()];
        let ctx = PhaseContext::new(ExecutorSettings::default());
        let samples = exec.load_and_run(&clients, &ctx).await.unwrap();

        let c0 = recorders[0].commands();
        let c1 = recorders[1].commands();
        assert_eq!(c0.len(), 2);
        assert!(c0[0].contains("-p insertstart=0 -p insertcount=500"));
        assert!(c1[0].contains("-p insertstart=500 -p insertcount=500"));
        assert!(c0[1].contains(" run aerospike "));
        assert!(c1[1].contains("-p operationcount=500"));

        let load_throughput = samples
            .iter()
            .find(|s| s.metric == "overall Throughput" && s.metadata["stage"] == "load")
            .unwrap();
        assert_eq!(load_throughput.value, 200.0);
        assert!(samples
            .iter()
            .any(|s| s.metadata["stage"] == "run" && s.metadata["workload"] == "workloada"));
    }

    #[tokio::test]
    async fn test_failed_client_fails_the_stage() {
        let (good, _) = scripted("c0", "10.0.1.1", |_| output(0, CLIENT_OUTPUT, ""));
        let (bad, _) = scripted("c1", "10.0.1.2", |_| output(1, "", "java.net.ConnectException\n"));
        let clients: Vec<HostRef> = vec![Arc::new(good), Arc::new(bad)];

        let ctx = PhaseContext::new(ExecutorSettings::default());
        let err = executor(1000).load_and_run(&clients, &ctx).await.unwrap_err();

        match err {
            AeroBenchError::Phase {
                phase,
                failures,
                cancelled,
            } => {
                assert_eq!(phase, "ycsb-load");
                assert_eq!(cancelled, 0);
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].target, "c1");
                assert!(failures[0].message.contains("ConnectException"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_too_few_records_for_clients() {
        let (a, _) = scripted("c0", "10.0.1.1", |_| output(0, CLIENT_OUTPUT, ""));
        let (b, _) = scripted("c1", "10.0.1.2", |_| output(0, CLIENT_OUTPUT, ""));
        let clients: Vec<HostRef> = vec![Arc::new(a), Arc::new(b)];

        let ctx = PhaseContext::new(ExecutorSettings::default());
        let err = executor(1).load_and_run(&clients, &ctx).await.unwrap_err();
        assert!(matches!(err, AeroBenchError::Validation(_)));
    }
}
