//! Core data models: benchmark configuration, host inventory and samples

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

// Input validation limits
pub const MAX_COMMAND_LEN: usize = 16_384; // 16 KB
pub const MAX_OUTPUT_SIZE: usize = 10_485_760; // 10 MB
pub const MAX_PARALLEL_LIMIT: usize = 256;
pub const MAX_HOST_NAME_LEN: usize = 64;

/// Names of the two host groups the benchmark declares
pub const WORKERS_GROUP: &str = "workers";
pub const CLIENTS_GROUP: &str = "clients";

/// Top-level benchmark configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub vm_groups: VmGroupsConfig,
    #[serde(default)]
    pub aerospike: AerospikeConfig,
    #[serde(default)]
    pub ycsb: YcsbConfig,
    #[serde(default)]
    pub executor: ExecutorSettings,
    #[serde(default)]
    pub data_disk_type: DataDiskType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmGroupsConfig {
    pub workers: VmGroupSpec,
    pub clients: VmGroupSpec,
}

/// Declared shape of one host group plus the hosts backing it
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmGroupSpec {
    #[serde(default)]
    pub vm_spec: BTreeMap<String, VmSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_spec: Option<DiskSpec>,
    #[serde(default)]
    pub vm_count: Option<usize>,
    #[serde(default)]
    pub disk_count: Option<usize>,
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
}

/// Per-cloud machine description
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VmSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiskSpec {
    #[serde(default)]
    pub disk_type: DataDiskType,
    pub size_gb: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_point: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DataDiskType {
    Local,
    #[default]
    Persistent,
}

/// Where Aerospike keeps namespace data
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    Memory,
    Disk,
}

impl std::fmt::Display for StorageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageType::Memory => write!(f, "memory"),
            StorageType::Disk => write!(f, "disk"),
        }
    }
}

impl std::str::FromStr for StorageType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(StorageType::Memory),
            "disk" => Ok(StorageType::Disk),
            other => Err(format!("unknown storage type '{}'", other)),
        }
    }
}

/// Aerospike server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AerospikeConfig {
    #[serde(default)]
    pub storage_type: StorageType,
    #[serde(default = "default_replication_factor")]
    pub replication_factor: u32,
    #[serde(default = "default_threads")]
    pub service_threads: u32,
    #[serde(default = "default_threads")]
    pub transaction_threads_per_queue: u32,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_aerospike_dir")]
    pub install_dir: String,
    #[serde(default = "default_aerospike_version")]
    pub version: String,
    #[serde(default = "default_memory_fraction")]
    pub memory_fraction: f64,
    /// Raw block devices used when storage_type is disk
    #[serde(default)]
    pub devices: Vec<String>,
}

impl Default for AerospikeConfig {
    fn default() -> Self {
        Self {
            storage_type: StorageType::default(),
            replication_factor: default_replication_factor(),
            service_threads: default_threads(),
            transaction_threads_per_queue: default_threads(),
            namespace: default_namespace(),
            install_dir: default_aerospike_dir(),
            version: default_aerospike_version(),
            memory_fraction: default_memory_fraction(),
            devices: Vec::new(),
        }
    }
}

fn default_replication_factor() -> u32 {
    1
}

fn default_threads() -> u32 {
    4
}

fn default_namespace() -> String {
    "test".to_string()
}

fn default_aerospike_dir() -> String {
    "aerospike".to_string()
}

fn default_aerospike_version() -> String {
    "4.0.0.1".to_string()
}

fn default_memory_fraction() -> f64 {
    0.8
}

/// YCSB load generator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YcsbConfig {
    #[serde(default = "default_ycsb_version")]
    pub version: String,
    #[serde(default = "default_workloads")]
    pub workloads: Vec<String>,
    #[serde(default = "default_record_count")]
    pub record_count: u64,
    #[serde(default = "default_operation_count")]
    pub operation_count: u64,
    #[serde(default = "default_threads_per_client")]
    pub threads_per_client: u32,
    /// Extra `-p key=value` properties passed to every invocation
    #[serde(default)]
    pub properties: Vec<String>,
    #[serde(default = "default_ycsb_dir")]
    pub install_dir: String,
}

impl Default for YcsbConfig {
    fn default() -> Self {
        Self {
            version: default_ycsb_version(),
            workloads: default_workloads(),
            record_count: default_record_count(),
            operation_count: default_operation_count(),
            threads_per_client: default_threads_per_client(),
            properties: Vec::new(),
            install_dir: default_ycsb_dir(),
        }
    }
}

fn default_ycsb_version() -> String {
    "0.17.0".to_string()
}

fn default_workloads() -> Vec<String> {
    vec!["workloada".to_string(), "workloadb".to_string()]
}

fn default_record_count() -> u64 {
    1_000_000
}

fn default_operation_count() -> u64 {
    1_000_000
}

fn default_threads_per_client() -> u32 {
    32
}

fn default_ycsb_dir() -> String {
    "ycsb".to_string()
}

/// Fan-out settings shared by every phase
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutorSettings {
    /// Cap on concurrently running actions (unbounded when unset)
    #[serde(default)]
    pub max_parallel: Option<usize>,
    /// Deadline applied to each phase's fan-out
    #[serde(default)]
    pub phase_timeout_secs: Option<u64>,
    /// How long cancelled actions get to wind down before being dropped
    #[serde(default)]
    pub cancel_grace_secs: Option<u64>,
}

/// How the driver reaches a host
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    #[default]
    Ssh,
    Local,
}

/// Inventory entry for one host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub name: String,
    pub address: String,
    /// Address other hosts use to reach this one; defaults to `address`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_ip: Option<String>,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
    #[serde(default)]
    pub connection: ConnectionKind,
    /// Working directory for local hosts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
}

fn default_user() -> String {
    "ubuntu".to_string()
}

/// Status of a single command or task
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Success,
    Failed,
    Cancelled,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Success => write!(f, "success"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Result of running one command on a host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: TaskStatus,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub duration: Duration,
    #[serde(default)]
    pub output_truncated: bool,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.status == TaskStatus::Success
    }
}

/// One benchmark measurement
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sample {
    pub metric: String,
    pub value: f64,
    pub unit: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl Sample {
    pub fn new(metric: impl Into<String>, value: f64, unit: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            value,
            unit: unit.into(),
            metadata: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }
}
