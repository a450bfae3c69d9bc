//! Layered benchmark configuration
//!
//! Sources, lowest priority first:
//!
//! 1. the built-in benchmark definition ([`DEFAULT_CONFIG`])
//! 2. the user's YAML file
//! 3. `AEROBENCH__SECTION__KEY` environment variables
//! 4. command-line [`Overrides`], applied after deserialization
//!
//! # Example
//!
//! ```no_run
//! use aerobench::config::{apply_overrides, load_config, validate_config, Overrides};
//! use std::path::Path;
//!
//! let mut config = load_config(Some(Path::new("cluster.yaml")))?;
//! apply_overrides(&mut config, &Overrides { aerospike_vms: Some(3), ..Default::default() });
//! validate_config(&config)?;
//! # Ok::<(), aerobench::error::AeroBenchError>(())
//! ```

use crate::error::{AeroBenchError, Result};
use crate::hosts::VmGroups;
use crate::models::*;
use config::{Config, Environment, File, FileFormat};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

/// Built-in benchmark definition
pub const DEFAULT_CONFIG: &str = r#"
name: aerospike_ycsb
description: >
  Run YCSB against an Aerospike installation. Specify the number of
  YCSB VMs with --ycsb-client-vms.
vm_groups:
  workers:
    vm_spec:
      gcp:
        machine_type: n1-standard-1
        zone: us-central1-a
      aws:
        machine_type: t2.small
        zone: us-east-1a
      azure:
        machine_type: Standard_A1
        zone: eastus
    disk_spec:
      disk_type: persistent
      size_gb: 500
      mount_point: /scratch
    disk_count: 0
  clients:
    vm_spec:
      gcp:
        machine_type: n1-standard-2
        zone: us-central1-a
      aws:
        machine_type: m3.large
        zone: us-east-1a
      azure:
        machine_type: Standard_A2
        zone: eastus
"#;

const ENV_PREFIX: &str = "AEROBENCH";
const ENV_SEPARATOR: &str = "__";

/// Command-line settings that take precedence over every config source
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub server_machine_type: Option<String>,
    pub client_machine_type: Option<String>,
    pub aerospike_vms: Option<usize>,
    pub ycsb_client_vms: Option<usize>,
    pub storage_type: Option<StorageType>,
    pub data_disk_type: Option<DataDiskType>,
    pub max_parallel: Option<usize>,
}

/// Load the benchmark configuration, layering `path` over the defaults
pub fn load_config(path: Option<&Path>) -> Result<BenchmarkConfig> {
    let mut builder =
        Config::builder().add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Yaml));

    if let Some(path) = path {
        if !path.exists() {
            return Err(AeroBenchError::Validation(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        info!("Loading benchmark config from {}", path.display());
        builder = builder.add_source(
            File::new(&path.to_string_lossy(), FileFormat::Yaml).required(true),
        );
    }

    let settings = builder.add_source(env_source()).build()?;
    Ok(settings.try_deserialize()?)
}

/// Load the benchmark configuration from an in-memory YAML document
pub fn load_config_str(yaml: &str) -> Result<BenchmarkConfig> {
    let settings = Config::builder()
        .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Yaml))
        .add_source(File::from_str(yaml, FileFormat::Yaml))
        .add_source(env_source())
        .build()?;
    Ok(settings.try_deserialize()?)
}

fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator(ENV_SEPARATOR)
        .try_parsing(true)
}

/// Apply command-line overrides
///
/// Storage settings are applied first because the worker disk count
/// depends on them:
/// - disk storage on local disks leaves an unset or zero count unknown,
///   to be decided once the machines are known
/// - disk storage on any other disk type needs at least one disk
pub fn apply_overrides(config: &mut BenchmarkConfig, overrides: &Overrides) {
    if let Some(storage_type) = overrides.storage_type {
        config.aerospike.storage_type = storage_type;
    }
    if let Some(disk_type) = overrides.data_disk_type {
        config.data_disk_type = disk_type;
    }
    if let Some(max_parallel) = overrides.max_parallel {
        config.executor.max_parallel = Some(max_parallel);
    }

    if config.aerospike.storage_type == StorageType::Disk {
        let workers = &mut config.vm_groups.workers;
        let current = workers.disk_count.filter(|&n| n > 0);
        workers.disk_count = match config.data_disk_type {
            DataDiskType::Local => current,
            DataDiskType::Persistent => Some(current.unwrap_or(1)),
        };
    }

    if let Some(machine_type) = &overrides.server_machine_type {
        set_machine_type(&mut config.vm_groups.workers, machine_type);
    }
    if let Some(machine_type) = &overrides.client_machine_type {
        set_machine_type(&mut config.vm_groups.clients, machine_type);
    }

    if let Some(count) = overrides.aerospike_vms {
        config.vm_groups.workers.vm_count = Some(count);
    }
    if let Some(count) = overrides.ycsb_client_vms {
        config.vm_groups.clients.vm_count = Some(count);
    }

    debug!(?overrides, "Applied command-line overrides");
}

fn set_machine_type(group: &mut VmGroupSpec, machine_type: &str) {
    for spec in group.vm_spec.values_mut() {
        spec.machine_type = Some(machine_type.to_string());
    }
}

/// Semantic checks that serde cannot express
pub fn validate_config(config: &BenchmarkConfig) -> Result<()> {
    let aerospike = &config.aerospike;
    if aerospike.replication_factor == 0 {
        return Err(AeroBenchError::Validation(
            "aerospike.replication_factor must be at least 1".to_string(),
        ));
    }
    if aerospike.service_threads == 0 || aerospike.transaction_threads_per_queue == 0 {
        return Err(AeroBenchError::Validation(
            "aerospike thread counts must be at least 1".to_string(),
        ));
    }
    if !(aerospike.memory_fraction > 0.0 && aerospike.memory_fraction <= 1.0) {
        return Err(AeroBenchError::Validation(format!(
            "aerospike.memory_fraction must be in (0, 1], got {}",
            aerospike.memory_fraction
        )));
    }
    if aerospike.storage_type == StorageType::Disk && aerospike.devices.is_empty() {
        return Err(AeroBenchError::Validation(
            "disk storage requires at least one entry in aerospike.devices".to_string(),
        ));
    }

    validate_install_dir("aerospike.install_dir", &aerospike.install_dir)?;
    validate_install_dir("ycsb.install_dir", &config.ycsb.install_dir)?;

    if config.ycsb.workloads.is_empty() {
        return Err(AeroBenchError::Validation(
            "ycsb.workloads must name at least one workload".to_string(),
        ));
    }
    if config.ycsb.threads_per_client == 0 {
        return Err(AeroBenchError::Validation(
            "ycsb.threads_per_client must be at least 1".to_string(),
        ));
    }

    if let Some(max_parallel) = config.executor.max_parallel {
        if max_parallel == 0 || max_parallel > MAX_PARALLEL_LIMIT {
            return Err(AeroBenchError::Validation(format!(
                "executor.max_parallel must be between 1 and {}",
                MAX_PARALLEL_LIMIT
            )));
        }
    }

    let mut seen = HashSet::new();
    for (group, spec) in groups(config) {
        for host in &spec.hosts {
            if host.name.is_empty() || host.name.len() > MAX_HOST_NAME_LEN {
                return Err(AeroBenchError::Validation(format!(
                    "host names in '{}' must be 1-{} characters",
                    group, MAX_HOST_NAME_LEN
                )));
            }
            if host.address.is_empty() {
                return Err(AeroBenchError::Validation(format!(
                    "host '{}' has no address",
                    host.name
                )));
            }
            if !seen.insert(host.name.as_str()) {
                return Err(AeroBenchError::Validation(format!(
                    "duplicate host name '{}'",
                    host.name
                )));
            }
        }

        if let Some(expected) = spec.vm_count {
            if expected != spec.hosts.len() {
                return Err(AeroBenchError::GroupSizeMismatch {
                    group: group.to_string(),
                    expected,
                    actual: spec.hosts.len(),
                });
            }
        }
    }

    Ok(())
}

/// Install directories are relative to the remote home and end up unquoted in
/// shell commands such as `sudo rm -rf <dir>*`, so only plain names pass.
pub fn validate_install_dir(field: &str, dir: &str) -> Result<()> {
    let plain = dir
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if dir.is_empty() || !plain || dir.starts_with('.') || dir.starts_with('-') {
        return Err(AeroBenchError::Validation(format!(
            "{} must be a plain directory name (letters, digits, '.', '_', '-'), got '{}'",
            field, dir
        )));
    }
    Ok(())
}

fn groups(config: &BenchmarkConfig) -> [(&'static str, &VmGroupSpec); 2] {
    [
        (WORKERS_GROUP, &config.vm_groups.workers),
        (CLIENTS_GROUP, &config.vm_groups.clients),
    ]
}

/// Connect the inventory of every declared group
pub fn build_groups(config: &BenchmarkConfig) -> Result<VmGroups> {
    VmGroups::from_inventory(
        groups(config)
            .into_iter()
            .map(|(name, spec)| (name, spec.hosts.as_slice())),
    )
}
