//! Example cluster configurations for `aerobench template`

/// Metadata for a template type.
#[derive(Debug, Clone)]
pub struct TemplateInfo {
    /// Template name (matches the CLI `--type` value).
    pub name: &'static str,
    /// Short description shown in the listing table.
    pub description: &'static str,
}

/// Returns metadata for every available template.
pub fn list_templates() -> Vec<TemplateInfo> {
    vec![
        TemplateInfo {
            name: "local",
            description: "One worker and one client on this machine, small dataset",
        },
        TemplateInfo {
            name: "ssh",
            description: "Three servers and two YCSB clients reached over SSH",
        },
        TemplateInfo {
            name: "disk",
            description: "Aerospike on raw local SSDs instead of memory",
        },
    ]
}

/// Returns the YAML content for a given template type.
///
/// The `template_type` must be one of: `local`, `ssh`, `disk`.
pub fn get_template(template_type: &str) -> Option<&'static str> {
    match template_type {
        "local" => Some(TEMPLATE_LOCAL),
        "ssh" => Some(TEMPLATE_SSH),
        "disk" => Some(TEMPLATE_DISK),
        _ => None,
    }
}

const TEMPLATE_LOCAL: &str = r#"# aerobench: single machine
# Server and client run on this host. Useful to try the tool out.
vm_groups:
  workers:
    vm_count: 1
    hosts:
      - name: server-0
        address: 127.0.0.1
        connection: local
        workdir: /tmp/aerobench
  clients:
    vm_count: 1
    hosts:
      - name: client-0
        address: 127.0.0.1
        connection: local
        workdir: /tmp/aerobench

aerospike:
  storage_type: memory
  memory_fraction: 0.25

ycsb:
  workloads: [workloada]
  record_count: 10000
  operation_count: 10000
  threads_per_client: 4
"#;

const TEMPLATE_SSH: &str = r#"# aerobench: SSH cluster
# internal_ip is what the servers use to find each other.
vm_groups:
  workers:
    vm_count: 3
    hosts:
      - name: aerospike-0
        address: 203.0.113.10
        internal_ip: 10.0.0.10
        user: ubuntu
        key_path: ~/.ssh/id_ed25519
      - name: aerospike-1
        address: 203.0.113.11
        internal_ip: 10.0.0.11
        user: ubuntu
        key_path: ~/.ssh/id_ed25519
      - name: aerospike-2
        address: 203.0.113.12
        internal_ip: 10.0.0.12
        user: ubuntu
        key_path: ~/.ssh/id_ed25519
  clients:
    vm_count: 2
    hosts:
      - name: ycsb-0
        address: 203.0.113.20
        user: ubuntu
        key_path: ~/.ssh/id_ed25519
      - name: ycsb-1
        address: 203.0.113.21
        user: ubuntu
        key_path: ~/.ssh/id_ed25519

aerospike:
  replication_factor: 2
  service_threads: 8
  transaction_threads_per_queue: 8

ycsb:
  workloads: [workloada, workloadb, workloadc]
  record_count: 1000000
  operation_count: 1000000
  threads_per_client: 32

executor:
  max_parallel: 16
  phase_timeout_secs: 3600
"#;

const TEMPLATE_DISK: &str = r#"# aerobench: disk-backed namespace
# Every device is wiped by Aerospike. Double-check the paths.
data_disk_type: local

vm_groups:
  workers:
    vm_count: 1
    disk_count: 1
    hosts:
      - name: aerospike-0
        address: 203.0.113.10
        internal_ip: 10.0.0.10
        key_path: ~/.ssh/id_ed25519
  clients:
    vm_count: 1
    hosts:
      - name: ycsb-0
        address: 203.0.113.20
        key_path: ~/.ssh/id_ed25519

aerospike:
  storage_type: disk
  devices: [/dev/nvme0n1]

ycsb:
  workloads: [workloada]
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{load_config_str, validate_config};
    use crate::models::StorageType;

    #[test]
    fn test_list_templates_returns_all() {
        let names: Vec<&str> = list_templates().iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["local", "ssh", "disk"]);
    }

    #[test]
    fn test_get_template_unknown_returns_none() {
        assert!(get_template("nonexistent").is_none());
    }

    #[test]
    fn test_all_templates_are_valid_configs() {
        for info in list_templates() {
            let content = get_template(info.name).unwrap();
            let config = load_config_str(content)
                .unwrap_or_else(|e| panic!("template '{}' failed to load: {}", info.name, e));
            validate_config(&config)
                .unwrap_or_else(|e| panic!("template '{}' is invalid: {}", info.name, e));
            assert_eq!(config.name, "aerospike_ycsb");
        }
    }

    #[test]
    fn test_disk_template_uses_devices() {
        let config = load_config_str(get_template("disk").unwrap()).unwrap();
        assert_eq!(config.aerospike.storage_type, StorageType::Disk);
        assert_eq!(config.aerospike.devices, vec!["/dev/nvme0n1".to_string()]);
    }

    #[test]
    fn test_template_descriptions_non_empty() {
        for info in list_templates() {
            assert!(
                !info.description.is_empty(),
                "template '{}' should have a description",
                info.name
            );
        }
    }
}
