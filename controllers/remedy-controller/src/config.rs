//! Controller configuration.
//!
//! Remedy settings come from an optional YAML file (`REMEDY_CONFIG`); every
//! field has a default. Process settings come from environment variables.

use crate::error::ControllerError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Remedy controller configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControllerConfiguration {
    /// Kubernetes API server connection
    pub client_connection: ClientConnectionConfiguration,
    /// Azure remedies
    pub azure: AzureConfiguration,
}

/// Kubernetes API server connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConnectionConfiguration {
    /// Kubeconfig file, in-cluster or default inference when empty
    pub kubeconfig: String,
    /// Queries per second allowed towards the API server
    pub qps: f32,
    /// Burst allowed on top of `qps`
    pub burst: u32,
}

impl Default for ClientConnectionConfiguration {
    fn default() -> Self {
        Self {
            kubeconfig: String::new(),
            qps: 100.0,
            burst: 130,
        }
    }
}

/// Configuration of all Azure remedies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AzureConfiguration {
    /// Cleanup of public IP addresses left behind by deleted Services
    #[serde(rename = "orphanedPublicIPRemedy")]
    pub orphaned_public_ip_remedy: OrphanedPublicIPRemedyConfiguration,
    /// Reapply of virtual machines in the Failed state
    #[serde(rename = "failedVMRemedy")]
    pub failed_vm_remedy: FailedVMRemedyConfiguration,
}

/// Orphaned public IP address remedy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrphanedPublicIPRemedyConfiguration {
    /// Requeue delay on errors and transient states, base of the exponential backoff
    #[serde(with = "humantime_serde")]
    pub requeue_interval: Duration,
    /// How often every Service is projected again
    #[serde(with = "humantime_serde")]
    pub sync_period: Duration,
    /// How long a deleted record waits for its public IP address to go away on its own
    #[serde(with = "humantime_serde")]
    pub deletion_grace_period: Duration,
    /// Attempts to get an Azure public IP address before giving up
    pub max_get_attempts: u32,
    /// Attempts to clean an Azure public IP address before giving up
    pub max_clean_attempts: u32,
    /// Services whose labels include all labels of an entry are ignored
    pub blacklisted_service_labels: Vec<BTreeMap<String, String>>,
    /// Periodic sweep of public IP addresses no Service claims
    pub sweep: SweepConfiguration,
}

impl Default for OrphanedPublicIPRemedyConfiguration {
    fn default() -> Self {
        Self {
            requeue_interval: Duration::from_secs(30),
            sync_period: Duration::from_secs(4 * 60 * 60),
            deletion_grace_period: Duration::from_secs(5 * 60),
            max_get_attempts: 5,
            max_clean_attempts: 5,
            blacklisted_service_labels: Vec::new(),
            sweep: SweepConfiguration::default(),
        }
    }
}

/// Orphaned public IP address sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SweepConfiguration {
    /// Whether the sweep runs at all
    pub enabled: bool,
    /// Pause between successful sweeps
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Only public IP addresses whose name contains this are considered,
    /// the resource group when empty
    pub name_filter: String,
}

impl Default for SweepConfiguration {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(24 * 60 * 60),
            name_filter: String::new(),
        }
    }
}

/// Failed virtual machine remedy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FailedVMRemedyConfiguration {
    /// Requeue delay on errors and transient states, base of the exponential backoff
    #[serde(with = "humantime_serde")]
    pub requeue_interval: Duration,
    /// How often VirtualMachine records are looked at again
    #[serde(with = "humantime_serde")]
    pub sync_period: Duration,
    /// How often every Node is projected again
    #[serde(with = "humantime_serde")]
    pub node_sync_period: Duration,
    /// Attempts to get an Azure virtual machine before giving up
    pub max_get_attempts: u32,
    /// Attempts to reapply an Azure virtual machine before giving up
    pub max_reapply_attempts: u32,
}

impl Default for FailedVMRemedyConfiguration {
    fn default() -> Self {
        Self {
            requeue_interval: Duration::from_secs(60),
            sync_period: Duration::from_secs(60 * 60),
            node_sync_period: Duration::from_secs(4 * 60 * 60),
            max_get_attempts: 5,
            max_reapply_attempts: 5,
        }
    }
}

impl ControllerConfiguration {
    /// Parse and validate a configuration document
    pub fn from_yaml(input: &str) -> Result<Self, ControllerError> {
        let config: Self = serde_yaml::from_str(input)
            .map_err(|e| ControllerError::InvalidConfig(format!("could not decode configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read the configuration file, defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self, ControllerError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let input = std::fs::read_to_string(path).map_err(|e| {
            ControllerError::InvalidConfig(format!("could not read configuration file {}: {e}", path.display()))
        })?;
        Self::from_yaml(&input)
    }

    /// Reject settings the remedies cannot work with
    pub fn validate(&self) -> Result<(), ControllerError> {
        let pubip = &self.azure.orphaned_public_ip_remedy;
        let vm = &self.azure.failed_vm_remedy;
        let attempts = [
            ("orphanedPublicIPRemedy.maxGetAttempts", pubip.max_get_attempts),
            ("orphanedPublicIPRemedy.maxCleanAttempts", pubip.max_clean_attempts),
            ("failedVMRemedy.maxGetAttempts", vm.max_get_attempts),
            ("failedVMRemedy.maxReapplyAttempts", vm.max_reapply_attempts),
        ];
        if let Some((field, _)) = attempts.iter().find(|(_, value)| *value == 0) {
            return Err(ControllerError::InvalidConfig(format!("{field} must be at least 1")));
        }
        if pubip.requeue_interval.is_zero() || vm.requeue_interval.is_zero() {
            return Err(ControllerError::InvalidConfig("requeueInterval must not be zero".to_string()));
        }
        if pubip.sweep.enabled && pubip.sweep.interval.is_zero() {
            return Err(ControllerError::InvalidConfig(
                "orphanedPublicIPRemedy.sweep.interval must not be zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// One of the controllers run by the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ControllerKind {
    /// Service projector
    Service,
    /// Node projector
    Node,
    /// PublicIPAddress remediator
    PublicIPAddress,
    /// VirtualMachine remediator
    VirtualMachine,
}

impl ControllerKind {
    /// All controllers, in start order
    pub const ALL: [ControllerKind; 4] = [
        ControllerKind::Service,
        ControllerKind::Node,
        ControllerKind::PublicIPAddress,
        ControllerKind::VirtualMachine,
    ];

    /// Controller name, as used in `DISABLED_CONTROLLERS` and logs
    pub fn as_str(self) -> &'static str {
        match self {
            ControllerKind::Service => "service",
            ControllerKind::Node => "node",
            ControllerKind::PublicIPAddress => "publicipaddress",
            ControllerKind::VirtualMachine => "virtualmachine",
        }
    }
}

impl fmt::Display for ControllerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControllerKind {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ControllerKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ControllerError::InvalidConfig(format!("unknown controller: {s}")))
    }
}

/// Default namespace for records
pub const DEFAULT_NAMESPACE: &str = "kube-system";

/// Default address of the metrics server
pub const DEFAULT_METRICS_BIND_ADDRESS: &str = "0.0.0.0:6000";

/// Default number of concurrent reconciliations per controller
pub const DEFAULT_MAX_CONCURRENT_RECONCILES: u16 = 5;

/// Process settings read from the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeOptions {
    /// Namespace records live in
    pub namespace: String,
    /// Azure credentials file
    pub infra_config_path: String,
    /// Address of the metrics server
    pub metrics_bind_address: SocketAddr,
    /// Concurrent reconciliations per controller
    pub max_concurrent_reconciles: u16,
    /// Controllers not started
    pub disabled_controllers: BTreeSet<ControllerKind>,
    /// Configuration file, defaults are used when unset
    pub config_path: Option<String>,
}

impl RuntimeOptions {
    /// Read the options from environment variables
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the options through `lookup`, which returns the value of a variable
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let infra_config_path = var("INFRA_CONFIG_PATH").ok_or_else(|| {
            ControllerError::InvalidConfig("INFRA_CONFIG_PATH environment variable is required".to_string())
        })?;

        let metrics_bind_address = var("METRICS_BIND_ADDRESS")
            .unwrap_or_else(|| DEFAULT_METRICS_BIND_ADDRESS.to_string());
        let metrics_bind_address = metrics_bind_address.parse().map_err(|e| {
            ControllerError::InvalidConfig(format!("invalid METRICS_BIND_ADDRESS {metrics_bind_address}: {e}"))
        })?;

        let max_concurrent_reconciles = match var("MAX_CONCURRENT_RECONCILES") {
            Some(value) => value
                .trim()
                .parse::<u16>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| ControllerError::InvalidConfig(format!("invalid MAX_CONCURRENT_RECONCILES {value}")))?,
            None => DEFAULT_MAX_CONCURRENT_RECONCILES,
        };

        let disabled_controllers = var("DISABLED_CONTROLLERS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(ControllerKind::from_str)
            .collect::<Result<BTreeSet<_>, _>>()?;

        Ok(Self {
            namespace: var("NAMESPACE").unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            infra_config_path,
            metrics_bind_address,
            max_concurrent_reconciles,
            disabled_controllers,
            config_path: var("REMEDY_CONFIG"),
        })
    }

    /// Whether the controller should be started
    pub fn is_enabled(&self, kind: ControllerKind) -> bool {
        !self.disabled_controllers.contains(&kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = ControllerConfiguration::from_yaml("{}").unwrap();
        assert_eq!(config, ControllerConfiguration::default());
        assert_eq!(config.azure.orphaned_public_ip_remedy.requeue_interval, Duration::from_secs(30));
        assert_eq!(config.azure.failed_vm_remedy.sync_period, Duration::from_secs(3600));
        assert!(!config.azure.orphaned_public_ip_remedy.sweep.enabled);
    }

    #[test]
    fn test_parse_full_document() {
        let config = ControllerConfiguration::from_yaml(
            r"
clientConnection:
  kubeconfig: /etc/kubeconfig
  qps: 50
  burst: 60
azure:
  orphanedPublicIPRemedy:
    requeueInterval: 1m30s
    syncPeriod: 2h
    deletionGracePeriod: 500ms
    maxGetAttempts: 2
    maxCleanAttempts: 3
    blacklistedServiceLabels:
      - app: foo
    sweep:
      enabled: true
      interval: 12h
      nameFilter: shoot--dev
  failedVMRemedy:
    maxReapplyAttempts: 1
",
        )
        .unwrap();

        assert_eq!(config.client_connection.kubeconfig, "/etc/kubeconfig");
        assert_eq!(config.client_connection.burst, 60);
        let pubip = &config.azure.orphaned_public_ip_remedy;
        assert_eq!(pubip.requeue_interval, Duration::from_secs(90));
        assert_eq!(pubip.sync_period, Duration::from_secs(7200));
        assert_eq!(pubip.deletion_grace_period, Duration::from_millis(500));
        assert_eq!(pubip.max_get_attempts, 2);
        assert_eq!(
            pubip.blacklisted_service_labels,
            vec![BTreeMap::from([("app".to_string(), "foo".to_string())])]
        );
        assert!(pubip.sweep.enabled);
        assert_eq!(pubip.sweep.name_filter, "shoot--dev");
        // Unset fields keep their defaults
        assert_eq!(config.azure.failed_vm_remedy.max_get_attempts, 5);
        assert_eq!(config.azure.failed_vm_remedy.max_reapply_attempts, 1);
    }

    #[test]
    fn test_zero_attempts_are_rejected() {
        let err = ControllerConfiguration::from_yaml("azure: { failedVMRemedy: { maxGetAttempts: 0 } }").unwrap_err();
        assert!(err.to_string().contains("failedVMRemedy.maxGetAttempts"));
    }

    #[test]
    fn test_invalid_duration_is_rejected() {
        assert!(ControllerConfiguration::from_yaml("azure: { failedVMRemedy: { syncPeriod: soon } }").is_err());
    }

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_runtime_options_defaults() {
        let options = RuntimeOptions::from_lookup(env(&[("INFRA_CONFIG_PATH", "/etc/cloudprovider.conf")])).unwrap();
        assert_eq!(options.namespace, "kube-system");
        assert_eq!(options.metrics_bind_address, "0.0.0.0:6000".parse().unwrap());
        assert_eq!(options.max_concurrent_reconciles, 5);
        assert!(ControllerKind::ALL.iter().all(|kind| options.is_enabled(*kind)));
        assert_eq!(options.config_path, None);
    }

    #[test]
    fn test_runtime_options_from_env() {
        let options = RuntimeOptions::from_lookup(env(&[
            ("INFRA_CONFIG_PATH", "/etc/cloudprovider.conf"),
            ("NAMESPACE", "remedy"),
            ("METRICS_BIND_ADDRESS", "127.0.0.1:8080"),
            ("MAX_CONCURRENT_RECONCILES", "2"),
            ("DISABLED_CONTROLLERS", "node, virtualmachine"),
            ("REMEDY_CONFIG", "/etc/remedy/config.yaml"),
        ]))
        .unwrap();
        assert_eq!(options.namespace, "remedy");
        assert_eq!(options.max_concurrent_reconciles, 2);
        assert!(options.is_enabled(ControllerKind::Service));
        assert!(!options.is_enabled(ControllerKind::Node));
        assert!(!options.is_enabled(ControllerKind::VirtualMachine));
        assert_eq!(options.config_path.as_deref(), Some("/etc/remedy/config.yaml"));
    }

    #[test]
    fn test_runtime_options_errors() {
        assert!(RuntimeOptions::from_lookup(env(&[])).is_err());
        assert!(
            RuntimeOptions::from_lookup(env(&[("INFRA_CONFIG_PATH", "x"), ("DISABLED_CONTROLLERS", "pods")])).is_err()
        );
        assert!(
            RuntimeOptions::from_lookup(env(&[("INFRA_CONFIG_PATH", "x"), ("MAX_CONCURRENT_RECONCILES", "0")])).is_err()
        );
    }
}
