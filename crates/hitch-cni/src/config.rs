//! Plugin configuration.
//!
//! [`NetConf`] is the network configuration the container runtime passes on
//! stdin. [`PluginConfig`] holds the settings of the plugin process itself.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hitch_common::store::DEFAULT_LOCK_TIMEOUT;
use hitch_common::telemetry::{FileSink, TracingSink};
use hitch_common::{HitchError, HitchPaths, HitchResult, TelemetrySink};
use hitch_network::{DnsConfig, NetworkMode};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// CNI version reported when the configuration names none.
pub const DEFAULT_CNI_VERSION: &str = "0.3.0";

/// Network configuration from the container runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetConf {
    /// CNI version of the configuration.
    #[serde(default)]
    pub cni_version: String,
    /// Network name, used as the network ID.
    #[serde(default)]
    pub name: String,
    /// Plugin type.
    #[serde(default, rename = "type")]
    pub plugin_type: String,
    /// Forwarding mode (`bridge`, `tunnel` or `transparent`).
    #[serde(default)]
    pub mode: String,
    /// Host interface to attach to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<String>,
    /// Bridge name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<String>,
    /// VLAN ID. Non-zero selects the Open vSwitch data plane.
    #[serde(default)]
    pub vlan_id: u16,
    /// Gateway address of the SNAT bridge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snat_bridge_ip: Option<IpNet>,
    /// Address of the SNAT interface inside the container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_ip: Option<IpNet>,
    /// Let containers reach the host's networks through SNAT.
    #[serde(default)]
    pub enable_snat_on_host: bool,
    /// Let the host open connections to the container.
    #[serde(default, rename = "allowInboundFromHostToNc")]
    pub allow_inbound_host_to_nc: bool,
    /// Let the container open connections to the host.
    #[serde(default, rename = "allowInboundFromNcToHost")]
    pub allow_inbound_nc_to_host: bool,
    /// Address management.
    #[serde(default)]
    pub ipam: IpamConf,
    /// DNS settings.
    #[serde(default)]
    pub dns: DnsConf,
    /// Network monitor daemon settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_monitor: Option<NetworkMonitorConf>,
}

/// The `ipam` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpamConf {
    /// IPAM plugin binary name.
    #[serde(default, rename = "type")]
    pub ipam_type: String,
    /// Address pool to reserve from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<IpNet>,
}

/// The `dns` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsConf {
    /// Name servers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,
    /// Search domain suffix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// Search list.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search: Vec<String>,
}

impl DnsConf {
    /// Whether nothing is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nameservers.is_empty() && self.domain.is_none() && self.search.is_empty()
    }
}

impl From<&DnsConf> for DnsConfig {
    fn from(dns: &DnsConf) -> Self {
        Self {
            domain: dns.domain.clone(),
            servers: dns.nameservers.clone(),
            search: dns.search.clone(),
        }
    }
}

/// The `networkMonitor` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkMonitorConf {
    /// Monitor binary name, looked up next to the plugin.
    #[serde(default)]
    pub name: String,
    /// Do not start the monitor.
    #[serde(default)]
    pub disable: bool,
    /// Seconds between reconciliation passes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
    /// Also clean copies of our rules out of the built-in chains.
    #[serde(default)]
    pub monitor_all_chains: bool,
}

impl NetConf {
    /// Decode and validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`HitchError::Config`] if the JSON is malformed or the network
    /// has no name.
    pub fn parse(bytes: &[u8]) -> HitchResult<Self> {
        let conf: Self = serde_json::from_slice(bytes).map_err(|e| HitchError::Config {
            message: format!("invalid network configuration: {e}"),
        })?;

        if conf.name.is_empty() {
            return Err(HitchError::Config {
                message: "missing network name".to_string(),
            });
        }
        Ok(conf)
    }

    /// CNI version to answer with.
    #[must_use]
    pub fn result_version(&self) -> &str {
        if self.cni_version.is_empty() {
            DEFAULT_CNI_VERSION
        } else {
            &self.cni_version
        }
    }

    /// Parsed forwarding mode.
    ///
    /// # Errors
    ///
    /// Returns [`HitchError::InvalidNetworkMode`] for unknown modes.
    pub fn network_mode(&self) -> HitchResult<NetworkMode> {
        self.mode.parse()
    }

    /// DNS settings for the network and its endpoints.
    #[must_use]
    pub fn dns_config(&self) -> DnsConfig {
        DnsConfig::from(&self.dns)
    }

    /// Pool the IPAM plugin reserves from, if pinned.
    #[must_use]
    pub const fn pool_id(&self) -> Option<IpNet> {
        self.ipam.subnet
    }
}

/// Settings of the plugin process.
#[derive(Debug, Clone)]
pub struct PluginConfig {
    /// Paths for state and logs.
    pub paths: HitchPaths,
    /// How long to wait for the state lock.
    pub lock_timeout: Duration,
    /// Write telemetry to a file instead of the log.
    pub telemetry: bool,
    /// Upper bound for flushing telemetry before exit.
    pub telemetry_flush_timeout: Duration,
    /// Name of the plugin process, used to tell a stale lock from a live one.
    pub process_name: String,
    /// Plugin version reported in telemetry.
    pub version: String,
    /// Directory the network monitor binary lives in.
    pub bin_dir: Option<PathBuf>,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            paths: HitchPaths::new(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            telemetry: false,
            telemetry_flush_timeout: Duration::from_secs(2),
            process_name: crate::PLUGIN_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            bin_dir: None,
        }
    }
}

impl PluginConfig {
    /// Set the root directory.
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.paths = HitchPaths::with_root(root);
        self
    }

    /// Set the lock timeout.
    #[must_use]
    pub const fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Enable file telemetry.
    #[must_use]
    pub const fn with_telemetry(mut self, enabled: bool) -> Self {
        self.telemetry = enabled;
        self
    }

    /// Set the process name checked by stale lock detection.
    #[must_use]
    pub fn with_process_name(mut self, name: impl Into<String>) -> Self {
        self.process_name = name.into();
        self
    }

    /// Set the directory holding the network monitor binary.
    #[must_use]
    pub fn with_bin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.bin_dir = Some(dir.into());
        self
    }

    /// Telemetry sink for this configuration.
    #[must_use]
    pub fn telemetry_sink(&self) -> Arc<dyn TelemetrySink> {
        if self.telemetry {
            Arc::new(FileSink::new(self.paths.telemetry_file()))
        } else {
            Arc::new(TracingSink)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONF: &str = r#"{
        "cniVersion": "0.3.1",
        "name": "azure",
        "type": "hitch-cni",
        "mode": "bridge",
        "master": "eth0",
        "vlanId": 100,
        "snatBridgeIp": "169.254.0.1/16",
        "localIp": "169.254.0.4/16",
        "enableSnatOnHost": true,
        "allowInboundFromHostToNc": true,
        "ipam": { "type": "hitch-ipam", "subnet": "10.0.0.0/24" },
        "dns": { "nameservers": ["168.63.129.16"], "search": ["svc.local"] },
        "networkMonitor": { "name": "hitch-netmon", "interval": 30, "monitorAllChains": true }
    }"#;

    #[test]
    fn parses_full_config() {
        let conf = NetConf::parse(CONF.as_bytes()).unwrap();
        assert_eq!(conf.name, "azure");
        assert_eq!(conf.plugin_type, "hitch-cni");
        assert_eq!(conf.master.as_deref(), Some("eth0"));
        assert_eq!(conf.vlan_id, 100);
        assert_eq!(conf.snat_bridge_ip, Some("169.254.0.1/16".parse().unwrap()));
        assert!(conf.enable_snat_on_host);
        assert!(conf.allow_inbound_host_to_nc);
        assert!(!conf.allow_inbound_nc_to_host);
        assert_eq!(conf.pool_id(), Some("10.0.0.0/24".parse().unwrap()));
        assert_eq!(conf.ipam.ipam_type, "hitch-ipam");
        assert_eq!(conf.network_mode().unwrap(), NetworkMode::Bridge);

        let monitor = conf.network_monitor.unwrap();
        assert_eq!(monitor.interval, Some(30));
        assert!(monitor.monitor_all_chains);
        assert!(!monitor.disable);
    }

    #[test]
    fn dns_maps_to_network_dns() {
        let conf = NetConf::parse(CONF.as_bytes()).unwrap();
        let dns = conf.dns_config();
        assert_eq!(dns.servers, vec!["168.63.129.16".to_string()]);
        assert_eq!(dns.search, vec!["svc.local".to_string()]);
        assert!(dns.domain.is_none());
    }

    #[test]
    fn name_is_required() {
        let err = NetConf::parse(br#"{"cniVersion":"0.3.0","type":"hitch-cni"}"#).unwrap_err();
        assert!(matches!(err, HitchError::Config { .. }));
        assert_eq!(err.cni_code(), 7);
    }

    #[test]
    fn malformed_json_is_config_error() {
        assert!(matches!(
            NetConf::parse(b"{not json"),
            Err(HitchError::Config { .. })
        ));
    }

    #[test]
    fn minimal_config_defaults() {
        let conf = NetConf::parse(br#"{"name":"n1"}"#).unwrap();
        assert_eq!(conf.result_version(), DEFAULT_CNI_VERSION);
        assert_eq!(conf.network_mode().unwrap(), NetworkMode::Bridge);
        assert_eq!(conf.vlan_id, 0);
        assert!(conf.network_monitor.is_none());
        assert!(conf.dns.is_empty());
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let conf = NetConf::parse(br#"{"name":"n1","mode":"overlay"}"#).unwrap();
        assert!(matches!(
            conf.network_mode(),
            Err(HitchError::InvalidNetworkMode { .. })
        ));
    }

    #[test]
    fn default_config() {
        let config = PluginConfig::default();
        assert_eq!(config.lock_timeout, DEFAULT_LOCK_TIMEOUT);
        assert!(!config.telemetry);
        assert_eq!(config.process_name, crate::PLUGIN_NAME);
    }

    #[test]
    fn builder_pattern() {
        let config = PluginConfig::default()
            .with_root("/custom/root")
            .with_lock_timeout(Duration::from_millis(250))
            .with_telemetry(true)
            .with_process_name("cni-test")
            .with_bin_dir("/opt/cni/bin");

        assert_eq!(config.paths.root, PathBuf::from("/custom/root"));
        assert_eq!(config.lock_timeout, Duration::from_millis(250));
        assert!(config.telemetry);
        assert_eq!(config.process_name, "cni-test");
        assert_eq!(config.bin_dir, Some(PathBuf::from("/opt/cni/bin")));
    }
}
