//! Objects written to stdout for the container runtime.

use std::net::IpAddr;

use hitch_common::HitchError;
use hitch_network::endpoint::snat::SNAT_CONTAINER_IF;
use hitch_network::{DnsConfig, Endpoint, Route};
use ipnet::IpNet;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};

/// CNI versions this plugin speaks.
pub const SUPPORTED_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0"];

/// Successful result of `ADD`, `GET` and `UPDATE`. Delegated IPAM plugins
/// answer in the same format.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CniResult {
    /// Result format version.
    #[serde(default)]
    pub cni_version: String,
    /// Interfaces created.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<CniInterface>,
    /// Assigned addresses.
    #[serde(default)]
    pub ips: Vec<CniIp>,
    /// Routes in the container.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<CniRoute>,
    /// DNS settings.
    #[serde(default, skip_serializing_if = "CniDns::is_empty")]
    pub dns: CniDns,
}

/// An interface in a result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CniInterface {
    /// Interface name.
    pub name: String,
    /// Hardware address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Namespace path for container interfaces, absent for host interfaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

/// An address in a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CniIp {
    /// `"4"` or `"6"`, only in 0.3.x results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Address with prefix length.
    pub address: IpNet,
    /// Gateway for the address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
    /// Index into `interfaces`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
}

/// A route in a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CniRoute {
    /// Destination.
    pub dst: IpNet,
    /// Next hop, on-link if absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<IpAddr>,
}

/// DNS settings in a result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CniDns {
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

impl CniDns {
    /// Whether nothing is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nameservers.is_empty() && self.domain.is_none() && self.search.is_empty()
    }
}

impl From<&DnsConfig> for CniDns {
    fn from(dns: &DnsConfig) -> Self {
        Self {
            nameservers: dns.servers.clone(),
            domain: dns.domain.clone(),
            search: dns.search.clone(),
        }
    }
}

impl From<&CniDns> for DnsConfig {
    fn from(dns: &CniDns) -> Self {
        Self {
            domain: dns.domain.clone(),
            servers: dns.nameservers.clone(),
            search: dns.search.clone(),
        }
    }
}

impl From<&Route> for CniRoute {
    fn from(route: &Route) -> Self {
        Self {
            dst: route.dst,
            gw: route.gateway,
        }
    }
}

impl From<&CniRoute> for Route {
    fn from(route: &CniRoute) -> Self {
        match route.gw {
            Some(gw) => Self::via(route.dst, gw),
            None => Self::link(route.dst),
        }
    }
}

const fn same_family(a: IpAddr, b: IpAddr) -> bool {
    a.is_ipv4() == b.is_ipv4()
}

impl CniResult {
    /// Result describing a stored endpoint.
    ///
    /// Interface 0 is the host veth, interface 1 the container interface.
    /// Endpoints with a SNAT interface on a VLAN network also list `eth1`.
    #[must_use]
    pub fn for_endpoint(cni_version: &str, ep: &Endpoint) -> Self {
        let sandbox = ep.netns_path.as_ref().map(|p| p.display().to_string());
        let mut interfaces = vec![
            CniInterface {
                name: ep.host_if_name.clone(),
                mac: None,
                sandbox: None,
            },
            CniInterface {
                name: ep.if_name.clone(),
                mac: Some(ep.mac.to_string()),
                sandbox: sandbox.clone(),
            },
        ];

        let with_version = cni_version.starts_with("0.3");
        let ips = ep
            .ip_addresses
            .iter()
            .map(|addr| {
                let ip = addr.addr();
                let gateway = ep
                    .routes
                    .iter()
                    .filter(|r| r.is_default())
                    .find_map(|r| r.gateway.filter(|gw| same_family(*gw, ip)))
                    .or_else(|| ep.gateways.iter().copied().find(|gw| same_family(*gw, ip)));
                CniIp {
                    version: with_version.then(|| if ip.is_ipv4() { "4" } else { "6" }.to_string()),
                    address: *addr,
                    gateway,
                    interface: Some(1),
                }
            })
            .collect();

        if has_snat_interface(ep) {
            interfaces.push(CniInterface {
                name: SNAT_CONTAINER_IF.to_string(),
                mac: None,
                sandbox,
            });
        }

        Self {
            cni_version: cni_version.to_string(),
            interfaces,
            ips,
            routes: ep.routes.iter().map(CniRoute::from).collect(),
            dns: CniDns::from(&ep.dns),
        }
    }

    /// Gateway of the first address, if any.
    #[must_use]
    pub fn first_gateway(&self) -> Option<IpAddr> {
        self.ips.iter().find_map(|ip| ip.gateway)
    }
}

/// Multi-tenant endpoints carry a second interface on the SNAT bridge.
fn has_snat_interface(ep: &Endpoint) -> bool {
    ep.vlan_id != 0 && (ep.enable_snat_on_host || ep.allow_inbound_host_to_nc || ep.allow_inbound_nc_to_host)
}

/// Error object written on failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CniError {
    /// Result format version.
    #[serde(default)]
    pub cni_version: String,
    /// Error code.
    pub code: u32,
    /// Short message.
    pub msg: String,
    /// Longer explanation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl CniError {
    /// Error object for a plugin failure.
    #[must_use]
    pub fn new(cni_version: &str, err: &HitchError) -> Self {
        Self {
            cni_version: cni_version.to_string(),
            code: err.cni_code(),
            msg: err.to_string(),
            details: err.help().map(|help| help.to_string()),
        }
    }
}

/// Answer to `VERSION`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionResult {
    /// Version of this answer.
    pub cni_version: String,
    /// Versions the plugin accepts.
    pub supported_versions: Vec<String>,
}

impl Default for VersionResult {
    fn default() -> Self {
        Self {
            cni_version: "0.4.0".to_string(),
            supported_versions: SUPPORTED_VERSIONS.iter().map(ToString::to_string).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hitch_common::MacAddress;
    use std::path::PathBuf;

    fn endpoint() -> Endpoint {
        Endpoint {
            id: "1a2b3c4d-eth0".to_string(),
            container_id: "1a2b3c4d5e6f".to_string(),
            netns_path: Some(PathBuf::from("/var/run/netns/c1")),
            if_name: "eth0".to_string(),
            host_if_name: "azv1a2b3c4".to_string(),
            mac: MacAddress::new([0x02, 0, 0, 0, 0, 0x05]),
            ip_addresses: vec!["10.0.0.5/24".parse().unwrap()],
            routes: vec![Route::default_via("10.0.0.1".parse().unwrap())],
            gateways: vec!["10.0.0.1".parse().unwrap()],
            vlan_id: 0,
            dns: DnsConfig {
                domain: None,
                servers: vec!["168.63.129.16".to_string()],
                search: Vec::new(),
            },
            enable_snat_on_host: false,
            allow_inbound_host_to_nc: false,
            allow_inbound_nc_to_host: false,
            local_ip: None,
        }
    }

    #[test]
    fn endpoint_result_json() {
        let result = CniResult::for_endpoint("0.3.0", &endpoint());
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "cniVersion": "0.3.0",
                "interfaces": [
                    { "name": "azv1a2b3c4" },
                    { "name": "eth0", "mac": "02:00:00:00:00:05", "sandbox": "/var/run/netns/c1" }
                ],
                "ips": [
                    { "version": "4", "address": "10.0.0.5/24", "gateway": "10.0.0.1", "interface": 1 }
                ],
                "routes": [ { "dst": "0.0.0.0/0", "gw": "10.0.0.1" } ],
                "dns": { "nameservers": ["168.63.129.16"] }
            })
        );
    }

    #[test]
    fn version_field_only_for_0_3() {
        let result = CniResult::for_endpoint("0.4.0", &endpoint());
        assert!(result.ips[0].version.is_none());
    }

    #[test]
    fn snat_interface_listed_for_vlan_endpoints() {
        let mut ep = endpoint();
        ep.enable_snat_on_host = true;
        assert_eq!(CniResult::for_endpoint("0.3.0", &ep).interfaces.len(), 2);

        ep.vlan_id = 100;
        let result = CniResult::for_endpoint("0.3.0", &ep);
        assert_eq!(result.interfaces.len(), 3);
        assert_eq!(result.interfaces[2].name, SNAT_CONTAINER_IF);
        assert_eq!(result.interfaces[2].sandbox.as_deref(), Some("/var/run/netns/c1"));
    }

    #[test]
    fn gateway_falls_back_to_uplink_gateway() {
        let mut ep = endpoint();
        ep.routes.clear();
        let result = CniResult::for_endpoint("0.3.0", &ep);
        assert_eq!(result.first_gateway(), Some("10.0.0.1".parse().unwrap()));
        assert!(result.routes.is_empty());
    }

    #[test]
    fn decodes_ipam_output() {
        let result: CniResult = serde_json::from_str(
            r#"{"cniVersion":"0.3.0","ips":[{"version":"4","address":"10.0.0.7/24","gateway":"10.0.0.1"}],
                "routes":[{"dst":"0.0.0.0/0","gw":"10.0.0.1"}],"dns":{}}"#,
        )
        .unwrap();
        assert_eq!(result.ips[0].address, "10.0.0.7/24".parse::<IpNet>().unwrap());
        assert!(Route::from(&result.routes[0]).is_default());
        assert!(result.dns.is_empty());
    }

    #[test]
    fn error_object() {
        let err = HitchError::DuplicateEndpoint {
            network: "n1".to_string(),
            endpoint: "e1".to_string(),
        };
        let json = serde_json::to_string(&CniError::new("0.3.0", &err)).unwrap();
        insta::assert_snapshot!(json, @r#"{"cniVersion":"0.3.0","code":100,"msg":"Endpoint e1 already exists in network n1","details":"Delete the existing endpoint before adding it again"}"#);
    }

    #[test]
    fn version_result_lists_supported_versions() {
        let json = serde_json::to_value(VersionResult::default()).unwrap();
        assert_eq!(json["supportedVersions"], serde_json::json!(["0.3.0", "0.3.1", "0.4.0"]));
    }
}
