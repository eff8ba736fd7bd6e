//! Network and endpoint data model.
//!
//! These types are persisted in the state store between plugin invocations,
//! so field renames are format changes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

use hitch_common::{HitchError, MacAddress};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// How a network forwards container traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// Containers share a bridge enslaving the external interface.
    #[default]
    Bridge,
    /// Like bridge, but containers answer ARP with a virtual MAC (VEPA).
    Tunnel,
    /// No bridge. Container traffic is routed through the host stack.
    Transparent,
}

impl NetworkMode {
    /// Whether the mode attaches containers to a bridge.
    #[must_use]
    pub const fn is_bridged(self) -> bool {
        !matches!(self, Self::Transparent)
    }

    /// Lower-case mode name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bridge => "bridge",
            Self::Tunnel => "tunnel",
            Self::Transparent => "transparent",
        }
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkMode {
    type Err = HitchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "bridge" => Ok(Self::Bridge),
            "tunnel" => Ok(Self::Tunnel),
            "transparent" => Ok(Self::Transparent),
            _ => Err(HitchError::InvalidNetworkMode {
                mode: s.to_string(),
            }),
        }
    }
}

/// An IP route.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    /// Destination prefix, `0.0.0.0/0` for the default route.
    pub dst: IpNet,
    /// Next hop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
    /// Output device. `None` means the device the route is applied to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev: Option<String>,
    /// Route has link scope (directly reachable).
    #[serde(default)]
    pub link_scope: bool,
    /// Preferred source address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<IpAddr>,
}

impl Route {
    /// Route to `dst` via `gateway`.
    #[must_use]
    pub const fn via(dst: IpNet, gateway: IpAddr) -> Self {
        Self {
            dst,
            gateway: Some(gateway),
            dev: None,
            link_scope: false,
            src: None,
        }
    }

    /// Directly connected route to `dst`.
    #[must_use]
    pub const fn link(dst: IpNet) -> Self {
        Self {
            dst,
            gateway: None,
            dev: None,
            link_scope: true,
            src: None,
        }
    }

    /// Default route via `gateway`.
    #[must_use]
    pub fn default_via(gateway: IpAddr) -> Self {
        let dst = match gateway {
            IpAddr::V4(_) => IpNet::V4(ipnet::Ipv4Net::default()),
            IpAddr::V6(_) => IpNet::V6(ipnet::Ipv6Net::default()),
        };
        Self::via(dst, gateway)
    }

    /// Whether this is a default route.
    #[must_use]
    pub fn is_default(&self) -> bool {
        self.dst.prefix_len() == 0
    }

    /// Set the output device.
    #[must_use]
    pub fn with_dev(mut self, dev: &str) -> Self {
        self.dev = Some(dev.to_string());
        self
    }
}

/// DNS settings handed to containers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsConfig {
    /// Search domain suffix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// Name servers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<String>,
    /// Search list.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search: Vec<String>,
}

/// A host uplink interface shared by one or more networks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalInterface {
    /// Interface name.
    pub name: String,
    /// Interface MAC.
    pub mac: MacAddress,
    /// Subnets the interface is attached to.
    #[serde(default)]
    pub subnets: Vec<IpNet>,
    /// Addresses held before bridging, restored on disconnect.
    #[serde(default)]
    pub ip_addresses: Vec<IpNet>,
    /// Routes held before bridging, restored on disconnect.
    #[serde(default)]
    pub routes: Vec<Route>,
    /// Default gateway for IPv4, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4_gateway: Option<IpAddr>,
    /// Bridge enslaving this interface, while connected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge_name: Option<String>,
    /// Networks using this interface.
    #[serde(default)]
    pub networks: BTreeSet<String>,
}

impl ExternalInterface {
    /// New interface record with no networks attached.
    #[must_use]
    pub fn new(name: &str, mac: MacAddress) -> Self {
        Self {
            name: name.to_string(),
            mac,
            subnets: Vec::new(),
            ip_addresses: Vec::new(),
            routes: Vec::new(),
            ipv4_gateway: None,
            bridge_name: None,
            networks: BTreeSet::new(),
        }
    }

    /// Primary IPv4 address, if known.
    #[must_use]
    pub fn primary_ipv4(&self) -> Option<IpNet> {
        self.ip_addresses
            .iter()
            .find(|addr| matches!(addr, IpNet::V4(_)))
            .copied()
    }
}

/// Parameters for creating a network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInfo {
    /// Network ID.
    pub id: String,
    /// Forwarding mode.
    pub mode: NetworkMode,
    /// Host interface to attach to. Looked up by subnet when empty.
    #[serde(default)]
    pub master_if_name: String,
    /// Bridge name. Defaults to `azure<ifindex>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge_name: Option<String>,
    /// Subnets served by the network.
    #[serde(default)]
    pub subnets: Vec<IpNet>,
    /// VLAN ID. Non-zero selects the Open vSwitch data plane.
    #[serde(default)]
    pub vlan_id: u16,
    /// DNS settings.
    #[serde(default)]
    pub dns: DnsConfig,
    /// Gateway address of the SNAT bridge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snat_bridge_ip: Option<IpNet>,
    /// Whether containers may reach the host's networks through SNAT.
    #[serde(default)]
    pub enable_snat_on_host: bool,
}

/// A network as persisted in state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    /// Network ID.
    pub id: String,
    /// Forwarding mode.
    pub mode: NetworkMode,
    /// External interface name.
    pub ext_if_name: String,
    /// VLAN ID.
    #[serde(default)]
    pub vlan_id: u16,
    /// DNS settings.
    #[serde(default)]
    pub dns: DnsConfig,
    /// Gateway address of the SNAT bridge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snat_bridge_ip: Option<IpNet>,
    /// Whether containers may reach the host's networks through SNAT.
    #[serde(default)]
    pub enable_snat_on_host: bool,
    /// Endpoints keyed by ID.
    #[serde(default)]
    pub endpoints: BTreeMap<String, Endpoint>,
}

/// Parameters for creating an endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointInfo {
    /// Endpoint ID.
    pub id: String,
    /// Owning container.
    pub container_id: String,
    /// Container network namespace. `None` leaves the interface on the host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub netns_path: Option<PathBuf>,
    /// Interface name inside the container.
    pub if_name: String,
    /// Stable identity for host interface naming, e.g. `namespace.pod`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub veth_key: Option<String>,
    /// Addresses to assign.
    #[serde(default)]
    pub ip_addresses: Vec<IpNet>,
    /// Routes to install.
    #[serde(default)]
    pub routes: Vec<Route>,
    /// DNS settings.
    #[serde(default)]
    pub dns: DnsConfig,
    /// Give the container a second interface on the SNAT bridge.
    #[serde(default)]
    pub enable_snat_on_host: bool,
    /// Let the host reach the container over the SNAT bridge.
    #[serde(default)]
    pub allow_inbound_host_to_nc: bool,
    /// Let the container reach the host over the SNAT bridge.
    #[serde(default)]
    pub allow_inbound_nc_to_host: bool,
    /// Address of the SNAT interface inside the container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_ip: Option<IpNet>,
}

/// An endpoint as persisted in state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    /// Endpoint ID.
    pub id: String,
    /// Owning container.
    pub container_id: String,
    /// Container network namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub netns_path: Option<PathBuf>,
    /// Interface name inside the container.
    pub if_name: String,
    /// Host-side veth name.
    pub host_if_name: String,
    /// Container interface MAC, read back after configuration.
    pub mac: MacAddress,
    /// Assigned addresses.
    #[serde(default)]
    pub ip_addresses: Vec<IpNet>,
    /// Installed routes.
    #[serde(default)]
    pub routes: Vec<Route>,
    /// Gateways of the external interface.
    #[serde(default)]
    pub gateways: Vec<IpAddr>,
    /// VLAN ID, inherited from the network.
    #[serde(default)]
    pub vlan_id: u16,
    /// DNS settings.
    #[serde(default)]
    pub dns: DnsConfig,
    /// SNAT interface present.
    #[serde(default)]
    pub enable_snat_on_host: bool,
    /// Host may reach the container over the SNAT bridge.
    #[serde(default)]
    pub allow_inbound_host_to_nc: bool,
    /// Container may reach the host over the SNAT bridge.
    #[serde(default)]
    pub allow_inbound_nc_to_host: bool,
    /// Address of the SNAT interface inside the container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_ip: Option<IpNet>,
}
