//! SNAT bridge and the per-container SNAT interface.
//!
//! Containers on VLAN networks get a second interface (`eth1`) plugged into a
//! host-local bridge. Traffic leaving that bridge is masqueraded behind the
//! host, which gives the container a way out that does not depend on its
//! VLAN. The same bridge carries host/container traffic when inbound access
//! is allowed.

use std::net::{IpAddr, Ipv4Addr};

use hitch_common::{HitchResult, MacAddress};
use ipnet::{IpNet, Ipv4Net};

use super::{EndpointClient, common};
use crate::ebtables::{self, Ebtables, EbtablesRule};
use crate::exec::ControlPlane;
use crate::iptables::{self, Iptables, IptablesRule};
use crate::link;
use crate::netns::Namespace;
use crate::ovsctl::Ovs;
use crate::types::{Endpoint, EndpointInfo, Network};

/// SNAT bridge name.
pub const SNAT_BRIDGE: &str = "azSnatbr";
/// Veth end enslaved to the SNAT bridge.
pub const SNAT_BRIDGE_VETH: &str = "azSnatveth0";
/// Veth end attached to the OVS bridge.
pub const SNAT_OVS_VETH: &str = "azSnatveth1";
/// Host-side prefix of per-container SNAT veths.
pub const SNAT_VETH_PREFIX: &str = "azs";
/// Name of the SNAT interface inside the container.
pub const SNAT_CONTAINER_IF: &str = "eth1";

/// Private ranges containers may not reach through the SNAT bridge.
pub const PRIVATE_RANGES: &str = "10.0.0.0/8,172.16.0.0/12,192.168.0.0/16";

/// Gateway address of the SNAT bridge when the network does not set one.
#[must_use]
pub fn default_snat_bridge_ip() -> IpNet {
    IpNet::V4(Ipv4Net::new(Ipv4Addr::new(169, 254, 0, 1), 16).unwrap_or_default())
}

/// Container SNAT address when the endpoint does not set one.
#[must_use]
pub fn default_local_ip() -> IpNet {
    IpNet::V4(Ipv4Net::new(Ipv4Addr::new(169, 254, 0, 2), 16).unwrap_or_default())
}

/// Masquerade traffic sourced from the SNAT bridge subnet.
#[must_use]
pub fn masquerade_rule(bridge_ip: IpNet) -> IptablesRule {
    IptablesRule::new(
        iptables::NAT,
        iptables::POSTROUTING,
        format!("-s {}", bridge_ip.trunc()),
        iptables::MASQUERADE,
    )
}

/// Keep VLAN-tagged frames off the SNAT bridge.
#[must_use]
pub fn vlan_drop_rule() -> EbtablesRule {
    EbtablesRule::new(ebtables::PREROUTING, "-p 802_1Q -j DROP".to_string())
}

/// Drop forwarded traffic from the SNAT bridge to private ranges.
#[must_use]
pub fn private_block_rule() -> IptablesRule {
    IptablesRule::new(
        iptables::FILTER,
        iptables::FORWARD,
        format!("-i {SNAT_BRIDGE} -d {PRIVATE_RANGES}"),
        iptables::DROP,
    )
}

/// Exempt `address` from [`private_block_rule`].
#[must_use]
pub fn private_allow_rule(address: &str) -> IptablesRule {
    IptablesRule::new(
        iptables::FILTER,
        iptables::FORWARD,
        format!("-i {SNAT_BRIDGE} -d {address}"),
        iptables::ACCEPT,
    )
}

fn accept(chain: &str, matches: String) -> IptablesRule {
    IptablesRule::new(iptables::FILTER, chain, matches, iptables::ACCEPT)
}

/// Host to container: the host's connection and the container's replies.
#[must_use]
pub fn host_to_nc_rules(bridge_ip: IpAddr, container_ip: IpAddr) -> [IptablesRule; 2] {
    [
        accept(iptables::HITCH_CNI_OUTPUT, format!("-s {bridge_ip} -d {container_ip}")),
        accept(
            iptables::HITCH_CNI_INPUT,
            format!("-i {SNAT_BRIDGE} -m state --state ESTABLISHED,RELATED"),
        ),
    ]
}

/// Container to host: the container's connection and the host's replies.
#[must_use]
pub fn nc_to_host_rules(bridge_ip: IpAddr, container_ip: IpAddr) -> [IptablesRule; 2] {
    [
        accept(iptables::HITCH_CNI_INPUT, format!("-s {container_ip} -d {bridge_ip}")),
        accept(
            iptables::HITCH_CNI_OUTPUT,
            format!("-o {SNAT_BRIDGE} -m state --state ESTABLISHED,RELATED"),
        ),
    ]
}

/// Create the SNAT bridge and its uplink into `ovs_bridge`, if missing, and
/// make sure the masquerade and VLAN drop rules are installed.
///
/// # Errors
///
/// Returns an error if any link or rule cannot be created.
pub fn ensure_snat_bridge(cp: &dyn ControlPlane, bridge_ip: IpNet, ovs_bridge: &str) -> HitchResult<()> {
    if !link::link_exists(cp, SNAT_BRIDGE) {
        tracing::info!(bridge = SNAT_BRIDGE, ip = %bridge_ip, "Creating SNAT bridge");
        link::add_bridge(cp, SNAT_BRIDGE)?;
    }
    if !link::link_exists(cp, SNAT_BRIDGE_VETH) {
        link::create_veth_pair(cp, SNAT_BRIDGE_VETH, SNAT_OVS_VETH)?;
    }
    link::add_address(cp, SNAT_BRIDGE, bridge_ip)?;
    link::set_link_state(cp, SNAT_BRIDGE, true)?;
    link::set_link_master(cp, SNAT_BRIDGE_VETH, Some(SNAT_BRIDGE))?;
    link::set_link_state(cp, SNAT_OVS_VETH, true)?;

    let attached = link::show_link(cp, SNAT_OVS_VETH)?.is_some_and(|l| l.master.is_some());
    if !attached {
        Ovs::new(cp).add_port(ovs_bridge, SNAT_OVS_VETH, 0)?;
    }

    Iptables::new(cp).insert(&masquerade_rule(bridge_ip))?;
    Ebtables::new(cp).append_unique(&vlan_drop_rule())
}

/// Remove the SNAT bridge and its rules. Failures are logged.
pub fn teardown_snat_bridge(cp: &dyn ControlPlane, bridge_ip: IpNet, ovs_bridge: &str) {
    tracing::info!(bridge = SNAT_BRIDGE, "Deleting SNAT bridge");
    if let Err(e) = Ebtables::new(cp).delete(&vlan_drop_rule()) {
        tracing::warn!(error = %e, "Failed to delete VLAN drop rule");
    }
    if let Err(e) = Iptables::new(cp).delete(&masquerade_rule(bridge_ip)) {
        tracing::warn!(error = %e, "Failed to delete masquerade rule");
    }
    if let Err(e) = Ovs::new(cp).delete_port(ovs_bridge, SNAT_OVS_VETH) {
        tracing::warn!(port = SNAT_OVS_VETH, error = %e, "Failed to detach SNAT uplink");
    }
    for name in [SNAT_BRIDGE_VETH, SNAT_BRIDGE] {
        if let Err(e) = link::delete_link(cp, name) {
            tracing::warn!(name, error = %e, "Failed to delete SNAT link");
        }
    }
}

/// SNAT options of one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnatSettings {
    /// Host-side veth.
    pub host_veth: String,
    /// Container-side veth before renaming.
    pub container_veth: String,
    /// Container address on the SNAT bridge.
    pub local_ip: IpNet,
    /// SNAT bridge gateway.
    pub bridge_ip: IpNet,
    /// Outbound SNAT through the host.
    pub enable_snat_on_host: bool,
    /// Host may open connections to the container.
    pub allow_host_to_nc: bool,
    /// Container may open connections to the host.
    pub allow_nc_to_host: bool,
    /// Destinations exempt from the private range block, usually DNS servers.
    pub skip_from_block: Vec<String>,
    /// Another endpoint of the network owns inbound rules and a neighbour
    /// entry for the same local address, so those stay on delete.
    pub local_ip_shared: bool,
}

impl SnatSettings {
    /// Settings for a new endpoint, or `None` if it needs no SNAT interface.
    #[must_use]
    pub fn for_info(info: &EndpointInfo, bridge_ip: Option<IpNet>) -> Option<Self> {
        Self::build(
            &info.id,
            [
                info.enable_snat_on_host,
                info.allow_inbound_host_to_nc,
                info.allow_inbound_nc_to_host,
            ],
            info.local_ip,
            bridge_ip,
            &info.dns.servers,
        )
    }

    /// Settings of a stored endpoint, or `None` if it has no SNAT interface.
    #[must_use]
    pub fn for_endpoint(ep: &Endpoint, bridge_ip: Option<IpNet>) -> Option<Self> {
        Self::build(
            &ep.id,
            [
                ep.enable_snat_on_host,
                ep.allow_inbound_host_to_nc,
                ep.allow_inbound_nc_to_host,
            ],
            ep.local_ip,
            bridge_ip,
            &ep.dns.servers,
        )
    }

    fn build(
        id: &str,
        [snat, host_to_nc, nc_to_host]: [bool; 3],
        local_ip: Option<IpNet>,
        bridge_ip: Option<IpNet>,
        dns_servers: &[String],
    ) -> Option<Self> {
        if !(snat || host_to_nc || nc_to_host) {
            return None;
        }
        let short: String = id.chars().take(7).collect();
        Some(Self {
            host_veth: format!("{SNAT_VETH_PREFIX}{short}"),
            container_veth: format!("{SNAT_VETH_PREFIX}{short}-2"),
            local_ip: local_ip.unwrap_or_else(default_local_ip),
            bridge_ip: bridge_ip.unwrap_or_else(default_snat_bridge_ip),
            enable_snat_on_host: snat,
            allow_host_to_nc: host_to_nc,
            allow_nc_to_host: nc_to_host,
            skip_from_block: dns_servers.to_vec(),
            local_ip_shared: false,
        })
    }

    const fn has_inbound(&self) -> bool {
        self.allow_host_to_nc || self.allow_nc_to_host
    }

    /// Mark the local address as shared if any endpoint of `network` other
    /// than `id` has inbound access on it.
    #[must_use]
    pub fn shared_within(mut self, network: &Network, id: &str) -> Self {
        let local = self.local_ip.addr();
        self.local_ip_shared = network
            .endpoints
            .values()
            .filter(|other| other.id != id)
            .filter_map(|other| Self::for_endpoint(other, network.snat_bridge_ip))
            .any(|other| other.has_inbound() && other.local_ip.addr() == local);
        self
    }
}

/// Plumbs the SNAT interface of one container.
pub struct SnatEndpointClient<'a> {
    cp: &'a dyn ControlPlane,
    settings: SnatSettings,
    ovs_bridge: String,
    container_veth: String,
    container_mac: Option<MacAddress>,
}

impl<'a> SnatEndpointClient<'a> {
    /// Client for the SNAT interface described by `settings`.
    #[must_use]
    pub fn new(cp: &'a dyn ControlPlane, settings: SnatSettings, ovs_bridge: &str) -> Self {
        let container_veth = settings.container_veth.clone();
        Self {
            cp,
            settings,
            ovs_bridge: ovs_bridge.to_string(),
            container_veth,
            container_mac: None,
        }
    }

    fn add_inbound_rules(&self, rules: &[IptablesRule]) -> HitchResult<()> {
        let iptables = Iptables::new(self.cp);
        iptables.ensure_filter_chain(iptables::OUTPUT, iptables::HITCH_CNI_OUTPUT)?;
        iptables.ensure_filter_chain(iptables::INPUT, iptables::HITCH_CNI_INPUT)?;
        for rule in rules {
            iptables.insert(rule)?;
        }
        Ok(())
    }

    fn add_static_arp(&self) -> HitchResult<()> {
        let Some(mac) = self.container_mac else {
            return Ok(());
        };
        link::set_static_neighbor(self.cp, SNAT_BRIDGE, self.settings.local_ip.addr(), mac)
    }
}

impl EndpointClient for SnatEndpointClient<'_> {
    fn add_endpoints(&mut self, _info: &EndpointInfo) -> HitchResult<()> {
        let s = &self.settings;
        ensure_snat_bridge(self.cp, s.bridge_ip, &self.ovs_bridge)?;
        link::create_veth_pair(self.cp, &s.host_veth, &s.container_veth)?;
        link::set_link_master(self.cp, &s.host_veth, Some(SNAT_BRIDGE))?;
        self.container_mac = Some(common::link_mac(self.cp, &s.container_veth)?);
        Ok(())
    }

    fn add_endpoint_rules(&mut self, _info: &EndpointInfo) -> HitchResult<()> {
        let iptables = Iptables::new(self.cp);
        for address in &self.settings.skip_from_block {
            iptables.insert(&private_allow_rule(address))?;
        }
        iptables.append(&private_block_rule())?;

        let bridge_ip = self.settings.bridge_ip.addr();
        let container_ip = self.settings.local_ip.addr();
        if self.settings.allow_host_to_nc {
            self.add_inbound_rules(&host_to_nc_rules(bridge_ip, container_ip))?;
        }
        if self.settings.allow_nc_to_host {
            self.add_inbound_rules(&nc_to_host_rules(bridge_ip, container_ip))?;
        }
        if self.settings.has_inbound() {
            self.add_static_arp()?;
        }
        Ok(())
    }

    fn move_endpoints_to_container_ns(&mut self, _info: &EndpointInfo, ns: &Namespace) -> HitchResult<()> {
        link::set_link_netns(self.cp, &self.container_veth, ns.path())
    }

    fn setup_container_interfaces(&mut self, _info: &EndpointInfo) -> HitchResult<()> {
        common::setup_container_interface(self.cp, &self.container_veth, SNAT_CONTAINER_IF)?;
        SNAT_CONTAINER_IF.clone_into(&mut self.container_veth);
        Ok(())
    }

    fn configure_container_interfaces_and_routes(&mut self, _info: &EndpointInfo) -> HitchResult<()> {
        link::add_address(self.cp, &self.container_veth, self.settings.local_ip)
    }

    fn delete_endpoint_rules(&mut self, ep: &Endpoint) {
        if self.settings.local_ip_shared {
            tracing::debug!(
                endpoint = %ep.id,
                ip = %self.settings.local_ip,
                "SNAT address still used by another endpoint, keeping its rules"
            );
            return;
        }

        let iptables = Iptables::new(self.cp);
        let bridge_ip = self.settings.bridge_ip.addr();
        let container_ip = self.settings.local_ip.addr();

        // The ESTABLISHED rules are shared between containers and stay.
        let mut rules = Vec::new();
        if self.settings.allow_host_to_nc {
            let [own, _] = host_to_nc_rules(bridge_ip, container_ip);
            rules.push(own);
        }
        if self.settings.allow_nc_to_host {
            let [own, _] = nc_to_host_rules(bridge_ip, container_ip);
            rules.push(own);
        }
        for rule in &rules {
            if let Err(e) = iptables.delete(rule) {
                tracing::warn!(rule = %rule, error = %e, "Failed to delete inbound rule");
            }
        }

        if self.settings.has_inbound() {
            if let Err(e) = link::delete_static_neighbor(self.cp, SNAT_BRIDGE, container_ip) {
                tracing::warn!(ip = %container_ip, error = %e, "Failed to delete static ARP entry");
            }
        }
    }

    fn delete_endpoints(&mut self, _ep: &Endpoint) -> HitchResult<()> {
        link::delete_link(self.cp, &self.settings.host_veth)
    }
}
