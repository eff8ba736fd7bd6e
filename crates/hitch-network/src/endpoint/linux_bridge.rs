//! Linux bridge endpoint client.

use hitch_common::{HitchResult, MacAddress};
use ipnet::IpNet;

use super::{EndpointClient, EndpointContext, common, ipv4_addresses};
use crate::ebtables::{self, Ebtables, EbtablesRule, VIRTUAL_MAC};
use crate::exec::ControlPlane;
use crate::link;
use crate::netns::Namespace;
use crate::types::{Endpoint, EndpointInfo, NetworkMode};

/// Per-endpoint rules: answer ARP for each container address and rewrite
/// inbound frames for it to the container MAC.
#[must_use]
pub fn endpoint_l2_rules(
    ext_if_name: &str,
    mode: NetworkMode,
    addresses: &[IpNet],
    mac: MacAddress,
) -> Vec<EbtablesRule> {
    let arp_mac = if mode == NetworkMode::Tunnel { VIRTUAL_MAC } else { mac };
    ipv4_addresses(addresses)
        .flat_map(|ip| {
            [
                ebtables::arp_reply_rule(ip, arp_mac),
                ebtables::ip_dnat_rule(ext_if_name, ip, mac),
            ]
        })
        .collect()
}

/// Plugs a veth into the network's Linux bridge.
pub struct LinuxBridgeEndpointClient<'a> {
    cp: &'a dyn ControlPlane,
    ctx: EndpointContext,
    container_mac: Option<MacAddress>,
}

impl<'a> LinuxBridgeEndpointClient<'a> {
    /// Client for the endpoint described by `ctx`.
    #[must_use]
    pub const fn new(cp: &'a dyn ControlPlane, ctx: EndpointContext) -> Self {
        Self {
            cp,
            ctx,
            container_mac: None,
        }
    }
}

impl EndpointClient for LinuxBridgeEndpointClient<'_> {
    fn add_endpoints(&mut self, _info: &EndpointInfo) -> HitchResult<()> {
        link::create_veth_pair(self.cp, &self.ctx.host_veth, &self.ctx.container_veth)?;
        self.container_mac = Some(common::link_mac(self.cp, &self.ctx.container_veth)?);
        Ok(())
    }

    fn add_endpoint_rules(&mut self, info: &EndpointInfo) -> HitchResult<()> {
        link::set_link_master(self.cp, &self.ctx.host_veth, Some(&self.ctx.bridge_name))?;

        let mac = match self.container_mac {
            Some(mac) => mac,
            None => common::link_mac(self.cp, &self.ctx.container_veth)?,
        };
        let ebtables = Ebtables::new(self.cp);
        for rule in endpoint_l2_rules(&self.ctx.ext_if_name, self.ctx.mode, &info.ip_addresses, mac) {
            ebtables.append_unique(&rule)?;
        }
        Ok(())
    }

    fn move_endpoints_to_container_ns(&mut self, _info: &EndpointInfo, ns: &Namespace) -> HitchResult<()> {
        link::set_link_netns(self.cp, &self.ctx.container_veth, ns.path())
    }

    fn setup_container_interfaces(&mut self, info: &EndpointInfo) -> HitchResult<()> {
        common::setup_container_interface(self.cp, &self.ctx.container_veth, &info.if_name)?;
        self.ctx.container_veth.clone_from(&info.if_name);
        Ok(())
    }

    fn configure_container_interfaces_and_routes(&mut self, info: &EndpointInfo) -> HitchResult<()> {
        common::assign_addresses(self.cp, &self.ctx.container_veth, &info.ip_addresses)?;
        common::add_routes(self.cp, &self.ctx.container_veth, &info.routes)
    }

    fn delete_endpoint_rules(&mut self, ep: &Endpoint) {
        let mac = self.container_mac.unwrap_or(ep.mac);
        let rules = endpoint_l2_rules(&self.ctx.ext_if_name, self.ctx.mode, &ep.ip_addresses, mac);
        Ebtables::new(self.cp).delete_best_effort(&rules);
    }

    fn delete_endpoints(&mut self, ep: &Endpoint) -> HitchResult<()> {
        link::delete_link(self.cp, &ep.host_if_name)
    }
}
