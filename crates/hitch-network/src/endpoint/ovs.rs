//! Open vSwitch endpoint client.

use hitch_common::{HitchResult, MacAddress};

use super::snat::SnatEndpointClient;
use super::{EndpointClient, EndpointContext, common, ipv4_addresses};
use crate::exec::ControlPlane;
use crate::link;
use crate::netns::Namespace;
use crate::ovsctl::{self, Ovs};
use crate::types::{Endpoint, EndpointInfo};

/// Plugs a veth into the network's OVS bridge as a VLAN-tagged port, with an
/// optional SNAT interface alongside.
pub struct OvsEndpointClient<'a> {
    cp: &'a dyn ControlPlane,
    ctx: EndpointContext,
    container_mac: Option<MacAddress>,
    snat: Option<SnatEndpointClient<'a>>,
}

impl<'a> OvsEndpointClient<'a> {
    /// Client for the endpoint described by `ctx`.
    #[must_use]
    pub const fn new(cp: &'a dyn ControlPlane, ctx: EndpointContext, snat: Option<SnatEndpointClient<'a>>) -> Self {
        Self {
            cp,
            ctx,
            container_mac: None,
            snat,
        }
    }
}

impl EndpointClient for OvsEndpointClient<'_> {
    fn add_endpoints(&mut self, info: &EndpointInfo) -> HitchResult<()> {
        link::create_veth_pair(self.cp, &self.ctx.host_veth, &self.ctx.container_veth)?;
        let created = common::link_mac(self.cp, &self.ctx.container_veth).and_then(|mac| {
            self.container_mac = Some(mac);
            match self.snat.as_mut() {
                Some(snat) => snat.add_endpoints(info),
                None => Ok(()),
            }
        });

        if let Err(e) = created {
            if let Err(cleanup) = link::delete_link(self.cp, &self.ctx.host_veth) {
                tracing::warn!(name = %self.ctx.host_veth, error = %cleanup, "Failed to delete veth");
            }
            return Err(e);
        }
        Ok(())
    }

    fn add_endpoint_rules(&mut self, info: &EndpointInfo) -> HitchResult<()> {
        let ovs = Ovs::new(self.cp);
        let bridge = &self.ctx.bridge_name;
        ovs.add_port(bridge, &self.ctx.host_veth, self.ctx.vlan_id)?;

        let container_port = ovs.port_number(&self.ctx.host_veth)?;
        let host_port = ovs.port_number(&self.ctx.ext_if_name)?;
        let mac = match self.container_mac {
            Some(mac) => mac,
            None => common::link_mac(self.cp, &self.ctx.container_veth)?,
        };

        ovs.add_flow(bridge, &ovsctl::ip_snat_flow(container_port, self.ctx.ext_if_mac))?;
        ovs.add_flow(bridge, &ovsctl::fake_arp_reply_flow(container_port))?;
        for ip in ipv4_addresses(&info.ip_addresses) {
            ovs.add_flow(bridge, &ovsctl::mac_dnat_flow(host_port, ip, self.ctx.vlan_id, mac))?;
        }

        match self.snat.as_mut() {
            Some(snat) => snat.add_endpoint_rules(info),
            None => Ok(()),
        }
    }

    fn move_endpoints_to_container_ns(&mut self, info: &EndpointInfo, ns: &Namespace) -> HitchResult<()> {
        link::set_link_netns(self.cp, &self.ctx.container_veth, ns.path())?;
        match self.snat.as_mut() {
            Some(snat) => snat.move_endpoints_to_container_ns(info, ns),
            None => Ok(()),
        }
    }

    fn setup_container_interfaces(&mut self, info: &EndpointInfo) -> HitchResult<()> {
        common::setup_container_interface(self.cp, &self.ctx.container_veth, &info.if_name)?;
        self.ctx.container_veth.clone_from(&info.if_name);
        match self.snat.as_mut() {
            Some(snat) => snat.setup_container_interfaces(info),
            None => Ok(()),
        }
    }

    fn configure_container_interfaces_and_routes(&mut self, info: &EndpointInfo) -> HitchResult<()> {
        common::assign_addresses(self.cp, &self.ctx.container_veth, &info.ip_addresses)?;
        if let Some(snat) = self.snat.as_mut() {
            snat.configure_container_interfaces_and_routes(info)?;
        }
        common::add_routes(self.cp, &self.ctx.container_veth, &info.routes)
    }

    fn delete_endpoint_rules(&mut self, ep: &Endpoint) {
        let ovs = Ovs::new(self.cp);
        let bridge = &self.ctx.bridge_name;

        match ovs.port_number(&ep.host_if_name) {
            Ok(container_port) => {
                ovs.delete_flows(bridge, &ovsctl::ip_snat_match(container_port));
                ovs.delete_flows(bridge, &ovsctl::fake_arp_reply_match(container_port));
            }
            Err(e) => tracing::warn!(port = %ep.host_if_name, error = %e, "No OpenFlow port for endpoint"),
        }
        match ovs.port_number(&self.ctx.ext_if_name) {
            Ok(host_port) => {
                for ip in ipv4_addresses(&ep.ip_addresses) {
                    ovs.delete_flows(bridge, &ovsctl::mac_dnat_match(host_port, ip, ep.vlan_id));
                }
            }
            Err(e) => tracing::warn!(port = %self.ctx.ext_if_name, error = %e, "No OpenFlow port for uplink"),
        }
        if let Err(e) = ovs.delete_port(bridge, &ep.host_if_name) {
            tracing::warn!(port = %ep.host_if_name, error = %e, "Failed to delete OVS port");
        }

        if let Some(snat) = self.snat.as_mut() {
            snat.delete_endpoint_rules(ep);
        }
    }

    fn delete_endpoints(&mut self, ep: &Endpoint) -> HitchResult<()> {
        link::delete_link(self.cp, &ep.host_if_name)?;
        match self.snat.as_mut() {
            Some(snat) => snat.delete_endpoints(ep),
            None => Ok(()),
        }
    }
}
