//! Routed endpoint client for transparent networks.
//!
//! Nothing is bridged. The host reaches the container through a /32 route on
//! the host veth, and the container sends everything to a link-local fake
//! gateway whose neighbour entry points at the host veth.

use std::net::{IpAddr, Ipv4Addr};

use hitch_common::{HitchError, HitchResult, MacAddress};
use ipnet::{IpNet, Ipv4Net};

use super::{EndpointClient, EndpointContext, common};
use crate::exec::ControlPlane;
use crate::link;
use crate::netns::Namespace;
use crate::types::{Endpoint, EndpointInfo, Route};

/// Gateway address containers route through.
pub const FAKE_GATEWAY: Ipv4Addr = Ipv4Addr::new(169, 254, 1, 1);

/// Plumbs a veth that is routed, not bridged.
pub struct CalicoEndpointClient<'a> {
    cp: &'a dyn ControlPlane,
    ctx: EndpointContext,
    host_veth_mac: Option<MacAddress>,
}

impl<'a> CalicoEndpointClient<'a> {
    /// Client for the endpoint described by `ctx`.
    #[must_use]
    pub const fn new(cp: &'a dyn ControlPlane, ctx: EndpointContext) -> Self {
        Self {
            cp,
            ctx,
            host_veth_mac: None,
        }
    }

    fn host_routes(addresses: &[IpNet]) -> Vec<Route> {
        addresses.iter().copied().map(common::host_route).collect()
    }
}

impl EndpointClient for CalicoEndpointClient<'_> {
    fn add_endpoints(&mut self, _info: &EndpointInfo) -> HitchResult<()> {
        link::create_veth_pair(self.cp, &self.ctx.host_veth, &self.ctx.container_veth)?;
        self.host_veth_mac = Some(common::link_mac(self.cp, &self.ctx.host_veth)?);
        Ok(())
    }

    fn add_endpoint_rules(&mut self, info: &EndpointInfo) -> HitchResult<()> {
        common::add_routes(self.cp, &self.ctx.host_veth, &Self::host_routes(&info.ip_addresses))
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
        let if_name = self.ctx.container_veth.clone();
        common::assign_addresses(self.cp, &if_name, &info.ip_addresses)?;

        let gateway = IpAddr::V4(FAKE_GATEWAY);
        let gateway_net = Ipv4Net::new(FAKE_GATEWAY, 32).map_err(|e| HitchError::Internal {
            message: e.to_string(),
        })?;
        let routes = [Route::link(IpNet::V4(gateway_net)), Route::default_via(gateway)];
        common::add_routes(self.cp, &if_name, &routes)?;

        // Traffic to the rest of the subnet also goes via the gateway.
        for addr in &info.ip_addresses {
            let subnet = Route::link(addr.trunc());
            if let Err(e) = link::delete_route(self.cp, &if_name, &subnet) {
                tracing::debug!(dst = %subnet.dst, error = %e, "No subnet route to remove");
            }
        }

        match self.host_veth_mac {
            Some(mac) => link::set_static_neighbor(self.cp, &if_name, gateway, mac),
            None => {
                tracing::warn!(host_if = %self.ctx.host_veth, "Host veth MAC unknown, skipping gateway neighbour");
                Ok(())
            }
        }
    }

    fn delete_endpoint_rules(&mut self, ep: &Endpoint) {
        for route in Self::host_routes(&ep.ip_addresses) {
            if let Err(e) = link::delete_route(self.cp, &ep.host_if_name, &route) {
                tracing::warn!(dst = %route.dst, error = %e, "Failed to delete host route");
            }
        }
    }

    fn delete_endpoints(&mut self, ep: &Endpoint) -> HitchResult<()> {
        link::delete_link(self.cp, &ep.host_if_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_routes_are_single_addresses() {
        let routes = CalicoEndpointClient::host_routes(&["10.1.2.3/24".parse().unwrap()]);
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].dst.to_string(), "10.1.2.3/32");
        assert!(routes[0].gateway.is_none());
    }
}
