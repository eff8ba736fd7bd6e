//! Endpoint clients and the endpoint lifecycle.
//!
//! An endpoint is a veth pair: the host end plugs into the network's bridge
//! (or is routed, for transparent networks) and the container end is moved
//! into the container's namespace, renamed and configured. Which client does
//! the plumbing depends on the network: VLAN networks use Open vSwitch,
//! transparent networks use host routes, everything else uses the Linux
//! bridge.

mod calico;
pub mod common;
mod linux_bridge;
mod ovs;
pub mod snat;

pub use calico::{CalicoEndpointClient, FAKE_GATEWAY};
pub use linux_bridge::{LinuxBridgeEndpointClient, endpoint_l2_rules};
pub use ovs::OvsEndpointClient;
pub use snat::{SnatEndpointClient, SnatSettings};

use hitch_common::{HitchError, HitchResult, MacAddress, id::short_hash};
use ipnet::IpNet;

use crate::HostContext;
use crate::exec::ControlPlane;
use crate::netns::Namespace;
use crate::types::{Endpoint, EndpointInfo, ExternalInterface, Network, NetworkMode};

/// Prefix of host-side veth names.
pub const VETH_PREFIX: &str = "azv";

/// Host and container veth names for an endpoint.
///
/// With a veth key (e.g. `namespace.pod`) the host name stays stable across
/// container restarts. Otherwise it is derived from the endpoint ID.
#[must_use]
pub fn veth_names(endpoint_id: &str, veth_key: Option<&str>) -> (String, String) {
    match veth_key.filter(|key| !key.is_empty()) {
        Some(key) => {
            let hash = short_hash(key);
            (format!("{VETH_PREFIX}{hash}"), format!("{VETH_PREFIX}{hash}2"))
        }
        None => {
            let short: String = endpoint_id.chars().take(7).collect();
            (format!("{VETH_PREFIX}{short}"), format!("{VETH_PREFIX}{short}-2"))
        }
    }
}

/// Container plumbing for one endpoint.
///
/// The engine calls the steps in declaration order. `setup` and `configure`
/// run inside the container namespace.
pub trait EndpointClient {
    /// Create the veth pair(s).
    ///
    /// # Errors
    ///
    /// Returns [`hitch_common::HitchError::InterfaceCreationFailed`] if an
    /// interface cannot be created.
    fn add_endpoints(&mut self, info: &EndpointInfo) -> HitchResult<()>;

    /// Attach the host end and program its forwarding rules.
    ///
    /// # Errors
    ///
    /// Returns an error on the first rule or attachment that fails.
    fn add_endpoint_rules(&mut self, info: &EndpointInfo) -> HitchResult<()>;

    /// Move the container end(s) into `ns`.
    ///
    /// # Errors
    ///
    /// Returns [`hitch_common::HitchError::NamespaceOperationFailed`] if a
    /// move fails.
    fn move_endpoints_to_container_ns(&mut self, info: &EndpointInfo, ns: &Namespace) -> HitchResult<()>;

    /// Rename the container end(s) and bring them up.
    ///
    /// # Errors
    ///
    /// Returns an error if an interface cannot be renamed or brought up.
    fn setup_container_interfaces(&mut self, info: &EndpointInfo) -> HitchResult<()>;

    /// Assign addresses and install routes inside the container.
    ///
    /// # Errors
    ///
    /// Returns an error on the first address or route that fails.
    fn configure_container_interfaces_and_routes(&mut self, info: &EndpointInfo) -> HitchResult<()>;

    /// Remove the forwarding rules. Failures are logged, not returned.
    fn delete_endpoint_rules(&mut self, ep: &Endpoint);

    /// Delete the host end(s), which takes the container end(s) with them.
    ///
    /// # Errors
    ///
    /// Returns an error if an interface cannot be deleted.
    fn delete_endpoints(&mut self, ep: &Endpoint) -> HitchResult<()>;
}

/// Which endpoint client plumbs an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointClientKind {
    /// Veth on a Linux bridge with ebtables NAT.
    LinuxBridge,
    /// Veth as a tagged port on an OVS bridge.
    Ovs,
    /// Routed veth with a fake gateway.
    Calico,
}

impl EndpointClientKind {
    /// VLAN networks use OVS, transparent networks are routed.
    #[must_use]
    pub const fn select(vlan_id: u16, mode: NetworkMode) -> Self {
        if vlan_id != 0 {
            Self::Ovs
        } else if matches!(mode, NetworkMode::Transparent) {
            Self::Calico
        } else {
            Self::LinuxBridge
        }
    }
}

/// Network-side facts an endpoint client works with.
#[derive(Debug, Clone)]
pub struct EndpointContext {
    /// Bridge the host end plugs into. Empty for routed networks.
    pub bridge_name: String,
    /// Uplink name.
    pub ext_if_name: String,
    /// Uplink MAC.
    pub ext_if_mac: MacAddress,
    /// Forwarding mode.
    pub mode: NetworkMode,
    /// VLAN ID.
    pub vlan_id: u16,
    /// Host-side veth.
    pub host_veth: String,
    /// Container-side veth, renamed to the container interface name during
    /// setup.
    pub container_veth: String,
}

impl EndpointContext {
    fn base(network: &Network, ext_if: &ExternalInterface, host_veth: String, container_veth: String) -> Self {
        Self {
            bridge_name: ext_if.bridge_name.clone().unwrap_or_default(),
            ext_if_name: ext_if.name.clone(),
            ext_if_mac: ext_if.mac,
            mode: network.mode,
            vlan_id: network.vlan_id,
            host_veth,
            container_veth,
        }
    }

    /// Context for creating a new endpoint.
    #[must_use]
    pub fn for_info(network: &Network, ext_if: &ExternalInterface, info: &EndpointInfo) -> Self {
        let (host_veth, container_veth) = veth_names(&info.id, info.veth_key.as_deref());
        Self::base(network, ext_if, host_veth, container_veth)
    }

    /// Context for tearing down a stored endpoint.
    #[must_use]
    pub fn for_endpoint(network: &Network, ext_if: &ExternalInterface, ep: &Endpoint) -> Self {
        Self::base(network, ext_if, ep.host_if_name.clone(), ep.if_name.clone())
    }
}

/// Build the endpoint client for `kind`.
///
/// SNAT settings only apply to OVS endpoints and are ignored otherwise.
#[must_use]
pub fn endpoint_client<'a>(
    cp: &'a dyn ControlPlane,
    kind: EndpointClientKind,
    ctx: EndpointContext,
    snat: Option<SnatSettings>,
) -> Box<dyn EndpointClient + 'a> {
    if snat.is_some() && kind != EndpointClientKind::Ovs {
        tracing::warn!(?kind, "SNAT interface requested on a non-VLAN network, ignoring");
    }
    match kind {
        EndpointClientKind::LinuxBridge => Box::new(LinuxBridgeEndpointClient::new(cp, ctx)),
        EndpointClientKind::Calico => Box::new(CalicoEndpointClient::new(cp, ctx)),
        EndpointClientKind::Ovs => {
            let bridge = ctx.bridge_name.clone();
            let snat = snat.map(|settings| SnatEndpointClient::new(cp, settings, &bridge));
            Box::new(OvsEndpointClient::new(cp, ctx, snat))
        }
    }
}

fn client_for_info<'a>(
    cp: &'a dyn ControlPlane,
    network: &Network,
    ext_if: &ExternalInterface,
    info: &EndpointInfo,
) -> (EndpointContext, Box<dyn EndpointClient + 'a>) {
    let ctx = EndpointContext::for_info(network, ext_if, info);
    let kind = EndpointClientKind::select(network.vlan_id, network.mode);
    let snat = SnatSettings::for_info(info, network.snat_bridge_ip).map(|s| s.shared_within(network, &info.id));
    (ctx.clone(), endpoint_client(cp, kind, ctx, snat))
}

/// Create and plumb an endpoint.
///
/// Once the veth pair exists, any later failure removes the endpoint's rules
/// and interfaces again before the error is returned. Container-side steps
/// run inside the namespace, and the thread is back in its own namespace
/// before rollback starts.
///
/// # Errors
///
/// Returns the error of the first step that failed.
pub fn create_endpoint(
    host: &HostContext,
    network: &Network,
    ext_if: &ExternalInterface,
    info: &EndpointInfo,
) -> HitchResult<Endpoint> {
    let cp = host.control_plane.as_ref();
    let (ctx, mut client) = client_for_info(cp, network, ext_if, info);

    tracing::info!(
        network = %network.id,
        endpoint = %info.id,
        host_if = %ctx.host_veth,
        "Creating endpoint"
    );
    client.add_endpoints(info)?;

    let mut ep = Endpoint {
        id: info.id.clone(),
        container_id: info.container_id.clone(),
        netns_path: info.netns_path.clone(),
        if_name: info.if_name.clone(),
        host_if_name: ctx.host_veth.clone(),
        mac: MacAddress::default(),
        ip_addresses: info.ip_addresses.clone(),
        routes: info.routes.clone(),
        gateways: ext_if.ipv4_gateway.into_iter().collect(),
        vlan_id: network.vlan_id,
        dns: info.dns.clone(),
        enable_snat_on_host: info.enable_snat_on_host,
        allow_inbound_host_to_nc: info.allow_inbound_host_to_nc,
        allow_inbound_nc_to_host: info.allow_inbound_nc_to_host,
        local_ip: info.local_ip,
    };

    match plumb(host, client.as_mut(), info) {
        Ok(mac) => {
            ep.mac = mac;
            tracing::info!(endpoint = %ep.id, mac = %ep.mac, "Endpoint created");
            Ok(ep)
        }
        Err(PlumbError::Stranded(e)) => {
            // Still inside the container namespace: host-side cleanup would
            // hit the wrong interfaces.
            tracing::error!(endpoint = %ep.id, error = %e, "Could not return to host namespace, skipping rollback");
            Err(e)
        }
        Err(PlumbError::Failed(e)) => {
            tracing::error!(endpoint = %ep.id, error = %e, "Endpoint setup failed, rolling back");
            client.delete_endpoint_rules(&ep);
            if let Err(cleanup) = client.delete_endpoints(&ep) {
                tracing::warn!(endpoint = %ep.id, error = %cleanup, "Failed to delete endpoint interfaces");
            }
            Err(e)
        }
    }
}

/// Why plumbing stopped.
enum PlumbError {
    /// A step failed and the thread is in the host namespace.
    Failed(HitchError),
    /// Leaving the container namespace failed.
    Stranded(HitchError),
}

impl From<HitchError> for PlumbError {
    fn from(e: HitchError) -> Self {
        Self::Failed(e)
    }
}

fn plumb(
    host: &HostContext,
    client: &mut dyn EndpointClient,
    info: &EndpointInfo,
) -> Result<MacAddress, PlumbError> {
    client.add_endpoint_rules(info)?;

    let Some(path) = info.netns_path.as_deref() else {
        return Ok(configure_container(host.control_plane.as_ref(), client, info)?);
    };

    let ns = Namespace::open(host.namespaces.clone(), path)?;
    client.move_endpoints_to_container_ns(info, &ns)?;

    let guard = ns.enter()?;
    let configured = configure_container(host.control_plane.as_ref(), client, info);
    guard.exit().map_err(PlumbError::Stranded)?;
    ns.close();
    Ok(configured?)
}

fn configure_container(
    cp: &dyn ControlPlane,
    client: &mut dyn EndpointClient,
    info: &EndpointInfo,
) -> HitchResult<MacAddress> {
    client.setup_container_interfaces(info)?;
    client.configure_container_interfaces_and_routes(info)?;
    common::link_mac(cp, &info.if_name)
}

/// Remove an endpoint's rules and interfaces.
///
/// Rule removal is best effort. Failing to delete the host veth is an error.
///
/// # Errors
///
/// Returns an error if an interface cannot be deleted.
pub fn delete_endpoint(
    host: &HostContext,
    network: &Network,
    ext_if: &ExternalInterface,
    ep: &Endpoint,
) -> HitchResult<()> {
    let cp = host.control_plane.as_ref();
    let ctx = EndpointContext::for_endpoint(network, ext_if, ep);
    let kind = EndpointClientKind::select(network.vlan_id, network.mode);
    let snat = SnatSettings::for_endpoint(ep, network.snat_bridge_ip).map(|s| s.shared_within(network, &ep.id));
    let mut client = endpoint_client(cp, kind, ctx, snat);

    tracing::info!(network = %network.id, endpoint = %ep.id, host_if = %ep.host_if_name, "Deleting endpoint");
    client.delete_endpoint_rules(ep);
    client.delete_endpoints(ep)
}

/// IPv4 addresses of an endpoint.
pub(crate) fn ipv4_addresses(addresses: &[IpNet]) -> impl Iterator<Item = std::net::IpAddr> + '_ {
    addresses
        .iter()
        .filter(|addr| matches!(addr, IpNet::V4(_)))
        .map(IpNet::addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn veth_names_from_id() {
        let (host, container) = veth_names("1a2b3c4d-eth0", None);
        assert_eq!(host, "azv1a2b3c4");
        assert_eq!(container, "azv1a2b3c4-2");
    }

    #[test]
    fn veth_names_from_key_fit_ifnamsiz() {
        let (host, container) = veth_names("1a2b3c4d-eth0", Some("default.web-0"));
        assert!(host.starts_with(VETH_PREFIX));
        assert!(host.len() <= 15 && container.len() <= 15);
        assert_eq!(container, format!("{host}2"));
        assert_eq!(veth_names("other-eth0", Some("default.web-0")).0, host);
    }

    #[test]
    fn empty_key_falls_back_to_id() {
        assert_eq!(veth_names("1a2b3c4d-eth0", Some("")).0, "azv1a2b3c4");
    }

    #[test]
    fn client_selection() {
        assert_eq!(
            EndpointClientKind::select(0, NetworkMode::Bridge),
            EndpointClientKind::LinuxBridge
        );
        assert_eq!(
            EndpointClientKind::select(0, NetworkMode::Tunnel),
            EndpointClientKind::LinuxBridge
        );
        assert_eq!(
            EndpointClientKind::select(0, NetworkMode::Transparent),
            EndpointClientKind::Calico
        );
        assert_eq!(EndpointClientKind::select(7, NetworkMode::Bridge), EndpointClientKind::Ovs);
    }
}
