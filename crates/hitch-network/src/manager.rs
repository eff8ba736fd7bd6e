//! Network manager.
//!
//! The manager owns the persisted [`NetworkState`]: every network, the host
//! uplinks they share and their endpoints. Callers restore it from the state
//! store under the store lock, run one operation and save it back.
//!
//! The first bridged network on an uplink connects it: the uplink's
//! addresses and routes are moved onto a new bridge and the uplink is
//! enslaved. The last network to leave disconnects it and puts the
//! addresses back.

use std::collections::BTreeMap;
use std::net::IpAddr;

use hitch_common::{HitchError, HitchResult, KeyValueStore};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::HostContext;
use crate::ebtables::{Ebtables, RuleSet};
use crate::endpoint::{self, endpoint_l2_rules, snat};
use crate::exec::ControlPlane;
use crate::link;
use crate::network::{self, BridgeSpec, NetworkClient, NetworkClientKind, bridge_l2_rules};
use crate::types::{DnsConfig, Endpoint, EndpointInfo, ExternalInterface, Network, NetworkInfo, Route};

/// Store key of the network state.
pub const STATE_KEY: &str = "Network";

/// Everything the manager persists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkState {
    /// Host uplinks keyed by interface name.
    #[serde(default)]
    pub external_interfaces: BTreeMap<String, ExternalInterface>,
    /// Networks keyed by ID.
    #[serde(default)]
    pub networks: BTreeMap<String, Network>,
}

/// Creates and deletes networks and endpoints.
#[derive(Debug)]
pub struct NetworkManager {
    host: HostContext,
    state: NetworkState,
}

impl NetworkManager {
    /// Manager with no networks.
    #[must_use]
    pub fn new(host: HostContext) -> Self {
        Self {
            host,
            state: NetworkState::default(),
        }
    }

    /// Load the state saved by a previous invocation. A store that has never
    /// been written yields an empty state.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored state cannot be read or decoded.
    pub fn restore<S: KeyValueStore>(host: HostContext, store: &mut S) -> HitchResult<Self> {
        let state = match store.read::<NetworkState>(STATE_KEY) {
            Ok(state) => state,
            Err(HitchError::StateNotFound { .. }) => {
                tracing::debug!("No saved network state");
                NetworkState::default()
            }
            Err(e) => return Err(e),
        };
        tracing::debug!(networks = state.networks.len(), "Restored network state");
        Ok(Self { host, state })
    }

    /// Persist the current state.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails.
    pub fn save<S: KeyValueStore>(&self, store: &mut S) -> HitchResult<()> {
        store.write(STATE_KEY, &self.state)
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> &NetworkState {
        &self.state
    }

    /// Host handles the manager programs.
    #[must_use]
    pub const fn host(&self) -> &HostContext {
        &self.host
    }

    /// Look up a network.
    #[must_use]
    pub fn network(&self, id: &str) -> Option<&Network> {
        self.state.networks.get(id)
    }

    /// Look up an uplink record.
    #[must_use]
    pub fn external_interface(&self, name: &str) -> Option<&ExternalInterface> {
        self.state.external_interfaces.get(name)
    }

    /// Create a network, connecting its uplink to a bridge if it is the first
    /// bridged network there.
    ///
    /// # Errors
    ///
    /// Returns [`HitchError::NetworkExists`] for a known ID,
    /// [`HitchError::ExternalInterfaceUnavailable`] if no uplink serves the
    /// network, or the error of the bridging step that failed. A failed
    /// connect leaves the uplink as it was.
    pub fn create_network(&mut self, info: &NetworkInfo) -> HitchResult<Network> {
        if self.state.networks.contains_key(&info.id) {
            return Err(HitchError::NetworkExists { id: info.id.clone() });
        }

        let cp = self.host.control_plane.clone();
        let ext_name = self.discover_external_interface(info)?;
        let uplink = link::require_link(cp.as_ref(), &ext_name)?;
        let mac = uplink.mac.ok_or_else(|| HitchError::ExternalInterfaceUnavailable {
            name: ext_name.clone(),
        })?;

        tracing::info!(
            network = %info.id,
            mode = %info.mode,
            ext_if = %ext_name,
            vlan = info.vlan_id,
            "Creating network"
        );

        let mut ext_if = self
            .state
            .external_interfaces
            .get(&ext_name)
            .cloned()
            .unwrap_or_else(|| ExternalInterface::new(&ext_name, mac));
        for subnet in info.subnets.iter().map(IpNet::trunc) {
            if !ext_if.subnets.contains(&subnet) {
                ext_if.subnets.push(subnet);
            }
        }

        let snat_bridge_ip = effective_snat_bridge_ip(info);
        if info.mode.is_bridged() && ext_if.bridge_name.is_none() {
            let bridge = info
                .bridge_name
                .clone()
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| network::default_bridge_name(uplink.index));
            let spec = BridgeSpec {
                bridge_name: bridge,
                ext_if_name: ext_name.clone(),
                mode: info.mode,
                snat_bridge_ip,
            };
            connect_external_interface(cp.as_ref(), &mut ext_if, spec, info.vlan_id)?;
        }
        ext_if.networks.insert(info.id.clone());

        let network = Network {
            id: info.id.clone(),
            mode: info.mode,
            ext_if_name: ext_name.clone(),
            vlan_id: info.vlan_id,
            dns: info.dns.clone(),
            snat_bridge_ip,
            enable_snat_on_host: info.enable_snat_on_host,
            endpoints: BTreeMap::new(),
        };
        self.state.external_interfaces.insert(ext_name, ext_if);
        self.state.networks.insert(network.id.clone(), network.clone());

        tracing::info!(network = %network.id, "Network created");
        Ok(network)
    }

    /// Delete a network. The last network on an uplink disconnects it.
    ///
    /// # Errors
    ///
    /// Returns [`HitchError::NetworkNotFound`] for an unknown ID and
    /// [`HitchError::NetworkHasEndpoints`] while endpoints remain.
    pub fn delete_network(&mut self, id: &str) -> HitchResult<()> {
        let network = self
            .state
            .networks
            .get(id)
            .cloned()
            .ok_or_else(|| HitchError::NetworkNotFound { id: id.to_string() })?;
        if !network.endpoints.is_empty() {
            return Err(HitchError::NetworkHasEndpoints {
                id: id.to_string(),
                count: network.endpoints.len(),
            });
        }

        tracing::info!(network = id, ext_if = %network.ext_if_name, "Deleting network");
        let cp = self.host.control_plane.clone();
        if let Some(ext_if) = self.state.external_interfaces.get_mut(&network.ext_if_name) {
            ext_if.networks.remove(id);
            if ext_if.networks.is_empty() {
                disconnect_external_interface(cp.as_ref(), ext_if, &network);
            }
        }
        self.state.external_interfaces.retain(|_, ext_if| !ext_if.networks.is_empty());
        self.state.networks.remove(id);

        if !self.state.external_interfaces.values().any(|e| e.bridge_name.is_some()) {
            if let Err(e) = Ebtables::new(cp.as_ref()).uninitialize() {
                tracing::warn!(error = %e, "Failed to remove ebtables chains");
            }
        }
        Ok(())
    }

    /// Create an endpoint on a network and record it.
    ///
    /// # Errors
    ///
    /// Returns [`HitchError::DuplicateEndpoint`] before touching the host if
    /// the ID is taken, [`HitchError::NetworkNotFound`] for an unknown
    /// network, or the error of the plumbing step that failed. Nothing is
    /// recorded on failure.
    pub fn create_endpoint(&mut self, network_id: &str, info: &EndpointInfo) -> HitchResult<Endpoint> {
        let network = self
            .state
            .networks
            .get(network_id)
            .ok_or_else(|| HitchError::NetworkNotFound {
                id: network_id.to_string(),
            })?;
        if network.endpoints.contains_key(&info.id) {
            return Err(HitchError::DuplicateEndpoint {
                network: network_id.to_string(),
                endpoint: info.id.clone(),
            });
        }

        let ext_if = self.uplink_of(network)?;
        if network.mode.is_bridged() && ext_if.bridge_name.is_none() {
            return Err(HitchError::ExternalInterfaceUnavailable {
                name: ext_if.name.clone(),
            });
        }

        let ep = endpoint::create_endpoint(&self.host, network, ext_if, info)?;
        if let Some(network) = self.state.networks.get_mut(network_id) {
            network.endpoints.insert(ep.id.clone(), ep.clone());
        }
        Ok(ep)
    }

    /// Delete an endpoint. An endpoint that does not exist is already deleted.
    ///
    /// The endpoint stays recorded if its host interface cannot be removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the host interface cannot be deleted.
    pub fn delete_endpoint(&mut self, network_id: &str, endpoint_id: &str) -> HitchResult<()> {
        let Some(network) = self.state.networks.get(network_id) else {
            tracing::debug!(network = network_id, endpoint = endpoint_id, "Network absent, nothing to delete");
            return Ok(());
        };
        let Some(ep) = network.endpoints.get(endpoint_id) else {
            tracing::debug!(network = network_id, endpoint = endpoint_id, "Endpoint absent, nothing to delete");
            return Ok(());
        };

        let ext_if = self.uplink_of(network)?;
        endpoint::delete_endpoint(&self.host, network, ext_if, ep)?;

        if let Some(network) = self.state.networks.get_mut(network_id) {
            network.endpoints.remove(endpoint_id);
        }
        tracing::info!(network = network_id, endpoint = endpoint_id, "Endpoint deleted");
        Ok(())
    }

    /// Look up an endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`HitchError::EndpointNotFound`] if the network or endpoint is
    /// unknown.
    pub fn get_endpoint(&self, network_id: &str, endpoint_id: &str) -> HitchResult<&Endpoint> {
        self.state
            .networks
            .get(network_id)
            .and_then(|network| network.endpoints.get(endpoint_id))
            .ok_or_else(|| HitchError::EndpointNotFound {
                network: network_id.to_string(),
                endpoint: endpoint_id.to_string(),
            })
    }

    /// Replace the DNS settings recorded for an endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`HitchError::EndpointNotFound`] if the endpoint is unknown.
    pub fn update_endpoint_dns(
        &mut self,
        network_id: &str,
        endpoint_id: &str,
        dns: DnsConfig,
    ) -> HitchResult<Endpoint> {
        let ep = self
            .state
            .networks
            .get_mut(network_id)
            .and_then(|network| network.endpoints.get_mut(endpoint_id))
            .ok_or_else(|| HitchError::EndpointNotFound {
                network: network_id.to_string(),
                endpoint: endpoint_id.to_string(),
            })?;
        tracing::info!(network = network_id, endpoint = endpoint_id, servers = ?dns.servers, "Updating endpoint DNS");
        ep.dns = dns;
        Ok(ep.clone())
    }

    /// The ebtables rules the current state calls for.
    ///
    /// Only Linux bridge networks have ebtables rules. OVS networks keep
    /// their forwarding state in flows.
    #[must_use]
    pub fn desired_l2_rules(&self) -> RuleSet {
        let mut rules = RuleSet::new();
        for network in self.state.networks.values() {
            if network.vlan_id != 0 || !network.mode.is_bridged() {
                continue;
            }
            let Some(ext_if) = self.state.external_interfaces.get(&network.ext_if_name) else {
                continue;
            };
            let Some(bridge) = ext_if.bridge_name.as_deref() else {
                continue;
            };

            rules.extend(bridge_l2_rules(ext_if, bridge, network.mode));
            for ep in network.endpoints.values() {
                rules.extend(endpoint_l2_rules(&ext_if.name, network.mode, &ep.ip_addresses, ep.mac));
            }
        }
        rules
    }

    fn uplink_of(&self, network: &Network) -> HitchResult<&ExternalInterface> {
        self.state
            .external_interfaces
            .get(&network.ext_if_name)
            .ok_or_else(|| HitchError::ExternalInterfaceUnavailable {
                name: network.ext_if_name.clone(),
            })
    }

    /// Uplink named in the request, else a known uplink already serving one
    /// of the subnets, else the interface holding an address in one of them.
    fn discover_external_interface(&self, info: &NetworkInfo) -> HitchResult<String> {
        if !info.master_if_name.is_empty() {
            return Ok(info.master_if_name.clone());
        }

        let subnets: Vec<IpNet> = info.subnets.iter().map(IpNet::trunc).collect();
        if let Some(ext_if) = self
            .state
            .external_interfaces
            .values()
            .find(|ext_if| ext_if.subnets.iter().any(|s| subnets.contains(s)))
        {
            return Ok(ext_if.name.clone());
        }

        let addresses = link::list_addresses(self.host.control_plane.as_ref(), None)?;
        for (dev, addr) in addresses {
            if !subnets.iter().any(|subnet| subnet.contains(&addr.addr())) {
                continue;
            }
            // The address may already have moved onto one of our bridges.
            let name = self
                .state
                .external_interfaces
                .values()
                .find(|ext_if| ext_if.bridge_name.as_deref() == Some(dev.as_str()))
                .map_or(dev, |ext_if| ext_if.name.clone());
            tracing::debug!(ext_if = %name, addr = %addr, "Discovered external interface by subnet");
            return Ok(name);
        }

        Err(HitchError::ExternalInterfaceUnavailable {
            name: subnets.iter().map(ToString::to_string).collect::<Vec<_>>().join(","),
        })
    }
}

/// SNAT bridge gateway for a network, if it hosts SNAT interfaces.
fn effective_snat_bridge_ip(info: &NetworkInfo) -> Option<IpNet> {
    if info.vlan_id == 0 {
        return None;
    }
    match info.snat_bridge_ip {
        Some(ip) => Some(ip),
        None if info.enable_snat_on_host => Some(snat::default_snat_bridge_ip()),
        None => None,
    }
}

fn connect_external_interface(
    cp: &dyn ControlPlane,
    ext_if: &mut ExternalInterface,
    spec: BridgeSpec,
    vlan_id: u16,
) -> HitchResult<()> {
    let bridge = spec.bridge_name.clone();
    let client = network::network_client(cp, NetworkClientKind::select(vlan_id), spec);
    let existed = link::link_exists(cp, &bridge);

    tracing::info!(ext_if = %ext_if.name, bridge = %bridge, existed, "Connecting external interface");
    if !existed {
        client.create_bridge()?;
    }

    if let Err(e) = attach(cp, client.as_ref(), ext_if, &bridge) {
        tracing::error!(ext_if = %ext_if.name, bridge = %bridge, error = %e, "Failed to connect external interface, rolling back");
        client.delete_l2_rules(ext_if);
        if let Err(cleanup) = client.release_host_interface() {
            tracing::warn!(ext_if = %ext_if.name, error = %cleanup, "Failed to release external interface");
        }
        if !existed {
            if let Err(cleanup) = client.delete_bridge() {
                tracing::warn!(bridge = %bridge, error = %cleanup, "Failed to delete bridge");
            }
        }
        if let Err(cleanup) = apply_ip_config(cp, ext_if, &ext_if.name) {
            tracing::warn!(ext_if = %ext_if.name, error = %cleanup, "Failed to restore IP configuration");
        }
        clear_ip_config(ext_if);
        return Err(e);
    }

    ext_if.bridge_name = Some(bridge);
    Ok(())
}

fn attach(
    cp: &dyn ControlPlane,
    client: &dyn NetworkClient,
    ext_if: &mut ExternalInterface,
    bridge: &str,
) -> HitchResult<()> {
    save_ip_config(cp, ext_if)?;
    // OVS flows are keyed by the uplink's port number, so the port comes first.
    client.set_bridge_master_to_host_interface()?;
    client.add_l2_rules(ext_if)?;
    client.set_hairpin_on_host_interface(true)?;
    link::set_link_state(cp, bridge, true)?;
    apply_ip_config(cp, ext_if, bridge)
}

fn disconnect_external_interface(cp: &dyn ControlPlane, ext_if: &mut ExternalInterface, network: &Network) {
    let Some(bridge) = ext_if.bridge_name.clone() else {
        return;
    };
    let spec = BridgeSpec {
        bridge_name: bridge.clone(),
        ext_if_name: ext_if.name.clone(),
        mode: network.mode,
        snat_bridge_ip: network.snat_bridge_ip,
    };
    let client = network::network_client(cp, NetworkClientKind::select(network.vlan_id), spec);

    tracing::info!(ext_if = %ext_if.name, bridge = %bridge, "Disconnecting external interface");
    client.delete_l2_rules(ext_if);
    if let Err(e) = client.release_host_interface() {
        tracing::warn!(ext_if = %ext_if.name, error = %e, "Failed to release external interface");
    }
    if let Err(e) = client.delete_bridge() {
        tracing::warn!(bridge = %bridge, error = %e, "Failed to delete bridge");
    }
    if let Err(e) = apply_ip_config(cp, ext_if, &ext_if.name) {
        tracing::warn!(ext_if = %ext_if.name, error = %e, "Failed to restore IP configuration");
    }
    clear_ip_config(ext_if);
    ext_if.bridge_name = None;
}

/// Record the uplink's addresses and routes, then take the addresses off it.
fn save_ip_config(cp: &dyn ControlPlane, ext_if: &mut ExternalInterface) -> HitchResult<()> {
    ext_if.routes = link::list_routes(cp, &ext_if.name)?;
    ext_if.ipv4_gateway = ext_if
        .routes
        .iter()
        .filter(|route| route.is_default())
        .find_map(|route| route.gateway.filter(IpAddr::is_ipv4));
    ext_if.ip_addresses = link::list_addresses(cp, Some(&ext_if.name))?
        .into_iter()
        .map(|(_, addr)| addr)
        .collect();

    tracing::debug!(
        ext_if = %ext_if.name,
        addresses = ext_if.ip_addresses.len(),
        routes = ext_if.routes.len(),
        "Saved IP configuration"
    );
    for addr in &ext_if.ip_addresses {
        link::delete_address(cp, &ext_if.name, *addr)?;
    }
    Ok(())
}

/// Put the saved addresses, then the saved routes, on `dev`.
fn apply_ip_config(cp: &dyn ControlPlane, ext_if: &ExternalInterface, dev: &str) -> HitchResult<()> {
    for addr in &ext_if.ip_addresses {
        link::add_address(cp, dev, *addr)?;
    }
    for route in &ext_if.routes {
        let route = Route {
            dev: None,
            ..route.clone()
        };
        link::add_route(cp, dev, &route)?;
    }
    Ok(())
}

fn clear_ip_config(ext_if: &mut ExternalInterface) {
    ext_if.ip_addresses.clear();
    ext_if.routes.clear();
    ext_if.ipv4_gateway = None;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use hitch_common::JsonFileStore;

    use super::*;
    use crate::ebtables::{EbtablesCommand, HITCH_PREROUTING, RuleAction};
    use crate::exec::HostCommand;
    use crate::fake::FakeHost;
    use crate::iptables;
    use crate::link::LinkCommand;
    use crate::types::NetworkMode;

    const NETNS: &str = "/var/run/netns/c1";
    const HOST: &str = FakeHost::HOST_NS;

    fn host() -> Arc<FakeHost> {
        let host = Arc::new(FakeHost::new());
        host.add_device("eth0", "00:0d:3a:f3:1c:4e".parse().unwrap(), &["10.0.0.4/24"]);
        host.add_device_route("eth0", Route::link("10.0.0.0/24".parse().unwrap()));
        host.add_device_route("eth0", Route::default_via("10.0.0.1".parse().unwrap()));
        host.add_namespace(NETNS);
        host
    }

    fn n1() -> NetworkInfo {
        NetworkInfo {
            id: "n1".to_string(),
            mode: NetworkMode::Bridge,
            subnets: vec!["10.0.0.0/24".parse().unwrap()],
            ..NetworkInfo::default()
        }
    }

    fn e1() -> EndpointInfo {
        EndpointInfo {
            id: "1a2b3c4d-eth0".to_string(),
            container_id: "1a2b3c4d5e6f".to_string(),
            netns_path: Some(NETNS.into()),
            if_name: "eth0".to_string(),
            ip_addresses: vec!["10.0.0.5/24".parse().unwrap()],
            routes: vec![Route::default_via("10.0.0.1".parse().unwrap())],
            ..EndpointInfo::default()
        }
    }

    fn manager(host: &Arc<FakeHost>) -> NetworkManager {
        NetworkManager::new(HostContext::fake(host))
    }

    #[test_log::test]
    fn bridge_network_endpoint_lifecycle() {
        let host = host();
        let mut nm = manager(&host);
        nm.create_network(&n1()).unwrap();

        assert_eq!(host.link_master(HOST, "eth0").as_deref(), Some("azure2"));
        assert_eq!(host.link_addresses(HOST, "azure2"), vec!["10.0.0.4/24".parse().unwrap()]);
        assert!(host.link_addresses(HOST, "eth0").is_empty());
        assert_eq!(
            nm.external_interface("eth0").unwrap().ipv4_gateway,
            Some("10.0.0.1".parse().unwrap())
        );

        let ep = nm.create_endpoint("n1", &e1()).unwrap();
        assert_eq!(ep.host_if_name, "azv1a2b3c4");
        assert_eq!(host.current_namespace(), HOST);
        assert_eq!(host.link_master(HOST, "azv1a2b3c4").as_deref(), Some("azure2"));
        assert!(!host.has_link(HOST, "azv1a2b3c4-2"));
        assert_eq!(host.link_addresses(NETNS, "eth0"), vec!["10.0.0.5/24".parse().unwrap()]);
        assert_eq!(host.link_mac(NETNS, "eth0"), Some(ep.mac));

        let rules = host.ebtables_rules(HITCH_PREROUTING);
        assert!(rules.iter().any(|r| r.contains("--arp-ip-dst 10.0.0.5") && r.contains("arpreply")));
        assert!(rules.iter().any(|r| r.contains("--ip-dst 10.0.0.5") && r.contains("dnat")));

        nm.delete_endpoint("n1", &ep.id).unwrap();
        assert!(!host.has_link(HOST, "azv1a2b3c4"));
        assert!(!host.has_link(NETNS, "eth0"));
        assert!(!host.ebtables_rules(HITCH_PREROUTING).iter().any(|r| r.contains("10.0.0.5")));
        assert!(matches!(
            nm.get_endpoint("n1", &ep.id),
            Err(HitchError::EndpointNotFound { .. })
        ));
    }

    #[test]
    fn delete_is_idempotent() {
        let host = host();
        let mut nm = manager(&host);
        nm.create_network(&n1()).unwrap();
        nm.create_endpoint("n1", &e1()).unwrap();

        nm.delete_endpoint("n1", "1a2b3c4d-eth0").unwrap();
        nm.delete_endpoint("n1", "1a2b3c4d-eth0").unwrap();
        nm.delete_endpoint("missing", "1a2b3c4d-eth0").unwrap();
    }

    #[test]
    fn duplicate_endpoint_touches_nothing() {
        let host = host();
        let mut nm = manager(&host);
        nm.create_network(&n1()).unwrap();
        nm.create_endpoint("n1", &e1()).unwrap();

        let before = host.commands().len();
        let err = nm.create_endpoint("n1", &e1()).unwrap_err();
        assert!(matches!(err, HitchError::DuplicateEndpoint { .. }));
        assert_eq!(host.commands().len(), before);
    }

    #[test]
    fn rule_failure_rolls_back_endpoint() {
        let host = host();
        let mut nm = manager(&host);
        nm.create_network(&n1()).unwrap();

        host.fail_when(|cmd| {
            matches!(cmd, HostCommand::Ebtables(EbtablesCommand::Rule { action: RuleAction::Append, rule })
                if rule.spec.contains("10.0.0.5"))
        });
        let err = nm.create_endpoint("n1", &e1()).unwrap_err();
        assert!(matches!(err, HitchError::RuleProgrammingFailed { .. }));
        assert!(!host.has_link(HOST, "azv1a2b3c4"));
        assert!(!host.has_link(HOST, "azv1a2b3c4-2"));
        assert!(nm.network("n1").unwrap().endpoints.is_empty());
    }

    #[test]
    fn failure_inside_namespace_restores_host_namespace() {
        let host = host();
        let mut nm = manager(&host);
        nm.create_network(&n1()).unwrap();

        host.fail_when(|cmd| matches!(cmd, HostCommand::Link(LinkCommand::AddAddress { dev, .. }) if dev == "eth0"));
        assert!(nm.create_endpoint("n1", &e1()).is_err());

        assert_eq!(host.current_namespace(), HOST);
        assert!(host.links_in(NETNS).is_empty());
        assert!(!host.has_link(HOST, "azv1a2b3c4"));
        assert!(host.ebtables_rules(HITCH_PREROUTING).iter().all(|r| !r.contains("10.0.0.5")));
    }

    #[test]
    fn stranded_in_namespace_skips_rollback() {
        let host = host();
        let mut nm = manager(&host);
        nm.create_network(&n1()).unwrap();

        host.block_namespace_switch(HOST);
        let err = nm.create_endpoint("n1", &e1()).unwrap_err();
        assert!(matches!(err, HitchError::NamespaceOperationFailed { .. }));

        assert_eq!(host.current_namespace(), NETNS);
        assert!(host.commands().iter().all(|c| !c.contains("link delete")));
        assert!(host.has_link(HOST, "azv1a2b3c4"));
        assert!(nm.network("n1").unwrap().endpoints.is_empty());
    }

    #[test]
    fn missing_namespace_rolls_back() {
        let host = host();
        let mut nm = manager(&host);
        nm.create_network(&n1()).unwrap();

        let info = EndpointInfo {
            netns_path: Some("/var/run/netns/gone".into()),
            ..e1()
        };
        let err = nm.create_endpoint("n1", &info).unwrap_err();
        assert!(matches!(err, HitchError::NamespaceOperationFailed { .. }));
        assert!(!host.has_link(HOST, "azv1a2b3c4"));
    }

    #[test]
    fn connect_and_disconnect_are_symmetric() {
        let host = host();
        let addrs = host.link_addresses(HOST, "eth0");
        let routes = host.link_routes(HOST, "eth0");

        let mut nm = manager(&host);
        nm.create_network(&n1()).unwrap();
        nm.delete_network("n1").unwrap();

        assert_eq!(host.link_addresses(HOST, "eth0"), addrs);
        assert_eq!(host.link_routes(HOST, "eth0"), routes);
        assert_eq!(host.link_master(HOST, "eth0"), None);
        assert!(!host.has_link(HOST, "azure2"));
        assert!(!host.has_ebtables_chain(HITCH_PREROUTING));
        assert!(nm.state().external_interfaces.is_empty());
    }

    #[test]
    fn failed_connect_restores_uplink() {
        let host = host();
        host.fail_when(|cmd| matches!(cmd, HostCommand::Link(LinkCommand::SetHairpin { .. })));
        let mut nm = manager(&host);
        assert!(nm.create_network(&n1()).is_err());

        assert_eq!(host.link_addresses(HOST, "eth0"), vec!["10.0.0.4/24".parse().unwrap()]);
        assert_eq!(host.link_master(HOST, "eth0"), None);
        assert!(!host.has_link(HOST, "azure2"));
        assert!(nm.network("n1").is_none());
    }

    #[test]
    fn uplink_is_shared_by_networks() {
        let host = host();
        let mut nm = manager(&host);
        nm.create_network(&n1()).unwrap();
        nm.create_network(&NetworkInfo {
            id: "n2".to_string(),
            ..n1()
        })
        .unwrap();
        assert_eq!(nm.external_interface("eth0").unwrap().networks.len(), 2);

        nm.delete_network("n1").unwrap();
        assert!(host.has_link(HOST, "azure2"));
        nm.delete_network("n2").unwrap();
        assert!(!host.has_link(HOST, "azure2"));
    }

    #[test]
    fn network_errors() {
        let host = host();
        let mut nm = manager(&host);
        nm.create_network(&n1()).unwrap();
        nm.create_endpoint("n1", &e1()).unwrap();

        assert!(matches!(nm.create_network(&n1()), Err(HitchError::NetworkExists { .. })));
        assert!(matches!(
            nm.delete_network("n1"),
            Err(HitchError::NetworkHasEndpoints { count: 1, .. })
        ));
        assert!(matches!(nm.delete_network("n9"), Err(HitchError::NetworkNotFound { .. })));

        let unknown_subnet = NetworkInfo {
            id: "n3".to_string(),
            subnets: vec!["192.168.0.0/24".parse().unwrap()],
            ..n1()
        };
        assert!(matches!(
            nm.create_network(&unknown_subnet),
            Err(HitchError::ExternalInterfaceUnavailable { .. })
        ));
    }

    #[test]
    fn vlan_network_uses_ovs() {
        let host = host();
        let mut nm = manager(&host);
        let info = NetworkInfo {
            id: "n100".to_string(),
            vlan_id: 100,
            master_if_name: "eth0".to_string(),
            ..n1()
        };
        nm.create_network(&info).unwrap();
        assert!(host.has_ovs_bridge("azure2"));

        let ep = nm.create_endpoint("n100", &e1()).unwrap();
        let ports = host.ovs_ports("azure2");
        assert!(ports.contains(&(ep.host_if_name.clone(), Some(100))));
        assert!(
            host.ovs_flows("azure2")
                .iter()
                .any(|f| f.contains("nw_dst=10.0.0.5,dl_vlan=100"))
        );
        assert!(nm.desired_l2_rules().is_empty());

        nm.delete_endpoint("n100", &ep.id).unwrap();
        assert!(!host.ovs_flows("azure2").iter().any(|f| f.contains("10.0.0.5")));
        nm.delete_network("n100").unwrap();
        assert!(!host.has_ovs_bridge("azure2"));
        assert_eq!(host.link_addresses(HOST, "eth0"), vec!["10.0.0.4/24".parse().unwrap()]);
    }

    #[test]
    fn shared_snat_address_survives_first_delete() {
        let host = host();
        host.add_namespace("/var/run/netns/c2");
        let mut nm = manager(&host);
        nm.create_network(&NetworkInfo {
            id: "n100".to_string(),
            vlan_id: 100,
            master_if_name: "eth0".to_string(),
            ..n1()
        })
        .unwrap();

        let a = EndpointInfo {
            allow_inbound_host_to_nc: true,
            ..e1()
        };
        let b = EndpointInfo {
            id: "5e6f7a8b-eth0".to_string(),
            container_id: "5e6f7a8b9c0d".to_string(),
            netns_path: Some("/var/run/netns/c2".into()),
            ip_addresses: vec!["10.0.0.6/24".parse().unwrap()],
            ..a.clone()
        };
        let a = nm.create_endpoint("n100", &a).unwrap();
        nm.create_endpoint("n100", &b).unwrap();

        let local_ip: IpAddr = "169.254.0.2".parse().unwrap();
        let accept = vec!["-s 169.254.0.1 -d 169.254.0.2 -j ACCEPT".to_string()];
        let snat_bridge = crate::endpoint::snat::SNAT_BRIDGE;
        assert_eq!(host.iptables_rules(iptables::FILTER, iptables::HITCH_CNI_OUTPUT), accept);

        nm.delete_endpoint("n100", &a.id).unwrap();
        assert_eq!(host.iptables_rules(iptables::FILTER, iptables::HITCH_CNI_OUTPUT), accept);
        assert!(host.neighbor(HOST, snat_bridge, local_ip).is_some());
        assert!(!host.has_link(HOST, "azs1a2b3c4"));

        nm.delete_endpoint("n100", &b.id).unwrap();
        assert!(host.iptables_rules(iptables::FILTER, iptables::HITCH_CNI_OUTPUT).is_empty());
        assert!(host.neighbor(HOST, snat_bridge, local_ip).is_none());
    }

    #[test]
    fn transparent_network_routes_endpoints() {
        let host = host();
        let mut nm = manager(&host);
        let info = NetworkInfo {
            mode: NetworkMode::Transparent,
            ..n1()
        };
        nm.create_network(&info).unwrap();
        assert!(!host.has_link(HOST, "azure2"));

        let ep = nm.create_endpoint("n1", &e1()).unwrap();
        let host_routes = host.link_routes(HOST, &ep.host_if_name);
        assert_eq!(host_routes[0].dst.to_string(), "10.0.0.5/32");
        let gateway: IpAddr = "169.254.1.1".parse().unwrap();
        assert!(host.neighbor(NETNS, "eth0", gateway).is_some());
    }

    #[test]
    fn desired_rules_match_live_rules() {
        let host = host();
        let mut nm = manager(&host);
        nm.create_network(&n1()).unwrap();
        nm.create_endpoint("n1", &e1()).unwrap();

        let desired = nm.desired_l2_rules();
        let live = Ebtables::new(host.as_ref())
            .live_rules(&[HITCH_PREROUTING, crate::ebtables::HITCH_POSTROUTING])
            .unwrap();
        let mut desired_specs: Vec<_> = desired.iter().map(ToString::to_string).collect();
        let mut live_specs: Vec<_> = live.iter().map(ToString::to_string).collect();
        desired_specs.sort();
        live_specs.sort();
        assert_eq!(desired_specs, live_specs);
    }

    #[test]
    fn state_survives_a_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonFileStore::new(dir.path().join("hitch-vnet.json"));
        let host = host();

        let mut nm = manager(&host);
        assert!(NetworkManager::restore(HostContext::fake(&host), &mut store)
            .unwrap()
            .state()
            .networks
            .is_empty());
        nm.create_network(&n1()).unwrap();
        nm.create_endpoint("n1", &e1()).unwrap();
        nm.save(&mut store).unwrap();

        let restored = NetworkManager::restore(HostContext::fake(&host), &mut store).unwrap();
        assert_eq!(restored.state(), nm.state());
        assert!(restored.get_endpoint("n1", "1a2b3c4d-eth0").is_ok());
    }

    #[test]
    fn update_replaces_dns() {
        let host = host();
        let mut nm = manager(&host);
        nm.create_network(&n1()).unwrap();
        nm.create_endpoint("n1", &e1()).unwrap();

        let dns = DnsConfig {
            servers: vec!["168.63.129.16".to_string()],
            ..DnsConfig::default()
        };
        let ep = nm.update_endpoint_dns("n1", "1a2b3c4d-eth0", dns.clone()).unwrap();
        assert_eq!(ep.dns, dns);
        assert!(matches!(
            nm.update_endpoint_dns("n1", "nope", dns),
            Err(HitchError::EndpointNotFound { .. })
        ));
    }
}
