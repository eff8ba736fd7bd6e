//! Open vSwitch network client.

use hitch_common::HitchResult;

use super::{BridgeSpec, NetworkClient};
use crate::endpoint::snat;
use crate::exec::ControlPlane;
use crate::link;
use crate::ovsctl::{self, Ovs};
use crate::types::ExternalInterface;

/// Attaches the uplink to an OVS bridge for VLAN networks.
pub struct OvsNetworkClient<'a> {
    cp: &'a dyn ControlPlane,
    spec: BridgeSpec,
}

impl<'a> OvsNetworkClient<'a> {
    /// Client for the bridge described by `spec`.
    #[must_use]
    pub const fn new(cp: &'a dyn ControlPlane, spec: BridgeSpec) -> Self {
        Self { cp, spec }
    }

    fn ovs(&self) -> Ovs<'a> {
        Ovs::new(self.cp)
    }
}

impl NetworkClient for OvsNetworkClient<'_> {
    fn create_bridge(&self) -> HitchResult<()> {
        self.ovs().create_bridge(&self.spec.bridge_name)?;
        if let Some(ip) = self.spec.snat_bridge_ip {
            if let Err(e) = snat::ensure_snat_bridge(self.cp, ip, &self.spec.bridge_name) {
                snat::teardown_snat_bridge(self.cp, ip, &self.spec.bridge_name);
                if let Err(cleanup) = self.ovs().delete_bridge(&self.spec.bridge_name) {
                    tracing::warn!(bridge = %self.spec.bridge_name, error = %cleanup, "Failed to delete OVS bridge");
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn delete_bridge(&self) -> HitchResult<()> {
        if link::link_exists(self.cp, snat::SNAT_BRIDGE) {
            let ip = self.spec.snat_bridge_ip.unwrap_or_else(snat::default_snat_bridge_ip);
            snat::teardown_snat_bridge(self.cp, ip, &self.spec.bridge_name);
        }
        self.ovs().delete_bridge(&self.spec.bridge_name)
    }

    fn add_l2_rules(&self, ext_if: &ExternalInterface) -> HitchResult<()> {
        let ovs = self.ovs();
        let bridge = &self.spec.bridge_name;
        let host_port = ovs.port_number(&ext_if.name)?;

        if let Some(primary) = ext_if.primary_ipv4() {
            ovs.add_flow(bridge, &ovsctl::host_accept_flow(primary.addr(), ext_if.mac))?;
        }
        ovs.add_flow(bridge, &ovsctl::arp_snat_flow(host_port, ext_if.mac))?;
        ovs.add_flow(bridge, &ovsctl::arp_dnat_flow(host_port))
    }

    fn delete_l2_rules(&self, ext_if: &ExternalInterface) {
        let ovs = self.ovs();
        let bridge = &self.spec.bridge_name;

        if let Some(primary) = ext_if.primary_ipv4() {
            ovs.delete_flows(bridge, &ovsctl::host_accept_match(primary.addr(), ext_if.mac));
        }
        ovs.delete_flows(bridge, &ovsctl::arp_snat_match());
        match ovs.port_number(&ext_if.name) {
            Ok(host_port) => ovs.delete_flows(bridge, &ovsctl::arp_dnat_match(host_port)),
            Err(e) => tracing::warn!(port = %ext_if.name, error = %e, "No OpenFlow port for uplink"),
        }
    }

    fn set_bridge_master_to_host_interface(&self) -> HitchResult<()> {
        let ext_if = &self.spec.ext_if_name;
        link::set_link_state(self.cp, ext_if, false)?;
        self.ovs().add_port(&self.spec.bridge_name, ext_if, 0)?;
        link::set_link_state(self.cp, ext_if, true)
    }

    fn release_host_interface(&self) -> HitchResult<()> {
        self.ovs().delete_port(&self.spec.bridge_name, &self.spec.ext_if_name)
    }

    fn set_hairpin_on_host_interface(&self, _enable: bool) -> HitchResult<()> {
        // OVS reflects traffic back out of its ingress port with `in_port`.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeHost;
    use crate::types::NetworkMode;

    fn spec(snat_bridge_ip: Option<ipnet::IpNet>) -> BridgeSpec {
        BridgeSpec {
            bridge_name: "azure2".to_string(),
            ext_if_name: "eth0".to_string(),
            mode: NetworkMode::Bridge,
            snat_bridge_ip,
        }
    }

    fn host() -> FakeHost {
        let host = FakeHost::new();
        host.add_device("eth0", "00:0d:3a:f3:1c:4e".parse().unwrap(), &["10.240.0.4/16"]);
        host
    }

    fn uplink() -> ExternalInterface {
        let mut ext_if = ExternalInterface::new("eth0", "00:0d:3a:f3:1c:4e".parse().unwrap());
        ext_if.ip_addresses.push("10.240.0.4/16".parse().unwrap());
        ext_if
    }

    #[test]
    fn uplink_flows_use_ofport() {
        let host = host();
        let client = OvsNetworkClient::new(&host, spec(None));
        client.create_bridge().unwrap();
        client.set_bridge_master_to_host_interface().unwrap();
        client.add_l2_rules(&uplink()).unwrap();

        assert_eq!(host.ovs_ports("azure2"), vec![("eth0".to_string(), None)]);
        let flows = host.ovs_flows("azure2");
        assert_eq!(flows.len(), 3);
        assert!(flows[0].contains("nw_dst=10.240.0.4,dl_dst=00:0d:3a:f3:1c:4e"));
        assert!(flows[2].contains("in_port=1"));

        client.delete_l2_rules(&uplink());
        assert!(host.ovs_flows("azure2").is_empty());
    }

    #[test]
    fn snat_bridge_follows_ovs_bridge() {
        let host = host();
        let client = OvsNetworkClient::new(&host, spec(Some(snat::default_snat_bridge_ip())));
        client.create_bridge().unwrap();
        assert!(host.has_link(FakeHost::HOST_NS, snat::SNAT_BRIDGE));

        client.delete_bridge().unwrap();
        assert!(!host.has_link(FakeHost::HOST_NS, snat::SNAT_BRIDGE));
        assert!(!host.has_ovs_bridge("azure2"));
    }
}
