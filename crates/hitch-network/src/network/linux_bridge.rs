//! Linux bridge network client.

use hitch_common::HitchResult;

use super::{BridgeSpec, NetworkClient};
use crate::ebtables::{self, Ebtables, EbtablesRule, VIRTUAL_MAC};
use crate::exec::ControlPlane;
use crate::link;
use crate::types::{ExternalInterface, NetworkMode};

/// Uplink rules for a bridged network.
///
/// Frames leaving the uplink carry the uplink MAC, ARP for the uplink's
/// primary address is answered locally, ARP replies are broadcast to the
/// bridge, and tunnel mode hairpins container traffic through the virtual
/// MAC.
#[must_use]
pub fn bridge_l2_rules(ext_if: &ExternalInterface, bridge: &str, mode: NetworkMode) -> Vec<EbtablesRule> {
    let mut rules = vec![ebtables::snat_rule(&ext_if.name, ext_if.mac)];
    if let Some(primary) = ext_if.primary_ipv4() {
        rules.push(ebtables::arp_reply_rule(primary.addr(), ext_if.mac));
    }
    rules.push(ebtables::arp_reply_dnat_rule(&ext_if.name));
    if mode == NetworkMode::Tunnel {
        rules.extend(ebtables::vepa_rules(bridge, VIRTUAL_MAC));
    }
    rules
}

/// Enslaves the uplink to a Linux bridge.
pub struct LinuxBridgeNetworkClient<'a> {
    cp: &'a dyn ControlPlane,
    spec: BridgeSpec,
}

impl<'a> LinuxBridgeNetworkClient<'a> {
    /// Client for the bridge described by `spec`.
    #[must_use]
    pub const fn new(cp: &'a dyn ControlPlane, spec: BridgeSpec) -> Self {
        Self { cp, spec }
    }
}

impl NetworkClient for LinuxBridgeNetworkClient<'_> {
    fn create_bridge(&self) -> HitchResult<()> {
        link::add_bridge(self.cp, &self.spec.bridge_name)
    }

    fn delete_bridge(&self) -> HitchResult<()> {
        tracing::info!(bridge = %self.spec.bridge_name, "Deleting bridge");
        link::delete_link(self.cp, &self.spec.bridge_name)
    }

    fn add_l2_rules(&self, ext_if: &ExternalInterface) -> HitchResult<()> {
        let ebtables = Ebtables::new(self.cp);
        ebtables.initialize()?;
        for rule in bridge_l2_rules(ext_if, &self.spec.bridge_name, self.spec.mode) {
            ebtables.append_unique(&rule)?;
        }
        Ok(())
    }

    fn delete_l2_rules(&self, ext_if: &ExternalInterface) {
        let mut rules = bridge_l2_rules(ext_if, &self.spec.bridge_name, self.spec.mode);
        rules.reverse();
        Ebtables::new(self.cp).delete_best_effort(&rules);
    }

    fn set_bridge_master_to_host_interface(&self) -> HitchResult<()> {
        let ext_if = &self.spec.ext_if_name;
        // The uplink has to be down while it changes master.
        link::set_link_state(self.cp, ext_if, false)?;
        link::set_link_master(self.cp, ext_if, Some(&self.spec.bridge_name))?;
        link::set_link_state(self.cp, ext_if, true)
    }

    fn release_host_interface(&self) -> HitchResult<()> {
        link::set_link_master(self.cp, &self.spec.ext_if_name, None)
    }

    fn set_hairpin_on_host_interface(&self, enable: bool) -> HitchResult<()> {
        link::set_link_hairpin(self.cp, &self.spec.ext_if_name, enable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeHost;

    fn uplink() -> ExternalInterface {
        let mut ext_if = ExternalInterface::new("eth0", "00:0d:3a:f3:1c:4e".parse().unwrap());
        ext_if.ip_addresses.push("10.240.0.4/16".parse().unwrap());
        ext_if
    }

    fn spec(mode: NetworkMode) -> BridgeSpec {
        BridgeSpec {
            bridge_name: "azure2".to_string(),
            ext_if_name: "eth0".to_string(),
            mode,
            snat_bridge_ip: None,
        }
    }

    #[test]
    fn bridge_mode_rules() {
        let rules = bridge_l2_rules(&uplink(), "azure2", NetworkMode::Bridge);
        let text: Vec<String> = rules.iter().map(ToString::to_string).collect();
        insta::assert_snapshot!(text.join("\n"), @r"
        HITCHPOSTROUTING: -s Unicast -o eth0 -j snat --to-src 00:0d:3a:f3:1c:4e --snat-arp --snat-target ACCEPT
        HITCHPREROUTING: -p ARP --arp-op Request --arp-ip-dst 10.240.0.4 -j arpreply --arpreply-mac 00:0d:3a:f3:1c:4e
        HITCHPREROUTING: -p ARP -i eth0 --arp-op Reply -j dnat --to-dst ff:ff:ff:ff:ff:ff --dnat-target ACCEPT
        ");
    }

    #[test]
    fn tunnel_mode_adds_vepa() {
        let rules = bridge_l2_rules(&uplink(), "cbr0", NetworkMode::Tunnel);
        assert_eq!(rules.len(), 5);
        assert!(rules.iter().any(|r| r.spec.starts_with("-i cbr0 ")));
    }

    #[test]
    fn add_rules_twice_installs_once() {
        let host = FakeHost::new();
        let client = LinuxBridgeNetworkClient::new(&host, spec(NetworkMode::Bridge));

        client.add_l2_rules(&uplink()).unwrap();
        client.add_l2_rules(&uplink()).unwrap();

        assert_eq!(host.ebtables_rules(ebtables::HITCH_PREROUTING).len(), 2);
        assert_eq!(host.ebtables_rules(ebtables::HITCH_POSTROUTING).len(), 1);
        assert_eq!(host.ebtables_rules(ebtables::PREROUTING), vec!["-j HITCHPREROUTING"]);
    }

    #[test]
    fn delete_rules_tolerates_missing() {
        let host = FakeHost::new();
        let client = LinuxBridgeNetworkClient::new(&host, spec(NetworkMode::Bridge));
        client.add_l2_rules(&uplink()).unwrap();
        host.drop_ebtables_rule(
            ebtables::HITCH_PREROUTING,
            &ebtables::arp_reply_dnat_rule("eth0").spec,
        );

        client.delete_l2_rules(&uplink());

        assert!(host.ebtables_rules(ebtables::HITCH_PREROUTING).is_empty());
        assert!(host.ebtables_rules(ebtables::HITCH_POSTROUTING).is_empty());
    }

    #[test]
    fn enslave_and_release() {
        let host = FakeHost::new();
        host.add_device("eth0", "00:0d:3a:f3:1c:4e".parse().unwrap(), &["10.240.0.4/16"]);
        let client = LinuxBridgeNetworkClient::new(&host, spec(NetworkMode::Bridge));

        client.create_bridge().unwrap();
        client.set_bridge_master_to_host_interface().unwrap();
        client.set_hairpin_on_host_interface(true).unwrap();
        assert_eq!(host.link_master(FakeHost::HOST_NS, "eth0").as_deref(), Some("azure2"));
        assert!(host.link_up(FakeHost::HOST_NS, "eth0"));
        assert!(host.link_hairpin(FakeHost::HOST_NS, "eth0"));

        client.release_host_interface().unwrap();
        client.delete_bridge().unwrap();
        assert_eq!(host.link_master(FakeHost::HOST_NS, "eth0"), None);
        assert!(!host.has_link(FakeHost::HOST_NS, "azure2"));
    }
}
