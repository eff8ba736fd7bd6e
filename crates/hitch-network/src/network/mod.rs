//! Network clients.
//!
//! A network client attaches a host uplink to the bridge that containers
//! plug into. Linux bridge networks enslave the uplink and program ebtables
//! NAT rules. VLAN networks use Open vSwitch and program OpenFlow rules
//! instead.

mod linux_bridge;
mod ovs;

pub use linux_bridge::{LinuxBridgeNetworkClient, bridge_l2_rules};
pub use ovs::OvsNetworkClient;

use hitch_common::HitchResult;

use crate::exec::ControlPlane;
use crate::types::{ExternalInterface, NetworkMode};

/// Prefix of bridge names generated from the uplink index.
pub const BRIDGE_PREFIX: &str = "azure";

/// Default bridge name for the uplink with interface index `index`.
#[must_use]
pub fn default_bridge_name(index: u32) -> String {
    format!("{BRIDGE_PREFIX}{index}")
}

/// Bridge-level operations for one network.
pub trait NetworkClient {
    /// Create the bridge. An existing bridge is reused.
    ///
    /// # Errors
    ///
    /// Returns [`hitch_common::HitchError::InterfaceCreationFailed`] if the
    /// bridge cannot be created.
    fn create_bridge(&self) -> HitchResult<()>;

    /// Remove the bridge and anything created alongside it.
    ///
    /// # Errors
    ///
    /// Returns an error if the bridge cannot be removed.
    fn delete_bridge(&self) -> HitchResult<()>;

    /// Program the forwarding rules that let the uplink carry container
    /// traffic.
    ///
    /// # Errors
    ///
    /// Returns [`hitch_common::HitchError::RuleProgrammingFailed`] on the first
    /// rule that cannot be installed.
    fn add_l2_rules(&self, ext_if: &ExternalInterface) -> HitchResult<()>;

    /// Remove the forwarding rules. Failures are logged, not returned.
    fn delete_l2_rules(&self, ext_if: &ExternalInterface);

    /// Attach the uplink to the bridge.
    ///
    /// # Errors
    ///
    /// Returns an error if the uplink cannot be enslaved.
    fn set_bridge_master_to_host_interface(&self) -> HitchResult<()>;

    /// Detach the uplink from the bridge.
    ///
    /// # Errors
    ///
    /// Returns an error if the uplink cannot be released.
    fn release_host_interface(&self) -> HitchResult<()>;

    /// Toggle hairpin forwarding on the uplink's bridge port.
    ///
    /// # Errors
    ///
    /// Returns an error if the port cannot be reconfigured.
    fn set_hairpin_on_host_interface(&self, enable: bool) -> HitchResult<()>;
}

/// Which network client a network uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkClientKind {
    /// Linux bridge with ebtables rules.
    LinuxBridge,
    /// Open vSwitch bridge with OpenFlow rules.
    Ovs,
}

impl NetworkClientKind {
    /// VLAN-tagged networks need Open vSwitch.
    #[must_use]
    pub const fn select(vlan_id: u16) -> Self {
        if vlan_id == 0 { Self::LinuxBridge } else { Self::Ovs }
    }
}

/// Everything a network client needs to know about its network.
#[derive(Debug, Clone)]
pub struct BridgeSpec {
    /// Bridge name.
    pub bridge_name: String,
    /// Uplink name.
    pub ext_if_name: String,
    /// Forwarding mode.
    pub mode: NetworkMode,
    /// SNAT bridge gateway, when the network hosts SNAT interfaces.
    pub snat_bridge_ip: Option<ipnet::IpNet>,
}

/// Build the network client for `kind`.
#[must_use]
pub fn network_client<'a>(
    cp: &'a dyn ControlPlane,
    kind: NetworkClientKind,
    spec: BridgeSpec,
) -> Box<dyn NetworkClient + 'a> {
    match kind {
        NetworkClientKind::LinuxBridge => Box::new(LinuxBridgeNetworkClient::new(cp, spec)),
        NetworkClientKind::Ovs => Box::new(OvsNetworkClient::new(cp, spec)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vlan_selects_ovs() {
        assert_eq!(NetworkClientKind::select(0), NetworkClientKind::LinuxBridge);
        assert_eq!(NetworkClientKind::select(100), NetworkClientKind::Ovs);
    }

    #[test]
    fn bridge_name_from_index() {
        assert_eq!(default_bridge_name(2), "azure2");
    }
}
