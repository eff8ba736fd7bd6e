//! Open vSwitch bridge, port and flow management.
//!
//! Flows are keyed by OpenFlow port numbers, which OVS assigns when a port
//! is added. They are read back with `ovs-vsctl get Interface <if> ofport`.

use std::net::IpAddr;

use hitch_common::{HitchError, HitchResult, MacAddress};

use crate::ebtables::VIRTUAL_MAC;
use crate::exec::ControlPlane;

/// `ovs-vsctl` and `ovs-ofctl` commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OvsCommand {
    /// Create a bridge.
    AddBridge {
        /// Bridge name.
        bridge: String,
    },
    /// Delete a bridge.
    DeleteBridge {
        /// Bridge name.
        bridge: String,
    },
    /// Attach a port, as an access port when `tag` is set.
    AddPort {
        /// Bridge name.
        bridge: String,
        /// Port name.
        port: String,
        /// VLAN tag.
        tag: Option<u16>,
    },
    /// Detach a port.
    DeletePort {
        /// Bridge name.
        bridge: String,
        /// Port name.
        port: String,
    },
    /// Read the OpenFlow port number of an interface.
    GetOfport {
        /// Interface name.
        interface: String,
    },
    /// Add a flow.
    AddFlow {
        /// Bridge name.
        bridge: String,
        /// Flow in `ovs-ofctl` syntax.
        flow: String,
    },
    /// Delete flows matching a condition.
    DeleteFlows {
        /// Bridge name.
        bridge: String,
        /// Match in `ovs-ofctl` syntax.
        matches: String,
    },
}

impl OvsCommand {
    /// Program implementing the command.
    #[must_use]
    pub const fn program(&self) -> &'static str {
        match self {
            Self::AddFlow { .. } | Self::DeleteFlows { .. } => "ovs-ofctl",
            _ => "ovs-vsctl",
        }
    }

    /// Program arguments.
    #[must_use]
    pub fn args(&self) -> Vec<String> {
        match self {
            Self::AddBridge { bridge } => vec!["add-br".to_string(), bridge.clone()],
            Self::DeleteBridge { bridge } => vec!["del-br".to_string(), bridge.clone()],
            Self::AddPort { bridge, port, tag } => {
                let mut args = vec!["add-port".to_string(), bridge.clone(), port.clone()];
                if let Some(tag) = tag {
                    args.push(format!("tag={tag}"));
                }
                args
            }
            Self::DeletePort { bridge, port } => {
                vec!["del-port".to_string(), bridge.clone(), port.clone()]
            }
            Self::GetOfport { interface } => vec![
                "get".to_string(),
                "Interface".to_string(),
                interface.clone(),
                "ofport".to_string(),
            ],
            Self::AddFlow { bridge, flow } => {
                vec!["add-flow".to_string(), bridge.clone(), flow.clone()]
            }
            Self::DeleteFlows { bridge, matches } => {
                vec!["del-flows".to_string(), bridge.clone(), matches.clone()]
            }
        }
    }
}

/// Rewrite the source MAC of IP traffic leaving a container port.
#[must_use]
pub fn ip_snat_flow(container_port: u32, host_mac: MacAddress) -> String {
    format!("priority=20,ip,in_port={container_port},actions=mod_dl_src:{host_mac},strip_vlan,normal")
}

/// Match of [`ip_snat_flow`].
#[must_use]
pub fn ip_snat_match(container_port: u32) -> String {
    format!("ip,in_port={container_port}")
}

/// Rewrite ARP requests leaving through the host port to carry the host MAC.
#[must_use]
pub fn arp_snat_flow(host_port: u32, host_mac: MacAddress) -> String {
    format!(
        "priority=10,arp,arp_op=1,actions=mod_dl_src:{host_mac},load:0x{}->NXM_NX_ARP_SHA[],output:{host_port}",
        host_mac.to_hex()
    )
}

/// Match of [`arp_snat_flow`].
#[must_use]
pub fn arp_snat_match() -> String {
    "arp,arp_op=1".to_string()
}

/// Broadcast ARP replies arriving on the host port.
#[must_use]
pub fn arp_dnat_flow(host_port: u32) -> String {
    format!(
        "priority=10,arp,arp_op=2,in_port={host_port},actions=mod_dl_dst:{},load:0x{}->NXM_NX_ARP_THA[],normal",
        MacAddress::BROADCAST,
        MacAddress::BROADCAST.to_hex()
    )
}

/// Match of [`arp_dnat_flow`].
#[must_use]
pub fn arp_dnat_match(host_port: u32) -> String {
    format!("arp,arp_op=2,in_port={host_port}")
}

/// Accept IP traffic addressed to the host itself.
#[must_use]
pub fn host_accept_flow(host_ip: IpAddr, host_mac: MacAddress) -> String {
    format!("priority=20,ip,nw_dst={host_ip},dl_dst={host_mac},actions=normal")
}

/// Match of [`host_accept_flow`].
#[must_use]
pub fn host_accept_match(host_ip: IpAddr, host_mac: MacAddress) -> String {
    format!("ip,nw_dst={host_ip},dl_dst={host_mac}")
}

/// Answer ARP requests from a container port with the virtual MAC.
///
/// The request is turned into a reply in place and sent back out of the
/// port it came in on.
#[must_use]
pub fn fake_arp_reply_flow(container_port: u32) -> String {
    format!(
        "priority=30,arp,arp_op=1,in_port={container_port},actions=\
         move:NXM_OF_ETH_SRC[]->NXM_OF_ETH_DST[],mod_dl_src:{VIRTUAL_MAC},\
         load:0x2->NXM_OF_ARP_OP[],\
         move:NXM_NX_ARP_SHA[]->NXM_NX_ARP_THA[],load:0x{}->NXM_NX_ARP_SHA[],\
         move:NXM_OF_ARP_TPA[]->NXM_NX_REG0[],move:NXM_OF_ARP_SPA[]->NXM_OF_ARP_TPA[],\
         move:NXM_NX_REG0[]->NXM_OF_ARP_SPA[],in_port",
        VIRTUAL_MAC.to_hex()
    )
}

/// Match of [`fake_arp_reply_flow`].
#[must_use]
pub fn fake_arp_reply_match(container_port: u32) -> String {
    format!("arp,arp_op=1,in_port={container_port}")
}

/// Rewrite the destination MAC of inbound traffic for `ip` on `vlan`.
#[must_use]
pub fn mac_dnat_flow(host_port: u32, ip: IpAddr, vlan: u16, container_mac: MacAddress) -> String {
    format!(
        "priority=20,ip,in_port={host_port},nw_dst={ip},dl_vlan={vlan},actions=mod_dl_dst:{container_mac},normal"
    )
}

/// Match of [`mac_dnat_flow`].
#[must_use]
pub fn mac_dnat_match(host_port: u32, ip: IpAddr, vlan: u16) -> String {
    format!("ip,in_port={host_port},nw_dst={ip},dl_vlan={vlan}")
}

/// Open vSwitch operations over a [`ControlPlane`].
#[derive(Clone, Copy)]
pub struct Ovs<'a> {
    cp: &'a dyn ControlPlane,
}

impl<'a> Ovs<'a> {
    /// Wrap a control plane.
    #[must_use]
    pub const fn new(cp: &'a dyn ControlPlane) -> Self {
        Self { cp }
    }

    /// Create a bridge.
    ///
    /// # Errors
    ///
    /// Returns [`HitchError::InterfaceCreationFailed`] if OVS refuses.
    pub fn create_bridge(&self, bridge: &str) -> HitchResult<()> {
        tracing::info!(bridge, "Creating OVS bridge");
        self.cp
            .run(
                OvsCommand::AddBridge {
                    bridge: bridge.to_string(),
                }
                .into(),
            )
            .map(drop)
            .map_err(|e| HitchError::InterfaceCreationFailed {
                name: bridge.to_string(),
                reason: e.to_string(),
            })
    }

    /// Delete a bridge.
    ///
    /// # Errors
    ///
    /// Returns an error if OVS refuses.
    pub fn delete_bridge(&self, bridge: &str) -> HitchResult<()> {
        tracing::info!(bridge, "Deleting OVS bridge");
        self.cp
            .run(
                OvsCommand::DeleteBridge {
                    bridge: bridge.to_string(),
                }
                .into(),
            )
            .map(drop)
    }

    /// Attach a port. A zero VLAN attaches it untagged.
    ///
    /// # Errors
    ///
    /// Returns an error if OVS refuses.
    pub fn add_port(&self, bridge: &str, port: &str, vlan: u16) -> HitchResult<()> {
        tracing::debug!(bridge, port, vlan, "Adding OVS port");
        self.cp
            .run(
                OvsCommand::AddPort {
                    bridge: bridge.to_string(),
                    port: port.to_string(),
                    tag: (vlan != 0).then_some(vlan),
                }
                .into(),
            )
            .map(drop)
    }

    /// Detach a port.
    ///
    /// # Errors
    ///
    /// Returns an error if OVS refuses.
    pub fn delete_port(&self, bridge: &str, port: &str) -> HitchResult<()> {
        tracing::debug!(bridge, port, "Deleting OVS port");
        self.cp
            .run(
                OvsCommand::DeletePort {
                    bridge: bridge.to_string(),
                    port: port.to_string(),
                }
                .into(),
            )
            .map(drop)
    }

    /// OpenFlow port number of an interface.
    ///
    /// # Errors
    ///
    /// Returns an error if the interface is not an OVS port yet.
    pub fn port_number(&self, interface: &str) -> HitchResult<u32> {
        let out = self.cp.run(
            OvsCommand::GetOfport {
                interface: interface.to_string(),
            }
            .into(),
        )?;

        // `[]` before the port is attached, `-1` if attaching failed.
        out.trim()
            .parse::<u32>()
            .ok()
            .filter(|port| *port > 0)
            .ok_or_else(|| HitchError::Internal {
                message: format!("no OpenFlow port for {interface}: '{}'", out.trim()),
            })
    }

    /// Add a flow.
    ///
    /// # Errors
    ///
    /// Returns [`HitchError::RuleProgrammingFailed`] if OVS rejects it.
    pub fn add_flow(&self, bridge: &str, flow: &str) -> HitchResult<()> {
        tracing::debug!(bridge, flow, "Adding OVS flow");
        self.cp
            .run(
                OvsCommand::AddFlow {
                    bridge: bridge.to_string(),
                    flow: flow.to_string(),
                }
                .into(),
            )
            .map(drop)
            .map_err(|e| HitchError::RuleProgrammingFailed {
                rule: flow.to_string(),
                reason: e.to_string(),
            })
    }

    /// Delete flows, logging failures instead of returning them.
    pub fn delete_flows(&self, bridge: &str, matches: &str) {
        tracing::debug!(bridge, matches, "Deleting OVS flows");
        if let Err(e) = self.cp.run(
            OvsCommand::DeleteFlows {
                bridge: bridge.to_string(),
                matches: matches.to_string(),
            }
            .into(),
        ) {
            tracing::warn!(bridge, matches, error = %e, "Failed to delete OVS flows");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac() -> MacAddress {
        "00:0d:3a:f3:1c:4e".parse().unwrap()
    }

    #[test]
    fn tagged_port() {
        let cmd = OvsCommand::AddPort {
            bridge: "azure2".to_string(),
            port: "azv1a2b3c4".to_string(),
            tag: Some(100),
        };
        assert_eq!(cmd.program(), "ovs-vsctl");
        assert_eq!(cmd.args().join(" "), "add-port azure2 azv1a2b3c4 tag=100");
    }

    #[test]
    fn flows_are_keyed_by_port() {
        let ip: IpAddr = "10.0.0.5".parse().unwrap();
        insta::assert_snapshot!(
            mac_dnat_flow(1, ip, 100, mac()),
            @"priority=20,ip,in_port=1,nw_dst=10.0.0.5,dl_vlan=100,actions=mod_dl_dst:00:0d:3a:f3:1c:4e,normal"
        );
        assert_eq!(mac_dnat_match(1, ip, 100), "ip,in_port=1,nw_dst=10.0.0.5,dl_vlan=100");
        assert!(ip_snat_flow(7, mac()).starts_with(&ip_snat_match(7).replace("ip,", "priority=20,ip,")));
    }

    #[test]
    fn arp_flows_use_hex_macs() {
        assert!(arp_snat_flow(1, mac()).contains("load:0x000d3af31c4e->NXM_NX_ARP_SHA[]"));
        assert!(fake_arp_reply_flow(3).contains("load:0x123456789abc->NXM_NX_ARP_SHA[]"));
        assert!(arp_dnat_flow(1).contains("mod_dl_dst:ff:ff:ff:ff:ff:ff"));
    }
}
