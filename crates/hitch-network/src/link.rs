//! Link, address, route and neighbour operations.
//!
//! Operations act on whatever network namespace the calling thread is in,
//! so container-side configuration is done while a
//! [`NamespaceGuard`](crate::netns::NamespaceGuard) is held.

use std::net::IpAddr;
use std::path::PathBuf;

use hitch_common::{HitchError, HitchResult, MacAddress};
use ipnet::IpNet;

use crate::exec::{ControlPlane, is_exists_error, is_missing_error};
use crate::types::Route;

/// `ip` and `bridge` commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCommand {
    /// Create a veth pair.
    AddVeth {
        /// First end.
        name: String,
        /// Peer end.
        peer: String,
    },
    /// Create a Linux bridge.
    AddBridge {
        /// Bridge name.
        name: String,
    },
    /// Delete a link. Deleting one end of a veth removes both.
    Delete {
        /// Link name.
        name: String,
    },
    /// Set a link up or down.
    SetState {
        /// Link name.
        name: String,
        /// Desired state.
        up: bool,
    },
    /// Enslave a link to a bridge, or release it with `None`.
    SetMaster {
        /// Link name.
        name: String,
        /// Bridge name.
        master: Option<String>,
    },
    /// Toggle hairpin mode on a bridge port.
    SetHairpin {
        /// Bridge port name.
        name: String,
        /// Desired mode.
        on: bool,
    },
    /// Move a link into the namespace at `netns`.
    SetNetns {
        /// Link name.
        name: String,
        /// Namespace path.
        netns: PathBuf,
    },
    /// Rename a link.
    Rename {
        /// Current name.
        name: String,
        /// New name.
        new_name: String,
    },
    /// Show one link.
    Show {
        /// Link name.
        name: String,
    },
    /// Add an address.
    AddAddress {
        /// Device.
        dev: String,
        /// Address with prefix.
        addr: IpNet,
    },
    /// Remove an address.
    DeleteAddress {
        /// Device.
        dev: String,
        /// Address with prefix.
        addr: IpNet,
    },
    /// List global addresses, optionally of one device.
    ListAddresses {
        /// Device filter.
        dev: Option<String>,
    },
    /// Add a route.
    AddRoute {
        /// Device the route is bound to.
        dev: String,
        /// Route.
        route: Route,
    },
    /// Remove a route.
    DeleteRoute {
        /// Device the route is bound to.
        dev: String,
        /// Route.
        route: Route,
    },
    /// List routes of a device.
    ListRoutes {
        /// Device.
        dev: String,
    },
    /// Add or replace a permanent neighbour entry.
    SetNeighbor {
        /// Device.
        dev: String,
        /// Neighbour address.
        ip: IpAddr,
        /// Neighbour MAC.
        mac: MacAddress,
    },
    /// Remove a neighbour entry.
    DeleteNeighbor {
        /// Device.
        dev: String,
        /// Neighbour address.
        ip: IpAddr,
    },
}

impl LinkCommand {
    /// Program implementing the command.
    #[must_use]
    pub const fn program(&self) -> &'static str {
        match self {
            Self::SetHairpin { .. } => "bridge",
            _ => "ip",
        }
    }

    /// Program arguments.
    #[must_use]
    pub fn args(&self) -> Vec<String> {
        match self {
            Self::AddVeth { name, peer } => {
                argv(&["link", "add", name, "type", "veth", "peer", "name", peer])
            }
            Self::AddBridge { name } => argv(&["link", "add", "name", name, "type", "bridge"]),
            Self::Delete { name } => argv(&["link", "delete", name]),
            Self::SetState { name, up } => {
                argv(&["link", "set", name, if *up { "up" } else { "down" }])
            }
            Self::SetMaster { name, master } => match master {
                Some(master) => argv(&["link", "set", name, "master", master]),
                None => argv(&["link", "set", name, "nomaster"]),
            },
            Self::SetHairpin { name, on } => {
                argv(&["link", "set", "dev", name, "hairpin", if *on { "on" } else { "off" }])
            }
            Self::SetNetns { name, netns } => {
                let mut args = argv(&["link", "set", name, "netns"]);
                args.push(netns.display().to_string());
                args
            }
            Self::Rename { name, new_name } => argv(&["link", "set", name, "name", new_name]),
            Self::Show { name } => argv(&["-o", "link", "show", "dev", name]),
            Self::AddAddress { dev, addr } => argv(&["addr", "add", &addr.to_string(), "dev", dev]),
            Self::DeleteAddress { dev, addr } => {
                argv(&["addr", "del", &addr.to_string(), "dev", dev])
            }
            Self::ListAddresses { dev } => {
                let mut args = argv(&["-o", "addr", "show"]);
                if let Some(dev) = dev {
                    args.extend(argv(&["dev", dev]));
                }
                args.extend(argv(&["scope", "global"]));
                args
            }
            Self::AddRoute { dev, route } => route_args("add", dev, route),
            Self::DeleteRoute { dev, route } => route_args("del", dev, route),
            Self::ListRoutes { dev } => argv(&["route", "show", "dev", dev]),
            Self::SetNeighbor { dev, ip, mac } => argv(&[
                "neigh",
                "replace",
                &ip.to_string(),
                "lladdr",
                &mac.to_string(),
                "dev",
                dev,
                "nud",
                "permanent",
            ]),
            Self::DeleteNeighbor { dev, ip } => argv(&["neigh", "del", &ip.to_string(), "dev", dev]),
        }
    }
}

fn argv(items: &[&str]) -> Vec<String> {
    items.iter().map(ToString::to_string).collect()
}

fn route_args(verb: &str, dev: &str, route: &Route) -> Vec<String> {
    let mut args = vec!["route".to_string(), verb.to_string()];
    if route.is_default() {
        args.push("default".to_string());
    } else {
        args.push(route.dst.to_string());
    }
    if let Some(gw) = route.gateway {
        args.extend(["via".to_string(), gw.to_string()]);
    }
    args.extend([
        "dev".to_string(),
        route.dev.clone().unwrap_or_else(|| dev.to_string()),
    ]);
    if route.link_scope {
        args.extend(["scope".to_string(), "link".to_string()]);
    }
    if let Some(src) = route.src {
        args.extend(["src".to_string(), src.to_string()]);
    }
    args
}

/// Attributes of a link as reported by `ip -o link show`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    /// Interface index.
    pub index: u32,
    /// Interface name.
    pub name: String,
    /// Hardware address, if the link has one.
    pub mac: Option<MacAddress>,
    /// Bridge the link is enslaved to.
    pub master: Option<String>,
    /// Administrative state is up.
    pub up: bool,
}

/// Parse one line of `ip -o link show`.
///
/// ```text
/// 2: eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 ... master azure2 ... link/ether 00:0d:3a:f3:1c:4e brd ff:ff:ff:ff:ff:ff
/// ```
#[must_use]
pub fn parse_link_line(line: &str) -> Option<LinkInfo> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let index = tokens.first()?.trim_end_matches(':').parse().ok()?;
    // veth ends show up as `name@peer:`.
    let name = tokens.get(1)?.trim_end_matches(':');
    let name = name.split('@').next()?.to_string();
    let up = tokens
        .get(2)
        .is_some_and(|flags| flags.trim_matches(|c| c == '<' || c == '>').split(',').any(|f| f == "UP"));

    let after = |key: &str| {
        tokens
            .iter()
            .position(|t| *t == key)
            .and_then(|i| tokens.get(i + 1))
            .copied()
    };

    Some(LinkInfo {
        index,
        name,
        mac: after("link/ether").and_then(|m| m.parse().ok()),
        master: after("master").map(ToString::to_string),
        up,
    })
}

/// Parse `ip -o addr show` into `(device, address)` pairs.
#[must_use]
pub fn parse_addresses(output: &str) -> Vec<(String, IpNet)> {
    output
        .lines()
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let dev = tokens.get(1)?;
            match *tokens.get(2)? {
                "inet" | "inet6" => {}
                _ => return None,
            }
            let addr = tokens.get(3)?.parse().ok()?;
            Some(((*dev).to_string(), addr))
        })
        .collect()
}

/// Parse `ip route show dev X`, skipping kernel generated prefix routes.
#[must_use]
pub fn parse_routes(output: &str) -> Vec<Route> {
    output
        .lines()
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let dst = match *tokens.first()? {
                "default" => IpNet::V4(ipnet::Ipv4Net::default()),
                dst if dst.contains('/') => dst.parse().ok()?,
                dst => IpNet::from(dst.parse::<IpAddr>().ok()?),
            };

            let after = |key: &str| {
                tokens
                    .iter()
                    .position(|t| *t == key)
                    .and_then(|i| tokens.get(i + 1))
                    .copied()
            };

            if after("proto") == Some("kernel") {
                return None;
            }

            Some(Route {
                dst,
                gateway: after("via").and_then(|g| g.parse().ok()),
                dev: None,
                link_scope: after("scope") == Some("link"),
                src: after("src").and_then(|s| s.parse().ok()),
            })
        })
        .collect()
}

/// Create a Linux bridge. A bridge that already exists is reused.
///
/// # Errors
///
/// Returns [`HitchError::InterfaceCreationFailed`] if the kernel refuses.
pub fn add_bridge(cp: &dyn ControlPlane, name: &str) -> HitchResult<()> {
    tracing::info!(name, "Creating bridge");
    match cp.run(LinkCommand::AddBridge { name: name.to_string() }.into()) {
        Ok(_) => Ok(()),
        Err(e) if is_exists_error(&e) => {
            tracing::debug!(name, "Bridge already exists");
            Ok(())
        }
        Err(e) => Err(HitchError::InterfaceCreationFailed {
            name: name.to_string(),
            reason: e.to_string(),
        }),
    }
}

/// Create a veth pair and bring the host end up.
///
/// # Errors
///
/// Returns [`HitchError::InterfaceCreationFailed`] if either end cannot be
/// created or the host end cannot be brought up.
pub fn create_veth_pair(cp: &dyn ControlPlane, host: &str, container: &str) -> HitchResult<()> {
    tracing::debug!(host, container, "Creating veth pair");
    let creation_failed = |e: HitchError| HitchError::InterfaceCreationFailed {
        name: host.to_string(),
        reason: e.to_string(),
    };
    cp.run(
        LinkCommand::AddVeth {
            name: host.to_string(),
            peer: container.to_string(),
        }
        .into(),
    )
    .map_err(creation_failed)?;

    if let Err(e) = set_link_state(cp, host, true) {
        // The pair is useless without a live host end.
        if let Err(cleanup) = delete_link(cp, host) {
            tracing::warn!(name = host, error = %cleanup, "Failed to delete half-created veth pair");
        }
        return Err(creation_failed(e));
    }
    Ok(())
}

/// Look up a link. Returns `None` if it does not exist.
///
/// # Errors
///
/// Returns an error if the lookup fails for another reason.
pub fn show_link(cp: &dyn ControlPlane, name: &str) -> HitchResult<Option<LinkInfo>> {
    match cp.run(LinkCommand::Show { name: name.to_string() }.into()) {
        Ok(out) => Ok(out.lines().find_map(parse_link_line)),
        Err(e) if is_missing_error(&e) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Whether a link exists.
#[must_use]
pub fn link_exists(cp: &dyn ControlPlane, name: &str) -> bool {
    matches!(show_link(cp, name), Ok(Some(_)))
}

/// Look up a link that must exist.
///
/// # Errors
///
/// Returns [`HitchError::ExternalInterfaceUnavailable`] if it does not.
pub fn require_link(cp: &dyn ControlPlane, name: &str) -> HitchResult<LinkInfo> {
    show_link(cp, name)?.ok_or_else(|| HitchError::ExternalInterfaceUnavailable {
        name: name.to_string(),
    })
}

/// Set a link up or down.
///
/// # Errors
///
/// Returns an error if the command fails.
pub fn set_link_state(cp: &dyn ControlPlane, name: &str, up: bool) -> HitchResult<()> {
    tracing::debug!(name, up, "Setting link state");
    cp.run(
        LinkCommand::SetState {
            name: name.to_string(),
            up,
        }
        .into(),
    )
    .map(drop)
}

/// Enslave `name` to `master`, or release it with `None`.
///
/// # Errors
///
/// Returns an error if the command fails.
pub fn set_link_master(cp: &dyn ControlPlane, name: &str, master: Option<&str>) -> HitchResult<()> {
    tracing::debug!(name, master, "Setting link master");
    cp.run(
        LinkCommand::SetMaster {
            name: name.to_string(),
            master: master.map(ToString::to_string),
        }
        .into(),
    )
    .map(drop)
}

/// Toggle hairpin mode on a bridge port.
///
/// # Errors
///
/// Returns an error if the command fails.
pub fn set_link_hairpin(cp: &dyn ControlPlane, name: &str, on: bool) -> HitchResult<()> {
    tracing::debug!(name, on, "Setting hairpin mode");
    cp.run(
        LinkCommand::SetHairpin {
            name: name.to_string(),
            on,
        }
        .into(),
    )
    .map(drop)
}

/// Move a link into another network namespace.
///
/// # Errors
///
/// Returns [`HitchError::NamespaceOperationFailed`] if the move fails.
pub fn set_link_netns(cp: &dyn ControlPlane, name: &str, netns: &std::path::Path) -> HitchResult<()> {
    tracing::debug!(name, netns = %netns.display(), "Moving link to namespace");
    cp.run(
        LinkCommand::SetNetns {
            name: name.to_string(),
            netns: netns.to_path_buf(),
        }
        .into(),
    )
    .map(drop)
    .map_err(|e| HitchError::NamespaceOperationFailed {
        operation: format!("move {name}"),
        path: netns.display().to_string(),
        reason: e.to_string(),
    })
}

/// Rename a link.
///
/// # Errors
///
/// Returns an error if the command fails.
pub fn rename_link(cp: &dyn ControlPlane, name: &str, new_name: &str) -> HitchResult<()> {
    tracing::debug!(name, new_name, "Renaming link");
    cp.run(
        LinkCommand::Rename {
            name: name.to_string(),
            new_name: new_name.to_string(),
        }
        .into(),
    )
    .map(drop)
}

/// Delete a link. A link that is already gone is not an error.
///
/// # Errors
///
/// Returns an error if the kernel refuses the deletion.
pub fn delete_link(cp: &dyn ControlPlane, name: &str) -> HitchResult<()> {
    tracing::debug!(name, "Deleting link");
    match cp.run(LinkCommand::Delete { name: name.to_string() }.into()) {
        Ok(_) => Ok(()),
        Err(e) if is_missing_error(&e) => {
            tracing::debug!(name, "Link already deleted");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Add an address. An address that is already present is not an error.
///
/// # Errors
///
/// Returns an error if the command fails.
pub fn add_address(cp: &dyn ControlPlane, dev: &str, addr: IpNet) -> HitchResult<()> {
    tracing::debug!(dev, %addr, "Adding address");
    match cp.run(
        LinkCommand::AddAddress {
            dev: dev.to_string(),
            addr,
        }
        .into(),
    ) {
        Ok(_) => Ok(()),
        Err(e) if is_exists_error(&e) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Remove an address.
///
/// # Errors
///
/// Returns an error if the command fails.
pub fn delete_address(cp: &dyn ControlPlane, dev: &str, addr: IpNet) -> HitchResult<()> {
    tracing::debug!(dev, %addr, "Deleting address");
    cp.run(
        LinkCommand::DeleteAddress {
            dev: dev.to_string(),
            addr,
        }
        .into(),
    )
    .map(drop)
}

/// Global addresses of a device, or of all devices.
///
/// # Errors
///
/// Returns an error if the command fails.
pub fn list_addresses(cp: &dyn ControlPlane, dev: Option<&str>) -> HitchResult<Vec<(String, IpNet)>> {
    let out = cp.run(
        LinkCommand::ListAddresses {
            dev: dev.map(ToString::to_string),
        }
        .into(),
    )?;
    Ok(parse_addresses(&out))
}

/// Add a route. A route that is already present is not an error.
///
/// # Errors
///
/// Returns an error if the command fails.
pub fn add_route(cp: &dyn ControlPlane, dev: &str, route: &Route) -> HitchResult<()> {
    tracing::debug!(dev, dst = %route.dst, gateway = ?route.gateway, "Adding route");
    match cp.run(
        LinkCommand::AddRoute {
            dev: dev.to_string(),
            route: route.clone(),
        }
        .into(),
    ) {
        Ok(_) => Ok(()),
        Err(e) if is_exists_error(&e) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Remove a route.
///
/// # Errors
///
/// Returns an error if the command fails.
pub fn delete_route(cp: &dyn ControlPlane, dev: &str, route: &Route) -> HitchResult<()> {
    tracing::debug!(dev, dst = %route.dst, "Deleting route");
    cp.run(
        LinkCommand::DeleteRoute {
            dev: dev.to_string(),
            route: route.clone(),
        }
        .into(),
    )
    .map(drop)
}

/// Non-kernel routes of a device.
///
/// # Errors
///
/// Returns an error if the command fails.
pub fn list_routes(cp: &dyn ControlPlane, dev: &str) -> HitchResult<Vec<Route>> {
    let out = cp.run(LinkCommand::ListRoutes { dev: dev.to_string() }.into())?;
    Ok(parse_routes(&out))
}

/// Install a permanent neighbour entry.
///
/// # Errors
///
/// Returns an error if the command fails.
pub fn set_static_neighbor(
    cp: &dyn ControlPlane,
    dev: &str,
    ip: IpAddr,
    mac: MacAddress,
) -> HitchResult<()> {
    tracing::debug!(dev, %ip, %mac, "Adding static neighbour");
    cp.run(
        LinkCommand::SetNeighbor {
            dev: dev.to_string(),
            ip,
            mac,
        }
        .into(),
    )
    .map(drop)
}

/// Remove a neighbour entry.
///
/// # Errors
///
/// Returns an error if the command fails.
pub fn delete_static_neighbor(cp: &dyn ControlPlane, dev: &str, ip: IpAddr) -> HitchResult<()> {
    cp.run(
        LinkCommand::DeleteNeighbor {
            dev: dev.to_string(),
            ip,
        }
        .into(),
    )
    .map(drop)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::HostCommand;

    #[test]
    fn parses_bridged_link() {
        let line = "2: eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc mq master azure2 \
                    state UP mode DEFAULT group default qlen 1000\\    link/ether 00:0d:3a:f3:1c:4e \
                    brd ff:ff:ff:ff:ff:ff";
        let info = parse_link_line(line).unwrap();
        assert_eq!(info.index, 2);
        assert_eq!(info.name, "eth0");
        assert_eq!(info.master.as_deref(), Some("azure2"));
        assert_eq!(info.mac.unwrap().to_string(), "00:0d:3a:f3:1c:4e");
        assert!(info.up);
    }

    #[test]
    fn parses_veth_peer_name() {
        let line = "9: azv1a2b3c4@azv1a2b3c4-2: <BROADCAST,MULTICAST> mtu 1500 qdisc noop state DOWN \
                    link/ether 6a:1f:00:aa:bb:cc brd ff:ff:ff:ff:ff:ff";
        let info = parse_link_line(line).unwrap();
        assert_eq!(info.name, "azv1a2b3c4");
        assert!(!info.up);
        assert!(info.master.is_none());
    }

    #[test]
    fn parses_addresses() {
        let out = "2: eth0    inet 10.0.0.4/24 brd 10.0.0.255 scope global eth0\\       valid_lft forever\n\
                   2: eth0    inet6 2001:db8::4/64 scope global \\       valid_lft forever\n";
        let addrs = parse_addresses(out);
        assert_eq!(addrs.len(), 2);
        assert_eq!(addrs[0], ("eth0".to_string(), "10.0.0.4/24".parse().unwrap()));
    }

    #[test]
    fn parses_routes_and_skips_kernel() {
        let out = "default via 10.0.0.1 proto dhcp src 10.0.0.4 metric 100\n\
                   10.0.0.0/24 proto kernel scope link src 10.0.0.4\n\
                   168.63.129.16 via 10.0.0.1 proto dhcp src 10.0.0.4 metric 100\n";
        let routes = parse_routes(out);
        assert_eq!(routes.len(), 2);
        assert!(routes[0].is_default());
        assert_eq!(routes[0].gateway, Some("10.0.0.1".parse().unwrap()));
        assert_eq!(routes[1].dst.to_string(), "168.63.129.16/32");
    }

    #[test]
    fn route_arguments() {
        let route = Route::default_via("10.0.0.1".parse().unwrap());
        let cmd = LinkCommand::AddRoute {
            dev: "eth0".to_string(),
            route,
        };
        assert_eq!(cmd.args().join(" "), "route add default via 10.0.0.1 dev eth0");

        let link = Route::link("169.254.1.1/32".parse().unwrap());
        let cmd = LinkCommand::AddRoute {
            dev: "eth0".to_string(),
            route: link,
        };
        assert_eq!(cmd.args().join(" "), "route add 169.254.1.1/32 dev eth0 scope link");
    }

    #[test]
    fn hairpin_uses_bridge_tool() {
        let cmd = LinkCommand::SetHairpin {
            name: "eth0".to_string(),
            on: true,
        };
        assert_eq!(cmd.program(), "bridge");
        assert_eq!(cmd.args().join(" "), "link set dev eth0 hairpin on");
    }

    #[test_log::test]
    fn veth_without_live_host_end_is_removed() {
        let host = crate::fake::FakeHost::new();
        host.fail_when(|cmd| matches!(cmd, HostCommand::Link(LinkCommand::SetState { .. })));

        let err = create_veth_pair(&host, "azv1a2b3c4", "azv1a2b3c4-2").unwrap_err();
        assert!(matches!(err, HitchError::InterfaceCreationFailed { .. }));
        assert!(!host.has_link(crate::fake::FakeHost::HOST_NS, "azv1a2b3c4"));
    }

    #[test_log::test]
    fn failed_veth_cleanup_keeps_creation_error() {
        let host = crate::fake::FakeHost::new();
        host.fail_when(|cmd| {
            matches!(
                cmd,
                HostCommand::Link(LinkCommand::SetState { .. } | LinkCommand::Delete { .. })
            )
        });

        let err = create_veth_pair(&host, "azv1a2b3c4", "azv1a2b3c4-2").unwrap_err();
        assert!(matches!(err, HitchError::InterfaceCreationFailed { .. }));
        assert!(host.has_link(crate::fake::FakeHost::HOST_NS, "azv1a2b3c4"));
    }
}
