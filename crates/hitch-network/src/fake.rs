//! In-memory host for tests.
//!
//! [`FakeHost`] implements both [`ControlPlane`] and [`NamespaceSwitcher`]
//! over a small model of links per namespace, addresses, routes, neighbours,
//! ebtables and iptables chains and Open vSwitch bridges. Commands behave the
//! way the real tools do for the cases this crate depends on, including the
//! error text that callers classify (`File exists`, `Cannot find device`).

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::path::Path;

use hitch_common::{HitchError, HitchResult, MacAddress};
use ipnet::IpNet;
use parking_lot::Mutex;

use crate::ebtables::{self, EbtablesCommand, RuleAction};
use crate::exec::{CommandOutput, ControlPlane, HostCommand};
use crate::iptables::{self, IptablesAction, IptablesCommand};
use crate::link::LinkCommand;
use crate::netns::{NamespaceSwitcher, NsHandle};
use crate::ovsctl::OvsCommand;
use crate::types::Route;

type FailurePredicate = Box<dyn Fn(&HostCommand) -> bool + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum LinkKind {
    Device,
    Bridge,
    Veth { peer: u32 },
}

#[derive(Debug, Clone)]
struct FakeLink {
    ns: String,
    name: String,
    kind: LinkKind,
    mac: MacAddress,
    up: bool,
    master: Option<String>,
    hairpin: bool,
    addrs: Vec<IpNet>,
    routes: Vec<Route>,
}

#[derive(Debug, Default)]
struct OvsBridge {
    // port name -> (ofport, tag)
    ports: BTreeMap<String, (u32, Option<u16>)>,
    next_ofport: u32,
    flows: Vec<String>,
}

#[derive(Debug)]
struct HostModel {
    current_ns: String,
    namespaces: BTreeSet<String>,
    unreachable_ns: BTreeSet<String>,
    links: BTreeMap<u32, FakeLink>,
    next_index: u32,
    next_mac: u32,
    neighbors: BTreeMap<(String, String, IpAddr), MacAddress>,
    ebtables: BTreeMap<String, Vec<String>>,
    iptables: BTreeMap<(String, String), Vec<String>>,
    ovs: BTreeMap<String, OvsBridge>,
    commands: Vec<String>,
}

fn ok() -> CommandOutput {
    CommandOutput::ok("")
}

fn exists() -> CommandOutput {
    CommandOutput::failed(2, "RTNETLINK answers: File exists")
}

fn missing(name: &str) -> CommandOutput {
    CommandOutput::failed(1, format!("Cannot find device \"{name}\""))
}

fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl HostModel {
    fn new() -> Self {
        let mut ebtables = BTreeMap::new();
        ebtables.insert(ebtables::PREROUTING.to_string(), Vec::new());
        ebtables.insert(ebtables::POSTROUTING.to_string(), Vec::new());

        let mut iptables = BTreeMap::new();
        for (table, chain) in [
            (iptables::FILTER, iptables::INPUT),
            (iptables::FILTER, iptables::OUTPUT),
            (iptables::FILTER, iptables::FORWARD),
            (iptables::NAT, "PREROUTING"),
            (iptables::NAT, iptables::OUTPUT),
            (iptables::NAT, iptables::POSTROUTING),
        ] {
            iptables.insert((table.to_string(), chain.to_string()), Vec::new());
        }

        let mut namespaces = BTreeSet::new();
        namespaces.insert(FakeHost::HOST_NS.to_string());

        Self {
            current_ns: FakeHost::HOST_NS.to_string(),
            namespaces,
            unreachable_ns: BTreeSet::new(),
            links: BTreeMap::new(),
            next_index: 2,
            next_mac: 1,
            neighbors: BTreeMap::new(),
            ebtables,
            iptables,
            ovs: BTreeMap::new(),
            commands: Vec::new(),
        }
    }

    fn find(&self, ns: &str, name: &str) -> Option<u32> {
        self.links
            .iter()
            .find(|(_, l)| l.ns == ns && l.name == name)
            .map(|(idx, _)| *idx)
    }

    fn find_current(&self, name: &str) -> Option<u32> {
        self.find(&self.current_ns, name)
    }

    fn allocate_mac(&mut self) -> MacAddress {
        let n = self.next_mac.to_be_bytes();
        self.next_mac += 1;
        MacAddress::new([0x02, 0x00, n[0], n[1], n[2], n[3]])
    }

    fn add_link(&mut self, ns: &str, name: &str, kind: LinkKind, mac: Option<MacAddress>) -> u32 {
        let index = self.next_index;
        self.next_index += 1;
        let mac = mac.unwrap_or_else(|| self.allocate_mac());
        self.links.insert(
            index,
            FakeLink {
                ns: ns.to_string(),
                name: name.to_string(),
                kind,
                mac,
                up: false,
                master: None,
                hairpin: false,
                addrs: Vec::new(),
                routes: Vec::new(),
            },
        );
        index
    }

    fn remove_link(&mut self, index: u32) {
        let Some(link) = self.links.remove(&index) else {
            return;
        };
        if let LinkKind::Veth { peer } = link.kind {
            self.links.remove(&peer);
        }
        for other in self.links.values_mut() {
            if other.ns == link.ns && other.master.as_deref() == Some(link.name.as_str()) {
                other.master = None;
            }
        }
        self.neighbors
            .retain(|(ns, dev, _), _| !(*ns == link.ns && *dev == link.name));
    }

    fn render_link(index: u32, link: &FakeLink) -> String {
        let mut flags = vec!["BROADCAST", "MULTICAST"];
        if link.up {
            flags.extend(["UP", "LOWER_UP"]);
        }
        let name = match &link.kind {
            LinkKind::Veth { .. } => format!("{}@if{}", link.name, index + 1),
            _ => link.name.clone(),
        };
        let master = link
            .master
            .as_ref()
            .map(|m| format!(" master {m}"))
            .unwrap_or_default();
        format!(
            "{index}: {name}: <{}> mtu 1500 qdisc noqueue{master} state {} mode DEFAULT \
             group default qlen 1000\\    link/ether {} brd ff:ff:ff:ff:ff:ff",
            flags.join(","),
            if link.up { "UP" } else { "DOWN" },
            link.mac
        )
    }

    fn render_route(route: &Route) -> String {
        let mut line = if route.is_default() {
            "default".to_string()
        } else {
            route.dst.to_string()
        };
        if let Some(gw) = route.gateway {
            line.push_str(&format!(" via {gw}"));
        }
        if route.link_scope {
            line.push_str(" scope link");
        }
        if let Some(src) = route.src {
            line.push_str(&format!(" src {src}"));
        }
        line
    }

    fn link_command(&mut self, cmd: &LinkCommand) -> CommandOutput {
        let ns = self.current_ns.clone();
        match cmd {
            LinkCommand::AddVeth { name, peer } => {
                if self.find(&ns, name).is_some() || self.find(&ns, peer).is_some() {
                    return exists();
                }
                let first = self.next_index;
                let a = self.add_link(&ns, name, LinkKind::Veth { peer: first + 1 }, None);
                self.add_link(&ns, peer, LinkKind::Veth { peer: a }, None);
                ok()
            }
            LinkCommand::AddBridge { name } => {
                if self.find(&ns, name).is_some() {
                    return exists();
                }
                self.add_link(&ns, name, LinkKind::Bridge, None);
                ok()
            }
            LinkCommand::Delete { name } => match self.find(&ns, name) {
                Some(index) => {
                    self.remove_link(index);
                    ok()
                }
                None => missing(name),
            },
            LinkCommand::SetState { name, up } => self.with_link(name, |l| l.up = *up),
            LinkCommand::SetMaster { name, master } => {
                if let Some(master) = master {
                    if self.find(&ns, master).is_none() {
                        return missing(master);
                    }
                }
                self.with_link(name, |l| l.master.clone_from(master))
            }
            LinkCommand::SetHairpin { name, on } => self.with_link(name, |l| l.hairpin = *on),
            LinkCommand::SetNetns { name, netns } => {
                let target = netns.display().to_string();
                if !self.namespaces.contains(&target) {
                    return CommandOutput::failed(1, format!("Invalid \"netns\" value \"{target}\""));
                }
                if self.find(&target, name).is_some() {
                    return exists();
                }
                self.with_link(name, |l| {
                    l.ns = target.clone();
                    l.up = false;
                    l.master = None;
                    l.addrs.clear();
                    l.routes.clear();
                })
            }
            LinkCommand::Rename { name, new_name } => {
                if self.find(&ns, new_name).is_some() {
                    return exists();
                }
                self.with_link(name, |l| l.name.clone_from(new_name))
            }
            LinkCommand::Show { name } => match self.find(&ns, name) {
                Some(index) => CommandOutput::ok(Self::render_link(index, &self.links[&index]) + "\n"),
                None => CommandOutput::failed(1, format!("Device \"{name}\" does not exist.")),
            },
            LinkCommand::AddAddress { dev, addr } => {
                let Some(index) = self.find(&ns, dev) else {
                    return missing(dev);
                };
                let link = self.links.get_mut(&index).map(|l| &mut l.addrs);
                match link {
                    Some(addrs) if addrs.contains(addr) => exists(),
                    Some(addrs) => {
                        addrs.push(*addr);
                        ok()
                    }
                    None => missing(dev),
                }
            }
            LinkCommand::DeleteAddress { dev, addr } => {
                let Some(index) = self.find(&ns, dev) else {
                    return missing(dev);
                };
                let Some(link) = self.links.get_mut(&index) else {
                    return missing(dev);
                };
                let before = link.addrs.len();
                link.addrs.retain(|a| a != addr);
                if link.addrs.len() == before {
                    return CommandOutput::failed(2, "RTNETLINK answers: Cannot assign requested address");
                }
                // Routes need a source address on the link.
                if link.addrs.is_empty() {
                    link.routes.clear();
                }
                ok()
            }
            LinkCommand::ListAddresses { dev } => {
                let mut out = String::new();
                for (index, link) in &self.links {
                    if link.ns != ns || dev.as_ref().is_some_and(|d| *d != link.name) {
                        continue;
                    }
                    for addr in &link.addrs {
                        let family = if matches!(addr, IpNet::V4(_)) { "inet" } else { "inet6" };
                        out.push_str(&format!(
                            "{index}: {}    {family} {addr} scope global {}\\       valid_lft forever preferred_lft forever\n",
                            link.name, link.name
                        ));
                    }
                }
                if let Some(dev) = dev {
                    if self.find(&ns, dev).is_none() {
                        return CommandOutput::failed(1, format!("Device \"{dev}\" does not exist."));
                    }
                }
                CommandOutput::ok(out)
            }
            LinkCommand::AddRoute { dev, route } => {
                let dev = route.dev.clone().unwrap_or_else(|| dev.clone());
                let Some(index) = self.find(&ns, &dev) else {
                    return missing(&dev);
                };
                let stored = Route {
                    dev: None,
                    ..route.clone()
                };
                let Some(link) = self.links.get_mut(&index) else {
                    return missing(&dev);
                };
                if link.routes.iter().any(|r| r.dst == stored.dst) {
                    return exists();
                }
                link.routes.push(stored);
                ok()
            }
            LinkCommand::DeleteRoute { dev, route } => {
                let dev = route.dev.clone().unwrap_or_else(|| dev.clone());
                let Some(index) = self.find(&ns, &dev) else {
                    return missing(&dev);
                };
                let Some(link) = self.links.get_mut(&index) else {
                    return missing(&dev);
                };
                let before = link.routes.len();
                link.routes.retain(|r| r.dst != route.dst);
                if link.routes.len() == before {
                    return CommandOutput::failed(2, "RTNETLINK answers: No such process");
                }
                ok()
            }
            LinkCommand::ListRoutes { dev } => match self.find(&ns, dev) {
                Some(index) => {
                    let out: String = self.links[&index]
                        .routes
                        .iter()
                        .map(|r| Self::render_route(r) + "\n")
                        .collect();
                    CommandOutput::ok(out)
                }
                None => CommandOutput::failed(1, format!("Cannot find device \"{dev}\"")),
            },
            LinkCommand::SetNeighbor { dev, ip, mac } => {
                if self.find(&ns, dev).is_none() {
                    return missing(dev);
                }
                self.neighbors.insert((ns, dev.clone(), *ip), *mac);
                ok()
            }
            LinkCommand::DeleteNeighbor { dev, ip } => {
                if self.neighbors.remove(&(ns, dev.clone(), *ip)).is_some() {
                    ok()
                } else {
                    CommandOutput::failed(2, "RTNETLINK answers: No such file or directory")
                }
            }
        }
    }

    fn with_link(&mut self, name: &str, f: impl FnOnce(&mut FakeLink)) -> CommandOutput {
        let Some(index) = self.find_current(name) else {
            return missing(name);
        };
        match self.links.get_mut(&index) {
            Some(link) => {
                f(link);
                ok()
            }
            None => missing(name),
        }
    }

    fn ebtables_command(&mut self, cmd: &EbtablesCommand) -> CommandOutput {
        match cmd {
            EbtablesCommand::Rule { action, rule } => {
                let Some(chain) = self.ebtables.get_mut(&rule.chain) else {
                    return CommandOutput::failed(1, format!("Chain '{}' doesn't exist.", rule.chain));
                };
                let spec = normalize(&rule.spec);
                match action {
                    RuleAction::Append => chain.push(spec),
                    RuleAction::Insert => chain.insert(0, spec),
                    RuleAction::Delete => {
                        let Some(pos) = chain.iter().position(|s| *s == spec) else {
                            return CommandOutput::failed(4, "Sorry, rule does not exist.");
                        };
                        chain.remove(pos);
                    }
                }
                ok()
            }
            EbtablesCommand::List { chain } => match self.ebtables.get(chain) {
                Some(rules) => {
                    let mut out = format!(
                        "Bridge table: nat\n\nBridge chain: {chain}, entries: {}, policy: {}\n",
                        rules.len(),
                        if chain.starts_with("HITCH") { "RETURN" } else { "ACCEPT" }
                    );
                    for rule in rules {
                        out.push_str(rule);
                        out.push('\n');
                    }
                    CommandOutput::ok(out)
                }
                None => CommandOutput::failed(1, format!("Chain '{chain}' doesn't exist.")),
            },
            EbtablesCommand::NewChain { chain } => {
                if self.ebtables.contains_key(chain) {
                    return CommandOutput::failed(1, format!("Chain {chain} already exists."));
                }
                self.ebtables.insert(chain.clone(), Vec::new());
                ok()
            }
            EbtablesCommand::DeleteChain { chain } => {
                if self.ebtables.remove(chain).is_some() {
                    ok()
                } else {
                    CommandOutput::failed(1, format!("Chain '{chain}' doesn't exist."))
                }
            }
        }
    }

    fn iptables_command(&mut self, cmd: &IptablesCommand) -> CommandOutput {
        match cmd {
            IptablesCommand::Rule { action, rule } => {
                let key = (rule.table.clone(), rule.chain.clone());
                let Some(chain) = self.iptables.get_mut(&key) else {
                    return CommandOutput::failed(1, "iptables: No chain/target/match by that name.");
                };
                let text = normalize(&format!("{} -j {}", rule.matches, rule.target));
                let position = chain.iter().position(|r| *r == text);
                match (action, position) {
                    (IptablesAction::Check, Some(_)) => ok(),
                    (IptablesAction::Check | IptablesAction::Delete, None) => CommandOutput::failed(
                        1,
                        "iptables: Bad rule (does a matching rule exist in that chain?).",
                    ),
                    (IptablesAction::Insert, _) => {
                        chain.insert(0, text);
                        ok()
                    }
                    (IptablesAction::Append, _) => {
                        chain.push(text);
                        ok()
                    }
                    (IptablesAction::Delete, Some(pos)) => {
                        chain.remove(pos);
                        ok()
                    }
                }
            }
            IptablesCommand::ListChain { table, chain } => {
                if self.iptables.contains_key(&(table.clone(), chain.clone())) {
                    CommandOutput::ok(format!("Chain {chain}\n"))
                } else {
                    CommandOutput::failed(1, "iptables: No chain/target/match by that name.")
                }
            }
            IptablesCommand::NewChain { table, chain } => {
                let key = (table.clone(), chain.clone());
                if self.iptables.contains_key(&key) {
                    return CommandOutput::failed(1, "iptables: Chain already exists.");
                }
                self.iptables.insert(key, Vec::new());
                ok()
            }
        }
    }

    fn ovs_command(&mut self, cmd: &OvsCommand) -> CommandOutput {
        let host = FakeHost::HOST_NS;
        match cmd {
            OvsCommand::AddBridge { bridge } => {
                if self.ovs.contains_key(bridge) || self.find(host, bridge).is_some() {
                    return CommandOutput::failed(1, format!("ovs-vsctl: cannot create a bridge named {bridge} because a bridge named {bridge} already exists"));
                }
                self.ovs.insert(
                    bridge.clone(),
                    OvsBridge {
                        next_ofport: 1,
                        ..OvsBridge::default()
                    },
                );
                self.add_link(host, bridge, LinkKind::Bridge, None);
                ok()
            }
            OvsCommand::DeleteBridge { bridge } => {
                if self.ovs.remove(bridge).is_none() {
                    return CommandOutput::failed(1, format!("ovs-vsctl: no bridge named {bridge}"));
                }
                if let Some(index) = self.find(host, bridge) {
                    self.remove_link(index);
                }
                for link in self.links.values_mut() {
                    if link.master.as_deref() == Some(bridge.as_str()) {
                        link.master = None;
                    }
                }
                ok()
            }
            OvsCommand::AddPort { bridge, port, tag } => {
                if self.find(host, port).is_none() {
                    return missing(port);
                }
                let Some(br) = self.ovs.get_mut(bridge) else {
                    return CommandOutput::failed(1, format!("ovs-vsctl: no bridge named {bridge}"));
                };
                if br.ports.contains_key(port) {
                    return CommandOutput::failed(1, format!("ovs-vsctl: cannot create a port named {port} because a port named {port} already exists on bridge {bridge}"));
                }
                let ofport = br.next_ofport;
                br.next_ofport += 1;
                br.ports.insert(port.clone(), (ofport, *tag));
                let bridge = bridge.clone();
                self.with_link(port, |l| l.master = Some(bridge))
            }
            OvsCommand::DeletePort { bridge, port } => {
                let removed = self
                    .ovs
                    .get_mut(bridge)
                    .and_then(|br| br.ports.remove(port));
                if removed.is_none() {
                    return CommandOutput::failed(1, format!("ovs-vsctl: no port named {port}"));
                }
                if let Some(index) = self.find(host, port) {
                    if let Some(link) = self.links.get_mut(&index) {
                        link.master = None;
                    }
                }
                ok()
            }
            OvsCommand::GetOfport { interface } => self
                .ovs
                .values()
                .find_map(|br| br.ports.get(interface))
                .map_or_else(
                    || {
                        CommandOutput::failed(
                            1,
                            format!("ovs-vsctl: no row \"{interface}\" in table Interface"),
                        )
                    },
                    |(ofport, _)| CommandOutput::ok(format!("{ofport}\n")),
                ),
            OvsCommand::AddFlow { bridge, flow } => match self.ovs.get_mut(bridge) {
                Some(br) => {
                    br.flows.push(flow.clone());
                    ok()
                }
                None => CommandOutput::failed(1, format!("ovs-ofctl: {bridge} is not a bridge or a socket")),
            },
            OvsCommand::DeleteFlows { bridge, matches } => match self.ovs.get_mut(bridge) {
                Some(br) => {
                    let wanted: Vec<&str> = matches.split(',').collect();
                    br.flows.retain(|flow| {
                        let head = flow.split(",actions=").next().unwrap_or_default();
                        let fields: Vec<&str> = head.split(',').collect();
                        !wanted.iter().all(|w| fields.contains(w))
                    });
                    ok()
                }
                None => CommandOutput::failed(1, format!("ovs-ofctl: {bridge} is not a bridge or a socket")),
            },
        }
    }
}

/// In-memory host model.
pub struct FakeHost {
    model: Mutex<HostModel>,
    failures: Mutex<Vec<FailurePredicate>>,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FakeHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeHost").finish_non_exhaustive()
    }
}

impl FakeHost {
    /// Name of the root namespace.
    pub const HOST_NS: &'static str = "host";

    /// Empty host with only the root namespace.
    #[must_use]
    pub fn new() -> Self {
        Self {
            model: Mutex::new(HostModel::new()),
            failures: Mutex::new(Vec::new()),
        }
    }

    /// Add a namespace reachable at `path`.
    pub fn add_namespace(&self, path: &str) {
        self.model.lock().namespaces.insert(path.to_string());
    }

    /// Namespace the (single) test thread is in.
    #[must_use]
    pub fn current_namespace(&self) -> String {
        self.model.lock().current_ns.clone()
    }

    /// Add a physical interface to the root namespace, up, with addresses.
    pub fn add_device(&self, name: &str, mac: MacAddress, addrs: &[&str]) {
        let mut model = self.model.lock();
        let index = model.add_link(Self::HOST_NS, name, LinkKind::Device, Some(mac));
        if let Some(link) = model.links.get_mut(&index) {
            link.up = true;
            link.addrs = addrs.iter().filter_map(|a| a.parse().ok()).collect();
        }
    }

    /// Add a route to a root namespace interface.
    pub fn add_device_route(&self, dev: &str, route: Route) {
        let mut model = self.model.lock();
        let Some(index) = model.find(Self::HOST_NS, dev) else {
            return;
        };
        if let Some(link) = model.links.get_mut(&index) {
            link.routes.push(route);
        }
    }

    /// Fail every command matching `predicate` with exit status 1.
    pub fn fail_when(&self, predicate: impl Fn(&HostCommand) -> bool + Send + Sync + 'static) {
        self.failures.lock().push(Box::new(predicate));
    }

    /// Make switching into the namespace `path` fail from now on.
    pub fn block_namespace_switch(&self, path: &str) {
        self.model.lock().unreachable_ns.insert(path.to_string());
    }

    /// Remove all injected failures.
    pub fn clear_failures(&self) {
        self.failures.lock().clear();
    }

    /// Rendered commands executed so far.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        self.model.lock().commands.clone()
    }

    /// Whether a link exists in a namespace.
    #[must_use]
    pub fn has_link(&self, ns: &str, name: &str) -> bool {
        self.model.lock().find(ns, name).is_some()
    }

    /// Links of a namespace, by name.
    #[must_use]
    pub fn links_in(&self, ns: &str) -> Vec<String> {
        let model = self.model.lock();
        let mut names: Vec<String> = model
            .links
            .values()
            .filter(|l| l.ns == ns)
            .map(|l| l.name.clone())
            .collect();
        names.sort();
        names
    }

    fn inspect<T>(&self, ns: &str, name: &str, f: impl FnOnce(&FakeLink) -> T) -> Option<T> {
        let model = self.model.lock();
        model.find(ns, name).and_then(|i| model.links.get(&i)).map(f)
    }

    /// Master of a link.
    #[must_use]
    pub fn link_master(&self, ns: &str, name: &str) -> Option<String> {
        self.inspect(ns, name, |l| l.master.clone()).flatten()
    }

    /// MAC of a link.
    #[must_use]
    pub fn link_mac(&self, ns: &str, name: &str) -> Option<MacAddress> {
        self.inspect(ns, name, |l| l.mac)
    }

    /// Whether a link is up.
    #[must_use]
    pub fn link_up(&self, ns: &str, name: &str) -> bool {
        self.inspect(ns, name, |l| l.up).unwrap_or(false)
    }

    /// Hairpin mode of a link.
    #[must_use]
    pub fn link_hairpin(&self, ns: &str, name: &str) -> bool {
        self.inspect(ns, name, |l| l.hairpin).unwrap_or(false)
    }

    /// Addresses of a link.
    #[must_use]
    pub fn link_addresses(&self, ns: &str, name: &str) -> Vec<IpNet> {
        self.inspect(ns, name, |l| l.addrs.clone()).unwrap_or_default()
    }

    /// Routes of a link.
    #[must_use]
    pub fn link_routes(&self, ns: &str, name: &str) -> Vec<Route> {
        self.inspect(ns, name, |l| l.routes.clone()).unwrap_or_default()
    }

    /// Neighbour entry.
    #[must_use]
    pub fn neighbor(&self, ns: &str, dev: &str, ip: IpAddr) -> Option<MacAddress> {
        self.model
            .lock()
            .neighbors
            .get(&(ns.to_string(), dev.to_string(), ip))
            .copied()
    }

    /// Rules of an ebtables chain, empty if the chain is missing.
    #[must_use]
    pub fn ebtables_rules(&self, chain: &str) -> Vec<String> {
        self.model.lock().ebtables.get(chain).cloned().unwrap_or_default()
    }

    /// Whether an ebtables chain exists.
    #[must_use]
    pub fn has_ebtables_chain(&self, chain: &str) -> bool {
        self.model.lock().ebtables.contains_key(chain)
    }

    /// Append a rule behind the plugin's back.
    pub fn inject_ebtables_rule(&self, chain: &str, spec: &str) {
        self.model
            .lock()
            .ebtables
            .entry(chain.to_string())
            .or_default()
            .push(normalize(spec));
    }

    /// Remove a rule behind the plugin's back.
    pub fn drop_ebtables_rule(&self, chain: &str, spec: &str) {
        let spec = normalize(spec);
        if let Some(rules) = self.model.lock().ebtables.get_mut(chain) {
            rules.retain(|r| *r != spec);
        }
    }

    /// Rules of an iptables chain as `<matches> -j <target>`.
    #[must_use]
    pub fn iptables_rules(&self, table: &str, chain: &str) -> Vec<String> {
        self.model
            .lock()
            .iptables
            .get(&(table.to_string(), chain.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Whether an OVS bridge exists.
    #[must_use]
    pub fn has_ovs_bridge(&self, bridge: &str) -> bool {
        self.model.lock().ovs.contains_key(bridge)
    }

    /// Ports of an OVS bridge with their VLAN tags.
    #[must_use]
    pub fn ovs_ports(&self, bridge: &str) -> Vec<(String, Option<u16>)> {
        self.model
            .lock()
            .ovs
            .get(bridge)
            .map(|br| br.ports.iter().map(|(name, (_, tag))| (name.clone(), *tag)).collect())
            .unwrap_or_default()
    }

    /// Flows of an OVS bridge.
    #[must_use]
    pub fn ovs_flows(&self, bridge: &str) -> Vec<String> {
        self.model
            .lock()
            .ovs
            .get(bridge)
            .map(|br| br.flows.clone())
            .unwrap_or_default()
    }
}

impl ControlPlane for FakeHost {
    fn execute(&self, command: &HostCommand) -> HitchResult<CommandOutput> {
        let injected = self.failures.lock().iter().any(|fail| fail(command));

        let mut model = self.model.lock();
        model.commands.push(command.to_string());
        if injected {
            return Ok(CommandOutput::failed(1, "injected failure"));
        }

        Ok(match command {
            HostCommand::Link(cmd) => model.link_command(cmd),
            HostCommand::Ebtables(cmd) => model.ebtables_command(cmd),
            HostCommand::Iptables(cmd) => model.iptables_command(cmd),
            HostCommand::Ovs(cmd) => model.ovs_command(cmd),
        })
    }
}

impl NamespaceSwitcher for FakeHost {
    fn open(&self, path: &Path) -> HitchResult<NsHandle> {
        let id = path.display().to_string();
        if self.model.lock().namespaces.contains(&id) {
            Ok(NsHandle::named(id))
        } else {
            Err(HitchError::NamespaceOperationFailed {
                operation: "open".to_string(),
                path: id,
                reason: "No such file or directory (os error 2)".to_string(),
            })
        }
    }

    fn current(&self) -> HitchResult<NsHandle> {
        Ok(NsHandle::named(self.current_namespace()))
    }

    fn switch_to(&self, handle: &NsHandle) -> HitchResult<()> {
        let mut model = self.model.lock();
        if !model.namespaces.contains(handle.id()) || model.unreachable_ns.contains(handle.id()) {
            return Err(HitchError::NamespaceOperationFailed {
                operation: "setns".to_string(),
                path: handle.id().to_string(),
                reason: "Invalid argument (os error 22)".to_string(),
            });
        }
        model.current_ns = handle.id().to_string();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link;

    #[test]
    fn veth_delete_removes_peer() {
        let host = FakeHost::new();
        host.run(
            LinkCommand::AddVeth {
                name: "azv1".to_string(),
                peer: "azv1-2".to_string(),
            }
            .into(),
        )
        .unwrap();
        assert!(host.has_link(FakeHost::HOST_NS, "azv1-2"));

        link::delete_link(&host, "azv1").unwrap();
        assert!(host.links_in(FakeHost::HOST_NS).is_empty());
    }

    #[test]
    fn duplicate_link_reports_file_exists() {
        let host = FakeHost::new();
        let add = || {
            host.run(
                LinkCommand::AddBridge {
                    name: "azure2".to_string(),
                }
                .into(),
            )
        };
        add().unwrap();
        let err = add().unwrap_err();
        assert!(crate::exec::is_exists_error(&err));
    }

    #[test]
    fn show_output_round_trips_through_parser() {
        let host = FakeHost::new();
        host.add_device("eth0", "00:0d:3a:f3:1c:4e".parse().unwrap(), &["10.0.0.4/24"]);
        let info = link::show_link(&host, "eth0").unwrap().unwrap();
        assert_eq!(info.name, "eth0");
        assert!(info.up);
        assert_eq!(info.mac, Some("00:0d:3a:f3:1c:4e".parse().unwrap()));

        assert!(link::show_link(&host, "eth9").unwrap().is_none());
    }

    #[test]
    fn injected_failures_are_recorded() {
        let host = FakeHost::new();
        host.fail_when(|cmd| matches!(cmd, HostCommand::Ebtables(_)));
        let err = crate::ebtables::Ebtables::new(&host)
            .append(&crate::ebtables::arp_reply_dnat_rule("eth0"))
            .unwrap_err();
        assert!(matches!(err, HitchError::RuleProgrammingFailed { .. }));
        assert_eq!(host.commands().len(), 1);
    }
}
