//! Layer-2 rewrite rules in the ebtables `nat` table.
//!
//! All rules live in two dedicated chains, jumped to from the first slot of
//! the built-in `PREROUTING` and `POSTROUTING` chains. The rule text built
//! here is also the identity used by the reconciler, so it must match what
//! `ebtables -L --Lmac2` prints back.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use hitch_common::{HitchError, HitchResult, MacAddress};

use crate::exec::ControlPlane;

/// Built-in prerouting chain.
pub const PREROUTING: &str = "PREROUTING";
/// Built-in postrouting chain.
pub const POSTROUTING: &str = "POSTROUTING";
/// Our prerouting chain.
pub const HITCH_PREROUTING: &str = "HITCHPREROUTING";
/// Our postrouting chain.
pub const HITCH_POSTROUTING: &str = "HITCHPOSTROUTING";

/// MAC used to answer ARP on behalf of containers in tunnel mode.
pub const VIRTUAL_MAC: MacAddress = MacAddress::new([0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc]);

/// Prefix shared by all container-facing host interfaces.
pub const CONTAINER_IF_PREFIX: &str = "az";

/// How a rule is applied to its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    /// Append at the end.
    Append,
    /// Insert at the head.
    Insert,
    /// Remove.
    Delete,
}

impl RuleAction {
    const fn flag(self) -> &'static str {
        match self {
            Self::Append => "-A",
            Self::Insert => "-I",
            Self::Delete => "-D",
        }
    }
}

/// A rule in the `nat` table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EbtablesRule {
    /// Chain holding the rule.
    pub chain: String,
    /// Match and target text, in listing form.
    pub spec: String,
}

impl EbtablesRule {
    /// Rule with the given chain and spec.
    #[must_use]
    pub fn new(chain: &str, spec: String) -> Self {
        Self {
            chain: chain.to_string(),
            spec,
        }
    }
}

impl fmt::Display for EbtablesRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.chain, self.spec)
    }
}

/// `ebtables -t nat` commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EbtablesCommand {
    /// Add or remove a rule.
    Rule {
        /// What to do.
        action: RuleAction,
        /// The rule.
        rule: EbtablesRule,
    },
    /// List a chain with MACs in colon form.
    List {
        /// Chain to list.
        chain: String,
    },
    /// Create a chain with policy `RETURN`.
    NewChain {
        /// Chain name.
        chain: String,
    },
    /// Flush and remove a chain.
    DeleteChain {
        /// Chain name.
        chain: String,
    },
}

impl EbtablesCommand {
    /// Program arguments.
    #[must_use]
    pub fn args(&self) -> Vec<String> {
        let mut args = vec!["-t".to_string(), "nat".to_string()];
        match self {
            Self::Rule { action, rule } => {
                args.push(action.flag().to_string());
                args.push(rule.chain.clone());
                if *action == RuleAction::Insert {
                    args.push("1".to_string());
                }
                args.extend(rule.spec.split_whitespace().map(ToString::to_string));
            }
            Self::List { chain } => {
                args.extend(["-L".to_string(), chain.clone(), "--Lmac2".to_string()]);
            }
            Self::NewChain { chain } => {
                args.extend([
                    "-N".to_string(),
                    chain.clone(),
                    "-P".to_string(),
                    "RETURN".to_string(),
                ]);
            }
            Self::DeleteChain { chain } => {
                args.extend(["-X".to_string(), chain.clone()]);
            }
        }
        args
    }
}

/// Source-NAT frames leaving `if_name` to `mac`, ARP included.
#[must_use]
pub fn snat_rule(if_name: &str, mac: MacAddress) -> EbtablesRule {
    EbtablesRule::new(
        HITCH_POSTROUTING,
        format!("-s Unicast -o {if_name} -j snat --to-src {mac} --snat-arp --snat-target ACCEPT"),
    )
}

/// Answer ARP requests for `ip` with `mac`.
#[must_use]
pub fn arp_reply_rule(ip: IpAddr, mac: MacAddress) -> EbtablesRule {
    EbtablesRule::new(
        HITCH_PREROUTING,
        format!("-p ARP --arp-op Request --arp-ip-dst {ip} -j arpreply --arpreply-mac {mac}"),
    )
}

/// Broadcast ARP replies arriving on `if_name` so every container sees them.
#[must_use]
pub fn arp_reply_dnat_rule(if_name: &str) -> EbtablesRule {
    EbtablesRule::new(
        HITCH_PREROUTING,
        format!(
            "-p ARP -i {if_name} --arp-op Reply -j dnat --to-dst {} --dnat-target ACCEPT",
            MacAddress::BROADCAST
        ),
    )
}

/// Destination-NAT IPv4 frames for `ip` arriving on `if_name` to `mac`.
#[must_use]
pub fn ip_dnat_rule(if_name: &str, ip: IpAddr, mac: MacAddress) -> EbtablesRule {
    EbtablesRule::new(
        HITCH_PREROUTING,
        format!("-p IPv4 -i {if_name} --ip-dst {ip} -j dnat --to-dst {mac} --dnat-target ACCEPT"),
    )
}

/// Hairpin frames from `bridge` and from container interfaces to the virtual
/// MAC. The bridge rule is skipped when the bridge itself carries the prefix.
#[must_use]
pub fn vepa_rules(bridge: &str, mac: MacAddress) -> Vec<EbtablesRule> {
    let mut rules = Vec::with_capacity(2);
    if !bridge.starts_with(CONTAINER_IF_PREFIX) {
        rules.push(EbtablesRule::new(
            HITCH_PREROUTING,
            format!("-i {bridge} -j dnat --to-dst {mac} --dnat-target ACCEPT"),
        ));
    }
    rules.push(EbtablesRule::new(
        HITCH_PREROUTING,
        format!("-i {CONTAINER_IF_PREFIX}+ -j dnat --to-dst {mac} --dnat-target ACCEPT"),
    ));
    rules
}

/// Jumps from the built-in chains into ours. Without them nothing in our
/// chains is evaluated.
#[must_use]
pub fn jump_rules() -> [EbtablesRule; 2] {
    [
        EbtablesRule::new(PREROUTING, format!("-j {HITCH_PREROUTING}")),
        EbtablesRule::new(POSTROUTING, format!("-j {HITCH_POSTROUTING}")),
    ]
}

/// Set of rules keyed by spec text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet(BTreeMap<String, EbtablesRule>);

impl RuleSet {
    /// Empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule, replacing any rule with the same spec.
    pub fn insert(&mut self, rule: EbtablesRule) {
        self.0.insert(rule.spec.clone(), rule);
    }

    /// Whether a rule with this spec is present.
    #[must_use]
    pub fn contains(&self, spec: &str) -> bool {
        self.0.contains_key(spec)
    }

    /// Look up a rule by spec.
    #[must_use]
    pub fn get(&self, spec: &str) -> Option<&EbtablesRule> {
        self.0.get(spec)
    }

    /// Number of rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Rules in spec order.
    pub fn iter(&self) -> impl Iterator<Item = &EbtablesRule> {
        self.0.values()
    }
}

impl FromIterator<EbtablesRule> for RuleSet {
    fn from_iter<I: IntoIterator<Item = EbtablesRule>>(iter: I) -> Self {
        let mut set = Self::new();
        for rule in iter {
            set.insert(rule);
        }
        set
    }
}

impl Extend<EbtablesRule> for RuleSet {
    fn extend<I: IntoIterator<Item = EbtablesRule>>(&mut self, iter: I) {
        for rule in iter {
            self.insert(rule);
        }
    }
}

/// Parse `ebtables -L` output of one chain into rule specs.
#[must_use]
pub fn parse_listing(chain: &str, output: &str) -> Vec<EbtablesRule> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| {
            !line.is_empty() && !line.starts_with("Bridge table:") && !line.starts_with("Bridge chain:")
        })
        .map(|line| EbtablesRule::new(chain, line.to_string()))
        .collect()
}

/// ebtables operations over a [`ControlPlane`].
#[derive(Clone, Copy)]
pub struct Ebtables<'a> {
    cp: &'a dyn ControlPlane,
}

impl<'a> Ebtables<'a> {
    /// Wrap a control plane.
    #[must_use]
    pub const fn new(cp: &'a dyn ControlPlane) -> Self {
        Self { cp }
    }

    /// Apply a rule change.
    ///
    /// # Errors
    ///
    /// Returns [`HitchError::RuleProgrammingFailed`] if ebtables rejects it.
    pub fn apply(&self, action: RuleAction, rule: &EbtablesRule) -> HitchResult<()> {
        tracing::debug!(?action, chain = %rule.chain, rule = %rule.spec, "Programming ebtables rule");
        self.cp
            .run(
                EbtablesCommand::Rule {
                    action,
                    rule: rule.clone(),
                }
                .into(),
            )
            .map(drop)
            .map_err(|e| HitchError::RuleProgrammingFailed {
                rule: rule.to_string(),
                reason: e.to_string(),
            })
    }

    /// Append a rule.
    ///
    /// # Errors
    ///
    /// See [`Ebtables::apply`].
    pub fn append(&self, rule: &EbtablesRule) -> HitchResult<()> {
        self.apply(RuleAction::Append, rule)
    }

    /// Append a rule unless the chain already holds it.
    ///
    /// # Errors
    ///
    /// Returns an error if the chain cannot be listed or the rule is rejected.
    pub fn append_unique(&self, rule: &EbtablesRule) -> HitchResult<()> {
        if self.list(&rule.chain)?.iter().any(|r| r.spec == rule.spec) {
            tracing::debug!(chain = %rule.chain, rule = %rule.spec, "ebtables rule already present");
            return Ok(());
        }
        self.append(rule)
    }

    /// Delete a rule.
    ///
    /// # Errors
    ///
    /// See [`Ebtables::apply`].
    pub fn delete(&self, rule: &EbtablesRule) -> HitchResult<()> {
        self.apply(RuleAction::Delete, rule)
    }

    /// Delete a list of rules, logging failures instead of returning them.
    pub fn delete_best_effort(&self, rules: &[EbtablesRule]) {
        for rule in rules {
            if let Err(e) = self.delete(rule) {
                tracing::warn!(rule = %rule, error = %e, "Failed to delete ebtables rule");
            }
        }
    }

    /// List the rules of a chain.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing fails.
    pub fn list(&self, chain: &str) -> HitchResult<Vec<EbtablesRule>> {
        let out = self.cp.run(
            EbtablesCommand::List {
                chain: chain.to_string(),
            }
            .into(),
        )?;
        Ok(parse_listing(chain, &out))
    }

    /// Rules currently installed in the given chains.
    ///
    /// # Errors
    ///
    /// Returns an error if any listing fails.
    pub fn live_rules(&self, chains: &[&str]) -> HitchResult<RuleSet> {
        let mut set = RuleSet::new();
        for chain in chains {
            set.extend(self.list(chain)?);
        }
        Ok(set)
    }

    /// Whether a chain exists.
    #[must_use]
    pub fn chain_exists(&self, chain: &str) -> bool {
        self.list(chain).is_ok()
    }

    /// Create our chains and hook them into the built-in chains.
    ///
    /// A chain that is recreated keeps an existing jump instead of getting a
    /// second one.
    ///
    /// # Errors
    ///
    /// Returns an error if a chain or jump rule cannot be created.
    pub fn initialize(&self) -> HitchResult<()> {
        for jump in jump_rules() {
            let chain = jump.spec.trim_start_matches("-j ");
            if self.chain_exists(chain) {
                continue;
            }

            tracing::info!(chain, "Creating ebtables chain");
            self.cp.run(
                EbtablesCommand::NewChain {
                    chain: chain.to_string(),
                }
                .into(),
            )?;
            if !self.list(&jump.chain)?.contains(&jump) {
                self.apply(RuleAction::Insert, &jump)?;
            }
        }
        Ok(())
    }

    /// Unhook and remove our chains.
    ///
    /// # Errors
    ///
    /// Returns an error if a chain cannot be removed.
    pub fn uninitialize(&self) -> HitchResult<()> {
        for jump in jump_rules() {
            let chain = jump.spec.trim_start_matches("-j ");
            if !self.chain_exists(chain) {
                continue;
            }

            tracing::info!(chain, "Removing ebtables chain");
            if self.list(&jump.chain)?.contains(&jump) {
                self.delete(&jump)?;
            }
            self.cp.run(
                EbtablesCommand::DeleteChain {
                    chain: chain.to_string(),
                }
                .into(),
            )?;
        }
        Ok(())
    }
}
