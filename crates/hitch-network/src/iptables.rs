//! iptables rule management.
//!
//! Used by the SNAT data path: MASQUERADE for the SNAT bridge subnet and
//! ACCEPT rules in our own filter chains for host/container traffic.

use hitch_common::{HitchError, HitchResult};

use crate::exec::ControlPlane;

/// Seconds to wait for the xtables lock.
pub const LOCK_WAIT_SECS: &str = "60";

/// Filter table.
pub const FILTER: &str = "filter";
/// NAT table.
pub const NAT: &str = "nat";

/// Built-in input chain.
pub const INPUT: &str = "INPUT";
/// Built-in output chain.
pub const OUTPUT: &str = "OUTPUT";
/// Built-in forward chain.
pub const FORWARD: &str = "FORWARD";
/// Built-in postrouting chain.
pub const POSTROUTING: &str = "POSTROUTING";

/// Our input chain.
pub const HITCH_CNI_INPUT: &str = "HITCHCNIINPUT";
/// Our output chain.
pub const HITCH_CNI_OUTPUT: &str = "HITCHCNIOUTPUT";

/// Accept target.
pub const ACCEPT: &str = "ACCEPT";
/// Drop target.
pub const DROP: &str = "DROP";
/// Masquerade target.
pub const MASQUERADE: &str = "MASQUERADE";

/// How a rule is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IptablesAction {
    /// Check whether the rule exists.
    Check,
    /// Insert at the head of the chain.
    Insert,
    /// Append at the end of the chain.
    Append,
    /// Remove.
    Delete,
}

impl IptablesAction {
    const fn flag(self) -> &'static str {
        match self {
            Self::Check => "-C",
            Self::Insert => "-I",
            Self::Append => "-A",
            Self::Delete => "-D",
        }
    }
}

/// An iptables rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IptablesRule {
    /// Table.
    pub table: String,
    /// Chain.
    pub chain: String,
    /// Match condition, may be empty.
    pub matches: String,
    /// Jump target.
    pub target: String,
}

impl IptablesRule {
    /// Build a rule.
    #[must_use]
    pub fn new(table: &str, chain: &str, matches: impl Into<String>, target: &str) -> Self {
        Self {
            table: table.to_string(),
            chain: chain.to_string(),
            matches: matches.into(),
            target: target.to_string(),
        }
    }

    /// Jump from a built-in chain to one of ours.
    #[must_use]
    pub fn jump(table: &str, from: &str, to: &str) -> Self {
        Self::new(table, from, "", to)
    }
}

impl std::fmt::Display for IptablesRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "-t {} {}", self.table, self.chain)?;
        if !self.matches.trim().is_empty() {
            write!(f, " {}", self.matches.trim())?;
        }
        write!(f, " -j {}", self.target)
    }
}

/// `iptables` commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IptablesCommand {
    /// Check, add or remove a rule.
    Rule {
        /// What to do.
        action: IptablesAction,
        /// The rule.
        rule: IptablesRule,
    },
    /// List a chain, failing if it does not exist.
    ListChain {
        /// Table.
        table: String,
        /// Chain.
        chain: String,
    },
    /// Create a chain.
    NewChain {
        /// Table.
        table: String,
        /// Chain.
        chain: String,
    },
}

impl IptablesCommand {
    /// Program arguments.
    #[must_use]
    pub fn args(&self) -> Vec<String> {
        let mut args = vec!["-w".to_string(), LOCK_WAIT_SECS.to_string()];
        match self {
            Self::Rule { action, rule } => {
                args.extend([
                    "-t".to_string(),
                    rule.table.clone(),
                    action.flag().to_string(),
                    rule.chain.clone(),
                ]);
                if *action == IptablesAction::Insert {
                    args.push("1".to_string());
                }
                args.extend(rule.matches.split_whitespace().map(ToString::to_string));
                args.extend(["-j".to_string(), rule.target.clone()]);
            }
            Self::ListChain { table, chain } => {
                args.extend(["-t".to_string(), table.clone(), "-L".to_string(), chain.clone()]);
            }
            Self::NewChain { table, chain } => {
                args.extend(["-t".to_string(), table.clone(), "-N".to_string(), chain.clone()]);
            }
        }
        args
    }
}

/// iptables operations over a [`ControlPlane`].
#[derive(Clone, Copy)]
pub struct Iptables<'a> {
    cp: &'a dyn ControlPlane,
}

impl<'a> Iptables<'a> {
    /// Wrap a control plane.
    #[must_use]
    pub const fn new(cp: &'a dyn ControlPlane) -> Self {
        Self { cp }
    }

    fn apply(&self, action: IptablesAction, rule: &IptablesRule) -> HitchResult<()> {
        self.cp
            .run(
                IptablesCommand::Rule {
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

    /// Whether a chain exists.
    #[must_use]
    pub fn chain_exists(&self, table: &str, chain: &str) -> bool {
        self.cp
            .run(
                IptablesCommand::ListChain {
                    table: table.to_string(),
                    chain: chain.to_string(),
                }
                .into(),
            )
            .is_ok()
    }

    /// Create a chain unless it already exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the chain cannot be created.
    pub fn create_chain(&self, table: &str, chain: &str) -> HitchResult<()> {
        if self.chain_exists(table, chain) {
            return Ok(());
        }

        tracing::info!(table, chain, "Creating iptables chain");
        self.cp
            .run(
                IptablesCommand::NewChain {
                    table: table.to_string(),
                    chain: chain.to_string(),
                }
                .into(),
            )
            .map(drop)
    }

    /// Whether a rule is installed.
    #[must_use]
    pub fn rule_exists(&self, rule: &IptablesRule) -> bool {
        self.apply(IptablesAction::Check, rule).is_ok()
    }

    /// Insert a rule at the head of its chain unless already present.
    ///
    /// # Errors
    ///
    /// Returns [`HitchError::RuleProgrammingFailed`] if iptables rejects it.
    pub fn insert(&self, rule: &IptablesRule) -> HitchResult<()> {
        if self.rule_exists(rule) {
            tracing::debug!(rule = %rule, "iptables rule already present");
            return Ok(());
        }

        tracing::debug!(rule = %rule, "Inserting iptables rule");
        self.apply(IptablesAction::Insert, rule)
    }

    /// Append a rule to its chain unless already present.
    ///
    /// # Errors
    ///
    /// Returns [`HitchError::RuleProgrammingFailed`] if iptables rejects it.
    pub fn append(&self, rule: &IptablesRule) -> HitchResult<()> {
        if self.rule_exists(rule) {
            tracing::debug!(rule = %rule, "iptables rule already present");
            return Ok(());
        }

        tracing::debug!(rule = %rule, "Appending iptables rule");
        self.apply(IptablesAction::Append, rule)
    }

    /// Remove a rule.
    ///
    /// # Errors
    ///
    /// Returns [`HitchError::RuleProgrammingFailed`] if iptables rejects it.
    pub fn delete(&self, rule: &IptablesRule) -> HitchResult<()> {
        tracing::debug!(rule = %rule, "Deleting iptables rule");
        self.apply(IptablesAction::Delete, rule)
    }

    /// Make sure `chain` exists in the filter table and `builtin` jumps to it.
    ///
    /// # Errors
    ///
    /// Returns an error if the chain or the jump cannot be created.
    pub fn ensure_filter_chain(&self, builtin: &str, chain: &str) -> HitchResult<()> {
        self.create_chain(FILTER, chain)?;
        self.insert(&IptablesRule::jump(FILTER, builtin, chain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_arguments() {
        let rule = IptablesRule::new(NAT, POSTROUTING, "-s 169.254.0.0/16", MASQUERADE);
        let cmd = IptablesCommand::Rule {
            action: IptablesAction::Insert,
            rule,
        };
        insta::assert_snapshot!(
            cmd.args().join(" "),
            @"-w 60 -t nat -I POSTROUTING 1 -s 169.254.0.0/16 -j MASQUERADE"
        );
    }

    #[test]
    fn jump_has_no_matches() {
        let rule = IptablesRule::jump(FILTER, INPUT, HITCH_CNI_INPUT);
        let cmd = IptablesCommand::Rule {
            action: IptablesAction::Check,
            rule: rule.clone(),
        };
        assert_eq!(cmd.args().join(" "), "-w 60 -t filter -C INPUT -j HITCHCNIINPUT");
        assert_eq!(rule.to_string(), "-t filter INPUT -j HITCHCNIINPUT");
    }
}
