//! Reconciliation of ebtables rules against the network state.
//!
//! Rules can disappear behind our back (an administrator flushing tables, a
//! host agent rewriting them) and rules of deleted endpoints can linger when
//! a plugin invocation dies halfway. The reconciler compares the rules the
//! state calls for with the rules installed in our chains and repairs the
//! difference. A rule is only touched once it has been out of place on
//! [`VALIDATION_PASSES`] consecutive passes, so a plugin invocation that is
//! in the middle of programming rules is left alone. The jumps from the
//! built-in chains are checked the same way, and a chain that was removed
//! outright is recreated on the spot.

use std::collections::HashMap;

use hitch_common::HitchResult;

use crate::ebtables::{
    Ebtables, EbtablesRule, HITCH_POSTROUTING, HITCH_PREROUTING, POSTROUTING, PREROUTING, RuleAction,
    RuleSet, jump_rules,
};
use crate::exec::ControlPlane;

/// Consecutive mismatching passes before a rule is repaired.
pub const VALIDATION_PASSES: u32 = 2;

/// What a pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// Missing rules that were installed.
    pub added: usize,
    /// Stale rules that were removed.
    pub deleted: usize,
}

/// Debounced repair of ebtables rules.
#[derive(Debug, Default)]
pub struct RuleReconciler {
    add_pending: HashMap<String, u32>,
    delete_pending: HashMap<String, u32>,
    monitor_all_chains: bool,
}

impl RuleReconciler {
    /// Reconciler over our own chains. With `monitor_all_chains`, copies of
    /// our rules found in the built-in chains are removed too.
    #[must_use]
    pub fn new(monitor_all_chains: bool) -> Self {
        Self {
            monitor_all_chains,
            ..Self::default()
        }
    }

    /// Rules waiting to be installed, with their mismatch count.
    #[must_use]
    pub const fn pending_additions(&self) -> &HashMap<String, u32> {
        &self.add_pending
    }

    /// Rules waiting to be removed, with their mismatch count.
    #[must_use]
    pub const fn pending_deletions(&self) -> &HashMap<String, u32> {
        &self.delete_pending
    }

    /// Run one pass against `desired`.
    ///
    /// Failing to apply a single rule is logged and retried on the next pass.
    ///
    /// # Errors
    ///
    /// Returns an error if a missing chain cannot be recreated or the live
    /// rules cannot be read. No counter moves in that case.
    pub fn run_pass(&mut self, cp: &dyn ControlPlane, desired: &RuleSet) -> HitchResult<PassSummary> {
        let ebtables = Ebtables::new(cp);
        if desired.is_empty() {
            if !ebtables.chain_exists(HITCH_PREROUTING) {
                tracing::debug!("No ebtables chains and no rules wanted");
                self.add_pending.clear();
                self.delete_pending.clear();
                return Ok(PassSummary::default());
            }
        } else {
            ebtables.initialize()?;
        }

        let live = ebtables.live_rules(&[HITCH_PREROUTING, HITCH_POSTROUTING])?;
        let mut builtin = ebtables.list(PREROUTING)?;
        builtin.extend(ebtables.list(POSTROUTING)?);

        let mut missing: Vec<EbtablesRule> = desired.iter().filter(|r| !live.contains(&r.spec)).cloned().collect();
        if !desired.is_empty() {
            missing.extend(jump_rules().into_iter().filter(|jump| !builtin.contains(jump)));
        }
        let mut stale: Vec<EbtablesRule> = live.iter().filter(|r| !desired.contains(&r.spec)).cloned().collect();
        if self.monitor_all_chains {
            stale.extend(builtin.into_iter().filter(|r| desired.contains(&r.spec)));
        }

        tracing::debug!(
            desired = desired.len(),
            live = live.len(),
            missing = missing.len(),
            stale = stale.len(),
            "Reconciling ebtables rules"
        );

        let jumps = jump_rules();
        let added = debounce(&mut self.add_pending, missing.iter(), |rule| {
            tracing::info!(rule = %rule, "Adding missing ebtables rule");
            if jumps.contains(rule) {
                // Jumps go first so nothing in the built-in chain shadows them.
                ebtables.apply(RuleAction::Insert, rule)
            } else {
                ebtables.append(rule)
            }
        });
        let deleted = debounce(&mut self.delete_pending, stale.iter(), |rule| {
            tracing::info!(rule = %rule, "Removing stale ebtables rule");
            ebtables.delete(rule)
        });
        Ok(PassSummary { added, deleted })
    }
}

/// Count another mismatch for each rule, apply those that reached the
/// threshold and forget rules that are no longer mismatched.
fn debounce<'r>(
    pending: &mut HashMap<String, u32>,
    mismatched: impl Iterator<Item = &'r EbtablesRule>,
    mut apply: impl FnMut(&EbtablesRule) -> HitchResult<()>,
) -> usize {
    let mismatched: HashMap<String, &EbtablesRule> = mismatched.map(|r| (r.to_string(), r)).collect();
    pending.retain(|key, _| mismatched.contains_key(key));

    let mut applied = 0;
    for (key, rule) in mismatched {
        let count = pending.entry(key.clone()).or_insert(0);
        *count += 1;
        if *count < VALIDATION_PASSES {
            continue;
        }
        match apply(rule) {
            Ok(()) => {
                pending.remove(&key);
                applied += 1;
            }
            Err(e) => tracing::warn!(rule = %rule, error = %e, "Failed to repair ebtables rule"),
        }
    }
    applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ebtables::{self, EbtablesCommand};
    use crate::exec::HostCommand;
    use crate::fake::FakeHost;
    use hitch_common::MacAddress;

    fn mac() -> MacAddress {
        "02:00:00:00:00:07".parse().unwrap()
    }

    fn rule() -> EbtablesRule {
        ebtables::arp_reply_rule("10.0.0.5".parse().unwrap(), mac())
    }

    fn host() -> FakeHost {
        let host = FakeHost::new();
        Ebtables::new(&host).initialize().unwrap();
        host
    }

    fn desired() -> RuleSet {
        [rule()].into_iter().collect()
    }

    #[test]
    fn missing_rule_added_on_second_pass() {
        let host = host();
        let mut reconciler = RuleReconciler::new(false);

        let first = reconciler.run_pass(&host, &desired()).unwrap();
        assert_eq!(first, PassSummary::default());
        assert!(host.ebtables_rules(HITCH_PREROUTING).is_empty());
        assert_eq!(reconciler.pending_additions().get(&rule().to_string()), Some(&1));

        let second = reconciler.run_pass(&host, &desired()).unwrap();
        assert_eq!(second.added, 1);
        assert_eq!(host.ebtables_rules(HITCH_PREROUTING), vec![rule().spec]);
        assert!(reconciler.pending_additions().is_empty());
    }

    #[test]
    fn transient_mismatch_resets_counter() {
        let host = host();
        let mut reconciler = RuleReconciler::new(false);

        reconciler.run_pass(&host, &desired()).unwrap();
        // The plugin finishes programming the rule in between.
        host.inject_ebtables_rule(HITCH_PREROUTING, &rule().spec);
        reconciler.run_pass(&host, &desired()).unwrap();
        assert!(reconciler.pending_additions().is_empty());

        host.drop_ebtables_rule(HITCH_PREROUTING, &rule().spec);
        let summary = reconciler.run_pass(&host, &desired()).unwrap();
        assert_eq!(summary.added, 0);
        assert!(host.ebtables_rules(HITCH_PREROUTING).is_empty());
    }

    #[test]
    fn dropped_from_desired_resets_counter() {
        let host = host();
        let mut reconciler = RuleReconciler::new(false);

        reconciler.run_pass(&host, &desired()).unwrap();
        assert_eq!(reconciler.pending_additions().get(&rule().to_string()), Some(&1));

        // The endpoint is deleted between passes.
        assert_eq!(reconciler.run_pass(&host, &RuleSet::new()).unwrap(), PassSummary::default());
        assert!(reconciler.pending_additions().is_empty());

        let summary = reconciler.run_pass(&host, &desired()).unwrap();
        assert_eq!(summary.added, 0);
        assert!(host.ebtables_rules(HITCH_PREROUTING).is_empty());
        assert_eq!(reconciler.pending_additions().get(&rule().to_string()), Some(&1));
    }

    #[test]
    fn flushed_jump_is_restored() {
        let host = host();
        host.inject_ebtables_rule(HITCH_PREROUTING, &rule().spec);
        host.drop_ebtables_rule(PREROUTING, "-j HITCHPREROUTING");
        let mut reconciler = RuleReconciler::new(true);

        assert_eq!(reconciler.run_pass(&host, &desired()).unwrap().added, 0);
        assert!(host.ebtables_rules(PREROUTING).is_empty());

        assert_eq!(reconciler.run_pass(&host, &desired()).unwrap().added, 1);
        assert_eq!(host.ebtables_rules(PREROUTING), vec!["-j HITCHPREROUTING".to_string()]);
        assert_eq!(host.ebtables_rules(HITCH_PREROUTING), vec![rule().spec]);
        assert_eq!(reconciler.run_pass(&host, &desired()).unwrap(), PassSummary::default());
    }

    #[test]
    fn jump_goes_ahead_of_builtin_rules() {
        let host = host();
        host.drop_ebtables_rule(PREROUTING, "-j HITCHPREROUTING");
        host.inject_ebtables_rule(PREROUTING, "-p 802_1Q -j DROP");
        let mut reconciler = RuleReconciler::new(false);

        reconciler.run_pass(&host, &desired()).unwrap();
        reconciler.run_pass(&host, &desired()).unwrap();
        assert_eq!(
            host.ebtables_rules(PREROUTING),
            vec!["-j HITCHPREROUTING".to_string(), "-p 802_1Q -j DROP".to_string()]
        );
    }

    #[test]
    fn deleted_chain_is_recreated() {
        let host = host();
        Ebtables::new(&host).uninitialize().unwrap();
        assert!(!host.has_ebtables_chain(HITCH_PREROUTING));
        let mut reconciler = RuleReconciler::new(false);

        assert_eq!(reconciler.run_pass(&host, &desired()).unwrap().added, 0);
        assert!(host.has_ebtables_chain(HITCH_PREROUTING));
        assert!(host.has_ebtables_chain(HITCH_POSTROUTING));
        assert_eq!(host.ebtables_rules(PREROUTING), vec!["-j HITCHPREROUTING".to_string()]);

        assert_eq!(reconciler.run_pass(&host, &desired()).unwrap().added, 1);
        assert_eq!(host.ebtables_rules(HITCH_PREROUTING), vec![rule().spec]);
    }

    #[test]
    fn chain_deleted_under_its_jump_keeps_one_jump() {
        let host = host();
        host.run(
            EbtablesCommand::DeleteChain {
                chain: HITCH_PREROUTING.to_string(),
            }
            .into(),
        )
        .unwrap();
        let mut reconciler = RuleReconciler::new(false);

        reconciler.run_pass(&host, &desired()).unwrap();
        assert!(host.has_ebtables_chain(HITCH_PREROUTING));
        assert_eq!(host.ebtables_rules(PREROUTING), vec!["-j HITCHPREROUTING".to_string()]);
    }

    #[test]
    fn stale_rule_removed_on_second_pass() {
        let host = host();
        host.inject_ebtables_rule(HITCH_PREROUTING, &rule().spec);
        let mut reconciler = RuleReconciler::new(false);

        assert_eq!(reconciler.run_pass(&host, &RuleSet::new()).unwrap().deleted, 0);
        assert_eq!(reconciler.run_pass(&host, &RuleSet::new()).unwrap().deleted, 1);
        assert!(host.ebtables_rules(HITCH_PREROUTING).is_empty());
    }

    #[test]
    fn builtin_duplicates_removed_when_monitoring_all_chains() {
        let host = host();
        host.inject_ebtables_rule(HITCH_PREROUTING, &rule().spec);
        host.inject_ebtables_rule(PREROUTING, &rule().spec);

        let mut narrow = RuleReconciler::new(false);
        narrow.run_pass(&host, &desired()).unwrap();
        narrow.run_pass(&host, &desired()).unwrap();
        assert_eq!(host.ebtables_rules(PREROUTING).len(), 2);

        let mut wide = RuleReconciler::new(true);
        wide.run_pass(&host, &desired()).unwrap();
        let summary = wide.run_pass(&host, &desired()).unwrap();
        assert_eq!(summary.deleted, 1);
        assert_eq!(host.ebtables_rules(PREROUTING), vec!["-j HITCHPREROUTING".to_string()]);
        assert_eq!(host.ebtables_rules(HITCH_PREROUTING), vec![rule().spec]);
    }

    #[test]
    fn listing_failure_aborts_pass() {
        let host = host();
        let mut reconciler = RuleReconciler::new(false);
        reconciler.run_pass(&host, &desired()).unwrap();

        host.fail_when(|cmd| matches!(cmd, HostCommand::Ebtables(EbtablesCommand::List { .. })));
        assert!(reconciler.run_pass(&host, &desired()).is_err());
        assert_eq!(reconciler.pending_additions().get(&rule().to_string()), Some(&1));

        host.clear_failures();
        assert_eq!(reconciler.run_pass(&host, &desired()).unwrap().added, 1);
    }

    #[test]
    fn failed_repair_is_retried() {
        let host = host();
        let mut reconciler = RuleReconciler::new(false);
        host.fail_when(|cmd| matches!(cmd, HostCommand::Ebtables(EbtablesCommand::Rule { .. })));

        reconciler.run_pass(&host, &desired()).unwrap();
        assert_eq!(reconciler.run_pass(&host, &desired()).unwrap().added, 0);

        host.clear_failures();
        assert_eq!(reconciler.run_pass(&host, &desired()).unwrap().added, 1);
    }
}
