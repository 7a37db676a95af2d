//! Node billing.
//!
//! Every node pays its operating cost from the virtual balance of its
//! billing account. Collected fees are split between the platform, the
//! module author, the pylon and an optional affiliate; the split is in
//! permille and rounding remainders go to the platform so the amounts
//! always add up.

use crate::ledger::{self, NodeAccountSlot};
use crate::logs::Priority;
use crate::state::{
    mutate_state, read_state, VectorState, NANOS_PER_SECOND, SECONDS_PER_DAY,
};
use crate::CanisterRuntime;
use candid::Principal;
use canlog::log;
use icrc_ledger_types::icrc1::account::Account;

/// Charges every node the operating cost accrued since the previous run.
pub async fn charge_nodes<R: CanisterRuntime>(runtime: &R) {
    let now = runtime.time();
    let canister_id = runtime.id();
    let last_run = read_state(|s| s.last_billing_run);
    if last_run == 0 {
        // First run only anchors the clock.
        mutate_state(|s| s.last_billing_run = now);
        return;
    }
    let elapsed = now.saturating_sub(last_run);
    if elapsed == 0 {
        return;
    }

    mutate_state(|s| {
        s.last_billing_run = now;
        let ledger = s.config.billing_ledger_canister_id;
        let day_nanos = SECONDS_PER_DAY as u128 * NANOS_PER_SECOND as u128;
        let freeze_after =
            s.config.freezing_threshold_days * SECONDS_PER_DAY * NANOS_PER_SECOND;

        let node_ids: Vec<_> = s.nodes.keys().copied().collect();
        for node_id in node_ids {
            let (cost_per_day, affiliate) = {
                let node = &s.nodes[&node_id];
                (node.billing.cost_per_day, node.billing.affiliate)
            };
            let cost = (cost_per_day as u128 * elapsed as u128 / day_nanos) as u64;
            if cost == 0 {
                continue;
            }
            let billing_account =
                ledger::node_account(canister_id, node_id, NodeAccountSlot::Billing);
            if s.debit(ledger, &billing_account, cost) {
                distribute_fee(s, ledger, cost, affiliate);
                let node = s.nodes.get_mut(&node_id).expect("node disappeared");
                node.billing.expires = None;
                node.billing.frozen = false;
            } else {
                let node = s.nodes.get_mut(&node_id).expect("node disappeared");
                match node.billing.expires {
                    None => node.billing.expires = Some(now + freeze_after),
                    Some(expires) if now >= expires && !node.billing.frozen => {
                        node.billing.frozen = true;
                        log!(
                            Priority::Info,
                            "[charge_nodes]: node {node_id} ran out of billing funds, freezing"
                        );
                    }
                    Some(_) => {}
                }
            }
        }
    });
}

/// Splits a collected fee between the platform accounts according to the
/// configured permille shares. Without an affiliate its share stays with
/// the platform.
pub fn distribute_fee(
    s: &mut VectorState,
    ledger: Principal,
    amount: u64,
    affiliate: Option<Account>,
) {
    let split = s.config.split.clone();
    debug_assert_eq!(split.total(), 1000);
    let author = amount * split.author / 1000;
    let pylon = amount * split.pylon / 1000;
    let affiliate_share = match affiliate {
        Some(_) => amount * split.affiliate / 1000,
        None => 0,
    };
    let platform = amount - author - pylon - affiliate_share;

    let (platform_account, author_account, pylon_account) = (
        s.config.platform_account,
        s.config.author_account,
        s.config.pylon_account,
    );
    s.credit(ledger, author_account, author);
    s.credit(ledger, pylon_account, pylon);
    if let Some(affiliate) = affiliate {
        s.credit(ledger, affiliate, affiliate_share);
    }
    s.credit(ledger, platform_account, platform);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{replace_state, VectorState};
    use crate::test_fixtures::{
        mock::MockCanisterRuntime, test_account, test_config, test_node, CANISTER_ID,
    };

    const DAY: u64 = SECONDS_PER_DAY * NANOS_PER_SECOND;

    fn runtime_at(now: u64) -> MockCanisterRuntime {
        let mut runtime = MockCanisterRuntime::new();
        runtime.expect_time().return_const(now);
        runtime.expect_id().return_const(CANISTER_ID);
        runtime
    }

    fn init_with_billed_node(cost_per_day: u64, balance: u64) -> (u32, Account) {
        let mut state = VectorState::new(test_config());
        let mut node = test_node(1);
        node.billing.cost_per_day = cost_per_day;
        state.nodes.insert(1, node);
        state.last_billing_run = 1;
        let billing_account = ledger::node_account(CANISTER_ID, 1, NodeAccountSlot::Billing);
        let ledger_id = state.config.billing_ledger_canister_id;
        state.credit(ledger_id, billing_account, balance);
        replace_state(state);
        (1, billing_account)
    }

    #[tokio::test]
    async fn first_run_only_anchors_the_clock() {
        let mut state = VectorState::new(test_config());
        state.nodes.insert(1, test_node(1));
        replace_state(state);

        charge_nodes(&runtime_at(5 * DAY)).await;

        read_state(|s| assert_eq!(s.last_billing_run, 5 * DAY));
    }

    #[tokio::test]
    async fn one_day_costs_one_daily_rate() {
        let (_, billing_account) = init_with_billed_node(10_000, 100_000);
        charge_nodes(&runtime_at(1 + DAY)).await;

        read_state(|s| {
            let ledger = s.config.billing_ledger_canister_id;
            assert_eq!(s.virtual_balance(ledger, &billing_account), 90_000);
            let split = &s.config.split;
            assert_eq!(
                s.virtual_balance(ledger, &s.config.author_account),
                10_000 * split.author / 1000
            );
        });
    }

    #[tokio::test]
    async fn unfunded_node_freezes_after_threshold() {
        let (node_id, _) = init_with_billed_node(10_000, 0);

        charge_nodes(&runtime_at(1 + DAY)).await;
        read_state(|s| {
            let node = s.node(node_id).unwrap();
            assert!(!node.billing.frozen);
            assert!(node.billing.expires.is_some());
        });

        let threshold_days = read_state(|s| s.config.freezing_threshold_days);
        charge_nodes(&runtime_at(1 + DAY + (threshold_days + 1) * DAY)).await;
        read_state(|s| assert!(s.node(node_id).unwrap().billing.frozen));
    }

    #[tokio::test]
    async fn topped_up_node_unfreezes() {
        let (node_id, billing_account) = init_with_billed_node(10_000, 0);
        mutate_state(|s| {
            let node = s.nodes.get_mut(&node_id).unwrap();
            node.billing.frozen = true;
            node.billing.expires = Some(1);
            let ledger_id = s.config.billing_ledger_canister_id;
            s.credit(ledger_id, billing_account, 100_000);
        });

        charge_nodes(&runtime_at(1 + DAY)).await;

        read_state(|s| {
            let node = s.node(node_id).unwrap();
            assert!(!node.billing.frozen);
            assert_eq!(node.billing.expires, None);
        });
    }

    #[test]
    fn fee_split_conserves_the_amount() {
        let mut state = VectorState::new(test_config());
        let ledger = state.config.billing_ledger_canister_id;
        let affiliate = test_account(77, None);
        distribute_fee(&mut state, ledger, 1_003, Some(affiliate));

        let total = state.virtual_balance(ledger, &state.config.platform_account)
            + state.virtual_balance(ledger, &state.config.author_account)
            + state.virtual_balance(ledger, &state.config.pylon_account)
            + state.virtual_balance(ledger, &affiliate);
        assert_eq!(total, 1_003);
    }

    #[test]
    fn missing_affiliate_share_goes_to_platform() {
        let mut state = VectorState::new(test_config());
        let ledger = state.config.billing_ledger_canister_id;
        let split = state.config.split.clone();
        distribute_fee(&mut state, ledger, 1_000, None);

        assert_eq!(
            state.virtual_balance(ledger, &state.config.platform_account),
            1_000 * (split.platform + split.affiliate) / 1000
        );
    }
}
