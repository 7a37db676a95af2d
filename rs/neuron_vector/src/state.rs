//! State management module.
//!
//! The state is stored in the global thread-level variable `__STATE`.
//! This module provides utility functions to manage the state. Most
//! code should use those functions instead of touching `__STATE` directly.
use std::{
    cell::RefCell,
    collections::{BTreeMap, BTreeSet, VecDeque},
};

use crate::governance::Followees;
use candid::{CandidType, Principal};
use icrc_ledger_types::icrc1::account::Account;
use serde::{Deserialize, Serialize};

pub type NodeId = u32;

thread_local! {
    static __STATE: RefCell<Option<VectorState>> = RefCell::default();
}

pub const E8S_PER_ICP: u64 = 100_000_000;

/// 184 days, the smallest dissolve delay that still earns voting rewards.
pub const MIN_DISSOLVE_DELAY_SECONDS: u64 = 15_897_600;
pub const ONE_YEAR_SECONDS: u64 = (4 * 365 + 1) * 24 * 60 * 60 / 4;
pub const MAX_DISSOLVE_DELAY_SECONDS: u64 = 8 * ONE_YEAR_SECONDS;

pub const SECONDS_PER_DAY: u64 = 24 * 60 * 60;
pub const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// The user-requested neuron configuration. `Default` is distinct from an
/// explicit value so that a sparse patch can tell "no change" apart from
/// "reset to the default".
#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub enum DissolveDelay {
    Default,
    DelayDays(u64),
}

#[derive(Clone, Copy, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub enum DissolveStatus {
    Locked,
    Dissolving,
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub enum Followee {
    Default,
    FolloweeId(u64),
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub struct Variables {
    pub dissolve_delay: DissolveDelay,
    pub dissolve_status: DissolveStatus,
    pub followee: Followee,
}

impl Default for Variables {
    fn default() -> Self {
        Self {
            dissolve_delay: DissolveDelay::Default,
            dissolve_status: DissolveStatus::Locked,
            followee: Followee::Default,
        }
    }
}

/// Last-synchronized external truth about a neuron. Every field is only
/// written from a confirmed governance response.
#[derive(Clone, Eq, PartialEq, Debug, Default, CandidType, Deserialize, Serialize)]
pub struct NeuronCache {
    pub neuron_id: Option<u64>,
    pub nonce: Option<u64>,
    pub cached_neuron_stake_e8s: Option<u64>,
    pub dissolve_delay_seconds: Option<u64>,
    pub maturity_e8s_equivalent: Option<u64>,
    pub state: Option<i32>,
    pub followees: Vec<(i32, Followees)>,
    pub age_seconds: Option<u64>,
    pub created_timestamp_seconds: Option<u64>,
    pub deciding_voting_power: Option<u64>,
    pub potential_voting_power: Option<u64>,
    pub voting_power_refreshed_timestamp_seconds: Option<u64>,
}

/// The per-node synchronization state machine. `Calling` holds the cycle
/// token so that a completion racing a newer cycle can be detected and
/// discarded; a plain busy flag cannot express that.
#[derive(Clone, Copy, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub enum UpdatingStatus {
    Init,
    Calling(u64),
    Done(u64),
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub struct Internals {
    /// Completed spawn cycles, ever. Strictly increasing.
    pub local_idx: u32,
    /// Pending claim-or-refresh token: the stake-transfer nonce that still
    /// awaits a successful claim. Empty once settled.
    pub refresh_idx: Option<u64>,
    pub updating: UpdatingStatus,
    pub spawning_neurons: Vec<NeuronCache>,
}

impl Default for Internals {
    fn default() -> Self {
        Self {
            local_idx: 0,
            refresh_idx: None,
            updating: UpdatingStatus::Init,
            spawning_neurons: Vec::new(),
        }
    }
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub enum Activity {
    Ok {
        operation: String,
        timestamp: u64,
    },
    Err {
        operation: String,
        msg: String,
        timestamp: u64,
    },
}

#[derive(Clone, Eq, PartialEq, Debug, Default, CandidType, Deserialize, Serialize)]
pub struct NeuronVector {
    pub variables: Variables,
    pub cache: NeuronCache,
    pub internals: Internals,
    pub log: VecDeque<Activity>,
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub enum BillingTransactionFee {
    #[serde(rename = "none")]
    None,
    #[serde(rename = "transaction_percentage_fee_e8s")]
    TransactionPercentageFeeE8s(u64),
    #[serde(rename = "flat_fee_multiplier")]
    FlatFeeMultiplier(u64),
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub struct NodeBilling {
    pub transaction_fee: BillingTransactionFee,
    pub cost_per_day: u64,
    pub billing_option: u64,
    pub affiliate: Option<Account>,
    /// Created without the minimum billing balance; deleted at `expires`
    /// unless funded before then.
    pub temporary: bool,
    pub frozen: bool,
    pub expires: Option<u64>,
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub struct Node {
    pub id: NodeId,
    pub controllers: Vec<Account>,
    pub active: bool,
    pub created: u64,
    pub modified: u64,
    /// Destination slot 0 receives disbursals and claimed maturity.
    pub destinations: Vec<Option<Account>>,
    pub refund: Account,
    pub billing: NodeBilling,
    pub neuron: NeuronVector,
}

impl Node {
    pub fn is_controller(&self, account: &Account) -> bool {
        self.controllers.contains(account)
    }

    /// A node with no claimed neuron and nothing stakeable has nothing to
    /// synchronize and must not consume scheduler cycles.
    pub fn is_empty(&self) -> bool {
        self.neuron.cache.neuron_id.is_none()
    }

    pub fn log_ok(&mut self, operation: &str, timestamp: u64, cap: usize) {
        push_activity(
            &mut self.neuron.log,
            Activity::Ok {
                operation: operation.to_string(),
                timestamp,
            },
            cap,
        );
    }

    pub fn log_err(&mut self, operation: &str, msg: String, timestamp: u64, cap: usize) {
        push_activity(
            &mut self.neuron.log,
            Activity::Err {
                operation: operation.to_string(),
                msg,
                timestamp,
            },
            cap,
        );
    }
}

fn push_activity(log: &mut VecDeque<Activity>, activity: Activity, cap: usize) {
    if log.len() >= cap {
        log.pop_front();
    }
    log.push_back(activity);
}

/// Desired dissolve delay in seconds, clamped to the allowed range.
/// Out-of-range requests saturate, they are never rejected.
pub fn clamp_dissolve_delay(requested_seconds: u64) -> u64 {
    requested_seconds.clamp(MIN_DISSOLVE_DELAY_SECONDS, MAX_DISSOLVE_DELAY_SECONDS)
}

impl Variables {
    pub fn desired_dissolve_delay_seconds(&self) -> u64 {
        match self.dissolve_delay {
            DissolveDelay::Default => MIN_DISSOLVE_DELAY_SECONDS,
            DissolveDelay::DelayDays(days) => {
                clamp_dissolve_delay(days.saturating_mul(SECONDS_PER_DAY))
            }
        }
    }

    pub fn desired_followee(&self, default_followee: u64) -> u64 {
        match self.followee {
            Followee::Default => default_followee,
            Followee::FolloweeId(id) => id,
        }
    }
}

/// Platform fee split, in permille. The shares must sum to 1000; rounding
/// remainders go to the platform share so no value is created or destroyed.
#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub struct BillingFeeSplit {
    pub platform: u64,
    pub author: u64,
    pub affiliate: u64,
    pub pylon: u64,
}

impl BillingFeeSplit {
    pub fn total(&self) -> u64 {
        self.platform + self.author + self.affiliate + self.pylon
    }
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub struct Config {
    pub governance_canister_id: Principal,
    pub icp_ledger_canister_id: Principal,
    /// The ledger nodes pay their daily operating cost in.
    pub billing_ledger_canister_id: Principal,
    pub icp_ledger_fee_e8s: u64,
    pub billing_ledger_fee: u64,
    pub default_followee: u64,
    pub minimum_stake_e8s: u64,
    pub minimum_spawn_e8s: u64,
    /// Cadence policy, overridable at install and on upgrade.
    pub process_interval_seconds: u64,
    pub periodic_refresh_seconds: u64,
    pub voting_power_refresh_seconds: u64,
    pub calling_expiry_seconds: u64,
    pub activity_log_cap: usize,
    pub request_dedup_window_seconds: u64,
    pub request_max_expire_seconds: u64,
    pub temporary_node_expire_seconds: u64,
    pub operation_cost: u64,
    pub min_create_balance: u64,
    pub freezing_threshold_days: u64,
    pub split: BillingFeeSplit,
    pub platform_account: Account,
    pub author_account: Account,
    pub pylon_account: Account,
}

impl Config {
    pub fn billing_options(&self) -> Vec<(u64, BillingTransactionFee)> {
        vec![
            // Option 0: flat daily cost, no cut of the amounts moved.
            (self.operation_cost, BillingTransactionFee::None),
            // Option 1: free to run, 5% of every disbursal.
            (
                0,
                BillingTransactionFee::TransactionPercentageFeeE8s(5_000_000),
            ),
        ]
    }
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct VectorState {
    pub config: Config,
    pub nodes: BTreeMap<NodeId, Node>,
    pub next_node_id: NodeId,
    /// Virtual balances per (ledger, account), backed by the pooled main
    /// account on each ledger.
    pub balances: BTreeMap<(Principal, Account), u64>,
    /// Accounts whose deposit subaccounts the gateway sweeps.
    pub registered_accounts: BTreeSet<Account>,
    /// Recently seen batch request ids, for replay rejection.
    pub processed_requests: BTreeMap<u32, u64>,
    pub last_billing_run: u64,

    /// Nodes with a synchronization cycle in flight. Not persisted: an
    /// upgrade drops in-flight cycles and the `Calling` expiry recovers them.
    #[serde(skip)]
    pub pending_sync_nodes: BTreeSet<NodeId>,
    #[serde(skip)]
    pub is_timer_running: bool,
    #[serde(skip)]
    pub is_billing_running: bool,
}

impl VectorState {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            nodes: BTreeMap::new(),
            next_node_id: 0,
            balances: BTreeMap::new(),
            registered_accounts: BTreeSet::new(),
            processed_requests: BTreeMap::new(),
            last_billing_run: 0,
            pending_sync_nodes: BTreeSet::new(),
            is_timer_running: false,
            is_billing_running: false,
        }
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    pub fn virtual_balance(&self, ledger: Principal, account: &Account) -> u64 {
        self.balances
            .get(&(ledger, *account))
            .copied()
            .unwrap_or(0)
    }

    pub fn credit(&mut self, ledger: Principal, account: Account, amount: u64) {
        if amount == 0 {
            return;
        }
        *self.balances.entry((ledger, account)).or_insert(0) += amount;
    }

    /// Removes `amount` from the virtual balance. Returns false (and leaves
    /// the balance untouched) when the funds are not there.
    pub fn debit(&mut self, ledger: Principal, account: &Account, amount: u64) -> bool {
        match self.balances.get_mut(&(ledger, *account)) {
            Some(balance) if *balance >= amount => {
                *balance -= amount;
                if *balance == 0 {
                    self.balances.remove(&(ledger, *account));
                }
                true
            }
            _ => false,
        }
    }

    pub fn purge_expired_request_ids(&mut self, now: u64) {
        let window = self
            .config
            .request_dedup_window_seconds
            .saturating_mul(NANOS_PER_SECOND);
        self.processed_requests
            .retain(|_, seen_at| now.saturating_sub(*seen_at) < window);
    }
}

pub fn read_state<F, R>(f: F) -> R
where
    F: FnOnce(&VectorState) -> R,
{
    __STATE.with(|s| f(s.borrow().as_ref().expect("state not initialized")))
}

pub fn mutate_state<F, R>(f: F) -> R
where
    F: FnOnce(&mut VectorState) -> R,
{
    __STATE.with(|s| f(s.borrow_mut().as_mut().expect("state not initialized")))
}

pub fn replace_state(state: VectorState) {
    __STATE.with(|s| {
        *s.borrow_mut() = Some(state);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::{test_account, test_config};
    use proptest::prelude::*;

    #[test]
    fn default_variables_map_to_minimum_delay() {
        let variables = Variables::default();
        assert_eq!(
            variables.desired_dissolve_delay_seconds(),
            MIN_DISSOLVE_DELAY_SECONDS
        );
        assert_eq!(variables.desired_followee(42), 42);
    }

    #[test]
    fn explicit_followee_overrides_default() {
        let variables = Variables {
            followee: Followee::FolloweeId(7),
            ..Variables::default()
        };
        assert_eq!(variables.desired_followee(42), 7);
    }

    #[test]
    fn delay_of_184_days_is_unchanged() {
        let variables = Variables {
            dissolve_delay: DissolveDelay::DelayDays(184),
            ..Variables::default()
        };
        assert_eq!(
            variables.desired_dissolve_delay_seconds(),
            184 * SECONDS_PER_DAY
        );
    }

    #[test]
    fn max_plus_min_saturates_at_max() {
        let requested = MAX_DISSOLVE_DELAY_SECONDS + MIN_DISSOLVE_DELAY_SECONDS;
        assert_eq!(clamp_dissolve_delay(requested), MAX_DISSOLVE_DELAY_SECONDS);
    }

    #[test]
    fn absurd_day_count_saturates_at_max() {
        let variables = Variables {
            dissolve_delay: DissolveDelay::DelayDays(u64::MAX),
            ..Variables::default()
        };
        assert_eq!(
            variables.desired_dissolve_delay_seconds(),
            MAX_DISSOLVE_DELAY_SECONDS
        );
    }

    proptest! {
        #[test]
        fn clamped_delay_is_always_in_range(requested in any::<u64>()) {
            let clamped = clamp_dissolve_delay(requested);
            prop_assert!(clamped >= MIN_DISSOLVE_DELAY_SECONDS);
            prop_assert!(clamped <= MAX_DISSOLVE_DELAY_SECONDS);
        }

        #[test]
        fn delay_from_days_is_always_in_range(days in any::<u64>()) {
            let variables = Variables {
                dissolve_delay: DissolveDelay::DelayDays(days),
                ..Variables::default()
            };
            let delay = variables.desired_dissolve_delay_seconds();
            prop_assert!(delay >= MIN_DISSOLVE_DELAY_SECONDS);
            prop_assert!(delay <= MAX_DISSOLVE_DELAY_SECONDS);
        }
    }

    #[test]
    fn activity_log_is_capped_and_ordered() {
        let mut log = VecDeque::new();
        for i in 0..10u64 {
            push_activity(
                &mut log,
                Activity::Ok {
                    operation: "refresh".to_string(),
                    timestamp: i,
                },
                4,
            );
        }
        assert_eq!(log.len(), 4);
        let timestamps: Vec<u64> = log
            .iter()
            .map(|a| match a {
                Activity::Ok { timestamp, .. } => *timestamp,
                Activity::Err { timestamp, .. } => *timestamp,
            })
            .collect();
        assert_eq!(timestamps, vec![6, 7, 8, 9]);
    }

    #[test]
    fn debit_fails_without_funds() {
        let mut state = VectorState::new(test_config());
        let ledger = state.config.icp_ledger_canister_id;
        let account = test_account(1, None);
        state.credit(ledger, account, 100);
        assert!(!state.debit(ledger, &account, 101));
        assert_eq!(state.virtual_balance(ledger, &account), 100);
        assert!(state.debit(ledger, &account, 100));
        assert_eq!(state.virtual_balance(ledger, &account), 0);
    }

    #[test]
    fn request_ids_expire_after_the_window() {
        let mut state = VectorState::new(test_config());
        let window = state.config.request_dedup_window_seconds * NANOS_PER_SECOND;
        state.processed_requests.insert(1, 0);
        state.processed_requests.insert(2, window / 2);
        state.purge_expired_request_ids(window);
        assert!(!state.processed_requests.contains_key(&1));
        assert!(state.processed_requests.contains_key(&2));
    }
}
