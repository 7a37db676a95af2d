use crate::lifecycle::upgrade::UpgradeArgs;
use crate::logs::Priority;
use crate::state::{replace_state, BillingFeeSplit, Config, VectorState};
use crate::CanisterRuntime;
use candid::{CandidType, Deserialize, Principal};
use canlog::log;
use icrc_ledger_types::icrc1::account::Account;
use serde::Serialize;

pub const DEFAULT_ICP_FEE_E8S: u64 = 10_000;
pub const DEFAULT_MINIMUM_STAKE_E8S: u64 = 500_000_000;
pub const DEFAULT_MINIMUM_SPAWN_E8S: u64 = 100_000_000;
pub const DEFAULT_PROCESS_INTERVAL_SECONDS: u64 = 60;
pub const DEFAULT_PERIODIC_REFRESH_SECONDS: u64 = 12 * 60 * 60;
pub const DEFAULT_VOTING_POWER_REFRESH_SECONDS: u64 = 90 * 24 * 60 * 60;
pub const DEFAULT_CALLING_EXPIRY_SECONDS: u64 = 60 * 60;
pub const DEFAULT_ACTIVITY_LOG_CAP: usize = 50;
pub const DEFAULT_REQUEST_DEDUP_WINDOW_SECONDS: u64 = 60 * 60;
pub const DEFAULT_REQUEST_MAX_EXPIRE_SECONDS: u64 = 60 * 60;
pub const DEFAULT_TEMPORARY_NODE_EXPIRE_SECONDS: u64 = 60 * 60;
pub const DEFAULT_OPERATION_COST: u64 = 10_000;
pub const DEFAULT_MIN_CREATE_BALANCE: u64 = 500_000;
pub const DEFAULT_FREEZING_THRESHOLD_DAYS: u64 = 30;

#[derive(CandidType, serde::Deserialize)]
pub enum VectorArg {
    Init(InitArgs),
    Upgrade(Option<UpgradeArgs>),
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub struct InitArgs {
    /// The NNS governance canister holding the neurons.
    pub governance_canister_id: Principal,

    /// The ICP ledger; stakes, maturity and payouts move on it.
    pub icp_ledger_canister_id: Principal,

    /// The ledger nodes pay their operating cost in. Defaults to the ICP
    /// ledger.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub billing_ledger_canister_id: Option<Principal>,

    /// The neuron every node follows unless it picks its own followee.
    pub default_followee: u64,

    pub platform_account: Account,
    pub author_account: Account,
    pub pylon_account: Account,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum_stake_e8s: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum_spawn_e8s: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_interval_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub periodic_refresh_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voting_power_refresh_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_cost: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_create_balance: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub freezing_threshold_days: Option<u64>,
}

impl From<InitArgs> for Config {
    fn from(args: InitArgs) -> Self {
        Config {
            governance_canister_id: args.governance_canister_id,
            icp_ledger_canister_id: args.icp_ledger_canister_id,
            billing_ledger_canister_id: args
                .billing_ledger_canister_id
                .unwrap_or(args.icp_ledger_canister_id),
            icp_ledger_fee_e8s: DEFAULT_ICP_FEE_E8S,
            billing_ledger_fee: DEFAULT_ICP_FEE_E8S,
            default_followee: args.default_followee,
            minimum_stake_e8s: args.minimum_stake_e8s.unwrap_or(DEFAULT_MINIMUM_STAKE_E8S),
            minimum_spawn_e8s: args.minimum_spawn_e8s.unwrap_or(DEFAULT_MINIMUM_SPAWN_E8S),
            process_interval_seconds: args
                .process_interval_seconds
                .unwrap_or(DEFAULT_PROCESS_INTERVAL_SECONDS),
            periodic_refresh_seconds: args
                .periodic_refresh_seconds
                .unwrap_or(DEFAULT_PERIODIC_REFRESH_SECONDS),
            voting_power_refresh_seconds: args
                .voting_power_refresh_seconds
                .unwrap_or(DEFAULT_VOTING_POWER_REFRESH_SECONDS),
            calling_expiry_seconds: DEFAULT_CALLING_EXPIRY_SECONDS,
            activity_log_cap: DEFAULT_ACTIVITY_LOG_CAP,
            request_dedup_window_seconds: DEFAULT_REQUEST_DEDUP_WINDOW_SECONDS,
            request_max_expire_seconds: DEFAULT_REQUEST_MAX_EXPIRE_SECONDS,
            temporary_node_expire_seconds: DEFAULT_TEMPORARY_NODE_EXPIRE_SECONDS,
            operation_cost: args.operation_cost.unwrap_or(DEFAULT_OPERATION_COST),
            min_create_balance: args
                .min_create_balance
                .unwrap_or(DEFAULT_MIN_CREATE_BALANCE),
            freezing_threshold_days: args
                .freezing_threshold_days
                .unwrap_or(DEFAULT_FREEZING_THRESHOLD_DAYS),
            split: BillingFeeSplit {
                platform: 200,
                author: 400,
                affiliate: 200,
                pylon: 200,
            },
            platform_account: args.platform_account,
            author_account: args.author_account,
            pylon_account: args.pylon_account,
        }
    }
}

pub fn init<R: CanisterRuntime>(args: InitArgs, runtime: &R) {
    log!(
        Priority::Info,
        "[init]: initializing canister with args {args:?}"
    );
    replace_state(VectorState::new(Config::from(args)));
    crate::tasks::setup_tasks(runtime);
}
