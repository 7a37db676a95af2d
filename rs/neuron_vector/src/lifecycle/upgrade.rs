use crate::logs::Priority;
use crate::state::{read_state, replace_state};
use crate::storage;
use crate::CanisterRuntime;
use candid::{CandidType, Deserialize};
use canlog::log;
use serde::Serialize;

/// Config values that can be changed on upgrade. Absent fields keep their
/// current value.
#[derive(Clone, Eq, PartialEq, Debug, Default, CandidType, Deserialize, Serialize)]
pub struct UpgradeArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_followee: Option<u64>,
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

pub fn pre_upgrade() {
    log!(Priority::Info, "[pre_upgrade]: saving the canister state");
    read_state(storage::save_state);
}

pub fn post_upgrade<R: CanisterRuntime>(args: Option<UpgradeArgs>, runtime: &R) {
    let mut state = storage::load_state();
    if let Some(args) = args {
        log!(
            Priority::Info,
            "[post_upgrade]: applying upgrade args {args:?}"
        );
        let config = &mut state.config;
        if let Some(default_followee) = args.default_followee {
            config.default_followee = default_followee;
        }
        if let Some(process_interval_seconds) = args.process_interval_seconds {
            config.process_interval_seconds = process_interval_seconds;
        }
        if let Some(periodic_refresh_seconds) = args.periodic_refresh_seconds {
            config.periodic_refresh_seconds = periodic_refresh_seconds;
        }
        if let Some(voting_power_refresh_seconds) = args.voting_power_refresh_seconds {
            config.voting_power_refresh_seconds = voting_power_refresh_seconds;
        }
        if let Some(operation_cost) = args.operation_cost {
            config.operation_cost = operation_cost;
        }
        if let Some(min_create_balance) = args.min_create_balance {
            config.min_create_balance = min_create_balance;
        }
        if let Some(freezing_threshold_days) = args.freezing_threshold_days {
            config.freezing_threshold_days = freezing_threshold_days;
        }
    }
    replace_state(state);
    crate::tasks::setup_tasks(runtime);
}
