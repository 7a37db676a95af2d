//! Synchronization of nodes with NNS governance.
//!
//! Each cycle pushes the node's desired configuration to governance and
//! pulls the confirmed neuron back into the cache. The cache and the
//! node variables are only written from confirmed responses; a failed
//! call leaves them exactly as they were.

use crate::governance::{
    By, ClaimOrRefresh, Command, CommandResponse, Configure, Follow, IncreaseDissolveDelay,
    ListNeurons, ManageNeuron, MemoAndController, NeuronId, Operation, RefreshVotingPower,
    StartDissolving, StopDissolving, neuron_staking_subaccount, NEURON_STATE_DISSOLVING,
    NEURON_STATE_LOCKED, NEURON_STATE_UNLOCKED, TRACKED_TOPICS,
};
use crate::guard::SyncGuard;
use crate::ledger::{self, NodeAccountSlot};
use crate::logs::Priority;
use crate::state::{
    mutate_state, read_state, DissolveStatus, Node, NodeId, UpdatingStatus, VectorState,
    NANOS_PER_SECOND,
};
use crate::CanisterRuntime;
use candid::Principal;
use canlog::log;
use icrc_ledger_types::icrc1::account::Account;

/// An error inside a cycle: the operation that failed and the reason,
/// exactly as it lands in the node's activity log.
pub type CycleError = (String, String);

fn cycle_err(operation: &str, msg: impl ToString) -> CycleError {
    (operation.to_string(), msg.to_string())
}

/// Sweeps client deposits and runs a synchronization cycle for every node
/// that has work to do.
pub async fn process_due_nodes<R: CanisterRuntime>(runtime: &R) {
    ledger::sweep_deposits(runtime).await;

    let now = runtime.time();
    let canister_id = runtime.id();
    let due: Vec<NodeId> = read_state(|s| {
        s.nodes
            .values()
            .filter(|node| is_due(s, node, now, canister_id))
            .map(|node| node.id)
            .collect()
    });
    for node_id in due {
        let _guard = match SyncGuard::new(node_id) {
            Ok(guard) => guard,
            Err(_) => continue,
        };
        sync_node(node_id, runtime).await;
    }
}

/// Decides whether a node needs a synchronization cycle right now.
pub fn is_due(s: &VectorState, node: &Node, now: u64, canister_id: Principal) -> bool {
    if !node.active || node.billing.frozen {
        return false;
    }
    let cfg = &s.config;

    // A cycle is already in flight. Only start over once it is considered
    // lost, a completion arriving later is detected by its stale token.
    if let UpdatingStatus::Calling(started_at) = node.neuron.internals.updating {
        return now.saturating_sub(started_at) > cfg.calling_expiry_seconds * NANOS_PER_SECOND;
    }

    let stake_balance = s.virtual_balance(
        cfg.icp_ledger_canister_id,
        &ledger::node_account(canister_id, node.id, NodeAccountSlot::Stake),
    );
    if node.is_empty() && node.neuron.internals.refresh_idx.is_none() {
        return stake_balance >= cfg.minimum_stake_e8s;
    }
    if node.neuron.internals.refresh_idx.is_some() || stake_balance >= cfg.minimum_stake_e8s {
        return true;
    }

    match node.neuron.internals.updating {
        UpdatingStatus::Init => true,
        UpdatingStatus::Done(completed_at) => {
            if now.saturating_sub(completed_at)
                >= cfg.periodic_refresh_seconds * NANOS_PER_SECOND
            {
                return true;
            }
            has_pending_delta(node, now, cfg) || !node.neuron.internals.spawning_neurons.is_empty()
        }
        UpdatingStatus::Calling(_) => unreachable!("handled above"),
    }
}

/// True when the cached neuron does not match what the node variables ask
/// for, so the next cycle has commands to push.
fn has_pending_delta(node: &Node, now: u64, cfg: &crate::state::Config) -> bool {
    let cache = &node.neuron.cache;
    let variables = &node.neuron.variables;
    let now_seconds = now / NANOS_PER_SECOND;

    let state = match cache.state {
        Some(state) => state,
        None => return false,
    };

    if state == NEURON_STATE_LOCKED
        && variables.desired_dissolve_delay_seconds()
            > cache.dissolve_delay_seconds.unwrap_or(0)
    {
        return true;
    }
    match variables.dissolve_status {
        DissolveStatus::Dissolving if state == NEURON_STATE_LOCKED => return true,
        DissolveStatus::Locked if state == NEURON_STATE_DISSOLVING => return true,
        _ => {}
    }
    let followee = NeuronId {
        id: variables.desired_followee(cfg.default_followee),
    };
    for topic in TRACKED_TOPICS {
        let current = cache
            .followees
            .iter()
            .find(|(t, _)| *t == topic)
            .map(|(_, f)| f.followees.as_slice())
            .unwrap_or(&[]);
        if current.len() != 1 || current[0] != followee {
            return true;
        }
    }
    if variables.dissolve_status == DissolveStatus::Dissolving
        && state == NEURON_STATE_UNLOCKED
        && cache.cached_neuron_stake_e8s.unwrap_or(0) > 0
    {
        return true;
    }
    if cache.maturity_e8s_equivalent.unwrap_or(0) >= cfg.minimum_spawn_e8s {
        return true;
    }
    if let Some(refreshed) = cache.voting_power_refreshed_timestamp_seconds {
        if now_seconds.saturating_sub(refreshed) >= cfg.voting_power_refresh_seconds {
            return true;
        }
    }
    false
}

/// Runs one synchronization cycle for the node. On failure the previous
/// `updating` status is restored and exactly one error entry is appended to
/// the node's activity log.
pub async fn sync_node<R: CanisterRuntime>(node_id: NodeId, runtime: &R) {
    let token = runtime.time();
    let previous = match mutate_state(|s| {
        s.node_mut(node_id).map(|node| {
            let previous = node.neuron.internals.updating;
            node.neuron.internals.updating = UpdatingStatus::Calling(token);
            previous
        })
    }) {
        Some(previous) => previous,
        None => return,
    };

    match run_cycle(node_id, runtime).await {
        Ok(()) => {
            let completed_at = runtime.time();
            mutate_state(|s| {
                if let Some(node) = s.node_mut(node_id) {
                    if node.neuron.internals.updating == UpdatingStatus::Calling(token) {
                        node.neuron.internals.updating = UpdatingStatus::Done(completed_at);
                    } else {
                        log!(
                            Priority::Debug,
                            "[sync_node]: discarding stale completion for node {node_id}"
                        );
                    }
                }
            });
        }
        Err((operation, msg)) => {
            let failed_at = runtime.time();
            log!(
                Priority::Info,
                "[sync_node]: node {node_id} operation {operation} failed: {msg}"
            );
            mutate_state(|s| {
                let cap = s.config.activity_log_cap;
                if let Some(node) = s.node_mut(node_id) {
                    if node.neuron.internals.updating == UpdatingStatus::Calling(token) {
                        node.neuron.internals.updating = previous;
                    }
                    node.log_err(&operation, msg, failed_at, cap);
                }
            });
        }
    }
}

async fn run_cycle<R: CanisterRuntime>(node_id: NodeId, runtime: &R) -> Result<(), CycleError> {
    let canister_id = runtime.id();
    let (governance, icp_ledger, minimum_stake) = read_state(|s| {
        (
            s.config.governance_canister_id,
            s.config.icp_ledger_canister_id,
            s.config.minimum_stake_e8s,
        )
    });

    let stake_account = ledger::node_account(canister_id, node_id, NodeAccountSlot::Stake);
    let stake_balance = read_state(|s| s.virtual_balance(icp_ledger, &stake_account));
    if stake_balance >= minimum_stake {
        transfer_stake(node_id, stake_balance, runtime).await?;
    }

    if let Some(nonce) = read_state(|s| {
        s.node(node_id)
            .and_then(|node| node.neuron.internals.refresh_idx)
    }) {
        claim_or_refresh(node_id, nonce, runtime).await?;
    }

    let neuron_id = match read_state(|s| s.node(node_id).and_then(|n| n.neuron.cache.neuron_id)) {
        Some(neuron_id) => neuron_id,
        // Nothing staked yet, the cycle is a no-op.
        None => return Ok(()),
    };

    refresh_cache(node_id, neuron_id, runtime)
        .await
        .map_err(|msg| cycle_err("refresh_neuron", msg))?;

    let operations = pending_operations(node_id);
    let pushed = !operations.is_empty();
    for (operation, command) in operations {
        send_command(runtime, governance, neuron_id, command)
            .await
            .map_err(|msg| cycle_err(operation, msg))?;
        log_ok(node_id, operation, runtime.time());
    }
    if pushed {
        refresh_cache(node_id, neuron_id, runtime)
            .await
            .map_err(|msg| cycle_err("refresh_neuron", msg))?;
    }

    if voting_power_refresh_due(node_id, runtime.time()) {
        send_command(
            runtime,
            governance,
            neuron_id,
            Command::RefreshVotingPower(RefreshVotingPower {}),
        )
        .await
        .map_err(|msg| cycle_err("refresh_voting_power", msg))?;
        log_ok(node_id, "refresh_voting_power", runtime.time());
    }

    crate::maturity::process(node_id, neuron_id, runtime).await?;

    Ok(())
}

/// Moves the stakeable balance of source 0 onto the neuron's staking
/// subaccount of the governance canister. The claim happens in a separate
/// step keyed by `refresh_idx` so an interrupted cycle can retry it.
async fn transfer_stake<R: CanisterRuntime>(
    node_id: NodeId,
    amount: u64,
    runtime: &R,
) -> Result<(), CycleError> {
    let canister_id = runtime.id();
    let (governance, icp_ledger, existing_nonce) = read_state(|s| {
        (
            s.config.governance_canister_id,
            s.config.icp_ledger_canister_id,
            s.node(node_id).and_then(|node| node.neuron.cache.nonce),
        )
    });
    let nonce = existing_nonce.unwrap_or(stake_nonce(node_id));
    let stake_account = ledger::node_account(canister_id, node_id, NodeAccountSlot::Stake);
    let staking_account = Account {
        owner: governance,
        subaccount: Some(neuron_staking_subaccount(canister_id, nonce)),
    };
    ledger::withdraw(runtime, icp_ledger, &stake_account, staking_account, amount)
        .await
        .map_err(|err| cycle_err("stake_neuron", err))?;
    let now = runtime.time();
    mutate_state(|s| {
        let cap = s.config.activity_log_cap;
        if let Some(node) = s.node_mut(node_id) {
            node.neuron.internals.refresh_idx = Some(nonce);
            node.log_ok("stake_neuron", now, cap);
        }
    });
    Ok(())
}

/// The base staking nonce of a node. Spawn nonces take the low 16 bits, so
/// they never collide with another node's stake.
pub fn stake_nonce(node_id: NodeId) -> u64 {
    (node_id as u64) << 16
}

async fn claim_or_refresh<R: CanisterRuntime>(
    node_id: NodeId,
    nonce: u64,
    runtime: &R,
) -> Result<(), CycleError> {
    let canister_id = runtime.id();
    let governance = read_state(|s| s.config.governance_canister_id);
    let was_empty = read_state(|s| s.node(node_id).map_or(true, |n| n.is_empty()));
    let operation = if was_empty {
        "stake_neuron"
    } else {
        "refresh_neuron"
    };

    let arg = ManageNeuron {
        id: None,
        neuron_id_or_subaccount: None,
        command: Some(Command::ClaimOrRefresh(ClaimOrRefresh {
            by: Some(By::MemoAndController(MemoAndController {
                memo: nonce,
                controller: Some(canister_id),
            })),
        })),
    };
    let response = runtime
        .manage_neuron(governance, arg)
        .await
        .map_err(|err| cycle_err(operation, err))?;
    let neuron_id = match response.command {
        Some(CommandResponse::ClaimOrRefresh(response)) => response
            .refreshed_neuron_id
            .ok_or_else(|| cycle_err(operation, "governance returned no neuron id"))?,
        Some(CommandResponse::Error(err)) => {
            return Err(cycle_err(
                operation,
                format!("governance error {}: {}", err.error_type, err.error_message),
            ));
        }
        _ => return Err(cycle_err(operation, "unexpected response from governance")),
    };

    let now = runtime.time();
    mutate_state(|s| {
        let cap = s.config.activity_log_cap;
        if let Some(node) = s.node_mut(node_id) {
            node.neuron.cache.neuron_id = Some(neuron_id.id);
            node.neuron.cache.nonce = Some(nonce);
            node.neuron.internals.refresh_idx = None;
            node.log_ok(operation, now, cap);
        }
    });
    Ok(())
}

/// Reads the neuron from governance and replaces the cache with the
/// confirmed view.
pub async fn refresh_cache<R: CanisterRuntime>(
    node_id: NodeId,
    neuron_id: u64,
    runtime: &R,
) -> Result<(), String> {
    let governance = read_state(|s| s.config.governance_canister_id);
    let response = runtime
        .list_neurons(governance, ListNeurons::by_ids(vec![neuron_id]))
        .await
        .map_err(|err| err.to_string())?;
    let neuron = response
        .full_neurons
        .iter()
        .find(|n| n.id == Some(NeuronId { id: neuron_id }))
        .ok_or_else(|| format!("neuron {neuron_id} missing from governance response"))?;

    let now_seconds = runtime.time() / NANOS_PER_SECOND;
    mutate_state(|s| {
        if let Some(node) = s.node_mut(node_id) {
            let cache = &mut node.neuron.cache;
            cache.neuron_id = Some(neuron_id);
            cache.cached_neuron_stake_e8s = Some(neuron.cached_neuron_stake_e8s);
            cache.dissolve_delay_seconds = Some(neuron.dissolve_delay_seconds(now_seconds));
            cache.maturity_e8s_equivalent = Some(neuron.maturity_e8s_equivalent);
            cache.state = Some(neuron.state(now_seconds));
            cache.followees = neuron.followees.clone();
            cache.age_seconds = Some(neuron.age_seconds(now_seconds));
            cache.created_timestamp_seconds = Some(neuron.created_timestamp_seconds);
            cache.deciding_voting_power = neuron.deciding_voting_power;
            cache.potential_voting_power = neuron.potential_voting_power;
            cache.voting_power_refreshed_timestamp_seconds =
                neuron.voting_power_refreshed_timestamp_seconds;
        }
    });
    Ok(())
}

/// The governance commands needed to reconcile the cached neuron with the
/// node variables, paired with their activity log names.
fn pending_operations(node_id: NodeId) -> Vec<(&'static str, Command)> {
    read_state(|s| {
        let node = match s.node(node_id) {
            Some(node) => node,
            None => return Vec::new(),
        };
        let cache = &node.neuron.cache;
        let variables = &node.neuron.variables;
        let state = match cache.state {
            Some(state) => state,
            None => return Vec::new(),
        };
        let mut operations = Vec::new();

        // Only a locked neuron accepts a delay increase; the delay of a
        // dissolving neuron is a countdown.
        let desired_delay = variables.desired_dissolve_delay_seconds();
        let cached_delay = cache.dissolve_delay_seconds.unwrap_or(0);
        if state == NEURON_STATE_LOCKED && desired_delay > cached_delay {
            operations.push((
                "increase_dissolve_delay",
                Command::Configure(Configure {
                    operation: Some(Operation::IncreaseDissolveDelay(IncreaseDissolveDelay {
                        additional_dissolve_delay_seconds: (desired_delay - cached_delay) as u32,
                    })),
                }),
            ));
        }

        match variables.dissolve_status {
            DissolveStatus::Dissolving if state == NEURON_STATE_LOCKED => {
                operations.push((
                    "start_dissolving",
                    Command::Configure(Configure {
                        operation: Some(Operation::StartDissolving(StartDissolving {})),
                    }),
                ));
            }
            DissolveStatus::Locked if state == NEURON_STATE_DISSOLVING => {
                operations.push((
                    "stop_dissolving",
                    Command::Configure(Configure {
                        operation: Some(Operation::StopDissolving(StopDissolving {})),
                    }),
                ));
            }
            _ => {}
        }

        let followee = NeuronId {
            id: variables.desired_followee(s.config.default_followee),
        };
        for topic in TRACKED_TOPICS {
            let current = cache
                .followees
                .iter()
                .find(|(t, _)| *t == topic)
                .map(|(_, f)| f.followees.as_slice())
                .unwrap_or(&[]);
            if current.len() != 1 || current[0] != followee {
                operations.push((
                    "update_followees",
                    Command::Follow(Follow {
                        topic,
                        followees: vec![followee],
                    }),
                ));
            }
        }

        operations
    })
}

fn voting_power_refresh_due(node_id: NodeId, now: u64) -> bool {
    read_state(|s| {
        let node = match s.node(node_id) {
            Some(node) => node,
            None => return false,
        };
        match node.neuron.cache.voting_power_refreshed_timestamp_seconds {
            Some(refreshed) => {
                (now / NANOS_PER_SECOND).saturating_sub(refreshed)
                    >= s.config.voting_power_refresh_seconds
            }
            None => false,
        }
    })
}

fn log_ok(node_id: NodeId, operation: &str, now: u64) {
    mutate_state(|s| {
        let cap = s.config.activity_log_cap;
        if let Some(node) = s.node_mut(node_id) {
            node.log_ok(operation, now, cap);
        }
    });
}

/// Sends a `manage_neuron` command and unwraps the response, mapping a
/// governance-level error into a loggable message.
pub(crate) async fn send_command<R: CanisterRuntime>(
    runtime: &R,
    governance: Principal,
    neuron_id: u64,
    command: Command,
) -> Result<CommandResponse, String> {
    let response = runtime
        .manage_neuron(governance, ManageNeuron::for_neuron(neuron_id, command))
        .await
        .map_err(|err| err.to_string())?;
    match response.command {
        Some(CommandResponse::Error(err)) => Err(format!(
            "governance error {}: {}",
            err.error_type, err.error_message
        )),
        Some(other) => Ok(other),
        None => Err("empty response from governance".to_string()),
    }
}
