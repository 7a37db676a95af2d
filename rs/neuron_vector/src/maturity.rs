//! Maturity handling: spawning neurons from accumulated maturity, claiming
//! them once they finish the spawn period, and routing every payout through
//! the node's maturity account to destination 0.

use crate::governance::{
    account_identifier, Command, CommandResponse, Disburse, ListNeurons, Spawn,
    NEURON_STATE_SPAWNING, NEURON_STATE_UNLOCKED,
};
use crate::ledger::{self, NodeAccountSlot};
use crate::logs::Priority;
use crate::state::{
    mutate_state, read_state, BillingTransactionFee, DissolveStatus, NeuronCache, NodeId,
    E8S_PER_ICP, NANOS_PER_SECOND,
};
use crate::sync::{send_command, stake_nonce, CycleError};
use crate::CanisterRuntime;
use candid::Nat;
use canlog::log;
use icrc_ledger_types::icrc1::transfer::TransferArg;

fn cycle_err(operation: &str, msg: impl ToString) -> CycleError {
    (operation.to_string(), msg.to_string())
}

pub async fn process<R: CanisterRuntime>(
    node_id: NodeId,
    neuron_id: u64,
    runtime: &R,
) -> Result<(), CycleError> {
    disburse_unlocked(node_id, neuron_id, runtime).await?;
    spawn_maturity(node_id, neuron_id, runtime).await?;
    claim_spawned(node_id, runtime).await?;
    forward_payouts(node_id, runtime).await?;
    Ok(())
}

/// An unlocked neuron holds plain ICP; disburse it to the node's maturity
/// account so the payout path below picks it up.
async fn disburse_unlocked<R: CanisterRuntime>(
    node_id: NodeId,
    neuron_id: u64,
    runtime: &R,
) -> Result<(), CycleError> {
    let stake = read_state(|s| {
        s.node(node_id).and_then(|node| {
            // Only disburse what the owner dissolved on purpose; an unlocked
            // neuron the owner wants locked is re-locked by the config push.
            let wanted = node.neuron.variables.dissolve_status == DissolveStatus::Dissolving
                && node.neuron.cache.state == Some(NEURON_STATE_UNLOCKED);
            match node.neuron.cache.cached_neuron_stake_e8s.unwrap_or(0) {
                0 => None,
                stake if wanted => Some(stake),
                _ => None,
            }
        })
    });
    let stake = match stake {
        Some(stake) => stake,
        None => return Ok(()),
    };
    let (governance, icp_ledger, icp_fee) = read_state(|s| {
        (
            s.config.governance_canister_id,
            s.config.icp_ledger_canister_id,
            s.config.icp_ledger_fee_e8s,
        )
    });
    let canister_id = runtime.id();
    let to_account = account_identifier(
        canister_id,
        Some(ledger::node_subaccount(node_id, NodeAccountSlot::Maturity)),
    );
    send_command(
        runtime,
        governance,
        neuron_id,
        Command::Disburse(Disburse {
            to_account: Some(to_account),
            amount: None,
        }),
    )
    .await
    .map_err(|msg| cycle_err("disburse", msg))?;
    let now = runtime.time();
    mutate_state(|s| {
        let cap = s.config.activity_log_cap;
        // The governance transfer is confirmed; the proceeds (net of one
        // ledger fee) now sit on the node's maturity account.
        s.credit(
            icp_ledger,
            ledger::node_account(canister_id, node_id, NodeAccountSlot::Maturity),
            stake.saturating_sub(icp_fee),
        );
        if let Some(node) = s.node_mut(node_id) {
            node.neuron.cache.cached_neuron_stake_e8s = Some(0);
            node.log_ok("disburse", now, cap);
        }
    });
    Ok(())
}

async fn spawn_maturity<R: CanisterRuntime>(
    node_id: NodeId,
    neuron_id: u64,
    runtime: &R,
) -> Result<(), CycleError> {
    let spawn_nonce = read_state(|s| {
        let node = s.node(node_id)?;
        if node.neuron.cache.maturity_e8s_equivalent.unwrap_or(0) < s.config.minimum_spawn_e8s {
            return None;
        }
        Some(stake_nonce(node_id) | (node.neuron.internals.local_idx as u64 + 1))
    });
    let spawn_nonce = match spawn_nonce {
        Some(nonce) => nonce,
        None => return Ok(()),
    };

    let governance = read_state(|s| s.config.governance_canister_id);
    let response = send_command(
        runtime,
        governance,
        neuron_id,
        Command::Spawn(Spawn {
            new_controller: None,
            nonce: Some(spawn_nonce),
            percentage_to_spawn: None,
        }),
    )
    .await
    .map_err(|msg| cycle_err("spawn_maturity", msg))?;
    let created = match response {
        CommandResponse::Spawn(response) => response
            .created_neuron_id
            .ok_or_else(|| cycle_err("spawn_maturity", "governance returned no neuron id"))?,
        other => {
            return Err(cycle_err(
                "spawn_maturity",
                format!("unexpected response from governance: {other:?}"),
            ));
        }
    };

    let now = runtime.time();
    mutate_state(|s| {
        let cap = s.config.activity_log_cap;
        if let Some(node) = s.node_mut(node_id) {
            node.neuron.internals.local_idx += 1;
            node.neuron.internals.spawning_neurons.push(NeuronCache {
                neuron_id: Some(created.id),
                nonce: Some(spawn_nonce),
                state: Some(NEURON_STATE_SPAWNING),
                ..NeuronCache::default()
            });
            // Spawning converts the whole maturity; zero it so the next
            // cycle does not spawn again from a stale value.
            node.neuron.cache.maturity_e8s_equivalent = Some(0);
            node.log_ok("spawn_maturity", now, cap);
        }
    });
    log!(
        Priority::Info,
        "[spawn_maturity]: node {node_id} spawned neuron {}",
        created.id
    );
    Ok(())
}

/// Re-reads the spawning neurons and disburses every one that finished the
/// spawn period into the node's maturity account.
async fn claim_spawned<R: CanisterRuntime>(
    node_id: NodeId,
    runtime: &R,
) -> Result<(), CycleError> {
    let spawning_ids: Vec<u64> = read_state(|s| {
        s.node(node_id)
            .map(|node| {
                node.neuron
                    .internals
                    .spawning_neurons
                    .iter()
                    .filter_map(|cache| cache.neuron_id)
                    .collect()
            })
            .unwrap_or_default()
    });
    if spawning_ids.is_empty() {
        return Ok(());
    }

    let governance = read_state(|s| s.config.governance_canister_id);
    let response = runtime
        .list_neurons(governance, ListNeurons::by_ids(spawning_ids))
        .await
        .map_err(|err| cycle_err("claim_maturity", err))?;
    let now_seconds = runtime.time() / NANOS_PER_SECOND;

    let mut ready = Vec::new();
    mutate_state(|s| {
        if let Some(node) = s.node_mut(node_id) {
            for cache in &mut node.neuron.internals.spawning_neurons {
                let Some(neuron) = response
                    .full_neurons
                    .iter()
                    .find(|n| n.id.map(|id| id.id) == cache.neuron_id)
                else {
                    continue;
                };
                cache.state = Some(neuron.state(now_seconds));
                cache.cached_neuron_stake_e8s = Some(neuron.cached_neuron_stake_e8s);
                cache.maturity_e8s_equivalent = Some(neuron.maturity_e8s_equivalent);
                if neuron.state(now_seconds) != NEURON_STATE_SPAWNING
                    && neuron.cached_neuron_stake_e8s > 0
                {
                    ready.push((
                        neuron.id.map(|id| id.id).unwrap_or_default(),
                        neuron.cached_neuron_stake_e8s,
                    ));
                }
            }
        }
    });

    let canister_id = runtime.id();
    let (icp_ledger, icp_fee) = read_state(|s| {
        (s.config.icp_ledger_canister_id, s.config.icp_ledger_fee_e8s)
    });
    let to_account = account_identifier(
        canister_id,
        Some(ledger::node_subaccount(node_id, NodeAccountSlot::Maturity)),
    );
    for (spawned_id, stake) in ready {
        send_command(
            runtime,
            governance,
            spawned_id,
            Command::Disburse(Disburse {
                to_account: Some(to_account.clone()),
                amount: None,
            }),
        )
        .await
        .map_err(|msg| cycle_err("claim_maturity", msg))?;
        mutate_state(|s| {
            let cap = s.config.activity_log_cap;
            s.credit(
                icp_ledger,
                ledger::node_account(canister_id, node_id, NodeAccountSlot::Maturity),
                stake.saturating_sub(icp_fee),
            );
            if let Some(node) = s.node_mut(node_id) {
                node.neuron
                    .internals
                    .spawning_neurons
                    .retain(|cache| cache.neuron_id != Some(spawned_id));
                node.log_ok("claim_maturity", runtime.time(), cap);
            }
        });
    }
    Ok(())
}

/// Forwards whatever landed on the node's maturity account to destination 0,
/// keeping back the billing transaction fee and splitting it between the
/// platform accounts.
async fn forward_payouts<R: CanisterRuntime>(
    node_id: NodeId,
    runtime: &R,
) -> Result<(), CycleError> {
    let canister_id = runtime.id();
    let (icp_ledger, icp_fee, destination, transaction_fee, affiliate) = read_state(|s| {
        let node = s.node(node_id);
        (
            s.config.icp_ledger_canister_id,
            s.config.icp_ledger_fee_e8s,
            node.and_then(|n| n.destinations.first().cloned().flatten()),
            node.map(|n| n.billing.transaction_fee.clone()),
            node.and_then(|n| n.billing.affiliate),
        )
    });
    let destination = match destination {
        Some(destination) => destination,
        // No destination configured, the funds wait on the maturity account.
        None => return Ok(()),
    };

    let maturity_account = ledger::node_account(canister_id, node_id, NodeAccountSlot::Maturity);
    let balance = read_state(|s| s.virtual_balance(icp_ledger, &maturity_account));

    let fee_cut = match transaction_fee {
        Some(BillingTransactionFee::TransactionPercentageFeeE8s(p)) => {
            ((balance as u128 * p as u128) / E8S_PER_ICP as u128) as u64
        }
        _ => 0,
    };
    if balance <= fee_cut + 2 * icp_fee {
        return Ok(());
    }

    let subaccount = ledger::node_subaccount(node_id, NodeAccountSlot::Maturity);
    runtime
        .icrc1_transfer(
            icp_ledger,
            TransferArg {
                from_subaccount: Some(subaccount),
                to: destination,
                fee: None,
                created_at_time: None,
                memo: None,
                amount: Nat::from(balance - fee_cut - icp_fee),
            },
        )
        .await
        .map_err(|err| cycle_err("disburse", err))?;
    // The transfer and its ledger fee left the maturity subaccount.
    mutate_state(|s| {
        s.debit(icp_ledger, &maturity_account, balance - fee_cut);
    });

    if fee_cut > icp_fee {
        let pool_share = fee_cut - icp_fee;
        runtime
            .icrc1_transfer(
                icp_ledger,
                TransferArg {
                    from_subaccount: Some(subaccount),
                    to: ledger::main_account(canister_id),
                    fee: None,
                    created_at_time: None,
                    memo: None,
                    amount: Nat::from(pool_share),
                },
            )
            .await
            .map_err(|err| cycle_err("disburse", err))?;
        mutate_state(|s| {
            s.debit(icp_ledger, &maturity_account, fee_cut);
            crate::billing::distribute_fee(s, icp_ledger, pool_share, affiliate);
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governance::{
        DissolveState, ListNeuronsResponse, ManageNeuronResponse, Neuron, NeuronId, SpawnResponse,
    };
    use crate::state::{replace_state, Activity, Node, UpdatingStatus, VectorState};
    use crate::test_fixtures::{mock::MockCanisterRuntime, test_config, test_node, CANISTER_ID};

    const NOW: u64 = 1_700_000_000 * NANOS_PER_SECOND;

    fn init_state_with_node(node: Node) -> NodeId {
        let mut state = VectorState::new(test_config());
        let node_id = node.id;
        state.nodes.insert(node_id, node);
        replace_state(state);
        node_id
    }

    fn runtime_at(now: u64) -> MockCanisterRuntime {
        let mut runtime = MockCanisterRuntime::new();
        runtime.expect_time().return_const(now);
        runtime.expect_id().return_const(CANISTER_ID);
        runtime
    }

    fn node_with_neuron(maturity: u64) -> Node {
        let mut node = test_node(1);
        node.neuron.cache.neuron_id = Some(42);
        node.neuron.cache.nonce = Some(stake_nonce(1));
        node.neuron.cache.state = Some(crate::governance::NEURON_STATE_LOCKED);
        node.neuron.cache.cached_neuron_stake_e8s = Some(10 * E8S_PER_ICP);
        node.neuron.cache.maturity_e8s_equivalent = Some(maturity);
        node.neuron.internals.updating = UpdatingStatus::Done(NOW);
        node
    }

    #[tokio::test]
    async fn maturity_below_threshold_does_not_spawn() {
        let minimum = test_config().minimum_spawn_e8s;
        let node_id = init_state_with_node(node_with_neuron(minimum - 1));
        let runtime = runtime_at(NOW);

        process(node_id, 42, &runtime).await.expect("no-op cycle");

        read_state(|s| {
            let node = s.node(node_id).unwrap();
            assert!(node.neuron.internals.spawning_neurons.is_empty());
            assert_eq!(node.neuron.internals.local_idx, 0);
        });
    }

    #[tokio::test]
    async fn maturity_at_threshold_spawns_with_derived_nonce() {
        let minimum = test_config().minimum_spawn_e8s;
        let node_id = init_state_with_node(node_with_neuron(minimum));
        let mut runtime = runtime_at(NOW);
        let expected_nonce = stake_nonce(1) | 1;
        runtime
            .expect_manage_neuron()
            .withf(move |_, arg| {
                matches!(
                    &arg.command,
                    Some(Command::Spawn(spawn)) if spawn.nonce == Some(expected_nonce)
                )
            })
            .return_once(|_, _| {
                Ok(ManageNeuronResponse {
                    command: Some(CommandResponse::Spawn(SpawnResponse {
                        created_neuron_id: Some(NeuronId { id: 4242 }),
                    })),
                })
            });
        // The freshly spawned neuron is still spawning, nothing to claim.
        runtime.expect_list_neurons().returning(|_, _| {
            Ok(ListNeuronsResponse {
                full_neurons: vec![Neuron {
                    id: Some(NeuronId { id: 4242 }),
                    spawn_at_timestamp_seconds: Some(NOW / NANOS_PER_SECOND + 7 * 24 * 3600),
                    ..Neuron::default()
                }],
            })
        });

        process(node_id, 42, &runtime).await.expect("spawn cycle");

        read_state(|s| {
            let node = s.node(node_id).unwrap();
            assert_eq!(node.neuron.internals.local_idx, 1);
            assert_eq!(node.neuron.internals.spawning_neurons.len(), 1);
            assert_eq!(node.neuron.cache.maturity_e8s_equivalent, Some(0));
            assert!(node
                .neuron
                .log
                .iter()
                .any(|e| matches!(e, Activity::Ok { operation, .. } if operation == "spawn_maturity")));
        });
    }

    #[tokio::test]
    async fn matured_spawned_neuron_is_claimed() {
        let mut node = node_with_neuron(0);
        // No destination yet, the proceeds stay on the maturity source.
        node.destinations = vec![None];
        node.neuron.internals.local_idx = 1;
        node.neuron.internals.spawning_neurons.push(NeuronCache {
            neuron_id: Some(4242),
            nonce: Some(stake_nonce(1) | 1),
            state: Some(NEURON_STATE_SPAWNING),
            ..NeuronCache::default()
        });
        let node_id = init_state_with_node(node);

        let mut runtime = runtime_at(NOW);
        runtime.expect_list_neurons().returning(|_, _| {
            Ok(ListNeuronsResponse {
                full_neurons: vec![Neuron {
                    id: Some(NeuronId { id: 4242 }),
                    cached_neuron_stake_e8s: E8S_PER_ICP,
                    dissolve_state: Some(DissolveState::WhenDissolvedTimestampSeconds(0)),
                    ..Neuron::default()
                }],
            })
        });
        runtime
            .expect_manage_neuron()
            .withf(|_, arg| {
                arg.id == Some(NeuronId { id: 4242 })
                    && matches!(&arg.command, Some(Command::Disburse(_)))
            })
            .return_once(|_, _| {
                Ok(ManageNeuronResponse {
                    command: Some(CommandResponse::Disburse(
                        crate::governance::DisburseResponse {
                            transfer_block_height: 1,
                        },
                    )),
                })
            });

        process(node_id, 42, &runtime).await.expect("claim cycle");

        read_state(|s| {
            let node = s.node(node_id).unwrap();
            assert!(node.neuron.internals.spawning_neurons.is_empty());
            assert!(node
                .neuron
                .log
                .iter()
                .any(|e| matches!(e, Activity::Ok { operation, .. } if operation == "claim_maturity")));
            let ledger = s.config.icp_ledger_canister_id;
            let maturity =
                ledger::node_account(CANISTER_ID, node_id, NodeAccountSlot::Maturity);
            assert_eq!(
                s.virtual_balance(ledger, &maturity),
                E8S_PER_ICP - s.config.icp_ledger_fee_e8s
            );
        });
    }

    #[tokio::test]
    async fn payout_forwarding_takes_percentage_fee() {
        let mut node = node_with_neuron(0);
        node.billing.transaction_fee =
            BillingTransactionFee::TransactionPercentageFeeE8s(5_000_000);
        let node_id = init_state_with_node(node);

        let balance = 10 * E8S_PER_ICP;
        let fee_cut = balance / 20;
        let icp_fee = test_config().icp_ledger_fee_e8s;
        let maturity = ledger::node_account(CANISTER_ID, node_id, NodeAccountSlot::Maturity);
        mutate_state(|s| {
            let ledger = s.config.icp_ledger_canister_id;
            s.credit(ledger, maturity, balance);
        });

        let mut runtime = runtime_at(NOW);
        let destination_amount = Nat::from(balance - fee_cut - icp_fee);
        runtime
            .expect_icrc1_transfer()
            .withf(move |_, arg| arg.amount == destination_amount)
            .return_once(|_, _| Ok(1));
        let pool_amount = Nat::from(fee_cut - icp_fee);
        runtime
            .expect_icrc1_transfer()
            .withf(move |_, arg| arg.amount == pool_amount)
            .return_once(|_, _| Ok(2));

        process(node_id, 42, &runtime).await.expect("payout cycle");

        read_state(|s| {
            let ledger = s.config.icp_ledger_canister_id;
            let split = &s.config.split;
            let distributed = fee_cut - icp_fee;
            let author_share = distributed * split.author / 1000;
            assert_eq!(
                s.virtual_balance(ledger, &s.config.author_account),
                author_share
            );
            assert_eq!(s.virtual_balance(ledger, &maturity), 0);
        });
    }

    #[tokio::test]
    async fn dust_payouts_are_left_alone() {
        let node_id = init_state_with_node(node_with_neuron(0));
        let icp_fee = test_config().icp_ledger_fee_e8s;
        mutate_state(|s| {
            let ledger = s.config.icp_ledger_canister_id;
            s.credit(
                ledger,
                ledger::node_account(CANISTER_ID, node_id, NodeAccountSlot::Maturity),
                2 * icp_fee,
            );
        });
        let runtime = runtime_at(NOW);

        process(node_id, 42, &runtime).await.expect("no-op cycle");
    }
}
