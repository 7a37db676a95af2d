//! The batched command surface: node creation, modification, deletion and
//! virtual transfers, processed atomically per command with replay and
//! expiry protection on the batch.

use crate::ledger::{self, NodeAccountSlot};
use crate::logs::Priority;
use crate::queries::{node_shared, NodeShared};
use crate::state::{
    mutate_state, read_state, DissolveDelay, DissolveStatus, Followee, Internals, NeuronCache,
    NeuronVector, Node, NodeBilling, NodeId, UpdatingStatus, Variables, NANOS_PER_SECOND,
};
use crate::tasks::{schedule_now, TaskType};
use crate::CanisterRuntime;
use candid::{CandidType, Principal};
use canlog::log;
use icrc_ledger_types::icrc1::account::Account;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub struct BatchCommandRequest {
    pub controller: Account,
    pub signature: Option<serde_bytes::ByteBuf>,
    pub expire_at: Option<u64>,
    pub request_id: Option<u32>,
    pub commands: Vec<NodeCommand>,
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub enum NodeCommand {
    #[serde(rename = "create_node")]
    CreateNode(CommonCreateRequest, CreateRequest),
    #[serde(rename = "modify_node")]
    ModifyNode(NodeId, Option<CommonModifyRequest>, Option<ModifyRequest>),
    #[serde(rename = "delete_node")]
    DeleteNode(NodeId),
    #[serde(rename = "transfer")]
    Transfer(TransferRequest),
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub struct CommonCreateRequest {
    pub controllers: Vec<Account>,
    pub destinations: Vec<Option<Account>>,
    pub refund: Account,
    pub affiliate: Option<Account>,
    pub billing_option: u64,
    pub initial_billing_amount: Option<u64>,
    pub temp_id: u32,
    pub temporary: bool,
}

/// The module-specific part of a create request.
#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub struct CreateRequest {
    pub variables: Variables,
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub struct CommonModifyRequest {
    pub active: Option<bool>,
    pub controllers: Option<Vec<Account>>,
    pub destinations: Option<Vec<Option<Account>>>,
    pub refund: Option<Account>,
}

/// A sparse patch of the node variables; absent fields stay untouched.
#[derive(Clone, Eq, PartialEq, Debug, Default, CandidType, Deserialize, Serialize)]
pub struct ModifyRequest {
    pub dissolve_delay: Option<DissolveDelay>,
    pub dissolve_status: Option<DissolveStatus>,
    pub followee: Option<Followee>,
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub struct TransferRequest {
    pub ledger: Principal,
    pub from: TransferSource,
    pub to: TransferDestination,
    pub amount: u64,
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub enum TransferSource {
    #[serde(rename = "account")]
    Account(Account),
    #[serde(rename = "node")]
    Node { node_id: NodeId, endpoint_idx: u32 },
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub enum TransferDestination {
    /// Credit a virtual account on this canister.
    #[serde(rename = "account")]
    Account(Account),
    /// Send real tokens out through the ledger.
    #[serde(rename = "external_account")]
    ExternalAccount(Account),
    #[serde(rename = "node")]
    Node { node_id: NodeId, endpoint_idx: u32 },
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub enum BatchCommandResponse {
    #[serde(rename = "ok")]
    Ok(BatchCommandOk),
    #[serde(rename = "err")]
    Err(BatchCommandError),
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub struct BatchCommandOk {
    pub id: Option<u32>,
    pub commands: Vec<CommandResult>,
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub enum BatchCommandError {
    #[serde(rename = "caller_not_controller")]
    CallerNotController,
    #[serde(rename = "expired")]
    Expired,
    #[serde(rename = "duplicate")]
    Duplicate(u32),
    #[serde(rename = "invalid_signature")]
    InvalidSignature,
    #[serde(rename = "other")]
    Other(String),
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub enum CommandResult {
    #[serde(rename = "create_node")]
    CreateNode(CreateNodeResult),
    #[serde(rename = "modify_node")]
    ModifyNode(ModifyNodeResult),
    #[serde(rename = "delete_node")]
    DeleteNode(DeleteNodeResult),
    #[serde(rename = "transfer")]
    Transfer(TransferResult),
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub enum CreateNodeResult {
    #[serde(rename = "ok")]
    Ok(NodeShared),
    #[serde(rename = "err")]
    Err(String),
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub enum ModifyNodeResult {
    #[serde(rename = "ok")]
    Ok(NodeShared),
    #[serde(rename = "err")]
    Err(String),
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub enum DeleteNodeResult {
    #[serde(rename = "ok")]
    Ok(NodeId),
    #[serde(rename = "err")]
    Err(String),
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub enum TransferResult {
    #[serde(rename = "ok")]
    Ok(u64),
    #[serde(rename = "err")]
    Err(String),
}

/// Processes a command batch on behalf of `caller`. The batch is rejected
/// as a whole on an authentication, expiry or replay problem; individual
/// commands then succeed or fail independently.
pub async fn process_batch<R: CanisterRuntime>(
    caller: Principal,
    request: BatchCommandRequest,
    runtime: &R,
) -> BatchCommandResponse {
    let now = runtime.time();

    // Requests are authenticated by the caller principal; signed requests
    // relayed from other chains are not accepted here.
    if request.signature.is_some() {
        return BatchCommandResponse::Err(BatchCommandError::InvalidSignature);
    }
    if caller != request.controller.owner {
        return BatchCommandResponse::Err(BatchCommandError::CallerNotController);
    }
    if let Some(expire_at) = request.expire_at {
        if now > expire_at {
            return BatchCommandResponse::Err(BatchCommandError::Expired);
        }
        let max_window =
            read_state(|s| s.config.request_max_expire_seconds) * NANOS_PER_SECOND;
        if expire_at > now + max_window {
            return BatchCommandResponse::Err(BatchCommandError::Other(
                "expire_at is too far in the future".to_string(),
            ));
        }
    }
    if let Some(request_id) = request.request_id {
        let duplicate = mutate_state(|s| {
            s.purge_expired_request_ids(now);
            if s.processed_requests.contains_key(&request_id) {
                true
            } else {
                s.processed_requests.insert(request_id, now);
                false
            }
        });
        if duplicate {
            return BatchCommandResponse::Err(BatchCommandError::Duplicate(request_id));
        }
    }

    let controller = request.controller;
    let mut results = Vec::with_capacity(request.commands.len());
    for command in request.commands {
        let result = match command {
            NodeCommand::CreateNode(common, custom) => CommandResult::CreateNode(
                match create_node(&controller, common, custom, runtime) {
                    Ok(shared) => CreateNodeResult::Ok(shared),
                    Err(msg) => CreateNodeResult::Err(msg),
                },
            ),
            NodeCommand::ModifyNode(node_id, common, custom) => CommandResult::ModifyNode(
                match modify_node(&controller, node_id, common, custom, runtime) {
                    Ok(shared) => ModifyNodeResult::Ok(shared),
                    Err(msg) => ModifyNodeResult::Err(msg),
                },
            ),
            NodeCommand::DeleteNode(node_id) => {
                CommandResult::DeleteNode(match delete_node(&controller, node_id, runtime) {
                    Ok(node_id) => DeleteNodeResult::Ok(node_id),
                    Err(msg) => DeleteNodeResult::Err(msg),
                })
            }
            NodeCommand::Transfer(transfer) => {
                CommandResult::Transfer(match process_transfer(&controller, transfer, runtime).await
                {
                    Ok(amount) => TransferResult::Ok(amount),
                    Err(msg) => TransferResult::Err(msg),
                })
            }
        };
        results.push(result);
    }

    // A command usually makes its node due right away.
    schedule_now(TaskType::ProcessNodes, runtime);

    BatchCommandResponse::Ok(BatchCommandOk {
        id: request.request_id,
        commands: results,
    })
}

fn create_node<R: CanisterRuntime>(
    controller: &Account,
    common: CommonCreateRequest,
    custom: CreateRequest,
    runtime: &R,
) -> Result<NodeShared, String> {
    let now = runtime.time();
    let canister_id = runtime.id();
    mutate_state(|s| {
        if common.controllers.is_empty() {
            return Err("a node needs at least one controller".to_string());
        }
        let options = s.config.billing_options();
        let (cost_per_day, transaction_fee) = options
            .get(common.billing_option as usize)
            .cloned()
            .ok_or_else(|| format!("unknown billing option {}", common.billing_option))?;

        let initial_amount = common.initial_billing_amount.unwrap_or(0);
        if !common.temporary && initial_amount < s.config.min_create_balance {
            return Err(format!(
                "initial billing amount {initial_amount} is below the minimum {}",
                s.config.min_create_balance
            ));
        }
        let billing_ledger = s.config.billing_ledger_canister_id;
        if initial_amount > 0 && !s.debit(billing_ledger, controller, initial_amount) {
            return Err("insufficient virtual balance for the billing deposit".to_string());
        }

        let node_id = s.next_node_id;
        s.next_node_id += 1;
        if initial_amount > 0 {
            s.credit(
                billing_ledger,
                ledger::node_account(canister_id, node_id, NodeAccountSlot::Billing),
                initial_amount,
            );
        }
        // Deposits of every controller get swept from now on.
        for account in &common.controllers {
            s.registered_accounts.insert(*account);
        }

        let expires = common.temporary.then(|| {
            now + s.config.temporary_node_expire_seconds * NANOS_PER_SECOND
        });
        let node = Node {
            id: node_id,
            controllers: common.controllers,
            active: true,
            created: now,
            modified: now,
            destinations: common.destinations,
            refund: common.refund,
            billing: NodeBilling {
                transaction_fee,
                cost_per_day,
                billing_option: common.billing_option,
                affiliate: common.affiliate,
                temporary: common.temporary,
                frozen: false,
                expires,
            },
            neuron: NeuronVector {
                variables: custom.variables,
                cache: NeuronCache::default(),
                internals: Internals::default(),
                log: VecDeque::new(),
            },
        };
        log!(
            Priority::Info,
            "[create_node]: node {node_id} created by {controller}"
        );
        s.nodes.insert(node_id, node);
        Ok(node_shared(s, &s.nodes[&node_id], canister_id))
    })
}

fn modify_node<R: CanisterRuntime>(
    controller: &Account,
    node_id: NodeId,
    common: Option<CommonModifyRequest>,
    custom: Option<ModifyRequest>,
    runtime: &R,
) -> Result<NodeShared, String> {
    let now = runtime.time();
    let canister_id = runtime.id();
    mutate_state(|s| {
        let node = s
            .nodes
            .get_mut(&node_id)
            .ok_or_else(|| format!("node {node_id} not found"))?;
        if !node.is_controller(controller) {
            return Err("caller does not control this node".to_string());
        }

        if let Some(common) = common {
            if let Some(active) = common.active {
                node.active = active;
            }
            if let Some(controllers) = common.controllers {
                node.controllers = controllers;
            }
            if let Some(destinations) = common.destinations {
                node.destinations = destinations;
            }
            if let Some(refund) = common.refund {
                node.refund = refund;
            }
        }
        if let Some(custom) = custom {
            let variables = &mut node.neuron.variables;
            if let Some(dissolve_delay) = custom.dissolve_delay {
                variables.dissolve_delay = dissolve_delay;
            }
            if let Some(dissolve_status) = custom.dissolve_status {
                variables.dissolve_status = dissolve_status;
            }
            if let Some(followee) = custom.followee {
                variables.followee = followee;
            }
            // Pull the neuron back in line promptly instead of waiting for
            // the periodic refresh.
            node.neuron.internals.updating = UpdatingStatus::Init;
        }
        node.modified = now;
        Ok(node_shared(s, &s.nodes[&node_id], canister_id))
    })
}

fn delete_node<R: CanisterRuntime>(
    controller: &Account,
    node_id: NodeId,
    runtime: &R,
) -> Result<NodeId, String> {
    let canister_id = runtime.id();
    mutate_state(|s| {
        let node = s
            .nodes
            .get(&node_id)
            .ok_or_else(|| format!("node {node_id} not found"))?;
        if !node.is_controller(controller) {
            return Err("caller does not control this node".to_string());
        }
        // The claimed neuron id stays cached for re-use, so emptiness is
        // judged by what the neuron holds, not by whether one was claimed.
        let neuron = &node.neuron;
        if neuron.cache.cached_neuron_stake_e8s.unwrap_or(0) > 0
            || neuron.cache.maturity_e8s_equivalent.unwrap_or(0) > 0
            || neuron.internals.refresh_idx.is_some()
            || !neuron.internals.spawning_neurons.is_empty()
        {
            return Err("the node's neuron still holds funds".to_string());
        }
        let icp_ledger = s.config.icp_ledger_canister_id;
        for slot in [NodeAccountSlot::Stake, NodeAccountSlot::Maturity] {
            let account = ledger::node_account(canister_id, node_id, slot);
            if s.virtual_balance(icp_ledger, &account) > 0 {
                return Err("node sources still hold funds".to_string());
            }
        }
        refund_node_balances(s, node_id, canister_id);
        s.nodes.remove(&node_id);
        log!(Priority::Info, "[delete_node]: node {node_id} deleted");
        Ok(node_id)
    })
}

/// Moves whatever is left on the node's accounts to its refund account.
/// Stake and maturity sources are normally empty at this point; the billing
/// account usually is not.
fn refund_node_balances(s: &mut crate::state::VectorState, node_id: NodeId, canister_id: Principal) {
    let node = match s.node(node_id) {
        Some(node) => node,
        None => return,
    };
    let refund = node.refund;
    let icp_ledger = s.config.icp_ledger_canister_id;
    let billing_ledger = s.config.billing_ledger_canister_id;
    for (ledger, slot) in [
        (icp_ledger, NodeAccountSlot::Stake),
        (icp_ledger, NodeAccountSlot::Maturity),
        (billing_ledger, NodeAccountSlot::Billing),
    ] {
        let account = ledger::node_account(canister_id, node_id, slot);
        let balance = s.virtual_balance(ledger, &account);
        if balance > 0 && s.debit(ledger, &account, balance) {
            s.credit(ledger, refund, balance);
        }
    }
}

async fn process_transfer<R: CanisterRuntime>(
    controller: &Account,
    request: TransferRequest,
    runtime: &R,
) -> Result<u64, String> {
    let canister_id = runtime.id();
    let from = match request.from {
        TransferSource::Account(account) => {
            if account != *controller {
                return Err("source account is not the authenticated controller".to_string());
            }
            account
        }
        TransferSource::Node {
            node_id,
            endpoint_idx,
        } => {
            let controlled = read_state(|s| {
                s.node(node_id)
                    .map(|node| node.is_controller(controller))
                    .unwrap_or(false)
            });
            if !controlled {
                return Err("caller does not control the source node".to_string());
            }
            node_endpoint_account(node_id, endpoint_idx, canister_id)?
        }
    };

    match request.to {
        TransferDestination::Account(to) => {
            ledger::virtual_move(request.ledger, &from, to, request.amount)?;
            Ok(request.amount)
        }
        TransferDestination::Node {
            node_id,
            endpoint_idx,
        } => {
            let exists = read_state(|s| s.node(node_id).is_some());
            if !exists {
                return Err(format!("node {node_id} not found"));
            }
            let to = node_endpoint_account(node_id, endpoint_idx, canister_id)?;
            ledger::virtual_move(request.ledger, &from, to, request.amount)?;
            Ok(request.amount)
        }
        TransferDestination::ExternalAccount(to) => {
            ledger::withdraw(runtime, request.ledger, &from, to, request.amount)
                .await
                .map_err(|err| err.to_string())?;
            Ok(request.amount)
        }
    }
}

fn node_endpoint_account(
    node_id: NodeId,
    endpoint_idx: u32,
    canister_id: Principal,
) -> Result<Account, String> {
    let slot = match endpoint_idx {
        0 => NodeAccountSlot::Stake,
        1 => NodeAccountSlot::Maturity,
        2 => NodeAccountSlot::Billing,
        other => return Err(format!("unknown endpoint {other}")),
    };
    Ok(ledger::node_account(canister_id, node_id, slot))
}

/// The create request a client gets when it asks for defaults: minimum
/// dissolve delay, locked, following the configured default neuron.
pub fn create_defaults() -> CreateRequest {
    CreateRequest {
        variables: Variables::default(),
    }
}

/// Registers an account for deposit sweeping and returns the subaccount to
/// deposit to.
pub fn register_account(
    caller: Principal,
    account: Account,
    canister_id: Principal,
) -> Result<Account, String> {
    if account.owner != caller {
        return Err("only the account owner can register it".to_string());
    }
    mutate_state(|s| {
        s.registered_accounts.insert(account);
    });
    Ok(crate::queries::deposit_account_of(&account, canister_id))
}

/// Periodic cleanup: drops old request ids and deletes expired temporary
/// nodes that never staked.
pub fn run_maintenance(canister_id: Principal, now: u64) {
    mutate_state(|s| {
        s.purge_expired_request_ids(now);

        let billing_ledger = s.config.billing_ledger_canister_id;
        let min_create_balance = s.config.min_create_balance;
        let expired: Vec<NodeId> = s
            .nodes
            .values()
            .filter(|node| {
                node.billing.temporary
                    && node.is_empty()
                    && node.billing.expires.is_some_and(|expires| now >= expires)
            })
            .map(|node| node.id)
            .collect();
        let mut upgraded = Vec::new();
        for node_id in &expired {
            let billing_account =
                ledger::node_account(canister_id, *node_id, NodeAccountSlot::Billing);
            if s.virtual_balance(billing_ledger, &billing_account) >= min_create_balance {
                upgraded.push(*node_id);
            }
        }
        for node_id in expired {
            if upgraded.contains(&node_id) {
                let node = s.nodes.get_mut(&node_id).expect("node disappeared");
                node.billing.temporary = false;
                node.billing.expires = None;
                continue;
            }
            refund_node_balances(s, node_id, canister_id);
            s.nodes.remove(&node_id);
            log!(
                Priority::Info,
                "[run_maintenance]: expired temporary node {node_id} deleted"
            );
        }
    });
}
