//! Read-only views over nodes and balances, shaped for the Candid API.

use crate::ledger::{self, NodeAccountSlot};
use crate::state::{
    read_state, BillingTransactionFee, Config, NeuronVector, Node, NodeId, VectorState,
};
use candid::{CandidType, Principal};
use icrc_ledger_types::icrc1::account::Account;
use serde::{Deserialize, Serialize};

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub struct SourceEndpoint {
    pub endpoint: Account,
    pub name: String,
    pub balance: u64,
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub struct DestinationEndpoint {
    pub endpoint: Option<Account>,
    pub name: String,
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub struct BillingShared {
    pub account: Account,
    pub current_balance: u64,
    pub cost_per_day: u64,
    pub transaction_fee: BillingTransactionFee,
    pub billing_option: u64,
    pub frozen: bool,
    pub expires: Option<u64>,
}

/// How a client refers to a node: by its id, or by one of the node's
/// accounts (stake, maturity or billing).
#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub enum NodeSelector {
    #[serde(rename = "id")]
    Id(NodeId),
    #[serde(rename = "endpoint")]
    Endpoint(Account),
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub struct NodeShared {
    pub id: NodeId,
    pub active: bool,
    pub created: u64,
    pub modified: u64,
    pub controllers: Vec<Account>,
    pub sources: Vec<SourceEndpoint>,
    pub destinations: Vec<DestinationEndpoint>,
    pub refund: Account,
    pub billing: BillingShared,
    pub custom: NeuronVector,
}

/// One virtual account of an owner: its balance on a ledger and where to
/// deposit to top it up.
#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub struct AccountEndpoint {
    pub ledger: Principal,
    pub account: Account,
    pub balance: u64,
    pub deposit_account: Account,
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub struct BillingOption {
    pub cost_per_day: u64,
    pub transaction_fee: BillingTransactionFee,
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub struct PylonMeta {
    pub name: String,
    pub governed_by: String,
    pub billing_options: Vec<BillingOption>,
    pub supported_ledgers: Vec<Principal>,
    pub request_max_expire_seconds: u64,
}

pub fn node_shared(s: &VectorState, node: &Node, canister_id: Principal) -> NodeShared {
    let icp_ledger = s.config.icp_ledger_canister_id;
    let billing_ledger = s.config.billing_ledger_canister_id;
    let stake_account = ledger::node_account(canister_id, node.id, NodeAccountSlot::Stake);
    let maturity_account = ledger::node_account(canister_id, node.id, NodeAccountSlot::Maturity);
    let billing_account = ledger::node_account(canister_id, node.id, NodeAccountSlot::Billing);

    NodeShared {
        id: node.id,
        active: node.active,
        created: node.created,
        modified: node.modified,
        controllers: node.controllers.clone(),
        sources: vec![
            SourceEndpoint {
                endpoint: stake_account,
                name: "stake".to_string(),
                balance: s.virtual_balance(icp_ledger, &stake_account),
            },
            SourceEndpoint {
                endpoint: maturity_account,
                name: "maturity".to_string(),
                balance: s.virtual_balance(icp_ledger, &maturity_account),
            },
        ],
        destinations: node
            .destinations
            .iter()
            .enumerate()
            .map(|(idx, endpoint)| DestinationEndpoint {
                endpoint: *endpoint,
                name: if idx == 0 {
                    "payout".to_string()
                } else {
                    format!("destination_{idx}")
                },
            })
            .collect(),
        refund: node.refund,
        billing: BillingShared {
            account: billing_account,
            current_balance: s.virtual_balance(billing_ledger, &billing_account),
            cost_per_day: node.billing.cost_per_day,
            transaction_fee: node.billing.transaction_fee.clone(),
            billing_option: node.billing.billing_option,
            frozen: node.billing.frozen,
            expires: node.billing.expires,
        },
        custom: node.neuron.clone(),
    }
}

pub fn get_node(node_id: NodeId, canister_id: Principal) -> Option<NodeShared> {
    read_state(|s| s.node(node_id).map(|node| node_shared(s, node, canister_id)))
}

pub fn get_nodes(selectors: &[NodeSelector], canister_id: Principal) -> Vec<Option<NodeShared>> {
    read_state(|s| {
        selectors
            .iter()
            .map(|selector| {
                resolve_node(s, selector, canister_id)
                    .map(|node| node_shared(s, node, canister_id))
            })
            .collect()
    })
}

fn resolve_node<'a>(
    s: &'a VectorState,
    selector: &NodeSelector,
    canister_id: Principal,
) -> Option<&'a Node> {
    match selector {
        NodeSelector::Id(node_id) => s.node(*node_id),
        NodeSelector::Endpoint(endpoint) => {
            if endpoint.owner != canister_id {
                return None;
            }
            let subaccount = endpoint.subaccount?;
            s.nodes.values().find(|node| {
                [
                    NodeAccountSlot::Stake,
                    NodeAccountSlot::Maturity,
                    NodeAccountSlot::Billing,
                ]
                .into_iter()
                .any(|slot| ledger::node_subaccount(node.id, slot) == subaccount)
            })
        }
    }
}

pub fn get_controller_nodes(
    controller: &Account,
    start: usize,
    length: usize,
    canister_id: Principal,
) -> Vec<NodeShared> {
    read_state(|s| {
        s.nodes
            .values()
            .filter(|node| node.is_controller(controller))
            .skip(start)
            .take(length)
            .map(|node| node_shared(s, node, canister_id))
            .collect()
    })
}

/// The virtual balance of the caller's account. Balances are private to
/// the account owner.
pub fn virtual_balance(caller: Principal, account: &Account) -> Result<u64, String> {
    if account.owner != caller {
        return Err("only the account owner can query its balance".to_string());
    }
    read_state(|s| Ok(s.virtual_balance(s.config.icp_ledger_canister_id, account)))
}

/// The account's balances across the supported ledgers, with the deposit
/// account to top them up. Owner-gated like [virtual_balance].
pub fn accounts_of(
    caller: Principal,
    account: &Account,
    canister_id: Principal,
) -> Result<Vec<AccountEndpoint>, String> {
    if account.owner != caller {
        return Err("only the account owner can query its accounts".to_string());
    }
    let deposit_account = deposit_account_of(account, canister_id);
    read_state(|s| {
        let mut ledgers = vec![s.config.icp_ledger_canister_id];
        if s.config.billing_ledger_canister_id != s.config.icp_ledger_canister_id {
            ledgers.push(s.config.billing_ledger_canister_id);
        }
        Ok(ledgers
            .into_iter()
            .map(|ledger| AccountEndpoint {
                ledger,
                account: *account,
                balance: s.virtual_balance(ledger, account),
                deposit_account,
            })
            .collect())
    })
}

/// Where to send real tokens to top up the virtual balance of `account`.
pub fn deposit_account_of(account: &Account, canister_id: Principal) -> Account {
    Account {
        owner: canister_id,
        subaccount: Some(ledger::deposit_subaccount(account)),
    }
}

pub fn pylon_meta() -> PylonMeta {
    read_state(|s| pylon_meta_from_config(&s.config))
}

fn pylon_meta_from_config(config: &Config) -> PylonMeta {
    PylonMeta {
        name: "NNS neuron vector".to_string(),
        governed_by: "Neutrinite DAO".to_string(),
        billing_options: config
            .billing_options()
            .into_iter()
            .map(|(cost_per_day, transaction_fee)| BillingOption {
                cost_per_day,
                transaction_fee,
            })
            .collect(),
        supported_ledgers: {
            let mut ledgers = vec![config.icp_ledger_canister_id];
            if config.billing_ledger_canister_id != config.icp_ledger_canister_id {
                ledgers.push(config.billing_ledger_canister_id);
            }
            ledgers
        },
        request_max_expire_seconds: config.request_max_expire_seconds,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{mutate_state, replace_state, VectorState};
    use crate::test_fixtures::{test_account, test_config, test_node, CANISTER_ID};

    fn init_state_with_node() -> NodeId {
        let mut state = VectorState::new(test_config());
        state.nodes.insert(1, test_node(1));
        replace_state(state);
        1
    }

    #[test]
    fn node_view_reports_source_balances() {
        let node_id = init_state_with_node();
        mutate_state(|s| {
            let ledger = s.config.icp_ledger_canister_id;
            s.credit(
                ledger,
                ledger::node_account(CANISTER_ID, node_id, NodeAccountSlot::Stake),
                123,
            );
        });

        let shared = get_node(node_id, CANISTER_ID).expect("node exists");
        assert_eq!(shared.sources.len(), 2);
        assert_eq!(shared.sources[0].name, "stake");
        assert_eq!(shared.sources[0].balance, 123);
        assert_eq!(shared.sources[1].balance, 0);
    }

    #[test]
    fn controller_listing_pages() {
        let mut state = VectorState::new(test_config());
        for id in 0..5 {
            state.nodes.insert(id, test_node(id));
        }
        let mut foreign = test_node(100);
        foreign.controllers = vec![test_account(50, None)];
        state.nodes.insert(100, foreign);
        replace_state(state);

        let controller = test_node(0).controllers[0];
        let page = get_controller_nodes(&controller, 1, 2, CANISTER_ID);
        assert_eq!(page.iter().map(|n| n.id).collect::<Vec<_>>(), vec![1, 2]);
        assert!(get_controller_nodes(&test_account(50, None), 0, 10, CANISTER_ID).len() == 1);
    }

    #[test]
    fn nodes_resolve_by_id_and_by_endpoint() {
        let node_id = init_state_with_node();
        let billing = ledger::node_account(CANISTER_ID, node_id, NodeAccountSlot::Billing);

        let found = get_nodes(
            &[
                NodeSelector::Id(node_id),
                NodeSelector::Endpoint(billing),
                NodeSelector::Id(999),
                NodeSelector::Endpoint(test_account(8, None)),
            ],
            CANISTER_ID,
        );
        assert_eq!(found[0].as_ref().map(|n| n.id), Some(node_id));
        assert_eq!(found[1].as_ref().map(|n| n.id), Some(node_id));
        assert!(found[2].is_none());
        assert!(found[3].is_none());
    }

    #[test]
    fn balance_queries_are_owner_only() {
        init_state_with_node();
        let account = test_account(3, None);
        assert!(virtual_balance(account.owner, &account).is_ok());
        assert!(virtual_balance(Principal::anonymous(), &account).is_err());
    }

    #[test]
    fn account_listing_reports_balance_and_deposit_account() {
        init_state_with_node();
        let account = test_account(3, None);
        mutate_state(|s| {
            let ledger = s.config.icp_ledger_canister_id;
            s.credit(ledger, account, 555);
        });

        let endpoints = accounts_of(account.owner, &account, CANISTER_ID).expect("owner query");
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].balance, 555);
        assert_eq!(
            endpoints[0].deposit_account,
            deposit_account_of(&account, CANISTER_ID)
        );
        assert!(accounts_of(Principal::anonymous(), &account, CANISTER_ID).is_err());
    }

    #[test]
    fn meta_lists_both_billing_options() {
        init_state_with_node();
        let meta = pylon_meta();
        assert_eq!(meta.billing_options.len(), 2);
        assert_eq!(
            meta.billing_options[1].transaction_fee,
            BillingTransactionFee::TransactionPercentageFeeE8s(5_000_000)
        );
        assert!(meta.billing_options[0].cost_per_day > 0);
        assert_eq!(meta.billing_options[1].cost_per_day, 0);
    }
}
