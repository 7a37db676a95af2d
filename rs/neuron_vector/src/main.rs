use ic_cdk::{init, post_upgrade, pre_upgrade, query, update};
use ic_neuron_vector::commands::{self, BatchCommandRequest, BatchCommandResponse, CreateRequest};
use ic_neuron_vector::lifecycle::{self, init::VectorArg};
use ic_neuron_vector::queries::{self, AccountEndpoint, NodeSelector, NodeShared, PylonMeta};
use ic_neuron_vector::IcCanisterRuntime;
use icrc_ledger_types::icrc1::account::Account;

const MAX_CONTROLLER_NODES_PAGE: usize = 100;

fn runtime() -> IcCanisterRuntime {
    IcCanisterRuntime {}
}

#[init]
fn init(arg: VectorArg) {
    match arg {
        VectorArg::Init(args) => lifecycle::init(args, &runtime()),
        VectorArg::Upgrade(_) => panic!("expected Init args, got Upgrade"),
    }
}

#[pre_upgrade]
fn pre_upgrade() {
    lifecycle::pre_upgrade()
}

#[post_upgrade]
fn post_upgrade(arg: Option<VectorArg>) {
    match arg {
        Some(VectorArg::Init(_)) => panic!("expected Upgrade args, got Init"),
        Some(VectorArg::Upgrade(args)) => lifecycle::post_upgrade(args, &runtime()),
        None => lifecycle::post_upgrade(None, &runtime()),
    }
}

#[export_name = "canister_global_timer"]
fn timer() {
    ic_cdk::spawn(ic_neuron_vector::timer(runtime()))
}

#[update]
async fn icrc55_command(request: BatchCommandRequest) -> BatchCommandResponse {
    commands::process_batch(ic_cdk::caller(), request, &runtime()).await
}

#[update]
fn icrc55_account_register(account: Account) -> Result<Account, String> {
    commands::register_account(ic_cdk::caller(), account, ic_cdk::id())
}

#[query]
fn icrc55_get_nodes(selectors: Vec<NodeSelector>) -> Vec<Option<NodeShared>> {
    queries::get_nodes(&selectors, ic_cdk::id())
}

#[query]
fn icrc55_get_controller_nodes(controller: Account, start: u64, length: u64) -> Vec<NodeShared> {
    queries::get_controller_nodes(
        &controller,
        start as usize,
        (length as usize).min(MAX_CONTROLLER_NODES_PAGE),
        ic_cdk::id(),
    )
}

#[query]
fn icrc55_virtual_balance(account: Account) -> Result<u64, String> {
    queries::virtual_balance(ic_cdk::caller(), &account)
}

#[query]
fn icrc55_accounts(account: Account) -> Result<Vec<AccountEndpoint>, String> {
    queries::accounts_of(ic_cdk::caller(), &account, ic_cdk::id())
}

#[query]
fn icrc55_deposit_account(account: Account) -> Account {
    queries::deposit_account_of(&account, ic_cdk::id())
}

#[query]
fn icrc55_get_defaults(_module_id: String) -> CreateRequest {
    commands::create_defaults()
}

#[query]
fn icrc55_get_pylon_meta() -> PylonMeta {
    queries::pylon_meta()
}

fn main() {}

ic_cdk::export_candid!();
