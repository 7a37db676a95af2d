use crate::lifecycle::init::InitArgs;
use crate::state::{
    replace_state, Config, Internals, NeuronCache, NeuronVector, Node, NodeBilling,
    BillingTransactionFee, NodeId, Variables, VectorState,
};
use candid::Principal;
use icrc_ledger_types::icrc1::account::Account;
use std::collections::VecDeque;

pub const CANISTER_ID: Principal = Principal::from_slice(&[0x00, 0x00, 0x00, 0x00, 0x02, 0x30, 0x00, 0x71, 0x01, 0x01]);
pub const GOVERNANCE_ID: Principal = Principal::from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x01, 0x01]);
pub const ICP_LEDGER_ID: Principal = Principal::from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x01, 0x01]);

pub fn test_account(n: u8, subaccount: Option<u8>) -> Account {
    Account {
        owner: Principal::from_slice(&[n, 0xfe, 0x01]),
        subaccount: subaccount.map(|b| [b; 32]),
    }
}

pub fn init_args() -> InitArgs {
    InitArgs {
        governance_canister_id: GOVERNANCE_ID,
        icp_ledger_canister_id: ICP_LEDGER_ID,
        billing_ledger_canister_id: None,
        default_followee: 6914974521667616928,
        platform_account: test_account(250, None),
        author_account: test_account(251, None),
        pylon_account: test_account(252, None),
        minimum_stake_e8s: None,
        minimum_spawn_e8s: None,
        process_interval_seconds: None,
        periodic_refresh_seconds: None,
        voting_power_refresh_seconds: None,
        operation_cost: None,
        min_create_balance: None,
        freezing_threshold_days: None,
    }
}

pub fn test_config() -> Config {
    Config::from(init_args())
}

pub fn init_state() {
    replace_state(VectorState::new(test_config()));
}

pub fn test_node(id: NodeId) -> Node {
    Node {
        id,
        controllers: vec![test_account(1, None)],
        active: true,
        created: 0,
        modified: 0,
        destinations: vec![Some(test_account(2, None))],
        refund: test_account(1, None),
        billing: NodeBilling {
            transaction_fee: BillingTransactionFee::None,
            cost_per_day: 0,
            billing_option: 0,
            affiliate: None,
            temporary: false,
            frozen: false,
            expires: None,
        },
        neuron: NeuronVector {
            variables: Variables::default(),
            cache: NeuronCache::default(),
            internals: Internals::default(),
            log: VecDeque::new(),
        },
    }
}

pub mod mock {
    use crate::governance::{ListNeurons, ListNeuronsResponse, ManageNeuron, ManageNeuronResponse};
    use crate::{CallError, CanisterRuntime};
    use async_trait::async_trait;
    use candid::Principal;
    use icrc_ledger_types::icrc1::account::Account;
    use icrc_ledger_types::icrc1::transfer::TransferArg;
    use mockall::mock;

    mock! {
        pub CanisterRuntime {}

        #[async_trait]
        impl CanisterRuntime for CanisterRuntime {
            fn id(&self) -> Principal;
            fn time(&self) -> u64;
            fn global_timer_set(&self, timestamp: u64);
            async fn icrc1_balance_of(
                &self,
                ledger: Principal,
                account: Account,
            ) -> Result<u64, CallError>;
            async fn icrc1_transfer(
                &self,
                ledger: Principal,
                arg: TransferArg,
            ) -> Result<u64, CallError>;
            async fn manage_neuron(
                &self,
                governance: Principal,
                arg: ManageNeuron,
            ) -> Result<ManageNeuronResponse, CallError>;
            async fn list_neurons(
                &self,
                governance: Principal,
                arg: ListNeurons,
            ) -> Result<ListNeuronsResponse, CallError>;
        }
    }
}
