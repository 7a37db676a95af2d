//! The ledger gateway.
//!
//! All tokens the canister holds live on its main (pool) account of each
//! ledger. Client funds are tracked as virtual balances keyed by
//! `(ledger, account)`; deposits arrive on per-account deposit subaccounts
//! and are swept into the pool, withdrawals leave the pool with a real
//! ledger transfer. Moves between two virtual accounts never touch the
//! ledger.

use crate::logs::Priority;
use crate::state::{mutate_state, read_state, NodeId};
use crate::{CallError, CanisterRuntime};
use candid::{Nat, Principal};
use canlog::log;
use icrc_ledger_types::icrc1::account::{Account, Subaccount};
use icrc_ledger_types::icrc1::transfer::TransferArg;
use sha2::{Digest, Sha256};

const DEPOSIT_DOMAIN: &[u8] = b"vector-deposit";
const NODE_DOMAIN: &[u8] = b"vector-node";

/// Per-node account slots under the canister's principal.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum NodeAccountSlot {
    /// Source 0, receives stakeable deposits.
    Stake,
    /// Source 1, receives disbursed maturity before forwarding.
    Maturity,
    /// The account nodes pay their operating cost from.
    Billing,
}

impl NodeAccountSlot {
    fn tag(self) -> u8 {
        match self {
            NodeAccountSlot::Stake => 0,
            NodeAccountSlot::Maturity => 1,
            NodeAccountSlot::Billing => 2,
        }
    }
}

/// The subaccount a client must deposit to in order to top up the virtual
/// balance of `account`.
pub fn deposit_subaccount(account: &Account) -> Subaccount {
    let mut hasher = Sha256::new();
    hasher.update([DEPOSIT_DOMAIN.len() as u8]);
    hasher.update(DEPOSIT_DOMAIN);
    hasher.update(account.owner.as_slice());
    hasher.update(account.effective_subaccount());
    hasher.finalize().into()
}

pub fn node_subaccount(node_id: NodeId, slot: NodeAccountSlot) -> Subaccount {
    let mut hasher = Sha256::new();
    hasher.update([NODE_DOMAIN.len() as u8]);
    hasher.update(NODE_DOMAIN);
    hasher.update(node_id.to_be_bytes());
    hasher.update([slot.tag()]);
    hasher.finalize().into()
}

pub fn node_account(canister_id: Principal, node_id: NodeId, slot: NodeAccountSlot) -> Account {
    Account {
        owner: canister_id,
        subaccount: Some(node_subaccount(node_id, slot)),
    }
}

pub fn main_account(canister_id: Principal) -> Account {
    Account {
        owner: canister_id,
        subaccount: None,
    }
}

/// Checks the deposit subaccount of every registered account and moves any
/// funds found there into the pool, crediting the corresponding virtual
/// balance. One ledger fee is kept back per sweep.
pub async fn sweep_deposits<R: CanisterRuntime>(runtime: &R) {
    let (ledger, fee, accounts) = read_state(|s| {
        (
            s.config.icp_ledger_canister_id,
            s.config.icp_ledger_fee_e8s,
            s.registered_accounts.iter().cloned().collect::<Vec<_>>(),
        )
    });
    let canister_id = runtime.id();

    for account in accounts {
        let subaccount = deposit_subaccount(&account);
        let deposit_account = Account {
            owner: canister_id,
            subaccount: Some(subaccount),
        };
        let balance = match runtime.icrc1_balance_of(ledger, deposit_account).await {
            Ok(balance) => balance,
            Err(err) => {
                log!(
                    Priority::Debug,
                    "[sweep]: failed to read deposit balance of {account}: {err}"
                );
                continue;
            }
        };
        // Anything at or below two fees would be eaten by the sweep hop and
        // the following stake or withdrawal hop.
        if balance <= 2 * fee {
            continue;
        }
        let amount = balance - fee;
        match runtime
            .icrc1_transfer(
                ledger,
                TransferArg {
                    from_subaccount: Some(subaccount),
                    to: main_account(canister_id),
                    fee: None,
                    created_at_time: None,
                    memo: None,
                    amount: Nat::from(amount),
                },
            )
            .await
        {
            Ok(block_index) => {
                mutate_state(|s| s.credit(ledger, account, amount));
                log!(
                    Priority::Info,
                    "[sweep]: credited {amount} to {account} at block {block_index}"
                );
            }
            Err(err) => {
                log!(
                    Priority::Info,
                    "[sweep]: failed to sweep deposit of {account}: {err}"
                );
            }
        }
    }
}

/// Moves `amount` between two virtual accounts on the same ledger. No ledger
/// transaction happens and no fee is charged. Fails when the source balance
/// is too small.
pub fn virtual_move(
    ledger: Principal,
    from: &Account,
    to: Account,
    amount: u64,
) -> Result<(), String> {
    mutate_state(|s| {
        if !s.debit(ledger, from, amount) {
            return Err(format!("insufficient virtual balance on {from}"));
        }
        s.credit(ledger, to, amount);
        Ok(())
    })
}

/// Sends `amount` from the pool to an external account and debits the
/// virtual balance of `from` by the full amount. The receiver gets
/// `amount - fee`.
pub async fn withdraw<R: CanisterRuntime>(
    runtime: &R,
    ledger: Principal,
    from: &Account,
    to: Account,
    amount: u64,
) -> Result<u64, CallError> {
    let fee = read_state(|s| {
        if ledger == s.config.icp_ledger_canister_id {
            s.config.icp_ledger_fee_e8s
        } else {
            s.config.billing_ledger_fee
        }
    });
    if amount <= fee {
        return Err(CallError::new(
            "withdraw",
            crate::Reason::CanisterError("amount does not cover the ledger fee".to_string()),
        ));
    }
    if !mutate_state(|s| s.debit(ledger, from, amount)) {
        return Err(CallError::new(
            "withdraw",
            crate::Reason::CanisterError(format!("insufficient virtual balance on {from}")),
        ));
    }
    let result = runtime
        .icrc1_transfer(
            ledger,
            TransferArg {
                from_subaccount: None,
                to,
                fee: None,
                created_at_time: None,
                memo: None,
                amount: Nat::from(amount - fee),
            },
        )
        .await;
    match result {
        Ok(block_index) => Ok(block_index),
        Err(err) => {
            // The transfer did not happen, put the funds back.
            mutate_state(|s| s.credit(ledger, *from, amount));
            Err(err)
        }
    }
}
