use crate::governance::{ListNeurons, ListNeuronsResponse, ManageNeuron, ManageNeuronResponse};
use async_trait::async_trait;
use candid::Principal;
use ic_cdk::api::call::RejectionCode;
use icrc_ledger_client_cdk::{CdkRuntime, ICRC1Client};
use icrc_ledger_types::icrc1::account::Account;
use icrc_ledger_types::icrc1::transfer::TransferArg;
use num_traits::ToPrimitive;
use std::fmt;

pub mod billing;
pub mod commands;
pub mod governance;
pub mod guard;
pub mod ledger;
pub mod lifecycle;
pub mod logs;
pub mod maturity;
pub mod queries;
pub mod state;
pub mod storage;
pub mod sync;
pub mod tasks;

#[cfg(test)]
pub mod test_fixtures;

/// Represents an error from an inter-canister call, such as `manage_neuron`
/// or `icrc1_transfer`.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct CallError {
    method: String,
    reason: Reason,
}

impl CallError {
    pub fn new(method: impl Into<String>, reason: Reason) -> Self {
        Self {
            method: method.into(),
            reason,
        }
    }

    /// Returns the name of the method that resulted in this error.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Returns the failure reason.
    pub fn reason(&self) -> &Reason {
        &self.reason
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "call '{}' failed: {}", self.method, self.reason)
    }
}

/// The reason for the call failure.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum Reason {
    /// Failed to send the request because the local output queue is full.
    QueueIsFull,
    /// The canister does not have enough cycles to submit the request.
    OutOfCycles,
    /// The call failed with an error.
    CanisterError(String),
    /// The target canister rejected the call.
    Rejected(String),
}

impl fmt::Display for Reason {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueIsFull => write!(fmt, "the canister queue is full"),
            Self::OutOfCycles => write!(fmt, "the canister is out of cycles"),
            Self::CanisterError(msg) => write!(fmt, "canister error: {}", msg),
            Self::Rejected(msg) => write!(fmt, "the target canister rejected the call: {}", msg),
        }
    }
}

impl Reason {
    fn from_reject(reject_code: RejectionCode, reject_message: String) -> Self {
        match reject_code {
            RejectionCode::SysTransient => Self::QueueIsFull,
            RejectionCode::CanisterError => Self::CanisterError(reject_message),
            RejectionCode::CanisterReject => Self::Rejected(reject_message),
            _ => Self::QueueIsFull,
        }
    }
}

#[async_trait]
pub trait CanisterRuntime {
    /// Returns the principal of this canister.
    fn id(&self) -> Principal;

    /// Gets the current timestamp, in nanoseconds since the epoch (1970-01-01).
    fn time(&self) -> u64;

    /// Sets a global timer to make the system schedule a call to the exported
    /// `canister_global_timer` function after the specified time. The time
    /// must be provided as nanoseconds since 1970-01-01.
    fn global_timer_set(&self, timestamp: u64);

    /// Returns the balance of the given account on the given ICRC-1 ledger.
    async fn icrc1_balance_of(
        &self,
        ledger: Principal,
        account: Account,
    ) -> Result<u64, CallError>;

    /// Executes a transfer on the given ICRC-1 ledger, returning the block
    /// index.
    async fn icrc1_transfer(&self, ledger: Principal, arg: TransferArg)
        -> Result<u64, CallError>;

    /// Sends a command to an NNS governance neuron.
    async fn manage_neuron(
        &self,
        governance: Principal,
        arg: ManageNeuron,
    ) -> Result<ManageNeuronResponse, CallError>;

    /// Reads full neurons from NNS governance. The canister must be listed as
    /// controller or hot key to get the full view.
    async fn list_neurons(
        &self,
        governance: Principal,
        arg: ListNeurons,
    ) -> Result<ListNeuronsResponse, CallError>;
}

#[derive(Copy, Clone)]
pub struct IcCanisterRuntime {}

#[async_trait]
impl CanisterRuntime for IcCanisterRuntime {
    fn id(&self) -> Principal {
        ic_cdk::id()
    }

    fn time(&self) -> u64 {
        ic_cdk::api::time()
    }

    fn global_timer_set(&self, timestamp: u64) {
        // SAFETY: this is always safe to call, and we can't do anything
        // with the result, so ignoring it is fine.
        unsafe {
            ic0::global_timer_set(timestamp as i64);
        }
    }

    async fn icrc1_balance_of(
        &self,
        ledger: Principal,
        account: Account,
    ) -> Result<u64, CallError> {
        let client = ICRC1Client {
            runtime: CdkRuntime,
            ledger_canister_id: ledger,
        };
        let balance = client.balance_of(account).await.map_err(|(code, msg)| {
            CallError {
                method: "icrc1_balance_of".to_string(),
                reason: Reason::Rejected(format!("{msg} (reject_code = {code})")),
            }
        })?;
        Ok(balance.0.to_u64().expect("nat does not fit into u64"))
    }

    async fn icrc1_transfer(
        &self,
        ledger: Principal,
        arg: TransferArg,
    ) -> Result<u64, CallError> {
        let client = ICRC1Client {
            runtime: CdkRuntime,
            ledger_canister_id: ledger,
        };
        let block_index = client
            .transfer(arg)
            .await
            .map_err(|(code, msg)| CallError {
                method: "icrc1_transfer".to_string(),
                reason: Reason::Rejected(format!("{msg} (reject_code = {code})")),
            })?
            .map_err(|err| CallError {
                method: "icrc1_transfer".to_string(),
                reason: Reason::CanisterError(format!("ledger error: {err:?}")),
            })?;
        Ok(block_index.0.to_u64().expect("nat does not fit into u64"))
    }

    async fn manage_neuron(
        &self,
        governance: Principal,
        arg: ManageNeuron,
    ) -> Result<ManageNeuronResponse, CallError> {
        let res: Result<(ManageNeuronResponse,), _> =
            ic_cdk::api::call::call(governance, "manage_neuron", (arg,)).await;
        match res {
            Ok((response,)) => Ok(response),
            Err((code, msg)) => Err(CallError {
                method: "manage_neuron".to_string(),
                reason: Reason::from_reject(code, msg),
            }),
        }
    }

    async fn list_neurons(
        &self,
        governance: Principal,
        arg: ListNeurons,
    ) -> Result<ListNeuronsResponse, CallError> {
        let res: Result<(ListNeuronsResponse,), _> =
            ic_cdk::api::call::call(governance, "list_neurons", (arg,)).await;
        match res {
            Ok((response,)) => Ok(response),
            Err((code, msg)) => Err(CallError {
                method: "list_neurons".to_string(),
                reason: Reason::from_reject(code, msg),
            }),
        }
    }
}

/// Pops and runs every ready task. The global timer handler in the canister
/// binary delegates here.
pub async fn timer<R: CanisterRuntime + Copy>(runtime: R) {
    while let Some(task) = tasks::pop_if_ready(&runtime) {
        tasks::run_task(task, runtime).await;
    }
}
