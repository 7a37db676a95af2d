//! The subset of the NNS governance Candid interface the vector calls.
//!
//! Only the operations a node issues are modeled: claim/refresh stake,
//! dissolve configuration, following, spawning and disbursing. Field and
//! variant names must stay wire-compatible with the governance canister.

use candid::{CandidType, Principal};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha224, Sha256};

/// Governance topics the vector keeps following in sync.
pub const TRACKED_TOPICS: [i32; 3] = [
    0,  // Unspecified (catch-all)
    4,  // Governance
    14, // SnsAndCommunityFund
];

pub const NEURON_STATE_LOCKED: i32 = 1;
pub const NEURON_STATE_DISSOLVING: i32 = 2;
pub const NEURON_STATE_UNLOCKED: i32 = 3;
pub const NEURON_STATE_SPAWNING: i32 = 4;

#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Debug, CandidType, Deserialize, Serialize)]
pub struct NeuronId {
    pub id: u64,
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub struct Followees {
    pub followees: Vec<NeuronId>,
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub enum DissolveState {
    DissolveDelaySeconds(u64),
    WhenDissolvedTimestampSeconds(u64),
}

/// The governance canister's full neuron record, restricted to the fields the
/// vector caches. Candid record subtyping lets the canister reply with more.
#[derive(Clone, Eq, PartialEq, Debug, Default, CandidType, Deserialize, Serialize)]
pub struct Neuron {
    pub id: Option<NeuronId>,
    pub cached_neuron_stake_e8s: u64,
    pub maturity_e8s_equivalent: u64,
    pub created_timestamp_seconds: u64,
    pub aging_since_timestamp_seconds: u64,
    pub spawn_at_timestamp_seconds: Option<u64>,
    pub dissolve_state: Option<DissolveState>,
    pub followees: Vec<(i32, Followees)>,
    pub deciding_voting_power: Option<u64>,
    pub potential_voting_power: Option<u64>,
    pub voting_power_refreshed_timestamp_seconds: Option<u64>,
}

impl Neuron {
    /// Dissolve delay remaining, in seconds.
    pub fn dissolve_delay_seconds(&self, now_seconds: u64) -> u64 {
        match self.dissolve_state {
            Some(DissolveState::DissolveDelaySeconds(d)) => d,
            Some(DissolveState::WhenDissolvedTimestampSeconds(ts)) => ts.saturating_sub(now_seconds),
            None => 0,
        }
    }

    /// The neuron lifecycle state as governance numbers it: 1 locked,
    /// 2 dissolving, 3 unlocked, 4 spawning.
    pub fn state(&self, now_seconds: u64) -> i32 {
        if self.spawn_at_timestamp_seconds.is_some() {
            return NEURON_STATE_SPAWNING;
        }
        match self.dissolve_state {
            Some(DissolveState::DissolveDelaySeconds(d)) if d > 0 => NEURON_STATE_LOCKED,
            Some(DissolveState::WhenDissolvedTimestampSeconds(ts)) if ts > now_seconds => {
                NEURON_STATE_DISSOLVING
            }
            _ => NEURON_STATE_UNLOCKED,
        }
    }

    pub fn age_seconds(&self, now_seconds: u64) -> u64 {
        now_seconds.saturating_sub(self.aging_since_timestamp_seconds)
    }
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub struct ListNeurons {
    pub neuron_ids: Vec<u64>,
    pub include_neurons_readable_by_caller: bool,
    pub include_empty_neurons_readable_by_caller: Option<bool>,
    pub include_public_neurons_in_full_neurons: Option<bool>,
    pub page_number: Option<u64>,
    pub page_size: Option<u64>,
}

impl ListNeurons {
    pub fn by_ids(neuron_ids: Vec<u64>) -> Self {
        Self {
            neuron_ids,
            include_neurons_readable_by_caller: false,
            include_empty_neurons_readable_by_caller: Some(true),
            include_public_neurons_in_full_neurons: Some(true),
            page_number: None,
            page_size: None,
        }
    }
}

#[derive(Clone, Eq, PartialEq, Debug, Default, CandidType, Deserialize, Serialize)]
pub struct ListNeuronsResponse {
    pub full_neurons: Vec<Neuron>,
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub struct ManageNeuron {
    pub id: Option<NeuronId>,
    pub neuron_id_or_subaccount: Option<NeuronIdOrSubaccount>,
    pub command: Option<Command>,
}

impl ManageNeuron {
    pub fn for_neuron(neuron_id: u64, command: Command) -> Self {
        Self {
            id: Some(NeuronId { id: neuron_id }),
            neuron_id_or_subaccount: None,
            command: Some(command),
        }
    }
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub enum NeuronIdOrSubaccount {
    Subaccount(serde_bytes::ByteBuf),
    NeuronId(NeuronId),
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub enum Command {
    Spawn(Spawn),
    Follow(Follow),
    Configure(Configure),
    Disburse(Disburse),
    ClaimOrRefresh(ClaimOrRefresh),
    RefreshVotingPower(RefreshVotingPower),
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub struct Spawn {
    pub new_controller: Option<Principal>,
    pub nonce: Option<u64>,
    pub percentage_to_spawn: Option<u32>,
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub struct Follow {
    pub topic: i32,
    pub followees: Vec<NeuronId>,
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub struct Configure {
    pub operation: Option<Operation>,
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub enum Operation {
    IncreaseDissolveDelay(IncreaseDissolveDelay),
    StartDissolving(StartDissolving),
    StopDissolving(StopDissolving),
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub struct IncreaseDissolveDelay {
    pub additional_dissolve_delay_seconds: u32,
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub struct StartDissolving {}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub struct StopDissolving {}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub struct Disburse {
    pub to_account: Option<AccountIdentifier>,
    pub amount: Option<Amount>,
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub struct AccountIdentifier {
    pub hash: serde_bytes::ByteBuf,
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub struct Amount {
    pub e8s: u64,
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub struct ClaimOrRefresh {
    pub by: Option<By>,
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub enum By {
    Memo(u64),
    MemoAndController(MemoAndController),
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub struct MemoAndController {
    pub memo: u64,
    pub controller: Option<Principal>,
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub struct RefreshVotingPower {}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub struct GovernanceError {
    pub error_type: i32,
    pub error_message: String,
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub struct ManageNeuronResponse {
    pub command: Option<CommandResponse>,
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub enum CommandResponse {
    Error(GovernanceError),
    Spawn(SpawnResponse),
    Follow(FollowResponse),
    Configure(ConfigureResponse),
    Disburse(DisburseResponse),
    ClaimOrRefresh(ClaimOrRefreshResponse),
    RefreshVotingPower(RefreshVotingPowerResponse),
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub struct SpawnResponse {
    pub created_neuron_id: Option<NeuronId>,
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub struct FollowResponse {}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub struct ConfigureResponse {}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub struct DisburseResponse {
    pub transfer_block_height: u64,
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub struct ClaimOrRefreshResponse {
    pub refreshed_neuron_id: Option<NeuronId>,
}

#[derive(Clone, Eq, PartialEq, Debug, CandidType, Deserialize, Serialize)]
pub struct RefreshVotingPowerResponse {}

/// The subaccount of the governance canister that holds a neuron's stake:
/// `sha256(0x0c . "neuron-stake" . controller . nonce)`.
pub fn neuron_staking_subaccount(controller: Principal, nonce: u64) -> [u8; 32] {
    const DOMAIN: &[u8] = b"neuron-stake";
    let mut hasher = Sha256::new();
    hasher.update([DOMAIN.len() as u8]);
    hasher.update(DOMAIN);
    hasher.update(controller.as_slice());
    hasher.update(nonce.to_be_bytes());
    hasher.finalize().into()
}

/// The ICP ledger account identifier (4-byte big-endian CRC32 checksum
/// followed by the 28-byte SHA-224 hash) for an ICRC-1 style account.
pub fn account_identifier(owner: Principal, subaccount: Option<[u8; 32]>) -> AccountIdentifier {
    let mut hasher = Sha224::new();
    hasher.update(b"\x0Aaccount-id");
    hasher.update(owner.as_slice());
    hasher.update(subaccount.unwrap_or([0u8; 32]));
    let hash: [u8; 28] = hasher.finalize().into();

    let mut bytes = Vec::with_capacity(32);
    bytes.extend_from_slice(&crc32(&hash).to_be_bytes());
    bytes.extend_from_slice(&hash);
    AccountIdentifier {
        hash: serde_bytes::ByteBuf::from(bytes),
    }
}

// IEEE 802.3 CRC-32, bitwise; the inputs are 28 bytes so a table buys nothing.
fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xffff_ffff;
    for byte in data {
        crc ^= *byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xedb8_8320 & mask);
        }
    }
    !crc
}
