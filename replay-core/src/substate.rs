//! Substate record types and their binary codec.
//!
//! A substate is a self-contained recording of one historical transaction:
//! the world-state fragment it read or wrote before execution, the block
//! environment it ran under, the message itself, and the post-execution
//! state and receipt. Records are produced by an upstream recorder, stored
//! in the substate database, and consumed exactly once per replay task.
//!
//! All mappings use `BTreeMap` so that serialization and diff iteration are
//! deterministic regardless of insertion order.

use std::collections::BTreeMap;

use alloy_primitives::{Address, B256, Bloom, Bytes, Log, U256};
use serde::{Deserialize, Serialize};

/// One account of a recorded allocation.
///
/// An absent storage key is equivalent to a zero value; zero-valued slots
/// are never materialized in a record.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubstateAccount {
    pub nonce: u64,
    pub balance: U256,
    pub code: Bytes,
    pub storage: BTreeMap<B256, B256>,
}

impl SubstateAccount {
    /// Creates an account with the given scalar fields and no storage.
    pub fn new(nonce: u64, balance: U256, code: Bytes) -> Self {
        Self {
            nonce,
            balance,
            code,
            storage: BTreeMap::new(),
        }
    }

    /// Returns true if the account is empty in the EIP-161 sense:
    /// zero nonce, zero balance, and no code.
    pub fn is_empty(&self) -> bool {
        self.nonce == 0 && self.balance.is_zero() && self.code.is_empty()
    }
}

/// Mapping from address to account state. No duplicate addresses.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubstateAlloc(pub BTreeMap<Address, SubstateAccount>);

impl SubstateAlloc {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, address: Address, account: SubstateAccount) {
        self.0.insert(address, account);
    }

    pub fn get(&self, address: &Address) -> Option<&SubstateAccount> {
        self.0.get(address)
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.0.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Address, &SubstateAccount)> {
        self.0.iter()
    }

    pub fn addresses(&self) -> impl Iterator<Item = &Address> {
        self.0.keys()
    }
}

impl FromIterator<(Address, SubstateAccount)> for SubstateAlloc {
    fn from_iter<I: IntoIterator<Item = (Address, SubstateAccount)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Recorded block environment of a transaction.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEnv {
    pub coinbase: Address,
    pub number: u64,
    pub timestamp: u64,
    pub difficulty: U256,
    pub gas_limit: u64,
    /// Post-1559 per-block fee floor, recorded verbatim. Enforcement is
    /// disabled during replay.
    pub base_fee: Option<U256>,
    /// Lookup table for the BLOCKHASH opcode. Only the entries the recorded
    /// transaction actually referenced are populated.
    pub block_hashes: BTreeMap<u64, B256>,
}

/// One entry of an EIP-2930 access list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessListItem {
    pub address: Address,
    pub storage_keys: Vec<B256>,
}

/// The recorded transaction as presented to the execution engine.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub from: Address,
    /// Absent for contract creation.
    pub to: Option<Address>,
    pub nonce: u64,
    pub gas_limit: u64,
    pub gas_price: U256,
    pub gas_fee_cap: Option<U256>,
    pub gas_tip_cap: Option<U256>,
    pub value: U256,
    pub data: Bytes,
    pub access_list: Vec<AccessListItem>,
}

impl Message {
    /// Classifies the message for the skip filters of the task pool.
    pub fn kind(&self) -> MessageKind {
        match &self.to {
            None => MessageKind::Create,
            Some(_) if self.data.is_empty() => MessageKind::Transfer,
            Some(_) => MessageKind::Call,
        }
    }
}

/// Coarse transaction classification used by the task pool skip filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Recipient present, empty calldata.
    Transfer,
    /// Recipient present, non-empty calldata.
    Call,
    /// No recipient: contract creation.
    Create,
}

/// Execution status of a recorded or replayed message.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiptStatus {
    #[default]
    Success,
    Failed,
}

impl std::fmt::Display for ReceiptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReceiptStatus::Success => f.write_str("Success"),
            ReceiptStatus::Failed => f.write_str("Failed"),
        }
    }
}

/// Result of applying one message: the fields compared between a recording
/// and its replay. Log order is significant.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub status: ReceiptStatus,
    pub gas_used: u64,
    pub bloom: Bloom,
    pub logs: Vec<Log>,
    /// Set whenever the message was a contract creation.
    pub contract_address: Option<Address>,
}

/// Aggregates the 2048-bit bloom filter over a sequence of logs.
pub fn logs_bloom<'a>(logs: impl IntoIterator<Item = &'a Log>) -> Bloom {
    let mut bloom = Bloom::default();
    for log in logs {
        bloom.accrue_log(log);
    }
    bloom
}

/// A self-contained pre/post snapshot of one historical transaction.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Substate {
    /// Every account the transaction reads or writes, pre-execution.
    pub input_alloc: SubstateAlloc,
    pub env: BlockEnv,
    pub message: Message,
    /// Post-execution state of every touched account.
    pub output_alloc: SubstateAlloc,
    pub output_result: Receipt,
}

impl Substate {
    /// Serializes the record with the store codec.
    pub fn encode(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::serde::encode_to_vec(self, bincode::config::legacy())
    }

    /// Deserializes a record previously produced by [`Substate::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        let (substate, _) = bincode::serde::decode_from_slice(bytes, bincode::config::legacy())?;
        Ok(substate)
    }
}
