//! World-state views handed to the execution engine.
//!
//! Two interchangeable implementations satisfy the [`StateDb`] contract: an
//! eager in-memory journal ([`in_memory::InMemoryStateDb`]) and a
//! read-through overlay over the immutable recorded input allocation
//! ([`off_chain::OffTheChainStateDb`]). Both share the reverse-operation
//! journal of [`journal`] and the per-transaction scratch state defined
//! here. A state database lives for exactly one replay task and is never
//! shared between workers.

use std::collections::{HashMap, HashSet};

use alloy_primitives::{Address, B256, Bytes, Log, U256, b256};

use crate::substate::SubstateAlloc;

pub mod in_memory;
pub mod journal;
pub mod off_chain;

pub use in_memory::InMemoryStateDb;
pub use off_chain::OffTheChainStateDb;

/// Keccak-256 hash of the empty byte sequence, the code hash of every
/// account without code.
pub const EMPTY_CODE_HASH: B256 =
    b256!("c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470");

/// The execution engine's view of world-state.
///
/// The operation set is exactly what the replay engine and its interpreter
/// invoke: account queries, mutations, per-transaction bookkeeping (logs,
/// refund counter, access list), the snapshot stack, and end-of-transaction
/// settlement. Mutations record every account they modify in a touched set;
/// read-only probes must not. [`StateDb::get_substate_post_alloc`] is built
/// from that touched set and is the value compared against the recording.
pub trait StateDb {
    /// Returns true if the account exists in the current state.
    fn exist(&self, address: Address) -> bool;

    /// Returns true if the account is absent or empty (zero nonce, zero
    /// balance, no code).
    fn empty(&self, address: Address) -> bool;

    /// Explicitly creates a state object. If an account with the address
    /// already existed its balance is carried over to the new account.
    fn create_account(&mut self, address: Address);

    fn get_balance(&self, address: Address) -> U256;
    fn add_balance(&mut self, address: Address, amount: U256);
    fn sub_balance(&mut self, address: Address, amount: U256);

    fn get_nonce(&self, address: Address) -> u64;
    fn set_nonce(&mut self, address: Address, nonce: u64);

    fn get_code(&self, address: Address) -> Bytes;
    /// Code hash of the account: zero for a missing account,
    /// [`EMPTY_CODE_HASH`] for an existing account without code.
    fn get_code_hash(&self, address: Address) -> B256;
    fn get_code_size(&self, address: Address) -> usize;
    fn set_code(&mut self, address: Address, code: Bytes);

    /// Current value of a storage slot; absent slots read as zero.
    fn get_storage(&self, address: Address, key: B256) -> B256;
    /// Value of the slot at the last finalise boundary.
    fn get_committed_storage(&self, address: Address, key: B256) -> B256;
    fn set_storage(&mut self, address: Address, key: B256, value: B256);

    /// Marks the account for deletion at the next finalise and zeroes its
    /// balance immediately. Returns false if the account does not exist.
    fn suicide(&mut self, address: Address) -> bool;

    fn add_log(&mut self, log: Log);
    /// Logs emitted by the transaction identified by `tx_hash`, in emission
    /// order.
    fn get_logs(&self, tx_hash: B256, block_hash: B256) -> Vec<Log>;

    fn add_refund(&mut self, gas: u64);
    fn sub_refund(&mut self, gas: u64);
    fn get_refund(&self) -> u64;

    fn address_in_access_list(&self, address: Address) -> bool;
    /// Returns `(address_present, slot_present)`.
    fn slot_in_access_list(&self, address: Address, slot: B256) -> (bool, bool);
    fn add_address_to_access_list(&mut self, address: Address);
    fn add_slot_to_access_list(&mut self, address: Address, slot: B256);

    /// Resets the per-transaction fields (logs, refund counter, access
    /// list, journal) and records the transaction identity. Committed state
    /// is left untouched.
    fn prepare(&mut self, tx_hash: B256, tx_index: u32);

    /// Pushes a revert point onto the snapshot stack.
    fn snapshot(&mut self) -> usize;
    /// Discards every journaled mutation made after snapshot `id` was
    /// taken.
    fn revert_to_snapshot(&mut self, id: usize);

    /// End-of-transaction settlement: removes self-destructed accounts
    /// (and, if `delete_empty`, empty touched accounts) and folds the
    /// journal into committed state.
    fn finalise(&mut self, delete_empty: bool);
    /// Identical settlement boundary to [`StateDb::finalise`]; no state
    /// root is computed in this model.
    fn intermediate_root(&mut self, delete_empty: bool);

    /// Final state of every account touched during the transaction.
    /// Accounts marked for deletion are absent; zero-valued storage slots
    /// are never materialized.
    fn get_substate_post_alloc(&self) -> SubstateAlloc;
}

/// EIP-2930 access list tracked per transaction.
#[derive(Debug, Default, Clone)]
pub(crate) struct AccessList {
    entries: HashMap<Address, HashSet<B256>>,
}

impl AccessList {
    pub(crate) fn contains_address(&self, address: Address) -> bool {
        self.entries.contains_key(&address)
    }

    pub(crate) fn contains(&self, address: Address, slot: B256) -> (bool, bool) {
        match self.entries.get(&address) {
            Some(slots) => (true, slots.contains(&slot)),
            None => (false, false),
        }
    }

    /// Returns true if the address was not already present.
    pub(crate) fn add_address(&mut self, address: Address) -> bool {
        match self.entries.entry(address) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(HashSet::new());
                true
            }
        }
    }

    /// Returns `(address_added, slot_added)`.
    pub(crate) fn add_slot(&mut self, address: Address, slot: B256) -> (bool, bool) {
        let address_added = self.add_address(address);
        let slot_added = self.entries.entry(address).or_default().insert(slot);
        (address_added, slot_added)
    }

    pub(crate) fn remove_address(&mut self, address: Address) {
        self.entries.remove(&address);
    }

    pub(crate) fn remove_slot(&mut self, address: Address, slot: B256) {
        if let Some(slots) = self.entries.get_mut(&address) {
            slots.remove(&slot);
        }
    }
}

/// Per-transaction bookkeeping shared by both state database variants:
/// transaction identity, emitted logs, the gas refund counter, and the
/// access list. Cleared by `prepare`.
#[derive(Debug, Default)]
pub(crate) struct TxScratch {
    tx_hash: B256,
    refund: u64,
    logs: Vec<Log>,
    pub(crate) access_list: AccessList,
}

impl TxScratch {
    pub(crate) fn prepare(&mut self, tx_hash: B256) {
        *self = Self {
            tx_hash,
            ..Self::default()
        };
    }

    pub(crate) fn add_log(&mut self, log: Log) {
        self.logs.push(log);
    }

    pub(crate) fn logs_for(&self, tx_hash: B256) -> Vec<Log> {
        if tx_hash == self.tx_hash {
            self.logs.clone()
        } else {
            Vec::new()
        }
    }

    pub(crate) fn refund(&self) -> u64 {
        self.refund
    }

    pub(crate) fn add_refund(&mut self, gas: u64) {
        self.refund += gas;
    }

    pub(crate) fn sub_refund(&mut self, gas: u64) {
        debug_assert!(gas <= self.refund, "refund counter below zero");
        self.refund = self.refund.saturating_sub(gas);
    }

    // Journal undo helpers shared by both variants.

    pub(crate) fn undo_refund(&mut self, prev: u64) {
        self.refund = prev;
    }

    pub(crate) fn undo_log(&mut self) {
        self.logs.pop();
    }

    pub(crate) fn undo_access_address(&mut self, address: Address) {
        self.access_list.remove_address(address);
    }

    pub(crate) fn undo_access_slot(&mut self, address: Address, slot: B256) {
        self.access_list.remove_slot(address, slot);
    }
}
