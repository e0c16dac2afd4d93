//! Reverse-operation journal shared by the state database variants.
//!
//! Every mutation appends the entry that undoes it. A snapshot is the
//! journal length at the time it was taken; reverting to snapshot `h`
//! unwinds entries from the top until the journal is `h` entries long.
//! The account payload type is generic because the two variants represent
//! accounts differently (materialized entries vs. baseline overlays); the
//! remaining entries are undone identically through
//! [`TxScratch`](super::TxScratch).

use alloy_primitives::{Address, B256, Bytes, U256};

/// One undoable mutation. `A` is the variant-specific account
/// representation restored by [`JournalEntry::AccountChange`].
#[derive(Debug)]
pub(crate) enum JournalEntry<A> {
    /// An account object was created or replaced; `prev` restores the
    /// previous object (or removes the new one entirely).
    AccountChange {
        address: Address,
        prev: Option<Box<A>>,
    },
    /// The account entered the touched set for the first time.
    Touched { address: Address },
    BalanceChange {
        address: Address,
        prev: U256,
    },
    NonceChange {
        address: Address,
        prev: u64,
    },
    CodeChange {
        address: Address,
        prev: Bytes,
    },
    /// A storage slot was written. `had_committed` tells whether the
    /// per-transaction committed-value capture for the slot predates this
    /// write; if not, the capture is discarded on revert.
    StorageChange {
        address: Address,
        key: B256,
        prev: B256,
        had_committed: bool,
    },
    /// The account was marked self-destructed; restores mark and balance.
    SuicideChange {
        address: Address,
        prev_marked: bool,
        prev_balance: U256,
    },
    RefundChange {
        prev: u64,
    },
    LogAppended,
    AccessListAddress {
        address: Address,
    },
    AccessListSlot {
        address: Address,
        key: B256,
    },
}
