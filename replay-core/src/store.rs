//! Embedded substate database.
//!
//! Substates live in a single redb table keyed by `(block, tx)`; the tuple
//! key ordering of redb gives the block-ascending, tx-ascending iteration
//! the task pool relies on. Values are the bincode-encoded [`Substate`]
//! records. The database is written once by the upstream recorder and read
//! concurrently by replay workers; a range cursor yields raw value bytes so
//! that decoding can happen on the worker thread.

use redb::{Database, ReadOnlyTable, TableDefinition};
use thiserror::Error;

use crate::substate::Substate;

/// Recorded transaction substates.
///
/// **Schema:** Maps (BlockNumber, TxIndex) as (u64, u32) to the encoded
/// substate record (Vec<u8>).
const SUBSTATES: TableDefinition<(u64, u32), Vec<u8>> = TableDefinition::new("substates");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("substate database: {0}")]
    Database(String),

    #[error("block {block} tx {tx}: malformed substate record: {reason}")]
    Decode { block: u64, tx: u32, reason: String },

    #[error("failed to encode substate record: {0}")]
    Encode(String),
}

// Fold the individual redb error types into StoreError::Database.
macro_rules! impl_store_error_from {
    ($($error_type:ty),*) => {
        $(
            impl From<$error_type> for StoreError {
                fn from(err: $error_type) -> Self {
                    Self::Database(err.to_string())
                }
            }
        )*
    };
}

impl_store_error_from!(
    redb::Error,
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError
);

type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Handle to the substate key-value store.
///
/// A single handle is shared across all replay workers; reads go through
/// independent read transactions and never block each other.
pub struct SubstateDb {
    database: Database,
}

impl SubstateDb {
    /// Creates a new substate database or opens an existing one for
    /// recording. The substate table is initialized if absent.
    pub fn open(db_path: impl AsRef<std::path::Path>) -> Result<Self> {
        let database = Database::create(db_path)?;

        let write_txn = database.begin_write()?;
        {
            let _substates = write_txn.open_table(SUBSTATES)?;
        }
        write_txn.commit()?;

        Ok(Self { database })
    }

    /// Opens an existing substate database for replay. Fails if the file
    /// does not exist; the handle is only ever used for read transactions.
    pub fn open_read_only(db_path: impl AsRef<std::path::Path>) -> Result<Self> {
        let database = Database::open(db_path)?;
        Ok(Self { database })
    }

    /// Stores the substate recorded for `(block, tx)`.
    pub fn put_substate(&self, block: u64, tx: u32, substate: &Substate) -> Result<()> {
        let encoded = substate
            .encode()
            .map_err(|e| StoreError::Encode(e.to_string()))?;

        let write_txn = self.database.begin_write()?;
        {
            let mut substates = write_txn.open_table(SUBSTATES)?;
            substates.insert((block, tx), encoded)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Loads and decodes a single substate, if present.
    pub fn get_substate(&self, block: u64, tx: u32) -> Result<Option<Substate>> {
        let read_txn = self.database.begin_read()?;
        let substates = read_txn.open_table(SUBSTATES)?;

        substates
            .get((block, tx))?
            .map(|guard| RawSubstate::new(block, tx, guard.value()).decode())
            .transpose()
    }

    /// Returns a cursor over every substate in the inclusive block range,
    /// ordered by `(block, tx)` ascending. The cursor yields raw record
    /// bytes; callers decode them with [`RawSubstate::decode`].
    pub fn range(&self, first_block: u64, last_block: u64) -> Result<SubstateRange> {
        let read_txn = self.database.begin_read()?;
        let substates = read_txn.open_table(SUBSTATES)?;

        Ok(SubstateRange {
            table: substates,
            next_key: Some((first_block, 0)),
            last_block,
        })
    }
}

/// An undecoded substate record pulled from the store.
#[derive(Debug, Clone)]
pub struct RawSubstate {
    pub block: u64,
    pub tx: u32,
    pub bytes: Vec<u8>,
}

impl RawSubstate {
    pub fn new(block: u64, tx: u32, bytes: Vec<u8>) -> Self {
        Self { block, tx, bytes }
    }

    /// Decodes the record, attributing failures to `(block, tx)`.
    pub fn decode(&self) -> Result<Substate> {
        Substate::decode(&self.bytes).map_err(|e| StoreError::Decode {
            block: self.block,
            tx: self.tx,
            reason: e.to_string(),
        })
    }
}

/// Forward cursor over a block range of the substate table.
///
/// The cursor re-seeks from the last yielded key on every step instead of
/// holding a live range across calls, which keeps it self-contained and
/// movable into the producer thread of the task pool.
pub struct SubstateRange {
    table: ReadOnlyTable<(u64, u32), Vec<u8>>,
    next_key: Option<(u64, u32)>,
    last_block: u64,
}

impl SubstateRange {
    fn seek(&mut self) -> Result<Option<RawSubstate>> {
        let Some(start) = self.next_key else {
            return Ok(None);
        };

        let end = (self.last_block, u32::MAX);
        if start > end {
            self.next_key = None;
            return Ok(None);
        }
        let mut range = self.table.range(start..=end)?;
        let Some(entry) = range.next() else {
            self.next_key = None;
            return Ok(None);
        };

        let (key_guard, value_guard) = entry?;
        let (block, tx) = key_guard.value();
        self.next_key = match tx.checked_add(1) {
            Some(next_tx) => Some((block, next_tx)),
            None => block.checked_add(1).map(|next_block| (next_block, 0)),
        };

        Ok(Some(RawSubstate::new(block, tx, value_guard.value())))
    }
}

impl Iterator for SubstateRange {
    type Item = Result<RawSubstate>;

    fn next(&mut self) -> Option<Self::Item> {
        self.seek().transpose()
    }
}
