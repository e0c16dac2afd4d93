//! Read-through "off-the-chain" state database.
//!
//! The recorded input allocation is kept as an immutable baseline; every
//! mutation lives in an overlay keyed by address, with a tri-state per
//! scalar field. Reads fall through to the baseline wherever the overlay is
//! `Unchanged`. Snapshots journal the overlay exactly like the in-memory
//! variant journals its account map, so the two are interchangeable behind
//! the [`StateDb`] contract.

use std::collections::{BTreeMap, HashMap, HashSet, hash_map::Entry};

use alloy_primitives::{Address, B256, Bytes, Log, U256, keccak256};

use crate::{
    state::{EMPTY_CODE_HASH, StateDb, TxScratch, journal::JournalEntry},
    substate::{SubstateAccount, SubstateAlloc},
};

/// Overlay state of one scalar account field.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Field<T> {
    /// Reads fall through to the baseline.
    Unchanged,
    Overwritten(T),
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Field::Unchanged
    }
}

/// Per-account overlay: written fields, written slots, and lifecycle marks.
#[derive(Debug, Default, Clone)]
struct OverlayAccount {
    nonce: Field<u64>,
    balance: Field<U256>,
    code: Field<Bytes>,
    storage: HashMap<B256, B256>,
    /// Pre-transaction slot values, captured on first write. Cleared at the
    /// finalise boundary.
    committed: HashMap<B256, B256>,
    /// The baseline account is fully shadowed by a fresh object.
    created: bool,
    suicided: bool,
    /// Removed at a finalise boundary; the baseline is no longer visible.
    deleted: bool,
}

/// State database layering a mutable overlay over the immutable recorded
/// input allocation.
pub struct OffTheChainStateDb {
    baseline: SubstateAlloc,
    overlay: HashMap<Address, OverlayAccount>,
    touched: HashSet<Address>,
    journal: Vec<JournalEntry<OverlayAccount>>,
    scratch: TxScratch,
}

impl OffTheChainStateDb {
    /// Builds the state database around the recorded input allocation.
    pub fn new(baseline: SubstateAlloc) -> Self {
        Self {
            baseline,
            overlay: HashMap::new(),
            touched: HashSet::new(),
            journal: Vec::new(),
            scratch: TxScratch::default(),
        }
    }

    fn touch(&mut self, address: Address) {
        if self.touched.insert(address) {
            self.journal.push(JournalEntry::Touched { address });
        }
    }

    /// Materializes an overlay entry (journaling the materialization) and
    /// returns it together with the journal, split-borrowed.
    fn overlay_mut(
        &mut self,
        address: Address,
    ) -> (&mut OverlayAccount, &mut Vec<JournalEntry<OverlayAccount>>) {
        let Self {
            overlay, journal, ..
        } = self;
        let entry = match overlay.entry(address) {
            Entry::Occupied(occupied) => occupied.into_mut(),
            Entry::Vacant(vacant) => {
                journal.push(JournalEntry::AccountChange {
                    address,
                    prev: None,
                });
                vacant.insert(OverlayAccount::default())
            }
        };
        (entry, journal)
    }

    fn baseline_account(&self, address: Address) -> Option<&SubstateAccount> {
        self.baseline.get(&address)
    }

    fn nonce_of(&self, address: Address) -> u64 {
        match self.overlay.get(&address) {
            Some(o) if o.deleted => 0,
            Some(o) => match &o.nonce {
                Field::Overwritten(nonce) => *nonce,
                Field::Unchanged if o.created => 0,
                Field::Unchanged => self.baseline_account(address).map(|a| a.nonce).unwrap_or(0),
            },
            None => self.baseline_account(address).map(|a| a.nonce).unwrap_or(0),
        }
    }

    fn balance_of(&self, address: Address) -> U256 {
        match self.overlay.get(&address) {
            Some(o) if o.deleted => U256::ZERO,
            Some(o) => match &o.balance {
                Field::Overwritten(balance) => *balance,
                Field::Unchanged if o.created => U256::ZERO,
                Field::Unchanged => self
                    .baseline_account(address)
                    .map(|a| a.balance)
                    .unwrap_or_default(),
            },
            None => self
                .baseline_account(address)
                .map(|a| a.balance)
                .unwrap_or_default(),
        }
    }

    fn code_of(&self, address: Address) -> Bytes {
        match self.overlay.get(&address) {
            Some(o) if o.deleted => Bytes::new(),
            Some(o) => match &o.code {
                Field::Overwritten(code) => code.clone(),
                Field::Unchanged if o.created => Bytes::new(),
                Field::Unchanged => self
                    .baseline_account(address)
                    .map(|a| a.code.clone())
                    .unwrap_or_default(),
            },
            None => self
                .baseline_account(address)
                .map(|a| a.code.clone())
                .unwrap_or_default(),
        }
    }

    fn storage_of(&self, address: Address, key: B256) -> B256 {
        if let Some(o) = self.overlay.get(&address) {
            if o.deleted {
                return B256::ZERO;
            }
            if let Some(value) = o.storage.get(&key) {
                return *value;
            }
            if o.created {
                return B256::ZERO;
            }
        }
        self.baseline_account(address)
            .and_then(|a| a.storage.get(&key).copied())
            .unwrap_or_default()
    }
}

impl StateDb for OffTheChainStateDb {
    fn exist(&self, address: Address) -> bool {
        match self.overlay.get(&address) {
            Some(o) => !o.deleted,
            None => self.baseline.contains(&address),
        }
    }

    fn empty(&self, address: Address) -> bool {
        self.nonce_of(address) == 0
            && self.balance_of(address).is_zero()
            && self.code_of(address).is_empty()
    }

    fn create_account(&mut self, address: Address) {
        self.touch(address);
        let carried_balance = self.balance_of(address);
        let prev = self.overlay.remove(&address);
        self.journal.push(JournalEntry::AccountChange {
            address,
            prev: prev.map(Box::new),
        });
        self.overlay.insert(
            address,
            OverlayAccount {
                created: true,
                balance: Field::Overwritten(carried_balance),
                ..OverlayAccount::default()
            },
        );
    }

    fn get_balance(&self, address: Address) -> U256 {
        self.balance_of(address)
    }

    fn add_balance(&mut self, address: Address, amount: U256) {
        self.touch(address);
        let prev = self.balance_of(address);
        let (o, journal) = self.overlay_mut(address);
        journal.push(JournalEntry::BalanceChange { address, prev });
        o.balance = Field::Overwritten(prev + amount);
    }

    fn sub_balance(&mut self, address: Address, amount: U256) {
        self.touch(address);
        let prev = self.balance_of(address);
        let (o, journal) = self.overlay_mut(address);
        journal.push(JournalEntry::BalanceChange { address, prev });
        o.balance = Field::Overwritten(prev.saturating_sub(amount));
    }

    fn get_nonce(&self, address: Address) -> u64 {
        self.nonce_of(address)
    }

    fn set_nonce(&mut self, address: Address, nonce: u64) {
        self.touch(address);
        let prev = self.nonce_of(address);
        let (o, journal) = self.overlay_mut(address);
        journal.push(JournalEntry::NonceChange { address, prev });
        o.nonce = Field::Overwritten(nonce);
    }

    fn get_code(&self, address: Address) -> Bytes {
        self.code_of(address)
    }

    fn get_code_hash(&self, address: Address) -> B256 {
        if !self.exist(address) {
            return B256::ZERO;
        }
        let code = self.code_of(address);
        if code.is_empty() {
            EMPTY_CODE_HASH
        } else {
            keccak256(&code)
        }
    }

    fn get_code_size(&self, address: Address) -> usize {
        self.code_of(address).len()
    }

    fn set_code(&mut self, address: Address, code: Bytes) {
        self.touch(address);
        let prev = self.code_of(address);
        let (o, journal) = self.overlay_mut(address);
        journal.push(JournalEntry::CodeChange { address, prev });
        o.code = Field::Overwritten(code);
    }

    fn get_storage(&self, address: Address, key: B256) -> B256 {
        self.storage_of(address, key)
    }

    fn get_committed_storage(&self, address: Address, key: B256) -> B256 {
        if let Some(o) = self.overlay.get(&address)
            && let Some(committed) = o.committed.get(&key)
        {
            return *committed;
        }
        self.storage_of(address, key)
    }

    fn set_storage(&mut self, address: Address, key: B256, value: B256) {
        self.touch(address);
        let prev = self.storage_of(address, key);
        let (o, journal) = self.overlay_mut(address);
        let had_committed = o.committed.contains_key(&key);
        if !had_committed {
            o.committed.insert(key, prev);
        }
        journal.push(JournalEntry::StorageChange {
            address,
            key,
            prev,
            had_committed,
        });
        o.storage.insert(key, value);
    }

    fn suicide(&mut self, address: Address) -> bool {
        if !self.exist(address) {
            return false;
        }
        self.touch(address);
        let prev_balance = self.balance_of(address);
        let (o, journal) = self.overlay_mut(address);
        journal.push(JournalEntry::SuicideChange {
            address,
            prev_marked: o.suicided,
            prev_balance,
        });
        o.suicided = true;
        o.balance = Field::Overwritten(U256::ZERO);
        true
    }

    fn add_log(&mut self, log: Log) {
        self.journal.push(JournalEntry::LogAppended);
        self.scratch.add_log(log);
    }

    fn get_logs(&self, tx_hash: B256, _block_hash: B256) -> Vec<Log> {
        self.scratch.logs_for(tx_hash)
    }

    fn add_refund(&mut self, gas: u64) {
        self.journal.push(JournalEntry::RefundChange {
            prev: self.scratch.refund(),
        });
        self.scratch.add_refund(gas);
    }

    fn sub_refund(&mut self, gas: u64) {
        self.journal.push(JournalEntry::RefundChange {
            prev: self.scratch.refund(),
        });
        self.scratch.sub_refund(gas);
    }

    fn get_refund(&self) -> u64 {
        self.scratch.refund()
    }

    fn address_in_access_list(&self, address: Address) -> bool {
        self.scratch.access_list.contains_address(address)
    }

    fn slot_in_access_list(&self, address: Address, slot: B256) -> (bool, bool) {
        self.scratch.access_list.contains(address, slot)
    }

    fn add_address_to_access_list(&mut self, address: Address) {
        if self.scratch.access_list.add_address(address) {
            self.journal.push(JournalEntry::AccessListAddress { address });
        }
    }

    fn add_slot_to_access_list(&mut self, address: Address, slot: B256) {
        let (address_added, slot_added) = self.scratch.access_list.add_slot(address, slot);
        if address_added {
            self.journal.push(JournalEntry::AccessListAddress { address });
        }
        if slot_added {
            self.journal.push(JournalEntry::AccessListSlot { address, key: slot });
        }
    }

    fn prepare(&mut self, tx_hash: B256, _tx_index: u32) {
        self.scratch.prepare(tx_hash);
        self.journal.clear();
    }

    fn snapshot(&mut self) -> usize {
        self.journal.len()
    }

    fn revert_to_snapshot(&mut self, id: usize) {
        while self.journal.len() > id {
            let Some(entry) = self.journal.pop() else {
                break;
            };
            match entry {
                JournalEntry::AccountChange { address, prev } => match prev {
                    Some(prev) => {
                        self.overlay.insert(address, *prev);
                    }
                    None => {
                        self.overlay.remove(&address);
                    }
                },
                JournalEntry::Touched { address } => {
                    self.touched.remove(&address);
                }
                JournalEntry::BalanceChange { address, prev } => {
                    if let Some(o) = self.overlay.get_mut(&address) {
                        o.balance = Field::Overwritten(prev);
                    }
                }
                JournalEntry::NonceChange { address, prev } => {
                    if let Some(o) = self.overlay.get_mut(&address) {
                        o.nonce = Field::Overwritten(prev);
                    }
                }
                JournalEntry::CodeChange { address, prev } => {
                    if let Some(o) = self.overlay.get_mut(&address) {
                        o.code = Field::Overwritten(prev);
                    }
                }
                JournalEntry::StorageChange {
                    address,
                    key,
                    prev,
                    had_committed,
                } => {
                    if let Some(o) = self.overlay.get_mut(&address) {
                        o.storage.insert(key, prev);
                        if !had_committed {
                            o.committed.remove(&key);
                        }
                    }
                }
                JournalEntry::SuicideChange {
                    address,
                    prev_marked,
                    prev_balance,
                } => {
                    if let Some(o) = self.overlay.get_mut(&address) {
                        o.suicided = prev_marked;
                        o.balance = Field::Overwritten(prev_balance);
                    }
                }
                JournalEntry::RefundChange { prev } => self.scratch.undo_refund(prev),
                JournalEntry::LogAppended => self.scratch.undo_log(),
                JournalEntry::AccessListAddress { address } => {
                    self.scratch.undo_access_address(address)
                }
                JournalEntry::AccessListSlot { address, key } => {
                    self.scratch.undo_access_slot(address, key)
                }
            }
        }
    }

    fn finalise(&mut self, delete_empty: bool) {
        let touched: Vec<Address> = self.touched.iter().copied().collect();
        for address in touched {
            let is_empty = self.empty(address);
            let Some(o) = self.overlay.get_mut(&address) else {
                continue;
            };
            if o.suicided || (delete_empty && is_empty) {
                *o = OverlayAccount {
                    deleted: true,
                    ..OverlayAccount::default()
                };
            }
        }
        for o in self.overlay.values_mut() {
            o.committed.clear();
        }
        self.journal.clear();
    }

    fn intermediate_root(&mut self, delete_empty: bool) {
        self.finalise(delete_empty);
    }

    fn get_substate_post_alloc(&self) -> SubstateAlloc {
        let mut alloc = SubstateAlloc::new();
        for address in &self.touched {
            let overlay = self.overlay.get(address);
            if overlay.map(|o| o.deleted).unwrap_or(false) {
                continue;
            }

            let mut account = SubstateAccount::new(
                self.nonce_of(*address),
                self.balance_of(*address),
                self.code_of(*address),
            );

            let created = overlay.map(|o| o.created).unwrap_or(false);
            let mut merged: BTreeMap<B256, B256> = BTreeMap::new();
            if !created && let Some(base) = self.baseline_account(*address) {
                merged.extend(base.storage.iter().map(|(k, v)| (*k, *v)));
            }
            if let Some(o) = overlay {
                merged.extend(o.storage.iter().map(|(k, v)| (*k, *v)));
            }
            merged.retain(|_, value| !value.is_zero());
            account.storage = merged;

            alloc.insert(*address, account);
        }
        alloc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::InMemoryStateDb;

    fn addr(byte: u8) -> Address {
        Address::repeat_byte(byte)
    }

    fn key(byte: u8) -> B256 {
        B256::repeat_byte(byte)
    }

    fn input_alloc() -> SubstateAlloc {
        let mut input = SubstateAlloc::new();
        let mut account =
            SubstateAccount::new(5, U256::from(1_000u64), Bytes::from_static(&[0x60, 0x00]));
        account.storage.insert(key(0x01), key(0xaa));
        input.insert(addr(0x0a), account);
        input.insert(
            addr(0x0b),
            SubstateAccount::new(0, U256::from(50u64), Bytes::new()),
        );
        input
    }

    fn seeded() -> OffTheChainStateDb {
        OffTheChainStateDb::new(input_alloc())
    }

    #[test]
    fn reads_fall_through_to_baseline() {
        let db = seeded();
        assert!(db.exist(addr(0x0a)));
        assert!(!db.exist(addr(0xcc)));
        assert_eq!(db.get_balance(addr(0x0a)), U256::from(1_000u64));
        assert_eq!(db.get_nonce(addr(0x0a)), 5);
        assert_eq!(db.get_storage(addr(0x0a), key(0x01)), key(0xaa));
        assert_eq!(db.get_storage(addr(0x0a), key(0x02)), B256::ZERO);
        assert_eq!(db.get_code(addr(0x0a)), Bytes::from_static(&[0x60, 0x00]));
        assert_eq!(db.get_code_hash(addr(0x0b)), EMPTY_CODE_HASH);
        assert_eq!(db.get_code_hash(addr(0xcc)), B256::ZERO);

        assert!(db.get_substate_post_alloc().is_empty());
    }

    #[test]
    fn overlay_shadows_baseline_without_mutating_it() {
        let mut db = seeded();

        db.set_nonce(addr(0x0a), 6);
        db.set_storage(addr(0x0a), key(0x01), key(0xbb));

        assert_eq!(db.get_nonce(addr(0x0a)), 6);
        assert_eq!(db.get_storage(addr(0x0a), key(0x01)), key(0xbb));
        // The recorded baseline itself is untouched.
        assert_eq!(
            db.baseline.get(&addr(0x0a)).unwrap().storage[&key(0x01)],
            key(0xaa)
        );
    }

    #[test]
    fn revert_restores_the_baseline_view() {
        let mut db = seeded();
        let snapshot = db.snapshot();

        db.set_nonce(addr(0x0a), 6);
        db.set_storage(addr(0x0a), key(0x01), key(0xbb));
        db.sub_balance(addr(0x0a), U256::from(100u64));
        db.revert_to_snapshot(snapshot);

        assert_eq!(db.get_nonce(addr(0x0a)), 5);
        assert_eq!(db.get_storage(addr(0x0a), key(0x01)), key(0xaa));
        assert_eq!(db.get_balance(addr(0x0a)), U256::from(1_000u64));
        assert!(db.get_substate_post_alloc().is_empty());
    }

    #[test]
    fn reverted_writes_to_fresh_addresses_leave_no_account() {
        let mut db = seeded();
        let snapshot = db.snapshot();

        db.add_balance(addr(0xcc), U256::from(7u64));
        assert!(db.exist(addr(0xcc)));

        db.revert_to_snapshot(snapshot);
        assert!(!db.exist(addr(0xcc)));
        assert!(db.get_substate_post_alloc().is_empty());
    }

    #[test]
    fn committed_storage_tracks_pre_tx_value() {
        let mut db = seeded();

        db.set_storage(addr(0x0a), key(0x01), key(0xbb));
        db.set_storage(addr(0x0a), key(0x01), key(0xcc));
        assert_eq!(db.get_committed_storage(addr(0x0a), key(0x01)), key(0xaa));

        db.finalise(true);
        assert_eq!(db.get_committed_storage(addr(0x0a), key(0x01)), key(0xcc));
    }

    #[test]
    fn suicide_hides_the_baseline_account_after_finalise() {
        let mut db = seeded();

        assert!(db.suicide(addr(0x0a)));
        assert_eq!(db.get_balance(addr(0x0a)), U256::ZERO);
        assert!(db.exist(addr(0x0a)));

        db.finalise(true);
        assert!(!db.exist(addr(0x0a)));
        assert_eq!(db.get_nonce(addr(0x0a)), 0);
        assert_eq!(db.get_storage(addr(0x0a), key(0x01)), B256::ZERO);
        assert!(!db.get_substate_post_alloc().contains(&addr(0x0a)));
    }

    #[test]
    fn create_account_shadows_baseline_storage() {
        let mut db = seeded();

        db.create_account(addr(0x0a));
        assert_eq!(db.get_balance(addr(0x0a)), U256::from(1_000u64));
        assert_eq!(db.get_nonce(addr(0x0a)), 0);
        assert_eq!(db.get_storage(addr(0x0a), key(0x01)), B256::ZERO);

        let alloc = db.get_substate_post_alloc();
        assert!(alloc.get(&addr(0x0a)).unwrap().storage.is_empty());
    }

    #[test]
    fn post_alloc_merges_baseline_and_overlay_storage() {
        let mut db = seeded();

        db.set_storage(addr(0x0a), key(0x02), key(0xdd));
        db.set_storage(addr(0x0a), key(0x03), B256::ZERO);

        let alloc = db.get_substate_post_alloc();
        let account = alloc.get(&addr(0x0a)).unwrap();
        assert_eq!(account.storage.get(&key(0x01)), Some(&key(0xaa)));
        assert_eq!(account.storage.get(&key(0x02)), Some(&key(0xdd)));
        assert!(!account.storage.contains_key(&key(0x03)));
    }

    /// Drives the same mutation script through both variants and checks the
    /// extracted post-allocations agree.
    #[test]
    fn variants_agree_on_post_alloc() {
        fn script(db: &mut dyn StateDb) {
            db.prepare(B256::repeat_byte(0x02), 0);
            let _outer = db.snapshot();
            db.sub_balance(addr(0x0a), U256::from(300u64));
            db.add_balance(addr(0x0b), U256::from(300u64));
            db.set_nonce(addr(0x0a), 6);
            db.set_storage(addr(0x0a), key(0x01), key(0x99));

            let inner = db.snapshot();
            db.set_storage(addr(0x0a), key(0x01), key(0x77));
            db.set_code(addr(0x0d), Bytes::from_static(&[0x01]));
            db.revert_to_snapshot(inner);

            db.add_log(Log {
                address: addr(0x0a),
                data: Default::default(),
            });
            db.create_account(addr(0x0e));
            db.add_balance(addr(0x0e), U256::ZERO);
            db.finalise(true);
        }

        let mut in_memory = InMemoryStateDb::new(&input_alloc());
        let mut off_chain = OffTheChainStateDb::new(input_alloc());
        script(&mut in_memory);
        script(&mut off_chain);

        let a = in_memory.get_substate_post_alloc();
        let b = off_chain.get_substate_post_alloc();
        assert_eq!(a, b);

        // The script's effects themselves are as expected.
        assert_eq!(a.get(&addr(0x0a)).unwrap().nonce, 6);
        assert_eq!(
            a.get(&addr(0x0a)).unwrap().storage.get(&key(0x01)),
            Some(&key(0x99))
        );
        assert!(!a.contains(&addr(0x0d)));
        // Created empty account is pruned at finalise.
        assert!(!a.contains(&addr(0x0e)));
    }
}
