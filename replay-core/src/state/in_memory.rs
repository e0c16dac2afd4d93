//! Eager in-memory state database.
//!
//! The backing store is a plain account map materialized from the recorded
//! input allocation. Every mutation appends its reverse operation to the
//! journal; a snapshot is the journal length and reverting unwinds entries
//! from the top. Committed storage values are captured lazily on the first
//! write of each slot inside the current transaction.

use std::collections::{HashMap, HashSet, hash_map::Entry};

use alloy_primitives::{Address, B256, Bytes, Log, U256, keccak256};

use crate::{
    state::{EMPTY_CODE_HASH, StateDb, TxScratch, journal::JournalEntry},
    substate::{SubstateAccount, SubstateAlloc},
};

/// Mutable account state of the in-memory variant.
#[derive(Debug, Default, Clone)]
struct AccountEntry {
    nonce: u64,
    balance: U256,
    code: Bytes,
    storage: HashMap<B256, B256>,
    /// Pre-transaction slot values, captured on first write. Cleared at the
    /// finalise boundary.
    committed: HashMap<B256, B256>,
    suicided: bool,
}

impl AccountEntry {
    fn is_empty(&self) -> bool {
        self.nonce == 0 && self.balance.is_zero() && self.code.is_empty()
    }
}

/// Journal-backed state database over a materialized account map.
pub struct InMemoryStateDb {
    accounts: HashMap<Address, AccountEntry>,
    touched: HashSet<Address>,
    journal: Vec<JournalEntry<AccountEntry>>,
    scratch: TxScratch,
}

impl InMemoryStateDb {
    /// Builds the state database seeded with the recorded input allocation.
    pub fn new(input: &SubstateAlloc) -> Self {
        let accounts = input
            .iter()
            .map(|(address, account)| {
                (
                    *address,
                    AccountEntry {
                        nonce: account.nonce,
                        balance: account.balance,
                        code: account.code.clone(),
                        storage: account.storage.iter().map(|(k, v)| (*k, *v)).collect(),
                        committed: HashMap::new(),
                        suicided: false,
                    },
                )
            })
            .collect();

        Self {
            accounts,
            touched: HashSet::new(),
            journal: Vec::new(),
            scratch: TxScratch::default(),
        }
    }

    /// Records the account in the touched set, journaling the first entry.
    fn touch(&mut self, address: Address) {
        if self.touched.insert(address) {
            self.journal.push(JournalEntry::Touched { address });
        }
    }

    /// Materializes the account (journaling the creation) and returns it
    /// together with the journal, split-borrowed for further entries.
    fn account_mut(
        &mut self,
        address: Address,
    ) -> (&mut AccountEntry, &mut Vec<JournalEntry<AccountEntry>>) {
        let Self {
            accounts, journal, ..
        } = self;
        let entry = match accounts.entry(address) {
            Entry::Occupied(occupied) => occupied.into_mut(),
            Entry::Vacant(vacant) => {
                journal.push(JournalEntry::AccountChange {
                    address,
                    prev: None,
                });
                vacant.insert(AccountEntry::default())
            }
        };
        (entry, journal)
    }
}

impl StateDb for InMemoryStateDb {
    fn exist(&self, address: Address) -> bool {
        self.accounts.contains_key(&address)
    }

    fn empty(&self, address: Address) -> bool {
        self.accounts
            .get(&address)
            .map(AccountEntry::is_empty)
            .unwrap_or(true)
    }

    fn create_account(&mut self, address: Address) {
        self.touch(address);
        let prev = self.accounts.remove(&address);
        let carried_balance = prev.as_ref().map(|e| e.balance).unwrap_or_default();
        self.journal.push(JournalEntry::AccountChange {
            address,
            prev: prev.map(Box::new),
        });
        self.accounts.insert(
            address,
            AccountEntry {
                balance: carried_balance,
                ..AccountEntry::default()
            },
        );
    }

    fn get_balance(&self, address: Address) -> U256 {
        self.accounts
            .get(&address)
            .map(|e| e.balance)
            .unwrap_or_default()
    }

    fn add_balance(&mut self, address: Address, amount: U256) {
        self.touch(address);
        let (entry, journal) = self.account_mut(address);
        journal.push(JournalEntry::BalanceChange {
            address,
            prev: entry.balance,
        });
        entry.balance += amount;
    }

    fn sub_balance(&mut self, address: Address, amount: U256) {
        self.touch(address);
        let (entry, journal) = self.account_mut(address);
        journal.push(JournalEntry::BalanceChange {
            address,
            prev: entry.balance,
        });
        entry.balance = entry.balance.saturating_sub(amount);
    }

    fn get_nonce(&self, address: Address) -> u64 {
        self.accounts
            .get(&address)
            .map(|e| e.nonce)
            .unwrap_or_default()
    }

    fn set_nonce(&mut self, address: Address, nonce: u64) {
        self.touch(address);
        let (entry, journal) = self.account_mut(address);
        journal.push(JournalEntry::NonceChange {
            address,
            prev: entry.nonce,
        });
        entry.nonce = nonce;
    }

    fn get_code(&self, address: Address) -> Bytes {
        self.accounts
            .get(&address)
            .map(|e| e.code.clone())
            .unwrap_or_default()
    }

    fn get_code_hash(&self, address: Address) -> B256 {
        match self.accounts.get(&address) {
            None => B256::ZERO,
            Some(entry) if entry.code.is_empty() => EMPTY_CODE_HASH,
            Some(entry) => keccak256(&entry.code),
        }
    }

    fn get_code_size(&self, address: Address) -> usize {
        self.accounts
            .get(&address)
            .map(|e| e.code.len())
            .unwrap_or_default()
    }

    fn set_code(&mut self, address: Address, code: Bytes) {
        self.touch(address);
        let (entry, journal) = self.account_mut(address);
        journal.push(JournalEntry::CodeChange {
            address,
            prev: entry.code.clone(),
        });
        entry.code = code;
    }

    fn get_storage(&self, address: Address, key: B256) -> B256 {
        self.accounts
            .get(&address)
            .and_then(|e| e.storage.get(&key).copied())
            .unwrap_or_default()
    }

    fn get_committed_storage(&self, address: Address, key: B256) -> B256 {
        let Some(entry) = self.accounts.get(&address) else {
            return B256::ZERO;
        };
        match entry.committed.get(&key) {
            Some(committed) => *committed,
            None => entry.storage.get(&key).copied().unwrap_or_default(),
        }
    }

    fn set_storage(&mut self, address: Address, key: B256, value: B256) {
        self.touch(address);
        let (entry, journal) = self.account_mut(address);
        let prev = entry.storage.get(&key).copied().unwrap_or_default();
        let had_committed = entry.committed.contains_key(&key);
        if !had_committed {
            entry.committed.insert(key, prev);
        }
        journal.push(JournalEntry::StorageChange {
            address,
            key,
            prev,
            had_committed,
        });
        entry.storage.insert(key, value);
    }

    fn suicide(&mut self, address: Address) -> bool {
        if !self.accounts.contains_key(&address) {
            return false;
        }
        self.touch(address);
        let (entry, journal) = self.account_mut(address);
        journal.push(JournalEntry::SuicideChange {
            address,
            prev_marked: entry.suicided,
            prev_balance: entry.balance,
        });
        entry.suicided = true;
        entry.balance = U256::ZERO;
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
                        self.accounts.insert(address, *prev);
                    }
                    None => {
                        self.accounts.remove(&address);
                    }
                },
                JournalEntry::Touched { address } => {
                    self.touched.remove(&address);
                }
                JournalEntry::BalanceChange { address, prev } => {
                    if let Some(entry) = self.accounts.get_mut(&address) {
                        entry.balance = prev;
                    }
                }
                JournalEntry::NonceChange { address, prev } => {
                    if let Some(entry) = self.accounts.get_mut(&address) {
                        entry.nonce = prev;
                    }
                }
                JournalEntry::CodeChange { address, prev } => {
                    if let Some(entry) = self.accounts.get_mut(&address) {
                        entry.code = prev;
                    }
                }
                JournalEntry::StorageChange {
                    address,
                    key,
                    prev,
                    had_committed,
                } => {
                    if let Some(entry) = self.accounts.get_mut(&address) {
                        entry.storage.insert(key, prev);
                        if !had_committed {
                            entry.committed.remove(&key);
                        }
                    }
                }
                JournalEntry::SuicideChange {
                    address,
                    prev_marked,
                    prev_balance,
                } => {
                    if let Some(entry) = self.accounts.get_mut(&address) {
                        entry.suicided = prev_marked;
                        entry.balance = prev_balance;
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
            let Some(entry) = self.accounts.get(&address) else {
                continue;
            };
            if entry.suicided || (delete_empty && entry.is_empty()) {
                self.accounts.remove(&address);
            }
        }
        for entry in self.accounts.values_mut() {
            entry.committed.clear();
        }
        self.journal.clear();
    }

    fn intermediate_root(&mut self, delete_empty: bool) {
        self.finalise(delete_empty);
    }

    fn get_substate_post_alloc(&self) -> SubstateAlloc {
        let mut alloc = SubstateAlloc::new();
        for address in &self.touched {
            let Some(entry) = self.accounts.get(address) else {
                continue;
            };
            let mut account =
                SubstateAccount::new(entry.nonce, entry.balance, entry.code.clone());
            for (key, value) in &entry.storage {
                if !value.is_zero() {
                    account.storage.insert(*key, *value);
                }
            }
            alloc.insert(*address, account);
        }
        alloc
    }
}
