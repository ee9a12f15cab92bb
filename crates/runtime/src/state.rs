//! World state with journaled snapshot/revert
//!
//! The pending state mutates a `WorldState` one transaction at a time. Every
//! mutation is recorded in a journal so a failed transaction can be rolled back
//! to the exact contents it started from.

use crate::types::{encode, Address, H256};
use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Account balance and sequence number
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Account {
    pub balance: u128,
    pub nonce: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("insufficient balance in {address}: have {balance}, need {amount}")]
    InsufficientBalance {
        address: Address,
        balance: u128,
        amount: u128,
    },
    #[error("balance overflow for {0}")]
    BalanceOverflow(Address),
}

#[derive(Debug, Clone)]
struct JournalEntry {
    address: Address,
    prev: Option<Account>,
}

/// In-memory account state
#[derive(Debug, Clone, Default)]
pub struct WorldState {
    accounts: BTreeMap<Address, Account>,
    journal: Vec<JournalEntry>,
    /// Journal length at each open snapshot
    snapshots: Vec<usize>,
}

impl WorldState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a state from a genesis allocation
    pub fn from_alloc<I: IntoIterator<Item = (Address, u128)>>(alloc: I) -> Self {
        let accounts = alloc
            .into_iter()
            .map(|(address, balance)| (address, Account { balance, nonce: 0 }))
            .collect();
        Self {
            accounts,
            ..Default::default()
        }
    }

    pub fn account(&self, address: &Address) -> Account {
        self.accounts.get(address).copied().unwrap_or_default()
    }

    pub fn balance(&self, address: &Address) -> u128 {
        self.account(address).balance
    }

    pub fn nonce(&self, address: &Address) -> u64 {
        self.account(address).nonce
    }

    pub fn exists(&self, address: &Address) -> bool {
        self.accounts.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn accounts(&self) -> impl Iterator<Item = (&Address, &Account)> {
        self.accounts.iter()
    }

    fn record(&mut self, address: Address) {
        let prev = self.accounts.get(&address).copied();
        self.journal.push(JournalEntry { address, prev });
    }

    pub fn add_balance(&mut self, address: Address, amount: u128) -> Result<(), StateError> {
        let balance = self
            .balance(&address)
            .checked_add(amount)
            .ok_or(StateError::BalanceOverflow(address))?;
        self.record(address);
        self.accounts.entry(address).or_default().balance = balance;
        Ok(())
    }

    pub fn sub_balance(&mut self, address: Address, amount: u128) -> Result<(), StateError> {
        let balance = self.balance(&address);
        let remaining = balance
            .checked_sub(amount)
            .ok_or(StateError::InsufficientBalance {
                address,
                balance,
                amount,
            })?;
        self.record(address);
        self.accounts.entry(address).or_default().balance = remaining;
        Ok(())
    }

    pub fn set_nonce(&mut self, address: Address, nonce: u64) {
        self.record(address);
        self.accounts.entry(address).or_default().nonce = nonce;
    }

    /// Open a snapshot; the returned id can be passed to `revert_to_snapshot`
    pub fn snapshot(&mut self) -> usize {
        self.snapshots.push(self.journal.len());
        self.snapshots.len() - 1
    }

    /// Undo every change made since the snapshot was taken.
    /// Snapshots opened after `id` are discarded as well.
    pub fn revert_to_snapshot(&mut self, id: usize) {
        let Some(&mark) = self.snapshots.get(id) else {
            tracing::warn!("Revert to unknown snapshot {} ignored", id);
            return;
        };
        while self.journal.len() > mark {
            let Some(entry) = self.journal.pop() else { break };
            match entry.prev {
                Some(account) => {
                    self.accounts.insert(entry.address, account);
                }
                None => {
                    self.accounts.remove(&entry.address);
                }
            }
        }
        self.snapshots.truncate(id);
    }

    /// Make all journaled changes permanent and drop open snapshots
    pub fn commit(&mut self) {
        self.journal.clear();
        self.snapshots.clear();
    }

    pub fn state_root(&self) -> H256 {
        let mut hasher = blake3::Hasher::new();
        for (address, account) in &self.accounts {
            hasher.update(address.as_bytes());
            hasher.update(&encode(account));
        }
        H256(*hasher.finalize().as_bytes())
    }

    /// Independent copy without journal, safe to hand to readers
    pub fn copy(&self) -> Self {
        Self {
            accounts: self.accounts.clone(),
            journal: Vec::new(),
            snapshots: Vec::new(),
        }
    }

    /// Canonical byte encoding of the account set
    pub fn encode_accounts(&self) -> Vec<u8> {
        encode(&self.accounts)
    }
}

impl PartialEq for WorldState {
    fn eq(&self, other: &Self) -> bool {
        self.accounts == other.accounts
    }
}

impl Eq for WorldState {}
