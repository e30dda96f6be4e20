use std::collections::{HashMap, HashSet};

use thiserror::Error;
use tracing::debug;

use crate::config::ChainConfig;
use crate::storage::{StateView, StorageError};
use crate::transaction::{Rejection, Transaction, TxError, Verdict};
use crate::types::{Address, ErrorKind, Hash};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Transaction rejected: {0}")]
    Rejected(Rejection),
    #[error("Nonce gap: expected {expected}, got {got}")]
    NonceGap { expected: u64, got: u64 },
    #[error("Transaction already pooled")]
    Duplicate,
    #[error("Transaction pool is full")]
    Full,
    #[error(transparent)]
    Tx(#[from] TxError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl PoolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PoolError::Rejected(rejection) => rejection.kind(),
            PoolError::NonceGap { .. } | PoolError::Duplicate | PoolError::Full => {
                ErrorKind::StateInconsistency
            }
            PoolError::Tx(err) => err.kind(),
            PoolError::Storage(err) => err.kind(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PooledTx {
    pub tx: Transaction,
    pub sender: Address,
    pub hash: Hash,
}

/// Insertion-ordered pool. Per sender, pooled nonces are contiguous and
/// start right after the committed account nonce. A transaction is
/// identified by its sender and nonce, since the hash leaves out the sender.
#[derive(Debug)]
pub struct TxPool {
    entries: Vec<PooledTx>,
    keys: HashSet<(Address, u64)>,
    capacity: usize,
}

impl TxPool {
    pub fn new(capacity: usize) -> Self {
        TxPool {
            entries: Vec::new(),
            keys: HashSet::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, sender: &str, nonce: u64) -> bool {
        self.keys.contains(&(sender.to_string(), nonce))
    }

    pub fn entries(&self) -> &[PooledTx] {
        &self.entries
    }

    /// Pooled transactions in admission order, as block candidates.
    pub fn transactions(&self) -> Vec<Transaction> {
        self.entries.iter().map(|entry| entry.tx.clone()).collect()
    }

    fn highest_nonce(&self, sender: &str) -> Option<u64> {
        self.entries
            .iter()
            .filter(|entry| entry.sender == sender)
            .map(|entry| entry.tx.nonce)
            .max()
    }

    /// Validate `tx` against committed state and admit it if its nonce is
    /// the sender's next one. The pool is untouched on rejection.
    pub fn add_transaction(
        &mut self,
        tx: Transaction,
        state: &impl StateView,
        config: &ChainConfig,
    ) -> Result<Hash, PoolError> {
        if let Verdict::Invalid(rejection) = tx.is_valid(state, config)? {
            return Err(PoolError::Rejected(rejection));
        }
        let sender = tx.sender().map_err(TxError::from)?;
        if self.contains(&sender, tx.nonce) {
            return Err(PoolError::Duplicate);
        }
        if self.entries.len() >= self.capacity {
            return Err(PoolError::Full);
        }

        let hash = tx.hash();
        let committed = state.account(&sender)?.map_or(0, |account| account.nonce);
        let expected = self.highest_nonce(&sender).unwrap_or(committed).max(committed) + 1;
        if tx.nonce != expected {
            return Err(PoolError::NonceGap {
                expected,
                got: tx.nonce,
            });
        }

        debug!(%hash, %sender, nonce = tx.nonce, "Transaction pooled");
        self.keys.insert((sender.clone(), tx.nonce));
        self.entries.push(PooledTx {
            tx,
            sender,
            hash: hash.clone(),
        });
        Ok(hash)
    }

    /// Drop transactions made obsolete by a commit: nonces already
    /// committed, nonces no longer contiguous, and anything that fails
    /// re-validation. Returns how many were removed.
    pub fn clear_depreciated_txns(
        &mut self,
        state: &impl StateView,
        config: &ChainConfig,
    ) -> Result<usize, PoolError> {
        let mut next_nonce: HashMap<Address, u64> = HashMap::new();
        let mut kept = Vec::with_capacity(self.entries.len());

        for entry in &self.entries {
            let expected = match next_nonce.get(&entry.sender) {
                Some(nonce) => *nonce,
                None => {
                    let committed = state.account(&entry.sender)?.map_or(0, |account| account.nonce);
                    next_nonce.insert(entry.sender.clone(), committed + 1);
                    committed + 1
                }
            };
            if entry.tx.nonce != expected {
                continue;
            }
            let valid = match entry.tx.is_valid(state, config) {
                Ok(verdict) => verdict.is_valid(),
                Err(TxError::Crypto(_)) => false,
                Err(err) => return Err(err.into()),
            };
            if valid {
                next_nonce.insert(entry.sender.clone(), expected + 1);
                kept.push(entry.clone());
            }
        }

        let removed = self.entries.len() - kept.len();
        self.keys = kept
            .iter()
            .map(|entry| (entry.sender.clone(), entry.tx.nonce))
            .collect();
        self.entries = kept;
        if removed > 0 {
            debug!(removed, remaining = self.entries.len(), "Pruned transaction pool");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ChainStore, MemoryStorage};
    use crate::transaction::KeyPair;
    use crate::types::Account;
    use num_bigint::BigUint;

    fn store_with(key: &KeyPair, balance: u64, nonce: u64) -> ChainStore<MemoryStorage> {
        let store = ChainStore::new(MemoryStorage::new()).unwrap();
        let mut account = Account::with_balance(BigUint::from(balance));
        account.nonce = nonce;
        store.put_account(&key.address(), &account).unwrap();
        store
    }

    fn signed(key: &KeyPair, nonce: u64) -> Transaction {
        let mut tx = Transaction::new("bob", "1", "2000000000", nonce);
        tx.sign(key).unwrap();
        tx
    }

    #[test]
    fn nonces_must_follow_pooled_ones() {
        let config = ChainConfig::default();
        let key = KeyPair::generate();
        let store = store_with(&key, 1_000_000_000_000, 0);
        let mut pool = TxPool::new(16);

        pool.add_transaction(signed(&key, 1), &store, &config).unwrap();
        let err = pool.add_transaction(signed(&key, 3), &store, &config).unwrap_err();
        assert!(matches!(err, PoolError::NonceGap { expected: 2, got: 3 }));
        assert_eq!(pool.len(), 1);

        pool.add_transaction(signed(&key, 2), &store, &config).unwrap();
        pool.add_transaction(signed(&key, 3), &store, &config).unwrap();
        assert_eq!(
            pool.transactions().iter().map(|tx| tx.nonce).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn rejections_leave_pool_untouched() {
        let config = ChainConfig::default();
        let key = KeyPair::generate();
        let store = store_with(&key, 1_000, 0);
        let mut pool = TxPool::new(1);

        let err = pool.add_transaction(signed(&key, 1), &store, &config).unwrap_err();
        assert!(matches!(err, PoolError::Rejected(Rejection::InsufficientBalance)));
        assert_eq!(err.kind(), ErrorKind::StateInconsistency);
        assert!(pool.is_empty());

        let rich = KeyPair::generate();
        let store = store_with(&rich, 1_000_000_000_000, 0);
        let tx = signed(&rich, 1);
        pool.add_transaction(tx, &store, &config).unwrap();
        assert!(pool.contains(&rich.address(), 1));
        assert!(matches!(
            pool.add_transaction(signed(&rich, 2), &store, &config),
            Err(PoolError::Full)
        ));
    }

    #[test]
    fn duplicates_are_refused() {
        let config = ChainConfig::default();
        let key = KeyPair::generate();
        let store = store_with(&key, 1_000_000_000_000, 0);
        let mut pool = TxPool::new(16);
        let tx = signed(&key, 1);
        pool.add_transaction(tx.clone(), &store, &config).unwrap();
        assert!(matches!(
            pool.add_transaction(tx, &store, &config),
            Err(PoolError::Duplicate)
        ));
    }

    #[test]
    fn senders_with_identical_fields_are_distinct() {
        let config = ChainConfig::default();
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let store = store_with(&alice, 1_000_000_000_000, 0);
        let mut bob_account = Account::with_balance(BigUint::from(1_000_000_000_000u64));
        bob_account.nonce = 0;
        store.put_account(&bob.address(), &bob_account).unwrap();
        let mut pool = TxPool::new(16);

        let from_alice = signed(&alice, 1);
        let from_bob = signed(&bob, 1);
        assert_eq!(from_alice.hash(), from_bob.hash());

        pool.add_transaction(from_alice, &store, &config).unwrap();
        pool.add_transaction(from_bob, &store, &config).unwrap();
        assert_eq!(pool.len(), 2);
        assert!(pool.contains(&alice.address(), 1));
        assert!(pool.contains(&bob.address(), 1));
    }

    #[test]
    fn pruning_drops_committed_and_unaffordable() {
        let config = ChainConfig::default();
        let key = KeyPair::generate();
        let store = store_with(&key, 1_000_000_000_000, 0);
        let mut pool = TxPool::new(16);
        for nonce in 1..=3 {
            pool.add_transaction(signed(&key, nonce), &store, &config).unwrap();
        }

        let mut account = Account::with_balance(BigUint::from(1_000_000_000_000u64));
        account.nonce = 1;
        store.put_account(&key.address(), &account).unwrap();
        assert_eq!(pool.clear_depreciated_txns(&store, &config).unwrap(), 1);
        assert_eq!(
            pool.transactions().iter().map(|tx| tx.nonce).collect::<Vec<_>>(),
            vec![2, 3]
        );

        account.nonce = 2;
        account.balance = BigUint::from(10u8);
        store.put_account(&key.address(), &account).unwrap();
        assert_eq!(pool.clear_depreciated_txns(&store, &config).unwrap(), 2);
        assert!(pool.is_empty());
        assert!(!pool.contains(&key.address(), 3));
    }
}
