use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use sled::{Db, Tree};
use thiserror::Error;

use crate::block::Block;
use crate::types::{Account, Address, ErrorKind, Hash};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),
    #[error("Data not found")]
    NotFound,
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Corrupt entry: {0}")]
    Corrupt(String),
    #[error("Storage lock poisoned")]
    Poisoned,
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Internal
    }
}

/// Minimal key-value contract every store satisfies.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;
    fn keys(&self) -> Result<Vec<Vec<u8>>, StorageError>;
    fn close(&self) -> Result<(), StorageError>;
}

/// A backend hands out namespaced stores and applies cross-namespace
/// batches atomically.
pub trait Storage: Send + Sync {
    type Store: KvStore;

    fn open(&self, namespace: &str) -> Result<Self::Store, StorageError>;
    fn apply_batch(&self, batch: StorageBatch) -> Result<(), StorageError>;
    fn flush(&self) -> Result<(), StorageError>;
}

#[derive(Debug, Default)]
pub struct StorageBatch {
    pub ops: Vec<StorageOperation>,
}

#[derive(Debug)]
pub enum StorageOperation {
    Put {
        namespace: String,
        key: Vec<u8>,
        value: Vec<u8>,
    },
}

impl StorageBatch {
    pub fn put(&mut self, namespace: impl Into<String>, key: impl AsRef<[u8]>, value: impl Into<Vec<u8>>) {
        self.ops.push(StorageOperation::Put {
            namespace: namespace.into(),
            key: key.as_ref().to_vec(),
            value: value.into(),
        });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Namespaces share one keyspace; a namespace prefix ends in a NUL byte.
fn prefixed(namespace: &str, key: &[u8]) -> Vec<u8> {
    let mut full = namespace_prefix(namespace);
    full.extend_from_slice(key);
    full
}

fn namespace_prefix(namespace: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(namespace.len() + 1);
    prefix.extend_from_slice(namespace.as_bytes());
    prefix.push(0);
    prefix
}

/// On-disk backend: every namespace lives in one sled tree so that a
/// commit is a single atomic `apply_batch`.
#[derive(Clone)]
pub struct SledStorage {
    db: Db,
    chain_tree: Tree,
}

impl SledStorage {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Ok(Self {
            chain_tree: db.open_tree("chain")?,
            db,
        })
    }
}

#[derive(Clone)]
pub struct SledStore {
    tree: Tree,
    prefix: Vec<u8>,
}

impl KvStore for SledStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let mut full = self.prefix.clone();
        full.extend_from_slice(key);
        Ok(self.tree.get(full)?.map(|v| v.to_vec()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        let mut full = self.prefix.clone();
        full.extend_from_slice(key);
        self.tree.insert(full, value)?;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<Vec<u8>>, StorageError> {
        let mut keys = Vec::new();
        for item in self.tree.scan_prefix(&self.prefix) {
            let (key, _value) = item?;
            keys.push(key[self.prefix.len()..].to_vec());
        }
        Ok(keys)
    }

    fn close(&self) -> Result<(), StorageError> {
        self.tree.flush()?;
        Ok(())
    }
}

impl Storage for SledStorage {
    type Store = SledStore;

    fn open(&self, namespace: &str) -> Result<SledStore, StorageError> {
        Ok(SledStore {
            tree: self.chain_tree.clone(),
            prefix: namespace_prefix(namespace),
        })
    }

    fn apply_batch(&self, batch: StorageBatch) -> Result<(), StorageError> {
        let mut tree_batch = sled::Batch::default();
        for op in batch.ops {
            match op {
                StorageOperation::Put { namespace, key, value } => {
                    tree_batch.insert(prefixed(&namespace, &key), value);
                }
            }
        }
        self.chain_tree.apply_batch(tree_batch)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

type SharedMap = Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>;

/// In-memory backend with the same layout as [`SledStorage`].
#[derive(Clone, Default)]
pub struct MemoryStorage {
    map: SharedMap,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Clone)]
pub struct MemoryStore {
    map: SharedMap,
    prefix: Vec<u8>,
}

impl KvStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let mut full = self.prefix.clone();
        full.extend_from_slice(key);
        let map = self.map.read().map_err(|_| StorageError::Poisoned)?;
        Ok(map.get(&full).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        let mut full = self.prefix.clone();
        full.extend_from_slice(key);
        let mut map = self.map.write().map_err(|_| StorageError::Poisoned)?;
        map.insert(full, value.to_vec());
        Ok(())
    }

    fn keys(&self) -> Result<Vec<Vec<u8>>, StorageError> {
        let map = self.map.read().map_err(|_| StorageError::Poisoned)?;
        Ok(map
            .range(self.prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&self.prefix))
            .map(|(key, _)| key[self.prefix.len()..].to_vec())
            .collect())
    }

    fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

impl Storage for MemoryStorage {
    type Store = MemoryStore;

    fn open(&self, namespace: &str) -> Result<MemoryStore, StorageError> {
        Ok(MemoryStore {
            map: Arc::clone(&self.map),
            prefix: namespace_prefix(namespace),
        })
    }

    fn apply_batch(&self, batch: StorageBatch) -> Result<(), StorageError> {
        let mut map = self.map.write().map_err(|_| StorageError::Poisoned)?;
        for op in batch.ops {
            match op {
                StorageOperation::Put { namespace, key, value } => {
                    map.insert(prefixed(&namespace, &key), value);
                }
            }
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Read access to committed account state.
pub trait StateView {
    fn account(&self, address: &str) -> Result<Option<Account>, StorageError>;
}

pub const STATE_NAMESPACE: &str = "state";
pub const BLOCK_NAMESPACE: &str = "block";
pub const BLOCK_HASH_NAMESPACE: &str = "bhash";
pub const CODE_NAMESPACE: &str = "code";
pub const META_NAMESPACE: &str = "meta";
const LATEST_BLOCK_KEY: &[u8] = b"latest_block_number";

/// Namespace of one contract account's storage.
pub fn storage_namespace(address: &str) -> String {
    format!("storage/{address}")
}

fn utf8(bytes: Vec<u8>) -> Result<String, StorageError> {
    String::from_utf8(bytes).map_err(|e| StorageError::Corrupt(e.to_string()))
}

fn parse_number(bytes: Vec<u8>) -> Result<u64, StorageError> {
    let text = utf8(bytes)?;
    text.parse()
        .map_err(|_| StorageError::Corrupt(format!("invalid block number {text:?}")))
}

/// Typed view of the persisted layout: accounts, blocks by number, block
/// hash index, code by hash, per-contract storage and the latest-block
/// counter.
pub struct ChainStore<S: Storage> {
    backend: S,
    state: S::Store,
    blocks: S::Store,
    block_hashes: S::Store,
    code: S::Store,
    meta: S::Store,
}

impl<S: Storage> ChainStore<S> {
    pub fn new(backend: S) -> Result<Self, StorageError> {
        Ok(ChainStore {
            state: backend.open(STATE_NAMESPACE)?,
            blocks: backend.open(BLOCK_NAMESPACE)?,
            block_hashes: backend.open(BLOCK_HASH_NAMESPACE)?,
            code: backend.open(CODE_NAMESPACE)?,
            meta: backend.open(META_NAMESPACE)?,
            backend,
        })
    }

    pub fn put_account(&self, address: &str, account: &Account) -> Result<(), StorageError> {
        self.state.put(address.as_bytes(), &bincode::serialize(account)?)
    }

    pub fn addresses(&self) -> Result<Vec<Address>, StorageError> {
        self.state.keys()?.into_iter().map(utf8).collect()
    }

    pub fn latest_block_number(&self) -> Result<Option<u64>, StorageError> {
        self.meta.get(LATEST_BLOCK_KEY)?.map(parse_number).transpose()
    }

    pub fn latest_block(&self) -> Result<Option<Block>, StorageError> {
        match self.latest_block_number()? {
            Some(number) => self.block_by_number(number),
            None => Ok(None),
        }
    }

    pub fn block_by_number(&self, number: u64) -> Result<Option<Block>, StorageError> {
        let encoded = self.blocks.get(number.to_string().as_bytes())?;
        Ok(encoded.map(|e| serde_json::from_slice(&e)).transpose()?)
    }

    pub fn block_number_by_hash(&self, hash: &str) -> Result<Option<u64>, StorageError> {
        self.block_hashes.get(hash.as_bytes())?.map(parse_number).transpose()
    }

    pub fn block_by_hash(&self, hash: &str) -> Result<Option<Block>, StorageError> {
        match self.block_number_by_hash(hash)? {
            Some(number) => self.block_by_number(number),
            None => Ok(None),
        }
    }

    pub fn code(&self, code_hash: &str) -> Result<Option<String>, StorageError> {
        self.code.get(code_hash.as_bytes())?.map(utf8).transpose()
    }

    pub fn storage_value(&self, address: &str, key: &str) -> Result<Option<String>, StorageError> {
        let store = self.backend.open(&storage_namespace(address))?;
        store.get(key.as_bytes())?.map(utf8).transpose()
    }

    pub fn storage_keys(&self, address: &str) -> Result<Vec<String>, StorageError> {
        let store = self.backend.open(&storage_namespace(address))?;
        store.keys()?.into_iter().map(utf8).collect()
    }

    /// Every key/value pair of one contract's storage, sorted by key.
    pub fn storage_entries(&self, address: &str) -> Result<BTreeMap<String, String>, StorageError> {
        let store = self.backend.open(&storage_namespace(address))?;
        let mut entries = BTreeMap::new();
        for key in store.keys()? {
            let value = store.get(&key)?.ok_or(StorageError::NotFound)?;
            entries.insert(utf8(key)?, utf8(value)?);
        }
        Ok(entries)
    }

    pub fn apply_batch(&self, batch: StorageBatch) -> Result<(), StorageError> {
        self.backend.apply_batch(batch)
    }

    pub fn close(&self) -> Result<(), StorageError> {
        for store in [&self.state, &self.blocks, &self.block_hashes, &self.code, &self.meta] {
            store.close()?;
        }
        self.backend.flush()
    }
}

impl<S: Storage> StateView for ChainStore<S> {
    fn account(&self, address: &str) -> Result<Option<Account>, StorageError> {
        let encoded = self.state.get(address.as_bytes())?;
        Ok(encoded.map(|e| bincode::deserialize(&e)).transpose()?)
    }
}

/// Append the persisted form of a block, its hash index entry and the
/// latest-block counter to `batch`.
pub fn stage_block(batch: &mut StorageBatch, block: &Block) -> Result<(), StorageError> {
    let number = block.block_number.to_string();
    batch.put(BLOCK_NAMESPACE, number.as_bytes(), serde_json::to_vec(block)?);
    batch.put(BLOCK_HASH_NAMESPACE, block.hash.as_bytes(), number.clone().into_bytes());
    batch.put(META_NAMESPACE, LATEST_BLOCK_KEY, number.into_bytes());
    Ok(())
}

pub fn stage_account(batch: &mut StorageBatch, address: &str, account: &Account) -> Result<(), StorageError> {
    batch.put(STATE_NAMESPACE, address.as_bytes(), bincode::serialize(account)?);
    Ok(())
}

pub fn stage_code(batch: &mut StorageBatch, code_hash: &Hash, code: &str) {
    batch.put(CODE_NAMESPACE, code_hash.as_bytes(), code.as_bytes().to_vec());
}

pub fn stage_storage(batch: &mut StorageBatch, address: &str, key: &str, value: &str) {
    batch.put(storage_namespace(address), key.as_bytes(), value.as_bytes().to_vec());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChainConfig;
    use num_bigint::BigUint;

    fn exercise_namespaces<S: Storage>(backend: S) {
        let a = backend.open("a").unwrap();
        let ab = backend.open("a/b").unwrap();
        a.put(b"k1", b"v1").unwrap();
        a.put(b"k2", b"v2").unwrap();
        ab.put(b"k1", b"other").unwrap();

        assert_eq!(a.get(b"k1").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(ab.get(b"k1").unwrap(), Some(b"other".to_vec()));
        assert_eq!(a.get(b"missing").unwrap(), None);
        assert_eq!(a.keys().unwrap(), vec![b"k1".to_vec(), b"k2".to_vec()]);
        assert_eq!(ab.keys().unwrap(), vec![b"k1".to_vec()]);
        a.close().unwrap();
    }

    #[test]
    fn memory_namespaces_are_isolated() {
        exercise_namespaces(MemoryStorage::new());
    }

    #[test]
    fn sled_namespaces_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        exercise_namespaces(SledStorage::new(dir.path()).unwrap());
    }

    fn exercise_chain_store<S: Storage>(store: ChainStore<S>) {
        assert_eq!(store.latest_block_number().unwrap(), None);

        let block = Block::genesis(&ChainConfig::default());
        let account = Account::with_balance(BigUint::from(42u8));
        let mut batch = StorageBatch::default();
        stage_block(&mut batch, &block).unwrap();
        stage_account(&mut batch, "alice", &account).unwrap();
        stage_code(&mut batch, &"h".to_string(), "code");
        stage_storage(&mut batch, "alice", "b", "2");
        stage_storage(&mut batch, "alice", "a", "1");
        store.apply_batch(batch).unwrap();

        assert_eq!(store.latest_block_number().unwrap(), Some(1));
        assert_eq!(store.latest_block().unwrap(), Some(block.clone()));
        assert_eq!(store.block_by_hash(&block.hash).unwrap(), Some(block));
        assert_eq!(store.account("alice").unwrap(), Some(account));
        assert_eq!(store.account("bob").unwrap(), None);
        assert_eq!(store.code("h").unwrap().as_deref(), Some("code"));
        assert_eq!(store.storage_keys("alice").unwrap(), vec!["a", "b"]);
        assert_eq!(store.storage_value("alice", "b").unwrap().as_deref(), Some("2"));
        assert_eq!(store.storage_entries("alice").unwrap().len(), 2);
        assert_eq!(store.addresses().unwrap(), vec!["alice".to_string()]);
        store.close().unwrap();
    }

    #[test]
    fn chain_store_over_memory() {
        exercise_chain_store(ChainStore::new(MemoryStorage::new()).unwrap());
    }

    #[test]
    fn chain_store_over_sled_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        exercise_chain_store(ChainStore::new(SledStorage::new(dir.path()).unwrap()).unwrap());

        let reopened = ChainStore::new(SledStorage::new(dir.path()).unwrap()).unwrap();
        assert_eq!(reopened.latest_block_number().unwrap(), Some(1));
        assert!(reopened.account("alice").unwrap().is_some());
    }
}
