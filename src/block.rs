use serde::{Deserialize, Serialize};

use crate::config::ChainConfig;
use crate::merkle::{build_merkle_tree, MerkleTree};
use crate::transaction::Transaction;
use crate::types::{Address, FieldHasher, Hash};

/// A block in the chain.
///
/// Blocks are numbered from 1 (genesis) and link to their parent by hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub block_number: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub transactions: Vec<Transaction>,
    pub difficulty: u64,
    pub parent_hash: Hash,
    pub hash: Hash,
    /// Address credited with the reward and fees.
    pub coinbase: Address,
    /// Proof-of-work counter.
    pub nonce: u64,
    pub tx_root: Hash,
}

impl Block {
    /// Build a sealed block (transaction root and hash filled in).
    pub fn new(
        block_number: u64,
        timestamp: u64,
        transactions: Vec<Transaction>,
        difficulty: u64,
        parent_hash: impl Into<Hash>,
        coinbase: impl Into<Address>,
    ) -> Self {
        let mut block = Block {
            block_number,
            timestamp,
            transactions,
            difficulty,
            parent_hash: parent_hash.into(),
            hash: Hash::new(),
            coinbase: coinbase.into(),
            nonce: 0,
            tx_root: Hash::new(),
        };
        block.seal();
        block
    }

    /// The genesis block every node derives identically from the config.
    pub fn genesis(config: &ChainConfig) -> Self {
        Block::new(
            1,
            config.genesis_timestamp,
            Vec::new(),
            1,
            "",
            config.first_account.clone(),
        )
    }

    /// Digest over the header fields, `tx_root` included, `hash` excluded.
    pub fn compute_hash(&self) -> Hash {
        let mut hasher = FieldHasher::new();
        hasher
            .field(self.block_number.to_be_bytes())
            .field(self.timestamp.to_be_bytes())
            .field(&self.tx_root)
            .field(self.difficulty.to_be_bytes())
            .field(&self.parent_hash)
            .field(&self.coinbase)
            .field(self.nonce.to_be_bytes());
        hasher.finish()
    }

    /// Merkle tree over `index ‖ transaction` leaves.
    pub fn tx_tree(transactions: &[Transaction]) -> MerkleTree {
        build_merkle_tree(
            transactions
                .iter()
                .enumerate()
                .map(|(index, tx)| tx.leaf(index)),
        )
    }

    pub fn compute_tx_root(transactions: &[Transaction]) -> Hash {
        Self::tx_tree(transactions).root()
    }

    /// Recompute `tx_root` from the transaction list, then `hash` from the header.
    pub fn seal(&mut self) {
        self.tx_root = Self::compute_tx_root(&self.transactions);
        self.hash = self.compute_hash();
    }

    pub fn is_genesis(&self) -> bool {
        self.block_number == 1 && self.parent_hash.is_empty()
    }
}
