use std::thread::{self, JoinHandle};

use num_bigint::BigUint;
use num_traits::One;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::block::Block;
use crate::config::ChainConfig;
use crate::contracts::ContractRuntime;
use crate::ledger::{ExecutedBlock, Ledger, LedgerError};
use crate::storage::{Storage, StorageError};
use crate::transaction::{TxError, Verdict};
use crate::types::{ErrorKind, Hash};

/// Nonces tried between two abort checks.
const ABORT_CHECK_INTERVAL: u64 = 4096;

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("Parent hash mismatch: expected {expected}, got {got}")]
    ParentMismatch { expected: Hash, got: Hash },
    #[error("Block number mismatch: expected {expected}, got {got}")]
    HeightMismatch { expected: u64, got: u64 },
    #[error("Block timestamp {got} is older than its parent's {parent}")]
    TimestampRegression { parent: u64, got: u64 },
    #[error("Block hash mismatch: declared {declared}, computed {computed}")]
    HashMismatch { declared: Hash, computed: Hash },
    #[error("Block hash {hash} does not meet difficulty {difficulty}")]
    InsufficientWork { hash: Hash, difficulty: u64 },
    #[error("Difficulty mismatch: expected {expected}, got {got}")]
    DifficultyMismatch { expected: u64, got: u64 },
    #[error("Invalid transaction at index {index}: {reason}")]
    InvalidTransaction { index: usize, reason: String },
    #[error("Replay rejected transaction {index}: {reason}")]
    ReplayRejected { index: usize, reason: String },
    #[error("Transaction root mismatch: declared {declared}, computed {computed}")]
    TxRootMismatch { declared: Hash, computed: Hash },
    #[error("Mining worker is gone")]
    WorkerGone,
    #[error("Mining worker is busy")]
    WorkerBusy,
    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),
    #[error("Ledger error: {0}")]
    LedgerError(#[from] LedgerError),
}

impl ConsensusError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConsensusError::StorageError(_)
            | ConsensusError::LedgerError(_)
            | ConsensusError::WorkerGone
            | ConsensusError::WorkerBusy => ErrorKind::Internal,
            _ => ErrorKind::ConsensusViolation,
        }
    }
}

/// Maps a difficulty to the bound a block hash must stay under.
pub trait PowTarget {
    fn target(&self, difficulty: u64) -> BigUint;

    /// `true` iff `hash`, read as a 256-bit big-endian integer, is below the target.
    fn meets(&self, hash: &str, difficulty: u64) -> bool {
        if hash.len() != 64 {
            return false;
        }
        match BigUint::parse_bytes(hash.as_bytes(), 16) {
            Some(value) => value < self.target(difficulty),
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TargetRule {
    /// `2^256 / difficulty`.
    #[default]
    Numeric,
    /// `5 + floor(log16 difficulty)` leading zero hex digits.
    LeadingZeros,
}

impl TargetRule {
    fn leading_zeros(difficulty: u64) -> u32 {
        // floor(log16 d) is the index of the highest set nibble.
        let log16 = (63 - difficulty.max(1).leading_zeros()) / 4;
        (5 + log16).min(64)
    }
}

impl PowTarget for TargetRule {
    fn target(&self, difficulty: u64) -> BigUint {
        match self {
            TargetRule::Numeric => (BigUint::one() << 256u32) / BigUint::from(difficulty.max(1)),
            TargetRule::LeadingZeros => BigUint::one() << (256 - 4 * Self::leading_zeros(difficulty)),
        }
    }
}

/// Difficulty after a block that took `elapsed_ms` to produce.
pub fn next_difficulty(current: u64, elapsed_ms: u64, config: &ChainConfig) -> u64 {
    let step = (current / config.retarget_divisor.max(1)).max(1);
    match elapsed_ms.cmp(&config.block_time_ms) {
        std::cmp::Ordering::Less => current.saturating_add(step),
        std::cmp::Ordering::Greater => current.saturating_sub(step).max(1),
        std::cmp::Ordering::Equal => current,
    }
}

/// Difficulty a child of `parent` must declare.
///
/// Without a grandparent (the parent is genesis) the parent's difficulty
/// carries over.
pub fn expected_difficulty(parent: &Block, grandparent: Option<&Block>, config: &ChainConfig) -> u64 {
    match grandparent {
        Some(grandparent) => next_difficulty(
            parent.difficulty,
            parent.timestamp.saturating_sub(grandparent.timestamp),
            config,
        ),
        None => parent.difficulty,
    }
}

/// What a candidate block is checked against.
#[derive(Debug, Clone)]
pub struct ChainTip {
    pub latest: Block,
    pub expected_difficulty: u64,
}

/// Full verification of a candidate block on top of `tip`.
///
/// On success returns the replayed block, ready for [`Ledger::commit`].
pub fn verify_block<S: Storage, C: ContractRuntime>(
    ledger: &Ledger<S, C>,
    block: &Block,
    tip: &ChainTip,
) -> Result<ExecutedBlock, ConsensusError> {
    let parent = &tip.latest;
    if block.parent_hash != parent.hash {
        return Err(ConsensusError::ParentMismatch {
            expected: parent.hash.clone(),
            got: block.parent_hash.clone(),
        });
    }
    if block.block_number != parent.block_number + 1 {
        return Err(ConsensusError::HeightMismatch {
            expected: parent.block_number + 1,
            got: block.block_number,
        });
    }
    if block.timestamp < parent.timestamp {
        return Err(ConsensusError::TimestampRegression {
            parent: parent.timestamp,
            got: block.timestamp,
        });
    }

    let computed = block.compute_hash();
    if computed != block.hash {
        return Err(ConsensusError::HashMismatch {
            declared: block.hash.clone(),
            computed,
        });
    }
    if !ledger.config().target_rule.meets(&block.hash, block.difficulty) {
        return Err(ConsensusError::InsufficientWork {
            hash: block.hash.clone(),
            difficulty: block.difficulty,
        });
    }
    if block.difficulty != tip.expected_difficulty {
        return Err(ConsensusError::DifficultyMismatch {
            expected: tip.expected_difficulty,
            got: block.difficulty,
        });
    }

    for (index, tx) in block.transactions.iter().enumerate() {
        let verdict = match tx.is_valid(&**ledger.store(), ledger.config()) {
            Ok(verdict) => verdict,
            Err(TxError::Crypto(err)) => Verdict::Invalid(err.into()),
            Err(TxError::Storage(err)) => return Err(err.into()),
        };
        if let Verdict::Invalid(rejection) = verdict {
            return Err(ConsensusError::InvalidTransaction {
                index,
                reason: rejection.to_string(),
            });
        }
    }

    let executed = ledger.execute(block, &block.transactions)?;
    if let Some(rejected) = executed.rejected.first() {
        return Err(ConsensusError::ReplayRejected {
            index: rejected.index,
            reason: rejected.rejection.to_string(),
        });
    }
    if executed.block.tx_root != block.tx_root {
        return Err(ConsensusError::TxRootMismatch {
            declared: block.tx_root.clone(),
            computed: executed.block.tx_root,
        });
    }
    Ok(executed)
}

/// Increment `block.nonce` until its hash meets the target. Returns `false`
/// if `abort` fired first.
pub fn search_nonce(block: &mut Block, rule: TargetRule, abort: impl Fn() -> bool) -> bool {
    let mut attempts: u64 = 0;
    loop {
        block.hash = block.compute_hash();
        if rule.meets(&block.hash, block.difficulty) {
            return true;
        }
        attempts += 1;
        if attempts % ABORT_CHECK_INTERVAL == 0 && abort() {
            return false;
        }
        block.nonce = block.nonce.wrapping_add(1);
    }
}

/// Synchronous search without cancellation.
pub fn mine_block(mut block: Block, rule: TargetRule) -> Block {
    search_nonce(&mut block, rule, || false);
    block
}

#[derive(Debug, Clone)]
pub struct MineRequest {
    pub block: Block,
    pub difficulty: u64,
}

#[derive(Debug, Clone)]
pub struct MinedBlock {
    pub block: Block,
}

/// Proof-of-work search on a dedicated thread.
///
/// Requests and results travel over bounded channels. Dropping the worker
/// (or calling [`MiningWorker::respawn`]) closes them, which makes an
/// in-flight search stop at its next abort check.
pub struct MiningWorker {
    rule: TargetRule,
    requests: mpsc::Sender<MineRequest>,
    results: mpsc::Receiver<MinedBlock>,
    busy: bool,
    _handle: JoinHandle<()>,
}

impl MiningWorker {
    pub fn spawn(rule: TargetRule) -> Self {
        let (requests, mut inbox) = mpsc::channel::<MineRequest>(1);
        let (outbox, results) = mpsc::channel::<MinedBlock>(1);

        let handle = thread::spawn(move || {
            while let Some(request) = inbox.blocking_recv() {
                let mut block = request.block;
                block.difficulty = request.difficulty;
                block.seal();
                debug!(height = block.block_number, difficulty = block.difficulty, "Searching for nonce");
                if !search_nonce(&mut block, rule, || outbox.is_closed()) {
                    break;
                }
                if outbox.blocking_send(MinedBlock { block }).is_err() {
                    break;
                }
            }
        });

        MiningWorker {
            rule,
            requests,
            results,
            busy: false,
            _handle: handle,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn submit(&mut self, request: MineRequest) -> Result<(), ConsensusError> {
        if self.busy {
            return Err(ConsensusError::WorkerBusy);
        }
        self.requests.try_send(request).map_err(|_| ConsensusError::WorkerGone)?;
        self.busy = true;
        Ok(())
    }

    /// Wait for the in-flight search. `None` once the worker thread is gone.
    pub async fn next_result(&mut self) -> Option<MinedBlock> {
        let result = self.results.recv().await;
        self.busy = false;
        result
    }

    /// Abandon any in-flight search and start a fresh worker.
    pub fn respawn(&mut self) {
        info!("Restarting mining worker");
        *self = MiningWorker::spawn(self.rule);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::NullRuntime;
    use crate::storage::{ChainStore, MemoryStorage};
    use crate::transaction::{KeyPair, Transaction};
    use crate::types::Account;
    use std::sync::Arc;

    fn ledger() -> Ledger<MemoryStorage, NullRuntime> {
        let store = Arc::new(ChainStore::new(MemoryStorage::new()).unwrap());
        Ledger::new(store, Arc::new(NullRuntime), Arc::new(ChainConfig::default()))
    }

    fn candidate(ledger: &Ledger<MemoryStorage, NullRuntime>, parent: &Block, txs: &[Transaction]) -> Block {
        let template = Block::new(
            parent.block_number + 1,
            parent.timestamp + 1_000,
            Vec::new(),
            1,
            parent.hash.clone(),
            "miner",
        );
        let executed = ledger.execute(&template, txs).unwrap();
        mine_block(executed.block, TargetRule::Numeric)
    }

    fn tip(parent: &Block) -> ChainTip {
        ChainTip {
            latest: parent.clone(),
            expected_difficulty: 1,
        }
    }

    #[test]
    fn numeric_target_halves_with_doubled_difficulty() {
        let rule = TargetRule::Numeric;
        assert_eq!(rule.target(1), BigUint::one() << 256u32);
        assert_eq!(rule.target(2), BigUint::one() << 255u32);
        assert_eq!(rule.target(0), rule.target(1));
        assert!(rule.target(1000) < rule.target(999));
    }

    #[test]
    fn leading_zero_rule_counts_hex_digits() {
        assert_eq!(TargetRule::leading_zeros(1), 5);
        assert_eq!(TargetRule::leading_zeros(15), 5);
        assert_eq!(TargetRule::leading_zeros(16), 6);
        assert_eq!(TargetRule::leading_zeros(256), 7);

        let rule = TargetRule::LeadingZeros;
        assert!(rule.meets(&format!("00000{}", "f".repeat(59)), 1));
        assert!(!rule.meets(&format!("0000f{}", "0".repeat(59)), 1));
    }

    #[test]
    fn meets_rejects_malformed_hashes() {
        let rule = TargetRule::Numeric;
        assert!(rule.meets(&"f".repeat(64), 1));
        assert!(!rule.meets(&"f".repeat(64), 2));
        assert!(!rule.meets("abc", 1));
        assert!(!rule.meets(&"z".repeat(64), 1));
    }

    #[test]
    fn difficulty_moves_toward_target_interval() {
        let config = ChainConfig::default();
        assert!(next_difficulty(100, 1_000, &config) > 100);
        assert!(next_difficulty(100, 60_000, &config) < 100);
        assert_eq!(next_difficulty(100, config.block_time_ms, &config), 100);
        assert_eq!(next_difficulty(100, 1_000, &config), 106);
        assert_eq!(next_difficulty(1, 1_000, &config), 2);
        assert_eq!(next_difficulty(1, 60_000, &config), 1);
    }

    #[test]
    fn expected_difficulty_uses_parent_interval() {
        let config = ChainConfig::default();
        let grandparent = Block::new(2, 0, Vec::new(), 10, "a", "m");
        let fast = Block::new(3, 1_000, Vec::new(), 10, "b", "m");
        let slow = Block::new(3, 100_000, Vec::new(), 10, "b", "m");
        assert_eq!(expected_difficulty(&fast, Some(&grandparent), &config), 11);
        assert_eq!(expected_difficulty(&slow, Some(&grandparent), &config), 9);
        assert_eq!(expected_difficulty(&fast, None, &config), 10);
    }

    #[test]
    fn mined_block_meets_its_target() {
        let block = Block::new(2, 10, Vec::new(), 64, "parent", "miner");
        let mined = mine_block(block, TargetRule::Numeric);
        assert_eq!(mined.hash, mined.compute_hash());
        assert!(TargetRule::Numeric.meets(&mined.hash, 64));
    }

    #[test]
    fn verify_accepts_valid_block() {
        let ledger = ledger();
        let genesis = ledger.initialize_chain().unwrap();
        let alice = KeyPair::generate();
        ledger
            .store()
            .put_account(&alice.address(), &Account::with_balance(BigUint::from(10u64).pow(13)))
            .unwrap();
        let mut tx = Transaction::new("bob", "5", "2000000000", 1);
        tx.sign(&alice).unwrap();

        let block = candidate(&ledger, &genesis, &[tx]);
        let executed = verify_block(&ledger, &block, &tip(&genesis)).unwrap();
        assert_eq!(executed.block, block);
    }

    #[test]
    fn verify_rejects_wrong_parent() {
        let ledger = ledger();
        let genesis = ledger.initialize_chain().unwrap();
        let mut block = candidate(&ledger, &genesis, &[]);
        block.parent_hash = "f".repeat(64);
        block.seal();

        let err = verify_block(&ledger, &block, &tip(&genesis)).unwrap_err();
        assert!(matches!(err, ConsensusError::ParentMismatch { .. }));
        assert_eq!(err.kind(), ErrorKind::ConsensusViolation);
    }

    #[test]
    fn verify_rejects_insufficient_work() {
        let ledger = ledger();
        let genesis = ledger.initialize_chain().unwrap();
        let mut block = candidate(&ledger, &genesis, &[]);
        block.difficulty = 1 << 62;
        block.seal();
        while TargetRule::Numeric.meets(&block.hash, block.difficulty) {
            block.nonce += 1;
            block.seal();
        }

        let err = verify_block(&ledger, &block, &tip(&genesis)).unwrap_err();
        assert!(matches!(err, ConsensusError::InsufficientWork { .. }));
    }

    #[test]
    fn verify_rejects_wrong_difficulty_and_tampering() {
        let ledger = ledger();
        let genesis = ledger.initialize_chain().unwrap();

        let mut block = candidate(&ledger, &genesis, &[]);
        block.difficulty = 2;
        let block = mine_block(block, TargetRule::Numeric);
        let err = verify_block(&ledger, &block, &tip(&genesis)).unwrap_err();
        assert!(matches!(err, ConsensusError::DifficultyMismatch { expected: 1, got: 2 }));

        let mut tampered = candidate(&ledger, &genesis, &[]);
        tampered.coinbase = "thief".into();
        let err = verify_block(&ledger, &tampered, &tip(&genesis)).unwrap_err();
        assert!(matches!(err, ConsensusError::HashMismatch { .. }));
    }

    #[test]
    fn verify_rejects_invalid_and_unreplayable_transactions() {
        let ledger = ledger();
        let genesis = ledger.initialize_chain().unwrap();
        let alice = KeyPair::generate();
        ledger
            .store()
            .put_account(&alice.address(), &Account::with_balance(BigUint::from(10u64).pow(13)))
            .unwrap();

        let mut cheap = Transaction::new("bob", "5", "1", 1);
        cheap.sign(&alice).unwrap();
        let mut block = candidate(&ledger, &genesis, &[]);
        block.transactions = vec![cheap];
        block.seal();
        let block = mine_block(block, TargetRule::Numeric);
        let err = verify_block(&ledger, &block, &tip(&genesis)).unwrap_err();
        assert!(matches!(err, ConsensusError::InvalidTransaction { index: 0, .. }));

        let mut skipped = Transaction::new("bob", "5", "2000000000", 2);
        skipped.sign(&alice).unwrap();
        let mut block = candidate(&ledger, &genesis, &[]);
        block.transactions = vec![skipped];
        block.seal();
        let block = mine_block(block, TargetRule::Numeric);
        let err = verify_block(&ledger, &block, &tip(&genesis)).unwrap_err();
        assert!(matches!(err, ConsensusError::ReplayRejected { index: 0, .. }));
    }

    #[tokio::test]
    async fn worker_returns_mined_block_and_survives_respawn() {
        let mut worker = MiningWorker::spawn(TargetRule::Numeric);
        let block = Block::new(2, 10, Vec::new(), 1, "parent", "miner");
        worker
            .submit(MineRequest {
                block: block.clone(),
                difficulty: 16,
            })
            .unwrap();
        assert!(worker.is_busy());
        assert!(matches!(
            worker.submit(MineRequest { block: block.clone(), difficulty: 16 }),
            Err(ConsensusError::WorkerBusy)
        ));

        let mined = worker.next_result().await.unwrap().block;
        assert_eq!(mined.difficulty, 16);
        assert!(TargetRule::Numeric.meets(&mined.hash, 16));
        assert!(!worker.is_busy());

        worker.respawn();
        worker.submit(MineRequest { block, difficulty: 2 }).unwrap();
        assert!(worker.next_result().await.is_some());
    }

    #[tokio::test]
    async fn respawn_abandons_search_in_flight() {
        let mut worker = MiningWorker::spawn(TargetRule::Numeric);
        let stale = Block::new(2, 10, Vec::new(), 1, "parent", "miner");
        worker
            .submit(MineRequest {
                block: stale,
                difficulty: 1 << 60,
            })
            .unwrap();
        assert!(worker.is_busy());
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        worker.respawn();
        assert!(!worker.is_busy());

        let fresh = Block::new(3, 20, Vec::new(), 1, "other", "miner");
        worker
            .submit(MineRequest {
                block: fresh,
                difficulty: 2,
            })
            .unwrap();
        let mined = worker.next_result().await.unwrap().block;
        assert_eq!(mined.block_number, 3);
        assert_eq!(mined.difficulty, 2);

        let late = tokio::time::timeout(std::time::Duration::from_millis(100), worker.next_result()).await;
        assert!(late.is_err());
    }
}
