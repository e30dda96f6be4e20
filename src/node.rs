use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::block::Block;
use crate::config::ChainConfig;
use crate::consensus::{expected_difficulty, verify_block, ChainTip, ConsensusError, MineRequest, MiningWorker};
use crate::contracts::ContractRuntime;
use crate::ledger::{ExecutedBlock, Ledger, LedgerError};
use crate::storage::{ChainStore, Storage, StorageError};
use crate::sync::{ChainSync, NetworkMessage, SyncError, Transport};
use crate::transaction::Transaction;
use crate::txpool::{PoolError, TxPool};
use crate::types::{now_millis, Address, ErrorKind, Hash};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),
    #[error("Ledger error: {0}")]
    LedgerError(#[from] LedgerError),
    #[error("Block rejected: {0}")]
    ConsensusError(#[from] ConsensusError),
    #[error("Transaction not pooled: {0}")]
    PoolError(#[from] PoolError),
    #[error("Network error: {0}")]
    SyncError(#[from] SyncError),
    #[error("Chain has no block #{0}")]
    MissingBlock(u64),
}

impl NodeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NodeError::StorageError(e) => e.kind(),
            NodeError::LedgerError(e) => e.kind(),
            NodeError::ConsensusError(e) => e.kind(),
            NodeError::PoolError(e) => e.kind(),
            NodeError::SyncError(e) => e.kind(),
            NodeError::MissingBlock(_) => ErrorKind::Internal,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeOptions {
    /// Address peers use to reach this node.
    pub my_address: String,
    /// Credited with reward and fees of blocks this node mines.
    pub coinbase: Address,
    pub mining: bool,
    /// Start by requesting blocks from peers instead of mining.
    pub chain_request: bool,
    /// Dialled at startup, subject to the same limit as handshakes.
    pub peers: Vec<String>,
}

/// A message the node wants delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// To every peer except ourselves.
    Broadcast(NetworkMessage),
    SendTo { address: String, message: NetworkMessage },
    Connect(String),
}

#[derive(Debug, Default)]
pub struct Effects {
    pub outbound: Vec<Outbound>,
    pub committed: Option<Block>,
    /// A competing block was committed; the current search is stale.
    pub abort_mining: bool,
}

/// Everything the node knows about the chain besides the stores.
pub struct NodeState {
    pub latest_block: Block,
    /// Difficulty the next block must declare.
    pub difficulty: u64,
    pub pool: TxPool,
    pub sync: ChainSync,
    checked_blocks: LruCache<Hash, ()>,
    peers: HashSet<String>,
}

impl NodeState {
    /// Record `hash` as seen. `false` if it already was.
    fn check_block(&mut self, hash: &Hash) -> bool {
        if self.checked_blocks.contains(hash) {
            return false;
        }
        self.checked_blocks.put(hash.clone(), ());
        true
    }
}

pub struct Node<S: Storage, C: ContractRuntime> {
    ledger: Ledger<S, C>,
    options: NodeOptions,
    state: NodeState,
}

impl<S: Storage, C: ContractRuntime> Node<S, C> {
    /// Initialize (or resume) the chain and build the node state around it.
    pub fn open(ledger: Ledger<S, C>, options: NodeOptions) -> Result<Self, NodeError> {
        let latest_block = ledger.initialize_chain()?;
        let parent = match latest_block.block_number {
            0 | 1 => None,
            number => Some(
                ledger
                    .store()
                    .block_by_number(number - 1)?
                    .ok_or(NodeError::MissingBlock(number - 1))?,
            ),
        };
        let config = ledger.config();
        let difficulty = expected_difficulty(&latest_block, parent.as_ref(), config);
        let capacity = NonZeroUsize::new(config.checked_block_capacity).unwrap_or(NonZeroUsize::MIN);
        let sync = if options.chain_request {
            ChainSync::starting_after(latest_block.block_number)
        } else {
            ChainSync::disabled()
        };

        info!(
            height = latest_block.block_number,
            difficulty,
            syncing = sync.is_active(),
            "Node ready"
        );
        let state = NodeState {
            latest_block,
            difficulty,
            pool: TxPool::new(config.pool_capacity),
            sync,
            checked_blocks: LruCache::new(capacity),
            peers: HashSet::new(),
        };
        Ok(Node { ledger, options, state })
    }

    pub fn ledger(&self) -> &Ledger<S, C> {
        &self.ledger
    }

    pub fn store(&self) -> &Arc<ChainStore<S>> {
        self.ledger.store()
    }

    pub fn config(&self) -> &ChainConfig {
        self.ledger.config()
    }

    pub fn options(&self) -> &NodeOptions {
        &self.options
    }

    pub fn state(&self) -> &NodeState {
        &self.state
    }

    pub fn latest_block(&self) -> &Block {
        &self.state.latest_block
    }

    pub fn is_syncing(&self) -> bool {
        self.state.sync.is_active()
    }

    pub fn peers(&self) -> impl Iterator<Item = &String> {
        self.state.peers.iter()
    }

    /// Connect to the configured peers, then ask them for blocks if syncing.
    pub fn startup_messages(&mut self) -> Vec<Outbound> {
        let mut outbound = Vec::new();
        for peer in self.options.peers.clone() {
            outbound.extend(self.on_handshake(peer).outbound);
        }
        if self.is_syncing() {
            outbound.push(Outbound::Broadcast(self.state.sync.request(&self.options.my_address)));
        }
        outbound
    }

    fn tip(&self) -> ChainTip {
        ChainTip {
            latest: self.state.latest_block.clone(),
            expected_difficulty: self.state.difficulty,
        }
    }

    pub fn handle_message(&mut self, message: NetworkMessage) -> Result<Effects, NodeError> {
        match message {
            NetworkMessage::NewBlock(block) => self.on_new_block(block),
            NetworkMessage::CreateTransaction(tx) => self.on_transaction(tx),
            NetworkMessage::RequestBlock {
                block_number,
                request_address,
            } => self.on_block_request(block_number, request_address),
            NetworkMessage::SendBlock(block) => self.on_sync_block(block),
            NetworkMessage::Handshake(address) => Ok(self.on_handshake(address)),
        }
    }

    fn on_new_block(&mut self, block: Block) -> Result<Effects, NodeError> {
        if !self.state.check_block(&block.hash) {
            debug!(hash = %block.hash, "Block already checked");
            return Ok(Effects::default());
        }
        if block.block_number <= self.state.latest_block.block_number {
            debug!(
                height = block.block_number,
                latest = self.state.latest_block.block_number,
                "Ignoring stale block"
            );
            return Ok(Effects::default());
        }

        let executed = verify_block(&self.ledger, &block, &self.tip())?;
        info!(height = block.block_number, hash = %block.hash, "New block received");
        self.commit(executed)?;
        self.state.sync.finish();
        Ok(Effects {
            outbound: vec![Outbound::Broadcast(NetworkMessage::NewBlock(block.clone()))],
            committed: Some(block),
            abort_mining: true,
        })
    }

    fn on_transaction(&mut self, tx: Transaction) -> Result<Effects, NodeError> {
        if self.is_syncing() {
            return Ok(Effects::default());
        }
        let hash = match self
            .state
            .pool
            .add_transaction(tx.clone(), &**self.ledger.store(), self.ledger.config())
        {
            Ok(hash) => hash,
            Err(PoolError::Duplicate) => {
                debug!(hash = %tx.hash(), nonce = tx.nonce, "Transaction already pooled");
                return Ok(Effects::default());
            }
            Err(err) => return Err(err.into()),
        };
        info!(%hash, "New transaction received, broadcasted and added to pool");
        Ok(Effects {
            outbound: vec![Outbound::Broadcast(NetworkMessage::CreateTransaction(tx))],
            ..Effects::default()
        })
    }

    fn on_block_request(&mut self, block_number: u64, request_address: String) -> Result<Effects, NodeError> {
        if self.is_syncing() || block_number == 0 || block_number > self.state.latest_block.block_number {
            return Ok(Effects::default());
        }
        let block = self
            .ledger
            .store()
            .block_by_number(block_number)?
            .ok_or(NodeError::MissingBlock(block_number))?;
        info!(height = block_number, peer = %request_address, "Sending block");
        Ok(Effects {
            outbound: vec![Outbound::SendTo {
                address: request_address,
                message: NetworkMessage::SendBlock(block),
            }],
            ..Effects::default()
        })
    }

    fn on_sync_block(&mut self, block: Block) -> Result<Effects, NodeError> {
        if !self.state.sync.expects(block.block_number) {
            debug!(height = block.block_number, "Unrequested block");
            return Ok(Effects::default());
        }
        let executed = verify_block(&self.ledger, &block, &self.tip())?;
        self.commit(executed)?;
        self.state.check_block(&block.hash);
        self.state.sync.advance();
        info!(height = block.block_number, "Synced block");
        Ok(Effects {
            outbound: vec![Outbound::Broadcast(self.state.sync.request(&self.options.my_address))],
            committed: Some(block),
            abort_mining: false,
        })
    }

    fn on_handshake(&mut self, address: String) -> Effects {
        if address == self.options.my_address
            || self.state.peers.contains(&address)
            || self.state.peers.len() >= self.ledger.config().max_peers
        {
            return Effects::default();
        }
        self.state.peers.insert(address.clone());
        Effects {
            outbound: vec![Outbound::Connect(address)],
            ..Effects::default()
        }
    }

    /// Pool a locally created transaction and announce it.
    pub fn submit_transaction(&mut self, tx: Transaction) -> Result<Effects, NodeError> {
        let hash = self
            .state
            .pool
            .add_transaction(tx.clone(), &**self.ledger.store(), self.ledger.config())?;
        info!(%hash, "Transaction submitted");
        Ok(Effects {
            outbound: vec![Outbound::Broadcast(NetworkMessage::CreateTransaction(tx))],
            ..Effects::default()
        })
    }

    /// Assemble a candidate from the pool for the mining worker. `None`
    /// while syncing.
    pub fn prepare_block(&self, timestamp: u64) -> Result<Option<MineRequest>, NodeError> {
        if self.is_syncing() {
            return Ok(None);
        }
        let latest = &self.state.latest_block;
        let template = Block::new(
            latest.block_number + 1,
            timestamp.max(latest.timestamp),
            Vec::new(),
            self.state.difficulty,
            latest.hash.clone(),
            self.options.coinbase.clone(),
        );
        let executed = self.ledger.execute(&template, &self.state.pool.transactions())?;
        for rejected in &executed.rejected {
            debug!(hash = %rejected.hash, reason = %rejected.rejection, "Left out of candidate");
        }
        Ok(Some(MineRequest {
            block: executed.block,
            difficulty: self.state.difficulty,
        }))
    }

    /// Verify and commit a block found by our own worker. A block whose
    /// parent is no longer the tip is dropped.
    pub fn accept_mined(&mut self, block: Block) -> Result<Effects, NodeError> {
        if block.parent_hash != self.state.latest_block.hash {
            debug!(height = block.block_number, "Mined block went stale");
            return Ok(Effects::default());
        }
        let executed = verify_block(&self.ledger, &block, &self.tip())?;
        self.state.check_block(&block.hash);
        self.commit(executed)?;
        info!(height = block.block_number, hash = %block.hash, "Block mined");
        Ok(Effects {
            outbound: vec![Outbound::Broadcast(NetworkMessage::NewBlock(block.clone()))],
            committed: Some(block),
            abort_mining: false,
        })
    }

    fn commit(&mut self, executed: ExecutedBlock) -> Result<(), NodeError> {
        self.ledger.commit(&executed)?;
        let block = executed.block;
        let config = self.ledger.config();
        self.state.difficulty = expected_difficulty(&block, Some(&self.state.latest_block), config);
        info!(
            height = block.block_number,
            transactions = block.transactions.len(),
            next_difficulty = self.state.difficulty,
            "Block committed, state transited"
        );
        self.state.latest_block = block;
        self.state
            .pool
            .clear_depreciated_txns(&**self.ledger.store(), self.ledger.config())?;
        Ok(())
    }
}

async fn dispatch<T: Transport + ?Sized>(transport: &T, outbound: Vec<Outbound>) {
    for out in outbound {
        let result = match &out {
            Outbound::Broadcast(message) => transport.send_to_all(message, true).await,
            Outbound::SendTo { address, message } => transport.send_to(address, message).await,
            Outbound::Connect(address) => transport.connect(address).await,
        };
        if let Err(e) = result {
            warn!(error = %e, "Failed to deliver {:?}", out);
        }
    }
}

async fn next_mined(worker: &mut Option<MiningWorker>) -> Option<Block> {
    match worker {
        Some(worker) if worker.is_busy() => worker.next_result().await.map(|mined| mined.block),
        _ => std::future::pending().await,
    }
}

/// Drive `node` until `shutdown` fires or the inbound channel closes.
///
/// Inbound messages are processed one at a time to completion. When mining
/// is enabled a candidate is handed to the worker on every mining interval
/// unless a search is already running.
pub async fn run<S, C, T>(
    mut node: Node<S, C>,
    transport: Arc<T>,
    mut inbound: mpsc::Receiver<NetworkMessage>,
    mut shutdown: oneshot::Receiver<()>,
) -> Result<Node<S, C>, NodeError>
where
    S: Storage,
    C: ContractRuntime,
    T: Transport + ?Sized,
{
    let mut worker = node
        .options
        .mining
        .then(|| MiningWorker::spawn(node.config().target_rule));
    let mut ticker = interval(Duration::from_millis(node.config().mining_interval_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    dispatch(&*transport, node.startup_messages()).await;

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            message = inbound.recv() => {
                let Some(message) = message else { break };
                let name = message.name();
                match node.handle_message(message) {
                    Ok(effects) => {
                        if effects.abort_mining {
                            if let Some(worker) = worker.as_mut() {
                                worker.respawn();
                            }
                        }
                        dispatch(&*transport, effects.outbound).await;
                    }
                    Err(e) => warn!(message = name, error = %e, "Message rejected"),
                }
            }
            mined = next_mined(&mut worker) => {
                match mined {
                    Some(block) => match node.accept_mined(block) {
                        Ok(effects) => dispatch(&*transport, effects.outbound).await,
                        Err(e) => warn!(error = %e, "Mined block rejected"),
                    },
                    None => {
                        if let Some(worker) = worker.as_mut() {
                            worker.respawn();
                        }
                    }
                }
            }
            _ = ticker.tick() => {
                if let Some(worker) = worker.as_mut() {
                    if !worker.is_busy() {
                        match node.prepare_block(now_millis()) {
                            Ok(Some(request)) => {
                                if let Err(e) = worker.submit(request) {
                                    warn!(error = %e, "Could not start mining");
                                }
                            }
                            Ok(None) => {}
                            Err(e) => warn!(error = %e, "Could not assemble block"),
                        }
                    }
                }
            }
        }
    }

    info!("Node stopped");
    Ok(node)
}
