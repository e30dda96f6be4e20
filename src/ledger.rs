use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use num_bigint::{BigInt, BigUint};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::block::Block;
use crate::config::ChainConfig;
use crate::contracts::{BlockContext, CallContext, ContractRuntime, ExecutionRequest, TxContext};
use crate::merkle::merkle_root;
use crate::storage::{
    stage_account, stage_block, stage_code, stage_storage, ChainStore, StateView, Storage,
    StorageBatch, StorageError,
};
use crate::transaction::{CheckedTx, Rejection, Transaction, TxPayload};
use crate::types::{sha256_hex, Account, Address, ErrorKind, Hash, EMPTY_HASH};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Internal
    }
}

/// A candidate transaction the transition refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedTx {
    pub index: usize,
    pub hash: Hash,
    pub rejection: Rejection,
}

/// Post-state produced by executing a block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateDiff {
    pub accounts: BTreeMap<Address, Account>,
    pub code: BTreeMap<Hash, String>,
    /// Full storage of every contract whose storage was written.
    pub storage: BTreeMap<Address, BTreeMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedBlock {
    pub block: Block,
    pub diff: StateDiff,
    pub rejected: Vec<RejectedTx>,
    /// Σ(gas + contractGas) over accepted transactions.
    pub total_gas: BigUint,
    pub total_contract_gas: BigUint,
}

pub struct Ledger<S: Storage, C: ContractRuntime> {
    store: Arc<ChainStore<S>>,
    runtime: Arc<C>,
    config: Arc<ChainConfig>,
}

impl<S: Storage, C: ContractRuntime> Ledger<S, C> {
    pub fn new(store: Arc<ChainStore<S>>, runtime: Arc<C>, config: Arc<ChainConfig>) -> Self {
        Ledger { store, runtime, config }
    }

    pub fn store(&self) -> &Arc<ChainStore<S>> {
        &self.store
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    /// Commit the genesis block on an empty store; otherwise return the
    /// latest persisted block.
    pub fn initialize_chain(&self) -> Result<Block, LedgerError> {
        if let Some(latest) = self.store.latest_block()? {
            info!(height = latest.block_number, "Chain already initialized");
            return Ok(latest);
        }

        let genesis = Block::genesis(&self.config);
        let mut transition = Transition::new(self, &genesis);
        transition.states.insert(
            self.config.first_account.clone(),
            Account::with_balance(self.config.initial_supply.clone()),
        );
        transition.code.insert(EMPTY_HASH.to_string(), String::new());
        let executed = transition.finish(&genesis)?;
        self.commit(&executed)?;
        info!(hash = %executed.block.hash, "Chain initialized with genesis block");
        Ok(executed.block)
    }

    /// Run the transition over `candidates` on top of committed state.
    ///
    /// `template` supplies the header (number, timestamp, difficulty,
    /// parent, coinbase, nonce); the returned block carries the accepted
    /// transactions with `tx_root` and `hash` recomputed.
    pub fn execute(&self, template: &Block, candidates: &[Transaction]) -> Result<ExecutedBlock, LedgerError> {
        let mut transition = Transition::new(self, template);

        for (index, tx) in candidates.iter().enumerate() {
            let checked = match tx.checked() {
                Ok(checked) => checked,
                Err(rejection) => {
                    transition.reject(index, tx, rejection);
                    continue;
                }
            };
            if &transition.total_contract_gas + checked.contract_gas() > self.config.block_gas_limit {
                for (index, tx) in candidates.iter().enumerate().skip(index) {
                    transition.reject(index, tx, Rejection::GasLimitReached);
                }
                break;
            }
            transition.apply(index, tx, checked)?;
        }

        transition.finish(template)
    }

    /// Persist an executed block: accounts, code, contract storage, the
    /// block itself, its hash index and the latest-block counter, atomically.
    pub fn commit(&self, executed: &ExecutedBlock) -> Result<(), LedgerError> {
        let mut batch = StorageBatch::default();
        for (address, account) in &executed.diff.accounts {
            stage_account(&mut batch, address, account)?;
        }
        for (code_hash, code) in &executed.diff.code {
            stage_code(&mut batch, code_hash, code);
        }
        for (address, entries) in &executed.diff.storage {
            for (key, value) in entries {
                stage_storage(&mut batch, address, key, value);
            }
        }
        stage_block(&mut batch, &executed.block)?;
        self.store.apply_batch(batch)?;
        Ok(())
    }
}

/// Merkle root over a contract's storage, leaves `key ‖ " " ‖ value` in key order.
pub fn storage_root(entries: &BTreeMap<String, String>) -> Hash {
    merkle_root(entries.iter().map(|(key, value)| format!("{key} {value}")))
}

/// Tentative state for one batch.
struct Transition<'a, S: Storage, C: ContractRuntime> {
    store: &'a ChainStore<S>,
    runtime: &'a C,
    config: &'a ChainConfig,
    block: BlockContext,
    states: BTreeMap<Address, Account>,
    code: BTreeMap<Hash, String>,
    storage: BTreeMap<Address, BTreeMap<String, String>>,
    written_storage: BTreeSet<Address>,
    poisoned: HashSet<Address>,
    accepted: Vec<Transaction>,
    rejected: Vec<RejectedTx>,
    total_gas: BigUint,
    total_contract_gas: BigUint,
}

impl<'a, S: Storage, C: ContractRuntime> Transition<'a, S, C> {
    fn new(ledger: &'a Ledger<S, C>, header: &Block) -> Self {
        Transition {
            store: &ledger.store,
            runtime: &ledger.runtime,
            config: &ledger.config,
            block: BlockContext {
                block_number: header.block_number,
                timestamp: header.timestamp,
                difficulty: header.difficulty,
                parent_hash: header.parent_hash.clone(),
                coinbase: header.coinbase.clone(),
            },
            states: BTreeMap::new(),
            code: BTreeMap::new(),
            storage: BTreeMap::new(),
            written_storage: BTreeSet::new(),
            poisoned: HashSet::new(),
            accepted: Vec::new(),
            rejected: Vec::new(),
            total_gas: BigUint::default(),
            total_contract_gas: BigUint::default(),
        }
    }

    fn account(&self, address: &str) -> Result<Option<Account>, StorageError> {
        match self.states.get(address) {
            Some(account) => Ok(Some(account.clone())),
            None => self.store.account(address),
        }
    }

    fn account_or_empty(&self, address: &str) -> Result<Account, StorageError> {
        Ok(self.account(address)?.unwrap_or_default())
    }

    fn code_for(&self, code_hash: &str) -> Result<Option<String>, StorageError> {
        match self.code.get(code_hash) {
            Some(code) => Ok(Some(code.clone())),
            None => self.store.code(code_hash),
        }
    }

    fn storage_for(&mut self, address: &str) -> Result<&mut BTreeMap<String, String>, StorageError> {
        if !self.storage.contains_key(address) {
            let entries = self.store.storage_entries(address)?;
            self.storage.insert(address.to_string(), entries);
        }
        Ok(self.storage.entry(address.to_string()).or_default())
    }

    fn reject(&mut self, index: usize, tx: &Transaction, rejection: Rejection) {
        debug!(index, %rejection, "Transaction left out of batch");
        self.rejected.push(RejectedTx {
            index,
            hash: tx.hash(),
            rejection,
        });
    }

    fn poison(&mut self, index: usize, tx: &Transaction, sender: Address, rejection: Rejection) {
        self.poisoned.insert(sender);
        self.reject(index, tx, rejection);
    }

    fn apply(&mut self, index: usize, tx: &Transaction, checked: CheckedTx) -> Result<(), StorageError> {
        let sender = match tx.sender() {
            Ok(sender) => sender,
            Err(err) => {
                self.reject(index, tx, err.into());
                return Ok(());
            }
        };
        if self.poisoned.contains(&sender) {
            self.reject(index, tx, Rejection::SenderPoisoned(sender));
            return Ok(());
        }

        let Some(sender_account) = self.account(&sender)? else {
            let rejection = Rejection::UnknownSender(sender.clone());
            self.poison(index, tx, sender, rejection);
            return Ok(());
        };
        if sender_account.is_contract() {
            let rejection = Rejection::ContractSender(sender.clone());
            self.poison(index, tx, sender, rejection);
            return Ok(());
        }
        let expected = sender_account.nonce + 1;
        if tx.nonce != expected {
            let rejection = Rejection::NonceMismatch { expected, got: tx.nonce };
            self.poison(index, tx, sender, rejection);
            return Ok(());
        }

        // Work on copies; nothing lands in `states` unless the debit holds.
        let mut balance = BigInt::from(sender_account.balance.clone()) - BigInt::from(checked.total_cost());
        let mut next_sender = sender_account;
        let mut next_recipient = None;
        if tx.recipient == sender {
            balance += BigInt::from(checked.amount.clone());
        } else {
            let mut recipient = self.account_or_empty(&tx.recipient)?;
            recipient.balance += &checked.amount;
            next_recipient = Some(recipient);
        }

        let mut deployed = None;
        if let TxPayload::ContractDeploy { code } = &checked.payload {
            if !next_sender.is_contract() {
                let code_hash = sha256_hex(code);
                next_sender.code_hash = code_hash.clone();
                deployed = Some((code_hash, code.clone()));
            }
        }
        next_sender.nonce += 1;

        let Some(balance) = balance.to_biguint() else {
            self.poison(index, tx, sender, Rejection::InsufficientBalance);
            return Ok(());
        };
        next_sender.balance = balance;

        self.states.insert(sender.clone(), next_sender);
        if let Some(recipient) = next_recipient {
            self.states.insert(tx.recipient.clone(), recipient);
        }
        if let Some((code_hash, code)) = deployed {
            self.code.insert(code_hash, code);
        }
        self.total_contract_gas += checked.contract_gas();
        self.total_gas += checked.fee();
        self.accepted.push(tx.clone());

        let recipient_code = self
            .states
            .get(&tx.recipient)
            .filter(|account| account.is_contract())
            .map(|account| account.code_hash.clone());
        if let Some(code_hash) = recipient_code {
            self.call_contract(tx, sender, &checked, &code_hash)?;
        }
        Ok(())
    }

    fn call_contract(
        &mut self,
        tx: &Transaction,
        sender: Address,
        checked: &CheckedTx,
        code_hash: &str,
    ) -> Result<(), StorageError> {
        let Some(code) = self.code_for(code_hash)? else {
            warn!(contract = %tx.recipient, code_hash, "Contract code missing, call skipped");
            return Ok(());
        };
        let storage = self.storage_for(&tx.recipient)?.clone();
        let gas_budget = checked.contract_gas();
        let tx_context = TxContext {
            hash: tx.hash(),
            sender,
            recipient: tx.recipient.clone(),
            amount: checked.amount.clone(),
            nonce: tx.nonce,
        };
        let call = CallContext {
            address: tx.recipient.clone(),
        };

        let outcome = self.runtime.execute(ExecutionRequest {
            code: &code,
            states: &self.states,
            storage: &storage,
            gas_budget: &gas_budget,
            block: &self.block,
            tx: &tx_context,
            call: &call,
        });

        match outcome {
            Ok(outcome) => {
                self.states.extend(outcome.states);
                if !outcome.storage.is_empty() {
                    self.storage_for(&tx.recipient)?.extend(outcome.storage);
                    self.written_storage.insert(tx.recipient.clone());
                }
            }
            Err(err) => {
                warn!(contract = %tx.recipient, tx = %tx_context.hash, error = %err, "Contract execution failed, gas kept");
            }
        }
        Ok(())
    }

    /// Refresh storage roots, credit the coinbase and seal the block.
    fn finish(mut self, header: &Block) -> Result<ExecutedBlock, LedgerError> {
        let mut storage = BTreeMap::new();
        for address in std::mem::take(&mut self.written_storage) {
            let entries = self.storage.remove(&address).unwrap_or_default();
            let mut account = self.account_or_empty(&address)?;
            account.storage_root = storage_root(&entries);
            self.states.insert(address.clone(), account);
            storage.insert(address, entries);
        }

        let mut coinbase = self.account_or_empty(&header.coinbase)?;
        coinbase.balance += &self.config.block_reward + &self.total_gas;
        self.states.insert(header.coinbase.clone(), coinbase);

        let mut block = header.clone();
        block.transactions = self.accepted;
        block.seal();

        Ok(ExecutedBlock {
            block,
            diff: StateDiff {
                accounts: self.states,
                code: self.code,
                storage,
            },
            rejected: self.rejected,
            total_gas: self.total_gas,
            total_contract_gas: self.total_contract_gas,
        })
    }
}
