//! Smart contract execution hook.
//!
//! The interpreter itself lives outside the core. The transition engine only
//! sees [`ContractRuntime`]: a call receives the contract code, a snapshot of
//! the tentative account states, the contract's current storage, a gas
//! budget and the block/transaction/call context, and returns account and
//! storage deltas. Nothing is shared with the caller beyond the return value.

use std::collections::BTreeMap;

use num_bigint::BigUint;
use thiserror::Error;

use crate::types::{Account, Address, ErrorKind, Hash};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContractError {
    #[error("Out of gas (budget {budget})")]
    OutOfGas { budget: BigUint },
    #[error("Execution error: {0}")]
    ExecutionError(String),
    #[error("Invalid code: {0}")]
    InvalidCode(String),
}

impl ContractError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::ExecutionFailure
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockContext {
    pub block_number: u64,
    pub timestamp: u64,
    pub difficulty: u64,
    pub parent_hash: Hash,
    pub coinbase: Address,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxContext {
    pub hash: Hash,
    pub sender: Address,
    pub recipient: Address,
    pub amount: BigUint,
    pub nonce: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    /// Address of the contract being executed.
    pub address: Address,
}

pub struct ExecutionRequest<'a> {
    pub code: &'a str,
    pub states: &'a BTreeMap<Address, Account>,
    pub storage: &'a BTreeMap<String, String>,
    pub gas_budget: &'a BigUint,
    pub block: &'a BlockContext,
    pub tx: &'a TxContext,
    pub call: &'a CallContext,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOutcome {
    /// Accounts whose state changed during the call.
    pub states: BTreeMap<Address, Account>,
    /// Storage keys written by the call.
    pub storage: BTreeMap<String, String>,
}

pub trait ContractRuntime: Send + Sync {
    fn execute(&self, request: ExecutionRequest<'_>) -> Result<ExecutionOutcome, ContractError>;
}

/// Runtime for nodes without an interpreter: every call succeeds and
/// changes nothing beyond the value transfer already applied.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullRuntime;

impl ContractRuntime for NullRuntime {
    fn execute(&self, _request: ExecutionRequest<'_>) -> Result<ExecutionOutcome, ContractError> {
        Ok(ExecutionOutcome::default())
    }
}
