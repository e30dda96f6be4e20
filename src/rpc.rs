use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::block::Block;
use crate::storage::{ChainStore, StateView, Storage, StorageError};
use crate::sync::NetworkMessage;
use crate::transaction::{KeyPair, Transaction};
use crate::types::{Account, CryptoError, ErrorKind};

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Invalid option.")]
    InvalidOption(String),
    #[error("Invalid request.")]
    InvalidRequest,
    #[error("Invalid block number.")]
    InvalidBlockNumber,
    #[error("Invalid block hash.")]
    InvalidBlockHash,
    #[error("Invalid transaction index.")]
    InvalidTxIndex,
    #[error("Node is not accepting transactions.")]
    NodeUnavailable,
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl RpcError {
    /// HTTP-style status a front end may map this to.
    pub fn status(&self) -> u16 {
        match self {
            RpcError::InvalidOption(_) => 404,
            RpcError::Storage(_) | RpcError::Crypto(_) | RpcError::NodeUnavailable => 500,
            _ => 400,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RpcError::Storage(_) | RpcError::NodeUnavailable => ErrorKind::Internal,
            RpcError::Crypto(_) => ErrorKind::InvalidSignature,
            _ => ErrorKind::MalformedInput,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorBody {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub success: bool,
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorBody>,
}

impl RpcResponse {
    pub fn ok(payload: Value) -> Self {
        RpcResponse {
            success: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn failure(error: &RpcError) -> Self {
        RpcResponse {
            success: false,
            payload: None,
            error: Some(RpcErrorBody {
                message: error.to_string(),
            }),
        }
    }
}

fn str_param<'a>(params: &'a Value, name: &str) -> Result<&'a str, RpcError> {
    params.get(name).and_then(Value::as_str).ok_or(RpcError::InvalidRequest)
}

fn u64_param(params: &Value, name: &str) -> Result<u64, RpcError> {
    params.get(name).and_then(Value::as_u64).ok_or(RpcError::InvalidRequest)
}

fn tx_param(params: &Value) -> Result<Transaction, RpcError> {
    let raw = params.get("transaction").filter(|v| v.is_object()).ok_or(RpcError::InvalidRequest)?;
    serde_json::from_value(raw.clone()).map_err(|_| RpcError::InvalidRequest)
}

pub struct RpcApi<S: Storage> {
    store: Arc<ChainStore<S>>,
    key_pair: KeyPair,
    mining: bool,
    /// Inbox of the local node; `sendTxn` lands there.
    node_inbox: Option<mpsc::Sender<NetworkMessage>>,
}

impl<S: Storage> RpcApi<S> {
    pub fn new(
        store: Arc<ChainStore<S>>,
        key_pair: KeyPair,
        mining: bool,
        node_inbox: Option<mpsc::Sender<NetworkMessage>>,
    ) -> Self {
        RpcApi {
            store,
            key_pair,
            mining,
            node_inbox,
        }
    }

    /// Dispatch `method` and wrap the outcome.
    pub fn handle(&self, method: &str, params: &Value) -> RpcResponse {
        match self.call(method, params) {
            Ok(payload) => RpcResponse::ok(payload),
            Err(e) => RpcResponse::failure(&e),
        }
    }

    pub fn call(&self, method: &str, params: &Value) -> Result<Value, RpcError> {
        match method {
            "getBlockNumber" => Ok(json!({ "blockNumber": self.latest_number()? })),
            "getAddress" => Ok(json!({ "address": self.key_pair.address() })),
            "getWork" => {
                let latest = self.block_by_number(self.latest_number()?)?;
                Ok(json!({ "hash": latest.hash, "nonce": latest.nonce }))
            }
            "mining" => Ok(json!({ "mining": self.mining })),
            "getBlockByHash" => {
                let block = self.block_by_hash(str_param(params, "hash")?)?;
                Ok(json!({ "block": block }))
            }
            "getBlockByNumber" => {
                let block = self.block_by_number(u64_param(params, "blockNumber")?)?;
                Ok(json!({ "block": block }))
            }
            "getBlockTxnCountByHash" => {
                let block = self.block_by_hash(str_param(params, "hash")?)?;
                Ok(json!({ "count": block.transactions.len() }))
            }
            "getBlockTxnCountByNumber" => {
                let block = self.block_by_number(u64_param(params, "blockNumber")?)?;
                Ok(json!({ "count": block.transactions.len() }))
            }
            "getBalance" => {
                let account = self.account(params)?;
                Ok(json!({ "balance": account.balance.to_string() }))
            }
            "getCode" => {
                let code = self
                    .store
                    .code(str_param(params, "codeHash")?)?
                    .ok_or(RpcError::InvalidRequest)?;
                Ok(json!({ "code": code }))
            }
            "getCodeHash" => Ok(json!({ "codeHash": self.account(params)?.code_hash })),
            "getStorage" => {
                let address = str_param(params, "address")?;
                let key = str_param(params, "key")?;
                self.account(params)?;
                Ok(json!({ "storage": self.store.storage_value(address, key)? }))
            }
            "getStorageKeys" => {
                self.account(params)?;
                let keys = self.store.storage_keys(str_param(params, "address")?)?;
                Ok(json!({ "storage": keys }))
            }
            "getStorageRoot" => Ok(json!({ "storageRoot": self.account(params)?.storage_root })),
            "getTxnByBlockNumberAndIndex" => {
                let block = self.block_by_number(u64_param(params, "blockNumber")?)?;
                let tx = Self::tx_at(&block, u64_param(params, "index")?)?;
                Ok(json!({ "transaction": tx }))
            }
            "getTxnByBlockHashAndIndex" => {
                let block = self.block_by_hash(str_param(params, "hash")?)?;
                let tx = Self::tx_at(&block, u64_param(params, "index")?)?;
                Ok(json!({ "transaction": tx }))
            }
            "sendTxn" => {
                let tx = tx_param(params)?;
                let inbox = self.node_inbox.as_ref().ok_or(RpcError::NodeUnavailable)?;
                inbox
                    .try_send(NetworkMessage::CreateTransaction(tx))
                    .map_err(|_| RpcError::NodeUnavailable)?;
                Ok(json!({ "message": "tx received." }))
            }
            "signTxn" => {
                let mut tx = tx_param(params)?;
                tx.sign(&self.key_pair)?;
                Ok(json!({ "transaction": tx }))
            }
            other => Err(RpcError::InvalidOption(other.to_string())),
        }
    }

    fn latest_number(&self) -> Result<u64, RpcError> {
        Ok(self.store.latest_block_number()?.unwrap_or(0))
    }

    fn block_by_number(&self, number: u64) -> Result<Block, RpcError> {
        if number == 0 || number > self.latest_number()? {
            return Err(RpcError::InvalidBlockNumber);
        }
        self.store.block_by_number(number)?.ok_or(RpcError::InvalidBlockNumber)
    }

    fn block_by_hash(&self, hash: &str) -> Result<Block, RpcError> {
        self.store.block_by_hash(hash)?.ok_or(RpcError::InvalidBlockHash)
    }

    fn tx_at(block: &Block, index: u64) -> Result<Transaction, RpcError> {
        usize::try_from(index)
            .ok()
            .and_then(|index| block.transactions.get(index))
            .cloned()
            .ok_or(RpcError::InvalidTxIndex)
    }

    /// Account named by the `address` param; unknown addresses are invalid requests.
    fn account(&self, params: &Value) -> Result<Account, RpcError> {
        self.store
            .account(str_param(params, "address")?)?
            .ok_or(RpcError::InvalidRequest)
    }
}
