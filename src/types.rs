use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Lowercase hex SHA-256 digest.
pub type Hash = String;

/// Account address: the hex SHA-256 digest of an uncompressed public key.
pub type Address = String;

/// Reserved sentinel meaning "no code" / "no storage" (SHA-256 of the empty string).
pub const EMPTY_HASH: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Errors that can occur during cryptographic operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),
    #[error("Invalid private key")]
    InvalidPrivateKey,
    #[error("Signing failed: {0}")]
    SigningFailed(String),
}

/// Coarse classification of every failure the core can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Wrong types or shapes in an input.
    MalformedInput,
    /// Signature fields could not be decoded or recovered.
    InvalidSignature,
    /// The input disagrees with the current account state.
    StateInconsistency,
    /// A block breaks a consensus rule.
    ConsensusViolation,
    /// The contract execution environment reported a fault.
    ExecutionFailure,
    /// Persistence or other local fault, not attributable to the input.
    Internal,
}

/// Hex SHA-256 of arbitrary bytes.
pub fn sha256_hex(data: impl AsRef<[u8]>) -> Hash {
    hex::encode(Sha256::digest(data.as_ref()))
}

/// Order-sensitive digest over a sequence of fields.
///
/// Every field is length-prefixed so that adjacent variable-length fields
/// cannot be re-split into a different field sequence with the same digest.
pub(crate) struct FieldHasher(Sha256);

impl FieldHasher {
    pub(crate) fn new() -> Self {
        FieldHasher(Sha256::new())
    }

    pub(crate) fn field(&mut self, bytes: impl AsRef<[u8]>) -> &mut Self {
        let bytes = bytes.as_ref();
        self.0.update((bytes.len() as u64).to_be_bytes());
        self.0.update(bytes);
        self
    }

    pub(crate) fn finish_bytes(self) -> [u8; 32] {
        self.0.finalize().into()
    }

    pub(crate) fn finish(self) -> Hash {
        hex::encode(self.finish_bytes())
    }
}

/// Parse a canonical non-negative decimal integer.
///
/// Canonical means ASCII digits only, and no leading zeros except for `"0"`.
pub fn parse_decimal(value: &str) -> Option<BigUint> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if value.len() > 1 && value.starts_with('0') {
        return None;
    }
    BigUint::parse_bytes(value.as_bytes(), 10)
}

/// Serde adapter storing a `BigUint` as a decimal string.
pub mod decimal {
    use num_bigint::BigUint;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &BigUint, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_str_radix(10))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BigUint, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        super::parse_decimal(&raw)
            .ok_or_else(|| de::Error::custom(format!("invalid decimal integer: {raw:?}")))
    }
}

/// World-state object stored per address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    #[serde(with = "decimal")]
    pub balance: BigUint,
    /// Digest of the deployed code, or [`EMPTY_HASH`] for externally-owned accounts.
    pub code_hash: Hash,
    /// Number of transactions sent by this account.
    pub nonce: u64,
    /// Merkle root over the account's contract storage.
    pub storage_root: Hash,
}

impl Account {
    /// A freshly materialized account: zero balance, no code, no storage.
    pub fn empty() -> Self {
        Self::with_balance(BigUint::default())
    }

    pub fn with_balance(balance: BigUint) -> Self {
        Account {
            balance,
            code_hash: EMPTY_HASH.to_string(),
            nonce: 0,
            storage_root: EMPTY_HASH.to_string(),
        }
    }

    pub fn is_contract(&self) -> bool {
        self.code_hash != EMPTY_HASH
    }
}

impl Default for Account {
    fn default() -> Self {
        Account::empty()
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}
