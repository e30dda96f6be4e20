use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use num_bigint::BigUint;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::ChainConfig;
use crate::storage::{StateView, StorageError};
use crate::types::{parse_decimal, sha256_hex, Address, CryptoError, ErrorKind, FieldHasher, Hash};

/// `additionalData` key carrying the gas budget for a contract call.
pub const CONTRACT_GAS_KEY: &str = "contractGas";
/// `additionalData` key carrying contract source to deploy.
pub const CONTRACT_BODY_KEY: &str = "scBody";

/// Recoverable secp256k1 signature as carried on the wire (hex fields).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxSignature {
    pub r: String,
    pub s: String,
    /// Recovery id, hex.
    pub v: String,
}

impl TxSignature {
    pub fn is_empty(&self) -> bool {
        self.r.is_empty() && self.s.is_empty() && self.v.is_empty()
    }

    fn decode(&self) -> Result<(Signature, RecoveryId), CryptoError> {
        let mut bytes = [0u8; 64];
        decode_scalar(&self.r, &mut bytes[..32])?;
        decode_scalar(&self.s, &mut bytes[32..])?;
        let signature = Signature::from_slice(&bytes)
            .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;
        let v = u8::from_str_radix(&self.v, 16)
            .map_err(|_| CryptoError::InvalidSignature(format!("bad recovery id {:?}", self.v)))?;
        let recovery_id = RecoveryId::from_byte(v)
            .ok_or_else(|| CryptoError::InvalidSignature(format!("recovery id {v} out of range")))?;
        Ok((signature, recovery_id))
    }
}

/// Decode a hex scalar (leading zeros optional) into a 32-byte big-endian slot.
fn decode_scalar(hex_str: &str, out: &mut [u8]) -> Result<(), CryptoError> {
    if hex_str.is_empty() || hex_str.len() > 64 {
        return Err(CryptoError::InvalidSignature(format!(
            "scalar has invalid length {}",
            hex_str.len()
        )));
    }
    let padded = format!("{hex_str:0>64}");
    hex::decode_to_slice(padded, out).map_err(|e| CryptoError::InvalidSignature(e.to_string()))
}

/// A secp256k1 key pair able to sign transactions.
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

impl KeyPair {
    pub fn generate() -> Self {
        KeyPair {
            signing_key: SigningKey::random(&mut OsRng),
        }
    }

    pub fn from_secret_hex(secret: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(secret).map_err(|_| CryptoError::InvalidPrivateKey)?;
        let signing_key =
            SigningKey::from_slice(&bytes).map_err(|_| CryptoError::InvalidPrivateKey)?;
        Ok(KeyPair { signing_key })
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    pub fn public_key_hex(&self) -> String {
        public_key_hex(self.signing_key.verifying_key())
    }

    pub fn address(&self) -> Address {
        address_of(self.signing_key.verifying_key())
    }
}

fn public_key_hex(key: &VerifyingKey) -> String {
    hex::encode(key.to_encoded_point(false).as_bytes())
}

/// Address derived from a public key: digest of its uncompressed SEC1 encoding.
pub fn address_of(key: &VerifyingKey) -> Address {
    sha256_hex(key.to_encoded_point(false).as_bytes())
}

/// Reasons a transaction is refused. Ordinary invalidity, never a crash.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("malformed transaction: {0}")]
    Malformed(String),
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
    #[error("sender {0} is not part of the chain state")]
    UnknownSender(Address),
    #[error("address {0} is a smart contract and cannot send transactions")]
    ContractSender(Address),
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("gas fee {gas} is below the minimum {minimum}")]
    GasBelowFloor { gas: String, minimum: String },
    #[error("nonce mismatch: expected {expected}, got {got}")]
    NonceMismatch { expected: u64, got: u64 },
    #[error("sender {0} was already rejected in this batch")]
    SenderPoisoned(Address),
    #[error("block gas limit reached")]
    GasLimitReached,
}

impl Rejection {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Rejection::Malformed(_) => ErrorKind::MalformedInput,
            Rejection::InvalidSignature(_) => ErrorKind::InvalidSignature,
            _ => ErrorKind::StateInconsistency,
        }
    }
}

impl From<CryptoError> for Rejection {
    fn from(err: CryptoError) -> Self {
        Rejection::InvalidSignature(err.to_string())
    }
}

/// Errors raised while checking a transaction, as opposed to the
/// transaction simply being invalid.
#[derive(Debug, Error)]
pub enum TxError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl TxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TxError::Crypto(_) => ErrorKind::InvalidSignature,
            TxError::Storage(_) => ErrorKind::Internal,
        }
    }
}

/// Structured result of [`Transaction::is_valid`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Valid,
    Invalid(Rejection),
}

impl Verdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, Verdict::Valid)
    }

    pub fn reason(&self) -> String {
        match self {
            Verdict::Valid => "valid transaction".to_string(),
            Verdict::Invalid(rejection) => rejection.to_string(),
        }
    }
}

/// Strongly-typed view of `additionalData`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxPayload {
    Transfer,
    ContractDeploy { code: String },
    ContractCall { contract_gas: BigUint },
}

/// A transaction after the stateless checks, with its amounts parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckedTx {
    pub amount: BigUint,
    pub gas: BigUint,
    pub payload: TxPayload,
}

impl CheckedTx {
    pub fn contract_gas(&self) -> BigUint {
        match &self.payload {
            TxPayload::ContractCall { contract_gas } => contract_gas.clone(),
            _ => BigUint::default(),
        }
    }

    /// Everything the sender is debited: `amount + gas + contractGas`.
    pub fn total_cost(&self) -> BigUint {
        &self.amount + &self.gas + self.contract_gas()
    }

    /// Fee collected by the coinbase: `gas + contractGas`.
    pub fn fee(&self) -> BigUint {
        &self.gas + self.contract_gas()
    }
}

/// A value transfer, contract deployment, or contract call signed by an EOA.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub recipient: Address,
    pub amount: String,
    pub gas: String,
    #[serde(default)]
    pub additional_data: Map<String, Value>,
    pub nonce: u64,
    #[serde(default)]
    pub signature: TxSignature,
}

impl Transaction {
    pub fn new(recipient: impl Into<Address>, amount: impl Into<String>, gas: impl Into<String>, nonce: u64) -> Self {
        Transaction {
            recipient: recipient.into(),
            amount: amount.into(),
            gas: gas.into(),
            additional_data: Map::new(),
            nonce,
            signature: TxSignature::default(),
        }
    }

    pub fn with_contract_gas(mut self, contract_gas: impl Into<String>) -> Self {
        self.additional_data
            .insert(CONTRACT_GAS_KEY.to_string(), Value::String(contract_gas.into()));
        self
    }

    pub fn with_contract_body(mut self, body: impl Into<String>) -> Self {
        self.additional_data
            .insert(CONTRACT_BODY_KEY.to_string(), Value::String(body.into()));
        self
    }

    /// Raw digest over `recipient ‖ amount ‖ gas ‖ canonicalJSON(additionalData) ‖ nonce`.
    ///
    /// `serde_json::Map` keeps keys sorted, so the JSON is canonical.
    pub fn digest(&self) -> [u8; 32] {
        let additional_data = Value::Object(self.additional_data.clone()).to_string();
        let mut hasher = FieldHasher::new();
        hasher
            .field(&self.recipient)
            .field(&self.amount)
            .field(&self.gas)
            .field(additional_data)
            .field(self.nonce.to_string());
        hasher.finish_bytes()
    }

    pub fn hash(&self) -> Hash {
        hex::encode(self.digest())
    }

    /// Sign the transaction hash, replacing any previous signature.
    pub fn sign(&mut self, key_pair: &KeyPair) -> Result<(), CryptoError> {
        let (signature, recovery_id) = key_pair
            .signing_key
            .sign_prehash_recoverable(&self.digest())
            .map_err(|e| CryptoError::SigningFailed(e.to_string()))?;
        let bytes = signature.to_bytes();
        self.signature = TxSignature {
            r: hex::encode(&bytes[..32]),
            s: hex::encode(&bytes[32..]),
            v: format!("{:x}", recovery_id.to_byte()),
        };
        Ok(())
    }

    pub fn recover_public_key(&self) -> Result<VerifyingKey, CryptoError> {
        let (signature, recovery_id) = self.signature.decode()?;
        VerifyingKey::recover_from_prehash(&self.digest(), &signature, recovery_id)
            .map_err(|e| CryptoError::InvalidSignature(e.to_string()))
    }

    pub fn recover_public_key_hex(&self) -> Result<String, CryptoError> {
        Ok(public_key_hex(&self.recover_public_key()?))
    }

    pub fn sender(&self) -> Result<Address, CryptoError> {
        Ok(address_of(&self.recover_public_key()?))
    }

    /// Stateless checks: field shapes, canonical integers, typed payload.
    pub fn checked(&self) -> Result<CheckedTx, Rejection> {
        if self.recipient.is_empty() {
            return Err(Rejection::Malformed("recipient is empty".into()));
        }
        let amount = parse_decimal(&self.amount)
            .ok_or_else(|| Rejection::Malformed(format!("amount {:?} is not an integer", self.amount)))?;
        let gas = parse_decimal(&self.gas)
            .ok_or_else(|| Rejection::Malformed(format!("gas {:?} is not an integer", self.gas)))?;

        let contract_gas = match self.additional_data.get(CONTRACT_GAS_KEY) {
            None => None,
            Some(Value::String(raw)) => Some(parse_decimal(raw).ok_or_else(|| {
                Rejection::Malformed(format!("contractGas {raw:?} is not an integer"))
            })?),
            Some(_) => return Err(Rejection::Malformed("contractGas must be a string".into())),
        };
        let body = match self.additional_data.get(CONTRACT_BODY_KEY) {
            None => None,
            Some(Value::String(code)) => Some(code.clone()),
            Some(_) => return Err(Rejection::Malformed("scBody must be a string".into())),
        };

        let payload = match (body, contract_gas) {
            (Some(_), Some(_)) => {
                return Err(Rejection::Malformed(
                    "a transaction cannot both deploy and call a contract".into(),
                ))
            }
            (Some(code), None) => TxPayload::ContractDeploy { code },
            (None, Some(contract_gas)) => TxPayload::ContractCall { contract_gas },
            (None, None) => TxPayload::Transfer,
        };

        Ok(CheckedTx { amount, gas, payload })
    }

    /// Full validity check against committed state.
    ///
    /// Ordinary invalidity is reported through [`Verdict::Invalid`]; only an
    /// undecodable signature or a storage fault is an `Err`.
    pub fn is_valid(&self, state: &impl StateView, config: &ChainConfig) -> Result<Verdict, TxError> {
        let checked = match self.checked() {
            Ok(checked) => checked,
            Err(rejection) => return Ok(Verdict::Invalid(rejection)),
        };

        let sender = self.sender()?;
        let Some(account) = state.account(&sender)? else {
            return Ok(Verdict::Invalid(Rejection::UnknownSender(sender)));
        };
        if account.is_contract() {
            return Ok(Verdict::Invalid(Rejection::ContractSender(sender)));
        }
        if account.balance < checked.total_cost() {
            return Ok(Verdict::Invalid(Rejection::InsufficientBalance));
        }
        if checked.gas < config.min_gas {
            return Ok(Verdict::Invalid(Rejection::GasBelowFloor {
                gas: self.gas.clone(),
                minimum: config.min_gas.to_string(),
            }));
        }
        Ok(Verdict::Valid)
    }

    /// Merkle leaf for this transaction at `index` in its block.
    pub fn leaf(&self, index: usize) -> String {
        format!(
            "{index}{}{}{}{}",
            self.hash(),
            self.signature.r,
            self.signature.s,
            self.signature.v
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ChainStore, MemoryStorage};
    use crate::types::{Account, EMPTY_HASH};

    fn funded_store(key: &KeyPair, balance: u64) -> ChainStore<MemoryStorage> {
        let store = ChainStore::new(MemoryStorage::new()).unwrap();
        store
            .put_account(&key.address(), &Account::with_balance(BigUint::from(balance)))
            .unwrap();
        store
    }

    #[test]
    fn sign_then_recover_yields_signer_address() {
        let key = KeyPair::generate();
        let mut tx = Transaction::new("bob", "100", "2000000000", 1);
        tx.sign(&key).unwrap();

        assert_eq!(tx.sender().unwrap(), key.address());
        assert_eq!(tx.recover_public_key_hex().unwrap(), key.public_key_hex());
    }

    #[test]
    fn tampering_changes_recovered_sender() {
        let key = KeyPair::generate();
        let mut tx = Transaction::new("bob", "100", "2000000000", 1);
        tx.sign(&key).unwrap();

        let mut tampered = tx.clone();
        tampered.amount = "101".into();
        match tampered.sender() {
            Ok(address) => assert_ne!(address, key.address()),
            Err(CryptoError::InvalidSignature(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn malformed_signature_fails_recovery() {
        let mut tx = Transaction::new("bob", "1", "2000000000", 1);
        assert!(matches!(tx.sender(), Err(CryptoError::InvalidSignature(_))));

        tx.signature = TxSignature {
            r: "zz".into(),
            s: "01".into(),
            v: "0".into(),
        };
        assert!(matches!(tx.sender(), Err(CryptoError::InvalidSignature(_))));

        let key = KeyPair::generate();
        tx.sign(&key).unwrap();
        tx.signature.v = "7".into();
        assert!(matches!(tx.sender(), Err(CryptoError::InvalidSignature(_))));
    }

    #[test]
    fn hash_depends_on_every_field() {
        let base = Transaction::new("bob", "100", "2000000000", 1);
        let hash = base.hash();
        assert_eq!(hash, base.clone().hash());
        assert_ne!(hash, Transaction::new("bob", "100", "2000000000", 2).hash());
        assert_ne!(hash, Transaction::new("bob", "101", "2000000000", 1).hash());
        assert_ne!(hash, base.clone().with_contract_gas("5").hash());
    }

    // recipient, amount, gas, additionalData JSON and decimal nonce, each
    // length-prefixed by FieldHasher.
    #[test]
    fn hash_layout_is_frozen() {
        let tx = Transaction::new("bob", "100", "2000000000", 7).with_contract_gas("5");
        let mut expected = FieldHasher::new();
        expected
            .field("bob")
            .field("100")
            .field("2000000000")
            .field(r#"{"contractGas":"5"}"#)
            .field("7");
        assert_eq!(tx.hash(), expected.finish());
    }

    #[test]
    fn hash_ignores_signature() {
        let key = KeyPair::generate();
        let mut tx = Transaction::new("bob", "100", "2000000000", 1);
        let before = tx.hash();
        tx.sign(&key).unwrap();
        assert_eq!(before, tx.hash());
    }

    #[test]
    fn payload_is_typed_at_the_boundary() {
        let transfer = Transaction::new("bob", "1", "2", 1).checked().unwrap();
        assert_eq!(transfer.payload, TxPayload::Transfer);

        let deploy = Transaction::new("bob", "1", "2", 1)
            .with_contract_body("set a 1")
            .checked()
            .unwrap();
        assert_eq!(deploy.payload, TxPayload::ContractDeploy { code: "set a 1".into() });

        let call = Transaction::new("bob", "1", "2", 1)
            .with_contract_gas("30")
            .checked()
            .unwrap();
        assert_eq!(call.contract_gas(), BigUint::from(30u8));
        assert_eq!(call.total_cost(), BigUint::from(33u8));

        let both = Transaction::new("bob", "1", "2", 1)
            .with_contract_gas("30")
            .with_contract_body("x");
        assert!(matches!(both.checked(), Err(Rejection::Malformed(_))));

        let mut wrong_type = Transaction::new("bob", "1", "2", 1);
        wrong_type
            .additional_data
            .insert(CONTRACT_GAS_KEY.into(), Value::from(30));
        assert!(matches!(wrong_type.checked(), Err(Rejection::Malformed(_))));

        assert!(Transaction::new("", "1", "2", 1).checked().is_err());
        assert!(Transaction::new("bob", "-1", "2", 1).checked().is_err());
        assert!(Transaction::new("bob", "1", "two", 1).checked().is_err());
    }

    #[test]
    fn wire_format_is_camel_case() {
        let tx = Transaction::new("bob", "1", "2", 3).with_contract_gas("4");
        let json = serde_json::to_value(&tx).unwrap();
        assert_eq!(json["additionalData"]["contractGas"], "4");
        assert_eq!(json["nonce"], 3);

        assert!(serde_json::from_str::<Transaction>(r#"{"recipient":"a","amount":1,"gas":"2","nonce":1}"#).is_err());
        assert!(serde_json::from_str::<Transaction>(r#"{"recipient":"a","amount":"1","gas":"2","nonce":-1}"#).is_err());
    }

    #[test]
    fn valid_transfer_passes_all_checks() {
        let config = ChainConfig::default();
        let key = KeyPair::generate();
        let store = funded_store(&key, 1_000_000_000_000);
        let mut tx = Transaction::new("recipient", "100", "2000000000", 1);
        tx.sign(&key).unwrap();
        assert_eq!(tx.is_valid(&store, &config).unwrap(), Verdict::Valid);
    }

    #[test]
    fn stateful_rejections() {
        let config = ChainConfig::default();
        let key = KeyPair::generate();
        let store = funded_store(&key, 3_000_000_000);

        let mut poor = Transaction::new("r", "1000000001", "2000000000", 1);
        poor.sign(&key).unwrap();
        assert_eq!(
            poor.is_valid(&store, &config).unwrap(),
            Verdict::Invalid(Rejection::InsufficientBalance)
        );

        let mut cheap = Transaction::new("r", "1", "1999999999", 1);
        cheap.sign(&key).unwrap();
        assert!(matches!(
            cheap.is_valid(&store, &config).unwrap(),
            Verdict::Invalid(Rejection::GasBelowFloor { .. })
        ));

        let stranger = KeyPair::generate();
        let mut unknown = Transaction::new("r", "1", "2000000000", 1);
        unknown.sign(&stranger).unwrap();
        let verdict = unknown.is_valid(&store, &config).unwrap();
        assert_eq!(verdict, Verdict::Invalid(Rejection::UnknownSender(stranger.address())));
        assert_eq!(
            Rejection::UnknownSender(stranger.address()).kind(),
            ErrorKind::StateInconsistency
        );
    }

    #[test]
    fn contract_accounts_cannot_send() {
        let config = ChainConfig::default();
        let key = KeyPair::generate();
        let store = ChainStore::new(MemoryStorage::new()).unwrap();
        let mut contract = Account::with_balance(BigUint::from(10u64).pow(30));
        contract.code_hash = sha256_hex("set x 1");
        assert_ne!(contract.code_hash, EMPTY_HASH);
        store.put_account(&key.address(), &contract).unwrap();

        let mut tx = Transaction::new("r", "1", "2000000000", 1);
        tx.sign(&key).unwrap();
        let verdict = tx.is_valid(&store, &config).unwrap();
        let Verdict::Invalid(rejection) = verdict else {
            panic!("contract sender accepted");
        };
        assert_eq!(rejection, Rejection::ContractSender(key.address()));
        assert_eq!(rejection.kind(), ErrorKind::StateInconsistency);
    }

    #[test]
    fn unsigned_transaction_is_an_error_not_a_verdict() {
        let config = ChainConfig::default();
        let store = ChainStore::new(MemoryStorage::new()).unwrap();
        let tx = Transaction::new("r", "1", "2000000000", 1);
        let err = tx.is_valid(&store, &config).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSignature);
    }

    #[test]
    fn key_pair_round_trips_through_hex() {
        let key = KeyPair::generate();
        let restored = KeyPair::from_secret_hex(&key.secret_hex()).unwrap();
        assert_eq!(restored.address(), key.address());
        assert!(KeyPair::from_secret_hex("not hex").is_err());
    }
}
