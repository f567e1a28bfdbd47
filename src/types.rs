//! Core data types shared by drivers and wallet instances.

use ed25519_dalek::VerifyingKey;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{KmdError, Result};

/// Length of a wallet address in bytes
pub const ADDRESS_LEN: usize = 32;
/// Length of a master derivation key in bytes
pub const MDK_LEN: usize = 32;
/// Number of random bytes behind a generated wallet id (hex doubles it)
const WALLET_ID_BYTES: usize = 16;

/// A 32-byte wallet address.
///
/// For a single key this is the Ed25519 public key itself; for a multisig
/// account it is the digest of the preimage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(#[serde(with = "hex::serde")] pub [u8; ADDRESS_LEN]);

impl Address {
    pub const ZERO: Address = Address([0u8; ADDRESS_LEN]);

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; ADDRESS_LEN] = bytes
            .try_into()
            .map_err(|_| KmdError::Serialization("address must be 32 bytes".to_string()))?;
        Ok(Address(arr))
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl From<VerifyingKey> for Address {
    fn from(pk: VerifyingKey) -> Self {
        Address(pk.to_bytes())
    }
}

/// Converts an Ed25519 public key into the address it is stored under
pub fn public_key_to_address(pk: &VerifyingKey) -> Address {
    Address(pk.to_bytes())
}

/// Master derivation key: the seed all generated account keys derive from.
/// Zeroed on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct MasterDerivationKey(pub [u8; MDK_LEN]);

impl MasterDerivationKey {
    pub fn as_bytes(&self) -> &[u8; MDK_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for MasterDerivationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("MasterDerivationKey")
            .field(&"<redacted>")
            .finish()
    }
}

/// Transaction types a wallet can advertise support for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxType {
    Payment,
    KeyRegistration,
    AssetConfig,
    AssetTransfer,
    AssetFreeze,
    ApplicationCall,
}

/// Every transaction type; the fs backend supports all of them
pub const ALL_TX_TYPES: [TxType; 6] = [
    TxType::Payment,
    TxType::KeyRegistration,
    TxType::AssetConfig,
    TxType::AssetTransfer,
    TxType::AssetFreeze,
    TxType::ApplicationCall,
];

/// High-level information about a wallet: its name, id, and what operations
/// the backing driver supports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletMetadata {
    pub id: Vec<u8>,
    pub name: Vec<u8>,
    pub driver_name: String,
    pub driver_version: u32,
    pub supports_mnemonic_ux: bool,
    pub supports_master_key: bool,
    pub supported_txs: Vec<TxType>,
}

/// A transaction to be authorized by a wallet key.
///
/// The sender address doubles as the default signing identity when no
/// explicit public key is supplied to the signing operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub tx_type: TxType,
    pub sender: Address,
    pub receiver: Option<Address>,
    pub amount: u64,
    pub fee: u64,
    pub first_valid: u64,
    pub last_valid: u64,
    pub note: Vec<u8>,
}

impl Transaction {
    /// Canonical domain-separated bytes that get signed.
    /// Stable across processes and platforms.
    pub fn bytes_to_sign(&self) -> Result<Vec<u8>> {
        let encoded = bincode::serde::encode_to_vec(self, bincode::config::standard())?;
        let mut out = Vec::with_capacity(2 + encoded.len());
        out.extend_from_slice(b"TX");
        out.extend_from_slice(&encoded);
        Ok(out)
    }
}

/// A transaction together with the signature authorizing it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    #[serde(with = "hex::serde")]
    pub signature: Vec<u8>,
    pub transaction: Transaction,
}

impl SignedTransaction {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(
            self,
            bincode::config::standard(),
        )?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (stx, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(stx)
    }
}

/// Canonical domain-separated bytes signed by the program-signing operations
pub fn program_bytes_to_sign(program: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(7 + program.len());
    out.extend_from_slice(b"Program");
    out.extend_from_slice(program);
    out
}

/// Generates a random hex wallet id
pub fn generate_wallet_id() -> Vec<u8> {
    let mut bytes = [0u8; WALLET_ID_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes).into_bytes()
}
