//! Error types for wallet drivers and wallet instances.

use crate::storage::StorageError;

/// Error types that can occur during wallet operations.
///
/// These are the only kinds the crate surfaces to callers. Backend-specific
/// failures are folded into [`KmdError::Storage`] so outer layers never
/// depend on a storage engine's error vocabulary.
#[derive(Debug, thiserror::Error)]
pub enum KmdError {
    #[error("wallet name too long")]
    NameTooLong,

    #[error("wallet id too long")]
    IdTooLong,

    #[error("no wallet id given")]
    IdMissing,

    #[error("wallet already exists")]
    WalletExists,

    #[error("wallet not found")]
    WalletNotFound,

    #[error("wallet not initialized")]
    NotInitialized,

    /// Single generic failure for wrong password, corrupted blob, or a
    /// tampered purpose tag. Deliberately indistinguishable.
    #[error("failed to decrypt")]
    Decrypt,

    /// An encryption-side primitive failed (bad key length, cipher error).
    /// Never used on decrypt paths, which collapse into [`KmdError::Decrypt`].
    #[error("cryptographic operation failed")]
    Crypto,

    #[error("weak KDF parameters: {0}")]
    WeakKdfParams(String),

    #[error("key already exists in wallet")]
    KeyExists,

    #[error("key does not exist in wallet")]
    KeyNotFound,

    #[error("multisignature address already exists in wallet")]
    MultisigExists,

    #[error("multisignature information not found")]
    MultisigNotFound,

    /// A stored record no longer matches the address it is filed under.
    #[error("stored data does not match address: tampering detected")]
    Tampering,

    #[error("too many keys generated in this wallet")]
    TooManyKeys,

    #[error("wallet does not support displaying a mnemonic")]
    NoMnemonicUX,

    #[error("invalid multisig preimage")]
    InvalidMultisigPreimage,

    #[error("multisignature address does not match the transaction or signer")]
    MultisigWrongAddress,

    #[error("public key is not part of the multisignature preimage")]
    MultisigWrongKey,

    #[error("wallet driver not found: {0}")]
    DriverNotFound(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for KmdError {
    fn from(err: serde_json::Error) -> Self {
        KmdError::Serialization(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for KmdError {
    fn from(err: bincode::error::EncodeError) -> Self {
        KmdError::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for KmdError {
    fn from(err: bincode::error::DecodeError) -> Self {
        KmdError::Serialization(err.to_string())
    }
}

/// Result type for wallet operations
pub type Result<T> = std::result::Result<T, KmdError>;
