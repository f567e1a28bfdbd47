// Library exports for kmd-wallet

pub mod config;
pub mod crypto;
pub mod driver;
pub mod error;
pub mod multisig;
pub mod registry;
pub mod storage;
pub mod types;
pub mod wallet;

// Re-export commonly used types
pub use config::{KdfConfig, KmdConfig};
pub use driver::WalletDriver;
pub use error::{KmdError, Result};
pub use multisig::{MultisigPreimage, MultisigSig};
pub use registry::{DriverOps, DriverRegistry, WalletSession};
pub use storage::{FsBackend, StorageBackend};
pub use types::{Address, MasterDerivationKey, Transaction, WalletMetadata};
pub use wallet::Wallet;
