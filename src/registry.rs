//! Driver registry: maps driver names to drivers behind object-safe traits.
//!
//! The registry is an explicit value the hosting application owns and passes
//! around. Nothing here is process-global, so two registries with different
//! configurations can coexist in one process (and do, in tests).

use std::collections::HashMap;

use ed25519_dalek::PUBLIC_KEY_LENGTH;

use crate::error::{KmdError, Result};
use crate::multisig::{MultisigPreimage, MultisigSig};
use crate::storage::StorageBackend;
use crate::types::{Address, MasterDerivationKey, Transaction, WalletMetadata};
use crate::wallet::Wallet;
use crate::{crypto::Secret, driver::WalletDriver};

/// Driver operations, object-safe so drivers over different backends can sit
/// in one registry
pub trait DriverOps: Send + Sync {
    fn driver_name(&self) -> &'static str;

    fn list_wallet_metadata(&self) -> Result<Vec<WalletMetadata>>;

    fn create_wallet(
        &self,
        name: &[u8],
        id: Option<&[u8]>,
        password: &[u8],
        mdk: Option<MasterDerivationKey>,
    ) -> Result<WalletMetadata>;

    /// Returns a locked session handle for the wallet with this id
    fn fetch_wallet(&self, id: &[u8]) -> Result<Box<dyn WalletSession>>;

    fn rename_wallet(&self, new_name: &[u8], id: &[u8], password: &[u8]) -> Result<()>;
}

impl std::fmt::Debug for dyn DriverOps + '_ {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverOps")
            .field("driver_name", &self.driver_name())
            .finish_non_exhaustive()
    }
}

/// A single wallet behind a driver, object-safe mirror of [`Wallet`]
pub trait WalletSession: Send + Sync {
    fn metadata(&self) -> Result<WalletMetadata>;
    fn init(&mut self, password: &[u8]) -> Result<()>;
    fn check_password(&self, password: &[u8]) -> Result<()>;
    fn export_master_derivation_key(&self, password: &[u8]) -> Result<MasterDerivationKey>;

    fn generate_key(&self, display_mnemonic: bool) -> Result<Address>;
    fn import_key(&self, seed: &[u8; 32]) -> Result<Address>;
    fn export_key(&self, address: Address, password: &[u8]) -> Result<Secret>;
    fn delete_key(&self, address: Address, password: &[u8]) -> Result<()>;
    fn list_keys(&self) -> Result<Vec<Address>>;
    fn check_address_in_wallet(&self, address: Address) -> Result<bool>;

    fn import_multisig(
        &self,
        version: u8,
        threshold: u8,
        pks: &[[u8; PUBLIC_KEY_LENGTH]],
    ) -> Result<Address>;
    fn lookup_multisig(&self, address: Address) -> Result<MultisigPreimage>;
    fn list_multisig(&self) -> Result<Vec<Address>>;
    fn delete_multisig(&self, address: Address, password: &[u8]) -> Result<()>;

    fn sign_transaction(
        &self,
        tx: &Transaction,
        pk: Option<&[u8; PUBLIC_KEY_LENGTH]>,
        password: &[u8],
    ) -> Result<Vec<u8>>;
    fn sign_program(&self, program: &[u8], src: Address, password: &[u8]) -> Result<Vec<u8>>;
    fn multisig_sign_transaction(
        &self,
        tx: &Transaction,
        pk: &[u8; PUBLIC_KEY_LENGTH],
        partial: Option<MultisigSig>,
        password: &[u8],
        signer: Option<Address>,
    ) -> Result<MultisigSig>;
    fn multisig_sign_program(
        &self,
        program: &[u8],
        src: Address,
        pk: &[u8; PUBLIC_KEY_LENGTH],
        partial: Option<MultisigSig>,
        password: &[u8],
    ) -> Result<MultisigSig>;
}

impl<B: StorageBackend> DriverOps for WalletDriver<B> {
    fn driver_name(&self) -> &'static str {
        WalletDriver::driver_name(self)
    }

    fn list_wallet_metadata(&self) -> Result<Vec<WalletMetadata>> {
        WalletDriver::list_wallet_metadata(self)
    }

    fn create_wallet(
        &self,
        name: &[u8],
        id: Option<&[u8]>,
        password: &[u8],
        mdk: Option<MasterDerivationKey>,
    ) -> Result<WalletMetadata> {
        WalletDriver::create_wallet(self, name, id, password, mdk)
    }

    fn fetch_wallet(&self, id: &[u8]) -> Result<Box<dyn WalletSession>> {
        let wallet = WalletDriver::fetch_wallet(self, id)?;
        Ok(Box::new(wallet))
    }

    fn rename_wallet(&self, new_name: &[u8], id: &[u8], password: &[u8]) -> Result<()> {
        WalletDriver::rename_wallet(self, new_name, id, password)
    }
}

impl<B: StorageBackend> WalletSession for Wallet<B> {
    fn metadata(&self) -> Result<WalletMetadata> {
        Wallet::metadata(self)
    }

    fn init(&mut self, password: &[u8]) -> Result<()> {
        Wallet::init(self, password)
    }

    fn check_password(&self, password: &[u8]) -> Result<()> {
        Wallet::check_password(self, password)
    }

    fn export_master_derivation_key(&self, password: &[u8]) -> Result<MasterDerivationKey> {
        Wallet::export_master_derivation_key(self, password)
    }

    fn generate_key(&self, display_mnemonic: bool) -> Result<Address> {
        Wallet::generate_key(self, display_mnemonic)
    }

    fn import_key(&self, seed: &[u8; 32]) -> Result<Address> {
        Wallet::import_key(self, seed)
    }

    fn export_key(&self, address: Address, password: &[u8]) -> Result<Secret> {
        Wallet::export_key(self, address, password)
    }

    fn delete_key(&self, address: Address, password: &[u8]) -> Result<()> {
        Wallet::delete_key(self, address, password)
    }

    fn list_keys(&self) -> Result<Vec<Address>> {
        Wallet::list_keys(self)
    }

    fn check_address_in_wallet(&self, address: Address) -> Result<bool> {
        Wallet::check_address_in_wallet(self, address)
    }

    fn import_multisig(
        &self,
        version: u8,
        threshold: u8,
        pks: &[[u8; PUBLIC_KEY_LENGTH]],
    ) -> Result<Address> {
        Wallet::import_multisig(self, version, threshold, pks)
    }

    fn lookup_multisig(&self, address: Address) -> Result<MultisigPreimage> {
        Wallet::lookup_multisig(self, address)
    }

    fn list_multisig(&self) -> Result<Vec<Address>> {
        Wallet::list_multisig(self)
    }

    fn delete_multisig(&self, address: Address, password: &[u8]) -> Result<()> {
        Wallet::delete_multisig(self, address, password)
    }

    fn sign_transaction(
        &self,
        tx: &Transaction,
        pk: Option<&[u8; PUBLIC_KEY_LENGTH]>,
        password: &[u8],
    ) -> Result<Vec<u8>> {
        Wallet::sign_transaction(self, tx, pk, password)
    }

    fn sign_program(&self, program: &[u8], src: Address, password: &[u8]) -> Result<Vec<u8>> {
        Wallet::sign_program(self, program, src, password)
    }

    fn multisig_sign_transaction(
        &self,
        tx: &Transaction,
        pk: &[u8; PUBLIC_KEY_LENGTH],
        partial: Option<MultisigSig>,
        password: &[u8],
        signer: Option<Address>,
    ) -> Result<MultisigSig> {
        Wallet::multisig_sign_transaction(self, tx, pk, partial, password, signer)
    }

    fn multisig_sign_program(
        &self,
        program: &[u8],
        src: Address,
        pk: &[u8; PUBLIC_KEY_LENGTH],
        partial: Option<MultisigSig>,
        password: &[u8],
    ) -> Result<MultisigSig> {
        Wallet::multisig_sign_program(self, program, src, pk, partial, password)
    }
}

/// An explicit, caller-owned collection of wallet drivers keyed by name
#[derive(Default)]
pub struct DriverRegistry {
    drivers: HashMap<&'static str, Box<dyn DriverOps>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a driver under its own reported name, replacing any driver
    /// previously registered under that name
    pub fn register(&mut self, driver: Box<dyn DriverOps>) {
        self.drivers.insert(driver.driver_name(), driver);
    }

    pub fn get(&self, name: &str) -> Result<&dyn DriverOps> {
        self.drivers
            .get(name)
            .map(|d| d.as_ref())
            .ok_or_else(|| KmdError::DriverNotFound(name.to_string()))
    }

    /// Names of all registered drivers, sorted for stable output
    pub fn driver_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.drivers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Metadata of every wallet of every registered driver
    pub fn list_all_wallets(&self) -> Result<Vec<WalletMetadata>> {
        let mut all = Vec::new();
        for name in self.driver_names() {
            all.extend(self.get(name)?.list_wallet_metadata()?);
        }
        Ok(all)
    }
}
