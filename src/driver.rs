//! Wallet driver: creates, lists, fetches and renames wallets on a storage
//! backend.
//!
//! One generic engine handles every backend. The cryptography, derivation
//! and multisig logic live in their own modules and are shared; a backend
//! only has to satisfy the narrow [`StorageBackend`] contract.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::config::{FsDriverConfig, KmdConfig};
use crate::crypto::{self, EncryptedBlob, PurposeTag};
use crate::error::{KmdError, Result};
use crate::storage::{Relation, StorageBackend, StorageError, WriteOp};
use crate::types::{ALL_TX_TYPES, MDK_LEN, MasterDerivationKey, WalletMetadata, generate_wallet_id};
use crate::wallet::Wallet;

/// Maximum accepted wallet name length in bytes
pub const MAX_WALLET_NAME_LEN: usize = 64;
/// Maximum accepted wallet id length in bytes
pub const MAX_WALLET_ID_LEN: usize = 64;

/// Whether wallets of this engine can display a mnemonic to the user
pub(crate) const WALLET_HAS_MNEMONIC_UX: bool = false;
/// Whether wallets of this engine hold a master derivation key
pub(crate) const WALLET_HAS_MASTER_KEY: bool = true;

/// Length of the master encryption key in bytes
const MEK_LEN: usize = 32;

/// Info-relation record holding the MEK-wrapped master derivation key
pub(crate) const INFO_KEY_MDK: &[u8] = b"mdk";
/// Info-relation record holding the MEK-wrapped max key index
pub(crate) const INFO_KEY_MAX_IDX: &[u8] = b"max_key_index";

/// The metadata record persisted in each wallet unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct MetadataRecord {
    pub driver_name: String,
    pub driver_version: u32,
    #[serde(with = "hex::serde")]
    pub wallet_id: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub wallet_name: Vec<u8>,
    pub mek_encrypted: EncryptedBlob,
}

impl MetadataRecord {
    pub(crate) fn to_metadata(&self) -> WalletMetadata {
        WalletMetadata {
            id: self.wallet_id.clone(),
            name: self.wallet_name.clone(),
            driver_name: self.driver_name.clone(),
            driver_version: self.driver_version,
            supports_mnemonic_ux: WALLET_HAS_MNEMONIC_UX,
            supports_master_key: WALLET_HAS_MASTER_KEY,
            supported_txs: ALL_TX_TYPES.to_vec(),
        }
    }
}

/// Filters a caller-supplied id down to the safe character set before it is
/// used to form a storage path, independent of any validation the caller
/// already did
pub(crate) fn safe_unit_id(id: &[u8]) -> String {
    id.iter()
        .copied()
        .filter(|b| b.is_ascii_alphanumeric() || *b == b'_' || *b == b'-')
        .map(char::from)
        .collect()
}

/// A wallet driver bound to one storage backend
pub struct WalletDriver<B: StorageBackend> {
    backend: Arc<B>,
    cfg: FsDriverConfig,
    /// One lock per wallet unit, serializing read-modify-write sequences
    /// (key generation, rename) against that wallet
    locks: Arc<Mutex<HashMap<String, Arc<RwLock<()>>>>>,
}

impl<B: StorageBackend> std::fmt::Debug for WalletDriver<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletDriver").finish_non_exhaustive()
    }
}

impl<B: StorageBackend> WalletDriver<B> {
    /// One-time driver initialization: validates the KDF configuration and
    /// ensures the wallets root exists (recovering any interrupted swap)
    pub fn init_with_config(backend: B, cfg: &KmdConfig) -> Result<Self> {
        let driver_cfg = cfg.drivers.fs.clone();
        driver_cfg.kdf.validate(driver_cfg.unsafe_kdf)?;
        backend.init_root()?;
        debug!(driver = backend.driver_name(), "wallet driver initialized");
        Ok(Self {
            backend: Arc::new(backend),
            cfg: driver_cfg,
            locks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Name of the underlying storage backend
    pub fn driver_name(&self) -> &'static str {
        self.backend.driver_name()
    }

    fn lock_for(&self, unit: &str) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(unit.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Extracts metadata from everything under the root that looks like a
    /// wallet. A unit that fails to parse is skipped, not fatal.
    pub fn list_wallet_metadata(&self) -> Result<Vec<WalletMetadata>> {
        if self.cfg.disable {
            return Ok(Vec::new());
        }

        let mut metadatas = Vec::new();
        for unit in self.backend.list_units()? {
            let record = match self
                .backend
                .get_metadata(&unit)
                .map_err(KmdError::from)
                .and_then(|bytes| serde_json::from_slice::<MetadataRecord>(&bytes).map_err(KmdError::from))
            {
                Ok(record) => record,
                Err(_) => {
                    warn!(unit, "skipping unreadable wallet unit");
                    continue;
                }
            };
            metadatas.push(record.to_metadata());
        }
        Ok(metadatas)
    }

    /// Creates a wallet protected by `password`. Generates an id when none
    /// is given and a master derivation key when none is supplied.
    pub fn create_wallet(
        &self,
        name: &[u8],
        id: Option<&[u8]>,
        password: &[u8],
        mdk: Option<MasterDerivationKey>,
    ) -> Result<WalletMetadata> {
        if name.len() > MAX_WALLET_NAME_LEN {
            return Err(KmdError::NameTooLong);
        }
        let id = match id {
            Some(id) if !id.is_empty() => id.to_vec(),
            _ => generate_wallet_id(),
        };
        if id.len() > MAX_WALLET_ID_LEN {
            return Err(KmdError::IdTooLong);
        }

        let unit = safe_unit_id(&id);
        if unit.is_empty() {
            return Err(KmdError::IdMissing);
        }

        match self.backend.create_unit(&unit) {
            Ok(()) => {}
            Err(StorageError::UnitExists) => return Err(KmdError::WalletExists),
            Err(e) => return Err(e.into()),
        }

        // Root of the key hierarchy; wraps the MDK, the max key index, and
        // every stored secret key.
        let mut mek = Zeroizing::new([0u8; MEK_LEN]);
        crypto::fill_random(mek.as_mut());

        let mdk = match mdk {
            Some(mdk) => mdk,
            None => {
                let mut bytes = [0u8; MDK_LEN];
                crypto::fill_random(&mut bytes);
                MasterDerivationKey(bytes)
            }
        };

        let mek_blob = crypto::wrap_with_password(
            mek.as_ref(),
            PurposeTag::MasterKey,
            password,
            &self.cfg.kdf,
            self.cfg.unsafe_kdf,
        )?;
        let mdk_blob =
            crypto::wrap_with_key(mdk.as_bytes(), PurposeTag::MasterDerivationKey, mek.as_ref())?;
        let idx_blob =
            crypto::wrap_with_key(&0u64.to_le_bytes(), PurposeTag::MaxKeyIndex, mek.as_ref())?;

        let record = MetadataRecord {
            driver_name: self.backend.driver_name().to_string(),
            driver_version: self.backend.driver_version(),
            wallet_id: id,
            wallet_name: name.to_vec(),
            mek_encrypted: mek_blob,
        };
        self.backend.apply(
            &unit,
            &[
                WriteOp::put(Relation::Info, INFO_KEY_MDK, mdk_blob.to_bytes()?),
                WriteOp::put(Relation::Info, INFO_KEY_MAX_IDX, idx_blob.to_bytes()?),
            ],
        )?;

        // The metadata record goes last: its presence is what makes the unit
        // visible to listing and fetching, so an interrupted create leaves a
        // directory that is simply skipped rather than a wallet that lists
        // but can never unlock.
        self.backend
            .put_metadata(&unit, &serde_json::to_vec_pretty(&record)?)?;

        debug!(unit, "created wallet");
        Ok(record.to_metadata())
    }

    /// Looks up a wallet by id and returns a locked handle. Does not touch
    /// secret material.
    pub fn fetch_wallet(&self, id: &[u8]) -> Result<Wallet<B>> {
        if id.is_empty() {
            return Err(KmdError::IdMissing);
        }
        let unit = safe_unit_id(id);
        if !self.backend.unit_exists(&unit) {
            return Err(KmdError::WalletNotFound);
        }
        Ok(Wallet::new(
            self.backend.clone(),
            unit.clone(),
            self.lock_for(&unit),
        ))
    }

    /// Renames the wallet with the given id.
    ///
    /// The password is accepted but ignored: a wallet's name is not a
    /// secret, so renaming succeeds even when the password is wrong. This is
    /// long-standing intentional behavior, exercised by the tests.
    pub fn rename_wallet(&self, new_name: &[u8], id: &[u8], _password: &[u8]) -> Result<()> {
        if id.is_empty() {
            return Err(KmdError::IdMissing);
        }
        if new_name.len() > MAX_WALLET_NAME_LEN {
            return Err(KmdError::NameTooLong);
        }

        let unit = safe_unit_id(id);
        let lock = self.lock_for(&unit);
        let _guard = lock.write().unwrap_or_else(|e| e.into_inner());

        let bytes = match self.backend.get_metadata(&unit) {
            Ok(bytes) => bytes,
            Err(StorageError::UnitNotFound) => return Err(KmdError::WalletNotFound),
            Err(e) => return Err(e.into()),
        };
        let mut record: MetadataRecord = serde_json::from_slice(&bytes)?;
        record.wallet_name = new_name.to_vec();
        self.backend
            .put_metadata(&unit, &serde_json::to_vec_pretty(&record)?)?;

        debug!(unit, "renamed wallet");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KdfConfig;
    use crate::storage::FsBackend;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> KmdConfig {
        let mut cfg = KmdConfig::default();
        cfg.data_dir = dir.path().to_path_buf();
        cfg.drivers.fs.unsafe_kdf = true;
        cfg.drivers.fs.kdf = KdfConfig::unsafe_for_tests();
        cfg
    }

    fn test_driver(dir: &TempDir) -> WalletDriver<FsBackend> {
        let cfg = test_config(dir);
        WalletDriver::init_with_config(FsBackend::new(cfg.fs_wallets_dir()), &cfg).unwrap()
    }

    #[test]
    fn init_rejects_weak_kdf_config() {
        let dir = TempDir::new().unwrap();
        let mut cfg = test_config(&dir);
        cfg.drivers.fs.unsafe_kdf = false;
        let err =
            WalletDriver::init_with_config(FsBackend::new(cfg.fs_wallets_dir()), &cfg).unwrap_err();
        assert!(matches!(err, KmdError::WeakKdfParams(_)));
    }

    #[test]
    fn create_validates_lengths_before_io() {
        let dir = TempDir::new().unwrap();
        let driver = test_driver(&dir);

        let long = vec![b'a'; MAX_WALLET_NAME_LEN + 1];
        assert!(matches!(
            driver.create_wallet(&long, Some(b"id"), b"pw", None).unwrap_err(),
            KmdError::NameTooLong
        ));
        assert!(matches!(
            driver.create_wallet(b"name", Some(&long), b"pw", None).unwrap_err(),
            KmdError::IdTooLong
        ));
    }

    #[test]
    fn create_twice_reports_wallet_exists() {
        let dir = TempDir::new().unwrap();
        let driver = test_driver(&dir);
        driver.create_wallet(b"w", Some(b"wid"), b"pw", None).unwrap();
        assert!(matches!(
            driver.create_wallet(b"w", Some(b"wid"), b"pw", None).unwrap_err(),
            KmdError::WalletExists
        ));
    }

    #[test]
    fn create_generates_id_when_absent() {
        let dir = TempDir::new().unwrap();
        let driver = test_driver(&dir);
        let metadata = driver.create_wallet(b"w", None, b"pw", None).unwrap();
        assert_eq!(metadata.id.len(), 32);
        assert!(driver.fetch_wallet(&metadata.id).is_ok());
    }

    #[test]
    fn listing_returns_created_wallets_and_skips_junk() {
        let dir = TempDir::new().unwrap();
        let cfg = test_config(&dir);
        let driver = test_driver(&dir);
        driver.create_wallet(b"one", Some(b"id-one"), b"pw", None).unwrap();
        driver.create_wallet(b"two", Some(b"id-two"), b"pw", None).unwrap();

        // A unit with garbage metadata must be skipped, not fatal.
        let junk = cfg.fs_wallets_dir().join("junk");
        std::fs::create_dir_all(&junk).unwrap();
        std::fs::write(junk.join("metadata.json"), b"not json").unwrap();

        let mut names: Vec<Vec<u8>> = driver
            .list_wallet_metadata()
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        names.sort();
        assert_eq!(names, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn disabled_driver_lists_nothing() {
        let dir = TempDir::new().unwrap();
        let mut cfg = test_config(&dir);
        driver_with(&cfg).create_wallet(b"w", Some(b"wid"), b"pw", None).unwrap();

        cfg.drivers.fs.disable = true;
        assert!(driver_with(&cfg).list_wallet_metadata().unwrap().is_empty());
    }

    fn driver_with(cfg: &KmdConfig) -> WalletDriver<FsBackend> {
        WalletDriver::init_with_config(FsBackend::new(cfg.fs_wallets_dir()), cfg).unwrap()
    }

    #[test]
    fn interrupted_create_leaves_no_visible_wallet() {
        let dir = TempDir::new().unwrap();
        let cfg = test_config(&dir);
        driver_with(&cfg).create_wallet(b"w", Some(b"wid"), b"pw", None).unwrap();

        // The metadata record is the last write of create, so a crash during
        // create can only lose it (and possibly earlier writes too).
        std::fs::remove_file(cfg.fs_wallets_dir().join("wid").join("metadata.json")).unwrap();

        // After restart the half-created unit is invisible, never a wallet
        // that lists but rejects its own password.
        let driver = driver_with(&cfg);
        assert!(driver.list_wallet_metadata().unwrap().is_empty());
        assert!(matches!(
            driver.fetch_wallet(b"wid").unwrap_err(),
            KmdError::WalletNotFound
        ));
    }

    #[test]
    fn fetch_unknown_wallet_is_not_found() {
        let dir = TempDir::new().unwrap();
        let driver = test_driver(&dir);
        assert!(matches!(
            driver.fetch_wallet(b"nope").unwrap_err(),
            KmdError::WalletNotFound
        ));
        assert!(matches!(
            driver.fetch_wallet(b"").unwrap_err(),
            KmdError::IdMissing
        ));
    }

    #[test]
    fn rename_succeeds_with_wrong_password() {
        let dir = TempDir::new().unwrap();
        let driver = test_driver(&dir);
        driver.create_wallet(b"old", Some(b"wid"), b"pw", None).unwrap();

        // Renaming deliberately ignores the password.
        driver.rename_wallet(b"new", b"wid", b"totally wrong").unwrap();

        let wallet = driver.fetch_wallet(b"wid").unwrap();
        assert_eq!(wallet.metadata().unwrap().name, b"new".to_vec());
    }

    #[test]
    fn rename_validates_input() {
        let dir = TempDir::new().unwrap();
        let driver = test_driver(&dir);
        assert!(matches!(
            driver.rename_wallet(b"n", b"", b"pw").unwrap_err(),
            KmdError::IdMissing
        ));
        let long = vec![b'x'; MAX_WALLET_NAME_LEN + 1];
        assert!(matches!(
            driver.rename_wallet(&long, b"wid", b"pw").unwrap_err(),
            KmdError::NameTooLong
        ));
        assert!(matches!(
            driver.rename_wallet(b"n", b"missing", b"pw").unwrap_err(),
            KmdError::WalletNotFound
        ));
    }

    #[test]
    fn unsafe_ids_are_filtered_before_touching_storage() {
        let dir = TempDir::new().unwrap();
        let driver = test_driver(&dir);
        driver
            .create_wallet(b"w", Some(b"../../etc/passwd"), b"pw", None)
            .unwrap();
        // The dots and slashes are stripped; the unit lands under the root.
        assert_eq!(safe_unit_id(b"../../etc/passwd"), "etcpasswd");
        assert!(driver.fetch_wallet(b"../../etc/passwd").is_ok());
        assert!(!dir.path().join("etc").exists());
    }
}
