//! Filesystem storage backend.
//!
//! Layout: one directory per wallet under the root, holding `metadata.json`
//! (the wallet's metadata record) and `accounts.json` (the info, keys, and
//! multisig-preimage relations). Replacements are written to a `.new` temp
//! file and renamed into place; [`FsBackend::init_root`] cleans up temp
//! files a crashed process left behind.

use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{Relation, StorageBackend, StorageError, WriteOp};

const METADATA_FILE: &str = "metadata.json";
const ACCOUNTS_FILE: &str = "accounts.json";
/// Suffix of the temporary file used while atomically replacing a file
const TEMP_FILE_SUFFIX: &str = ".new";

/// The three relations of a wallet unit, persisted as one JSON document so a
/// single rename commits a whole write batch
#[derive(Debug, Default, Serialize, Deserialize)]
struct AccountsFile {
    info: BTreeMap<String, String>,
    keys: BTreeMap<String, String>,
    msig_addrs: BTreeMap<String, String>,
}

impl AccountsFile {
    fn relation(&self, relation: Relation) -> &BTreeMap<String, String> {
        match relation {
            Relation::Info => &self.info,
            Relation::Keys => &self.keys,
            Relation::MultisigPreimages => &self.msig_addrs,
        }
    }

    fn relation_mut(&mut self, relation: Relation) -> &mut BTreeMap<String, String> {
        match relation {
            Relation::Info => &mut self.info,
            Relation::Keys => &mut self.keys,
            Relation::MultisigPreimages => &mut self.msig_addrs,
        }
    }
}

/// Wallet storage on the local filesystem
pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn unit_dir(&self, unit: &str) -> PathBuf {
        self.root.join(unit)
    }

    fn metadata_path(&self, unit: &str) -> PathBuf {
        self.unit_dir(unit).join(METADATA_FILE)
    }

    fn accounts_path(&self, unit: &str) -> PathBuf {
        self.unit_dir(unit).join(ACCOUNTS_FILE)
    }

    fn load_accounts(&self, unit: &str) -> Result<AccountsFile, StorageError> {
        if !self.unit_dir(unit).is_dir() {
            return Err(StorageError::UnitNotFound);
        }
        match fs::read(self.accounts_path(unit)) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StorageError::Corrupt(e.to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(AccountsFile::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn store_accounts(&self, unit: &str, accounts: &AccountsFile) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(accounts)
            .map_err(|e| StorageError::Corrupt(e.to_string()))?;
        atomic_replace(&self.accounts_path(unit), &bytes)
    }
}

/// Writes `bytes` to a temp file next to `path`, flushes it to disk, then
/// renames it into place. The replacement is atomic and the temp's contents
/// are on disk before the rename, so a crash never commits a truncated file.
fn atomic_replace(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let temp = temp_path(path);
    let mut file = fs::File::create(&temp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&temp, path)?;

    // The rename itself is only durable once the directory entry is flushed.
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            dir.sync_all()?;
        }
    }
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(TEMP_FILE_SUFFIX);
    PathBuf::from(name)
}

/// Resolves a temp file left behind by an interrupted replacement: if the
/// original still exists the rename never happened and the temp's contents
/// cannot be trusted, so the swap is discarded; if the original is gone the
/// temp is complete and the swap is finished.
fn recover_temp(path: &Path) -> Result<(), StorageError> {
    let temp = temp_path(path);
    if !temp.exists() {
        return Ok(());
    }
    if path.exists() {
        fs::remove_file(&temp)?;
    } else {
        fs::rename(&temp, path)?;
    }
    Ok(())
}

impl StorageBackend for FsBackend {
    fn driver_name(&self) -> &'static str {
        "fs"
    }

    fn driver_version(&self) -> u32 {
        1
    }

    fn init_root(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.root)?;
        for unit in self.list_units()? {
            recover_temp(&self.metadata_path(&unit))?;
            recover_temp(&self.accounts_path(&unit))?;
        }
        Ok(())
    }

    fn create_unit(&self, unit: &str) -> Result<(), StorageError> {
        match fs::create_dir(self.unit_dir(unit)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(StorageError::UnitExists),
            Err(e) => Err(e.into()),
        }
    }

    fn unit_exists(&self, unit: &str) -> bool {
        self.metadata_path(unit).is_file()
    }

    fn list_units(&self) -> Result<Vec<String>, StorageError> {
        let mut units = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            // Anything without a metadata record is not a wallet.
            if self.metadata_path(&name).is_file() {
                units.push(name);
            }
        }
        units.sort();
        Ok(units)
    }

    fn get_metadata(&self, unit: &str) -> Result<Vec<u8>, StorageError> {
        match fs::read(self.metadata_path(unit)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::UnitNotFound),
            Err(e) => Err(e.into()),
        }
    }

    fn put_metadata(&self, unit: &str, bytes: &[u8]) -> Result<(), StorageError> {
        if !self.unit_dir(unit).is_dir() {
            return Err(StorageError::UnitNotFound);
        }
        atomic_replace(&self.metadata_path(unit), bytes)
    }

    fn get(
        &self,
        unit: &str,
        relation: Relation,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, StorageError> {
        let accounts = self.load_accounts(unit)?;
        match accounts.relation(relation).get(&hex::encode(key)) {
            Some(value) => {
                let bytes = hex::decode(value)
                    .map_err(|e| StorageError::Corrupt(e.to_string()))?;
                Ok(Some(bytes))
            }
            None => Ok(None),
        }
    }

    fn insert(
        &self,
        unit: &str,
        relation: Relation,
        key: &[u8],
        value: &[u8],
    ) -> Result<(), StorageError> {
        let mut accounts = self.load_accounts(unit)?;
        let records = accounts.relation_mut(relation);
        let encoded_key = hex::encode(key);
        if records.contains_key(&encoded_key) {
            return Err(StorageError::KeyExists);
        }
        records.insert(encoded_key, hex::encode(value));
        self.store_accounts(unit, &accounts)
    }

    fn apply(&self, unit: &str, ops: &[WriteOp]) -> Result<(), StorageError> {
        let mut accounts = self.load_accounts(unit)?;
        for op in ops {
            let records = accounts.relation_mut(op.relation);
            let encoded_key = hex::encode(&op.key);
            match &op.value {
                Some(value) => {
                    records.insert(encoded_key, hex::encode(value));
                }
                None => {
                    records.remove(&encoded_key);
                }
            }
        }
        self.store_accounts(unit, &accounts)
    }

    fn delete(&self, unit: &str, relation: Relation, key: &[u8]) -> Result<bool, StorageError> {
        let mut accounts = self.load_accounts(unit)?;
        let removed = accounts
            .relation_mut(relation)
            .remove(&hex::encode(key))
            .is_some();
        if removed {
            self.store_accounts(unit, &accounts)?;
        }
        Ok(removed)
    }

    fn keys(&self, unit: &str, relation: Relation) -> Result<Vec<Vec<u8>>, StorageError> {
        let accounts = self.load_accounts(unit)?;
        accounts
            .relation(relation)
            .keys()
            .map(|k| hex::decode(k).map_err(|e| StorageError::Corrupt(e.to_string())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn backend() -> (TempDir, FsBackend) {
        let dir = TempDir::new().unwrap();
        let backend = FsBackend::new(dir.path().join("wallets"));
        backend.init_root().unwrap();
        (dir, backend)
    }

    #[test]
    fn create_unit_twice_is_a_distinct_error() {
        let (_dir, backend) = backend();
        backend.create_unit("w1").unwrap();
        assert!(matches!(
            backend.create_unit("w1").unwrap_err(),
            StorageError::UnitExists
        ));
    }

    #[test]
    fn metadata_round_trip_and_listing() {
        let (_dir, backend) = backend();
        backend.create_unit("w1").unwrap();
        assert!(!backend.unit_exists("w1")); // no metadata record yet
        backend.put_metadata("w1", b"{\"name\":\"x\"}").unwrap();
        assert!(backend.unit_exists("w1"));
        assert_eq!(backend.get_metadata("w1").unwrap(), b"{\"name\":\"x\"}");
        assert_eq!(backend.list_units().unwrap(), vec!["w1".to_string()]);
    }

    #[test]
    fn insert_get_delete() {
        let (_dir, backend) = backend();
        backend.create_unit("w1").unwrap();

        backend.insert("w1", Relation::Keys, b"addr", b"blob").unwrap();
        assert_eq!(
            backend.get("w1", Relation::Keys, b"addr").unwrap().as_deref(),
            Some(&b"blob"[..])
        );
        assert!(matches!(
            backend.insert("w1", Relation::Keys, b"addr", b"other").unwrap_err(),
            StorageError::KeyExists
        ));

        assert!(backend.delete("w1", Relation::Keys, b"addr").unwrap());
        assert!(!backend.delete("w1", Relation::Keys, b"addr").unwrap());
        assert_eq!(backend.get("w1", Relation::Keys, b"addr").unwrap(), None);
    }

    #[test]
    fn relations_are_disjoint() {
        let (_dir, backend) = backend();
        backend.create_unit("w1").unwrap();
        backend.insert("w1", Relation::Keys, b"k", b"v1").unwrap();
        backend
            .insert("w1", Relation::MultisigPreimages, b"k", b"v2")
            .unwrap();
        assert_eq!(
            backend.get("w1", Relation::Keys, b"k").unwrap().as_deref(),
            Some(&b"v1"[..])
        );
        assert_eq!(
            backend
                .get("w1", Relation::MultisigPreimages, b"k")
                .unwrap()
                .as_deref(),
            Some(&b"v2"[..])
        );
    }

    #[test]
    fn apply_batch_commits_all_ops() {
        let (_dir, backend) = backend();
        backend.create_unit("w1").unwrap();
        backend.insert("w1", Relation::Keys, b"old", b"v").unwrap();

        backend
            .apply(
                "w1",
                &[
                    WriteOp::put(Relation::Keys, b"new", b"nv".to_vec()),
                    WriteOp::put(Relation::Info, b"max_key_index", b"1".to_vec()),
                    WriteOp::delete(Relation::Keys, b"old"),
                ],
            )
            .unwrap();

        assert_eq!(backend.get("w1", Relation::Keys, b"old").unwrap(), None);
        assert!(backend.get("w1", Relation::Keys, b"new").unwrap().is_some());
        assert!(
            backend
                .get("w1", Relation::Info, b"max_key_index")
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn replace_overwrites_and_leaves_no_temp_behind() {
        let (_dir, backend) = backend();
        backend.create_unit("w1").unwrap();
        backend.put_metadata("w1", b"first").unwrap();
        backend.put_metadata("w1", b"second").unwrap();

        assert_eq!(backend.get_metadata("w1").unwrap(), b"second");
        assert!(!temp_path(&backend.metadata_path("w1")).exists());
    }

    #[test]
    fn leftover_temp_with_original_is_discarded() {
        let (_dir, backend) = backend();
        backend.create_unit("w1").unwrap();
        backend.put_metadata("w1", b"good").unwrap();

        let temp = temp_path(&backend.metadata_path("w1"));
        fs::write(&temp, b"half-written").unwrap();

        backend.init_root().unwrap();
        assert!(!temp.exists());
        assert_eq!(backend.get_metadata("w1").unwrap(), b"good");
    }

    #[test]
    fn leftover_temp_without_original_is_promoted() {
        let (_dir, backend) = backend();
        backend.create_unit("w1").unwrap();
        backend.put_metadata("w1", b"meta").unwrap();
        backend.insert("w1", Relation::Keys, b"k", b"v").unwrap();

        // Simulate a crash after the accounts file was removed mid-swap.
        let accounts = backend.accounts_path("w1");
        let snapshot = fs::read(&accounts).unwrap();
        fs::write(temp_path(&accounts), &snapshot).unwrap();
        fs::remove_file(&accounts).unwrap();

        backend.init_root().unwrap();
        assert_eq!(
            backend.get("w1", Relation::Keys, b"k").unwrap().as_deref(),
            Some(&b"v"[..])
        );
    }

    #[test]
    fn listing_skips_non_wallet_directories() {
        let (_dir, backend) = backend();
        backend.create_unit("w1").unwrap();
        backend.put_metadata("w1", b"m").unwrap();
        fs::create_dir(backend.root().join("not-a-wallet")).unwrap();

        assert_eq!(backend.list_units().unwrap(), vec!["w1".to_string()]);
    }
}
