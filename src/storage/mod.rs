//! Storage-backend abstraction.
//!
//! A backend is a namespaced key/value store: one unit per wallet, each unit
//! holding a metadata record and two byte-blob relations keyed by address.
//! Backends store opaque blobs only; all key management and encryption
//! happens in the engine, which hands the backend already-wrapped values.

mod fs;

pub use fs::FsBackend;

/// Error types a storage backend can produce
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage unit already exists")]
    UnitExists,

    #[error("storage unit not found")]
    UnitNotFound,

    #[error("record already exists")]
    KeyExists,

    #[error("corrupt storage record: {0}")]
    Corrupt(String),
}

/// The relations every wallet unit contains
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    /// Singleton wallet-scoped records (wrapped MDK, wrapped max key index)
    Info,
    /// address -> wrapped secret key material
    Keys,
    /// multisig address -> preimage
    MultisigPreimages,
}

/// One write in an atomic batch. `value: None` deletes the record.
#[derive(Debug, Clone)]
pub struct WriteOp {
    pub relation: Relation,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

impl WriteOp {
    pub fn put(relation: Relation, key: &[u8], value: Vec<u8>) -> Self {
        Self {
            relation,
            key: key.to_vec(),
            value: Some(value),
        }
    }

    pub fn delete(relation: Relation, key: &[u8]) -> Self {
        Self {
            relation,
            key: key.to_vec(),
            value: None,
        }
    }
}

/// Contract every wallet storage backend must satisfy.
///
/// `apply` must commit its batch atomically: after a crash, either every op
/// in the batch is visible or none is (recovery at [`init_root`] may finish
/// or discard an interrupted commit, deterministically).
///
/// [`init_root`]: StorageBackend::init_root
pub trait StorageBackend: Send + Sync + 'static {
    /// Name this backend's wallets advertise in their metadata
    fn driver_name(&self) -> &'static str;

    /// Version of the backend's on-disk format
    fn driver_version(&self) -> u32;

    /// Ensures the wallets root exists and recovers any swap a previous
    /// process left half-finished
    fn init_root(&self) -> Result<(), StorageError>;

    /// Creates an empty unit; a unit that already exists is a distinct
    /// [`StorageError::UnitExists`], never a generic I/O failure
    fn create_unit(&self, unit: &str) -> Result<(), StorageError>;

    /// Whether a plausible unit with this name exists
    fn unit_exists(&self, unit: &str) -> bool;

    /// Names of all plausible units under the root
    fn list_units(&self) -> Result<Vec<String>, StorageError>;

    /// Reads the unit's metadata record
    fn get_metadata(&self, unit: &str) -> Result<Vec<u8>, StorageError>;

    /// Atomically replaces the unit's metadata record
    fn put_metadata(&self, unit: &str, bytes: &[u8]) -> Result<(), StorageError>;

    /// Point lookup; `Ok(None)` when the record is absent
    fn get(&self, unit: &str, relation: Relation, key: &[u8])
    -> Result<Option<Vec<u8>>, StorageError>;

    /// Inserts a new record; an existing record under the same key is the
    /// distinct [`StorageError::KeyExists`]
    fn insert(
        &self,
        unit: &str,
        relation: Relation,
        key: &[u8],
        value: &[u8],
    ) -> Result<(), StorageError>;

    /// Atomically applies a batch of writes and deletes
    fn apply(&self, unit: &str, ops: &[WriteOp]) -> Result<(), StorageError>;

    /// Deletes a record, reporting whether it existed
    fn delete(&self, unit: &str, relation: Relation, key: &[u8]) -> Result<bool, StorageError>;

    /// All record keys in a relation
    fn keys(&self, unit: &str, relation: Relation) -> Result<Vec<Vec<u8>>, StorageError>;
}
