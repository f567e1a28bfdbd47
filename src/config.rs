//! Configuration for wallet drivers.
//!
//! The hosting application deserializes these structs from whatever config
//! source it owns and hands them to [`WalletDriver::init_with_config`].
//!
//! [`WalletDriver::init_with_config`]: crate::driver::WalletDriver::init_with_config

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{KmdError, Result};

/// Minimum Argon2id memory cost in KiB accepted without `unsafe_kdf`.
pub const MIN_KDF_MEMORY_KIB: u32 = 4096;
/// Minimum Argon2id iteration count accepted without `unsafe_kdf`.
pub const MIN_KDF_ITERATIONS: u32 = 2;
/// Minimum Argon2id parallelism accepted without `unsafe_kdf`.
pub const MIN_KDF_PARALLELISM: u32 = 1;

/// Top-level configuration for the wallet subsystem
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KmdConfig {
    /// Data directory that backends place their wallets root under when no
    /// explicit `wallets_dir` is configured
    pub data_dir: PathBuf,

    /// Per-driver configuration
    pub drivers: DriverConfigs,
}

impl Default for KmdConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            drivers: DriverConfigs::default(),
        }
    }
}

impl KmdConfig {
    /// Wallets root for the fs driver: the configured directory, or a
    /// subdirectory of `data_dir`
    pub fn fs_wallets_dir(&self) -> PathBuf {
        self.drivers
            .fs
            .wallets_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("fs_wallets"))
    }
}

/// Configuration for each wallet driver
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfigs {
    /// Filesystem-backed driver
    pub fs: FsDriverConfig,
}

/// Configuration for a single storage-backed wallet driver
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FsDriverConfig {
    /// When set, the driver reports no wallets and refuses nothing else;
    /// listing a disabled driver yields an empty result
    pub disable: bool,

    /// Explicit wallets root. Falls back to a subdirectory of `data_dir`.
    pub wallets_dir: Option<PathBuf>,

    /// Allows KDF parameters below the configured minimums. Exists only so
    /// automated tests can avoid the slow KDF. Never enable in production.
    pub unsafe_kdf: bool,

    /// Argon2id cost parameters used when wrapping secrets under a password
    pub kdf: KdfConfig,
}

impl Default for FsDriverConfig {
    fn default() -> Self {
        Self {
            disable: false,
            wallets_dir: None,
            unsafe_kdf: false,
            kdf: KdfConfig::default(),
        }
    }
}

/// Argon2id cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfConfig {
    /// Memory cost in KiB
    pub memory_kib: u32,
    /// Number of iterations
    pub iterations: u32,
    /// Degree of parallelism
    pub parallelism: u32,
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            memory_kib: 65536,
            iterations: 3,
            parallelism: 1,
        }
    }
}

impl KdfConfig {
    /// Cheap parameters for tests, usable only together with `unsafe_kdf`
    pub fn unsafe_for_tests() -> Self {
        Self {
            memory_kib: 8,
            iterations: 1,
            parallelism: 1,
        }
    }

    /// Checks the parameters against the configured minimums. `unsafe_kdf`
    /// bypasses the check entirely.
    pub fn validate(&self, unsafe_kdf: bool) -> Result<()> {
        if unsafe_kdf {
            return Ok(());
        }
        if self.memory_kib < MIN_KDF_MEMORY_KIB {
            return Err(KmdError::WeakKdfParams(format!(
                "memory cost must be at least {} KiB",
                MIN_KDF_MEMORY_KIB
            )));
        }
        if self.iterations < MIN_KDF_ITERATIONS {
            return Err(KmdError::WeakKdfParams(format!(
                "iteration count must be at least {}",
                MIN_KDF_ITERATIONS
            )));
        }
        if self.parallelism < MIN_KDF_PARALLELISM {
            return Err(KmdError::WeakKdfParams(format!(
                "parallelism must be at least {}",
                MIN_KDF_PARALLELISM
            )));
        }
        Ok(())
    }
}
