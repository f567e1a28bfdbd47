//! Cryptographic primitives for the wallet core.
//!
//! Secrets at rest are authenticated-encrypted blobs: AES-256-GCM keyed
//! either by an Argon2id-derived key (password wrapping) or directly by the
//! master encryption key. Every blob carries a purpose tag bound into the
//! AEAD associated data, so a blob wrapped for one purpose can never be
//! substituted for another.
//!
//! All decryption failures collapse into the single [`KmdError::Decrypt`]
//! error. Callers cannot tell a wrong password from a corrupted blob.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, OsRng, Payload},
};
use argon2::{Algorithm, Argon2, Params, Version};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512_256};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::config::KdfConfig;
use crate::error::{KmdError, Result};

/// Length of the random salt stored with a password-wrapped blob
pub const SALT_LEN: usize = 16;
/// AES-GCM nonce length
const NONCE_LEN: usize = 12;
/// Length of a derived or directly supplied encryption key
pub const KEY_LEN: usize = 32;
/// Length of every digest produced in this crate (SHA-512/256)
pub const DIGEST_LEN: usize = 32;

const CHILD_KEY_DOMAIN: &[u8] = b"DeterministicKeygen";
const PASSWORD_HASH_DOMAIN: &[u8] = b"PasswordCheck";

/// A secret byte string held in zero-on-drop memory.
///
/// The bytes are only reachable through [`Secret::reveal`]; the backing
/// buffer is wiped when the handle goes out of scope, on every exit path.
pub struct Secret(Zeroizing<Vec<u8>>);

impl Secret {
    pub fn new(bytes: Vec<u8>) -> Self {
        Secret(Zeroizing::new(bytes))
    }

    /// Scoped access to the secret bytes
    pub fn reveal(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Secret").field(&"<redacted>").finish()
    }
}

/// Identifies what kind of secret an encrypted blob holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurposeTag {
    MasterKey,
    MasterDerivationKey,
    SecretKey,
    MaxKeyIndex,
}

impl PurposeTag {
    /// Canonical byte string bound into the AEAD associated data
    fn aad(&self) -> &'static [u8] {
        match self {
            PurposeTag::MasterKey => b"kmd:master_key",
            PurposeTag::MasterDerivationKey => b"kmd:master_derivation_key",
            PurposeTag::SecretKey => b"kmd:secret_key",
            PurposeTag::MaxKeyIndex => b"kmd:max_key_index",
        }
    }
}

/// Argon2id parameters stored alongside a password-wrapped blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
    #[serde(with = "hex::serde")]
    pub salt: Vec<u8>,
}

/// An authenticated-encrypted secret, tagged by purpose.
///
/// `kdf` is present when the encryption key was derived from a password and
/// absent when the caller supplied the raw key directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedBlob {
    pub purpose: PurposeTag,
    pub kdf: Option<KdfParams>,
    #[serde(with = "hex::serde")]
    pub nonce: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub ciphertext: Vec<u8>,
}

impl EncryptedBlob {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Fills the buffer with bytes from the OS entropy source
pub fn fill_random(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

/// Derives a key-encryption key from a password with Argon2id.
///
/// The cost parameters come from the blob (decryption) or the driver config
/// (encryption); they are validated against the configured minimums before a
/// wrap, never here, so existing blobs stay readable if minimums are raised.
fn derive_key_encryption_key(password: &[u8], params: &KdfParams) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    let argon_params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(KEY_LEN),
    )
    .map_err(|_| KmdError::Decrypt)?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    argon2
        .hash_password_into(password, &params.salt, key.as_mut())
        .map_err(|_| KmdError::Decrypt)?;
    Ok(key)
}

fn seal(plaintext: &[u8], purpose: PurposeTag, key: &[u8; KEY_LEN], kdf: Option<KdfParams>) -> Result<EncryptedBlob> {
    let cipher = Aes256Gcm::new(key.into());

    let mut nonce_bytes = [0u8; NONCE_LEN];
    fill_random(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad: purpose.aad(),
            },
        )
        .map_err(|_| KmdError::Crypto)?;

    Ok(EncryptedBlob {
        purpose,
        kdf,
        nonce: nonce_bytes.to_vec(),
        ciphertext,
    })
}

fn open(blob: &EncryptedBlob, purpose: PurposeTag, key: &[u8; KEY_LEN]) -> Result<Secret> {
    // The stored tag must match what the caller expects, and the tag is also
    // bound as AEAD associated data, so a swapped tag fails either way.
    if blob.purpose != purpose {
        return Err(KmdError::Decrypt);
    }
    if blob.nonce.len() != NONCE_LEN {
        return Err(KmdError::Decrypt);
    }

    let cipher = Aes256Gcm::new(key.into());
    let nonce = Nonce::from_slice(&blob.nonce);
    let plaintext = cipher
        .decrypt(
            nonce,
            Payload {
                msg: &blob.ciphertext,
                aad: purpose.aad(),
            },
        )
        .map_err(|_| KmdError::Decrypt)?;

    Ok(Secret::new(plaintext))
}

/// Encrypts `plaintext` under a password-derived key. A blank password is a
/// valid secret and takes the exact same path.
pub fn wrap_with_password(
    plaintext: &[u8],
    purpose: PurposeTag,
    password: &[u8],
    kdf: &KdfConfig,
    unsafe_kdf: bool,
) -> Result<EncryptedBlob> {
    kdf.validate(unsafe_kdf)?;

    let mut salt = vec![0u8; SALT_LEN];
    fill_random(&mut salt);
    let params = KdfParams {
        memory_kib: kdf.memory_kib,
        iterations: kdf.iterations,
        parallelism: kdf.parallelism,
        salt,
    };

    let key = derive_key_encryption_key(password, &params)?;
    seal(plaintext, purpose, &key, Some(params))
}

/// Decrypts a password-wrapped blob
pub fn unwrap_with_password(blob: &EncryptedBlob, purpose: PurposeTag, password: &[u8]) -> Result<Secret> {
    let params = blob.kdf.as_ref().ok_or(KmdError::Decrypt)?;
    let key = derive_key_encryption_key(password, params)?;
    open(blob, purpose, &key)
}

/// Encrypts `plaintext` directly under a 32-byte key (the MEK), skipping the
/// slow KDF
pub fn wrap_with_key(plaintext: &[u8], purpose: PurposeTag, key: &[u8]) -> Result<EncryptedBlob> {
    let key: &[u8; KEY_LEN] = key.try_into().map_err(|_| KmdError::Crypto)?;
    seal(plaintext, purpose, key, None)
}

/// Decrypts a blob wrapped with [`wrap_with_key`]
pub fn unwrap_with_key(blob: &EncryptedBlob, purpose: PurposeTag, key: &[u8]) -> Result<Secret> {
    if blob.kdf.is_some() {
        return Err(KmdError::Decrypt);
    }
    let key: &[u8; KEY_LEN] = key.try_into().map_err(|_| KmdError::Decrypt)?;
    open(blob, purpose, key)
}

/// Computes the SHA-512/256 digest of `data`
pub fn hash(data: &[u8]) -> [u8; DIGEST_LEN] {
    let mut hasher = Sha512_256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Fast salted password digest, used only to avoid repeating the slow KDF on
/// password re-checks within one unlocked session
pub fn fast_salted_hash(password: &[u8], salt: &[u8]) -> [u8; DIGEST_LEN] {
    let mut hasher = Sha512_256::new();
    hasher.update(PASSWORD_HASH_DOMAIN);
    hasher.update(salt);
    hasher.update(password);
    hasher.finalize().into()
}

/// Constant-time equality for digests and other fixed secrets
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// Deterministically derives the child keypair at `index` from the master
/// derivation key. Pure function of its inputs; byte order and hash
/// construction are fixed so results are stable across platforms.
pub fn derive_child_keypair(mdk: &[u8], index: u64) -> (VerifyingKey, SigningKey) {
    let mut hasher = Sha512_256::new();
    hasher.update(CHILD_KEY_DOMAIN);
    hasher.update(mdk);
    hasher.update(index.to_le_bytes());
    let seed: [u8; 32] = hasher.finalize().into();

    let sk = SigningKey::from_bytes(&seed);
    let pk = sk.verifying_key();
    (pk, sk)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_kdf() -> KdfConfig {
        KdfConfig::unsafe_for_tests()
    }

    #[test]
    fn password_round_trip() {
        let secret = b"a very secret master key 32bytes";
        let blob =
            wrap_with_password(secret, PurposeTag::MasterKey, b"hunter2", &test_kdf(), true).unwrap();
        let opened = unwrap_with_password(&blob, PurposeTag::MasterKey, b"hunter2").unwrap();
        assert_eq!(opened.reveal(), secret);
    }

    #[test]
    fn blank_password_round_trip() {
        let secret = b"secret";
        let blob = wrap_with_password(secret, PurposeTag::MasterKey, b"", &test_kdf(), true).unwrap();
        let opened = unwrap_with_password(&blob, PurposeTag::MasterKey, b"").unwrap();
        assert_eq!(opened.reveal(), secret);
    }

    #[test]
    fn wrong_password_fails() {
        let blob =
            wrap_with_password(b"secret", PurposeTag::MasterKey, b"right", &test_kdf(), true).unwrap();
        let err = unwrap_with_password(&blob, PurposeTag::MasterKey, b"wrong").unwrap_err();
        assert!(matches!(err, KmdError::Decrypt));
    }

    #[test]
    fn wrong_purpose_tag_fails() {
        let blob =
            wrap_with_password(b"secret", PurposeTag::MasterKey, b"pw", &test_kdf(), true).unwrap();
        let err = unwrap_with_password(&blob, PurposeTag::SecretKey, b"pw").unwrap_err();
        assert!(matches!(err, KmdError::Decrypt));

        // Rewriting the stored tag must not help: the tag is in the AAD.
        let mut forged = blob.clone();
        forged.purpose = PurposeTag::SecretKey;
        let err = unwrap_with_password(&forged, PurposeTag::SecretKey, b"pw").unwrap_err();
        assert!(matches!(err, KmdError::Decrypt));
    }

    #[test]
    fn corrupted_ciphertext_fails() {
        let mut blob =
            wrap_with_password(b"secret", PurposeTag::MasterKey, b"pw", &test_kdf(), true).unwrap();
        blob.ciphertext[0] ^= 0x01;
        let err = unwrap_with_password(&blob, PurposeTag::MasterKey, b"pw").unwrap_err();
        assert!(matches!(err, KmdError::Decrypt));
    }

    #[test]
    fn direct_key_round_trip() {
        let key = [9u8; KEY_LEN];
        let blob = wrap_with_key(b"payload", PurposeTag::SecretKey, &key).unwrap();
        assert!(blob.kdf.is_none());
        let opened = unwrap_with_key(&blob, PurposeTag::SecretKey, &key).unwrap();
        assert_eq!(opened.reveal(), b"payload");

        let other = [10u8; KEY_LEN];
        assert!(unwrap_with_key(&blob, PurposeTag::SecretKey, &other).is_err());
    }

    #[test]
    fn wrap_with_wrong_length_key_is_an_encryption_failure() {
        let err = wrap_with_key(b"x", PurposeTag::SecretKey, &[0u8; 16]).unwrap_err();
        assert!(matches!(err, KmdError::Crypto));
    }

    #[test]
    fn weak_kdf_params_rejected_at_wrap_time() {
        let err =
            wrap_with_password(b"s", PurposeTag::MasterKey, b"pw", &test_kdf(), false).unwrap_err();
        assert!(matches!(err, KmdError::WeakKdfParams(_)));
    }

    #[test]
    fn blob_serialization_round_trips() {
        let key = [3u8; KEY_LEN];
        let blob = wrap_with_key(b"data", PurposeTag::MaxKeyIndex, &key).unwrap();
        let bytes = blob.to_bytes().unwrap();
        let parsed = EncryptedBlob::from_bytes(&bytes).unwrap();
        assert_eq!(blob, parsed);
    }

    #[test]
    fn child_key_derivation_is_deterministic() {
        let mdk = [5u8; 32];
        let (pk1, sk1) = derive_child_keypair(&mdk, 42);
        let (pk2, sk2) = derive_child_keypair(&mdk, 42);
        assert_eq!(pk1, pk2);
        assert_eq!(sk1.to_bytes(), sk2.to_bytes());

        let (pk3, _) = derive_child_keypair(&mdk, 43);
        assert_ne!(pk1, pk3);
    }

    #[test]
    fn fast_hash_agrees_only_on_same_inputs() {
        let salt = [1u8; SALT_LEN];
        let a = fast_salted_hash(b"pw", &salt);
        let b = fast_salted_hash(b"pw", &salt);
        assert!(constant_time_eq(&a, &b));

        let c = fast_salted_hash(b"other", &salt);
        assert!(!constant_time_eq(&a, &c));
    }
}
