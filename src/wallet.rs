//! A single wallet: password-gated key lifecycle and signing operations.
//!
//! A fetched wallet starts locked. [`Wallet::init`] unwraps the master
//! encryption key under the password and the master derivation key under
//! the MEK, and caches both in zero-on-drop memory for the lifetime of the
//! handle. Every password-taking operation re-validates the password first,
//! against a cached salted hash when one exists or by a full unwrap attempt
//! otherwise.

use std::sync::{Arc, RwLock};

use ed25519_dalek::{Signer, SigningKey, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use tracing::debug;

use crate::crypto::{self, DIGEST_LEN, EncryptedBlob, PurposeTag, SALT_LEN, Secret};
use crate::driver::{INFO_KEY_MAX_IDX, INFO_KEY_MDK, MetadataRecord};
use crate::error::{KmdError, Result};
use crate::multisig::{MultisigPreimage, MultisigSig};
use crate::storage::{Relation, StorageBackend, WriteOp};
use crate::types::{
    Address, MDK_LEN, MasterDerivationKey, Transaction, SignedTransaction, WalletMetadata,
    program_bytes_to_sign, public_key_to_address,
};

/// Index value at which key generation gives up. Generated indices stay
/// strictly below this sentinel.
const KEY_INDEX_OVERFLOW: u64 = 1 << 63;

/// Secrets cached while the wallet is unlocked
struct Session {
    mek: Secret,
    mdk: Secret,
    password_salt: [u8; SALT_LEN],
    password_hash: [u8; DIGEST_LEN],
}

/// A wallet handle. Locked until [`Wallet::init`] succeeds.
pub struct Wallet<B: StorageBackend> {
    backend: Arc<B>,
    unit: String,
    /// Serializes read-modify-write sequences against this wallet; shared
    /// with the driver (and any other handle to the same wallet)
    lock: Arc<RwLock<()>>,
    session: Option<Session>,
}

impl<B: StorageBackend> std::fmt::Debug for Wallet<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wallet")
            .field("unit", &self.unit)
            .finish_non_exhaustive()
    }
}

impl<B: StorageBackend> Wallet<B> {
    pub(crate) fn new(backend: Arc<B>, unit: String, lock: Arc<RwLock<()>>) -> Self {
        Self {
            backend,
            unit,
            lock,
            session: None,
        }
    }

    fn read_record(&self) -> Result<MetadataRecord> {
        let bytes = self.backend.get_metadata(&self.unit)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn session(&self) -> Result<&Session> {
        self.session.as_ref().ok_or(KmdError::NotInitialized)
    }

    /// Unwraps the MEK with the password, never caching anything
    fn unwrap_master_key(&self, password: &[u8]) -> Result<Secret> {
        let record = self.read_record()?;
        crypto::unwrap_with_password(&record.mek_encrypted, PurposeTag::MasterKey, password)
    }

    fn info_blob(&self, key: &[u8]) -> Result<EncryptedBlob> {
        let bytes = self
            .backend
            .get(&self.unit, Relation::Info, key)?
            .ok_or(KmdError::Decrypt)?;
        EncryptedBlob::from_bytes(&bytes)
    }

    /// Builds the wallet's metadata from the stored record. Works while
    /// locked.
    pub fn metadata(&self) -> Result<WalletMetadata> {
        Ok(self.read_record()?.to_metadata())
    }

    /// Unlocks the wallet: decrypts the MEK and MDK and caches them, along
    /// with a salted password digest for fast re-checks
    pub fn init(&mut self, password: &[u8]) -> Result<()> {
        let mek = self.unwrap_master_key(password)?;

        let mdk_blob = self.info_blob(INFO_KEY_MDK)?;
        let mdk =
            crypto::unwrap_with_key(&mdk_blob, PurposeTag::MasterDerivationKey, mek.reveal())?;

        let mut password_salt = [0u8; SALT_LEN];
        crypto::fill_random(&mut password_salt);
        let password_hash = crypto::fast_salted_hash(password, &password_salt);

        self.session = Some(Session {
            mek,
            mdk,
            password_salt,
            password_hash,
        });
        debug!(unit = self.unit, "wallet unlocked");
        Ok(())
    }

    /// Checks the password. Fast path compares against the cached salted
    /// hash in constant time; without a cache it performs a full unwrap
    /// attempt. Both paths agree with what a fresh slow unwrap concludes.
    pub fn check_password(&self, password: &[u8]) -> Result<()> {
        if let Some(session) = &self.session {
            let candidate = crypto::fast_salted_hash(password, &session.password_salt);
            if crypto::constant_time_eq(&candidate, &session.password_hash) {
                return Ok(());
            }
            return Err(KmdError::Decrypt);
        }
        self.unwrap_master_key(password).map(|_| ())
    }

    /// Decrypts and returns the master derivation key
    pub fn export_master_derivation_key(&self, password: &[u8]) -> Result<MasterDerivationKey> {
        let session = self.session()?;
        self.check_password(password)?;

        let bytes: [u8; MDK_LEN] = session
            .mdk
            .reveal()
            .try_into()
            .map_err(|_| KmdError::Decrypt)?;
        Ok(MasterDerivationKey(bytes))
    }

    /// All single-key addresses stored in the wallet
    pub fn list_keys(&self) -> Result<Vec<Address>> {
        self.session()?;
        let _guard = self.lock.read().unwrap_or_else(|e| e.into_inner());
        self.backend
            .keys(&self.unit, Relation::Keys)?
            .iter()
            .map(|k| Address::from_slice(k))
            .collect()
    }

    /// Whether the account with this address is stored in the wallet.
    /// Absence is `Ok(false)`; any other storage failure propagates.
    pub fn check_address_in_wallet(&self, address: Address) -> Result<bool> {
        self.session()?;
        Ok(self
            .backend
            .get(&self.unit, Relation::Keys, address.as_bytes())?
            .is_some())
    }

    /// Derives the next keypair from the master derivation key and stores
    /// it.
    ///
    /// Walks past indices whose derived address was already imported
    /// manually; the key insert and the max-index update commit together.
    pub fn generate_key(&self, display_mnemonic: bool) -> Result<Address> {
        let session = self.session()?;
        if display_mnemonic {
            // This engine has no way to show a mnemonic to the user.
            return Err(KmdError::NoMnemonicUX);
        }

        let _guard = self.lock.write().unwrap_or_else(|e| e.into_inner());

        let idx_blob = self.info_blob(INFO_KEY_MAX_IDX)?;
        let idx_plain =
            crypto::unwrap_with_key(&idx_blob, PurposeTag::MaxKeyIndex, session.mek.reveal())?;
        let highest = u64::from_le_bytes(
            idx_plain
                .reveal()
                .try_into()
                .map_err(|_| KmdError::Decrypt)?,
        );

        let mut next = highest + 1;
        let (address, sk) = loop {
            if next >= KEY_INDEX_OVERFLOW {
                return Err(KmdError::TooManyKeys);
            }

            let (pk, sk) = crypto::derive_child_keypair(session.mdk.reveal(), next);
            let address = public_key_to_address(&pk);

            if self
                .backend
                .get(&self.unit, Relation::Keys, address.as_bytes())?
                .is_none()
            {
                break (address, sk);
            }
            // The user imported this key manually; skip its index.
            next += 1;
        };

        let sk_blob =
            crypto::wrap_with_key(&sk.to_bytes(), PurposeTag::SecretKey, session.mek.reveal())?;
        let new_idx_blob = crypto::wrap_with_key(
            &next.to_le_bytes(),
            PurposeTag::MaxKeyIndex,
            session.mek.reveal(),
        )?;

        // Key and index must land together or not at all.
        self.backend.apply(
            &self.unit,
            &[
                WriteOp::put(Relation::Keys, address.as_bytes(), sk_blob.to_bytes()?),
                WriteOp::put(Relation::Info, INFO_KEY_MAX_IDX, new_idx_blob.to_bytes()?),
            ],
        )?;

        debug!(unit = self.unit, %address, "generated key");
        Ok(address)
    }

    /// Imports a key from its 32-byte seed, deriving the public half from
    /// the seed alone
    pub fn import_key(&self, seed: &[u8; 32]) -> Result<Address> {
        let session = self.session()?;
        let _guard = self.lock.write().unwrap_or_else(|e| e.into_inner());

        let sk = SigningKey::from_bytes(seed);
        let address = public_key_to_address(&sk.verifying_key());

        let sk_blob =
            crypto::wrap_with_key(&sk.to_bytes(), PurposeTag::SecretKey, session.mek.reveal())?;

        match self.backend.insert(
            &self.unit,
            Relation::Keys,
            address.as_bytes(),
            &sk_blob.to_bytes()?,
        ) {
            Ok(()) => {}
            Err(crate::storage::StorageError::KeyExists) => return Err(KmdError::KeyExists),
            Err(e) => return Err(e.into()),
        }

        debug!(unit = self.unit, %address, "imported key");
        Ok(address)
    }

    /// Fetches and decrypts the stored secret key for `address`, verifying
    /// that the key really derives that address
    fn fetch_secret_key(&self, session: &Session, address: Address) -> Result<SigningKey> {
        let bytes = self
            .backend
            .get(&self.unit, Relation::Keys, address.as_bytes())?
            .ok_or(KmdError::KeyNotFound)?;
        let blob = EncryptedBlob::from_bytes(&bytes).map_err(|_| KmdError::Tampering)?;
        let seed_plain =
            crypto::unwrap_with_key(&blob, PurposeTag::SecretKey, session.mek.reveal())?;

        let seed: [u8; 32] = seed_plain
            .reveal()
            .try_into()
            .map_err(|_| KmdError::Tampering)?;
        let sk = SigningKey::from_bytes(&seed);

        // The decrypted key must derive the address it was filed under.
        if public_key_to_address(&sk.verifying_key()) != address {
            return Err(KmdError::Tampering);
        }
        Ok(sk)
    }

    /// Decrypts and returns the 32-byte seed stored for `address`
    pub fn export_key(&self, address: Address, password: &[u8]) -> Result<Secret> {
        let session = self.session()?;
        self.check_password(password)?;

        let _guard = self.lock.read().unwrap_or_else(|e| e.into_inner());
        let sk = self.fetch_secret_key(session, address)?;
        Ok(Secret::new(sk.to_bytes().to_vec()))
    }

    /// Deletes the key stored for `address`. Deleting an absent key is an
    /// error, not a no-op.
    pub fn delete_key(&self, address: Address, password: &[u8]) -> Result<()> {
        self.session()?;
        self.check_password(password)?;

        let _guard = self.lock.write().unwrap_or_else(|e| e.into_inner());
        if !self
            .backend
            .delete(&self.unit, Relation::Keys, address.as_bytes())?
        {
            return Err(KmdError::KeyNotFound);
        }
        debug!(unit = self.unit, %address, "deleted key");
        Ok(())
    }

    /// Stores a multisig preimage and returns the address it derives
    pub fn import_multisig(
        &self,
        version: u8,
        threshold: u8,
        pks: &[[u8; PUBLIC_KEY_LENGTH]],
    ) -> Result<Address> {
        self.session()?;
        let _guard = self.lock.write().unwrap_or_else(|e| e.into_inner());

        let preimage = MultisigPreimage::new(version, threshold, pks.to_vec());
        let address = preimage.address()?;

        match self.backend.insert(
            &self.unit,
            Relation::MultisigPreimages,
            address.as_bytes(),
            &preimage.encode()?,
        ) {
            Ok(()) => {}
            Err(crate::storage::StorageError::KeyExists) => return Err(KmdError::MultisigExists),
            Err(e) => return Err(e.into()),
        }

        debug!(unit = self.unit, %address, "imported multisig address");
        Ok(address)
    }

    /// Fetches the preimage stored for a multisig address, re-deriving the
    /// address from it on every read as a tamper check
    pub fn lookup_multisig(&self, address: Address) -> Result<MultisigPreimage> {
        self.session()?;
        let bytes = self
            .backend
            .get(&self.unit, Relation::MultisigPreimages, address.as_bytes())?
            .ok_or(KmdError::MultisigNotFound)?;
        let preimage = MultisigPreimage::decode(&bytes).map_err(|_| KmdError::Tampering)?;

        if preimage.address()? != address {
            return Err(KmdError::Tampering);
        }
        Ok(preimage)
    }

    /// All multisig addresses whose preimages the wallet knows
    pub fn list_multisig(&self) -> Result<Vec<Address>> {
        self.session()?;
        let _guard = self.lock.read().unwrap_or_else(|e| e.into_inner());
        self.backend
            .keys(&self.unit, Relation::MultisigPreimages)?
            .iter()
            .map(|k| Address::from_slice(k))
            .collect()
    }

    /// Deletes a stored multisig preimage
    pub fn delete_multisig(&self, address: Address, password: &[u8]) -> Result<()> {
        self.session()?;
        self.check_password(password)?;

        let _guard = self.lock.write().unwrap_or_else(|e| e.into_inner());
        if !self.backend.delete(
            &self.unit,
            Relation::MultisigPreimages,
            address.as_bytes(),
        )? {
            return Err(KmdError::MultisigNotFound);
        }
        debug!(unit = self.unit, %address, "deleted multisig address");
        Ok(())
    }

    /// Signs a transaction. When `pk` is absent or all zero, the signing
    /// key is the one for the transaction's sender address.
    pub fn sign_transaction(
        &self,
        tx: &Transaction,
        pk: Option<&[u8; PUBLIC_KEY_LENGTH]>,
        password: &[u8],
    ) -> Result<Vec<u8>> {
        let session = self.session()?;
        self.check_password(password)?;

        let address = match pk {
            Some(pk) if pk != &[0u8; PUBLIC_KEY_LENGTH] => Address(*pk),
            _ => tx.sender,
        };

        let _guard = self.lock.read().unwrap_or_else(|e| e.into_inner());
        let sk = self.fetch_secret_key(session, address)?;
        let signature = sk.sign(&tx.bytes_to_sign()?);

        SignedTransaction {
            signature: signature.to_bytes().to_vec(),
            transaction: tx.clone(),
        }
        .encode()
    }

    /// Signs arbitrary program bytes for the `src` address
    pub fn sign_program(&self, program: &[u8], src: Address, password: &[u8]) -> Result<Vec<u8>> {
        let session = self.session()?;
        self.check_password(password)?;

        let _guard = self.lock.read().unwrap_or_else(|e| e.into_inner());
        let sk = self.fetch_secret_key(session, src)?;
        let signature = sk.sign(&program_bytes_to_sign(program));
        Ok(signature.to_bytes().to_vec())
    }

    /// Starts or extends a multisig signature over a transaction.
    ///
    /// With no partial, the preimage is looked up by the transaction's
    /// sender and a fresh partial is built with one populated slot. With a
    /// partial, its embedded preimage must re-derive either the sender or
    /// the explicitly supplied `signer` address, and `pk` must be one of
    /// its keys.
    pub fn multisig_sign_transaction(
        &self,
        tx: &Transaction,
        pk: &[u8; PUBLIC_KEY_LENGTH],
        partial: Option<MultisigSig>,
        password: &[u8],
        signer: Option<Address>,
    ) -> Result<MultisigSig> {
        let session = self.session()?;
        self.check_password(password)?;

        let message = tx.bytes_to_sign()?;
        self.multisig_sign(session, &message, tx.sender, pk, partial, signer)
    }

    /// Starts or extends a multisig signature over program bytes for the
    /// `src` multisig address
    pub fn multisig_sign_program(
        &self,
        program: &[u8],
        src: Address,
        pk: &[u8; PUBLIC_KEY_LENGTH],
        partial: Option<MultisigSig>,
        password: &[u8],
    ) -> Result<MultisigSig> {
        let session = self.session()?;
        self.check_password(password)?;

        let message = program_bytes_to_sign(program);
        self.multisig_sign(session, &message, src, pk, partial, None)
    }

    fn multisig_sign(
        &self,
        session: &Session,
        message: &[u8],
        principal: Address,
        pk: &[u8; PUBLIC_KEY_LENGTH],
        partial: Option<MultisigSig>,
        signer: Option<Address>,
    ) -> Result<MultisigSig> {
        let _guard = self.lock.read().unwrap_or_else(|e| e.into_inner());

        match partial {
            None => {
                let preimage = self.lookup_multisig_internal(principal)?;
                let sig = self.sign_with_key(session, pk, message)?;
                MultisigSig::new_partial(&preimage, pk, sig)
            }
            Some(mut partial) => {
                // The partial's own preimage decides which account it is
                // for; it must match the principal or the explicit signer.
                let partial_address = partial.address()?;
                if partial_address != principal && Some(partial_address) != signer {
                    return Err(KmdError::MultisigWrongAddress);
                }
                if !partial.contains_key(pk) {
                    return Err(KmdError::MultisigWrongKey);
                }

                let sig = self.sign_with_key(session, pk, message)?;
                partial.merge_signature(pk, sig)?;
                Ok(partial)
            }
        }
    }

    /// Lookup without re-taking the wallet lock (callers hold it)
    fn lookup_multisig_internal(&self, address: Address) -> Result<MultisigPreimage> {
        let bytes = self
            .backend
            .get(&self.unit, Relation::MultisigPreimages, address.as_bytes())?
            .ok_or(KmdError::MultisigNotFound)?;
        let preimage = MultisigPreimage::decode(&bytes).map_err(|_| KmdError::Tampering)?;
        if preimage.address()? != address {
            return Err(KmdError::Tampering);
        }
        Ok(preimage)
    }

    fn sign_with_key(
        &self,
        session: &Session,
        pk: &[u8; PUBLIC_KEY_LENGTH],
        message: &[u8],
    ) -> Result<[u8; SIGNATURE_LENGTH]> {
        let sk = self.fetch_secret_key(session, Address(*pk))?;
        Ok(sk.sign(message).to_bytes())
    }
}
