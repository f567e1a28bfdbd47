//! Multisig address derivation and partial-signature bookkeeping.
//!
//! A multisig address commits to the exact version, threshold, and ordered
//! set of public keys that may sign for it:
//! `Hash("MultisigAddr" || version || threshold || pk1 || pk2 || ...)`.
//! Subsignature slots always mirror the preimage key order; that order is
//! part of the address derivation and is never permuted.

use ed25519_dalek::{PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use serde::{Deserialize, Serialize};

use crate::crypto::hash;
use crate::error::{KmdError, Result};
use crate::types::Address;

const MULTISIG_ADDR_DOMAIN: &[u8] = b"MultisigAddr";

/// The data a multisig address is derived from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultisigPreimage {
    pub version: u8,
    pub threshold: u8,
    pub pks: Vec<[u8; PUBLIC_KEY_LENGTH]>,
}

impl MultisigPreimage {
    pub fn new(version: u8, threshold: u8, pks: Vec<[u8; PUBLIC_KEY_LENGTH]>) -> Self {
        Self {
            version,
            threshold,
            pks,
        }
    }

    /// Derives the multisig address this preimage commits to
    pub fn address(&self) -> Result<Address> {
        if self.pks.is_empty()
            || self.threshold == 0
            || usize::from(self.threshold) > self.pks.len()
        {
            return Err(KmdError::InvalidMultisigPreimage);
        }

        let mut buf =
            Vec::with_capacity(MULTISIG_ADDR_DOMAIN.len() + 2 + self.pks.len() * PUBLIC_KEY_LENGTH);
        buf.extend_from_slice(MULTISIG_ADDR_DOMAIN);
        buf.push(self.version);
        buf.push(self.threshold);
        for pk in &self.pks {
            buf.extend_from_slice(pk);
        }
        Ok(Address(hash(&buf)))
    }

    /// Position of `pk` within the ordered key set
    fn position(&self, pk: &[u8; PUBLIC_KEY_LENGTH]) -> Option<usize> {
        self.pks.iter().position(|candidate| candidate == pk)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(
            self,
            bincode::config::standard(),
        )?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (preimage, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(preimage)
    }
}

/// One slot of a multisig signature: the key and, once that party has
/// signed, its signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultisigSubsig {
    pub key: [u8; PUBLIC_KEY_LENGTH],
    pub sig: Option<Vec<u8>>,
}

/// A (possibly partial) multisig signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultisigSig {
    pub version: u8,
    pub threshold: u8,
    pub subsigs: Vec<MultisigSubsig>,
}

impl MultisigSig {
    /// Reconstructs the preimage embedded in this signature
    pub fn preimage(&self) -> MultisigPreimage {
        MultisigPreimage {
            version: self.version,
            threshold: self.threshold,
            pks: self.subsigs.iter().map(|s| s.key).collect(),
        }
    }

    /// Recomputes the multisig address from the embedded preimage
    pub fn address(&self) -> Result<Address> {
        self.preimage().address()
    }

    /// Builds a fresh partial signature over `preimage` with exactly one
    /// populated slot, at the position of `pk` in the preimage key order
    pub fn new_partial(
        preimage: &MultisigPreimage,
        pk: &[u8; PUBLIC_KEY_LENGTH],
        sig: [u8; SIGNATURE_LENGTH],
    ) -> Result<Self> {
        let pos = preimage.position(pk).ok_or(KmdError::MultisigWrongKey)?;

        let subsigs = preimage
            .pks
            .iter()
            .enumerate()
            .map(|(i, key)| MultisigSubsig {
                key: *key,
                sig: (i == pos).then(|| sig.to_vec()),
            })
            .collect();

        Ok(Self {
            version: preimage.version,
            threshold: preimage.threshold,
            subsigs,
        })
    }

    /// Inserts (or overwrites) `pk`'s signature slot, leaving every other
    /// slot untouched
    pub fn merge_signature(
        &mut self,
        pk: &[u8; PUBLIC_KEY_LENGTH],
        sig: [u8; SIGNATURE_LENGTH],
    ) -> Result<()> {
        let slot = self
            .subsigs
            .iter_mut()
            .find(|s| &s.key == pk)
            .ok_or(KmdError::MultisigWrongKey)?;
        slot.sig = Some(sig.to_vec());
        Ok(())
    }

    /// Whether `pk` appears among the embedded keys
    pub fn contains_key(&self, pk: &[u8; PUBLIC_KEY_LENGTH]) -> bool {
        self.subsigs.iter().any(|s| &s.key == pk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pks(n: u8) -> Vec<[u8; PUBLIC_KEY_LENGTH]> {
        (0..n).map(|i| [i + 1; PUBLIC_KEY_LENGTH]).collect()
    }

    #[test]
    fn address_is_deterministic() {
        let preimage = MultisigPreimage::new(1, 2, pks(3));
        assert_eq!(
            preimage.address().unwrap(),
            preimage.address().unwrap()
        );
    }

    #[test]
    fn address_depends_on_key_order() {
        let mut reordered = pks(3);
        reordered.swap(0, 2);
        let a = MultisigPreimage::new(1, 2, pks(3)).address().unwrap();
        let b = MultisigPreimage::new(1, 2, reordered).address().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn address_depends_on_version_and_threshold() {
        let base = MultisigPreimage::new(1, 2, pks(3)).address().unwrap();
        let v2 = MultisigPreimage::new(2, 2, pks(3)).address().unwrap();
        let t3 = MultisigPreimage::new(1, 3, pks(3)).address().unwrap();
        assert_ne!(base, v2);
        assert_ne!(base, t3);
    }

    #[test]
    fn degenerate_preimages_are_rejected() {
        assert!(MultisigPreimage::new(1, 0, pks(2)).address().is_err());
        assert!(MultisigPreimage::new(1, 3, pks(2)).address().is_err());
        assert!(MultisigPreimage::new(1, 1, vec![]).address().is_err());
    }

    #[test]
    fn new_partial_populates_only_the_signer_slot() {
        let preimage = MultisigPreimage::new(1, 2, pks(3));
        let signer = preimage.pks[1];
        let msig = MultisigSig::new_partial(&preimage, &signer, [7u8; SIGNATURE_LENGTH]).unwrap();

        assert_eq!(msig.subsigs.len(), 3);
        assert!(msig.subsigs[0].sig.is_none());
        assert_eq!(msig.subsigs[1].sig.as_deref(), Some(&[7u8; 64][..]));
        assert!(msig.subsigs[2].sig.is_none());
        assert_eq!(msig.address().unwrap(), preimage.address().unwrap());
    }

    #[test]
    fn new_partial_rejects_foreign_key() {
        let preimage = MultisigPreimage::new(1, 2, pks(3));
        let outsider = [0xAA; PUBLIC_KEY_LENGTH];
        let err =
            MultisigSig::new_partial(&preimage, &outsider, [0u8; SIGNATURE_LENGTH]).unwrap_err();
        assert!(matches!(err, KmdError::MultisigWrongKey));
    }

    #[test]
    fn merge_preserves_other_slots() {
        let preimage = MultisigPreimage::new(1, 2, pks(3));
        let mut msig =
            MultisigSig::new_partial(&preimage, &preimage.pks[0], [1u8; SIGNATURE_LENGTH]).unwrap();
        msig.merge_signature(&preimage.pks[2], [3u8; SIGNATURE_LENGTH])
            .unwrap();

        assert_eq!(msig.subsigs[0].sig.as_deref(), Some(&[1u8; 64][..]));
        assert!(msig.subsigs[1].sig.is_none());
        assert_eq!(msig.subsigs[2].sig.as_deref(), Some(&[3u8; 64][..]));

        let err = msig
            .merge_signature(&[0xBB; PUBLIC_KEY_LENGTH], [0u8; SIGNATURE_LENGTH])
            .unwrap_err();
        assert!(matches!(err, KmdError::MultisigWrongKey));
    }

    #[test]
    fn preimage_encoding_round_trips() {
        let preimage = MultisigPreimage::new(1, 2, pks(4));
        let bytes = preimage.encode().unwrap();
        assert_eq!(MultisigPreimage::decode(&bytes).unwrap(), preimage);
    }
}
