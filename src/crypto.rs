//! Cryptographic collaborator.
//!
//! The engine treats cryptography as an injected service: it needs random
//! identifiers, a content hash, and seal/open for block payloads. The
//! default [LocalCrypto] hashes with blake3 and uses a length-preserving
//! no-op cipher; production deployments supply a real implementation along
//! with their key machinery.

use bytes::Bytes;
use rand::RngCore;

use crate::ids::{BlockId, BranchId, KeyGen, RefNonce, BLOCK_ID_LEN, TLF_ID_LEN};
use crate::Error;

/// Server half of a block key split, stored next to the block so neither
/// side alone can decrypt.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct KeyHalf(pub [u8; 32]);

pub trait Crypto: Send + Sync {
    /// A random id for a dirty block that hasn't been readied yet.
    fn make_temporary_block_id(&self) -> BlockId;

    /// A fresh nonce for referencing existing block contents a second time.
    fn make_ref_nonce(&self) -> RefNonce;

    /// A random id for a new unmerged branch.
    fn make_branch_id(&self) -> BranchId;

    /// A random seed diversifying the pre-seal hash of a block.
    fn make_block_seed(&self) -> u64;

    fn make_key_half(&self) -> KeyHalf;

    fn hash(&self, data: &[u8]) -> [u8; BLOCK_ID_LEN];

    /// Seals an encoded block payload under the given key generation.
    fn seal(&self, plain: &[u8], key_gen: KeyGen, half: &KeyHalf) -> Bytes;

    /// Reverses [Crypto::seal].
    fn open(&self, sealed: &[u8], key_gen: KeyGen, half: &KeyHalf) -> Result<Bytes, Error>;
}

/// Hash-only crypto: real content addresses, identity cipher.
#[derive(Default)]
pub struct LocalCrypto;

impl Crypto for LocalCrypto {
    fn make_temporary_block_id(&self) -> BlockId {
        let mut bytes = [0; BLOCK_ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        BlockId::temporary(bytes)
    }

    fn make_ref_nonce(&self) -> RefNonce {
        let mut bytes = [0; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        RefNonce(bytes)
    }

    fn make_branch_id(&self) -> BranchId {
        let mut bytes = [0; TLF_ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        BranchId(bytes)
    }

    fn make_block_seed(&self) -> u64 {
        rand::thread_rng().next_u64()
    }

    fn make_key_half(&self) -> KeyHalf {
        let mut bytes = [0; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        KeyHalf(bytes)
    }

    fn hash(&self, data: &[u8]) -> [u8; BLOCK_ID_LEN] {
        *blake3::hash(data).as_bytes()
    }

    fn seal(&self, plain: &[u8], _key_gen: KeyGen, _half: &KeyHalf) -> Bytes {
        Bytes::copy_from_slice(plain)
    }

    fn open(&self, sealed: &[u8], _key_gen: KeyGen, _half: &KeyHalf) -> Result<Bytes, Error> {
        Ok(Bytes::copy_from_slice(sealed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temporary_ids_are_flagged_and_unique() {
        let crypto = LocalCrypto::default();
        let a = crypto.make_temporary_block_id();
        let b = crypto.make_temporary_block_id();
        assert!(a.is_temporary());
        assert_ne!(a, b);
    }

    #[test]
    fn seal_round_trip() {
        let crypto = LocalCrypto::default();
        let half = crypto.make_key_half();
        let sealed = crypto.seal(b"payload", KeyGen::FIRST_VALID, &half);
        let opened = crypto.open(&sealed, KeyGen::FIRST_VALID, &half).unwrap();
        assert_eq!(&opened[..], b"payload");
    }
}
