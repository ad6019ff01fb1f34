use data_encoding::BASE32_NOPAD;
use serde::{Deserialize, Serialize};

/// Length of a content-hash block id, in bytes.
pub const BLOCK_ID_LEN: usize = 32;

/// Length of a top-level folder id, in bytes.
pub const TLF_ID_LEN: usize = 16;

const TLF_SUFFIX_PRIVATE: u8 = 0x16;
const TLF_SUFFIX_PUBLIC: u8 = 0x17;

/// Identifier of a single block.
///
/// A block id is either the content hash of the block's sealed payload, or a
/// randomly generated temporary id assigned to a dirty block that has not been
/// readied yet. The two namespaces are kept apart by the `temporary` flag so a
/// half-written block can never shadow real content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockId {
    bytes: [u8; BLOCK_ID_LEN],
    temporary: bool,
}

impl BlockId {
    pub const NULL: BlockId = BlockId {
        bytes: [0; BLOCK_ID_LEN],
        temporary: false,
    };

    pub fn from_hash(bytes: [u8; BLOCK_ID_LEN]) -> Self {
        BlockId {
            bytes,
            temporary: false,
        }
    }

    pub fn temporary(bytes: [u8; BLOCK_ID_LEN]) -> Self {
        BlockId {
            bytes,
            temporary: true,
        }
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    pub fn as_bytes(&self) -> &[u8; BLOCK_ID_LEN] {
        &self.bytes
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix = if self.temporary { "tmp" } else { "b3" };
        write!(f, "{}:{}", prefix, BASE32_NOPAD.encode(&self.bytes[..10]))
    }
}

impl std::fmt::Debug for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

/// Identifier of a metadata revision, the hash of its canonical encoding.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MdId(pub [u8; BLOCK_ID_LEN]);

impl MdId {
    pub const NULL: MdId = MdId([0; BLOCK_ID_LEN]);

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }
}

impl std::fmt::Display for MdId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "md:{}", BASE32_NOPAD.encode(&self.0[..10]))
    }
}

impl std::fmt::Debug for MdId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

/// Identifier of a top-level folder. The last byte marks the folder as
/// private or public.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TlfId(pub [u8; TLF_ID_LEN]);

impl TlfId {
    pub fn new_private(mut bytes: [u8; TLF_ID_LEN]) -> Self {
        bytes[TLF_ID_LEN - 1] = TLF_SUFFIX_PRIVATE;
        TlfId(bytes)
    }

    pub fn new_public(mut bytes: [u8; TLF_ID_LEN]) -> Self {
        bytes[TLF_ID_LEN - 1] = TLF_SUFFIX_PUBLIC;
        TlfId(bytes)
    }

    pub fn is_public(&self) -> bool {
        self.0[TLF_ID_LEN - 1] == TLF_SUFFIX_PUBLIC
    }
}

impl std::fmt::Display for TlfId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tlf:{}", BASE32_NOPAD.encode(&self.0))
    }
}

impl std::fmt::Debug for TlfId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

/// Identifier of an unmerged branch, randomly generated when a device
/// discovers it has forked from the merged history.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BranchId(pub [u8; TLF_ID_LEN]);

impl BranchId {
    pub const NULL: BranchId = BranchId([0; TLF_ID_LEN]);

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }
}

impl std::fmt::Display for BranchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "br:{}", BASE32_NOPAD.encode(&self.0[..8]))
    }
}

impl std::fmt::Debug for BranchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

/// Identifier of a user (or more precisely, of the device key owner that
/// authored a block or revision).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct UserId(pub [u8; TLF_ID_LEN]);

impl UserId {
    pub const NULL: UserId = UserId([0; TLF_ID_LEN]);

    /// Derives a stable user id from a username. Identity resolution proper
    /// lives in the identity service; this is the local representation.
    pub fn from_name(name: &str) -> Self {
        let digest = blake3::hash(name.as_bytes());
        let mut bytes = [0; TLF_ID_LEN];
        bytes.copy_from_slice(&digest.as_bytes()[..TLF_ID_LEN]);
        UserId(bytes)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "u:{}", BASE32_NOPAD.encode(&self.0[..6]))
    }
}

impl std::fmt::Debug for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

/// A nonce distinguishing multiple references to the same block contents.
/// The zero nonce marks the first (creating) reference.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RefNonce(pub [u8; 8]);

impl RefNonce {
    pub const ZERO: RefNonce = RefNonce([0; 8]);

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl std::fmt::Debug for RefNonce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n:{}", BASE32_NOPAD.encode(&self.0))
    }
}

/// Key generation a block was sealed under.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Debug, Serialize, Deserialize,
)]
pub struct KeyGen(pub u32);

impl KeyGen {
    pub const FIRST_VALID: KeyGen = KeyGen(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_id_namespaces_are_disjoint() {
        let bytes = [7u8; BLOCK_ID_LEN];
        assert_ne!(BlockId::from_hash(bytes), BlockId::temporary(bytes));
    }

    #[test]
    fn tlf_suffix() {
        assert!(!TlfId::new_private([0; TLF_ID_LEN]).is_public());
        assert!(TlfId::new_public([0; TLF_ID_LEN]).is_public());
    }

    #[test]
    fn null_ids() {
        assert!(BlockId::NULL.is_null());
        assert!(!BlockId::temporary([0; BLOCK_ID_LEN]).is_null());
        assert!(BranchId::NULL.is_null());
    }
}
