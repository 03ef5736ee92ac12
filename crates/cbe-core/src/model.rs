//! The on-disk and in-memory data model: blocks, addresses, generations,
//! hashes, tree nodes, snapshots, and the superblock. See spec §3.

use borsh::{BorshDeserialize, BorshSerialize};
use sha2::{Digest, Sha256};

pub const BLOCK_SIZE: usize = 4096;
pub const HASH_SIZE: usize = 32;

/// Physical Block Address: an index into the backing device.
pub type Pba = u64;

/// Virtual Block Address: an index into the logical device.
pub type Vba = u64;

/// Monotonically increasing version counter stamped onto every CoW node.
pub type Generation = u64;

/// SHA-256 digest over a whole 4 KiB block.
pub type Hash = [u8; HASH_SIZE];

/// The generation a freshly formatted device starts at, before its
/// first secure sequence.
pub const INITIAL_GENERATION: Generation = 0;

pub mod limits {
    //! Tunables fixed at engine-construction time. Named exactly as
    //! spec §3's invariants refer to them.

    pub const TREE_MIN_HEIGHT: u32 = 1;
    pub const TREE_MAX_HEIGHT: u32 = 6;
    pub const TREE_MIN_DEGREE: u32 = 4;

    /// Upper bound on levels walked from root to leaf (inclusive of the
    /// leaf level), used to size fixed on-path scratch arrays.
    pub const MAX_LEVELS: usize = TREE_MAX_HEIGHT as usize + 1;

    pub const NUM_SNAPSHOTS: usize = 8;
    pub const NUM_SUPER_BLOCKS: usize = 2;
    pub const FREE_TREE_RETRY_LIMIT: u32 = 3;

    pub const DEFAULT_CACHE_CAPACITY: usize = 16;
    pub const DEFAULT_REQUEST_POOL_CAPACITY: usize = 32;
}

/// A fixed 4096-byte opaque payload: the unit of I/O, encryption,
/// hashing, and tree storage.
#[derive(Clone)]
pub struct Block(pub [u8; BLOCK_SIZE]);

impl Block {
    pub fn zeroed() -> Self {
        Self([0u8; BLOCK_SIZE])
    }

    pub fn from_bytes(bytes: [u8; BLOCK_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn hash(&self) -> Hash {
        hash_bytes(&self.0)
    }

    pub fn as_slice(&self) -> &[u8; BLOCK_SIZE] {
        &self.0
    }
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.0[..] == other.0[..]
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Block(hash={})", hex_prefix(&self.hash()))
    }
}

pub fn hash_bytes(data: &[u8; BLOCK_SIZE]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

pub fn hex_prefix(hash: &Hash) -> String {
    hash[..4].iter().map(|b| format!("{b:02x}")).collect()
}

/// A type-1 (inner) Merkle tree entry: a child's address, the
/// generation it was stamped with, and the hash of its content.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct Type1Node {
    pub pba: Pba,
    pub generation: Generation,
    pub hash: Hash,
}

impl Type1Node {
    /// A node is in-place updatable only if it already belongs to the
    /// generation currently being composed. Every node reachable from a
    /// secured snapshot — touched or not, regardless of its stamped
    /// generation number — must go through copy-on-write once `current_gen`
    /// has moved past it; a node only ever matches trivially (0 == 0)
    /// before the very first secure, which is the one case reuse is safe.
    pub fn in_place_updatable(&self, current_gen: Generation) -> bool {
        self.generation == current_gen
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct SnapshotFlags {
    pub keep: bool,
    pub valid: bool,
}

/// One complete Merkle tree root, captured at one generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct Snapshot {
    pub id: u64,
    pub pba: Pba,
    pub hash: Hash,
    pub generation: Generation,
    pub height: u32,
    pub leaves: u64,
    pub flags: SnapshotFlags,
}

impl Snapshot {
    pub const INVALID_ID: u64 = u64::MAX;

    pub fn valid(&self) -> bool {
        self.flags.valid
    }

    pub fn keep(&self) -> bool {
        self.flags.keep
    }
}

/// Root of the independent free-space Merkle tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct FreeTreeRoot {
    pub pba: Pba,
    pub hash: Hash,
    pub generation: Generation,
    pub height: u32,
    pub degree: u32,
    pub leaves: u64,
}

/// The 4 KiB block that names the current snapshot set, the free tree,
/// and the last secured generation. One of `NUM_SUPER_BLOCKS` slots
/// stored at the front of the backing device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct SuperBlock {
    pub snapshots: [Snapshot; limits::NUM_SNAPSHOTS],
    pub current_snapshot_id: u64,
    pub last_secured_generation: Generation,
    pub free_tree_root: FreeTreeRoot,
    pub degree: u32,
    pub valid: bool,
}

impl Default for SuperBlock {
    fn default() -> Self {
        Self {
            snapshots: [Snapshot::default(); limits::NUM_SNAPSHOTS],
            current_snapshot_id: 0,
            last_secured_generation: 0,
            free_tree_root: FreeTreeRoot::default(),
            degree: limits::TREE_MIN_DEGREE,
            valid: false,
        }
    }
}

impl SuperBlock {
    /// The slot among `snapshots` whose `id` matches `current_snapshot_id`.
    pub fn current_snapshot_slot(&self) -> Option<usize> {
        self.snapshots
            .iter()
            .position(|snap| snap.valid() && snap.id == self.current_snapshot_id)
    }

    /// Packs the superblock into its on-disk 4 KiB block. Borsh's
    /// encoding is far smaller than the block; the remainder stays
    /// zero-padded.
    pub fn to_block(&self) -> Block {
        let bytes = borsh::to_vec(self).expect("superblock serialization is infallible");
        assert!(bytes.len() <= BLOCK_SIZE, "superblock exceeds block size");
        let mut block = Block::zeroed();
        block.0[..bytes.len()].copy_from_slice(&bytes);
        block
    }

    pub fn from_block(block: &Block) -> Result<Self, crate::error::StartupError> {
        let mut reader: &[u8] = block.as_slice();
        BorshDeserialize::deserialize(&mut reader)
            .map_err(|_| crate::error::StartupError::NoValidSuperBlock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn superblock_round_trips_through_a_block() {
        let mut sb = SuperBlock {
            valid: true,
            current_snapshot_id: 3,
            last_secured_generation: 7,
            ..SuperBlock::default()
        };
        sb.snapshots[0] = Snapshot {
            id: 3,
            pba: 42,
            hash: [9; HASH_SIZE],
            generation: 7,
            height: 2,
            leaves: 64,
            flags: SnapshotFlags {
                keep: false,
                valid: true,
            },
        };

        let block = sb.to_block();
        let parsed = SuperBlock::from_block(&block).unwrap();
        assert_eq!(parsed, sb);
    }

    #[test]
    fn block_of_zeros_is_not_a_valid_superblock() {
        let parsed = SuperBlock::from_block(&Block::zeroed()).unwrap();
        assert!(!parsed.valid);
    }
}
