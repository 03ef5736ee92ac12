//! On-disk layout of a type-1 (inner) node block: `degree` packed
//! `Type1Node` entries, zero-padded to fill the 4 KiB block (spec §3:
//! "an inner node block contains `degree` such entries").

use crate::model::{Block, Generation, Pba, Type1Node, BLOCK_SIZE, HASH_SIZE};

const ENTRY_SIZE: usize = 8 + 8 + HASH_SIZE; // pba + generation + hash

pub const fn max_degree() -> usize {
    BLOCK_SIZE / ENTRY_SIZE
}

pub fn encode(entries: &[Type1Node], degree: usize) -> Block {
    debug_assert!(degree <= max_degree());
    debug_assert!(entries.len() <= degree);

    let mut bytes = [0u8; BLOCK_SIZE];
    for (i, entry) in entries.iter().enumerate() {
        let off = i * ENTRY_SIZE;
        bytes[off..off + 8].copy_from_slice(&entry.pba.to_le_bytes());
        bytes[off + 8..off + 16].copy_from_slice(&entry.generation.to_le_bytes());
        bytes[off + 16..off + 16 + HASH_SIZE].copy_from_slice(&entry.hash);
    }
    Block::from_bytes(bytes)
}

pub fn decode(block: &Block, degree: usize) -> Vec<Type1Node> {
    debug_assert!(degree <= max_degree());
    let bytes = block.as_slice();
    (0..degree)
        .map(|i| {
            let off = i * ENTRY_SIZE;
            let pba = Pba::from_le_bytes(bytes[off..off + 8].try_into().unwrap());
            let generation =
                Generation::from_le_bytes(bytes[off + 8..off + 16].try_into().unwrap());
            let mut hash = [0u8; HASH_SIZE];
            hash.copy_from_slice(&bytes[off + 16..off + 16 + HASH_SIZE]);
            Type1Node {
                pba,
                generation,
                hash,
            }
        })
        .collect()
}

pub fn decode_one(block: &Block, index: usize) -> Type1Node {
    let off = index * ENTRY_SIZE;
    let bytes = block.as_slice();
    let pba = Pba::from_le_bytes(bytes[off..off + 8].try_into().unwrap());
    let generation = Generation::from_le_bytes(bytes[off + 8..off + 16].try_into().unwrap());
    let mut hash = [0u8; HASH_SIZE];
    hash.copy_from_slice(&bytes[off + 16..off + 16 + HASH_SIZE]);
    Type1Node {
        pba,
        generation,
        hash,
    }
}

pub fn encode_one(block: &mut Block, index: usize, entry: &Type1Node) {
    let off = index * ENTRY_SIZE;
    block.0[off..off + 8].copy_from_slice(&entry.pba.to_le_bytes());
    block.0[off + 8..off + 16].copy_from_slice(&entry.generation.to_le_bytes());
    block.0[off + 16..off + 16 + HASH_SIZE].copy_from_slice(&entry.hash);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_entries() {
        let entries = vec![
            Type1Node {
                pba: 1,
                generation: 2,
                hash: [9u8; HASH_SIZE],
            },
            Type1Node {
                pba: 3,
                generation: 4,
                hash: [8u8; HASH_SIZE],
            },
        ];
        let block = encode(&entries, 4);
        let decoded = decode(&block, 4);
        assert_eq!(decoded[0], entries[0]);
        assert_eq!(decoded[1], entries[1]);
        assert_eq!(decoded[2], Type1Node::default());
    }

    #[test]
    fn encode_one_updates_single_slot_in_place() {
        let entries = vec![Type1Node::default(); 4];
        let mut block = encode(&entries, 4);
        let updated = Type1Node {
            pba: 55,
            generation: 1,
            hash: [3u8; HASH_SIZE],
        };
        encode_one(&mut block, 2, &updated);
        assert_eq!(decode_one(&block, 2), updated);
        assert_eq!(decode_one(&block, 0), Type1Node::default());
    }
}
