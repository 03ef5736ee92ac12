//! Write-back (spec §4.8): given the free tree's allocation decision
//! for one write path, encrypts the leaf, rewrites each on-path inner
//! node bottom-up under its (possibly new) address, and finally writes
//! the ciphertext leaf to the backend. Stalls translation while it
//! holds the path: two writers racing the same path would corrupt the
//! hash chain.

use tracing::trace;

use crate::inner_node;
use crate::model::{Block, Generation, Hash, Type1Node, Vba};
use crate::primitive::{Operation, Primitive, RequestId, Tag};
use crate::stages::cache::Cache;
use crate::stages::crypto::CryptoStage;
use crate::stages::free_tree::WriteBackData;
use crate::stages::translation::TreeGeometry;

#[derive(PartialEq)]
enum Stage {
    EncryptLeaf { submitted: bool },
    UpdateLevel { level: u32, fetch_submitted: bool },
    WriteLeaf { submitted: bool },
    Done,
}

struct Job {
    data: WriteBackData,
    stage: Stage,
    leaf_cipher: Option<Block>,
    /// Hash computed for the new block written at `new_pba[level]`,
    /// filled in as each level completes, bottom-up.
    child_hash: Option<Hash>,
    new_root: Option<Type1Node>,
}

pub struct WriteBack {
    geometry: TreeGeometry,
    job: Option<Job>,
}

impl WriteBack {
    pub fn new(geometry: TreeGeometry) -> Self {
        Self { geometry, job: None }
    }

    pub fn primitive_acceptable(&self) -> bool {
        self.job.is_none()
    }

    pub fn submit_request(&mut self, data: WriteBackData) {
        debug_assert!(self.primitive_acceptable());
        self.job = Some(Job {
            data,
            stage: Stage::EncryptLeaf { submitted: false },
            leaf_cipher: None,
            child_hash: None,
            new_root: None,
        });
    }

    /// Address of the block *holding* level `level`'s entries, before
    /// update: the entries at `level` live inside the block one level up.
    /// The free tree appends the root's own slot after the path, so this
    /// uniformly resolves the topmost content level (the root's own
    /// block) to that appended entry too, rather than a pinned address.
    fn old_block_pba(&self, job: &Job, level: u32) -> u64 {
        job.data.old_pba[level as usize + 1].pba
    }

    /// Address the updated block at `level` is stored under.
    fn new_block_pba(&self, job: &Job, level: u32) -> u64 {
        job.data.new_pba[level as usize + 1].pba
    }

    pub fn execute(&mut self, cache: &mut Cache, crypto: &mut CryptoStage, now: u64) -> bool {
        let Some(job) = &mut self.job else {
            return false;
        };

        match &job.stage {
            Stage::EncryptLeaf { submitted } => {
                if !*submitted {
                    if !crypto.primitive_acceptable() {
                        return false;
                    }
                    let prim = Primitive::new(
                        Tag::CryptoEncrypt,
                        job.data.primitive.owner,
                        Operation::Write,
                        job.data.new_pba[0].pba,
                        job.data.vba,
                    );
                    crypto.submit_primitive(prim, job.data.leaf_data.clone());
                    job.stage = Stage::EncryptLeaf { submitted: true };
                    return true;
                }
                let Some(completed) = crypto.peek_completed_primitive() else {
                    return false;
                };
                let cipher = crypto.copy_completed_data();
                crypto.drop_completed_primitive();
                job.child_hash = Some(cipher.hash());
                job.leaf_cipher = Some(cipher);
                trace!(pba = completed.pba, "write-back leaf encrypted");
                job.stage = Stage::UpdateLevel {
                    level: 0,
                    fetch_submitted: false,
                };
                true
            }

            Stage::UpdateLevel { level, fetch_submitted } => {
                let level = *level;
                let fetch_submitted = *fetch_submitted;
                let old_pba = self.old_block_pba(job, level);
                let new_pba = self.new_block_pba(job, level);
                let is_root = level + 1 == job.data.tree_height;

                if !cache.data_available(old_pba) {
                    if fetch_submitted {
                        return false;
                    }
                    if !cache.request_acceptable(old_pba) {
                        return false;
                    }
                    cache.submit_request(old_pba);
                    job.stage = Stage::UpdateLevel {
                        level,
                        fetch_submitted: true,
                    };
                    return true;
                }

                let slot = cache.data_index(old_pba, now).unwrap();
                let old_block = cache.block(slot).clone();
                let mut entries = inner_node::decode(&old_block, self.geometry.degree as usize);
                let child_index = self.geometry.index_for_level(job.data.vba, level);
                entries[child_index] = Type1Node {
                    pba: job.data.new_pba[level as usize].pba,
                    generation: job.data.generation,
                    hash: job.child_hash.expect("child hash computed before ascending"),
                };
                let new_block = inner_node::encode(&entries, self.geometry.degree as usize);
                let new_hash = new_block.hash();

                if new_pba == old_pba {
                    cache.write_into(slot, new_block);
                    cache.mark_dirty(new_pba);
                } else if !cache.insert_dirty(new_pba, new_block, now) {
                    return false;
                }

                job.child_hash = Some(new_hash);
                trace!(level, old_pba, new_pba, "write-back updated inner node");

                if is_root {
                    job.new_root = Some(Type1Node {
                        pba: new_pba,
                        generation: job.data.generation,
                        hash: new_hash,
                    });
                    job.stage = Stage::WriteLeaf { submitted: false };
                } else {
                    job.stage = Stage::UpdateLevel {
                        level: level + 1,
                        fetch_submitted: false,
                    };
                }
                true
            }

            Stage::WriteLeaf { .. } | Stage::Done => false,
        }
    }

    /// The leaf write primitive to submit via I/O, once ready.
    pub fn peek_generated_primitive(&self) -> Option<Primitive> {
        let job = self.job.as_ref()?;
        match job.stage {
            Stage::WriteLeaf { submitted: false } => Some(Primitive::new(
                Tag::WriteBack,
                job.data.primitive.owner,
                Operation::Write,
                job.data.new_pba[0].pba,
                job.data.vba,
            )),
            _ => None,
        }
    }

    pub fn leaf_ciphertext(&self) -> Option<&Block> {
        self.job.as_ref().and_then(|j| j.leaf_cipher.as_ref())
    }

    pub fn drop_generated_primitive(&mut self, _primitive: Primitive) {
        if let Some(job) = &mut self.job {
            if let Stage::WriteLeaf { submitted } = &mut job.stage {
                *submitted = true;
            }
        }
    }

    pub fn mark_leaf_written(&mut self, success: bool) {
        if let Some(job) = &mut self.job {
            job.data.primitive.success = success;
            job.stage = Stage::Done;
        }
    }

    pub fn peek_completed_primitive(&self) -> Option<Primitive> {
        let job = self.job.as_ref()?;
        matches!(job.stage, Stage::Done).then_some(job.data.primitive)
    }

    pub fn peek_completed_root(&self) -> Option<Type1Node> {
        let job = self.job.as_ref()?;
        matches!(job.stage, Stage::Done).then_some(job.new_root).flatten()
    }

    pub fn vba(&self) -> Option<Vba> {
        self.job.as_ref().map(|j| j.data.vba)
    }

    pub fn generation(&self) -> Option<Generation> {
        self.job.as_ref().map(|j| j.data.generation)
    }

    pub fn owner(&self) -> Option<RequestId> {
        self.job.as_ref().and_then(|j| j.data.primitive.owner)
    }

    /// The path's addresses before and after this write, paired level by
    /// level. Used by the driver to free any address a level moved away
    /// from once the write commits. Only meaningful once completed.
    pub fn superseded_pbas(&self) -> Vec<crate::model::Pba> {
        let Some(job) = &self.job else {
            return Vec::new();
        };
        job.data
            .old_pba
            .iter()
            .zip(&job.data.new_pba)
            .filter(|(old, new)| old.pba != new.pba)
            .map(|(old, _)| old.pba)
            .collect()
    }

    pub fn drop_completed_primitive(&mut self) {
        self.job = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::model::BLOCK_SIZE;
    use crate::primitive::Operation;
    use crate::stages::io::IoStage;

    fn geometry() -> TreeGeometry {
        TreeGeometry {
            height: 1,
            degree: 4,
            leaves: 4,
        }
    }

    /// Drives one write-back to completion against a single-level tree
    /// whose root is reused in place (no free-tree reallocation).
    #[test]
    fn rewrites_root_entry_and_writes_leaf_in_place() {
        let geo = geometry();
        let leaf_old = Type1Node {
            pba: 10,
            generation: 0,
            hash: [0; 32],
        };
        let root_entries = vec![leaf_old, Type1Node::default(), Type1Node::default(), Type1Node::default()];
        let root_block = inner_node::encode(&root_entries, 4);
        let root = Type1Node {
            pba: 1,
            generation: 0,
            hash: root_block.hash(),
        };

        let mut backend = InMemoryBackend::new(16);
        backend.write_block(1, &root_block).unwrap();
        let mut io = IoStage::new(Box::new(backend));

        let mut cache = Cache::new(4);
        let cipher = cbe_crypto::BlockCipher::new([1u8; cbe_crypto::KEY_LEN]);
        let mut crypto = CryptoStage::new(cipher);
        let mut wb = WriteBack::new(geo);

        let data = WriteBackData {
            primitive: Primitive::new(Tag::WriteBack, Some(RequestId(3)), Operation::Write, 0, 0),
            generation: 5,
            vba: 0,
            new_pba: vec![
                Type1Node {
                    pba: 10,
                    generation: 5,
                    hash: [0; 32],
                },
                // Root's own slot, reused in place (same generation the
                // free tree would stamp had it decided this).
                Type1Node {
                    pba: 1,
                    generation: 5,
                    hash: root.hash,
                },
            ],
            old_pba: vec![leaf_old, root],
            tree_height: 1,
            leaf_data: Block::from_bytes([0x42; BLOCK_SIZE]),
        };
        wb.submit_request(data);

        // Encrypt leaf.
        assert!(wb.execute(&mut cache, &mut crypto, 0));
        assert!(crypto.execute());
        assert!(wb.execute(&mut cache, &mut crypto, 0));

        // Fetch root into cache, then update it.
        assert!(wb.execute(&mut cache, &mut crypto, 1));
        let p = cache.peek_generated_primitive().unwrap();
        cache.drop_generated_primitive(p);
        io.submit_primitive(Tag::Cache, None, Operation::Read, 1, 0, None);
        let data_block = io.peek_completed_data().unwrap().clone();
        io.drop_completed_primitive();
        cache.mark_completed(1, data_block, 1);
        assert!(wb.execute(&mut cache, &mut crypto, 2));

        // Leaf write.
        let leaf_prim = wb.peek_generated_primitive().unwrap();
        wb.drop_generated_primitive(leaf_prim);
        let ciphertext = wb.leaf_ciphertext().unwrap().clone();
        io.submit_primitive(Tag::WriteBack, None, Operation::Write, 10, 0, Some(&ciphertext));
        assert!(io.peek_completed_primitive().unwrap().success);
        io.drop_completed_primitive();
        wb.mark_leaf_written(true);

        let completed = wb.peek_completed_primitive().unwrap();
        assert!(completed.success);
        let new_root = wb.peek_completed_root().unwrap();
        assert_eq!(new_root.pba, 1);
        assert_ne!(new_root.hash, root.hash);
    }
}
