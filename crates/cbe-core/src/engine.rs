//! The driver (spec §5 and §9): owns every stage and the durable
//! superblock/snapshot/generation bookkeeping, and drives one cooperative
//! tick across the fixed stage order until nothing makes further
//! progress. This is the only place that knows how the pieces fit
//! together; individual stages never call each other directly.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{error, trace, warn};

use crate::backend::BackendDevice;
use crate::error::{RequestError, StartupError};
use crate::inner_node;
use crate::model::{limits, Block, Generation, Hash, Pba, SnapshotFlags, SuperBlock, Type1Node, Vba};
use crate::primitive::{Operation, Primitive, Request, RequestId, Tag};
use crate::stages::cache::Cache;
use crate::stages::cache_flusher::CacheFlusher;
use crate::stages::crypto::CryptoStage;
use crate::stages::free_tree::{self, FreeTree};
use crate::stages::io::IoStage;
use crate::stages::request_pool::RequestPool;
use crate::stages::splitter::Splitter;
use crate::stages::translation::{self, Translation};
use crate::stages::write_back::WriteBack;
use crate::time::TickSource;
use cbe_crypto::BlockCipher;

/// Reserved physical addresses: superblock slots come first, then the
/// free tree's single directory block, then the tree proper.
const FREE_TREE_DIR_PBA: Pba = limits::NUM_SUPER_BLOCKS as Pba;
const FIRST_TREE_PBA: Pba = FREE_TREE_DIR_PBA + 1;

/// Tunables that don't change for the lifetime of an engine: timer
/// cadence, diagnostics, and the two bounded pools' sizes.
#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    pub sync_interval: Duration,
    pub secure_interval: Duration,
    pub show_progress: bool,
    pub cache_capacity: usize,
    pub request_pool_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::ZERO,
            secure_interval: Duration::ZERO,
            show_progress: false,
            cache_capacity: limits::DEFAULT_CACHE_CAPACITY,
            request_pool_capacity: limits::DEFAULT_REQUEST_POOL_CAPACITY,
        }
    }
}

/// A request the client handed back, with its read payload if it was a
/// read that succeeded.
#[derive(Debug)]
pub struct CompletedRequest {
    pub request: Request,
    pub success: bool,
    pub data: Option<Vec<Block>>,
}

/// What's needed to resubmit a write's allocation after a discard, kept
/// at the engine level because the free tree clears its own job on
/// retry.
#[derive(Clone)]
struct PendingWrite {
    old_pba: Vec<Type1Node>,
    trans_height: u32,
    primitive: Primitive,
    vba: Vba,
    leaf_data: Block,
}

/// A leaf content fetch handed to I/O once a read's walk resolves the
/// leaf's own PBA and hash. Kept outside the metadata-only cache (spec
/// §4.4 scopes `Cache` to inner nodes) so a write's new leaf ciphertext
/// can never go stale behind a cached copy that nothing invalidates.
#[derive(Clone, Copy)]
struct PendingLeafRead {
    primitive: Primitive,
    expected_hash: Hash,
}

fn hash_prefix(hash: crate::model::Hash) -> [u8; 4] {
    [hash[0], hash[1], hash[2], hash[3]]
}

fn validate_geometry(height: u32, degree: u32) -> Result<(), StartupError> {
    if !(limits::TREE_MIN_HEIGHT..=limits::TREE_MAX_HEIGHT).contains(&height) {
        return Err(StartupError::TreeHeightOutOfRange {
            height,
            min: limits::TREE_MIN_HEIGHT,
            max: limits::TREE_MAX_HEIGHT,
        });
    }
    if degree < limits::TREE_MIN_DEGREE {
        return Err(StartupError::TreeDegreeTooLow {
            degree,
            min: limits::TREE_MIN_DEGREE,
        });
    }
    Ok(())
}

/// Writes a fresh superblock pair, an empty free-tree directory, and a
/// fully materialized zero tree of the given geometry. Leaves are
/// `degree^height` in count; the free pool reserves `free_pool_size`
/// spare blocks for the first round of copy-on-write reallocations.
pub fn format(
    backend: &mut dyn BackendDevice,
    cipher: &BlockCipher,
    height: u32,
    degree: u32,
    free_pool_size: usize,
) -> Result<(), StartupError> {
    validate_geometry(height, degree)?;
    if free_pool_size > inner_node::max_degree() {
        return Err(StartupError::FreePoolTooLarge {
            requested: free_pool_size,
            max: inner_node::max_degree(),
        });
    }

    let leaves = (degree as u64).pow(height);
    let tree_block_count: u64 = (0..=height).map(|l| (degree as u64).pow(l)).sum();
    let needed = FIRST_TREE_PBA + tree_block_count + free_pool_size as u64;
    if backend.capacity() < needed {
        return Err(StartupError::DeviceTooSmall {
            needed,
            capacity: backend.capacity(),
        });
    }

    let mut cursor = FIRST_TREE_PBA;
    let root = build_zero_subtree(backend, cipher, degree, height, &mut cursor)?;

    let free_pool: Vec<Type1Node> = (0..free_pool_size as u64)
        .map(|_| {
            let pba = cursor;
            cursor += 1;
            Type1Node {
                pba,
                generation: 0,
                hash: [0u8; 32],
            }
        })
        .collect();
    let free_tree_block = inner_node::encode(&free_pool, free_pool_size);
    backend
        .write_block(FREE_TREE_DIR_PBA, &free_tree_block)
        .map_err(StartupError::FormatIoFailed)?;

    let mut sb = SuperBlock {
        current_snapshot_id: 0,
        last_secured_generation: 0,
        free_tree_root: crate::model::FreeTreeRoot {
            pba: FREE_TREE_DIR_PBA,
            hash: free_tree_block.hash(),
            generation: 0,
            height: 1,
            degree: free_pool_size as u32,
            leaves: free_pool_size as u64,
        },
        degree,
        valid: true,
        ..SuperBlock::default()
    };
    sb.snapshots[0] = crate::model::Snapshot {
        id: 0,
        pba: root.pba,
        hash: root.hash,
        generation: 0,
        height,
        leaves,
        flags: SnapshotFlags {
            keep: false,
            valid: true,
        },
    };

    let block = sb.to_block();
    for slot in 0..limits::NUM_SUPER_BLOCKS {
        backend
            .write_block(slot as Pba, &block)
            .map_err(StartupError::FormatIoFailed)?;
    }
    Ok(())
}

fn build_zero_subtree(
    backend: &mut dyn BackendDevice,
    cipher: &BlockCipher,
    degree: u32,
    height: u32,
    cursor: &mut Pba,
) -> Result<Type1Node, StartupError> {
    if height == 0 {
        let pba = *cursor;
        *cursor += 1;
        // Leaf content is always ciphertext on disk; the read path
        // decrypts unconditionally, so a plaintext zero block here would
        // come back as keystream garbage instead of zeros.
        let ciphertext = Block::from_bytes(cipher.encrypt_block(pba, Block::zeroed().as_slice()));
        backend
            .write_block(pba, &ciphertext)
            .map_err(StartupError::FormatIoFailed)?;
        return Ok(Type1Node {
            pba,
            generation: 0,
            hash: ciphertext.hash(),
        });
    }
    let mut children = Vec::with_capacity(degree as usize);
    for _ in 0..degree {
        children.push(build_zero_subtree(backend, cipher, degree, height - 1, cursor)?);
    }
    let block = inner_node::encode(&children, degree as usize);
    let pba = *cursor;
    *cursor += 1;
    backend
        .write_block(pba, &block)
        .map_err(StartupError::FormatIoFailed)?;
    Ok(Type1Node {
        pba,
        generation: 0,
        hash: block.hash(),
    })
}

pub struct Engine<C: TickSource> {
    clock: C,
    config: EngineConfig,

    request_pool: RequestPool,
    splitter: Splitter,
    translation: Translation,
    free_tree: FreeTree,
    write_back: WriteBack,
    cache: Cache,
    cache_flusher: CacheFlusher,
    crypto: CryptoStage,
    io: IoStage,

    superblocks: [SuperBlock; limits::NUM_SUPER_BLOCKS],
    current_sb: usize,
    current_gen: Generation,
    last_snapshot_id: u64,
    free_tree_retry_count: u32,

    need_to_sync: bool,
    need_to_secure: bool,
    snaps_dirty: bool,
    sync_in_progress: bool,
    secure_in_flight: bool,
    last_sync_tick_ms: u64,
    last_secure_tick_ms: u64,

    pending_write: Option<PendingWrite>,
    pending_new_root: Option<Type1Node>,
    pending_decrypt: Option<(Primitive, Block)>,
    pending_secure_write: Option<(usize, SuperBlock)>,
    pending_leaf_read: Option<PendingLeafRead>,

    read_results: HashMap<(RequestId, Vba), Block>,
    write_payloads: HashMap<RequestId, Vec<Block>>,
}

impl<C: TickSource> Engine<C> {
    pub fn mount(
        mut backend: Box<dyn BackendDevice>,
        cipher: BlockCipher,
        clock: C,
        config: EngineConfig,
    ) -> Result<Self, StartupError> {
        let mut superblocks = [SuperBlock::default(); limits::NUM_SUPER_BLOCKS];
        for slot in 0..limits::NUM_SUPER_BLOCKS {
            let block = backend
                .read_block(slot as Pba)
                .map_err(|_| StartupError::NoValidSuperBlock)?;
            if let Ok(sb) = SuperBlock::from_block(&block) {
                superblocks[slot] = sb;
            }
        }

        let current_sb = superblocks
            .iter()
            .enumerate()
            .filter(|(_, sb)| sb.valid)
            .max_by_key(|(idx, sb)| (sb.last_secured_generation, *idx))
            .map(|(idx, _)| idx)
            .ok_or(StartupError::NoValidSuperBlock)?;

        let sb = &superblocks[current_sb];
        let snap_idx = sb
            .current_snapshot_slot()
            .ok_or(StartupError::SnapshotSlotNotFound {
                snapshot_id: sb.current_snapshot_id,
            })?;
        let snap = sb.snapshots[snap_idx];
        validate_geometry(snap.height, sb.degree)?;

        let free_tree_block = backend
            .read_block(sb.free_tree_root.pba)
            .map_err(|_| StartupError::NoValidSuperBlock)?;
        let free_entries = inner_node::decode(&free_tree_block, sb.free_tree_root.degree as usize);

        let geometry = translation::TreeGeometry {
            height: snap.height,
            degree: sb.degree,
            leaves: snap.leaves,
        };
        let last_snapshot_id = sb.snapshots.iter().map(|s| s.id).max().unwrap_or(0);

        Ok(Self {
            clock,
            config,
            request_pool: RequestPool::new(config.request_pool_capacity),
            splitter: Splitter::new(),
            translation: Translation::new(geometry),
            free_tree: FreeTree::new(
                free_tree::TreeGeometry {
                    height: 1,
                    degree: sb.free_tree_root.degree,
                    leaves: sb.free_tree_root.leaves,
                },
                free_entries,
            ),
            write_back: WriteBack::new(geometry),
            cache: Cache::new(config.cache_capacity),
            cache_flusher: CacheFlusher::new(),
            crypto: CryptoStage::new(cipher),
            io: IoStage::new(backend),
            superblocks,
            current_sb,
            current_gen: sb.last_secured_generation + 1,
            last_snapshot_id,
            free_tree_retry_count: 0,
            need_to_sync: false,
            need_to_secure: false,
            snaps_dirty: false,
            sync_in_progress: false,
            secure_in_flight: false,
            last_sync_tick_ms: 0,
            last_secure_tick_ms: 0,
            pending_write: None,
            pending_new_root: None,
            pending_decrypt: None,
            pending_secure_write: None,
            pending_leaf_read: None,
            read_results: HashMap::new(),
            write_payloads: HashMap::new(),
        })
    }

    fn max_vba(&self) -> Vba {
        self.translation.geometry().max_vba()
    }

    fn current_superblock(&self) -> &SuperBlock {
        &self.superblocks[self.current_sb]
    }

    /// The id of the snapshot currently being written through. Callers
    /// pass this to `mark_snapshot_keep` or `read_snapshot_block` to name
    /// the snapshot a `sync` request just sealed.
    pub fn current_snapshot_id(&self) -> u64 {
        self.current_superblock().current_snapshot_id
    }

    fn current_working_root(&self) -> Type1Node {
        let sb = self.current_superblock();
        let idx = sb
            .current_snapshot_slot()
            .expect("a mounted engine always has a valid working snapshot");
        let snap = sb.snapshots[idx];
        Type1Node {
            pba: snap.pba,
            generation: snap.generation,
            hash: snap.hash,
        }
    }

    /// Accepts a client request. Reads and writes are split into one
    /// primitive per block by the splitter; `sync` requests carry no
    /// primitives and complete immediately but force an out-of-band
    /// sync on their next tick.
    pub fn submit_request(
        &mut self,
        operation: Operation,
        vba: Vba,
        count: u64,
        client_tag: u64,
        write_data: Option<Vec<Block>>,
    ) -> Result<RequestId, RequestError> {
        if !self.request_pool.acceptable() {
            return Err(RequestError::PoolFull);
        }
        if operation != Operation::Sync {
            if count == 0 || vba + count - 1 > self.max_vba() {
                return Err(RequestError::OutOfRange {
                    vba,
                    max_vba: self.max_vba(),
                });
            }
            match operation {
                Operation::Write => {
                    let data = write_data.ok_or(RequestError::Malformed)?;
                    if data.len() as u64 != count {
                        return Err(RequestError::Malformed);
                    }
                    let id = self.submit_internal(operation, vba, count, client_tag)?;
                    self.write_payloads.insert(id, data);
                    return Ok(id);
                }
                Operation::Read => {
                    if write_data.is_some() {
                        return Err(RequestError::Malformed);
                    }
                }
                Operation::Sync => unreachable!(),
            }
        }
        let id = self.submit_internal(operation, vba, count, client_tag)?;
        if operation == Operation::Sync {
            self.need_to_sync = true;
        }
        Ok(id)
    }

    fn submit_internal(
        &mut self,
        operation: Operation,
        vba: Vba,
        count: u64,
        client_tag: u64,
    ) -> Result<RequestId, RequestError> {
        let request = Request {
            id: RequestId(0),
            operation,
            vba,
            count,
            client_tag,
            offset: 0,
        };
        let n_primitives = if operation == Operation::Sync { 0 } else { count };
        self.request_pool.submit(request, n_primitives)
    }

    /// Marks a snapshot KEEP, excluding it from the sync ring-buffer's
    /// reuse candidates and from free-tree reclamation.
    pub fn mark_snapshot_keep(&mut self, snapshot_id: u64) -> bool {
        let sb = &mut self.superblocks[self.current_sb];
        match sb.snapshots.iter_mut().find(|s| s.valid() && s.id == snapshot_id) {
            Some(s) => {
                s.flags.keep = true;
                true
            }
            None => false,
        }
    }

    /// Returns the next request the client can retrieve, draining its
    /// read payload (if any) out of the engine's bookkeeping.
    pub fn poll_completed(&mut self) -> Option<CompletedRequest> {
        let (request, success) = self.request_pool.peek_completed_request()?;
        self.request_pool.drop_completed_request(request.id);
        self.write_payloads.remove(&request.id);

        let data = (success && request.operation == Operation::Read).then(|| {
            (0..request.count)
                .map(|i| {
                    self.read_results
                        .remove(&(request.id, request.vba + i))
                        .unwrap_or_else(Block::zeroed)
                })
                .collect()
        });

        Some(CompletedRequest {
            request,
            success,
            data,
        })
    }

    /// Reads one block out of an arbitrary (not necessarily current)
    /// valid snapshot by walking its tree directly against the backend,
    /// bypassing the tick pipeline. Used to verify KEEP snapshot
    /// isolation; not part of the cooperative scheduler.
    pub fn read_snapshot_block(&mut self, snapshot_id: u64, vba: Vba) -> Result<Block, RequestError> {
        let sb = self.current_superblock();
        let snap = sb
            .snapshots
            .iter()
            .find(|s| s.valid() && s.id == snapshot_id)
            .copied()
            .ok_or(RequestError::Malformed)?;
        if vba > snap.leaves.saturating_sub(1) {
            return Err(RequestError::OutOfRange {
                vba,
                max_vba: snap.leaves.saturating_sub(1),
            });
        }
        let geometry = translation::TreeGeometry {
            height: snap.height,
            degree: sb.degree,
            leaves: snap.leaves,
        };

        let mut current = Type1Node {
            pba: snap.pba,
            generation: snap.generation,
            hash: snap.hash,
        };
        for level in (0..geometry.height).rev() {
            let block = self
                .io
                .backend_mut()
                .read_block(current.pba)
                .map_err(|_| RequestError::Malformed)?;
            if block.hash() != current.hash {
                return Err(RequestError::HashMismatch {
                    pba: current.pba,
                    expected_prefix: hash_prefix(current.hash),
                    actual_prefix: hash_prefix(block.hash()),
                });
            }
            let idx = geometry.index_for_level(vba, level);
            current = inner_node::decode_one(&block, idx);
        }

        let ciphertext = self
            .io
            .backend_mut()
            .read_block(current.pba)
            .map_err(|_| RequestError::Malformed)?;
        if ciphertext.hash() != current.hash {
            return Err(RequestError::HashMismatch {
                pba: current.pba,
                expected_prefix: hash_prefix(current.hash),
                actual_prefix: hash_prefix(ciphertext.hash()),
            });
        }
        Ok(self.crypto.decrypt_now(current.pba, &ciphertext))
    }

    /// Drives every stage in the fixed order of spec §5, looping until a
    /// full pass makes no progress. Returns whether any work happened.
    pub fn execute(&mut self) -> bool {
        let mut any = false;
        loop {
            let mut progress = false;
            progress |= self.step_free_tree();
            progress |= self.step_splitter_ingress();
            progress |= self.step_vbd();
            progress |= self.step_flusher();
            progress |= self.step_write_back();
            progress |= self.step_superblock_sync();
            progress |= self.step_crypto();
            progress |= self.step_cache();
            progress |= self.step_io();

            if progress && self.config.show_progress {
                trace!("tick made progress");
            }
            any |= progress;
            if !progress {
                break;
            }
        }
        any
    }

    fn step_free_tree(&mut self) -> bool {
        let mut progress = self.free_tree.execute();
        let Some(completed) = self.free_tree.peek_completed_primitive() else {
            return progress;
        };
        progress = true;

        if completed.success {
            let wb_data = self
                .free_tree
                .peek_completed_wb_data()
                .cloned()
                .expect("a successful allocation always carries its write-back data");
            self.free_tree.drop_completed_primitive();
            self.free_tree_retry_count = 0;
            self.write_back.submit_request(wb_data);
        } else {
            self.free_tree.drop_completed_primitive();
            if self.free_tree_retry_count < limits::FREE_TREE_RETRY_LIMIT {
                self.free_tree_retry_count += 1;
                if self.discard_one_snapshot() {
                    self.free_tree.raise_discard_watermark(self.current_gen);
                }
                self.free_tree.retry_allocation();
                let ctx = self
                    .pending_write
                    .clone()
                    .expect("retry context present while free tree job is outstanding");
                self.submit_free_tree_request(&ctx);
            } else {
                if let Some(owner) = completed.owner {
                    self.request_pool.mark_completed(owner, false);
                }
                warn!(retries = self.free_tree_retry_count, "free tree allocation exhausted");
                self.translation.resume();
                self.pending_write = None;
                self.free_tree_retry_count = 0;
            }
        }
        progress
    }

    fn submit_free_tree_request(&mut self, ctx: &PendingWrite) {
        let last_secured = self.current_superblock().last_secured_generation;
        self.free_tree.submit_request(
            self.current_gen,
            last_secured,
            &ctx.old_pba,
            ctx.trans_height,
            ctx.primitive,
            ctx.vba,
            ctx.leaf_data.clone(),
        );
    }

    /// Picks the lowest-id valid, non-KEEP, non-current snapshot and
    /// invalidates it, freeing its slot. Returns whether one was found.
    fn discard_one_snapshot(&mut self) -> bool {
        let sb = &mut self.superblocks[self.current_sb];
        let current_id = sb.current_snapshot_id;
        let candidate = sb
            .snapshots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.valid() && !s.keep() && s.id != current_id)
            .min_by_key(|(_, s)| s.id)
            .map(|(idx, _)| idx);
        match candidate {
            Some(idx) => {
                sb.snapshots[idx] = crate::model::Snapshot::default();
                true
            }
            None => false,
        }
    }

    fn step_splitter_ingress(&mut self) -> bool {
        if !self.splitter.request_acceptable() {
            return false;
        }
        let Some(request) = self.request_pool.peek_pending() else {
            return false;
        };
        self.request_pool.drop_pending(request.id);
        if request.operation == Operation::Sync {
            // No primitives to emit; already completed at submission.
            return true;
        }
        self.splitter.submit_request(request);
        true
    }

    fn step_vbd(&mut self) -> bool {
        let mut progress = false;

        if self.translation.primitive_acceptable() && !self.secure_in_flight {
            if let Some(prim) = self.splitter.peek_generated_primitive() {
                self.splitter.drop_generated_primitive(prim);
                let root = self.current_working_root();
                self.translation.submit_primitive(root, prim);
                if prim.operation == Operation::Write {
                    self.translation.inhibit();
                }
                progress = true;
            }
        }

        progress |= self.translation.execute(&mut self.cache, self.clock.now());

        if let Some(completed) = self.translation.peek_completed_primitive() {
            progress = true;
            match completed.operation {
                Operation::Read => {
                    if completed.success {
                        let expected_hash = self.translation.path().unwrap()[0].hash;
                        self.translation.drop_completed_primitive();
                        self.pending_leaf_read = Some(PendingLeafRead {
                            primitive: Primitive::new(
                                Tag::LeafRead,
                                completed.owner,
                                Operation::Read,
                                completed.pba,
                                completed.vba,
                            ),
                            expected_hash,
                        });
                    } else {
                        self.translation.drop_completed_primitive();
                        if let Some(owner) = completed.owner {
                            self.request_pool.mark_completed(owner, false);
                        }
                    }
                }
                Operation::Write => {
                    if completed.success {
                        // The root's own slot is appended after the path
                        // (leaf..node-just-below-root) so the free tree
                        // decides its reuse/reallocate the same way as
                        // every other on-path level, instead of pinning
                        // it to its current address.
                        let mut old_pba = self.translation.path().unwrap().to_vec();
                        old_pba.push(self.translation.root().unwrap());
                        let vba = completed.vba;
                        let leaf_data = self
                            .write_payload(completed.owner.expect("writes always have an owning request"), vba)
                            .clone();
                        self.translation.drop_completed_primitive();

                        let ctx = PendingWrite {
                            old_pba,
                            trans_height: self.translation.tree_height(),
                            primitive: completed,
                            vba,
                            leaf_data,
                        };
                        self.pending_write = Some(ctx.clone());
                        self.submit_free_tree_request(&ctx);
                    } else {
                        self.translation.drop_completed_primitive();
                        self.translation.resume();
                        if let Some(owner) = completed.owner {
                            self.request_pool.mark_completed(owner, false);
                        }
                    }
                }
                Operation::Sync => unreachable!("sync requests never reach translation"),
            }
        }

        progress
    }

    fn write_payload(&self, owner: RequestId, vba: Vba) -> &Block {
        let req = self
            .request_pool
            .request_for_tag(owner)
            .expect("write request known while its primitives are in flight");
        let idx = (vba - req.vba) as usize;
        &self.write_payloads[&owner][idx]
    }

    /// The flusher has no autonomous progress of its own; its only job
    /// is detecting that a sync sequence's flush has fully drained so
    /// the new snapshot can be finalized.
    fn step_flusher(&mut self) -> bool {
        if self.sync_in_progress && self.cache_flusher.is_idle() {
            self.finalize_sync();
            return true;
        }
        false
    }

    fn step_write_back(&mut self) -> bool {
        let mut progress = self.write_back.execute(&mut self.cache, &mut self.crypto, self.clock.now());
        let Some(completed) = self.write_back.peek_completed_primitive() else {
            return progress;
        };
        progress = true;

        let new_root = self.write_back.peek_completed_root();
        let generation = self.write_back.generation();
        let superseded = self.write_back.superseded_pbas();
        self.write_back.drop_completed_primitive();
        self.translation.resume();
        self.pending_write = None;

        if completed.success {
            if let Some(root) = new_root {
                let generation = generation.expect("a completed write-back job always has a generation");
                for pba in superseded {
                    self.free_tree.free_pba(pba, generation);
                }
                self.on_write_committed(root);
            }
        }

        if let Some(owner) = completed.owner {
            self.request_pool.mark_completed(owner, completed.success);
        }
        progress
    }

    fn on_write_committed(&mut self, new_root: Type1Node) {
        self.snaps_dirty = true;
        if self.need_to_sync {
            self.begin_sync_sequence(new_root);
        } else {
            let sb = &mut self.superblocks[self.current_sb];
            if let Some(idx) = sb.current_snapshot_slot() {
                sb.snapshots[idx].hash = new_root.hash;
                if sb.snapshots[idx].pba != new_root.pba {
                    sb.snapshots[idx].pba = new_root.pba;
                    sb.snapshots[idx].generation = self.current_gen;
                }
            }
        }
    }

    fn begin_sync_sequence(&mut self, new_root: Type1Node) {
        for idx in 0..self.cache.slot_count() {
            if let Some(slot) = self.cache.slot(idx) {
                if self.cache.dirty(slot) {
                    self.cache_flusher.submit_request(self.cache.flush(slot));
                }
            }
        }
        self.pending_new_root = Some(new_root);
        self.sync_in_progress = true;
    }

    fn finalize_sync(&mut self) {
        let new_root = self
            .pending_new_root
            .take()
            .expect("sync sequence always has a pending root");
        self.sync_in_progress = false;

        let sb_idx = self.current_sb;
        let current_idx = self.superblocks[sb_idx]
            .current_snapshot_slot()
            .expect("working snapshot exists");

        match self.find_snapshot_slot_for_sync(sb_idx, current_idx) {
            Some(target_idx) => {
                let current = self.superblocks[sb_idx].snapshots[current_idx];
                let new_id = self.last_snapshot_id + 1;
                self.last_snapshot_id = new_id;
                self.superblocks[sb_idx].snapshots[target_idx] = crate::model::Snapshot {
                    id: new_id,
                    pba: new_root.pba,
                    hash: new_root.hash,
                    generation: self.current_gen,
                    height: current.height,
                    leaves: current.leaves,
                    flags: SnapshotFlags {
                        keep: false,
                        valid: true,
                    },
                };
                self.superblocks[sb_idx].current_snapshot_id = new_id;
                self.current_gen += 1;
                self.need_to_sync = false;
            }
            None => {
                warn!("no snapshot slot free for sync; updating working snapshot in place instead");
                let sb = &mut self.superblocks[sb_idx];
                sb.snapshots[current_idx].hash = new_root.hash;
                sb.snapshots[current_idx].pba = new_root.pba;
            }
        }
    }

    /// Reuses the oldest non-KEEP, non-current snapshot slot in ring
    /// order; falls back to an empty slot if every live slot is kept.
    fn find_snapshot_slot_for_sync(&self, sb_idx: usize, current_idx: usize) -> Option<usize> {
        let sb = &self.superblocks[sb_idx];
        let n = limits::NUM_SNAPSHOTS;
        (1..n)
            .map(|o| (current_idx + o) % n)
            .find(|&i| sb.snapshots[i].valid() && !sb.snapshots[i].keep())
            .or_else(|| (1..n).map(|o| (current_idx + o) % n).find(|&i| !sb.snapshots[i].valid()))
    }

    fn step_superblock_sync(&mut self) -> bool {
        let mut progress = false;
        let now_ms = self.clock.elapsed_ms();

        let sync_ms = self.config.sync_interval.as_millis() as u64;
        if sync_ms != 0 && now_ms >= self.last_sync_tick_ms + sync_ms {
            if self.cache.any_dirty() {
                self.need_to_sync = true;
            }
            self.last_sync_tick_ms = now_ms;
            progress = true;
        }

        let secure_ms = self.config.secure_interval.as_millis() as u64;
        if secure_ms != 0 && now_ms >= self.last_secure_tick_ms + secure_ms {
            if self.snaps_dirty {
                self.need_to_secure = true;
            }
            self.last_secure_tick_ms = now_ms;
            progress = true;
        }

        if self.need_to_secure && !self.secure_in_flight && self.pending_secure_write.is_none() {
            self.begin_secure_sequence();
            progress = true;
        }

        progress
    }

    fn begin_secure_sequence(&mut self) {
        let mut stamped = self.superblocks[self.current_sb];
        stamped.last_secured_generation = self.current_gen;
        stamped.valid = true;
        let next = (self.current_sb + 1) % limits::NUM_SUPER_BLOCKS;
        self.pending_secure_write = Some((next, stamped));
        self.secure_in_flight = true;
    }

    fn step_crypto(&mut self) -> bool {
        let mut progress = false;
        if self.crypto.primitive_acceptable() {
            if let Some((prim, data)) = self.pending_decrypt.take() {
                self.crypto.submit_primitive(prim, data);
                progress = true;
            }
        }
        progress |= self.crypto.execute();

        if let Some(prim) = self.crypto.peek_completed_primitive() {
            if prim.tag == Tag::CryptoDecrypt {
                let data = self.crypto.copy_completed_data();
                self.crypto.drop_completed_primitive();
                if prim.success {
                    if let Some(owner) = prim.owner {
                        self.read_results.insert((owner, prim.vba), data);
                    }
                }
                if let Some(owner) = prim.owner {
                    self.request_pool.mark_completed(owner, prim.success);
                }
                progress = true;
            }
        }
        progress
    }

    /// No autonomous progress of its own: every stage that needs a
    /// cache fill drives it directly through `Cache`'s submit/peek API.
    fn step_cache(&mut self) -> bool {
        false
    }

    fn step_io(&mut self) -> bool {
        if let Some(primitive) = self.io.peek_completed_primitive() {
            self.dispatch_io_completion(primitive);
            self.io.drop_completed_primitive();
            return true;
        }

        if !self.io.primitive_acceptable() {
            return false;
        }

        if let Some(prim) = self.cache.peek_generated_primitive() {
            self.cache.drop_generated_primitive(prim);
            self.io.submit_primitive(prim.tag, prim.owner, prim.operation, prim.pba, prim.vba, None);
            return true;
        }

        if let Some(prim) = self.cache_flusher.peek_generated_primitive() {
            self.cache_flusher.drop_generated_primitive(prim);
            let slot = self
                .cache
                .data_index(prim.pba, self.clock.now())
                .expect("flush job always targets a resident slot");
            let data = self.cache.block(slot).clone();
            self.io.submit_primitive(prim.tag, prim.owner, prim.operation, prim.pba, prim.vba, Some(&data));
            return true;
        }

        if let Some(prim) = self.write_back.peek_generated_primitive() {
            self.write_back.drop_generated_primitive(prim);
            let data = self
                .write_back
                .leaf_ciphertext()
                .expect("leaf encrypted before the write primitive is generated")
                .clone();
            self.io.submit_primitive(prim.tag, prim.owner, prim.operation, prim.pba, prim.vba, Some(&data));
            return true;
        }

        if let Some(prim) = self.free_tree.peek_generated_primitive() {
            self.free_tree.drop_generated_primitive(prim);
            let degree = self.free_tree.geometry().degree as usize;
            let block = inner_node::encode(self.free_tree.entries(), degree);
            let pba = self.current_superblock().free_tree_root.pba;
            self.io.submit_primitive(prim.tag, prim.owner, prim.operation, pba, prim.vba, Some(&block));
            return true;
        }

        if let Some(pending) = self.pending_leaf_read {
            let prim = pending.primitive;
            self.io.submit_primitive(prim.tag, prim.owner, prim.operation, prim.pba, prim.vba, None);
            return true;
        }

        if let Some((next, stamped)) = self.pending_secure_write.clone() {
            let block = stamped.to_block();
            self.io.submit_primitive(Tag::SyncSb, None, Operation::Write, next as Pba, 0, Some(&block));
            return true;
        }

        false
    }

    fn dispatch_io_completion(&mut self, primitive: Primitive) {
        match primitive.tag {
            Tag::Cache => {
                if let Some(data) = self.io.peek_completed_data().cloned() {
                    self.cache.mark_completed(primitive.pba, data, self.clock.now());
                }
            }
            Tag::CacheFlush => {
                self.cache.mark_clean(primitive.pba);
                self.cache_flusher.mark_completed(primitive.pba);
                if let Some(p) = self.cache_flusher.peek_completed_primitive() {
                    self.cache_flusher.drop_completed_primitive(p);
                }
            }
            Tag::WriteBack => {
                self.write_back.mark_leaf_written(primitive.success);
            }
            Tag::LeafRead => {
                let pending = self
                    .pending_leaf_read
                    .take()
                    .expect("leaf read completion without a pending request");
                if !primitive.success {
                    if let Some(owner) = primitive.owner {
                        self.request_pool.mark_completed(owner, false);
                    }
                    return;
                }
                let ciphertext = self
                    .io
                    .peek_completed_data()
                    .cloned()
                    .expect("completed read carries data");
                if ciphertext.hash() != pending.expected_hash {
                    error!(pba = primitive.pba, "leaf hash mismatch on read");
                    if let Some(owner) = primitive.owner {
                        self.request_pool.mark_completed(owner, false);
                    }
                    return;
                }
                let decrypt_prim = Primitive::new(
                    Tag::CryptoDecrypt,
                    primitive.owner,
                    Operation::Read,
                    primitive.pba,
                    primitive.vba,
                );
                if self.crypto.primitive_acceptable() {
                    self.crypto.submit_primitive(decrypt_prim, ciphertext);
                } else {
                    self.pending_decrypt = Some((decrypt_prim, ciphertext));
                }
            }
            Tag::FreeTreeWb | Tag::FreeTreeIo => {
                self.free_tree.mark_persisted();
            }
            Tag::SyncSb => {
                if let Some((next, stamped)) = self.pending_secure_write.take() {
                    if primitive.success {
                        self.superblocks[next] = stamped;
                        self.current_sb = next;
                        self.snaps_dirty = false;
                        self.need_to_secure = false;
                    } else {
                        warn!(pba = primitive.pba, "superblock write failed; secure sequence aborted");
                    }
                    self.secure_in_flight = false;
                }
            }
            Tag::Vbd | Tag::CryptoEncrypt | Tag::CryptoDecrypt => {
                unreachable!(
                    "{:?} primitives never reach the I/O boundary directly",
                    primitive.tag
                )
            }
        }
    }
}
