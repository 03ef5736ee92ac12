//! Free tree (spec §4.7): an independent Merkle-indexed directory of
//! reusable physical block addresses, each tagged with the generation
//! at which it was last freed. Allocation honors generation
//! reachability: a PBA is only handed out once no live, durable
//! snapshot could still reference it.
//!
//! Unlike the VBD tree, the free tree's leaf directory is kept
//! resident rather than walked block-by-block through the cache: its
//! job is pool bookkeeping, not addressed lookup, so one directory
//! covers the whole device and persists as a single write-back.

use tracing::{trace, warn};

use crate::model::{Block, Generation, Pba, Type1Node, Vba};
use crate::primitive::{Operation, Primitive, Tag};

#[derive(Clone, Copy, Debug)]
pub struct TreeGeometry {
    pub height: u32,
    pub degree: u32,
    pub leaves: u64,
}

/// The inputs write-back needs to rewrite one path from leaf to root.
#[derive(Clone, Debug)]
pub struct WriteBackData {
    pub primitive: Primitive,
    pub generation: Generation,
    pub vba: Vba,
    pub new_pba: Vec<Type1Node>,
    pub old_pba: Vec<Type1Node>,
    pub tree_height: u32,
    pub leaf_data: Block,
}

struct Job {
    data: WriteBackData,
    success: bool,
    submitted_wb: bool,
    persisted: bool,
}

pub struct FreeTree {
    geometry: TreeGeometry,
    /// Resident directory of candidate PBAs. `pba` is the candidate
    /// address; `generation` is the generation at which it was last
    /// freed (0 = never allocated).
    entries: Vec<Type1Node>,
    job: Option<Job>,
    /// Raised when the driver discards a snapshot to make room: any
    /// entry freed at or before this generation is reclaimable even if
    /// `last_secured_generation` hasn't caught up yet, standing in for
    /// a full reference-counted reachability sweep of the discarded
    /// snapshot's tree.
    discard_watermark: Generation,
}

impl FreeTree {
    pub fn new(geometry: TreeGeometry, entries: Vec<Type1Node>) -> Self {
        Self {
            geometry,
            entries,
            job: None,
            discard_watermark: 0,
        }
    }

    pub fn geometry(&self) -> TreeGeometry {
        self.geometry
    }

    pub fn entries(&self) -> &[Type1Node] {
        &self.entries
    }

    /// Called after the driver discards a snapshot: everything freed up
    /// to `generation` becomes reclaimable regardless of whether it has
    /// been secured yet.
    pub fn raise_discard_watermark(&mut self, generation: Generation) {
        if generation > self.discard_watermark {
            self.discard_watermark = generation;
        }
    }

    pub fn request_acceptable(&self) -> bool {
        self.job.is_none()
    }

    /// Decides the allocation for one write path: for each on-path
    /// level, reuse its current PBA in place if it's already owned by
    /// `current_gen` (or never stamped); otherwise draw a reclaimable
    /// free PBA. Fails if too few reclaimable PBAs exist; no entry is
    /// mutated on failure.
    #[allow(clippy::too_many_arguments)]
    pub fn submit_request(
        &mut self,
        current_gen: Generation,
        last_secured_generation: Generation,
        old_pba: &[Type1Node],
        trans_height: u32,
        primitive: Primitive,
        vba: Vba,
        leaf_data: Block,
    ) {
        debug_assert!(self.request_acceptable());

        let mut new_pba = Vec::with_capacity(old_pba.len());
        let mut reserved = Vec::new();
        let mut success = true;

        for entry in old_pba {
            if entry.in_place_updatable(current_gen) {
                new_pba.push(Type1Node {
                    pba: entry.pba,
                    generation: current_gen,
                    hash: entry.hash,
                });
                continue;
            }
            match self.find_allocatable(last_secured_generation, &reserved) {
                Some(idx) => {
                    reserved.push(idx);
                    new_pba.push(Type1Node {
                        pba: self.entries[idx].pba,
                        generation: current_gen,
                        hash: entry.hash,
                    });
                }
                None => {
                    success = false;
                    break;
                }
            }
        }

        if success {
            for idx in &reserved {
                self.entries[*idx].generation = current_gen;
            }
            trace!(drawn = reserved.len(), "free tree allocation succeeded");
        } else {
            warn!(
                needed = old_pba.len(),
                reclaimable = reserved.len(),
                "free tree allocation failed"
            );
        }

        self.job = Some(Job {
            data: WriteBackData {
                primitive,
                generation: current_gen,
                vba,
                new_pba,
                old_pba: old_pba.to_vec(),
                tree_height: trans_height,
                leaf_data,
            },
            success,
            submitted_wb: false,
            persisted: !success,
        });
    }

    fn find_allocatable(&self, last_secured_generation: Generation, exclude: &[usize]) -> Option<usize> {
        let reclaim_floor = last_secured_generation.max(self.discard_watermark);
        self.entries
            .iter()
            .enumerate()
            .find(|(idx, e)| !exclude.contains(idx) && (e.generation == 0 || e.generation <= reclaim_floor))
            .map(|(idx, _)| idx)
    }

    /// Marks `pba` reusable again once its prior contents become
    /// unreachable: called by write-back when a node is superseded by
    /// CoW. `freed_at` is the generation the superseding write belongs
    /// to; the slot won't be reclaimable again until `last_secured_generation`
    /// passes that point.
    pub fn free_pba(&mut self, pba: Pba, freed_at: Generation) {
        match self.entries.iter_mut().find(|e| e.pba == pba) {
            Some(e) => e.generation = freed_at,
            None => self.entries.push(Type1Node {
                pba,
                generation: freed_at,
                hash: [0u8; 32],
            }),
        }
    }

    /// Only a successfully decided allocation needs persisting; a
    /// failure surfaces immediately with nothing to write back.
    pub fn peek_generated_primitive(&self) -> Option<Primitive> {
        let job = self.job.as_ref()?;
        (job.success && !job.submitted_wb).then(|| {
            Primitive::new(Tag::FreeTreeWb, None, Operation::Write, 0, 0)
        })
    }

    pub fn drop_generated_primitive(&mut self, _primitive: Primitive) {
        if let Some(job) = &mut self.job {
            job.submitted_wb = true;
        }
    }

    pub fn mark_persisted(&mut self) {
        if let Some(job) = &mut self.job {
            job.persisted = true;
        }
    }

    pub fn execute(&mut self) -> bool {
        let Some(job) = &mut self.job else {
            return false;
        };
        job.success && job.submitted_wb && !job.persisted
    }

    pub fn peek_completed_primitive(&self) -> Option<Primitive> {
        let job = self.job.as_ref()?;
        job.persisted.then(|| {
            let mut prim = job.data.primitive;
            prim.success = job.success;
            prim
        })
    }

    pub fn peek_completed_wb_data(&self) -> Option<&WriteBackData> {
        let job = self.job.as_ref()?;
        (job.persisted && job.success).then_some(&job.data)
    }

    pub fn drop_completed_primitive(&mut self) {
        self.job = None;
    }

    /// Clears a failed allocation so the same request can be retried
    /// after the driver discards a snapshot and raises
    /// `last_secured_generation`'s effective reclaim window.
    pub fn retry_allocation(&mut self) {
        self.job = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitive::RequestId;

    fn geometry() -> TreeGeometry {
        TreeGeometry {
            height: 1,
            degree: 4,
            leaves: 4,
        }
    }

    fn never_used(pbas: &[Pba]) -> Vec<Type1Node> {
        pbas.iter()
            .map(|&pba| Type1Node {
                pba,
                generation: 0,
                hash: [0; 32],
            })
            .collect()
    }

    fn prim() -> Primitive {
        Primitive::new(Tag::WriteBack, Some(RequestId(0)), Operation::Write, 0, 5)
    }

    #[test]
    fn reuses_in_place_entries_without_drawing() {
        let mut tree = FreeTree::new(geometry(), never_used(&[100, 101]));
        let old_pba = vec![Type1Node {
            pba: 7,
            generation: 3,
            hash: [1; 32],
        }];
        tree.submit_request(3, 2, &old_pba, 1, prim(), 5, Block::zeroed());

        let data = tree.peek_completed_wb_data();
        assert!(data.is_none(), "not persisted yet");

        let gen_prim = tree.peek_generated_primitive().unwrap();
        tree.drop_generated_primitive(gen_prim);
        tree.mark_persisted();

        let completed = tree.peek_completed_primitive().unwrap();
        assert!(completed.success);
        let data = tree.peek_completed_wb_data().unwrap();
        assert_eq!(data.new_pba[0].pba, 7);
    }

    #[test]
    fn draws_a_reclaimable_pba_for_a_stale_entry() {
        let mut tree = FreeTree::new(geometry(), never_used(&[200]));
        let old_pba = vec![Type1Node {
            pba: 7,
            generation: 1,
            hash: [1; 32],
        }];
        tree.submit_request(5, 4, &old_pba, 1, prim(), 5, Block::zeroed());

        let gen_prim = tree.peek_generated_primitive().unwrap();
        tree.drop_generated_primitive(gen_prim);
        tree.mark_persisted();

        let data = tree.peek_completed_wb_data().unwrap();
        assert_eq!(data.new_pba[0].pba, 200);
        assert_ne!(data.new_pba[0].pba, 7);
    }

    #[test]
    fn fails_when_no_reclaimable_pba_exists() {
        let mut tree = FreeTree::new(geometry(), Vec::new());
        let old_pba = vec![Type1Node {
            pba: 7,
            generation: 1,
            hash: [1; 32],
        }];
        tree.submit_request(5, 4, &old_pba, 1, prim(), 5, Block::zeroed());

        let completed = tree.peek_completed_primitive().unwrap();
        assert!(!completed.success);
        assert!(tree.peek_completed_wb_data().is_none());

        tree.retry_allocation();
        assert!(tree.request_acceptable());
    }

    #[test]
    fn freed_pba_becomes_reclaimable_once_secured() {
        let mut tree = FreeTree::new(geometry(), Vec::new());
        tree.free_pba(42, 9);

        let old_pba = vec![Type1Node {
            pba: 7,
            generation: 1,
            hash: [1; 32],
        }];
        // Not yet secured past generation 9: unreclaimable.
        tree.submit_request(10, 8, &old_pba, 1, prim(), 5, Block::zeroed());
        assert!(!tree.peek_completed_primitive().unwrap().success);
        tree.retry_allocation();

        // Secured past 9 now: reclaimable.
        tree.submit_request(10, 9, &old_pba, 1, prim(), 5, Block::zeroed());
        let gen_prim = tree.peek_generated_primitive().unwrap();
        tree.drop_generated_primitive(gen_prim);
        tree.mark_persisted();
        let data = tree.peek_completed_wb_data().unwrap();
        assert_eq!(data.new_pba[0].pba, 42);
    }
}
