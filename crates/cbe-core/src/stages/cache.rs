//! Cache (spec §4.4): a fixed-slot LRU of metadata blocks, with dirty
//! tracking and on-demand fill via the I/O stage.

use tracing::trace;

use crate::model::{Block, Pba};
use crate::primitive::{Operation, Primitive, Tag};

/// Index of an occupied cache slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheSlot(pub usize);

struct Slot {
    pba: Pba,
    data: Block,
    dirty: bool,
    last_access: u64,
}

/// A fill in flight: submitted to the I/O stage but not yet completed.
struct PendingFill {
    pba: Pba,
    submitted: bool,
}

pub struct Cache {
    slots: Vec<Option<Slot>>,
    pending: Vec<PendingFill>,
}

impl Cache {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            pending: Vec::new(),
        }
    }

    fn slot_for(&self, pba: Pba) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| matches!(slot, Some(s) if s.pba == pba))
    }

    pub fn data_available(&self, pba: Pba) -> bool {
        self.slot_for(pba).is_some()
    }

    /// Returns the slot holding `pba`, touching its LRU timestamp.
    pub fn data_index(&mut self, pba: Pba, now: u64) -> Option<CacheSlot> {
        let idx = self.slot_for(pba)?;
        if let Some(slot) = &mut self.slots[idx] {
            slot.last_access = now;
        }
        Some(CacheSlot(idx))
    }

    pub fn block(&self, slot: CacheSlot) -> &Block {
        &self.slots[slot.0].as_ref().expect("slot occupied").data
    }

    /// A fill for `pba` can be admitted: it isn't already cached or
    /// already in flight, and either a free slot exists or a clean
    /// slot is evictable.
    pub fn request_acceptable(&self, pba: Pba) -> bool {
        if self.data_available(pba) {
            return false;
        }
        if self.pending.iter().any(|p| p.pba == pba) {
            return false;
        }
        self.slots.iter().any(|s| s.is_none())
            || self.slots.iter().flatten().any(|s| !s.dirty)
    }

    pub fn submit_request(&mut self, pba: Pba) {
        debug_assert!(self.request_acceptable(pba));
        self.pending.push(PendingFill {
            pba,
            submitted: false,
        });
    }

    pub fn peek_generated_primitive(&self) -> Option<Primitive> {
        let next = self.pending.iter().find(|p| !p.submitted)?;
        Some(Primitive::new(
            Tag::Cache,
            None,
            Operation::Read,
            next.pba,
            0,
        ))
    }

    pub fn drop_generated_primitive(&mut self, primitive: Primitive) {
        if let Some(p) = self.pending.iter_mut().find(|p| p.pba == primitive.pba && !p.submitted) {
            p.submitted = true;
        }
    }

    /// A fill completed: evict an LRU clean slot if necessary, install
    /// the fetched data, and drop the pending-fill entry.
    pub fn mark_completed(&mut self, pba: Pba, data: Block, now: u64) {
        let Some(pos) = self.pending.iter().position(|p| p.pba == pba && p.submitted) else {
            return;
        };
        self.pending.remove(pos);

        let slot_idx = self.slots.iter().position(|s| s.is_none()).unwrap_or_else(|| {
            self.evict_lru_clean()
                .expect("cache fill completed without an admittable slot")
        });

        trace!(pba, slot_idx, "cache fill completed");
        self.slots[slot_idx] = Some(Slot {
            pba,
            data,
            dirty: false,
            last_access: now,
        });
    }

    /// Admits freshly synthesized data (a copy-on-write inner node that
    /// was never read from disk) directly into the cache, already
    /// dirty. Used by write-back when a node's address changes, so the
    /// new block has no prior on-disk copy to fetch.
    pub fn insert_dirty(&mut self, pba: Pba, data: Block, now: u64) -> bool {
        if self.data_available(pba) {
            self.write_into(self.data_index(pba, now).unwrap(), data);
            self.mark_dirty(pba);
            return true;
        }
        let Some(slot_idx) = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .or_else(|| self.evict_lru_clean())
        else {
            return false;
        };
        self.slots[slot_idx] = Some(Slot {
            pba,
            data,
            dirty: true,
            last_access: now,
        });
        true
    }

    fn evict_lru_clean(&mut self) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s, Some(s) if !s.dirty))
            .min_by_key(|(_, s)| s.as_ref().unwrap().last_access)
            .map(|(idx, _)| idx)
    }

    pub fn mark_dirty(&mut self, pba: Pba) {
        if let Some(idx) = self.slot_for(pba) {
            self.slots[idx].as_mut().unwrap().dirty = true;
        }
    }

    pub fn mark_clean(&mut self, pba: Pba) {
        if let Some(idx) = self.slot_for(pba) {
            self.slots[idx].as_mut().unwrap().dirty = false;
        }
    }

    pub fn dirty(&self, slot: CacheSlot) -> bool {
        self.slots[slot.0].as_ref().map(|s| s.dirty).unwrap_or(false)
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, idx: usize) -> Option<CacheSlot> {
        self.slots[idx].as_ref().map(|_| CacheSlot(idx))
    }

    /// Picks the PBA held at `slot` for the flusher to write back.
    pub fn flush(&self, slot: CacheSlot) -> Pba {
        self.slots[slot.0].as_ref().expect("slot occupied").pba
    }

    pub fn any_dirty(&self) -> bool {
        self.slots.iter().flatten().any(|s| s.dirty)
    }

    pub fn write_into(&mut self, slot: CacheSlot, data: Block) {
        let s = self.slots[slot.0].as_mut().expect("slot occupied");
        s.data = data;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_on_miss_then_serves_from_cache() {
        let mut cache = Cache::new(2);
        assert!(!cache.data_available(5));
        assert!(cache.request_acceptable(5));

        cache.submit_request(5);
        let prim = cache.peek_generated_primitive().unwrap();
        cache.drop_generated_primitive(prim);
        cache.mark_completed(5, Block::from_bytes([1; 4096]), 10);

        assert!(cache.data_available(5));
        let idx = cache.data_index(5, 11).unwrap();
        assert_eq!(cache.block(idx).as_slice(), &[1u8; 4096]);
    }

    #[test]
    fn evicts_oldest_clean_slot_when_full() {
        let mut cache = Cache::new(1);
        cache.submit_request(1);
        let p = cache.peek_generated_primitive().unwrap();
        cache.drop_generated_primitive(p);
        cache.mark_completed(1, Block::zeroed(), 1);

        // Full and the one slot is clean: a new fill is still acceptable.
        assert!(cache.request_acceptable(2));
        cache.submit_request(2);
        let p = cache.peek_generated_primitive().unwrap();
        cache.drop_generated_primitive(p);
        cache.mark_completed(2, Block::zeroed(), 2);

        assert!(!cache.data_available(1));
        assert!(cache.data_available(2));
    }

    #[test]
    fn refuses_new_admission_when_all_slots_dirty() {
        let mut cache = Cache::new(1);
        cache.submit_request(1);
        let p = cache.peek_generated_primitive().unwrap();
        cache.drop_generated_primitive(p);
        cache.mark_completed(1, Block::zeroed(), 1);
        cache.mark_dirty(1);

        assert!(!cache.request_acceptable(2));
    }
}
