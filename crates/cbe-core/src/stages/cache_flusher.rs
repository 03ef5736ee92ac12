//! Cache flusher (spec §4.5): emits a write primitive per dirty cache
//! slot and, on completion, marks the slot clean. Driven only during a
//! sync sequence (spec §4.9).

use crate::model::Pba;
use crate::primitive::{Operation, Primitive, Tag};

struct FlushJob {
    pba: Pba,
    submitted: bool,
}

#[derive(Default)]
pub struct CacheFlusher {
    jobs: Vec<FlushJob>,
}

impl CacheFlusher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_acceptable(&self) -> bool {
        true
    }

    pub fn submit_request(&mut self, pba: Pba) {
        self.jobs.push(FlushJob {
            pba,
            submitted: false,
        });
    }

    pub fn peek_generated_primitive(&self) -> Option<Primitive> {
        let job = self.jobs.iter().find(|j| !j.submitted)?;
        Some(Primitive::new(Tag::CacheFlush, None, Operation::Write, job.pba, 0))
    }

    pub fn drop_generated_primitive(&mut self, primitive: Primitive) {
        if let Some(job) = self.jobs.iter_mut().find(|j| j.pba == primitive.pba && !j.submitted) {
            job.submitted = true;
        }
    }

    pub fn peek_completed_primitive(&self) -> Option<Primitive> {
        self.jobs
            .iter()
            .find(|j| j.submitted)
            .map(|j| Primitive::new(Tag::CacheFlush, None, Operation::Write, j.pba, 0))
    }

    pub fn drop_completed_primitive(&mut self, primitive: Primitive) {
        if let Some(pos) = self.jobs.iter().position(|j| j.pba == primitive.pba && j.submitted) {
            self.jobs.remove(pos);
        }
    }

    pub fn mark_completed(&mut self, pba: Pba) {
        // The I/O stage reports completion directly via the pba; the
        // job stays "submitted" and ready for peek_completed_primitive
        // until the driver drains it.
        debug_assert!(self.jobs.iter().any(|j| j.pba == pba && j.submitted));
    }

    pub fn is_idle(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flushes_one_job_end_to_end() {
        let mut flusher = CacheFlusher::new();
        flusher.submit_request(42);

        let prim = flusher.peek_generated_primitive().unwrap();
        flusher.drop_generated_primitive(prim);

        let completed = flusher.peek_completed_primitive().unwrap();
        assert_eq!(completed.pba, 42);
        flusher.drop_completed_primitive(completed);

        assert!(flusher.is_idle());
    }
}
