//! Request pool (spec §4.1): accepts client requests, tracks their
//! outstanding sub-primitives, and reports completion.

use tracing::trace;

use crate::error::RequestError;
use crate::primitive::{Request, RequestId};

struct Entry {
    request: Request,
    /// Not yet handed to the splitter.
    pending: bool,
    primitives_total: u64,
    primitives_done: u64,
    any_failed: bool,
    completed: bool,
}

pub struct RequestPool {
    capacity: usize,
    entries: Vec<Entry>,
    next_id: u64,
}

impl RequestPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Vec::new(),
            next_id: 0,
        }
    }

    pub fn acceptable(&self) -> bool {
        self.entries.len() < self.capacity
    }

    /// Accepts a request, allocating it an internal identifier and
    /// recording how many sub-primitives the splitter will emit for it.
    pub fn submit(
        &mut self,
        mut request: Request,
        n_primitives: u64,
    ) -> Result<RequestId, RequestError> {
        if !self.acceptable() {
            return Err(RequestError::PoolFull);
        }
        let id = RequestId(self.next_id);
        self.next_id += 1;
        request.id = id;

        trace!(request_id = id.0, n_primitives, "request accepted into pool");

        self.entries.push(Entry {
            request,
            pending: true,
            primitives_total: n_primitives,
            primitives_done: 0,
            any_failed: false,
            completed: n_primitives == 0,
        });
        Ok(id)
    }

    /// The oldest request not yet dispatched to the splitter.
    pub fn peek_pending(&self) -> Option<Request> {
        self.entries.iter().find(|e| e.pending).map(|e| e.request)
    }

    pub fn drop_pending(&mut self, id: RequestId) {
        if let Some(entry) = self.find_mut(id) {
            entry.pending = false;
        }
    }

    pub fn request_for_tag(&self, id: RequestId) -> Option<Request> {
        self.find(id).map(|e| e.request)
    }

    /// Marks one sub-primitive of `id` as done; if this was the last
    /// one outstanding, the request becomes retrievable as completed.
    pub fn mark_completed(&mut self, id: RequestId, success: bool) {
        if let Some(entry) = self.find_mut(id) {
            entry.primitives_done += 1;
            entry.any_failed |= !success;
            if entry.primitives_done >= entry.primitives_total {
                entry.completed = true;
            }
        }
    }

    pub fn peek_completed_request(&self) -> Option<(Request, bool)> {
        self.entries
            .iter()
            .find(|e| e.completed)
            .map(|e| (e.request, !e.any_failed))
    }

    pub fn drop_completed_request(&mut self, id: RequestId) {
        self.entries.retain(|e| e.request.id != id);
    }

    fn find(&self, id: RequestId) -> Option<&Entry> {
        self.entries.iter().find(|e| e.request.id == id)
    }

    fn find_mut(&mut self, id: RequestId) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| e.request.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitive::Operation;

    fn req(vba: u64, count: u64) -> Request {
        Request {
            id: RequestId(0),
            operation: Operation::Read,
            vba,
            count,
            client_tag: 0,
            offset: 0,
        }
    }

    #[test]
    fn completes_after_all_primitives_marked() {
        let mut pool = RequestPool::new(4);
        let id = pool.submit(req(0, 3), 3).unwrap();

        assert!(pool.peek_completed_request().is_none());
        pool.mark_completed(id, true);
        pool.mark_completed(id, true);
        assert!(pool.peek_completed_request().is_none());
        pool.mark_completed(id, true);

        let (completed, success) = pool.peek_completed_request().unwrap();
        assert_eq!(completed.id, id);
        assert!(success);
    }

    #[test]
    fn rejects_when_full() {
        let mut pool = RequestPool::new(1);
        pool.submit(req(0, 1), 1).unwrap();
        assert!(!pool.acceptable());
        assert!(matches!(
            pool.submit(req(1, 1), 1),
            Err(RequestError::PoolFull)
        ));
    }

    #[test]
    fn any_failed_primitive_marks_request_failed() {
        let mut pool = RequestPool::new(4);
        let id = pool.submit(req(0, 2), 2).unwrap();
        pool.mark_completed(id, true);
        pool.mark_completed(id, false);

        let (_, success) = pool.peek_completed_request().unwrap();
        assert!(!success);
    }
}
