//! Backend I/O (spec §4.10): submits/completes block reads and writes
//! against the backing device, tagging each primitive with its
//! originator. The backing device itself is synchronous (see
//! `backend::BackendDevice`); this stage still models the queue-based
//! submit/peek/drop boundary so the rest of the pipeline treats I/O as
//! the one true asynchronous boundary, as spec §5 requires.

use tracing::error;

use crate::backend::BackendDevice;
use crate::model::Block;
use crate::primitive::{Operation, Primitive, RequestId, Tag};

struct Completed {
    primitive: Primitive,
    data: Block,
}

pub struct IoStage {
    backend: Box<dyn BackendDevice>,
    completed: Option<Completed>,
}

impl IoStage {
    pub fn new(backend: Box<dyn BackendDevice>) -> Self {
        Self {
            backend,
            completed: None,
        }
    }

    /// Bounded to one in-flight primitive, matching the reference
    /// engine's single I/O entry.
    pub fn primitive_acceptable(&self) -> bool {
        self.completed.is_none()
    }

    pub fn submit_primitive(
        &mut self,
        tag: Tag,
        owner: Option<RequestId>,
        operation: Operation,
        pba: u64,
        vba: u64,
        write_data: Option<&Block>,
    ) {
        debug_assert!(self.primitive_acceptable());

        let (data, success) = match operation {
            Operation::Read => match self.backend.read_block(pba) {
                Ok(block) => (block, true),
                Err(err) => {
                    error!(pba, %err, "backend read failed");
                    (Block::zeroed(), false)
                }
            },
            Operation::Write => {
                let block = write_data.expect("write primitive requires data").clone();
                match self.backend.write_block(pba, &block) {
                    Ok(()) => (block, true),
                    Err(err) => {
                        error!(pba, %err, "backend write failed");
                        (block, false)
                    }
                }
            }
            Operation::Sync => (Block::zeroed(), true),
        };

        let mut primitive = Primitive::new(tag, owner, operation, pba, vba);
        primitive.success = success;
        self.completed = Some(Completed { primitive, data });
    }

    pub fn peek_completed_primitive(&self) -> Option<Primitive> {
        self.completed.as_ref().map(|c| c.primitive)
    }

    pub fn peek_completed_data(&self) -> Option<&Block> {
        self.completed.as_ref().map(|c| &c.data)
    }

    pub fn drop_completed_primitive(&mut self) {
        self.completed = None;
    }

    pub fn capacity(&self) -> u64 {
        self.backend.capacity()
    }

    pub fn backend_mut(&mut self) -> &mut dyn BackendDevice {
        self.backend.as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;

    #[test]
    fn round_trips_a_write_then_read() {
        let mut io = IoStage::new(Box::new(InMemoryBackend::new(4)));
        let data = Block::from_bytes([7; 4096]);

        assert!(io.primitive_acceptable());
        io.submit_primitive(Tag::WriteBack, None, Operation::Write, 1, 0, Some(&data));
        assert!(!io.primitive_acceptable());
        let completed = io.peek_completed_primitive().unwrap();
        assert!(completed.success);
        io.drop_completed_primitive();

        io.submit_primitive(Tag::Vbd, None, Operation::Read, 1, 0, None);
        let completed = io.peek_completed_primitive().unwrap();
        assert!(completed.success);
        assert_eq!(io.peek_completed_data().unwrap(), &data);
    }

    #[test]
    fn reports_failure_on_out_of_range_read() {
        let mut io = IoStage::new(Box::new(InMemoryBackend::new(1)));
        io.submit_primitive(Tag::Vbd, None, Operation::Read, 99, 0, None);
        let completed = io.peek_completed_primitive().unwrap();
        assert!(!completed.success);
    }
}
