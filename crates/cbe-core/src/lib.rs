//! The Consistent Block Encrypter engine: an encrypted, copy-on-write,
//! Merkle-chained, versioned block device virtualization layer driven
//! by a single cooperative, non-blocking scheduler (`engine::Engine`).
//!
//! The crate is organized as the reference design lays out its pipeline
//! (spec §4): one module per stage under [`stages`], shared data types
//! in [`model`], on-disk node encoding in [`inner_node`], the backend
//! and tick-source collaborator traits in [`backend`] and [`time`], and
//! the driver that wires every stage together in [`engine`].

pub mod backend;
pub mod engine;
pub mod error;
pub mod inner_node;
pub mod model;
pub mod primitive;
pub mod stages;
pub mod time;

pub use backend::{BackendDevice, FileBackend, InMemoryBackend};
pub use engine::{format, CompletedRequest, Engine, EngineConfig};
pub use error::{IoError, RequestError, StartupError};
pub use model::{Block, Generation, Pba, Vba, BLOCK_SIZE};
pub use primitive::{Operation, RequestId};
pub use time::{ManualClock, SystemClock, TickSource};
