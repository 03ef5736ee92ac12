//! Error taxonomy, following spec §7: configuration/startup fatal,
//! integrity fatal, resource exhaustion, and client-visible rejections.

use thiserror::Error;

use crate::model::{Generation, Pba};

/// Errors that abort engine construction. None of these can occur once
/// the engine is running.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StartupError {
    #[error("no valid superblock found on the backing device")]
    NoValidSuperBlock,

    #[error("superblock names snapshot id {snapshot_id} but no slot holds it")]
    SnapshotSlotNotFound { snapshot_id: u64 },

    #[error("tree height {height} is outside [{min}, {max}]")]
    TreeHeightOutOfRange { height: u32, min: u32, max: u32 },

    #[error("tree degree {degree} is below the minimum {min}")]
    TreeDegreeTooLow { degree: u32, min: u32 },

    #[error("backing device has {capacity} blocks but formatting this geometry needs {needed}")]
    DeviceTooSmall { needed: u64, capacity: u64 },

    #[error("free pool of {requested} blocks exceeds the {max} entries one directory block can hold")]
    FreePoolTooLarge { requested: usize, max: usize },

    #[error("I/O failure while formatting the backing device: {0}")]
    FormatIoFailed(#[from] IoError),
}

/// Errors surfaced while translating a virtual block address, or while
/// serving a request. These never abort the engine: the affected
/// request fails, other requests keep being served.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum RequestError {
    #[error("virtual block address {vba} is out of range (max {max_vba})")]
    OutOfRange { vba: u64, max_vba: u64 },

    #[error("malformed request")]
    Malformed,

    #[error("request pool is full, retry later")]
    PoolFull,

    #[error("hash mismatch at pba {pba}: expected {expected_prefix:?}, got {actual_prefix:?}")]
    HashMismatch {
        pba: Pba,
        expected_prefix: [u8; 4],
        actual_prefix: [u8; 4],
    },

    #[error("no reusable physical blocks available after {retries} snapshot discards")]
    AllocationExhausted { retries: u32 },
}

/// Errors from the backend device boundary.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IoError {
    #[error("read of pba {pba} failed: {reason}")]
    ReadFailed { pba: Pba, reason: String },

    #[error("write of pba {pba} failed: {reason}")]
    WriteFailed { pba: Pba, reason: String },

    #[error("pba {pba} is out of range of the backing device (capacity {capacity})")]
    OutOfRange { pba: Pba, capacity: u64 },
}

/// An integrity violation observed at a given generation; logged at
/// `error` level and surfaces as a failed request rather than a panic.
#[derive(Debug, Clone, Copy)]
pub struct IntegrityViolation {
    pub pba: Pba,
    pub generation: Generation,
}
