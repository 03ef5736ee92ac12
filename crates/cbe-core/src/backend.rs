//! The backing block device boundary (spec §6). The real backend
//! driver is an external collaborator out of scope for this crate;
//! `BackendDevice` is the trait the I/O stage calls through, and
//! `InMemoryBackend` / `FileBackend` are reference implementations
//! used by tests and the demo binary.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::IoError;
use crate::model::{Block, Pba, BLOCK_SIZE};

pub trait BackendDevice: Send {
    /// Total number of addressable blocks.
    fn capacity(&self) -> u64;

    fn read_block(&mut self, pba: Pba) -> Result<Block, IoError>;

    fn write_block(&mut self, pba: Pba, block: &Block) -> Result<(), IoError>;

    fn check_range(&self, pba: Pba) -> Result<(), IoError> {
        if pba >= self.capacity() {
            return Err(IoError::OutOfRange {
                pba,
                capacity: self.capacity(),
            });
        }
        Ok(())
    }
}

/// A backing device held entirely in memory. Used by tests and as the
/// default for the demo binary's `--ephemeral` mode.
pub struct InMemoryBackend {
    blocks: Vec<Block>,
}

impl InMemoryBackend {
    pub fn new(capacity: u64) -> Self {
        Self {
            blocks: (0..capacity).map(|_| Block::zeroed()).collect(),
        }
    }

    /// Flips one bit of the block at `pba`, simulating on-disk bit rot
    /// for the corruption scenario of spec §8 scenario 5.
    pub fn corrupt(&mut self, pba: Pba) {
        if let Some(block) = self.blocks.get_mut(pba as usize) {
            block.0[0] ^= 0x01;
        }
    }
}

impl BackendDevice for InMemoryBackend {
    fn capacity(&self) -> u64 {
        self.blocks.len() as u64
    }

    fn read_block(&mut self, pba: Pba) -> Result<Block, IoError> {
        self.check_range(pba)?;
        Ok(self.blocks[pba as usize].clone())
    }

    fn write_block(&mut self, pba: Pba, block: &Block) -> Result<(), IoError> {
        self.check_range(pba)?;
        self.blocks[pba as usize] = block.clone();
        Ok(())
    }
}

/// A backing device held in a flat file, laid out as `capacity`
/// contiguous 4 KiB blocks. Used by the `cbe` CLI binary so state
/// survives a process restart, exercising the crash-and-reload scenarios
/// of spec §8.
pub struct FileBackend {
    file: File,
    capacity: u64,
}

impl FileBackend {
    pub fn create(path: &Path, capacity: u64) -> Result<Self, IoError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| IoError::WriteFailed {
                pba: 0,
                reason: e.to_string(),
            })?;
        file.set_len(capacity * BLOCK_SIZE as u64)
            .map_err(|e| IoError::WriteFailed {
                pba: 0,
                reason: e.to_string(),
            })?;
        Ok(Self { file, capacity })
    }

    pub fn open(path: &Path) -> Result<Self, IoError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| IoError::ReadFailed {
                pba: 0,
                reason: e.to_string(),
            })?;
        let len = file
            .metadata()
            .map_err(|e| IoError::ReadFailed {
                pba: 0,
                reason: e.to_string(),
            })?
            .len();
        Ok(Self {
            file,
            capacity: len / BLOCK_SIZE as u64,
        })
    }
}

impl BackendDevice for FileBackend {
    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn read_block(&mut self, pba: Pba) -> Result<Block, IoError> {
        self.check_range(pba)?;
        self.file
            .seek(SeekFrom::Start(pba * BLOCK_SIZE as u64))
            .map_err(|e| IoError::ReadFailed {
                pba,
                reason: e.to_string(),
            })?;
        let mut buf = [0u8; BLOCK_SIZE];
        self.file
            .read_exact(&mut buf)
            .map_err(|e| IoError::ReadFailed {
                pba,
                reason: e.to_string(),
            })?;
        Ok(Block::from_bytes(buf))
    }

    fn write_block(&mut self, pba: Pba, block: &Block) -> Result<(), IoError> {
        self.check_range(pba)?;
        self.file
            .seek(SeekFrom::Start(pba * BLOCK_SIZE as u64))
            .map_err(|e| IoError::WriteFailed {
                pba,
                reason: e.to_string(),
            })?;
        self.file
            .write_all(block.as_slice())
            .map_err(|e| IoError::WriteFailed {
                pba,
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_round_trips() {
        let mut backend = InMemoryBackend::new(4);
        let block = Block::from_bytes([0xAB; BLOCK_SIZE]);
        backend.write_block(2, &block).unwrap();
        assert_eq!(backend.read_block(2).unwrap(), block);
    }

    #[test]
    fn in_memory_rejects_out_of_range() {
        let mut backend = InMemoryBackend::new(2);
        assert!(backend.read_block(5).is_err());
    }

    #[test]
    fn file_backend_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.img");

        {
            let mut backend = FileBackend::create(&path, 4).unwrap();
            backend
                .write_block(1, &Block::from_bytes([0x42; BLOCK_SIZE]))
                .unwrap();
        }

        let mut reopened = FileBackend::open(&path).unwrap();
        assert_eq!(
            reopened.read_block(1).unwrap(),
            Block::from_bytes([0x42; BLOCK_SIZE])
        );
    }
}
