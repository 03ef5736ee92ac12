use camino::Utf8PathBuf;
use cbe_core::backend::FileBackend;
use cbe_core::model::limits;
use cbe_crypto::BlockCipher;
use clap::Parser;
use eyre::{Result as EyreResult, WrapErr};

use crate::cli::parse_key_hex;

/// Create a fresh backing device file and write its initial superblocks,
/// zeroed tree, and free pool.
#[derive(Debug, Parser)]
pub struct FormatCommand {
    /// Path to the backing device file; created or truncated.
    #[arg(long, value_name = "PATH")]
    pub device: Utf8PathBuf,

    /// Number of inner levels between the root and the leaves.
    #[arg(long, default_value_t = 2)]
    pub height: u32,

    /// Children per inner node.
    #[arg(long, default_value_t = limits::TREE_MIN_DEGREE)]
    pub degree: u32,

    /// Spare blocks reserved for the first round of copy-on-write
    /// reallocations.
    #[arg(long, default_value_t = 64)]
    pub free_pool: usize,

    /// 64 hex-digit AES-256 key the leaf content is encrypted under; the
    /// same key must be passed to `run` to read this device back.
    #[arg(long, value_name = "HEX", value_parser = parse_key_hex)]
    pub key_hex: [u8; 32],
}

impl FormatCommand {
    pub fn run(self) -> EyreResult<()> {
        let leaves = (self.degree as u64).pow(self.height);
        let tree_blocks: u64 = (0..=self.height).map(|l| (self.degree as u64).pow(l)).sum();
        let reserved = limits::NUM_SUPER_BLOCKS as u64 + 1;
        let capacity = reserved + tree_blocks + self.free_pool as u64;

        let mut backend = FileBackend::create(self.device.as_std_path(), capacity)
            .wrap_err("failed to create backing device file")?;
        let cipher = BlockCipher::new(self.key_hex);
        cbe_core::engine::format(&mut backend, &cipher, self.height, self.degree, self.free_pool)
            .wrap_err("failed to format backing device")?;

        tracing::info!(
            device = %self.device,
            capacity,
            leaves,
            height = self.height,
            degree = self.degree,
            "formatted backing device"
        );
        Ok(())
    }
}
