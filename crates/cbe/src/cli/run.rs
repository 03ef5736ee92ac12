use std::thread::sleep;
use std::time::Duration;

use camino::Utf8PathBuf;
use cbe_config::ConfigFile;
use cbe_core::backend::FileBackend;
use cbe_core::time::SystemClock;
use cbe_core::{Engine, EngineConfig};
use cbe_crypto::BlockCipher;
use clap::Parser;
use eyre::{Result as EyreResult, WrapErr};

use crate::cli::parse_key_hex;

/// Mount a formatted device and drive the engine's tick loop until
/// interrupted.
#[derive(Debug, Parser)]
pub struct RunCommand {
    /// Path to the backing device file created by `format`.
    #[arg(long, value_name = "PATH")]
    pub device: Utf8PathBuf,

    /// Path to a `cbe.toml` config file; falls back to built-in
    /// defaults (both timers disabled) if omitted.
    #[arg(long, value_name = "PATH")]
    pub config: Option<Utf8PathBuf>,

    /// 64 hex-digit AES-256 key matching the one passed to `format`.
    #[arg(long, value_name = "HEX", value_parser = parse_key_hex)]
    pub key_hex: [u8; 32],

    /// Bounded number of in-flight client requests.
    #[arg(long, default_value_t = cbe_core::model::limits::DEFAULT_REQUEST_POOL_CAPACITY)]
    pub request_pool_capacity: usize,

    /// Number of cache slots.
    #[arg(long, default_value_t = cbe_core::model::limits::DEFAULT_CACHE_CAPACITY)]
    pub cache_capacity: usize,

    /// Stop after this many ticks make zero collective progress; 0
    /// means run until killed.
    #[arg(long, default_value_t = 0)]
    pub idle_ticks_before_exit: u64,
}

impl RunCommand {
    pub fn run(self) -> EyreResult<()> {
        let config_file = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path).wrap_err("failed to read config file")?;
                ConfigFile::from_toml(&text).wrap_err("failed to parse config file")?
            }
            None => ConfigFile::new(cbe_config::TickConfig::disabled(), false),
        };

        let backend = FileBackend::open(self.device.as_std_path()).wrap_err("failed to open backing device")?;
        let cipher = BlockCipher::new(self.key_hex);
        let engine_config = EngineConfig {
            sync_interval: config_file.tick.sync_interval,
            secure_interval: config_file.tick.secure_interval,
            show_progress: config_file.show_progress,
            cache_capacity: self.cache_capacity,
            request_pool_capacity: self.request_pool_capacity,
        };

        let mut engine =
            Engine::mount(Box::new(backend), cipher, SystemClock::new(), engine_config).wrap_err("failed to mount device")?;

        tracing::info!(device = %self.device, "engine mounted, driving tick loop");

        let mut idle_ticks = 0u64;
        loop {
            let progressed = engine.execute();
            while let Some(completed) = engine.poll_completed() {
                tracing::debug!(
                    request_id = ?completed.request.id,
                    success = completed.success,
                    "request completed"
                );
            }

            if progressed {
                idle_ticks = 0;
            } else {
                idle_ticks += 1;
                if self.idle_ticks_before_exit > 0 && idle_ticks >= self.idle_ticks_before_exit {
                    tracing::info!(idle_ticks, "no progress for idle-ticks-before-exit ticks, stopping");
                    break;
                }
                sleep(Duration::from_millis(1));
            }
        }
        Ok(())
    }
}
