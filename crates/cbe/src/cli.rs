use clap::{Parser, Subcommand};
use eyre::Result as EyreResult;

mod format;
mod run;

use format::FormatCommand;
use run::RunCommand;

#[derive(Debug, Parser)]
#[command(author, version, about = "Consistent Block Encrypter engine CLI", long_about = None)]
pub struct RootCommand {
    #[command(subcommand)]
    pub action: SubCommands,
}

#[derive(Debug, Subcommand)]
pub enum SubCommands {
    /// Initialize a fresh backing device file.
    Format(FormatCommand),
    /// Mount a formatted device and drive the engine's tick loop.
    Run(RunCommand),
}

impl RootCommand {
    pub fn run(self) -> EyreResult<()> {
        match self.action {
            SubCommands::Format(format) => format.run(),
            SubCommands::Run(run) => run.run(),
        }
    }
}

/// Parses a 64-character hex string into a 32-byte AES-256 key.
pub(crate) fn parse_key_hex(s: &str) -> Result<[u8; 32], String> {
    let bytes = hex_decode(s).map_err(|e| format!("invalid --key-hex: {e}"))?;
    bytes
        .try_into()
        .map_err(|v: Vec<u8>| format!("--key-hex must decode to 32 bytes, got {}", v.len()))
}

fn hex_decode(s: &str) -> Result<Vec<u8>, String> {
    if s.len() % 2 != 0 {
        return Err("odd number of hex digits".to_owned());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| e.to_string()))
        .collect()
}
