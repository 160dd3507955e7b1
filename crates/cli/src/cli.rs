//! CLI argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Parse a string as a hex or decimal u32
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(|e| format!("Invalid hex value: {}", e))
    } else {
        s.parse::<u32>().map_err(|e| format!("Invalid number: {}", e))
    }
}

#[derive(Parser)]
#[command(name = "quadflash")]
#[command(author, version, about = "QUADSPI + MT25Q flash emulator", long_about = None)]
pub struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Flash image backing the device (RAM only when omitted)
    #[arg(short, long, global = true)]
    pub image: Option<PathBuf>,

    /// Open the image read-only; programs and erases are not written back
    #[arg(long, global = true)]
    pub read_only: bool,

    /// Create an erased image if it does not exist
    #[arg(long, global = true)]
    pub create: bool,

    /// Number of 64 KB sectors (256 = 16 MB part)
    #[arg(long, default_value_t = 256, global = true)]
    pub sectors: u32,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Read the identification bytes
    Id,

    /// Show geometry and device registers
    Info,

    /// Read flash contents (hex dump, or raw bytes to a file)
    Read {
        /// Start address
        #[arg(short, long, value_parser = parse_hex_u32, default_value = "0")]
        address: u32,

        /// Number of bytes
        #[arg(short, long, value_parser = parse_hex_u32)]
        length: u32,

        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Program a file at an address (the range should be erased first)
    Program {
        /// Start address
        #[arg(short, long, value_parser = parse_hex_u32)]
        address: u32,

        /// Input file path
        #[arg(short = 'f', long)]
        input: PathBuf,
    },

    /// Erase the subsector (or sector) containing an address
    Erase {
        /// Address inside the region
        #[arg(short, long, value_parser = parse_hex_u32)]
        address: u32,

        /// Erase the whole 64 KB sector instead of a 4 KB subsector
        #[arg(long)]
        sector: bool,
    },

    /// Print status, flag status and EVCR
    Status,

    /// Write a save state of the machine
    SaveState {
        /// State file (defaults to the image path with a .state extension)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Restore a save state; the restored array is written back to the image
    LoadState {
        /// State file
        #[arg(short = 'f', long)]
        input: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_u32() {
        assert_eq!(parse_hex_u32("0x1000"), Ok(0x1000));
        assert_eq!(parse_hex_u32("0X1f"), Ok(0x1F));
        assert_eq!(parse_hex_u32("4096"), Ok(4096));
        assert!(parse_hex_u32("0xZZ").is_err());
    }

    #[test]
    fn test_parse_read() {
        let cli = Cli::try_parse_from(["quadflash", "-v", "read", "-a", "0x100", "-l", "16"]).unwrap();
        assert_eq!(cli.verbose, 1);
        match cli.command {
            Commands::Read { address, length, output } => {
                assert_eq!(address, 0x100);
                assert_eq!(length, 16);
                assert!(output.is_none());
            }
            _ => panic!("expected read"),
        }
    }
}
