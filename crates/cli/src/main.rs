//! quadflash - drive the emulated QUADSPI + MT25Q flash from the command line
//!
//! Every operation goes through the controller register window exactly as
//! firmware would (see `quadflash_core::driver`). With `--image` the flash
//! array is backed by a file and modified pages are written back to it.

mod cli;

use clap::Parser;
use cli::{Cli, Commands};
use quadflash_core::{
    savestate, BlockBackend, EraseSize, FileBackend, FlashConfig, QspiConfig, QuadFlash, Result,
};
use std::path::Path;

fn main() {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    // Set log level based on verbosity
    match cli.verbose {
        0 => {} // default (info)
        1 => log::set_max_level(log::LevelFilter::Debug),
        _ => log::set_max_level(log::LevelFilter::Trace),
    }

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn open_backend(path: &Path, config: &FlashConfig, read_only: bool, create: bool) -> Result<Box<dyn BlockBackend>> {
    if create && !path.exists() {
        log::info!("Creating erased image {} ({} bytes)", path.display(), config.size());
        return Ok(Box::new(FileBackend::create(path, config.size() as u64)?));
    }
    Ok(Box::new(FileBackend::open(path, read_only)?))
}

fn run(cli: Cli) -> Result<()> {
    let config = FlashConfig { num_sectors: cli.sectors, ..FlashConfig::default() };
    config.validate()?;
    let backend = match &cli.image {
        Some(path) => Some(open_backend(path, &config, cli.read_only, cli.create)?),
        None => None,
    };
    let mut machine = QuadFlash::new(config, QspiConfig::default(), backend)?;

    match cli.command {
        Commands::Id => {
            let id = machine.driver().read_id()?;
            println!("{:02X} {:02X} {:02X}", id[0], id[1], id[2]);
        }
        Commands::Info => {
            println!("{:#?}", machine.flash().config());
            print_registers(&mut machine)?;
        }
        Commands::Read { address, length, output } => {
            let mut buf = vec![0u8; length as usize];
            machine.driver().read(address, &mut buf)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, &buf)?;
                    log::info!("Wrote {} bytes to {}", buf.len(), path.display());
                }
                None => print!("{}", hex_dump(address, &buf)),
            }
        }
        Commands::Program { address, input } => {
            let data = std::fs::read(&input)?;
            machine.driver().program(address, &data)?;
            log::info!("Programmed {} bytes at {:#08x}", data.len(), address);
        }
        Commands::Erase { address, sector } => {
            let size = if sector { EraseSize::Sector } else { EraseSize::Subsector };
            machine.driver().erase(size, address)?;
            log::info!("Erased {:?} at {:#08x}", size, address);
        }
        Commands::Status => print_registers(&mut machine)?,
        Commands::SaveState { output } => {
            let path = match (output, &cli.image) {
                (Some(path), _) => path,
                (None, Some(image)) => savestate::state_path(image),
                (None, None) => "quadflash.state".into(),
            };
            machine.save_to_file(&path)?;
            log::info!("Saved state to {}", path.display());
        }
        Commands::LoadState { input } => {
            machine.load_from_file(&input)?;
            log::info!("Restored state from {}", input.display());
        }
    }

    machine.sync()
}

fn print_registers(machine: &mut QuadFlash) -> Result<()> {
    let mut drv = machine.driver();
    let status = drv.read_status()?;
    let flag_status = drv.read_flag_status()?;
    let evcr = drv.read_evcr()?;
    println!("status      {:#04x}", status);
    println!("flag status {:#04x}", flag_status);
    println!("evcr        {:#04x}", evcr);
    Ok(())
}

fn hex_dump(base: u32, data: &[u8]) -> String {
    let mut out = String::new();
    for (i, line) in data.chunks(16).enumerate() {
        let hex: Vec<String> = line.iter().map(|b| format!("{:02x}", b)).collect();
        let ascii: String = line
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
            .collect();
        out.push_str(&format!("{:08x}  {:<47}  |{}|\n", base as usize + i * 16, hex.join(" "), ascii));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_dump() {
        let dump = hex_dump(0x1000, b"QSPI\x00\xff");
        assert_eq!(dump, format!("00001000  {:<47}  |QSPI..|\n", "51 53 50 49 00 ff"));
    }

    #[test]
    fn test_sector_count_checked_before_image_is_created() {
        let dir = std::env::temp_dir().join(format!("quadflash-cli-{}", std::process::id()));
        let image = dir.join("flash.bin");
        for sectors in ["0", "257", "65536"] {
            let cli = Cli::try_parse_from([
                "quadflash", "--sectors", sectors, "--create", "-i", image.to_str().unwrap(), "id",
            ])
            .unwrap();
            assert!(matches!(run(cli), Err(quadflash_core::Error::InvalidConfig(_))), "sectors={}", sectors);
        }
        assert!(!image.exists());
    }
}
