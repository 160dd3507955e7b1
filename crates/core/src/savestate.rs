//! Save state for the QUADSPI flash machine.
//!
//! Captures controller registers, the receive FIFO and the flash device
//! (array contents included) using bincode serialization with deflate
//! compression. Transient bus state is not captured: a restored machine has
//! chip-select released and the flash parser idle.
//!
//! ## File format
//!
//! ```text
//! +------------------+
//! | Magic "QSPI"     |  4 bytes
//! +------------------+
//! | Format version   |  u32 little-endian (currently 1)
//! +------------------+
//! | Flash size       |  u32 little-endian, bytes
//! +------------------+
//! | Compressed data  |  deflate-compressed bincode payload
//! +------------------+
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::peripherals::FlashConfig;

/// Magic bytes identifying a quadflash save state file.
const MAGIC: &[u8; 4] = b"QSPI";
/// Current save state format version.
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 12;

// ─── Per-component state structs ────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
pub struct QspiState {
    pub en: bool,
    pub tcf: bool,
    pub tef: bool,
    pub smf: bool,
    pub tof: bool,
    pub busy: bool,
    pub apms: bool,
    pub pmm: bool,
    pub dl: u32,
    pub ccr: u32,
    pub address: u32,
    pub alternate: u32,
    pub mask: u32,
    pub match_value: u32,
    pub interval: u16,
    pub rx_fifo: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
pub struct Mt25qState {
    pub data: Vec<u8>,
    pub status: u8,
    pub flag_status: u8,
    pub evcr: u8,
    pub register_read_mask: u8,
    pub reset_enabled: bool,
    pub deep_sleep: bool,
    pub quad_enabled: bool,
}

// ─── Top-level save state ───────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
pub struct SaveState {
    pub flash_config: FlashConfig,
    pub qspi: QspiState,
    pub flash: Mt25qState,
}

// ─── Encoding ───────────────────────────────────────────────────────────────

/// Encode with header and deflate compression.
pub fn to_bytes(state: &SaveState) -> Result<Vec<u8>> {
    let payload = bincode::serialize(state)?;
    let compressed = miniz_oxide::deflate::compress_to_vec(&payload, 6);

    let mut out = Vec::with_capacity(HEADER_LEN + compressed.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&state.flash_config.size().to_le_bytes());
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// Decode, verifying magic, version and flash size.
pub fn from_bytes(data: &[u8], expected_flash_size: u32) -> Result<SaveState> {
    if data.len() < HEADER_LEN {
        return Err(Error::InvalidSaveState("file too small".into()));
    }
    if &data[0..4] != MAGIC {
        return Err(Error::InvalidSaveState("bad magic".into()));
    }
    let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    if version != FORMAT_VERSION {
        return Err(Error::InvalidSaveState(format!(
            "unsupported version {} (expected {})",
            version, FORMAT_VERSION
        )));
    }
    let flash_size = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
    if flash_size != expected_flash_size {
        return Err(Error::InvalidSaveState(format!(
            "flash size mismatch: save={} current={}",
            flash_size, expected_flash_size
        )));
    }

    let decompressed = miniz_oxide::inflate::decompress_to_vec(&data[HEADER_LEN..])
        .map_err(|e| Error::InvalidSaveState(format!("decompress error: {:?}", e)))?;

    Ok(bincode::deserialize(&decompressed)?)
}

// ─── File I/O ───────────────────────────────────────────────────────────────

/// Save state to file.
pub fn save_to_file(state: &SaveState, path: &Path) -> Result<()> {
    std::fs::write(path, to_bytes(state)?)?;
    Ok(())
}

/// Load state from file, checking it was taken from a flash of the same size.
pub fn load_from_file(path: &Path, expected_flash_size: u32) -> Result<SaveState> {
    let data = std::fs::read(path)?;
    from_bytes(&data, expected_flash_size)
}

/// Derive save state file path from an image path.
/// `flash.bin` → `flash.state`
pub fn state_path(image_path: &Path) -> PathBuf {
    image_path.with_extension("state")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SaveState {
        let flash_config = FlashConfig { num_sectors: 1, ..FlashConfig::default() };
        SaveState {
            qspi: QspiState {
                en: true,
                tcf: true,
                tef: false,
                smf: false,
                tof: false,
                busy: true,
                apms: false,
                pmm: false,
                dl: 3,
                ccr: 0x0500_250B,
                address: 0x1000,
                alternate: 0,
                mask: 0,
                match_value: 0,
                interval: 0,
                rx_fifo: vec![1, 2, 3, 4],
            },
            flash: Mt25qState {
                data: vec![0xFF; flash_config.size() as usize],
                status: 0x02,
                flag_status: 0,
                evcr: 0xAF,
                register_read_mask: 0,
                reset_enabled: false,
                deep_sleep: false,
                quad_enabled: true,
            },
            flash_config,
        }
    }

    #[test]
    fn test_header_layout() {
        let bytes = to_bytes(&sample()).unwrap();
        assert_eq!(&bytes[0..4], b"QSPI");
        assert_eq!(&bytes[4..8], &1u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &(64 * 1024u32).to_le_bytes());
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flash.state");
        save_to_file(&sample(), &path).unwrap();
        let back = load_from_file(&path, 64 * 1024).unwrap();
        assert_eq!(back.qspi.rx_fifo, vec![1, 2, 3, 4]);
        assert_eq!(back.flash.evcr, 0xAF);
        assert!(back.flash.quad_enabled);
    }

    #[test]
    fn test_rejects_bad_files() {
        let bytes = to_bytes(&sample()).unwrap();
        assert!(matches!(from_bytes(&bytes[..8], 64 * 1024), Err(Error::InvalidSaveState(_))));
        assert!(matches!(from_bytes(&bytes, 16 * 1024 * 1024), Err(Error::InvalidSaveState(_))));

        let mut bad = bytes.clone();
        bad[0] = b'X';
        assert!(matches!(from_bytes(&bad, 64 * 1024), Err(Error::InvalidSaveState(_))));

        let mut bad = bytes;
        bad[4] = 2;
        assert!(matches!(from_bytes(&bad, 64 * 1024), Err(Error::InvalidSaveState(_))));
    }

    #[test]
    fn test_state_path() {
        assert_eq!(state_path(Path::new("img/flash.bin")), PathBuf::from("img/flash.state"));
    }
}
