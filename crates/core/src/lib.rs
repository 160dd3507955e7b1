//! # quadflash-core
//!
//! Emulation of an STM32L4 QUADSPI controller with a Micron MT25Q serial NOR
//! flash attached to it.
//!
//! The guest sees two windows: the controller register file at
//! [`QSPI_REGS_BASE`] and the memory-mapped flash window at [`QSPI_MEM_BASE`].
//! Register accesses drive the bus synchronously; the memory-mapped window is
//! reserved and every access to it is rejected.
//!
//! ## Architecture
//!
//! - [`QuadFlash`]: top-level machine that decodes the windows and owns the parts
//! - [`peripherals::Quadspi`]: host bus controller (registers, FIFO, auto-polling)
//! - [`peripherals::Mt25q`]: flash device (command parser, NOR array model)
//! - [`storage`]: persistent image behind the flash array
//! - [`driver`]: register-level firmware sequences (read, program, erase, poll)
//! - [`savestate`]: snapshot files of controller and device state

pub mod error;
pub mod peripherals;
pub mod storage;
pub mod driver;
pub mod savestate;

use std::path::Path;

pub use driver::{EraseSize, FlashDriver, RegisterBus};
pub use error::{Error, Result};
pub use peripherals::{FlashConfig, Mt25q, QspiConfig, Quadspi};
pub use storage::{BlockBackend, FileBackend, MemoryBackend};

/// QUADSPI register file base address
pub const QSPI_REGS_BASE: u32 = 0xA000_1000;
/// QUADSPI register file size
pub const QSPI_REGS_SIZE: u32 = 0x400;
/// Memory-mapped flash window base address
pub const QSPI_MEM_BASE: u32 = 0x9000_0000;
/// Memory-mapped flash window size: 256 MB
pub const QSPI_MEM_SIZE: u32 = 0x1000_0000;

/// Controller and flash wired together behind the two address windows.
pub struct QuadFlash {
    pub qspi: Quadspi<Mt25q>,
}

impl QuadFlash {
    /// Build the machine. Without a backend the flash array lives in RAM.
    pub fn new(
        flash_config: FlashConfig,
        qspi_config: QspiConfig,
        backend: Option<Box<dyn BlockBackend>>,
    ) -> Result<Self> {
        let flash = Mt25q::new(flash_config, backend)?;
        log::debug!(target: "quadflash::qspi", "QUADSPI at {:#010x}, flash window at {:#010x}",
            QSPI_REGS_BASE, QSPI_MEM_BASE);
        Ok(QuadFlash { qspi: Quadspi::new(flash, qspi_config) })
    }

    pub fn flash(&self) -> &Mt25q {
        self.qspi.slave()
    }

    pub fn flash_mut(&mut self) -> &mut Mt25q {
        self.qspi.slave_mut()
    }

    /// Guest read of `size` bytes at `addr`.
    pub fn read(&mut self, addr: u32, size: u32) -> Result<u32> {
        if in_window(addr, QSPI_REGS_BASE, QSPI_REGS_SIZE) {
            return self.qspi.read(addr - QSPI_REGS_BASE, size);
        }
        if in_window(addr, QSPI_MEM_BASE, QSPI_MEM_SIZE) {
            log::warn!(target: "quadflash::qspi", "unimplemented memory-mapped read (size {}, addr {:#010x})",
                size, addr);
            return Err(Error::ReservedRegion(addr));
        }
        Err(Error::Unmapped(addr))
    }

    /// Guest write of `size` bytes at `addr`.
    pub fn write(&mut self, addr: u32, value: u32, size: u32) -> Result<()> {
        if in_window(addr, QSPI_REGS_BASE, QSPI_REGS_SIZE) {
            return self.qspi.write(addr - QSPI_REGS_BASE, value, size);
        }
        if in_window(addr, QSPI_MEM_BASE, QSPI_MEM_SIZE) {
            log::warn!(target: "quadflash::qspi",
                "unimplemented memory-mapped write (size {}, value {:#x}, addr {:#010x})", size, value, addr);
            return Err(Error::ReservedRegion(addr));
        }
        Err(Error::Unmapped(addr))
    }

    /// System reset: controller registers and device volatile state. The array is kept.
    pub fn reset(&mut self) {
        self.qspi.reset();
        self.flash_mut().reset();
    }

    /// Push pending flash writes out before the caller snapshots the image.
    pub fn before_snapshot(&mut self) {
        self.flash_mut().before_snapshot();
    }

    /// Flush write-back and wait for the backing image to settle.
    pub fn sync(&mut self) -> Result<()> {
        self.flash_mut().sync()
    }

    /// Firmware-style driver over this machine's register window.
    pub fn driver(&mut self) -> FlashDriver<'_, Self> {
        let config = self.flash().config().clone();
        FlashDriver::new(self, &config)
    }

    pub fn save_state(&mut self) -> savestate::SaveState {
        self.before_snapshot();
        savestate::SaveState {
            flash_config: self.flash().config().clone(),
            qspi: self.qspi.save_state(),
            flash: self.flash().save_state(),
        }
    }

    pub fn load_state(&mut self, state: savestate::SaveState) -> Result<()> {
        if &state.flash_config != self.flash().config() {
            return Err(Error::InvalidSaveState("flash geometry differs".into()));
        }
        self.flash_mut().load_state(state.flash)?;
        self.qspi.load_state(state.qspi);
        Ok(())
    }

    pub fn save_to_file(&mut self, path: &Path) -> Result<()> {
        let state = self.save_state();
        savestate::save_to_file(&state, path)
    }

    pub fn load_from_file(&mut self, path: &Path) -> Result<()> {
        let state = savestate::load_from_file(path, self.flash().config().size())?;
        self.load_state(state)
    }
}

impl RegisterBus for QuadFlash {
    fn read_register(&mut self, offset: u32, size: u32) -> Result<u32> {
        self.read(QSPI_REGS_BASE + offset, size)
    }

    fn write_register(&mut self, offset: u32, value: u32, size: u32) -> Result<()> {
        self.write(QSPI_REGS_BASE + offset, value, size)
    }
}

fn in_window(addr: u32, base: u32, size: u32) -> bool {
    addr >= base && addr - base < size
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peripherals::mt25q::opcodes::*;
    use crate::peripherals::quadspi::*;

    fn small() -> FlashConfig {
        FlashConfig { num_sectors: 4, ..FlashConfig::default() }
    }

    fn machine() -> QuadFlash {
        QuadFlash::new(small(), QspiConfig::default(), None).unwrap()
    }

    fn reg(offset: u32) -> u32 {
        QSPI_REGS_BASE + offset
    }

    #[test]
    fn test_register_window_reaches_controller() {
        let mut m = machine();
        m.write(reg(QUADSPI_DLR), 0x1234, 4).unwrap();
        assert_eq!(m.read(reg(QUADSPI_DLR), 4).unwrap(), 0x1234);
        assert_eq!(m.qspi.dl, 0x1234);
    }

    #[test]
    fn test_memory_mapped_window_reserved() {
        let mut m = machine();
        assert!(matches!(m.read(QSPI_MEM_BASE + 0x100, 4), Err(Error::ReservedRegion(_))));
        assert!(matches!(m.write(QSPI_MEM_BASE, 0, 4), Err(Error::ReservedRegion(_))));
        assert!(matches!(m.read(QSPI_REGS_BASE + QSPI_REGS_SIZE, 4), Err(Error::Unmapped(_))));
        assert_eq!(m.qspi.dbg_transfers, 0);
    }

    #[test]
    fn test_fast_read_through_window() {
        let mut m = machine();
        let pattern: Vec<u8> = (0x40..0x50).collect();
        m.flash_mut().load_data_at(&pattern, 0x1000);

        let ccr = Ccr::new(FAST_READ, FunctionalMode::IndirectRead)
            .address(LineMode::Single, AddressSize::A24)
            .dummy(8)
            .data(LineMode::Quad);
        m.write(reg(QUADSPI_DLR), 15, 4).unwrap();
        m.write(reg(QUADSPI_CCR), ccr.bits(), 4).unwrap();
        m.write(reg(QUADSPI_AR), 0x1000, 4).unwrap();
        assert_eq!(m.qspi.dbg_transfers, 28);
        assert_eq!(m.qspi.dbg_cs_count, 1);

        let got: Vec<u8> = (0..16).map(|_| m.read(reg(QUADSPI_DR), 1).unwrap() as u8).collect();
        assert_eq!(got, pattern);
    }

    #[test]
    fn test_driver_program_then_read() {
        let mut m = machine();
        let mut drv = m.driver();
        assert_eq!(drv.read_id().unwrap(), [0x20, 0xBB, 0x19]);
        drv.program(0x3000, b"hello flash").unwrap();
        let mut buf = [0u8; 11];
        drv.read(0x3000, &mut buf).unwrap();
        assert_eq!(&buf, b"hello flash");
    }

    #[test]
    fn test_reset_keeps_array() {
        let mut m = machine();
        m.driver().program(0x10, &[0x5A]).unwrap();
        m.write(reg(QUADSPI_DLR), 7, 4).unwrap();
        m.reset();
        assert_eq!(m.read(reg(QUADSPI_DLR), 4).unwrap(), 0);
        assert!(!m.flash().status().contains(crate::peripherals::mt25q::Status::WRITE_ENABLE));
        assert_eq!(m.flash().data()[0x10], 0x5A);
    }

    #[test]
    fn test_save_state_preserves_fifo_and_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.state");

        let mut m = machine();
        m.driver().program(0x200, &[1, 2, 3, 4]).unwrap();
        let ccr = Ccr::new(FAST_READ, FunctionalMode::IndirectRead)
            .address(LineMode::Single, AddressSize::A24)
            .dummy(8)
            .data(LineMode::Single);
        m.write(reg(QUADSPI_DLR), 3, 4).unwrap();
        m.write(reg(QUADSPI_CCR), ccr.bits(), 4).unwrap();
        m.write(reg(QUADSPI_AR), 0x200, 4).unwrap();
        m.save_to_file(&path).unwrap();

        let mut other = machine();
        other.load_from_file(&path).unwrap();
        assert_eq!(other.flash().data()[0x200..0x204], [1, 2, 3, 4]);
        assert_eq!(other.qspi.fifo_level(), 4);
        let sr = other.read(reg(QUADSPI_SR), 4).unwrap();
        assert_ne!(sr & SR_BUSY, 0);
        let got: Vec<u32> = (0..4).map(|_| other.read(reg(QUADSPI_DR), 1).unwrap()).collect();
        assert_eq!(got, vec![1, 2, 3, 4]);
        assert_ne!(other.read(reg(QUADSPI_SR), 4).unwrap() & SR_TCF, 0);
    }

    #[test]
    fn test_load_state_rejects_other_geometry() {
        let mut m = machine();
        let state = m.save_state();
        let mut big = QuadFlash::new(FlashConfig { num_sectors: 8, ..FlashConfig::default() },
            QspiConfig::default(), None).unwrap();
        assert!(matches!(big.load_state(state), Err(Error::InvalidSaveState(_))));
    }

    #[test]
    fn test_empty_geometry_rejected() {
        let zero = FlashConfig { num_sectors: 0, ..FlashConfig::default() };
        assert!(matches!(QuadFlash::new(zero, QspiConfig::default(), None), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_file_backed_machine_writes_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flash.bin");
        let backend = FileBackend::create(&path, small().size() as u64).unwrap();
        let mut m = QuadFlash::new(small(), QspiConfig::default(), Some(Box::new(backend))).unwrap();
        m.driver().program(0x100, &[0xC3, 0x3C]).unwrap();
        m.sync().unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[0x100..0x102], &[0xC3, 0x3C]);
    }
}
