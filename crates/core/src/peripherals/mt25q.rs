//! Micron MT25Q serial NOR flash emulation, as wired behind the QUADSPI
//! controller. Addresses are 24-bit; the default part is 16 MB
//! (256 × 64 KB sectors, 256-byte pages).
//!
//! Supported commands:
//! - 0x66 / 0x99: Reset Enable / Reset (Reset only right after Reset Enable)
//! - 0x06 / 0x04: Write Enable / Write Disable
//! - 0x61 / 0x65: Write / Read Enhanced Volatile Configuration Register
//! - 0x05: Read Status Register (busy bit clears itself after one read)
//! - 0x70: Read Flag Status Register
//! - 0x0B / 0x0D: Fast Read (addr24 + dummy bytes, then continuous read)
//! - 0xAF: Read ID → 20 BB 19
//! - 0x02: Page Program (addr24 + data, bits only go 1 → 0)
//! - 0x20 / 0xD8: Erase 4 KB subsector / 64 KB block
//! - 0x75 / 0x7A: Erase Suspend / Resume
//! - 0xB9 / 0xAB: Deep Power-Down / Release
//! - 0x35: Enter Quad I/O

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use super::spi::SpiSlave;
use crate::error::{Error, Result};
use crate::savestate::Mt25qState;
use crate::storage::BlockBackend;

const LOG: &str = "quadflash::mt25q";
const LOG_BITFLIP: &str = "quadflash::mt25q::bitflip";

pub mod opcodes {
    pub const READ_EVCR: u8 = 0x65;
    pub const WRITE_EVCR: u8 = 0x61;

    pub const RESET_ENABLE: u8 = 0x66;
    pub const RESET: u8 = 0x99;

    pub const WRITE_ENABLE: u8 = 0x06;
    pub const WRITE_DISABLE: u8 = 0x04;

    pub const READ_STATUS_REG: u8 = 0x05;
    pub const READ_FLAG_STATUS_REG: u8 = 0x70;

    pub const FAST_READ: u8 = 0x0B;
    pub const FAST_READ_DDR: u8 = 0x0D;
    pub const READ_QID: u8 = 0xAF;

    pub const PAGE_PROGRAM: u8 = 0x02;

    /// Erase 4 KB subsector
    pub const ERASE_SUBSECTOR: u8 = 0x20;
    /// Erase 64 KB block
    pub const ERASE_BLOCK: u8 = 0xD8;

    pub const ERASE_SUSPEND: u8 = 0x75;
    pub const ERASE_RESUME: u8 = 0x7A;

    pub const DEEP_SLEEP: u8 = 0xB9;
    pub const WAKE: u8 = 0xAB;

    pub const QUAD_ENABLE: u8 = 0x35;
}

use opcodes::*;

bitflags! {
    /// Status register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status: u8 {
        const BUSY = 1 << 0;
        const WRITE_ENABLE = 1 << 1;
    }
}

bitflags! {
    /// Flag status register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FlagStatus: u8 {
        const ERASE_SUSPEND = 1 << 6;
        /// Program/erase controller ready. Reported as the inverse of BUSY.
        const READY = 1 << 7;
    }
}

/// Geometry and identity of the emulated part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Bytes returned by Read ID (0xAF).
    pub id: [u8; 3],
    pub sector_size: u32,
    pub num_sectors: u32,
    pub page_size: u32,
    pub subsector_size: u32,
    /// Filler bytes the part expects between a Fast Read address and its data.
    pub fast_read_dummy_bytes: u8,
}

impl Default for FlashConfig {
    fn default() -> Self {
        FlashConfig {
            id: [0x20, 0xBB, 0x19],
            sector_size: 64 * 1024,
            num_sectors: 256,
            page_size: 256,
            subsector_size: 4 * 1024,
            fast_read_dummy_bytes: 8,
        }
    }
}

/// Largest array reachable with 3-byte addressing.
pub const MAX_FLASH_SIZE: u32 = 1 << 24;

impl FlashConfig {
    /// Array capacity in bytes. Saturates for geometry that [`validate`](Self::validate) rejects.
    pub fn size(&self) -> u32 {
        self.sector_size.saturating_mul(self.num_sectors)
    }

    /// Reject geometry the array model cannot address.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("page size", self.page_size),
            ("subsector size", self.subsector_size),
            ("sector size", self.sector_size),
        ] {
            if !value.is_power_of_two() {
                return Err(Error::InvalidConfig(format!("{} {:#x} is not a power of two", name, value)));
            }
        }
        if self.num_sectors == 0 {
            return Err(Error::InvalidConfig("flash needs at least one sector".into()));
        }
        match self.sector_size.checked_mul(self.num_sectors) {
            Some(size) if size <= MAX_FLASH_SIZE => Ok(()),
            _ => Err(Error::InvalidConfig(format!(
                "{} sectors of {:#x} bytes exceed {:#x} bytes",
                self.num_sectors, self.sector_size, MAX_FLASH_SIZE
            ))),
        }
    }
}

/// Register targeted by a pending register read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    Evcr,
    Status,
    FlagStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    /// Gathering `needed` argument bytes for `cmd_in_progress`.
    CollectingCommandData { needed: u8 },
    /// Page Program data phase. `protected` transactions swallow their data.
    Writing { protected: bool },
    /// Fast Read data phase, after `dummy` more filler bytes.
    Reading { dummy: u8 },
    ReadingIdentification { pos: u8 },
    ReadingRegister(Register),
}

pub struct Mt25q {
    config: FlashConfig,
    data: Vec<u8>,
    backend: Option<Box<dyn BlockBackend>>,
    dirty_page: Option<u64>,

    evcr: u8,
    status: Status,
    flag_status: FlagStatus,

    pub state: State,
    cmd_in_progress: u8,
    cmd_data: [u8; 4],
    pos: usize,
    current_address: u64,
    /// Bits cleared from the next register read (set by erase so BUSY is seen once).
    register_read_mask: u8,
    reset_enabled: bool,

    deep_sleep: bool,
    quad_enabled: bool,
}

impl Mt25q {
    /// Build the device. With a backend the whole image is read in; without
    /// one the array lives in RAM, erased to 0xFF.
    pub fn new(config: FlashConfig, backend: Option<Box<dyn BlockBackend>>) -> Result<Self> {
        let Some(mut backend) = backend else {
            log::debug!(target: LOG, "no backing image, binding to RAM");
            return Self::volatile(config);
        };
        config.validate()?;
        let size = config.size() as u64;
        let actual = backend.size();
        if actual < size {
            return Err(Error::StorageSize { expected: size, actual });
        }
        log::debug!(target: LOG, "binding to backing image ({} bytes)", actual);
        let mut data = vec![0u8; size as usize];
        backend.read(0, &mut data)?;
        Ok(Self::with_data(config, data, Some(backend)))
    }

    /// RAM-only device.
    pub fn volatile(config: FlashConfig) -> Result<Self> {
        config.validate()?;
        let data = vec![0xFF; config.size() as usize];
        Ok(Self::with_data(config, data, None))
    }

    fn with_data(config: FlashConfig, data: Vec<u8>, backend: Option<Box<dyn BlockBackend>>) -> Self {
        Mt25q {
            config,
            data,
            backend,
            dirty_page: None,
            evcr: 0,
            status: Status::empty(),
            flag_status: FlagStatus::empty(),
            state: State::Idle,
            cmd_in_progress: 0,
            cmd_data: [0; 4],
            pos: 0,
            current_address: 0,
            register_read_mask: 0,
            reset_enabled: false,
            deep_sleep: false,
            quad_enabled: false,
        }
    }

    pub fn config(&self) -> &FlashConfig {
        &self.config
    }

    /// Working copy of the array.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn flag_status(&self) -> FlagStatus {
        self.flag_status
    }

    pub fn evcr(&self) -> u8 {
        self.evcr
    }

    pub fn is_deep_sleep(&self) -> bool {
        self.deep_sleep
    }

    pub fn is_quad_enabled(&self) -> bool {
        self.quad_enabled
    }

    /// Copy `bin` into the array at `offset`, clipped to the array end.
    /// Bypasses NOR programming rules; the touched range is written back.
    pub fn load_data_at(&mut self, bin: &[u8], offset: usize) {
        if offset >= self.data.len() {
            return;
        }
        let end = (offset + bin.len()).min(self.data.len());
        self.data[offset..end].copy_from_slice(&bin[..end - offset]);
        self.sync_area(offset as u64, (end - offset) as u64);
    }

    /// Power-on / system reset. The array is kept, a pending dirty page is flushed.
    pub fn reset(&mut self) {
        self.sync_dirty(None);
        self.soft_reset();
        self.reset_enabled = false;
        self.deep_sleep = false;
    }

    fn soft_reset(&mut self) {
        self.evcr = 0;
        self.status = Status::empty();
        self.flag_status = FlagStatus::empty();
        self.register_read_mask = 0;
        self.state = State::Idle;
        self.pos = 0;
        self.quad_enabled = false;
    }

    /// Flush a pending dirty page. Called before any external snapshot.
    pub fn before_snapshot(&mut self) {
        self.sync_dirty(None);
    }

    /// Flush the dirty page and wait for the backend to settle.
    pub fn sync(&mut self) -> Result<()> {
        self.sync_dirty(None);
        if let Some(backend) = self.backend.as_mut() {
            backend.flush()?;
        }
        Ok(())
    }

    // --- backing store ---

    fn sync_page(&mut self, page: u64) {
        let page_size = self.config.page_size as u64;
        self.sync_area(page * page_size, page_size);
    }

    fn sync_area(&mut self, offset: u64, len: u64) {
        let Some(backend) = self.backend.as_mut() else { return };
        if backend.is_read_only() {
            return;
        }
        let start = offset as usize;
        let end = (start + len as usize).min(self.data.len());
        if start < end {
            backend.write_async(offset, self.data[start..end].to_vec());
        }
    }

    fn sync_dirty(&mut self, new_page: Option<u64>) {
        if let Some(dirty) = self.dirty_page {
            if Some(dirty) != new_page {
                self.sync_page(dirty);
                self.dirty_page = new_page;
            }
        }
    }

    // --- command decoding ---

    fn collect(&mut self, needed: u8) {
        self.pos = 0;
        self.state = State::CollectingCommandData { needed };
    }

    fn command_address(&self) -> u64 {
        ((self.cmd_data[0] as u64) << 16) | ((self.cmd_data[1] as u64) << 8) | self.cmd_data[2] as u64
    }

    fn decode_new_cmd(&mut self, value: u8) -> Result<()> {
        self.cmd_in_progress = value;
        log::debug!(target: LOG, "decoding new command: {:#04x}", value);

        let result = match value {
            RESET_ENABLE => Ok(()),
            RESET => {
                if self.reset_enabled {
                    log::debug!(target: LOG, "software reset");
                    self.soft_reset();
                    Ok(())
                } else {
                    Err(Error::UnarmedReset)
                }
            }

            WRITE_ENABLE => {
                self.status.insert(Status::WRITE_ENABLE);
                Ok(())
            }
            WRITE_DISABLE => {
                self.status.remove(Status::WRITE_ENABLE);
                Ok(())
            }

            WRITE_EVCR => {
                self.collect(1);
                Ok(())
            }
            READ_EVCR => {
                self.state = State::ReadingRegister(Register::Evcr);
                Ok(())
            }
            READ_STATUS_REG => {
                self.state = State::ReadingRegister(Register::Status);
                Ok(())
            }
            READ_FLAG_STATUS_REG => {
                self.state = State::ReadingRegister(Register::FlagStatus);
                Ok(())
            }

            FAST_READ | FAST_READ_DDR | PAGE_PROGRAM | ERASE_SUBSECTOR | ERASE_BLOCK => {
                self.collect(3);
                Ok(())
            }

            READ_QID => {
                self.state = State::ReadingIdentification { pos: 0 };
                Ok(())
            }

            ERASE_SUSPEND => {
                self.flag_status.insert(FlagStatus::ERASE_SUSPEND);
                Ok(())
            }
            ERASE_RESUME => {
                self.flag_status.remove(FlagStatus::ERASE_SUSPEND);
                Ok(())
            }

            DEEP_SLEEP => {
                self.deep_sleep = true;
                Ok(())
            }
            WAKE => {
                self.deep_sleep = false;
                Ok(())
            }

            QUAD_ENABLE => {
                self.quad_enabled = true;
                Ok(())
            }

            _ => Err(Error::UnknownOpcode(value)),
        };

        self.reset_enabled = value == RESET_ENABLE;
        result
    }

    fn handle_cmd_data(&mut self) -> Result<()> {
        self.state = State::Idle;

        match self.cmd_in_progress {
            WRITE_EVCR => {
                self.evcr = self.cmd_data[0];
                self.current_address = 0;
                Ok(())
            }
            PAGE_PROGRAM => {
                self.current_address = self.command_address();
                let protected = !self.status.contains(Status::WRITE_ENABLE);
                self.state = State::Writing { protected };
                if protected {
                    Err(Error::WriteProtected("page program"))
                } else {
                    log::debug!(target: LOG, "program from {:#08x}", self.current_address);
                    Ok(())
                }
            }
            FAST_READ | FAST_READ_DDR => {
                self.current_address = self.command_address() % self.data.len() as u64;
                log::debug!(target: LOG, "read from {:#08x}", self.current_address);
                self.state = State::Reading { dummy: self.config.fast_read_dummy_bytes };
                Ok(())
            }
            ERASE_SUBSECTOR | ERASE_BLOCK => {
                self.current_address = self.command_address();
                self.erase(self.current_address, self.cmd_in_progress)?;
                self.status.insert(Status::BUSY);
                self.register_read_mask = Status::BUSY.bits();
                Ok(())
            }
            other => Err(Error::UnknownOpcode(other)),
        }
    }

    fn erase(&mut self, offset: u64, cmd: u8) -> Result<()> {
        let len = match cmd {
            ERASE_BLOCK => self.config.sector_size as u64,
            _ => self.config.subsector_size as u64,
        };
        let start = offset & !(len - 1);
        log::debug!(target: LOG, "erase offset = {:#x}, len = {}", start, len);

        if !self.status.contains(Status::WRITE_ENABLE) {
            return Err(Error::WriteProtected("erase"));
        }
        if start + len > self.data.len() as u64 {
            return Err(Error::WriteOutOfBounds(offset));
        }

        self.data[start as usize..(start + len) as usize].fill(0xFF);
        self.sync_area(start, len);
        Ok(())
    }

    fn write8(&mut self, value: u8) {
        let addr = self.current_address;
        let page = addr / self.config.page_size as u64;

        let current = self.data[addr as usize];
        if value & !current != 0 {
            log::warn!(target: LOG_BITFLIP,
                "flipping bit from 0 => 1 (addr={:#x}, value={:#04x}, current={:#04x})", addr, value, current);
        }
        // A bit that is already 0 stays 0.
        self.data[addr as usize] = value & current;
        log::trace!(target: LOG, "write {:#04x} = {:#x}", value & current, addr);

        self.sync_dirty(Some(page));
        self.dirty_page = Some(page);
    }

    /// One byte exchange. Protocol errors leave the device usable and are
    /// returned instead of the response byte.
    pub fn exchange(&mut self, tx: u8) -> Result<u8> {
        match self.state {
            State::CollectingCommandData { needed } => {
                log::trace!(target: LOG, "collected: {:#04x}", tx);
                self.cmd_data[self.pos] = tx;
                self.pos += 1;
                if self.pos == needed as usize {
                    self.handle_cmd_data()?;
                }
                Ok(0)
            }
            State::Writing { protected: true } => Ok(0),
            State::Writing { protected: false } => {
                if self.current_address >= self.data.len() as u64 {
                    return Err(Error::WriteOutOfBounds(self.current_address));
                }
                self.write8(tx);
                self.current_address += 1;
                Ok(0)
            }
            State::Reading { dummy } if dummy > 0 => {
                self.state = State::Reading { dummy: dummy - 1 };
                Ok(0)
            }
            State::Reading { .. } => {
                let r = self.data[self.current_address as usize];
                log::trace!(target: LOG, "read {:#x} = {:#04x}", self.current_address, r);
                self.current_address = (self.current_address + 1) % self.data.len() as u64;
                Ok(r)
            }
            State::ReadingIdentification { pos } => {
                let r = self.config.id[pos as usize];
                log::debug!(target: LOG, "read QID {:#04x} (pos {})", r, pos);
                self.state = if pos as usize + 1 == self.config.id.len() {
                    State::Idle
                } else {
                    State::ReadingIdentification { pos: pos + 1 }
                };
                Ok(r)
            }
            State::ReadingRegister(reg) => {
                let r = self.register(reg);
                let mask = self.register_read_mask;
                match reg {
                    Register::Evcr => self.evcr &= !mask,
                    Register::Status => self.status = Status::from_bits_retain(self.status.bits() & !mask),
                    Register::FlagStatus => {
                        self.flag_status = FlagStatus::from_bits_retain(self.flag_status.bits() & !mask)
                    }
                }
                self.register_read_mask = 0;
                self.state = State::Idle;
                log::trace!(target: LOG, "read register {:?} = {:#04x}", reg, r);
                Ok(r)
            }
            State::Idle => {
                self.decode_new_cmd(tx)?;
                Ok(0)
            }
        }
    }

    fn register(&self, reg: Register) -> u8 {
        match reg {
            Register::Evcr => self.evcr,
            Register::Status => self.status.bits(),
            Register::FlagStatus => {
                let mut flags = self.flag_status;
                flags.set(FlagStatus::READY, !self.status.contains(Status::BUSY));
                flags.bits()
            }
        }
    }

    /// Capture state for save state. The parser state is not kept.
    pub fn save_state(&self) -> Mt25qState {
        Mt25qState {
            data: self.data.clone(),
            status: self.status.bits(),
            flag_status: self.flag_status.bits(),
            evcr: self.evcr,
            register_read_mask: self.register_read_mask,
            reset_enabled: self.reset_enabled,
            deep_sleep: self.deep_sleep,
            quad_enabled: self.quad_enabled,
        }
    }

    /// Restore from save state. The restored array is written back in full.
    pub fn load_state(&mut self, s: Mt25qState) -> Result<()> {
        if s.data.len() != self.data.len() {
            return Err(Error::InvalidSaveState(format!(
                "flash holds {} bytes, save state has {}",
                self.data.len(),
                s.data.len()
            )));
        }
        self.data = s.data;
        self.status = Status::from_bits_retain(s.status);
        self.flag_status = FlagStatus::from_bits_retain(s.flag_status);
        self.evcr = s.evcr;
        self.register_read_mask = s.register_read_mask;
        self.reset_enabled = s.reset_enabled;
        self.deep_sleep = s.deep_sleep;
        self.quad_enabled = s.quad_enabled;
        self.state = State::Idle;
        self.pos = 0;
        self.dirty_page = None;
        self.sync_area(0, self.data.len() as u64);
        Ok(())
    }
}

/// Log level for a protocol error seen on the bus. Opcode 0x00 is the filler a
/// status poll clocks in after the register byte, so it stays at debug.
fn severity(e: &Error) -> log::Level {
    match e {
        Error::UnarmedReset => log::Level::Error,
        Error::UnknownOpcode(0x00) => log::Level::Debug,
        _ => log::Level::Warn,
    }
}

impl SpiSlave for Mt25q {
    fn transfer(&mut self, tx: u8) -> u8 {
        match self.exchange(tx) {
            Ok(r) => r,
            Err(e) => {
                log::log!(target: LOG, severity(&e), "MT25Q: {}", e);
                0
            }
        }
    }

    fn set_cs(&mut self, asserted: bool) {
        if !asserted {
            self.pos = 0;
            self.state = State::Idle;
            self.sync_dirty(None);
        }
        log::trace!(target: LOG, "CS {}", if asserted { "LOW" } else { "HIGH" });
    }
}
