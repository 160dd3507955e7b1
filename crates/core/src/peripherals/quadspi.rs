//! STM32L4 QUADSPI controller emulation (indirect and auto-polling modes).
//!
//! Register writes are turned into byte exchanges on the attached [`SpiSlave`]
//! inside the same call. A transaction starts on a CCR, AR or DR write,
//! depending on the functional mode and on which phases are enabled (see
//! [`Quadspi::start_mode`]). Indirect reads are burst into the receive FIFO
//! in one go; indirect writes keep chip-select asserted and shift one byte per
//! DR write until DLR+1 bytes went out.
//!
//! The bus is instantaneous, so every phase finishes before the register
//! access returns. The memory-mapped window and the alternate-bytes phase are
//! reserved: configuring them is reported as an error and nothing is shifted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::spi::SpiSlave;
use crate::error::{Error, Result};
use crate::savestate::QspiState;

const LOG: &str = "quadflash::qspi";

/// Register offsets
pub const QUADSPI_CR: u32 = 0x00;
pub const QUADSPI_DCR: u32 = 0x04;
pub const QUADSPI_SR: u32 = 0x08;
pub const QUADSPI_FCR: u32 = 0x0C;
pub const QUADSPI_DLR: u32 = 0x10;
pub const QUADSPI_CCR: u32 = 0x14;
pub const QUADSPI_AR: u32 = 0x18;
pub const QUADSPI_ABR: u32 = 0x1C;
pub const QUADSPI_DR: u32 = 0x20;
pub const QUADSPI_PSMKR: u32 = 0x24;
pub const QUADSPI_PSMAR: u32 = 0x28;
pub const QUADSPI_PIR: u32 = 0x2C;

/// CR bits
pub const CR_EN: u32 = 1 << 0;
pub const CR_ABORT: u32 = 1 << 1;
pub const CR_APMS: u32 = 1 << 22;
pub const CR_PMM: u32 = 1 << 23;

/// SR bits (FCR uses the same positions for its clear bits)
pub const SR_TEF: u32 = 1 << 0;
pub const SR_TCF: u32 = 1 << 1;
pub const SR_FTF: u32 = 1 << 2;
pub const SR_SMF: u32 = 1 << 3;
pub const SR_TOF: u32 = 1 << 4;
pub const SR_BUSY: u32 = 1 << 5;
pub const SR_FLEVEL_SHIFT: u32 = 8;
pub const SR_FLEVEL_MAX: u32 = 0x1F;

/// Instruction whose 6-cycle dummy phase is shifted as one mode byte plus four fillers.
const QUAD_IO_FAST_READ: u8 = 0xEB;

/// Sets the QSPI Functional Mode. Affects the FMODE field of the CCR reg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionalMode {
    IndirectWrite = 0b00,
    IndirectRead = 0b01,
    StatusPolling = 0b10,
    MemoryMapped = 0b11,
}

/// Line usage of a phase (IMODE, ADMODE, ABMODE, DMODE fields).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LineMode {
    None = 0b00,
    Single = 0b01,
    Dual = 0b10,
    Quad = 0b11,
}

/// Address sizes used by the QSPI interface (ADSIZE field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddressSize {
    A8 = 0b00,
    A16 = 0b01,
    A24 = 0b10,
    A32 = 0b11,
}

/// Contents of a CCR write, packed with [`Ccr::bits`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ccr {
    pub instruction: u8,
    pub imode: LineMode,
    pub admode: LineMode,
    pub adsize: AddressSize,
    pub abmode: LineMode,
    pub absize: u8,
    pub dcyc: u8,
    pub dmode: LineMode,
    pub fmode: FunctionalMode,
}

impl Ccr {
    /// Instruction-only frame on a single line.
    pub fn new(instruction: u8, fmode: FunctionalMode) -> Self {
        Ccr {
            instruction,
            imode: LineMode::Single,
            admode: LineMode::None,
            adsize: AddressSize::A24,
            abmode: LineMode::None,
            absize: 0,
            dcyc: 0,
            dmode: LineMode::None,
            fmode,
        }
    }

    pub fn address(mut self, mode: LineMode, size: AddressSize) -> Self {
        self.admode = mode;
        self.adsize = size;
        self
    }

    pub fn dummy(mut self, cycles: u8) -> Self {
        self.dcyc = cycles;
        self
    }

    pub fn data(mut self, mode: LineMode) -> Self {
        self.dmode = mode;
        self
    }

    pub fn bits(&self) -> u32 {
        self.instruction as u32
            | (self.imode as u32) << 8
            | (self.admode as u32) << 10
            | (self.adsize as u32) << 12
            | (self.abmode as u32) << 14
            | ((self.absize & 0b11) as u32) << 16
            | ((self.dcyc & 0x1F) as u32) << 18
            | (self.dmode as u32) << 24
            | (self.fmode as u32) << 26
    }
}

/// Which register access launches the configured transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    OnWriteCcr,
    OnWriteAr,
    OnWriteDr,
}

/// Controller tuning that has no register.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QspiConfig {
    /// Receive FIFO capacity in bytes.
    pub fifo_capacity: usize,
    /// Clock cycles an auto-polling run may take before TOF is raised.
    pub poll_timeout_cycles: u64,
}

impl Default for QspiConfig {
    fn default() -> Self {
        QspiConfig {
            fifo_capacity: 1024 * 1024,
            poll_timeout_cycles: 1 << 20,
        }
    }
}

/// Shared abort request. Raised by a CR write with ABORT set, or by any
/// collaborator holding a clone; checked before every shifted byte.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

enum Outcome {
    Done,
    HoldCs,
    Aborted,
}

pub struct Quadspi<S: SpiSlave> {
    slave: S,
    config: QspiConfig,
    abort: AbortHandle,

    pub en: bool,
    /// Automatic poll mode stop: stop polling on first match
    pub apms: bool,
    /// Polling match mode: false = AND, true = OR
    pub pmm: bool,

    pub tcf: bool,
    pub tef: bool,
    pub smf: bool,
    pub tof: bool,
    pub busy: bool,

    pub dl: u32,
    pub instruction: u8,
    pub imode: u8,
    pub admode: u8,
    pub adsize: u8,
    pub abmode: u8,
    pub absize: u8,
    pub dcyc: u8,
    pub dmode: u8,
    pub fmode: u8,
    pub address: u32,
    pub alternate: u32,
    pub mask: u32,
    pub match_value: u32,
    pub interval: u16,

    rx_fifo: VecDeque<u8>,
    /// Indirect write left open, waiting for DR writes.
    write_open: bool,
    data_pushed: u32,

    /// Debug: bytes shifted since reset
    pub dbg_transfers: u64,
    /// Debug: chip-select assertions since reset
    pub dbg_cs_count: u64,
}

impl<S: SpiSlave> Quadspi<S> {
    pub fn new(slave: S, config: QspiConfig) -> Self {
        Quadspi {
            slave,
            config,
            abort: AbortHandle::default(),
            en: false,
            apms: false,
            pmm: false,
            tcf: false,
            tef: false,
            smf: false,
            tof: false,
            busy: false,
            dl: 0,
            instruction: 0,
            imode: 0,
            admode: 0,
            adsize: 0,
            abmode: 0,
            absize: 0,
            dcyc: 0,
            dmode: 0,
            fmode: 0,
            address: 0,
            alternate: 0,
            mask: 0,
            match_value: 0,
            interval: 0,
            rx_fifo: VecDeque::new(),
            write_open: false,
            data_pushed: 0,
            dbg_transfers: 0,
            dbg_cs_count: 0,
        }
    }

    pub fn slave(&self) -> &S {
        &self.slave
    }

    pub fn slave_mut(&mut self) -> &mut S {
        &mut self.slave
    }

    pub fn config(&self) -> &QspiConfig {
        &self.config
    }

    /// Handle for cancelling a running transaction from outside the register path.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Chip-select output: asserted only while an indirect write waits for data.
    pub fn chip_select(&self) -> bool {
        self.write_open
    }

    /// Bytes waiting in the receive FIFO.
    pub fn fifo_level(&self) -> usize {
        self.rx_fifo.len()
    }

    /// Return every register and flag to its reset value and empty the FIFO.
    pub fn reset(&mut self) {
        if self.write_open {
            self.release_cs();
        }
        self.abort.take();
        self.en = false;
        self.apms = false;
        self.pmm = false;
        self.tcf = false;
        self.tef = false;
        self.smf = false;
        self.tof = false;
        self.busy = false;
        self.dl = 0;
        self.latch_ccr(0);
        self.address = 0;
        self.alternate = 0;
        self.mask = 0;
        self.match_value = 0;
        self.interval = 0;
        self.rx_fifo.clear();
        self.data_pushed = 0;
        self.dbg_transfers = 0;
        self.dbg_cs_count = 0;
    }

    pub fn functional_mode(&self) -> Result<FunctionalMode> {
        match self.fmode {
            0b00 => Ok(FunctionalMode::IndirectWrite),
            0b01 => Ok(FunctionalMode::IndirectRead),
            0b10 => Ok(FunctionalMode::StatusPolling),
            other => Err(Error::UnsupportedFunctionalMode(other)),
        }
    }

    /// Start condition for the latched configuration.
    pub fn start_mode(&self) -> Result<StartMode> {
        match self.functional_mode()? {
            FunctionalMode::IndirectWrite | FunctionalMode::IndirectRead => {
                let read = self.fmode == FunctionalMode::IndirectRead as u8;
                if self.admode == 0 && (self.dmode == 0 || read) {
                    return Ok(StartMode::OnWriteCcr);
                }
                if self.admode != 0 && (read || self.dmode == 0) {
                    return Ok(StartMode::OnWriteAr);
                }
                Ok(StartMode::OnWriteDr)
            }
            FunctionalMode::StatusPolling => {
                if self.admode == 0 {
                    Ok(StartMode::OnWriteCcr)
                } else {
                    Ok(StartMode::OnWriteAr)
                }
            }
            FunctionalMode::MemoryMapped => Err(Error::UnsupportedFunctionalMode(self.fmode)),
        }
    }

    fn ccr_bits(&self) -> u32 {
        self.instruction as u32
            | (self.imode as u32) << 8
            | (self.admode as u32) << 10
            | (self.adsize as u32) << 12
            | (self.abmode as u32) << 14
            | (self.absize as u32) << 16
            | (self.dcyc as u32) << 18
            | (self.dmode as u32) << 24
            | (self.fmode as u32) << 26
    }

    fn latch_ccr(&mut self, v: u32) {
        self.instruction = v as u8;
        self.imode = ((v >> 8) & 0b11) as u8;
        self.admode = ((v >> 10) & 0b11) as u8;
        self.adsize = ((v >> 12) & 0b11) as u8;
        self.abmode = ((v >> 14) & 0b11) as u8;
        self.absize = ((v >> 16) & 0b11) as u8;
        self.dcyc = ((v >> 18) & 0x1F) as u8;
        self.dmode = ((v >> 24) & 0b11) as u8;
        self.fmode = ((v >> 26) & 0b11) as u8;
    }

    /// Side-effect free SR value.
    pub fn status(&self) -> u32 {
        let mut out = 0;
        if self.tef { out |= SR_TEF; }
        if self.tcf { out |= SR_TCF; }
        let ftf = match self.fmode {
            0b01 => !self.rx_fifo.is_empty(),
            0b00 => true,
            _ => false,
        };
        if ftf { out |= SR_FTF; }
        if self.smf { out |= SR_SMF; }
        if self.tof { out |= SR_TOF; }
        if self.busy { out |= SR_BUSY; }
        let level = (self.rx_fifo.len() as u32).min(SR_FLEVEL_MAX);
        out | level << SR_FLEVEL_SHIFT
    }

    // --- bus helpers ---

    fn assert_cs(&mut self) {
        self.dbg_cs_count += 1;
        self.slave.set_cs(true);
    }

    fn release_cs(&mut self) {
        self.write_open = false;
        self.slave.set_cs(false);
    }

    fn shift(&mut self, tx: u8) -> u8 {
        self.dbg_transfers += 1;
        let rx = self.slave.transfer(tx);
        log::trace!(target: LOG, "shift {:#04x} -> {:#04x}", tx, rx);
        rx
    }

    fn fail(&mut self, e: Error) -> Error {
        self.tef = true;
        log::error!(target: LOG, "qspi: {}", e);
        e
    }

    /// Finish whatever is in flight after an abort request. The FIFO is flushed.
    fn complete_abort(&mut self) {
        self.abort.take();
        if self.write_open {
            self.release_cs();
        }
        self.rx_fifo.clear();
        self.data_pushed = 0;
        self.busy = false;
        self.tcf = true;
        log::debug!(target: LOG, "abort");
    }

    // --- transactions ---

    /// Run the latched transaction. Returns `false` when it was aborted.
    fn start(&mut self) -> Result<bool> {
        let mode = match self.functional_mode() {
            Ok(mode) => mode,
            Err(e) => return Err(self.fail(e)),
        };
        if self.abmode != 0 {
            let e = Error::AlternateBytesUnsupported { mode: self.abmode };
            return Err(self.fail(e));
        }
        if self.write_open {
            // A new frame replaces an unfinished indirect write.
            self.release_cs();
        }

        match mode {
            FunctionalMode::IndirectWrite | FunctionalMode::IndirectRead => {
                self.busy = true;
                self.tcf = false;
                match self.do_transfer() {
                    Outcome::Aborted => {
                        self.release_cs();
                        self.complete_abort();
                        return Ok(false);
                    }
                    Outcome::HoldCs => {
                        self.write_open = true;
                        self.data_pushed = 0;
                    }
                    Outcome::Done => {
                        if mode == FunctionalMode::IndirectRead && !self.rx_fifo.is_empty() {
                            self.busy = true;
                        } else {
                            self.busy = false;
                            self.tcf = true;
                        }
                    }
                }
                Ok(true)
            }
            FunctionalMode::StatusPolling => Ok(self.auto_poll()),
            FunctionalMode::MemoryMapped => Err(self.fail(Error::UnsupportedFunctionalMode(self.fmode))),
        }
    }

    fn do_transfer(&mut self) -> Outcome {
        // Instruction phase
        self.assert_cs();
        log::debug!(target: LOG, "instruction: {:#04x}", self.instruction);
        let instruction = self.instruction;
        self.shift(instruction);

        // Address phase
        if self.admode != 0 {
            let nbytes = self.adsize as u32 + 1;
            log::debug!(target: LOG, "address: {:#010x} ({} bytes)", self.address, nbytes);
            for i in (0..nbytes).rev() {
                if self.abort.is_raised() {
                    return Outcome::Aborted;
                }
                let byte = (self.address >> (8 * i)) as u8;
                self.shift(byte);
            }
        }

        // Dummy-cycles phase
        if self.dcyc != 0 {
            // Quad I/O fast read: one mode byte, then 4 filler cycles.
            let count = if self.instruction == QUAD_IO_FAST_READ && self.dcyc == 6 {
                1 + 4
            } else {
                self.dcyc as u32
            };
            for _ in 0..count {
                if self.abort.is_raised() {
                    return Outcome::Aborted;
                }
                let d = self.shift(0);
                log::trace!(target: LOG, "- dummy: {:#04x}", d);
            }
        }

        // Data phase
        if self.dmode != 0 {
            if self.fmode == FunctionalMode::IndirectWrite as u8 {
                return Outcome::HoldCs;
            }
            let wanted = self.dl as u64 + 1;
            let room = self.config.fifo_capacity.saturating_sub(self.rx_fifo.len()) as u64;
            if wanted > room {
                self.tef = true;
                log::warn!(target: LOG, "read of {} bytes overflows the FIFO, only {} fit", wanted, room);
            }
            for _ in 0..wanted.min(room) {
                if self.abort.is_raised() {
                    return Outcome::Aborted;
                }
                let d = self.shift(0);
                self.rx_fifo.push_back(d);
            }
        }

        self.release_cs();
        Outcome::Done
    }

    fn poll_matches(&self, response: u32) -> bool {
        if self.pmm {
            // OR mode: any unmasked bit equal to the match value
            !(response ^ self.match_value) & self.mask != 0
        } else {
            response & self.mask == self.match_value
        }
    }

    fn auto_poll(&mut self) -> bool {
        log::debug!(target: LOG, "cmd={:#04x} wait (mask={:#x} match={:#x})",
            self.instruction, self.mask, self.match_value);
        self.busy = true;
        self.tcf = false;
        let round_cost = 5 * 8 + self.interval as u64;
        let mut elapsed = 0u64;

        self.assert_cs();
        let aborted = 'poll: loop {
            if self.abort.is_raised() {
                break 'poll true;
            }
            let instruction = self.instruction;
            self.shift(instruction);
            let mut response = 0u32;
            for i in 0..4 {
                if self.abort.is_raised() {
                    break 'poll true;
                }
                response |= (self.shift(0) as u32) << (8 * i);
            }

            if self.poll_matches(response) {
                self.smf = true;
                if self.apms {
                    log::debug!(target: LOG, "status match {:#x}", response);
                    break 'poll false;
                }
            }

            elapsed += round_cost;
            if elapsed >= self.config.poll_timeout_cycles {
                self.tof = true;
                log::warn!(target: LOG, "auto-polling timed out after {} cycles (last response {:#x})",
                    elapsed, response);
                break 'poll false;
            }
        };
        self.release_cs();
        if aborted {
            self.complete_abort();
        } else {
            self.busy = false;
        }
        !aborted
    }

    // --- register access ---

    pub fn read(&mut self, offset: u32, size: u32) -> Result<u32> {
        match offset {
            QUADSPI_CR | QUADSPI_DCR => Ok(0),
            QUADSPI_SR => Ok(self.status()),
            QUADSPI_DLR => Ok(self.dl),
            QUADSPI_CCR => Ok(self.ccr_bits()),
            QUADSPI_AR => Ok(self.address),
            QUADSPI_ABR => Ok(self.alternate),
            QUADSPI_PSMKR => Ok(self.mask),
            QUADSPI_PSMAR => Ok(self.match_value),
            QUADSPI_PIR => Ok(self.interval as u32),
            QUADSPI_DR => {
                if size != 1 {
                    return Err(Error::UnsupportedAccessSize { offset, size });
                }
                let Some(byte) = self.rx_fifo.pop_front() else {
                    log::warn!(target: LOG, "read DR with empty FIFO");
                    return Ok(0);
                };
                if self.rx_fifo.is_empty() {
                    self.busy = false;
                    self.tcf = true;
                }
                Ok(byte as u32)
            }
            _ => {
                log::warn!(target: LOG, "unimplemented device read (size {}, offset {:#x})", size, offset);
                Ok(0)
            }
        }
    }

    pub fn write(&mut self, offset: u32, value: u32, size: u32) -> Result<()> {
        match offset {
            QUADSPI_CR => {
                self.en = value & CR_EN != 0;
                self.apms = value & CR_APMS != 0;
                self.pmm = value & CR_PMM != 0;
                if value & CR_ABORT != 0 {
                    self.abort.raise();
                    self.complete_abort();
                }
                Ok(())
            }
            QUADSPI_DCR => {
                log::debug!(target: LOG, "DCR = {:#010x}", value);
                Ok(())
            }
            QUADSPI_FCR => {
                if value & SR_TEF != 0 { self.tef = false; }
                if value & SR_TCF != 0 { self.tcf = false; }
                if value & SR_SMF != 0 { self.smf = false; }
                if value & SR_TOF != 0 { self.tof = false; }
                Ok(())
            }
            QUADSPI_DLR => {
                self.dl = value;
                Ok(())
            }
            QUADSPI_CCR => {
                self.latch_ccr(value);
                let start = match self.start_mode() {
                    Ok(start) => start,
                    Err(e) => return Err(self.fail(e)),
                };
                if start == StartMode::OnWriteCcr {
                    self.start().map(|_| ())
                } else {
                    log::debug!(target: LOG, "waiting to start with cmd {:#04x}", self.instruction);
                    Ok(())
                }
            }
            QUADSPI_AR => {
                self.address = value;
                let start = match self.start_mode() {
                    Ok(start) => start,
                    Err(e) => return Err(self.fail(e)),
                };
                if start == StartMode::OnWriteAr {
                    self.start()?;
                }
                Ok(())
            }
            QUADSPI_ABR => {
                self.alternate = value;
                Ok(())
            }
            QUADSPI_DR => {
                if size != 1 {
                    return Err(Error::UnsupportedAccessSize { offset, size });
                }
                self.write_data(value as u8)
            }
            QUADSPI_PSMKR => {
                if !self.busy { self.mask = value; }
                Ok(())
            }
            QUADSPI_PSMAR => {
                if !self.busy { self.match_value = value; }
                Ok(())
            }
            QUADSPI_PIR => {
                if !self.busy { self.interval = value as u16; }
                Ok(())
            }
            _ => {
                log::warn!(target: LOG, "unimplemented device write (size {}, value {:#x}, offset {:#x})",
                    size, value, offset);
                Ok(())
            }
        }
    }

    fn write_data(&mut self, byte: u8) -> Result<()> {
        if self.fmode != FunctionalMode::IndirectWrite as u8 {
            return Err(Error::DataRegisterMisuse { op: "write", fmode: self.fmode });
        }
        if !self.write_open && self.start_mode()? == StartMode::OnWriteDr && !self.start()? {
            return Ok(());
        }
        if !self.write_open {
            return Err(Error::DataRegisterMisuse { op: "write outside a transaction", fmode: self.fmode });
        }
        if self.abort.is_raised() {
            self.complete_abort();
            return Ok(());
        }

        self.shift(byte);
        self.data_pushed += 1;
        if self.data_pushed - 1 == self.dl {
            self.tcf = true;
            self.busy = false;
            self.data_pushed = 0;
            self.release_cs();
        }
        Ok(())
    }

    pub fn save_state(&self) -> QspiState {
        QspiState {
            en: self.en,
            tcf: self.tcf,
            tef: self.tef,
            smf: self.smf,
            tof: self.tof,
            busy: self.busy,
            apms: self.apms,
            pmm: self.pmm,
            dl: self.dl,
            ccr: self.ccr_bits(),
            address: self.address,
            alternate: self.alternate,
            mask: self.mask,
            match_value: self.match_value,
            interval: self.interval,
            rx_fifo: self.rx_fifo.iter().copied().collect(),
        }
    }

    /// Restore from save state. An open indirect write is not resumed.
    pub fn load_state(&mut self, s: QspiState) {
        if self.write_open {
            self.release_cs();
        }
        self.en = s.en;
        self.tcf = s.tcf;
        self.tef = s.tef;
        self.smf = s.smf;
        self.tof = s.tof;
        self.apms = s.apms;
        self.pmm = s.pmm;
        self.dl = s.dl;
        self.latch_ccr(s.ccr);
        self.address = s.address;
        self.alternate = s.alternate;
        self.mask = s.mask;
        self.match_value = s.match_value;
        self.interval = s.interval;
        self.rx_fifo = s.rx_fifo.into();
        self.busy = s.busy && !self.rx_fifo.is_empty();
        self.data_pushed = 0;
    }
}
