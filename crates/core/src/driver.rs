//! Guest-side flash driver.
//!
//! Talks to the MT25Q only through QUADSPI register accesses, in the order
//! firmware would issue them: program DLR, then CCR, then AR, then move data
//! through DR, and wait on SR flags. Completion flags are cleared through FCR
//! after every transaction so each step observes its own TCF.

use crate::error::{Error, Result};
use crate::peripherals::mt25q::opcodes::*;
use crate::peripherals::quadspi::*;
use crate::peripherals::{FlashConfig, SpiSlave};

/// Register interface of a QUADSPI block, addressed by offset from its base.
pub trait RegisterBus {
    fn read_register(&mut self, offset: u32, size: u32) -> Result<u32>;
    fn write_register(&mut self, offset: u32, value: u32, size: u32) -> Result<()>;
}

impl<S: SpiSlave> RegisterBus for Quadspi<S> {
    fn read_register(&mut self, offset: u32, size: u32) -> Result<u32> {
        self.read(offset, size)
    }

    fn write_register(&mut self, offset: u32, value: u32, size: u32) -> Result<()> {
        self.write(offset, value, size)
    }
}

/// Largest single indirect read issued by [`FlashDriver::read`].
const READ_CHUNK: usize = 64 * 1024;
/// Polling interval programmed into PIR, in controller cycles.
const POLL_INTERVAL: u32 = 0x10;

/// Erase granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseSize {
    /// 4 KB subsector
    Subsector,
    /// 64 KB sector
    Sector,
}

pub struct FlashDriver<'a, B: RegisterBus + ?Sized> {
    bus: &'a mut B,
    page_size: u32,
    dummy_cycles: u8,
}

impl<'a, B: RegisterBus + ?Sized> FlashDriver<'a, B> {
    pub fn new(bus: &'a mut B, config: &FlashConfig) -> Self {
        FlashDriver {
            bus,
            page_size: config.page_size,
            dummy_cycles: config.fast_read_dummy_bytes,
        }
    }

    fn status(&mut self) -> Result<u32> {
        self.bus.read_register(QUADSPI_SR, 4)
    }

    /// Check if the controller is currently busy with a transaction
    pub fn is_busy(&mut self) -> Result<bool> {
        Ok(self.status()? & SR_BUSY != 0)
    }

    /// Abort whatever is left over (an undrained FIFO, an open write).
    fn idle(&mut self) -> Result<()> {
        if self.is_busy()? {
            log::debug!(target: "quadflash::driver", "controller busy, aborting");
            self.bus.write_register(QUADSPI_CR, CR_ABORT, 4)?;
        }
        self.bus.write_register(QUADSPI_FCR, SR_TEF | SR_TCF | SR_SMF | SR_TOF, 4)
    }

    fn configure(&mut self, len: usize, ccr: Ccr) -> Result<()> {
        self.idle()?;
        if len > 0 {
            self.bus.write_register(QUADSPI_DLR, len as u32 - 1, 4)?;
        }
        self.bus.write_register(QUADSPI_CCR, ccr.bits(), 4)
    }

    fn expect_complete(&mut self, what: &'static str) -> Result<()> {
        let sr = self.status()?;
        if sr & SR_TCF == 0 || sr & SR_BUSY != 0 {
            return Err(Error::Incomplete(what));
        }
        self.bus.write_register(QUADSPI_FCR, SR_TCF, 4)
    }

    /// Instruction-only command (Write Enable, Reset Enable, ...).
    pub fn command(&mut self, instruction: u8) -> Result<()> {
        self.configure(0, Ccr::new(instruction, FunctionalMode::IndirectWrite))?;
        self.expect_complete("command")
    }

    fn read_data(&mut self, ccr: Ccr, address: Option<u32>, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        self.configure(buf.len(), ccr)?;
        if let Some(address) = address {
            self.bus.write_register(QUADSPI_AR, address, 4)?;
        }
        for byte in buf.iter_mut() {
            *byte = self.bus.read_register(QUADSPI_DR, 1)? as u8;
        }
        self.expect_complete("indirect read")
    }

    pub fn read_id(&mut self) -> Result<[u8; 3]> {
        let mut id = [0u8; 3];
        let ccr = Ccr::new(READ_QID, FunctionalMode::IndirectRead).data(LineMode::Single);
        self.read_data(ccr, None, &mut id)?;
        Ok(id)
    }

    fn read_register_byte(&mut self, instruction: u8) -> Result<u8> {
        let mut value = [0u8; 1];
        let ccr = Ccr::new(instruction, FunctionalMode::IndirectRead).data(LineMode::Single);
        self.read_data(ccr, None, &mut value)?;
        Ok(value[0])
    }

    pub fn read_status(&mut self) -> Result<u8> {
        self.read_register_byte(READ_STATUS_REG)
    }

    pub fn read_flag_status(&mut self) -> Result<u8> {
        self.read_register_byte(READ_FLAG_STATUS_REG)
    }

    pub fn read_evcr(&mut self) -> Result<u8> {
        self.read_register_byte(READ_EVCR)
    }

    pub fn write_evcr(&mut self, value: u8) -> Result<()> {
        let ccr = Ccr::new(WRITE_EVCR, FunctionalMode::IndirectWrite).data(LineMode::Single);
        self.write_data(ccr, None, &[value])
    }

    /// Fast Read into `buf`, split into FIFO-sized indirect reads.
    pub fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        let ccr = Ccr::new(FAST_READ, FunctionalMode::IndirectRead)
            .address(LineMode::Single, AddressSize::A24)
            .dummy(self.dummy_cycles)
            .data(LineMode::Quad);
        let mut address = address;
        for chunk in buf.chunks_mut(READ_CHUNK) {
            self.read_data(ccr, Some(address), chunk)?;
            address = address.wrapping_add(chunk.len() as u32);
        }
        Ok(())
    }

    fn write_data(&mut self, ccr: Ccr, address: Option<u32>, data: &[u8]) -> Result<()> {
        self.configure(data.len(), ccr)?;
        if let Some(address) = address {
            self.bus.write_register(QUADSPI_AR, address, 4)?;
        }
        for &byte in data {
            self.bus.write_register(QUADSPI_DR, byte as u32, 1)?;
        }
        self.expect_complete("indirect write")
    }

    pub fn write_enable(&mut self) -> Result<()> {
        self.command(WRITE_ENABLE)
    }

    pub fn write_disable(&mut self) -> Result<()> {
        self.command(WRITE_DISABLE)
    }

    /// Program `data` starting at `address`, one page program per page touched.
    pub fn program(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let mut address = address;
        let mut rest = data;
        while !rest.is_empty() {
            let room = (self.page_size - address % self.page_size) as usize;
            let (chunk, tail) = rest.split_at(room.min(rest.len()));
            self.write_enable()?;
            let ccr = Ccr::new(PAGE_PROGRAM, FunctionalMode::IndirectWrite)
                .address(LineMode::Single, AddressSize::A24)
                .data(LineMode::Quad);
            self.write_data(ccr, Some(address), chunk)?;
            self.wait_ready("page program")?;
            address = address.wrapping_add(chunk.len() as u32);
            rest = tail;
        }
        Ok(())
    }

    pub fn erase(&mut self, size: EraseSize, address: u32) -> Result<()> {
        let instruction = match size {
            EraseSize::Subsector => ERASE_SUBSECTOR,
            EraseSize::Sector => ERASE_BLOCK,
        };
        self.write_enable()?;
        let ccr = Ccr::new(instruction, FunctionalMode::IndirectWrite).address(LineMode::Single, AddressSize::A24);
        self.configure(0, ccr)?;
        self.bus.write_register(QUADSPI_AR, address, 4)?;
        self.expect_complete("erase")?;
        self.wait_ready("erase")
    }

    /// Auto-poll Read Status until BUSY reads back clear.
    pub fn wait_ready(&mut self, what: &'static str) -> Result<()> {
        self.idle()?;
        self.bus.write_register(QUADSPI_PSMKR, 0x01, 4)?;
        self.bus.write_register(QUADSPI_PSMAR, 0x00, 4)?;
        self.bus.write_register(QUADSPI_PIR, POLL_INTERVAL, 4)?;
        self.bus.write_register(QUADSPI_CR, CR_EN | CR_APMS, 4)?;
        self.bus.write_register(QUADSPI_DLR, 0, 4)?;
        let ccr = Ccr::new(READ_STATUS_REG, FunctionalMode::StatusPolling).data(LineMode::Single);
        self.bus.write_register(QUADSPI_CCR, ccr.bits(), 4)?;

        let sr = self.status()?;
        self.bus.write_register(QUADSPI_FCR, SR_SMF | SR_TOF | SR_TCF, 4)?;
        if sr & SR_SMF == 0 {
            return Err(Error::PollTimeout(what));
        }
        Ok(())
    }

    /// Software reset: Reset Enable directly followed by Reset.
    pub fn reset(&mut self) -> Result<()> {
        self.command(RESET_ENABLE)?;
        self.command(RESET)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peripherals::Mt25q;

    fn config() -> FlashConfig {
        FlashConfig { num_sectors: 4, ..FlashConfig::default() }
    }

    fn controller() -> Quadspi<Mt25q> {
        Quadspi::new(Mt25q::volatile(config()).unwrap(), QspiConfig::default())
    }

    #[test]
    fn test_read_id() {
        let mut q = controller();
        let id = FlashDriver::new(&mut q, &config()).read_id().unwrap();
        assert_eq!(id, [0x20, 0xBB, 0x19]);
    }

    #[test]
    fn test_program_across_pages_and_read_back() {
        let mut q = controller();
        let data: Vec<u8> = (0..600u32).map(|i| (i * 7) as u8).collect();
        {
            let mut drv = FlashDriver::new(&mut q, &config());
            drv.program(0x00F0, &data).unwrap();
            let mut back = vec![0u8; data.len()];
            drv.read(0x00F0, &mut back).unwrap();
            assert_eq!(back, data);
        }
        assert_eq!(&q.slave().data()[0x00F0..0x00F0 + 600], &data[..]);
        assert_eq!(q.slave().data()[0x00EF], 0xFF);
    }

    #[test]
    fn test_erase_restores_ones() {
        let mut q = controller();
        let mut drv = FlashDriver::new(&mut q, &config());
        drv.program(0x1800, &[0x00; 32]).unwrap();
        drv.erase(EraseSize::Subsector, 0x1800).unwrap();
        let mut back = [0u8; 32];
        drv.read(0x1800, &mut back).unwrap();
        assert_eq!(back, [0xFF; 32]);
        assert_eq!(drv.read_status().unwrap() & 0x01, 0);
    }

    #[test]
    fn test_evcr_and_reset() {
        let mut q = controller();
        let mut drv = FlashDriver::new(&mut q, &config());
        drv.write_evcr(0xAF).unwrap();
        assert_eq!(drv.read_evcr().unwrap(), 0xAF);
        drv.reset().unwrap();
        assert_eq!(drv.read_evcr().unwrap(), 0x00);
    }

    #[test]
    fn test_write_enable_latch_visible_in_status() {
        let mut q = controller();
        let mut drv = FlashDriver::new(&mut q, &config());
        drv.write_enable().unwrap();
        assert_eq!(drv.read_status().unwrap() & 0x02, 0x02);
        drv.write_disable().unwrap();
        assert_eq!(drv.read_status().unwrap() & 0x02, 0x00);
        assert_eq!(drv.read_flag_status().unwrap() & 0x80, 0x80);
    }

    #[test]
    fn test_read_after_undrained_burst() {
        let mut q = controller();
        q.slave_mut().load_data_at(&[0xA1, 0xA2, 0xA3, 0xA4], 0x1000);
        let ccr = Ccr::new(READ_QID, FunctionalMode::IndirectRead).data(LineMode::Single);
        q.write(QUADSPI_DLR, 2, 4).unwrap();
        q.write(QUADSPI_CCR, ccr.bits(), 4).unwrap();
        q.write(QUADSPI_CR, CR_ABORT, 4).unwrap();

        let mut drv = FlashDriver::new(&mut q, &config());
        let mut buf = [0u8; 4];
        drv.read(0x1000, &mut buf).unwrap();
        assert_eq!(buf, [0xA1, 0xA2, 0xA3, 0xA4]);

        // left busy without an explicit abort: the driver aborts it itself
        drop(drv);
        q.write(QUADSPI_DLR, 2, 4).unwrap();
        q.write(QUADSPI_CCR, ccr.bits(), 4).unwrap();
        q.read(QUADSPI_DR, 1).unwrap();
        let mut drv = FlashDriver::new(&mut q, &config());
        drv.read(0x1002, &mut buf[..2]).unwrap();
        assert_eq!(buf[..2], [0xA3, 0xA4]);
        assert_eq!(q.fifo_level(), 0);
    }

    #[test]
    fn test_addresses_near_top_of_range_wrap() {
        let mut q = controller();
        let top = config().size() as usize - 16;
        q.slave_mut().load_data_at(&[0x11; 16], top);
        q.slave_mut().load_data_at(&[0x22; 16], 0);

        let mut drv = FlashDriver::new(&mut q, &config());
        let mut buf = vec![0u8; 0x20000];
        drv.read(0xFFFF_FFF0, &mut buf).unwrap();
        assert_eq!(buf[..16], [0x11; 16]);
        assert_eq!(buf[16..32], [0x22; 16]);
        assert!(buf[32..].iter().all(|&b| b == 0xFF));

        drv.program(0xFFFF_FFF8, &[0x00; 16]).unwrap();
        drop(drv);
        assert_eq!(q.slave().data()[..8], [0x00; 8]);
        assert_eq!(q.slave().data()[8..16], [0x22; 8]);
    }

    #[test]
    fn test_wait_ready_times_out_on_stuck_status() {
        struct Stuck;
        impl SpiSlave for Stuck {
            fn transfer(&mut self, _tx: u8) -> u8 {
                0x01
            }
            fn set_cs(&mut self, _asserted: bool) {}
        }
        let mut q = Quadspi::new(Stuck, QspiConfig { poll_timeout_cycles: 1000, ..QspiConfig::default() });
        let mut drv = FlashDriver::new(&mut q, &config());
        assert!(matches!(drv.wait_ready("erase"), Err(Error::PollTimeout("erase"))));
        assert!(!drv.is_busy().unwrap());
    }
}
