//! QUADSPI bus peripherals.
//!
//! - [`SpiSlave`]: serial transfer primitive between controller and target
//! - [`Quadspi`]: STM32L4 QUADSPI host controller (register file, FIFO, auto-polling)
//! - [`Mt25q`]: Micron MT25Q NOR flash on the far end of the bus

pub mod spi;
pub mod mt25q;
pub mod quadspi;

pub use spi::SpiSlave;
pub use mt25q::{FlashConfig, Mt25q};
pub use quadspi::{AbortHandle, Ccr, FunctionalMode, QspiConfig, Quadspi};
