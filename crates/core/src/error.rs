//! Error type shared by the controller, the flash device and the storage layer.
//!
//! Every condition the hardware would treat as a guest mistake is reported
//! here instead of aborting the emulator. Callers on the register path get
//! an `Err` back and the peripheral stays usable.

use thiserror::Error;

/// Errors raised by the QUADSPI flash path.
#[derive(Debug, Error)]
pub enum Error {
    /// A register was accessed with a width it does not support.
    #[error("unsupported {size}-byte access at register offset {offset:#05x}")]
    UnsupportedAccessSize { offset: u32, size: u32 },

    /// The alternate-bytes phase is configured but not modelled.
    #[error("alternate-bytes phase (ABMODE={mode:#04b}) is not supported")]
    AlternateBytesUnsupported { mode: u8 },

    /// Functional mode outside indirect-write, indirect-read and auto-polling.
    #[error("functional mode {0:#04b} is not supported (memory-mapped mode is reserved)")]
    UnsupportedFunctionalMode(u8),

    /// Access into an address range that is reserved and not emulated.
    #[error("access to reserved address {0:#010x}")]
    ReservedRegion(u32),

    /// Address outside every window the machine decodes.
    #[error("unmapped address {0:#010x}")]
    Unmapped(u32),

    /// Data register used while the functional mode does not allow it.
    #[error("data register {op} while functional mode is {fmode:#04b}")]
    DataRegisterMisuse { op: &'static str, fmode: u8 },

    /// A transaction left TCF clear or BUSY set when it should have finished.
    #[error("{0} did not complete")]
    Incomplete(&'static str),

    /// Auto-polling gave up before the status matched.
    #[error("status polling timed out waiting for {0}")]
    PollTimeout(&'static str),

    /// Reset opcode received without a Reset-Enable directly before it.
    #[error("reset issued without reset-enable")]
    UnarmedReset,

    /// Program or erase while the write-enable latch is clear.
    #[error("{0} with write protect")]
    WriteProtected(&'static str),

    /// Program past the end of the array.
    #[error("out of bounds flash write to {0:#x}")]
    WriteOutOfBounds(u64),

    /// Opcode not in the device command set.
    #[error("unknown command {0:#04x}")]
    UnknownOpcode(u8),

    /// Flash geometry the array model cannot represent.
    #[error("invalid flash geometry: {0}")]
    InvalidConfig(String),

    /// Backing image is smaller than the flash array.
    #[error("backing image holds {actual} bytes, flash needs {expected}")]
    StorageSize { expected: u64, actual: u64 },

    /// Backing store I/O failure.
    #[error("storage I/O: {0}")]
    Io(#[from] std::io::Error),

    /// Save state file rejected while loading.
    #[error("invalid save state: {0}")]
    InvalidSaveState(String),

    /// Save state (de)serialization failure.
    #[error("save state encoding: {0}")]
    Encoding(#[from] bincode::Error),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;
