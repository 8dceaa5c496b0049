//! VME bus access.
//!
//! The vendor driver is reached through [`VmeBus`]; one handle is opened per
//! board by a [`BusFactory`]. Block transfers copy data from the board's
//! output buffer into caller memory and report whether the board has more.

use daq_core::BoardConfig;
use thiserror::Error;

/// Errors reported by a bus handle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The link to the board could not be opened.
    #[error("Failed to open link '{link}' for board {board}: {message}")]
    Open {
        board: u32,
        link: String,
        message: String,
    },

    /// A block transfer failed.
    #[error("Block transfer at 0x{address:08x} failed: {message}")]
    Transfer { address: u32, message: String },

    /// A register read or write failed.
    #[error("Register access at 0x{address:08x} failed: {message}")]
    Register { address: u32, message: String },

    /// The board did not reach the expected state in time.
    #[error("Timed out waiting for {what}")]
    Timeout { what: String },
}

/// What the board reported at the end of a block transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusStatus {
    /// The transfer filled the buffer; more data may follow.
    Success,
    /// The board's output buffer is now empty.
    NoMoreData,
}

/// Result of one block transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusRead {
    /// Bytes written to the front of the caller's buffer.
    pub bytes: usize,
    /// Whether the board has more data queued.
    pub status: BusStatus,
}

impl BusRead {
    /// A transfer after which the board still has data.
    pub fn more(bytes: usize) -> Self {
        Self {
            bytes,
            status: BusStatus::Success,
        }
    }

    /// The final transfer of a readout.
    pub fn last(bytes: usize) -> Self {
        Self {
            bytes,
            status: BusStatus::NoMoreData,
        }
    }

    /// Whether the reader should stop issuing transfers.
    pub fn is_last(&self) -> bool {
        self.status == BusStatus::NoMoreData || self.bytes == 0
    }
}

/// One open bus handle.
pub trait VmeBus: Send {
    /// Block transfer from `address` into `buf`.
    fn read_block(&mut self, address: u32, buf: &mut [u8]) -> Result<BusRead, BusError>;

    /// Single-word register write.
    fn write_register(&mut self, address: u32, value: u32) -> Result<(), BusError>;

    /// Single-word register read.
    fn read_register(&mut self, address: u32) -> Result<u32, BusError>;
}

/// Opens bus handles for configured boards.
pub trait BusFactory: Send + Sync {
    /// Open the bus for `board`, at its link and crate number.
    fn open(&self, board: &BoardConfig) -> Result<Box<dyn VmeBus>, BusError>;
}
