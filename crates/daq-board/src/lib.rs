//! `daq-board`
//!
//! Hardware-facing half of the readout stack.
//!
//! - [`VmeBus`] / [`BusFactory`]: the vendor bus behind a trait, with a
//!   [`SimulatedBus`] for dry runs and a [`ScriptedBus`] for tests
//! - [`Digitizer`] / [`CrateController`]: board capabilities, implemented by
//!   [`V1724`] and [`V2718`]
//! - [`BoardInterface`]: pending-block queue, occupancy and clocks of one board
//! - [`Calibration`]: DC offset files

pub mod bus;
pub mod calibration;
pub mod controller;
pub mod digitizer;
pub mod interface;
pub mod registers;
pub mod scripted;
pub mod sim;

pub use bus::{BusError, BusFactory, BusRead, BusStatus, VmeBus};
pub use calibration::{Calibration, CalibrationError};
pub use controller::{CrateController, V2718};
pub use digitizer::{Digitizer, V1724};
pub use interface::{
    BoardInterface, BoardStats, BufferOccupancy, DecodeState, DrainedBatch, InterfaceState,
    BAD_BLOCK_CEILING, MIN_BLOCK_BYTES,
};
pub use scripted::{ScriptedBus, ScriptedBusFactory, ScriptedRead};
pub use sim::{SimBusFactory, SimLayout, SimParams, SimulatedBus};

use daq_core::{BoardConfig, BoardKind};

/// Open the bus for `config` and wrap it in the matching digitizer driver.
pub fn open_digitizer(
    config: &BoardConfig,
    factory: &dyn BusFactory,
) -> Result<Box<dyn Digitizer>, BusError> {
    match config.kind {
        BoardKind::V1724 => Ok(Box::new(V1724::new(config, factory.open(config)?))),
        other => Err(not_a(config, other, "digitizer")),
    }
}

/// Open the bus for `config` and wrap it in the matching controller driver.
pub fn open_controller(
    config: &BoardConfig,
    factory: &dyn BusFactory,
) -> Result<Box<dyn CrateController>, BusError> {
    match config.kind {
        BoardKind::V2718 => Ok(Box::new(V2718::new(config, factory.open(config)?))),
        other => Err(not_a(config, other, "crate controller")),
    }
}

fn not_a(config: &BoardConfig, kind: BoardKind, role: &str) -> BusError {
    BusError::Open {
        board: config.id,
        link: config.link.clone(),
        message: format!("{:?} is not a {}", kind, role),
    }
}
