//! Crate controller capability and the V2718 implementation.
//!
//! When a controller is configured, runs are started and stopped through one
//! of its front-panel outputs, fanned out to every digitizer's S-IN, so all
//! boards start on the same clock edge.

use daq_core::BoardConfig;
use tracing::debug;

use crate::bus::{BusError, VmeBus};
use crate::registers::v2718;

/// What the run control needs from the crate controller.
pub trait CrateController: Send {
    /// Configured id.
    fn id(&self) -> u32;

    /// Clear outputs and apply the configured register list.
    fn configure(&mut self, config: &BoardConfig) -> Result<(), BusError>;

    /// Raise the run output, starting all armed digitizers at once.
    fn start_run(&mut self) -> Result<(), BusError>;

    /// Clear the run output.
    fn stop_run(&mut self) -> Result<(), BusError>;
}

/// CAEN V2718 VME-PCI bridge.
pub struct V2718 {
    id: u32,
    base: u32,
    bus: Box<dyn VmeBus>,
}

impl V2718 {
    /// Controller at `config.base_address` on `bus`.
    pub fn new(config: &BoardConfig, bus: Box<dyn VmeBus>) -> Self {
        Self {
            id: config.id,
            base: config.base_address,
            bus,
        }
    }
}

impl CrateController for V2718 {
    fn id(&self) -> u32 {
        self.id
    }

    fn configure(&mut self, config: &BoardConfig) -> Result<(), BusError> {
        self.bus
            .write_register(self.base.wrapping_add(v2718::OUTPUT_CLEAR), v2718::RUN_OUTPUT)?;
        for reg in &config.registers {
            self.bus.write_register(self.base.wrapping_add(reg.address), reg.value)?;
        }
        Ok(())
    }

    fn start_run(&mut self) -> Result<(), BusError> {
        debug!(controller = self.id, "Raising run output");
        self.bus
            .write_register(self.base.wrapping_add(v2718::OUTPUT_SET), v2718::RUN_OUTPUT)
    }

    fn stop_run(&mut self) -> Result<(), BusError> {
        debug!(controller = self.id, "Clearing run output");
        self.bus
            .write_register(self.base.wrapping_add(v2718::OUTPUT_CLEAR), v2718::RUN_OUTPUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::ScriptedBus;
    use daq_core::BoardKind;

    #[test]
    fn test_run_output_pulses() {
        let bus = ScriptedBus::new();
        let config = BoardConfig {
            kind: BoardKind::V2718,
            ..BoardConfig::digitizer(9)
        };
        let mut controller = V2718::new(&config, Box::new(bus.clone()));
        controller.configure(&config).unwrap();
        controller.start_run().unwrap();
        controller.stop_run().unwrap();
        let writes = bus.writes();
        assert_eq!(
            writes,
            vec![
                (v2718::OUTPUT_CLEAR, v2718::RUN_OUTPUT),
                (v2718::OUTPUT_SET, v2718::RUN_OUTPUT),
                (v2718::OUTPUT_CLEAR, v2718::RUN_OUTPUT),
            ]
        );
    }
}
