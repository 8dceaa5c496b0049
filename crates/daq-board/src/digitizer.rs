//! Digitizer capability and the V1724 implementation.

use std::thread;
use std::time::{Duration, Instant};

use daq_core::BoardConfig;
use tracing::{debug, trace};

use crate::bus::{BusError, BusRead, VmeBus};
use crate::registers::v1724;

/// Poll period while waiting for a board to report ready.
const READY_POLL: Duration = Duration::from_millis(1);

/// What the readout needs from a digitizer board.
pub trait Digitizer: Send {
    /// Configured board id.
    fn id(&self) -> u32;

    /// Software reset, back to power-on register values.
    fn reset(&mut self) -> Result<(), BusError>;

    /// Apply the channel mask and the configured register list.
    fn program(&mut self, config: &BoardConfig) -> Result<(), BusError>;

    /// Write per-channel DC offsets.
    fn set_dac_offsets(&mut self, dac: &[u16; 8]) -> Result<(), BusError>;

    /// Block until the board accepts triggers.
    fn wait_ready(&mut self, timeout: Duration) -> Result<(), BusError>;

    /// Set the run bit in the acquisition control register.
    fn start_acquisition(&mut self) -> Result<(), BusError>;

    /// Clear the run bit.
    fn stop_acquisition(&mut self) -> Result<(), BusError>;

    /// One block transfer from the event readout buffer.
    fn read_block(&mut self, buf: &mut [u8]) -> Result<BusRead, BusError>;
}

/// CAEN V1724, 8 channels, 14 bit, 100 MS/s.
pub struct V1724 {
    id: u32,
    base: u32,
    bus: Box<dyn VmeBus>,
}

impl V1724 {
    /// Board at `config.base_address` on `bus`.
    pub fn new(config: &BoardConfig, bus: Box<dyn VmeBus>) -> Self {
        Self {
            id: config.id,
            base: config.base_address,
            bus,
        }
    }

    fn write(&mut self, offset: u32, value: u32) -> Result<(), BusError> {
        trace!(board = self.id, offset = format_args!("0x{:04x}", offset), value, "Register write");
        self.bus.write_register(self.base.wrapping_add(offset), value)
    }

    fn read(&mut self, offset: u32) -> Result<u32, BusError> {
        self.bus.read_register(self.base.wrapping_add(offset))
    }
}

impl Digitizer for V1724 {
    fn id(&self) -> u32 {
        self.id
    }

    fn reset(&mut self) -> Result<(), BusError> {
        self.write(v1724::SOFTWARE_RESET, 1)
    }

    fn program(&mut self, config: &BoardConfig) -> Result<(), BusError> {
        self.write(v1724::CHANNEL_ENABLE_MASK, u32::from(config.channel_mask))?;
        for reg in &config.registers {
            self.write(reg.address, reg.value)?;
        }
        debug!(
            board = self.id,
            registers = config.registers.len(),
            mask = format_args!("0x{:02x}", config.channel_mask),
            "Programmed board"
        );
        Ok(())
    }

    fn set_dac_offsets(&mut self, dac: &[u16; 8]) -> Result<(), BusError> {
        for (channel, value) in (0u8..).zip(dac.iter()) {
            self.write(v1724::channel_dac(channel), u32::from(*value))?;
        }
        Ok(())
    }

    fn wait_ready(&mut self, timeout: Duration) -> Result<(), BusError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.read(v1724::ACQUISITION_STATUS)? & v1724::STATUS_READY != 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(BusError::Timeout {
                    what: format!("board {} ready", self.id),
                });
            }
            thread::sleep(READY_POLL);
        }
    }

    fn start_acquisition(&mut self) -> Result<(), BusError> {
        let control = self.read(v1724::ACQUISITION_CONTROL)?;
        self.write(v1724::ACQUISITION_CONTROL, control | v1724::ACQ_RUN)
    }

    fn stop_acquisition(&mut self) -> Result<(), BusError> {
        let control = self.read(v1724::ACQUISITION_CONTROL)?;
        self.write(v1724::ACQUISITION_CONTROL, control & !v1724::ACQ_RUN)
    }

    fn read_block(&mut self, buf: &mut [u8]) -> Result<BusRead, BusError> {
        self.bus
            .read_block(self.base.wrapping_add(v1724::EVENT_READOUT_BUFFER), buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::ScriptedBus;
    use daq_core::RegisterSetting;

    #[test]
    fn test_program_and_dac() {
        let bus = ScriptedBus::new();
        let mut config = BoardConfig::digitizer(1);
        config.channel_mask = 0x0F;
        config.registers.push(RegisterSetting {
            address: 0x8000,
            value: 0x10,
        });
        let mut board = V1724::new(&config, Box::new(bus.clone()));
        board.program(&config).unwrap();
        board.set_dac_offsets(&[0x1000; 8]).unwrap();

        let writes = bus.writes();
        assert_eq!(writes[0], (v1724::CHANNEL_ENABLE_MASK, 0x0F));
        assert_eq!(writes[1], (0x8000, 0x10));
        assert_eq!(writes[2], (0x1098, 0x1000));
        assert_eq!(writes[9], (0x1798, 0x1000));
    }

    #[test]
    fn test_start_stop_toggle_run_bit() {
        let bus = ScriptedBus::new();
        bus.set_register(v1724::ACQUISITION_CONTROL, 0x1);
        let mut board = V1724::new(&BoardConfig::digitizer(1), Box::new(bus.clone()));
        board.start_acquisition().unwrap();
        board.stop_acquisition().unwrap();
        assert_eq!(
            bus.writes(),
            vec![
                (v1724::ACQUISITION_CONTROL, 0x5),
                (v1724::ACQUISITION_CONTROL, 0x1)
            ]
        );
    }

    #[test]
    fn test_base_address_near_top_of_range_wraps() {
        let bus = ScriptedBus::new();
        let config = BoardConfig {
            base_address: 0xFFFF_F000,
            ..BoardConfig::digitizer(2)
        };
        let mut board = V1724::new(&config, Box::new(bus.clone()));
        board.start_acquisition().unwrap();
        let expected = 0xFFFF_F000u32.wrapping_add(v1724::ACQUISITION_CONTROL);
        assert_eq!(bus.writes(), vec![(expected, v1724::ACQ_RUN)]);
    }

    #[test]
    fn test_wait_ready_times_out() {
        let bus = ScriptedBus::new();
        bus.set_register(v1724::ACQUISITION_STATUS, 0);
        let mut board = V1724::new(&BoardConfig::digitizer(3), Box::new(bus));
        let err = board.wait_ready(Duration::from_millis(5)).unwrap_err();
        assert!(matches!(err, BusError::Timeout { .. }));
    }
}
