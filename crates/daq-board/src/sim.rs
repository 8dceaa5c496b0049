//! Simulated V1724 boards for dry runs.
//!
//! A [`SimulatedBus`] behaves like one digitizer behind a VME link: it keeps a
//! register file, produces triggers at a fixed rate while the acquisition run
//! bit is set, and hands the encoded records out through block transfers. The
//! 31-bit trigger clock runs freely, so long runs exercise rollover handling.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use daq_core::{BoardConfig, ProcessingConfig, ProcessingMode, HW_TIME_MASK};
use daq_decoder::synth::{self, LegacyEvent, NewFirmwareEvent, ZleEvent, ZleRun};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::bus::{BusError, BusFactory, BusRead, VmeBus};
use crate::registers::v1724;

/// Record layout produced by the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimLayout {
    /// Stock firmware, whole channel waveforms.
    Legacy,
    /// Stock firmware with zero-length encoding.
    Zle,
    /// Per-channel length and time header pairs.
    NewFirmware,
}

impl SimLayout {
    /// Layout matching what the pipeline is configured to decode.
    pub fn for_processing(processing: &ProcessingConfig) -> Self {
        match processing.mode {
            ProcessingMode::ChannelSplitNewFirmware => Self::NewFirmware,
            _ if processing.zero_length_encoding => Self::Zle,
            _ => Self::Legacy,
        }
    }
}

/// Parameters shared by all simulated boards.
#[derive(Debug, Clone, Copy)]
pub struct SimParams {
    /// Record layout written to the event buffer.
    pub layout: SimLayout,
    /// Mean trigger rate per board.
    pub trigger_rate_hz: f64,
    /// Sample words per channel and trigger.
    pub words_per_channel: usize,
    /// Cap on triggers produced per poll, bounds memory if the reader stalls.
    pub max_burst: usize,
}

impl Default for SimParams {
    fn default() -> Self {
        Self {
            layout: SimLayout::Legacy,
            trigger_rate_hz: 1000.0,
            words_per_channel: 32,
            max_burst: 10_000,
        }
    }
}

/// Opens a [`SimulatedBus`] for every board.
#[derive(Debug, Clone, Default)]
pub struct SimBusFactory {
    params: SimParams,
}

impl SimBusFactory {
    /// Factory handing every board the same parameters.
    pub fn new(params: SimParams) -> Self {
        Self { params }
    }
}

impl BusFactory for SimBusFactory {
    fn open(&self, board: &BoardConfig) -> Result<Box<dyn VmeBus>, BusError> {
        if board.link != "sim" {
            return Err(BusError::Open {
                board: board.id,
                link: board.link.clone(),
                message: "only 'sim' links can be simulated".into(),
            });
        }
        debug!(board = board.id, layout = ?self.params.layout, "Opened simulated bus");
        Ok(Box::new(SimulatedBus::new(board, self.params)))
    }
}

/// One simulated board.
pub struct SimulatedBus {
    base: u32,
    geo: u8,
    params: SimParams,
    registers: HashMap<u32, u32>,
    rng: StdRng,
    output: Vec<u8>,
    read_pos: usize,
    event_counter: u32,
    clock: u32,
    last_poll: Option<Instant>,
    owed: f64,
}

impl SimulatedBus {
    /// Idle board; triggers start once the run bit is written.
    pub fn new(board: &BoardConfig, params: SimParams) -> Self {
        let mut registers = HashMap::new();
        registers.insert(
            board.base_address.wrapping_add(v1724::ACQUISITION_STATUS),
            v1724::STATUS_READY,
        );
        Self {
            base: board.base_address,
            geo: (board.id & 0x1F) as u8,
            params,
            registers,
            rng: StdRng::seed_from_u64(u64::from(board.id)),
            output: Vec::new(),
            read_pos: 0,
            event_counter: 0,
            clock: 0,
            last_poll: None,
            owed: 0.0,
        }
    }

    fn register(&self, offset: u32) -> u32 {
        self.registers.get(&self.base.wrapping_add(offset)).copied().unwrap_or(0)
    }

    fn running(&self) -> bool {
        self.register(v1724::ACQUISITION_CONTROL) & v1724::ACQ_RUN != 0
    }

    fn channel_mask(&self) -> u8 {
        (self.register(v1724::CHANNEL_ENABLE_MASK) & 0xFF) as u8
    }

    fn clear_output(&mut self) {
        self.output.clear();
        self.read_pos = 0;
    }

    /// Triggers owed since the previous poll.
    fn due_triggers(&mut self) -> usize {
        let now = Instant::now();
        let elapsed = self
            .last_poll
            .map_or(Duration::ZERO, |last| now.duration_since(last));
        self.last_poll = Some(now);
        self.owed += elapsed.as_secs_f64() * self.params.trigger_rate_hz;
        let due = (self.owed.floor() as usize).min(self.params.max_burst);
        self.owed -= self.owed.floor();
        due
    }

    fn generate(&mut self) {
        let mask = self.channel_mask();
        for _ in 0..self.due_triggers() {
            self.clock = self.clock.wrapping_add(self.rng.gen_range(1_000..200_000)) & HW_TIME_MASK;
            self.event_counter = self.event_counter.wrapping_add(1) & 0x00FF_FFFF;
            let words = self.encode_event(mask);
            for w in words {
                self.output.extend_from_slice(&w.to_le_bytes());
            }
        }
    }

    fn encode_event(&mut self, mask: u8) -> Vec<u32> {
        let words = self.params.words_per_channel;
        match self.params.layout {
            SimLayout::Legacy => {
                let mut event = LegacyEvent::uniform(mask, self.event_counter, self.clock, words);
                event.board_geo = self.geo;
                event.encode()
            }
            SimLayout::Zle => {
                let channels = (0..mask.count_ones())
                    .map(|_| {
                        let lead = self.rng.gen_range(1..words.max(2) as u32);
                        vec![
                            ZleRun::Skip(lead),
                            ZleRun::Data(synth::pulse_words(words, self.event_counter)),
                            ZleRun::Skip(self.rng.gen_range(1..64)),
                        ]
                    })
                    .collect();
                ZleEvent {
                    channel_mask: mask,
                    event_counter: self.event_counter,
                    trigger_time: self.clock,
                    channels,
                }
                .encode()
            }
            SimLayout::NewFirmware => {
                let channels: Vec<(u32, usize)> = (0..mask.count_ones())
                    .map(|_| {
                        let jitter = self.rng.gen_range(0..16);
                        ((self.clock + jitter) & HW_TIME_MASK, words)
                    })
                    .collect();
                NewFirmwareEvent::uniform(mask, self.event_counter, self.clock, &channels).encode()
            }
        }
    }
}

impl VmeBus for SimulatedBus {
    fn read_block(&mut self, address: u32, buf: &mut [u8]) -> Result<BusRead, BusError> {
        if address != self.base.wrapping_add(v1724::EVENT_READOUT_BUFFER) {
            return Err(BusError::Transfer {
                address,
                message: "not a readout buffer address".into(),
            });
        }
        if self.read_pos == self.output.len() {
            self.clear_output();
            if self.running() {
                self.generate();
            }
        }
        let available = self.output.len() - self.read_pos;
        let n = available.min(buf.len());
        buf[..n].copy_from_slice(&self.output[self.read_pos..self.read_pos + n]);
        self.read_pos += n;
        if self.read_pos == self.output.len() {
            Ok(BusRead::last(n))
        } else {
            Ok(BusRead::more(n))
        }
    }

    fn write_register(&mut self, address: u32, value: u32) -> Result<(), BusError> {
        let offset = address.wrapping_sub(self.base);
        match offset {
            v1724::SOFTWARE_RESET => {
                let status = self.base.wrapping_add(v1724::ACQUISITION_STATUS);
                self.registers.retain(|&a, _| a == status);
                self.clear_output();
                self.clock = 0;
                self.event_counter = 0;
            }
            v1724::SOFTWARE_CLEAR => self.clear_output(),
            v1724::ACQUISITION_CONTROL => {
                let was_running = self.running();
                self.registers.insert(address, value);
                if !was_running && self.running() {
                    self.last_poll = Some(Instant::now());
                    self.owed = 0.0;
                }
            }
            _ => {
                self.registers.insert(address, value);
            }
        }
        Ok(())
    }

    fn read_register(&mut self, address: u32) -> Result<u32, BusError> {
        Ok(self.registers.get(&address).copied().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daq_core::RawBlock;
    use daq_decoder::split_blocks;

    fn board() -> BoardConfig {
        BoardConfig {
            base_address: 0x3210_0000,
            ..BoardConfig::digitizer(5)
        }
    }

    fn drain(bus: &mut SimulatedBus) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; 4096];
        loop {
            let read = bus.read_block(0x3210_0000, &mut buf).unwrap();
            out.extend_from_slice(&buf[..read.bytes]);
            if read.is_last() {
                return out;
            }
        }
    }

    #[test]
    fn test_idle_board_has_no_data() {
        let mut bus = SimulatedBus::new(&board(), SimParams::default());
        assert!(drain(&mut bus).is_empty());
    }

    #[test]
    fn test_running_board_produces_decodable_records() {
        let params = SimParams {
            trigger_rate_hz: 100_000.0,
            ..SimParams::default()
        };
        let mut bus = SimulatedBus::new(&board(), params);
        bus.write_register(0x3210_0000 + v1724::CHANNEL_ENABLE_MASK, 0b0101).unwrap();
        bus.write_register(0x3210_0000 + v1724::ACQUISITION_CONTROL, v1724::ACQ_RUN).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        let data = drain(&mut bus);
        assert!(!data.is_empty());
        let records = split_blocks(vec![RawBlock::new(data)]);
        assert!(!records.is_empty());
        assert!(records.iter().all(|r| r.header.channel_mask == 0b0101));
        assert!(records.iter().all(|r| r.header.board_geo == 5));
    }

    #[test]
    fn test_wrong_address_fails() {
        let mut bus = SimulatedBus::new(&board(), SimParams::default());
        let mut buf = [0u8; 16];
        assert!(bus.read_block(0, &mut buf).is_err());
    }

    #[test]
    fn test_factory_rejects_real_links() {
        let factory = SimBusFactory::default();
        let mut config = board();
        config.link = "a4818:0".into();
        assert!(matches!(factory.open(&config), Err(BusError::Open { board: 5, .. })));
    }

    #[test]
    fn test_layout_follows_processing() {
        let mut processing = ProcessingConfig::default();
        assert_eq!(SimLayout::for_processing(&processing), SimLayout::Legacy);
        processing.zero_length_encoding = true;
        assert_eq!(SimLayout::for_processing(&processing), SimLayout::Zle);
        processing.mode = ProcessingMode::ChannelSplitNewFirmware;
        assert_eq!(SimLayout::for_processing(&processing), SimLayout::NewFirmware);
    }
}
