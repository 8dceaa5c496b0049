//! Bus whose block transfers follow a script, for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use daq_core::BoardConfig;
use parking_lot::Mutex;

use crate::bus::{BusError, BusFactory, BusRead, VmeBus};
use crate::registers::v1724;

/// One scripted block-transfer outcome.
#[derive(Debug, Clone)]
pub enum ScriptedRead {
    /// Data with more to follow in the same read cycle.
    Chunk(Vec<u8>),
    /// Data ending the read cycle.
    Last(Vec<u8>),
    /// Hard bus failure.
    Fail(String),
}

#[derive(Debug, Default)]
struct ScriptState {
    reads: VecDeque<ScriptedRead>,
    registers: HashMap<u32, u32>,
    writes: Vec<(u32, u32)>,
}

/// A shared, scriptable bus handle.
///
/// Clones share state, so a test can keep one clone to queue more reads and
/// inspect register writes after the other has moved into a board.
#[derive(Debug, Clone, Default)]
pub struct ScriptedBus {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedBus {
    /// A bus whose board always reports ready.
    pub fn new() -> Self {
        let bus = Self::default();
        bus.set_register(v1724::ACQUISITION_STATUS, v1724::STATUS_READY);
        bus
    }

    /// Queue one scripted transfer.
    pub fn push(&self, read: ScriptedRead) -> &Self {
        self.state.lock().reads.push_back(read);
        self
    }

    /// Queue one read cycle returning `bytes` bytes of `fill`.
    pub fn push_block(&self, bytes: usize, fill: u8) -> &Self {
        self.push(ScriptedRead::Last(vec![fill; bytes]))
    }

    /// Queue one read cycle returning `words`.
    pub fn push_words(&self, words: &[u32]) -> &Self {
        self.push(ScriptedRead::Last(
            words.iter().flat_map(|w| w.to_le_bytes()).collect(),
        ))
    }

    /// Value returned by later reads of `address`.
    pub fn set_register(&self, address: u32, value: u32) {
        self.state.lock().registers.insert(address, value);
    }

    /// Register writes seen so far, in order.
    pub fn writes(&self) -> Vec<(u32, u32)> {
        self.state.lock().writes.clone()
    }

    /// Scripted transfers not yet consumed.
    pub fn pending_reads(&self) -> usize {
        self.state.lock().reads.len()
    }
}

impl VmeBus for ScriptedBus {
    fn read_block(&mut self, address: u32, buf: &mut [u8]) -> Result<BusRead, BusError> {
        let mut state = self.state.lock();
        let Some(next) = state.reads.pop_front() else {
            return Ok(BusRead::last(0));
        };
        let (data, last) = match next {
            ScriptedRead::Chunk(data) => (data, false),
            ScriptedRead::Last(data) => (data, true),
            ScriptedRead::Fail(message) => return Err(BusError::Transfer { address, message }),
        };
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        if n < data.len() {
            let rest = data[n..].to_vec();
            state.reads.push_front(if last {
                ScriptedRead::Last(rest)
            } else {
                ScriptedRead::Chunk(rest)
            });
            return Ok(BusRead::more(n));
        }
        Ok(if last { BusRead::last(n) } else { BusRead::more(n) })
    }

    fn write_register(&mut self, address: u32, value: u32) -> Result<(), BusError> {
        let mut state = self.state.lock();
        state.writes.push((address, value));
        state.registers.insert(address, value);
        Ok(())
    }

    fn read_register(&mut self, address: u32) -> Result<u32, BusError> {
        Ok(self.state.lock().registers.get(&address).copied().unwrap_or(0))
    }
}

/// Hands out pre-registered [`ScriptedBus`] clones by board id.
#[derive(Debug, Clone, Default)]
pub struct ScriptedBusFactory {
    buses: HashMap<u32, ScriptedBus>,
}

impl ScriptedBusFactory {
    /// Factory with no buses registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a bus for `board` and return a handle to it.
    pub fn add(&mut self, board: u32) -> ScriptedBus {
        self.buses.entry(board).or_insert_with(ScriptedBus::new).clone()
    }
}

impl BusFactory for ScriptedBusFactory {
    fn open(&self, board: &BoardConfig) -> Result<Box<dyn VmeBus>, BusError> {
        self.buses
            .get(&board.id)
            .map(|bus| Box::new(bus.clone()) as Box<dyn VmeBus>)
            .ok_or_else(|| BusError::Open {
                board: board.id,
                link: board.link.clone(),
                message: "no scripted bus registered".into(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_large_read_is_split_across_transfers() {
        let mut bus = ScriptedBus::new();
        bus.push_block(10, 0xAB);
        let mut buf = [0u8; 4];
        assert_eq!(bus.read_block(0, &mut buf).unwrap(), BusRead::more(4));
        assert_eq!(bus.read_block(0, &mut buf).unwrap(), BusRead::more(4));
        assert_eq!(bus.read_block(0, &mut buf).unwrap(), BusRead::last(2));
        assert_eq!(bus.read_block(0, &mut buf).unwrap(), BusRead::last(0));
    }

    #[test]
    fn test_clones_share_state() {
        let bus = ScriptedBus::new();
        let mut moved = bus.clone();
        moved.write_register(0x8100, 4).unwrap();
        assert_eq!(bus.writes(), vec![(0x8100, 4)]);
        bus.push(ScriptedRead::Fail("bus error".into()));
        let mut buf = [0u8; 4];
        assert!(moved.read_block(0, &mut buf).is_err());
    }
}
