//! Raw transfer blocks and decoded occurrences.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Size of one digitizer data word in bytes.
pub const WORD_BYTES: usize = 4;

/// One bus-read cycle worth of data from one board.
///
/// A `RawBlock` is deliberately not `Clone`: it is moved from the board
/// interface to exactly one worker, which consumes it while decoding.
#[derive(Debug, PartialEq, Eq)]
pub struct RawBlock {
    data: Bytes,
}

impl RawBlock {
    /// Wrap an owned transfer buffer.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    /// Build a block from 32-bit words, little-endian on the wire.
    pub fn from_words(words: &[u32]) -> Self {
        let mut data = Vec::with_capacity(words.len() * WORD_BYTES);
        for w in words {
            data.extend_from_slice(&w.to_le_bytes());
        }
        Self::new(data)
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True for a zero-length transfer.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of complete 32-bit words; a trailing partial word is ignored.
    pub fn word_count(&self) -> usize {
        self.data.len() / WORD_BYTES
    }

    /// Read word `index`. Panics if `index >= word_count()`; callers bound-check.
    #[inline]
    pub fn word(&self, index: usize) -> u32 {
        let at = index * WORD_BYTES;
        u32::from_le_bytes([
            self.data[at],
            self.data[at + 1],
            self.data[at + 2],
            self.data[at + 3],
        ])
    }

    /// Zero-copy view of words `start..end`.
    pub fn slice_words(&self, start: usize, end: usize) -> Bytes {
        self.data.slice(start * WORD_BYTES..end * WORD_BYTES)
    }

    /// Raw little-endian bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Give up the block, returning the underlying buffer.
    pub fn into_bytes(self) -> Bytes {
        self.data
    }
}

/// Total byte length of a batch of blocks.
pub fn total_bytes(blocks: &[RawBlock]) -> usize {
    blocks.iter().map(RawBlock::len).sum()
}

/// One decoded, channel-attributed, time-stamped record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occurrence {
    /// Board (module) the record came from.
    pub module_id: u32,
    /// Channel 0..7, `None` for whole-block and whole-trigger records.
    pub channel: Option<u8>,
    /// 64-bit time: `(rollover_count << 31) | hw_time`.
    pub corrected_time: u64,
    /// Sample words, LZ4-compressed when `compressed` is set.
    pub payload: Bytes,
    /// Set once `payload` has been compressed.
    pub compressed: bool,
    /// Baseline-subtracted sum of the run, when integrals are enabled.
    pub integral: Option<i64>,
    /// Trigger counter from the event header, when known.
    pub event_counter: Option<u32>,
}

impl Occurrence {
    /// Record without channel attribution (raw and block-split modes).
    pub fn whole(module_id: u32, corrected_time: u64, payload: Bytes) -> Self {
        Self {
            module_id,
            channel: None,
            corrected_time,
            payload,
            compressed: false,
            integral: None,
            event_counter: None,
        }
    }

    /// Record attributed to one channel.
    pub fn for_channel(module_id: u32, channel: u8, corrected_time: u64, payload: Bytes) -> Self {
        Self {
            channel: Some(channel),
            ..Self::whole(module_id, corrected_time, payload)
        }
    }

    /// Attach the header's trigger counter.
    pub fn with_event_counter(mut self, counter: u32) -> Self {
        self.event_counter = Some(counter);
        self
    }

    /// Attach a computed integral.
    pub fn with_integral(mut self, integral: i64) -> Self {
        self.integral = Some(integral);
        self
    }

    /// Approximate in-memory size, used for batch accounting.
    pub fn size_hint(&self) -> usize {
        self.payload.len() + std::mem::size_of::<Self>()
    }
}
