//! Record layout of the V1724 data stream.
//!
//! Every trigger produces one record starting with a four-word header:
//!
//! ```text
//! word 0  [31:20] 0xA00   [15:0] record size in words (header included)
//! word 1  [31:27] geo id  [7:0]  channel-present mask
//! word 2  [23:0]  event counter
//! word 3  [30:0]  trigger time tag
//! ```

use daq_core::{RawBlock, HW_TIME_MASK};
use tracing::trace;

/// Bits 31..20 of a header word.
pub const HEADER_PATTERN: u32 = 0xA00;
/// Shift bringing the pattern bits down.
pub const HEADER_SHIFT: u32 = 20;
/// Header length in words.
pub const HEADER_WORDS: usize = 4;
/// Record size field of the first header word.
pub const RECORD_SIZE_MASK: u32 = 0xFFFF;
/// Trigger counter field of the third header word.
pub const EVENT_COUNTER_MASK: u32 = 0x00FF_FFFF;

/// Channels per board.
pub const CHANNELS: u8 = 8;

/// Top nibble of a ZLE control word announcing a run of real samples.
pub const ZLE_DATA_TAG: u32 = 0x8;
/// Shift bringing the control tag down.
pub const ZLE_TAG_SHIFT: u32 = 28;
/// Run length, in words, of a control word.
pub const ZLE_LENGTH_MASK: u32 = 0x0FFF_FFFF;

/// New-firmware channel lengths must lie in `(MIN, MAX]` words.
pub const NEW_FW_MIN_CHANNEL_WORDS: u32 = 2;
/// Upper bound, see [`NEW_FW_MIN_CHANNEL_WORDS`].
pub const NEW_FW_MAX_CHANNEL_WORDS: u32 = 100_000;

/// Whether `word` carries the header pattern.
#[inline]
pub fn is_header(word: u32) -> bool {
    word >> HEADER_SHIFT == HEADER_PATTERN
}

/// Parsed trigger header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHeader {
    /// Record length in words, header included.
    pub size_words: usize,
    /// Channels present in the record.
    pub channel_mask: u8,
    /// Geographical address of the board.
    pub board_geo: u8,
    /// 24-bit trigger counter.
    pub event_counter: u32,
    /// 31-bit trigger time tag.
    pub trigger_time: u32,
}

impl EventHeader {
    /// Parse the header at word `at`, if one starts there and fits in the block.
    pub fn parse(block: &RawBlock, at: usize) -> Option<Self> {
        if at + HEADER_WORDS > block.word_count() || !is_header(block.word(at)) {
            return None;
        }
        let mask_word = block.word(at + 1);
        Some(Self {
            size_words: (block.word(at) & RECORD_SIZE_MASK) as usize,
            channel_mask: (mask_word & 0xFF) as u8,
            board_geo: (mask_word >> 27) as u8,
            event_counter: block.word(at + 2) & EVENT_COUNTER_MASK,
            trigger_time: block.word(at + 3) & HW_TIME_MASK,
        })
    }

    /// Number of channels present in this record.
    pub fn channel_count(&self) -> u32 {
        self.channel_mask.count_ones()
    }

    /// Channel indices present, ascending.
    pub fn channels(&self) -> impl Iterator<Item = u8> {
        let mask = self.channel_mask;
        (0..CHANNELS).filter(move |ch| mask >> ch & 1 == 1)
    }
}

/// Iterator over the well-formed records of one block.
///
/// Words that are not headers are skipped one at a time. A header whose size
/// is too small to hold itself, or which runs past the end of the block, is
/// treated as a stray word and skipped the same way.
pub struct RecordWalker<'a> {
    block: &'a RawBlock,
    idx: usize,
}

impl<'a> RecordWalker<'a> {
    /// Walk `block` from its first word.
    pub fn new(block: &'a RawBlock) -> Self {
        Self { block, idx: 0 }
    }
}

impl Iterator for RecordWalker<'_> {
    /// Start word of the record and its header.
    type Item = (usize, EventHeader);

    fn next(&mut self) -> Option<Self::Item> {
        let count = self.block.word_count();
        while self.idx < count {
            let at = self.idx;
            let Some(header) = EventHeader::parse(self.block, at) else {
                self.idx += 1;
                continue;
            };
            if header.size_words < HEADER_WORDS || at + header.size_words > count {
                trace!(
                    word = at,
                    size = header.size_words,
                    "Header size out of bounds, skipping word"
                );
                self.idx += 1;
                continue;
            }
            self.idx = at + header.size_words;
            return Some((at, header));
        }
        None
    }
}

/// Trigger time of the first record in `block`.
pub fn first_header_time(block: &RawBlock) -> Option<u32> {
    RecordWalker::new(block).next().map(|(_, h)| h.trigger_time)
}

/// Trigger times of all records in `block`, in stream order.
pub fn header_times(block: &RawBlock) -> impl Iterator<Item = u32> + '_ {
    RecordWalker::new(block).map(|(_, h)| h.trigger_time)
}
