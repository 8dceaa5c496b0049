use bytes::Bytes;
use daq_core::RawBlock;

use crate::format::{EventHeader, RecordWalker};

/// One trigger record cut out of a transfer block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    /// Parsed header of the record.
    pub header: EventHeader,
    /// The whole record, header included.
    pub data: Bytes,
}

/// Re-slice concatenated transfer blocks into one buffer per trigger.
///
/// Empty blocks are dropped. Records are returned in stream order; the output
/// buffers share the input allocations, which the caller gives up by value.
pub fn split_blocks(blocks: Vec<RawBlock>) -> Vec<EventRecord> {
    let mut records = Vec::new();
    for block in blocks.into_iter().filter(|b| !b.is_empty()) {
        for (start, header) in RecordWalker::new(&block) {
            records.push(EventRecord {
                header,
                data: block.slice_words(start, start + header.size_words),
            });
        }
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::{self, LegacyEvent};

    #[test]
    fn test_split_concatenated_records() {
        let first = LegacyEvent::uniform(0b11, 1, 1000, 4).encode();
        let second = LegacyEvent::uniform(0b1, 2, 2000, 2).encode();
        let third = LegacyEvent::uniform(0b1000_0000, 3, 3000, 1).encode();

        let blocks = vec![
            synth::to_block(&[first.clone(), second.clone()]),
            RawBlock::new(Vec::new()),
            synth::to_block(&[third.clone()]),
        ];
        let records = split_blocks(blocks);

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].data.len(), first.len() * 4);
        assert_eq!(records[1].header.trigger_time, 2000);
        assert_eq!(records[2].header.channel_mask, 0b1000_0000);
        assert_eq!(records[2].data.len(), third.len() * 4);
    }

    #[test]
    fn test_garbage_between_records_is_skipped() {
        let mut words = vec![0xFFFF_FFFF];
        words.extend(LegacyEvent::uniform(0b1, 9, 77, 3).encode());
        words.push(0x0000_0001);
        words.extend(LegacyEvent::uniform(0b1, 10, 78, 3).encode());
        let records = split_blocks(vec![RawBlock::from_words(&words)]);
        let times: Vec<u32> = records.iter().map(|r| r.header.trigger_time).collect();
        assert_eq!(times, vec![77, 78]);
    }

    #[test]
    fn test_empty_input() {
        assert!(split_blocks(Vec::new()).is_empty());
        assert!(split_blocks(vec![RawBlock::new(Vec::new())]).is_empty());
    }
}
