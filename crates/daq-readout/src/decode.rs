//! Turning a drained batch into occurrences.

use bytes::Bytes;
use daq_board::{DecodeState, DrainedBatch};
use daq_core::{ClockState, ClockStep, Occurrence, ProcessingConfig, ProcessingMode};
use daq_decoder::{
    first_header_time, integrate, split_blocks, split_channels_legacy,
    split_channels_new_firmware, ChannelSplit, RecordWalker,
};
use tracing::debug;

/// What one batch produced.
#[derive(Debug, Default)]
pub struct DecodedBatch {
    /// Occurrences in stream order.
    pub occurrences: Vec<Occurrence>,
    /// Trigger records seen.
    pub records: u64,
    /// Regions the channel decoders skipped.
    pub anomalies: u64,
    /// Backward time steps that were not rollovers.
    pub clock_anomalies: u64,
}

impl DecodedBatch {
    fn stamp(&mut self, clock: &mut ClockState, hw_time: u32, board: u32, channel: Option<u8>) -> u64 {
        let (time, step) = clock.correct(hw_time);
        if let ClockStep::Backward { by } = step {
            self.clock_anomalies += 1;
            debug!(board, ?channel, by, "Time moved backwards");
        }
        time
    }
}

/// Decode `batch` according to the processing mode.
///
/// `state` must be the board's decode state, held for the whole call so that
/// channel clocks see batches in enqueue order.
pub fn decode_batch(
    batch: DrainedBatch,
    state: &mut DecodeState,
    processing: &ProcessingConfig,
) -> DecodedBatch {
    let board = batch.board;
    let seed = batch.start_clock();
    let mut out = DecodedBatch {
        records: batch
            .blocks
            .iter()
            .map(|b| RecordWalker::new(b).count() as u64)
            .sum(),
        ..DecodedBatch::default()
    };

    match processing.mode {
        ProcessingMode::Raw => {
            let mut clock = seed;
            for block in batch.blocks.into_iter().filter(|b| !b.is_empty()) {
                let time = match first_header_time(&block) {
                    Some(t) => out.stamp(&mut clock, t, board, None),
                    None => clock.compose(clock.last_hw_time()),
                };
                let occ = Occurrence::whole(board, time, block.into_bytes());
                out.occurrences.push(finish(occ, processing));
            }
        }
        ProcessingMode::BlockSplit => {
            let mut clock = seed;
            for record in split_blocks(batch.blocks) {
                let time = out.stamp(&mut clock, record.header.trigger_time, board, None);
                let occ = Occurrence::whole(board, time, record.data)
                    .with_event_counter(record.header.event_counter);
                out.occurrences.push(finish(occ, processing));
            }
        }
        ProcessingMode::ChannelSplitLegacy | ProcessingMode::ChannelSplitNewFirmware => {
            let split = if processing.mode == ProcessingMode::ChannelSplitLegacy {
                split_channels_legacy(batch.blocks, processing.zero_length_encoding)
            } else {
                split_channels_new_firmware(batch.blocks)
            };
            channel_occurrences(&mut out, split, state, seed, board, processing);
        }
    }
    out
}

fn channel_occurrences(
    out: &mut DecodedBatch,
    split: ChannelSplit,
    state: &mut DecodeState,
    seed: ClockState,
    board: u32,
    processing: &ProcessingConfig,
) {
    out.anomalies = split.anomalies.len() as u64;
    out.occurrences.reserve(split.fragments.len());
    for fragment in split.fragments {
        let clock = state.channel_clock(fragment.channel, seed);
        let time = out.stamp(clock, fragment.hw_time(), board, Some(fragment.channel));
        let mut occ = Occurrence::for_channel(board, fragment.channel, time, fragment.payload)
            .with_event_counter(fragment.event_counter);
        if processing.compute_integral {
            let integral = integrate(&occ.payload);
            occ = occ.with_integral(integral);
        }
        out.occurrences.push(finish(occ, processing));
    }
}

/// Apply payload compression if configured.
fn finish(mut occ: Occurrence, processing: &ProcessingConfig) -> Occurrence {
    if processing.compress {
        occ.payload = Bytes::from(lz4_flex::compress_prepend_size(&occ.payload));
        occ.compressed = true;
    }
    occ
}

/// Inverse of the payload compression, for consumers of stored occurrences.
pub fn payload_bytes(occ: &Occurrence) -> Result<Bytes, lz4_flex::block::DecompressError> {
    if occ.compressed {
        lz4_flex::decompress_size_prepended(&occ.payload).map(Bytes::from)
    } else {
        Ok(occ.payload.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daq_core::RawBlock;
    use daq_decoder::synth::{self, LegacyEvent, NewFirmwareEvent};

    fn batch(blocks: Vec<RawBlock>, rollover: u32) -> DrainedBatch {
        let header_time = blocks.first().and_then(first_header_time).unwrap_or(0);
        DrainedBatch {
            board: 42,
            blocks,
            rollover_at_start: rollover,
            header_time,
        }
    }

    fn processing(mode: ProcessingMode) -> ProcessingConfig {
        ProcessingConfig {
            mode,
            ..ProcessingConfig::default()
        }
    }

    fn legacy_block(times: &[u32]) -> RawBlock {
        let records: Vec<Vec<u32>> = times
            .iter()
            .enumerate()
            .map(|(i, &t)| LegacyEvent::uniform(0b1001, i as u32, t, 4).encode())
            .collect();
        synth::to_block(&records)
    }

    #[test]
    fn test_raw_mode_one_occurrence_per_block() {
        let blocks = vec![legacy_block(&[100, 200]), legacy_block(&[300])];
        let out = decode_batch(batch(blocks, 2), &mut DecodeState::default(), &processing(ProcessingMode::Raw));
        assert_eq!(out.occurrences.len(), 2);
        assert_eq!(out.records, 3);
        assert!(out.occurrences.iter().all(|o| o.channel.is_none()));
        assert_eq!(out.occurrences[0].corrected_time, (2u64 << 31) | 100);
        assert_eq!(out.occurrences[1].corrected_time, (2u64 << 31) | 300);
    }

    #[test]
    fn test_block_split_mode_one_occurrence_per_record() {
        let blocks = vec![legacy_block(&[100, 200, 300])];
        let out = decode_batch(batch(blocks, 0), &mut DecodeState::default(), &processing(ProcessingMode::BlockSplit));
        let times: Vec<u64> = out.occurrences.iter().map(|o| o.corrected_time).collect();
        assert_eq!(times, vec![100, 200, 300]);
        assert_eq!(out.occurrences[2].event_counter, Some(2));
    }

    #[test]
    fn test_block_split_times_stay_monotonic_across_drains() {
        use daq_board::{BoardInterface, ScriptedBus, V1724};
        use daq_core::{BoardConfig, ReadoutConfig};

        let bus = ScriptedBus::new();
        let config = BoardConfig::digitizer(3);
        let board = BoardInterface::new(
            3,
            Box::new(V1724::new(&config, Box::new(bus.clone()))),
            &ReadoutConfig::default(),
        );
        let p = processing(ProcessingMode::BlockSplit);
        let mut state = DecodeState::default();
        let mut times = Vec::new();
        for block_times in [&[0x3000_0000u32, 0x7000_0000][..], &[0x1000_0000][..]] {
            let mut words = Vec::new();
            for (i, &t) in block_times.iter().enumerate() {
                words.extend(LegacyEvent::uniform(1, i as u32, t, 4).encode());
            }
            bus.push_words(&words);
            board.read_cycle().unwrap();
            let out = decode_batch(board.try_drain().unwrap(), &mut state, &p);
            times.extend(out.occurrences.iter().map(|o| o.corrected_time));
        }
        assert_eq!(times, vec![0x3000_0000, 0x7000_0000, (1u64 << 31) | 0x1000_0000]);
    }

    #[test]
    fn test_channel_mode_rollover_within_batch() {
        let t = 0x7FFF_0000u32;
        let blocks = vec![legacy_block(&[t, 0x10])];
        let out = decode_batch(
            batch(blocks, 0),
            &mut DecodeState::default(),
            &processing(ProcessingMode::ChannelSplitLegacy),
        );
        assert_eq!(out.occurrences.len(), 4);
        let channels: Vec<Option<u8>> = out.occurrences.iter().map(|o| o.channel).collect();
        assert_eq!(channels, vec![Some(0), Some(3), Some(0), Some(3)]);
        assert_eq!(out.occurrences[0].corrected_time, u64::from(t));
        assert_eq!(out.occurrences[2].corrected_time, (1u64 << 31) | 0x10);
        assert_eq!(out.occurrences[3].corrected_time, (1u64 << 31) | 0x10);
    }

    #[test]
    fn test_channel_clocks_persist_across_batches() {
        let mut state = DecodeState::default();
        let p = processing(ProcessingMode::ChannelSplitLegacy);
        decode_batch(batch(vec![legacy_block(&[0x7000_0000])], 0), &mut state, &p);
        // Batch state is only a seed; an established channel keeps its own count.
        let out = decode_batch(batch(vec![legacy_block(&[0x100])], 5), &mut state, &p);
        assert_eq!(out.occurrences[0].corrected_time, (1u64 << 31) | 0x100);
    }

    #[test]
    fn test_compression_and_integral() {
        let blocks = vec![legacy_block(&[10])];
        let original = decode_batch(
            batch(vec![legacy_block(&[10])], 0),
            &mut DecodeState::default(),
            &processing(ProcessingMode::ChannelSplitLegacy),
        );
        let p = ProcessingConfig {
            compress: true,
            compute_integral: true,
            ..processing(ProcessingMode::ChannelSplitLegacy)
        };
        let out = decode_batch(batch(blocks, 0), &mut DecodeState::default(), &p);
        let occ = &out.occurrences[0];
        assert!(occ.compressed);
        assert!(occ.integral.unwrap() > 0);
        assert_eq!(payload_bytes(occ).unwrap(), original.occurrences[0].payload);
    }

    #[test]
    fn test_new_firmware_counts_anomalies() {
        let mut words = NewFirmwareEvent::uniform(0b11, 0, 0, &[(5, 2), (6, 2)]).encode();
        words[8] = 0;
        let out = decode_batch(
            batch(vec![RawBlock::from_words(&words)], 0),
            &mut DecodeState::default(),
            &processing(ProcessingMode::ChannelSplitNewFirmware),
        );
        assert_eq!(out.anomalies, 1);
        assert_eq!(out.occurrences.len(), 1);
        assert_eq!(out.occurrences[0].corrected_time, 5);
    }
}
