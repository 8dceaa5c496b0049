//! Channel splitting for the two V1724 firmware layouts.
//!
//! Both decoders walk the trigger records of each block and emit one
//! [`ChannelFragment`] per contiguous run of samples on one channel. Regions
//! that cannot be decoded are dumped to the `decode_dump` log target and
//! reported as [`DecodeAnomaly`] values; decoding always continues with the
//! next channel or record that can still be located.

use std::fmt;

use bytes::Bytes;
use daq_core::{RawBlock, HW_TIME_MASK};
use tracing::warn;

use crate::format::{
    EventHeader, RecordWalker, HEADER_WORDS, NEW_FW_MAX_CHANNEL_WORDS, NEW_FW_MIN_CHANNEL_WORDS,
    ZLE_DATA_TAG, ZLE_LENGTH_MASK, ZLE_TAG_SHIFT,
};
use crate::hexdump::hexdump;

/// Words dumped around an undecodable region.
const DUMP_WORDS: usize = 16;

/// Samples packed in one data word.
const SAMPLES_PER_WORD: u32 = 2;

/// A run of samples from one channel of one trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelFragment {
    /// Channel 0..7.
    pub channel: u8,
    /// Trigger counter from the record header.
    pub event_counter: u32,
    /// Reference time of the run: the trigger time (legacy) or the channel's
    /// own time word (new firmware).
    pub header_time: u32,
    /// Samples between the reference time and the first sample of the run.
    pub sample_offset: u32,
    /// Sample words of the run.
    pub payload: Bytes,
}

impl ChannelFragment {
    /// Raw 31-bit time of the first sample of the run.
    pub fn hw_time(&self) -> u32 {
        self.header_time.wrapping_add(self.sample_offset) & HW_TIME_MASK
    }

    /// Samples in the payload, two per word.
    pub fn sample_count(&self) -> u32 {
        (self.payload.len() / 4) as u32 * SAMPLES_PER_WORD
    }
}

/// Why a region was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnomalyReason {
    /// New-firmware channel length outside `(2, 100000]`.
    ChannelLengthOutOfBounds(u32),
    /// Channel section claims more words than its record holds.
    ChannelOverrunsRecord { needed: usize, available: usize },
    /// ZLE channel size word of zero.
    EmptyChannelSection,
    /// A data run extends past its channel section.
    RunOverrunsChannel { needed: usize, available: usize },
    /// Channel time word is all ones.
    GarbageTimestamp,
}

impl fmt::Display for AnomalyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChannelLengthOutOfBounds(len) => write!(
                f,
                "channel length {} outside ({}, {}]",
                len, NEW_FW_MIN_CHANNEL_WORDS, NEW_FW_MAX_CHANNEL_WORDS
            ),
            Self::ChannelOverrunsRecord { needed, available } => write!(
                f,
                "channel needs {} words, record has {} left",
                needed, available
            ),
            Self::EmptyChannelSection => write!(f, "zero-size channel section"),
            Self::RunOverrunsChannel { needed, available } => write!(
                f,
                "data run needs {} words, channel has {} left",
                needed, available
            ),
            Self::GarbageTimestamp => write!(f, "channel time word is all ones"),
        }
    }
}

/// A skipped region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeAnomaly {
    /// Trigger counter of the record.
    pub event_counter: u32,
    /// Channel being decoded when the region was skipped.
    pub channel: u8,
    /// Word offset of the region inside its block.
    pub word_offset: usize,
    /// Why the region was skipped.
    pub reason: AnomalyReason,
}

/// Output of the channel decoders.
#[derive(Debug, Default)]
pub struct ChannelSplit {
    /// Decoded runs, in record and channel order.
    pub fragments: Vec<ChannelFragment>,
    /// Skipped regions.
    pub anomalies: Vec<DecodeAnomaly>,
}

impl ChannelSplit {
    /// Whether any region had to be skipped.
    pub fn has_anomalies(&self) -> bool {
        !self.anomalies.is_empty()
    }

    fn fragment(
        &mut self,
        block: &RawBlock,
        header: &EventHeader,
        channel: u8,
        time: u32,
        offset: u32,
        words: (usize, usize),
    ) {
        self.fragments.push(ChannelFragment {
            channel,
            event_counter: header.event_counter,
            header_time: time,
            sample_offset: offset,
            payload: block.slice_words(words.0, words.1),
        });
    }

    fn anomaly(
        &mut self,
        block: &RawBlock,
        header: &EventHeader,
        channel: u8,
        word_offset: usize,
        record_end: usize,
        reason: AnomalyReason,
    ) {
        let dump_end = record_end.min(word_offset + DUMP_WORDS);
        let dump = hexdump(&block.slice_words(word_offset, dump_end.max(word_offset)));
        warn!(
            target: "decode_dump",
            event = header.event_counter,
            channel,
            word_offset,
            "Skipping undecodable region: {}",
            reason
        );
        for line in dump.lines() {
            warn!(target: "decode_dump", event = header.event_counter, channel, "{}", line);
        }
        self.anomalies.push(DecodeAnomaly {
            event_counter: header.event_counter,
            channel,
            word_offset,
            reason,
        });
    }
}

/// Split stock-firmware records into channel fragments.
///
/// Without ZLE the record body is divided evenly among the channels present,
/// giving exactly one fragment per set mask bit. With ZLE each channel starts
/// with its size word followed by control words; only real-data runs produce
/// fragments, suppressed runs just advance the sample offset.
pub fn split_channels_legacy(blocks: Vec<RawBlock>, zle: bool) -> ChannelSplit {
    let mut out = ChannelSplit::default();
    for block in blocks.iter().filter(|b| !b.is_empty()) {
        for (start, header) in RecordWalker::new(block) {
            let body = start + HEADER_WORDS;
            let end = start + header.size_words;
            if zle {
                legacy_zle_record(&mut out, block, &header, body, end);
            } else {
                legacy_plain_record(&mut out, block, &header, body, end);
            }
        }
    }
    out
}

fn legacy_plain_record(
    out: &mut ChannelSplit,
    block: &RawBlock,
    header: &EventHeader,
    body: usize,
    end: usize,
) {
    let present = header.channel_count() as usize;
    if present == 0 {
        return;
    }
    let per_channel = (end - body) / present;
    if per_channel == 0 {
        return;
    }
    for (i, channel) in header.channels().enumerate() {
        let from = body + i * per_channel;
        out.fragment(
            block,
            header,
            channel,
            header.trigger_time,
            0,
            (from, from + per_channel),
        );
    }
}

fn legacy_zle_record(
    out: &mut ChannelSplit,
    block: &RawBlock,
    header: &EventHeader,
    body: usize,
    end: usize,
) {
    let mut idx = body;
    for channel in header.channels() {
        if idx >= end {
            out.anomaly(
                block,
                header,
                channel,
                idx.min(end),
                end,
                AnomalyReason::ChannelOverrunsRecord {
                    needed: 1,
                    available: 0,
                },
            );
            return;
        }
        let section = block.word(idx) as usize;
        if section == 0 {
            out.anomaly(block, header, channel, idx, end, AnomalyReason::EmptyChannelSection);
            return;
        }
        let section_end = idx + section;
        if section_end > end {
            out.anomaly(
                block,
                header,
                channel,
                idx,
                end,
                AnomalyReason::ChannelOverrunsRecord {
                    needed: section,
                    available: end - idx,
                },
            );
            return;
        }

        let mut pos = idx + 1;
        let mut offset: u32 = 0;
        while pos < section_end {
            let control = block.word(pos);
            if control >> ZLE_TAG_SHIFT == ZLE_DATA_TAG {
                let words = (control & ZLE_LENGTH_MASK) as usize;
                let run_end = pos + 1 + words;
                if run_end > section_end {
                    out.anomaly(
                        block,
                        header,
                        channel,
                        pos,
                        end,
                        AnomalyReason::RunOverrunsChannel {
                            needed: words,
                            available: section_end - pos - 1,
                        },
                    );
                    break;
                }
                if words > 0 {
                    out.fragment(
                        block,
                        header,
                        channel,
                        header.trigger_time,
                        offset,
                        (pos + 1, run_end),
                    );
                }
                offset = offset.wrapping_add(words as u32 * SAMPLES_PER_WORD);
                pos = run_end;
            } else {
                offset = offset.wrapping_add(control.wrapping_mul(SAMPLES_PER_WORD));
                pos += 1;
            }
        }
        idx = section_end;
    }
}

/// Split records of the firmware that stamps each channel with its own time.
///
/// Each channel section is a `(length, time)` word pair followed by
/// `length - 2` data words. A length outside `(2, 100000]` cannot be trusted
/// to locate the payload: the pair is skipped and the next channel is read
/// from the following word.
pub fn split_channels_new_firmware(blocks: Vec<RawBlock>) -> ChannelSplit {
    let mut out = ChannelSplit::default();
    for block in blocks.iter().filter(|b| !b.is_empty()) {
        for (start, header) in RecordWalker::new(block) {
            new_firmware_record(&mut out, block, &header, start + HEADER_WORDS, start + header.size_words);
        }
    }
    out
}

fn new_firmware_record(
    out: &mut ChannelSplit,
    block: &RawBlock,
    header: &EventHeader,
    body: usize,
    end: usize,
) {
    let mut idx = body;
    for channel in header.channels() {
        if idx + 2 > end {
            out.anomaly(
                block,
                header,
                channel,
                idx.min(end),
                end,
                AnomalyReason::ChannelOverrunsRecord {
                    needed: 2,
                    available: end.saturating_sub(idx),
                },
            );
            return;
        }
        let length = block.word(idx);
        let time_word = block.word(idx + 1);

        if length <= NEW_FW_MIN_CHANNEL_WORDS || length > NEW_FW_MAX_CHANNEL_WORDS {
            out.anomaly(
                block,
                header,
                channel,
                idx,
                end,
                AnomalyReason::ChannelLengthOutOfBounds(length),
            );
            idx += 2;
            continue;
        }

        let section_end = idx + length as usize;
        if section_end > end {
            out.anomaly(
                block,
                header,
                channel,
                idx,
                end,
                AnomalyReason::ChannelOverrunsRecord {
                    needed: length as usize,
                    available: end - idx,
                },
            );
            return;
        }

        if time_word == u32::MAX {
            out.anomaly(block, header, channel, idx, end, AnomalyReason::GarbageTimestamp);
        } else {
            out.fragment(
                block,
                header,
                channel,
                time_word & HW_TIME_MASK,
                0,
                (idx + 2, section_end),
            );
        }
        idx = section_end;
    }
}
