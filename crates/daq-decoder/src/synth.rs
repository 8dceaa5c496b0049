//! Synthetic V1724 records.
//!
//! Used by the simulated bus, the benches and the tests to produce data in
//! each of the firmware layouts the decoders understand.

use daq_core::RawBlock;

use crate::format::{HEADER_PATTERN, HEADER_SHIFT, HEADER_WORDS, ZLE_DATA_TAG, ZLE_TAG_SHIFT};

/// Baseline of generated waveforms.
pub const SYNTH_BASELINE: u16 = 8000;

/// The four header words of a record of `size_words` words.
pub fn header_words(
    size_words: usize,
    channel_mask: u8,
    board_geo: u8,
    event_counter: u32,
    trigger_time: u32,
) -> [u32; HEADER_WORDS] {
    [
        HEADER_PATTERN << HEADER_SHIFT | (size_words as u32 & 0xFFFF),
        u32::from(board_geo) << 27 | u32::from(channel_mask),
        event_counter,
        trigger_time,
    ]
}

/// Pack samples two per word, low half first.
pub fn sample_words(samples: &[u16]) -> Vec<u32> {
    samples
        .chunks(2)
        .map(|pair| {
            let lo = u32::from(pair[0]);
            let hi = pair.get(1).copied().map_or(0, u32::from);
            hi << 16 | lo
        })
        .collect()
}

/// Pack samples into little-endian bytes.
pub fn pack_samples(samples: &[u16]) -> Vec<u8> {
    sample_words(samples)
        .into_iter()
        .flat_map(u32::to_le_bytes)
        .collect()
}

/// A flat baseline with one negative pulse in the middle.
pub fn pulse_words(words: usize, seed: u32) -> Vec<u32> {
    let n = words * 2;
    let depth = 200 + (seed % 800) as u16;
    let samples: Vec<u16> = (0..n)
        .map(|i| {
            let d = (i as i64 - (n / 2) as i64).unsigned_abs() as u16;
            SYNTH_BASELINE - depth.saturating_sub(d.saturating_mul(100))
        })
        .collect();
    sample_words(&samples)
}

/// Concatenate encoded records into one transfer block.
pub fn to_block(records: &[Vec<u32>]) -> RawBlock {
    let words: Vec<u32> = records.iter().flatten().copied().collect();
    RawBlock::from_words(&words)
}

/// Record in the stock layout without zero suppression.
#[derive(Debug, Clone)]
pub struct LegacyEvent {
    /// Channels present.
    pub channel_mask: u8,
    /// Trigger counter written to the header.
    pub event_counter: u32,
    /// Trigger time written to the header.
    pub trigger_time: u32,
    /// Geographical address written to the header.
    pub board_geo: u8,
    /// Sample words per present channel, ascending channel order.
    pub channels: Vec<Vec<u32>>,
}

impl LegacyEvent {
    /// Every present channel carries `words_per_channel` words of a pulse.
    pub fn uniform(
        channel_mask: u8,
        event_counter: u32,
        trigger_time: u32,
        words_per_channel: usize,
    ) -> Self {
        let channels = (0..channel_mask.count_ones())
            .map(|i| pulse_words(words_per_channel, event_counter.wrapping_add(i)))
            .collect();
        Self {
            channel_mask,
            event_counter,
            trigger_time,
            board_geo: 0,
            channels,
        }
    }

    /// Header followed by each channel's words.
    pub fn encode(&self) -> Vec<u32> {
        let body: usize = self.channels.iter().map(Vec::len).sum();
        let mut words = header_words(
            HEADER_WORDS + body,
            self.channel_mask,
            self.board_geo,
            self.event_counter,
            self.trigger_time,
        )
        .to_vec();
        for ch in &self.channels {
            words.extend_from_slice(ch);
        }
        words
    }
}

/// One ZLE run.
#[derive(Debug, Clone)]
pub enum ZleRun {
    /// Real sample words.
    Data(Vec<u32>),
    /// Suppressed words.
    Skip(u32),
}

impl ZleRun {
    /// Samples covered by the run.
    pub fn samples(&self) -> u32 {
        match self {
            Self::Data(words) => words.len() as u32 * 2,
            Self::Skip(words) => words * 2,
        }
    }

    fn encode_into(&self, out: &mut Vec<u32>) {
        match self {
            Self::Data(words) => {
                out.push(ZLE_DATA_TAG << ZLE_TAG_SHIFT | words.len() as u32);
                out.extend_from_slice(words);
            }
            Self::Skip(words) => out.push(*words),
        }
    }
}

/// Record in the stock layout with zero-length encoding.
#[derive(Debug, Clone)]
pub struct ZleEvent {
    /// Channels present.
    pub channel_mask: u8,
    /// Trigger counter written to the header.
    pub event_counter: u32,
    /// Trigger time written to the header.
    pub trigger_time: u32,
    /// Runs per present channel, ascending channel order.
    pub channels: Vec<Vec<ZleRun>>,
}

impl ZleEvent {
    /// Header, then per channel a size word and its control and data words.
    pub fn encode(&self) -> Vec<u32> {
        let mut body = Vec::new();
        for runs in &self.channels {
            let mut section = Vec::new();
            for run in runs {
                run.encode_into(&mut section);
            }
            body.push(section.len() as u32 + 1);
            body.append(&mut section);
        }
        let mut words = header_words(
            HEADER_WORDS + body.len(),
            self.channel_mask,
            0,
            self.event_counter,
            self.trigger_time,
        )
        .to_vec();
        words.append(&mut body);
        words
    }
}

/// Channel section of the self-timestamping firmware.
#[derive(Debug, Clone)]
pub struct NewFirmwareChannel {
    /// Channel time word.
    pub time: u32,
    /// Sample words.
    pub data: Vec<u32>,
}

/// Record of the firmware that stamps each channel with its own time.
#[derive(Debug, Clone)]
pub struct NewFirmwareEvent {
    /// Channels present.
    pub channel_mask: u8,
    /// Trigger counter written to the header.
    pub event_counter: u32,
    /// Trigger time written to the header.
    pub trigger_time: u32,
    /// One section per present channel.
    pub channels: Vec<NewFirmwareChannel>,
}

impl NewFirmwareEvent {
    /// One `(time, words)` entry per present channel.
    pub fn uniform(
        channel_mask: u8,
        event_counter: u32,
        trigger_time: u32,
        channels: &[(u32, usize)],
    ) -> Self {
        Self {
            channel_mask,
            event_counter,
            trigger_time,
            channels: channels
                .iter()
                .map(|&(time, words)| NewFirmwareChannel {
                    time,
                    data: pulse_words(words, time),
                })
                .collect(),
        }
    }

    /// Header, then per channel its length word, time word and data.
    pub fn encode(&self) -> Vec<u32> {
        let mut body = Vec::new();
        for ch in &self.channels {
            body.push(ch.data.len() as u32 + 2);
            body.push(ch.time);
            body.extend_from_slice(&ch.data);
        }
        let mut words = header_words(
            HEADER_WORDS + body.len(),
            self.channel_mask,
            0,
            self.event_counter,
            self.trigger_time,
        )
        .to_vec();
        words.append(&mut body);
        words
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pulse_stays_in_adc_range() {
        for w in pulse_words(64, 7) {
            assert!(w & 0xFFFF <= 0x3FFF && w >> 16 <= 0x3FFF);
        }
    }

    #[test]
    fn test_odd_sample_count_pads_high_half() {
        assert_eq!(sample_words(&[1, 2, 3]), vec![0x0002_0001, 0x0000_0003]);
    }
}
