//! Properties of the decoders over randomly generated record streams.

use daq_core::{ClockState, RawBlock};
use daq_decoder::synth::{self, LegacyEvent, NewFirmwareEvent, ZleEvent, ZleRun};
use daq_decoder::{
    first_header_time, split_blocks, split_channels_legacy, split_channels_new_firmware,
    AnomalyReason,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_mask(rng: &mut StdRng) -> u8 {
    rng.gen_range(1..=u8::MAX)
}

#[test]
fn legacy_plain_yields_one_fragment_per_mask_bit() {
    let mut rng = StdRng::seed_from_u64(0x1724);
    for round in 0..200u32 {
        let mask = random_mask(&mut rng);
        let words = rng.gen_range(1..40);
        let event = LegacyEvent::uniform(mask, round, rng.gen_range(0..0x7FFF_FFFF), words);
        let split = split_channels_legacy(vec![synth::to_block(&[event.encode()])], false);

        assert_eq!(split.fragments.len(), mask.count_ones() as usize);
        for fragment in &split.fragments {
            assert_eq!(mask >> fragment.channel & 1, 1);
            assert_eq!(fragment.payload.len(), words * 4);
        }
        assert!(!split.has_anomalies());
    }
}

#[test]
fn zle_runs_account_for_every_sample() {
    let mut rng = StdRng::seed_from_u64(42);
    for round in 0..200u32 {
        let runs: Vec<ZleRun> = (0..rng.gen_range(1..12))
            .map(|i| {
                if i % 2 == 0 {
                    ZleRun::Skip(rng.gen_range(1..500))
                } else {
                    ZleRun::Data(synth::pulse_words(rng.gen_range(1..64), round))
                }
            })
            .collect();
        let total: u32 = runs.iter().map(ZleRun::samples).sum();
        let suppressed: u32 = runs
            .iter()
            .filter(|r| matches!(r, ZleRun::Skip(_)))
            .map(ZleRun::samples)
            .sum();

        let event = ZleEvent {
            channel_mask: 0b1,
            event_counter: round,
            trigger_time: 0,
            channels: vec![runs],
        };
        let split = split_channels_legacy(vec![synth::to_block(&[event.encode()])], true);
        let real: u32 = split.fragments.iter().map(|f| f.sample_count()).sum();

        assert_eq!(real + suppressed, total);
        assert!(!split.has_anomalies());
    }
}

#[test]
fn block_split_recovers_every_record_across_blocks() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut blocks = Vec::new();
    let mut expected = Vec::new();
    let mut time = 0u32;
    for _ in 0..10 {
        let mut records = Vec::new();
        for _ in 0..rng.gen_range(0..6) {
            time += rng.gen_range(1..10_000);
            expected.push(time);
            records.push(LegacyEvent::uniform(random_mask(&mut rng), 0, time, 4).encode());
        }
        blocks.push(synth::to_block(&records));
    }
    let times: Vec<u32> = split_blocks(blocks)
        .iter()
        .map(|r| r.header.trigger_time)
        .collect();
    assert_eq!(times, expected);
}

#[test]
fn corrupt_new_firmware_length_skips_one_channel() {
    let event = NewFirmwareEvent::uniform(0b1111, 1, 0, &[(10, 4), (20, 4), (30, 4), (40, 4)]);
    let mut words = event.encode();
    // Second channel section starts after the header and the first section.
    let second = 4 + 6;
    words[second] = 5_000_000;
    // Decoding resumes two words later; plant a 4-word section there.
    words[second + 2] = 4;
    words[second + 3] = 15;

    let split = split_channels_new_firmware(vec![RawBlock::from_words(&words)]);

    assert_eq!(split.anomalies.len(), 1);
    assert_eq!(
        split.anomalies[0].reason,
        AnomalyReason::ChannelLengthOutOfBounds(5_000_000)
    );
    let channels: Vec<u8> = split.fragments.iter().map(|f| f.channel).collect();
    assert_eq!(channels, vec![0, 2, 3]);
    assert_eq!(split.fragments[1].hw_time(), 15);
}

#[test]
fn header_times_drive_clock_through_rollover() {
    let t = 0x6000_0000u32;
    let blocks: Vec<RawBlock> = [t, t + 1, t - (1 << 30)]
        .iter()
        .map(|&time| synth::to_block(&[LegacyEvent::uniform(1, 0, time, 2).encode()]))
        .collect();

    let mut clock = ClockState::new();
    let mut counts = Vec::new();
    for block in &blocks {
        if let Some(time) = first_header_time(block) {
            clock.observe(time);
        }
        counts.push(clock.rollover_count());
    }
    assert_eq!(counts, vec![0, 0, 1]);
}
