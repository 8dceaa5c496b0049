//! Pulse integral of a run of samples.

/// ADC resolution of the V1724.
pub const SAMPLE_MASK: u16 = 0x3FFF;

/// Samples averaged for the baseline estimate.
pub const BASELINE_SAMPLES: usize = 4;

/// Iterate the 14-bit samples packed two per little-endian word, low half first.
pub fn samples(payload: &[u8]) -> impl Iterator<Item = u16> + '_ {
    payload
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]) & SAMPLE_MASK)
}

/// Baseline-subtracted integral of a run.
///
/// The baseline is the mean of the first few samples. Pulses are negative
/// going, so the integral is `sum(baseline - sample)` and positive for a pulse.
/// An empty run integrates to zero.
pub fn integrate(payload: &[u8]) -> i64 {
    let head: Vec<i64> = samples(payload).take(BASELINE_SAMPLES).map(i64::from).collect();
    if head.is_empty() {
        return 0;
    }
    let baseline = head.iter().sum::<i64>() / head.len() as i64;
    samples(payload).map(|s| baseline - i64::from(s)).sum()
}
