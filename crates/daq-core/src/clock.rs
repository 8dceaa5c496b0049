//! Reconstruction of 64-bit time from the 31-bit hardware clock.
//!
//! Digitizers stamp triggers with a free-running counter that wraps every
//! 2^31 ticks. `ClockState` follows one stream of raw times (a board, or a
//! single channel of a board) in production order and counts wraps. A wrap is
//! recognised only by a backward jump larger than half the counter range;
//! smaller backward jumps are reported as anomalies and leave the rollover
//! count untouched.

/// Mask of the valid bits of a hardware time word.
pub const HW_TIME_MASK: u32 = 0x7FFF_FFFF;

/// Half of the 31-bit counter range.
pub const HALF_RANGE: u32 = 0x4000_0000;

/// Outcome of feeding one raw time into a [`ClockState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockStep {
    /// First time seen, or time did not move backwards.
    Forward,
    /// Backward jump of more than half the range: the counter wrapped.
    Rollover,
    /// Backward jump within half the range. Informational only.
    Backward { by: u32 },
}

/// Per-stream rollover tracking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockState {
    rollover_count: u32,
    last_hw_time: u32,
    over_half_range: bool,
    seen: bool,
}

impl ClockState {
    /// Clock that has seen no time yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// State continuing from a known rollover count and last raw time.
    pub fn seeded(rollover_count: u32, last_hw_time: u32) -> Self {
        let last_hw_time = last_hw_time & HW_TIME_MASK;
        Self {
            rollover_count,
            last_hw_time,
            over_half_range: last_hw_time >= HALF_RANGE,
            seen: true,
        }
    }

    /// Rollovers counted so far.
    pub fn rollover_count(&self) -> u32 {
        self.rollover_count
    }

    /// Last raw time observed or seeded.
    pub fn last_hw_time(&self) -> u32 {
        self.last_hw_time
    }

    /// Whether the last observed time lies in the upper half of the range.
    pub fn over_half_range(&self) -> bool {
        self.over_half_range
    }

    /// Whether any time has been observed since creation or reset.
    pub fn has_observed(&self) -> bool {
        self.seen
    }

    /// Back to the unobserved state.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Feed the next raw time of the stream.
    pub fn observe(&mut self, hw_time: u32) -> ClockStep {
        let t = hw_time & HW_TIME_MASK;
        let step = if !self.seen || t >= self.last_hw_time {
            ClockStep::Forward
        } else if self.last_hw_time - t > HALF_RANGE {
            self.rollover_count = self.rollover_count.wrapping_add(1);
            ClockStep::Rollover
        } else {
            ClockStep::Backward {
                by: self.last_hw_time - t,
            }
        };
        self.last_hw_time = t;
        self.over_half_range = t >= HALF_RANGE;
        self.seen = true;
        step
    }

    /// 64-bit time of `hw_time` under the current rollover count.
    pub fn compose(&self, hw_time: u32) -> u64 {
        (u64::from(self.rollover_count) << 31) | u64::from(hw_time & HW_TIME_MASK)
    }

    /// Observe `hw_time` and return its corrected time with the step taken.
    pub fn correct(&mut self, hw_time: u32) -> (u64, ClockStep) {
        let step = self.observe(hw_time);
        (self.compose(hw_time), step)
    }
}
