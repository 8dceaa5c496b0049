//! `daq-decoder`
//!
//! Stateless decoding of V1724 block-transfer data. The functions here take
//! ownership of a batch of [`RawBlock`](daq_core::RawBlock)s and return
//! zero-copy views of the records or channel runs inside them. Time
//! reconstruction is left to the caller, which owns the clock state.
//!
//! - [`split_blocks`]: one buffer per trigger record
//! - [`split_channels_legacy`]: per-channel runs, stock firmware, optional ZLE
//! - [`split_channels_new_firmware`]: per-channel runs with per-channel times

pub mod blocks;
pub mod channels;
pub mod format;
pub mod hexdump;
pub mod integral;
pub mod synth;

pub use blocks::{split_blocks, EventRecord};
pub use channels::{
    split_channels_legacy, split_channels_new_firmware, AnomalyReason, ChannelFragment,
    ChannelSplit, DecodeAnomaly,
};
pub use format::{first_header_time, header_times, EventHeader, RecordWalker, CHANNELS};
pub use hexdump::hexdump;
pub use integral::integrate;
