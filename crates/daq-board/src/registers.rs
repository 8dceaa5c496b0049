//! Register maps, as offsets from each board's base address.

/// CAEN V1724 digitizer.
pub mod v1724 {
    /// Event readout buffer, read by block transfer.
    pub const EVENT_READOUT_BUFFER: u32 = 0x0000;
    /// DC offset DAC of channel 0; channel `n` is at `+ n * CHANNEL_STRIDE`.
    pub const CHANNEL_DAC: u32 = 0x1098;
    /// Spacing of per-channel register blocks.
    pub const CHANNEL_STRIDE: u32 = 0x100;
    /// Acquisition control.
    pub const ACQUISITION_CONTROL: u32 = 0x8100;
    /// Acquisition status.
    pub const ACQUISITION_STATUS: u32 = 0x8104;
    /// One bit per enabled channel.
    pub const CHANNEL_ENABLE_MASK: u32 = 0x8120;
    /// Write to empty the event buffers.
    pub const SOFTWARE_CLEAR: u32 = 0xEF28;
    /// Write to restore default register values.
    pub const SOFTWARE_RESET: u32 = 0xEF24;

    /// ACQUISITION_CONTROL bit starting the acquisition.
    pub const ACQ_RUN: u32 = 1 << 2;
    /// ACQUISITION_STATUS bit set once the board accepts triggers.
    pub const STATUS_READY: u32 = 1 << 8;

    /// DAC register of `channel`, counted from 0.
    pub fn channel_dac(channel: u8) -> u32 {
        CHANNEL_DAC + u32::from(channel) * CHANNEL_STRIDE
    }
}

/// CAEN V2718 crate controller.
pub mod v2718 {
    /// Set bits in the output register.
    pub const OUTPUT_SET: u32 = 0x0A;
    /// Clear bits in the output register.
    pub const OUTPUT_CLEAR: u32 = 0x10;
    /// Front-panel output wired to the digitizers' S-IN.
    pub const RUN_OUTPUT: u32 = 1 << 6;
}
