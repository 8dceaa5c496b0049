//! Per-board DC offset calibration files.
//!
//! ```text
//! 24031714
//! 1  1A2B
//! 2  1A40
//! ...
//! 8  19F0
//! ```
//!
//! Line 1 is the creation stamp `YYMMDDHH`; lines 2-9 hold the 1-based channel
//! number and the channel's DAC value as four hex digits.

use std::fmt;
use std::fs;
use std::path::Path;

use chrono::{Local, NaiveDateTime};
use thiserror::Error;

use daq_decoder::CHANNELS;

const STAMP_FORMAT: &str = "%y%m%d%H";

/// Failure to read or parse a calibration file.
#[derive(Error, Debug)]
pub enum CalibrationError {
    /// Reading or writing the file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The file is empty.
    #[error("Calibration file has no stamp line")]
    MissingStamp,

    /// The first line is not an eight digit stamp.
    #[error("Invalid stamp '{0}', expected YYMMDDHH")]
    BadStamp(String),

    /// A line is not `channel hexvalue`.
    #[error("Line {line}: cannot parse '{content}'")]
    BadLine { line: usize, content: String },

    /// Channels are numbered 1 to 8.
    #[error("Line {line}: channel {channel} out of range 1-8")]
    ChannelOutOfRange { line: usize, channel: u32 },

    /// No line for this channel.
    #[error("No DAC value for channel {0}")]
    MissingChannel(u8),
}

/// DC offsets of the eight channels of one board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Calibration {
    /// `YYMMDDHH` as a decimal number.
    pub stamp: u32,
    /// DAC value per channel, channel 1 first.
    pub dac: [u16; 8],
}

impl Calibration {
    /// New calibration stamped with the current local hour.
    pub fn new(dac: [u16; 8]) -> Self {
        let stamp = Local::now()
            .format(STAMP_FORMAT)
            .to_string()
            .parse()
            .unwrap_or(0);
        Self { stamp, dac }
    }

    /// Parse the text format: a `YYMMDDHH` stamp line, then one
    /// `channel value` line per channel with the value in hex.
    pub fn parse(text: &str) -> Result<Self, CalibrationError> {
        let mut lines = text
            .lines()
            .enumerate()
            .map(|(i, l)| (i + 1, l.trim()))
            .filter(|(_, l)| !l.is_empty());

        let (_, stamp_line) = lines.next().ok_or(CalibrationError::MissingStamp)?;
        if stamp_line.len() != 8 {
            return Err(CalibrationError::BadStamp(stamp_line.to_string()));
        }
        let stamp = stamp_line
            .parse()
            .map_err(|_| CalibrationError::BadStamp(stamp_line.to_string()))?;

        let mut dac = [None; CHANNELS as usize];
        for (line, content) in lines {
            let bad = || CalibrationError::BadLine {
                line,
                content: content.to_string(),
            };
            let mut fields = content.split_whitespace();
            let channel: u32 = fields.next().and_then(|f| f.parse().ok()).ok_or_else(bad)?;
            let value = fields
                .next()
                .and_then(|f| u16::from_str_radix(f, 16).ok())
                .ok_or_else(bad)?;
            if fields.next().is_some() {
                return Err(bad());
            }
            if !(1..=u32::from(CHANNELS)).contains(&channel) {
                return Err(CalibrationError::ChannelOutOfRange { line, channel });
            }
            dac[channel as usize - 1] = Some(value);
        }

        let mut out = [0u16; 8];
        for (ch, (slot, value)) in out.iter_mut().zip(dac).enumerate() {
            *slot = value.ok_or(CalibrationError::MissingChannel(ch as u8 + 1))?;
        }
        Ok(Self { stamp, dac: out })
    }

    /// Read and parse a calibration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CalibrationError> {
        Self::parse(&fs::read_to_string(path)?)
    }

    /// Write the calibration in the format [`Calibration::parse`] reads.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), CalibrationError> {
        fs::write(path, self.to_string())?;
        Ok(())
    }

    /// The stamp as a date and hour, if it is a valid one.
    pub fn created_at(&self) -> Option<NaiveDateTime> {
        NaiveDateTime::parse_from_str(&format!("{:08}00", self.stamp), "%y%m%d%H%M").ok()
    }
}

impl fmt::Display for Calibration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:08}", self.stamp)?;
        for (ch, value) in self.dac.iter().enumerate() {
            writeln!(f, "{}  {:04X}", ch + 1, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    const SAMPLE: &str = "24031714\n1  1A2B\n2  1a40\n3  1000\n4  1000\n5  1000\n6  1000\n7  1000\n8  19F0\n";

    #[test]
    fn test_parse_sample() {
        let cal = Calibration::parse(SAMPLE).unwrap();
        assert_eq!(cal.stamp, 24_031_714);
        assert_eq!(cal.dac[0], 0x1A2B);
        assert_eq!(cal.dac[1], 0x1A40);
        assert_eq!(cal.dac[7], 0x19F0);
        let created = cal.created_at().unwrap();
        assert_eq!((created.year(), created.month(), created.day()), (2024, 3, 17));
        assert_eq!(created.hour(), 14);
    }

    #[test]
    fn test_display_matches_file_layout() {
        let cal = Calibration::parse(SAMPLE).unwrap();
        let text = cal.to_string();
        assert!(text.starts_with("24031714\n1  1A2B\n2  1A40\n"));
        assert_eq!(Calibration::parse(&text).unwrap(), cal);
    }

    #[test]
    fn test_missing_channel() {
        let text = "24031714\n1  1000\n2  1000\n";
        assert!(matches!(
            Calibration::parse(text),
            Err(CalibrationError::MissingChannel(3))
        ));
    }

    #[test]
    fn test_bad_lines() {
        assert!(matches!(Calibration::parse(""), Err(CalibrationError::MissingStamp)));
        assert!(matches!(
            Calibration::parse("2403\n"),
            Err(CalibrationError::BadStamp(_))
        ));
        assert!(matches!(
            Calibration::parse("24031714\n9  1000\n"),
            Err(CalibrationError::ChannelOutOfRange { line: 2, channel: 9 })
        ));
        assert!(matches!(
            Calibration::parse("24031714\n1  zz\n"),
            Err(CalibrationError::BadLine { line: 2, .. })
        ));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("board_100.cal");
        let cal = Calibration::new([0x1000, 0x1001, 0x1002, 0x1003, 0x1004, 0x1005, 0x1006, 0x1007]);
        cal.save(&path).unwrap();
        assert_eq!(Calibration::load(&path).unwrap(), cal);
        assert!(cal.created_at().is_some());
    }
}
