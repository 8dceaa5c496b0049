//! Run configuration.
//!
//! Configuration is loaded with Figment from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `DIGI_DAQ_`, `__` separating nested keys
//!
//! # Example
//! ```no_run
//! use daq_core::config::RunConfig;
//!
//! let config = RunConfig::load_from("config/run.toml")?;
//! println!("{} boards, {} workers", config.boards.len(), config.processing.workers);
//! # Ok::<(), daq_core::DaqError>(())
//! ```
//!
//! ```toml
//! run_name = "calibration_0042"
//!
//! [processing]
//! mode = "channel-split-legacy"
//! zero_length_encoding = true
//! workers = 4
//!
//! [processing.threshold]
//! blocks = 10
//! interval = "1s"
//!
//! [[boards]]
//! id = 100
//! kind = "v1724"
//! base_address = 0x32100000
//!
//! [sink]
//! type = "file"
//! directory = "/data/raw"
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{DaqError, DaqResult};

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "DIGI_DAQ_";

/// Top-level run configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Name used for output files and log context.
    #[serde(default = "default_run_name")]
    pub run_name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Read loop settings.
    #[serde(default)]
    pub readout: ReadoutConfig,
    /// Decode and sink settings.
    #[serde(default)]
    pub processing: ProcessingConfig,
    /// Digitizers and controllers, in read order.
    #[serde(default)]
    pub boards: Vec<BoardConfig>,
    /// Where occurrences are recorded.
    #[serde(default)]
    pub sink: SinkConfig,
}

/// Bus transfer settings for the read loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadoutConfig {
    /// Bytes requested per block transfer.
    #[serde(default = "default_blt_size")]
    pub blt_size: usize,
    /// Upper bound on block transfers chained into one read cycle.
    #[serde(default = "default_max_blts")]
    pub max_blts: usize,
    /// Pause between boards in the round-robin.
    #[serde(default = "default_inter_board_yield", with = "humantime_serde")]
    pub inter_board_yield: Duration,
}

/// How drained blocks are turned into occurrences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessingMode {
    /// One occurrence per transferred block.
    Raw,
    /// One occurrence per trigger record.
    BlockSplit,
    /// One occurrence per channel run, V1724 stock firmware layout.
    #[default]
    ChannelSplitLegacy,
    /// One occurrence per channel, firmware with per-channel time words.
    ChannelSplitNewFirmware,
}

impl ProcessingMode {
    /// Whether occurrences carry a channel index.
    pub fn splits_channels(self) -> bool {
        matches!(
            self,
            ProcessingMode::ChannelSplitLegacy | ProcessingMode::ChannelSplitNewFirmware
        )
    }
}

/// When a board's pending queue is handed to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadoutThreshold {
    /// Ready when strictly more blocks than this are pending.
    #[serde(default = "default_threshold_blocks")]
    pub blocks: usize,
    /// Ready when this much time passed since the last drain.
    #[serde(default = "default_threshold_interval", with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for ReadoutThreshold {
    fn default() -> Self {
        Self {
            blocks: default_threshold_blocks(),
            interval: default_threshold_interval(),
        }
    }
}

/// What a worker does with a batch the sink refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkErrorPolicy {
    /// Log and discard the batch.
    #[default]
    Drop,
    /// Retry the insert this many more times before discarding.
    Retry(u32),
}

/// Worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// How blocks are split into occurrences.
    #[serde(default)]
    pub mode: ProcessingMode,
    /// Boards run with zero-length encoding enabled.
    #[serde(default)]
    pub zero_length_encoding: bool,
    /// LZ4-compress occurrence payloads before recording.
    #[serde(default)]
    pub compress: bool,
    /// Compute baseline-subtracted integrals for channel occurrences.
    #[serde(default)]
    pub compute_integral: bool,
    /// Decode worker threads.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Occurrences accumulated before a batch is pushed to the sink.
    #[serde(default = "default_min_insert_size")]
    pub min_insert_size: usize,
    /// When a board's queue is ready for a worker.
    #[serde(default)]
    pub threshold: ReadoutThreshold,
    /// How long a worker waits with nothing left to do before exiting.
    #[serde(default = "default_idle_grace", with = "humantime_serde")]
    pub idle_grace: Duration,
    /// What to do with a batch the sink rejected.
    #[serde(default)]
    pub sink_error_policy: SinkErrorPolicy,
}

/// Board families the stack knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoardKind {
    /// 8-channel 14-bit 100 MS/s digitizer.
    V1724,
    /// VME crate controller, used to start all digitizers synchronously.
    V2718,
}

impl BoardKind {
    /// Whether boards of this kind produce data.
    pub fn is_digitizer(self) -> bool {
        matches!(self, BoardKind::V1724)
    }
}

/// One register write applied at arm time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterSetting {
    /// Offset from the board's base address.
    pub address: u32,
    /// Value written.
    pub value: u32,
}

/// Per-board settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardConfig {
    /// Module id, stamped on every occurrence of this board.
    pub id: u32,
    /// Board family.
    pub kind: BoardKind,
    /// Bus link descriptor, e.g. `sim` or `optical:0`.
    #[serde(default = "default_link")]
    pub link: String,
    /// Crate index on the link.
    #[serde(default)]
    pub crate_number: u32,
    /// VME base address of the board.
    #[serde(default)]
    pub base_address: u32,
    /// Channel-present mask programmed into the board.
    #[serde(default = "default_channel_mask")]
    pub channel_mask: u8,
    /// DAC baseline file written by the baseline routine.
    #[serde(default)]
    pub calibration_file: Option<PathBuf>,
    /// Extra register writes, applied in order.
    #[serde(default)]
    pub registers: Vec<RegisterSetting>,
}

impl BoardConfig {
    /// Minimal digitizer entry, mostly for tests.
    pub fn digitizer(id: u32) -> Self {
        Self {
            id,
            kind: BoardKind::V1724,
            link: default_link(),
            crate_number: 0,
            base_address: 0,
            channel_mask: default_channel_mask(),
            calibration_file: None,
            registers: Vec::new(),
        }
    }
}

/// Storage target.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SinkConfig {
    /// Discard everything.
    #[default]
    None,
    /// Per-worker record files.
    File(FileSinkConfig),
    /// A PostgreSQL table.
    Database(DatabaseSinkConfig),
}

/// File sink target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSinkConfig {
    /// Directory the files are created in.
    pub directory: PathBuf,
    /// File name prefix.
    #[serde(default = "default_file_prefix")]
    pub prefix: String,
    /// Roll over to a new file once this many bytes were written.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

/// Database sink target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseSinkConfig {
    /// libpq-style connection string.
    pub url: String,
    /// Table created on initialize if missing.
    pub table: String,
}

fn default_run_name() -> String {
    "run".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_blt_size() -> usize {
    512 * 1024
}

fn default_max_blts() -> usize {
    1000
}

fn default_inter_board_yield() -> Duration {
    Duration::from_micros(100)
}

fn default_threshold_blocks() -> usize {
    10
}

fn default_threshold_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_workers() -> usize {
    4
}

fn default_min_insert_size() -> usize {
    1000
}

fn default_idle_grace() -> Duration {
    Duration::from_millis(200)
}

fn default_link() -> String {
    "sim".to_string()
}

fn default_channel_mask() -> u8 {
    0xFF
}

fn default_file_prefix() -> String {
    "digi".to_string()
}

fn default_max_file_bytes() -> u64 {
    1 << 30
}

impl Default for ReadoutConfig {
    fn default() -> Self {
        Self {
            blt_size: default_blt_size(),
            max_blts: default_max_blts(),
            inter_board_yield: default_inter_board_yield(),
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            mode: ProcessingMode::default(),
            zero_length_encoding: false,
            compress: false,
            compute_integral: false,
            workers: default_workers(),
            min_insert_size: default_min_insert_size(),
            threshold: ReadoutThreshold::default(),
            idle_grace: default_idle_grace(),
            sink_error_policy: SinkErrorPolicy::default(),
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            run_name: default_run_name(),
            log_level: default_log_level(),
            readout: ReadoutConfig::default(),
            processing: ProcessingConfig::default(),
            boards: Vec::new(),
            sink: SinkConfig::default(),
        }
    }
}

impl RunConfig {
    /// Load configuration from a TOML file and `DIGI_DAQ_` environment variables,
    /// then validate it.
    pub fn load_from<P: AsRef<Path>>(path: P) -> DaqResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string (no environment overrides).
    pub fn from_toml_str(toml: &str) -> DaqResult<Self> {
        let config: Self = Figment::new().merge(Toml::string(toml)).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Semantic checks that deserialization cannot express.
    pub fn validate(&self) -> DaqResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.digitizers().next().is_none() {
            return Err(DaqError::Configuration(
                "at least one digitizer board is required".into(),
            ));
        }

        let mut ids = HashSet::new();
        for board in &self.boards {
            if !ids.insert(board.id) {
                return Err(DaqError::Configuration(format!(
                    "Duplicate board id: {}",
                    board.id
                )));
            }
        }

        if self.boards.iter().filter(|b| !b.kind.is_digitizer()).count() > 1 {
            return Err(DaqError::Configuration(
                "at most one crate controller may be configured".into(),
            ));
        }

        if self.processing.workers == 0 {
            return Err(DaqError::Configuration("workers must be at least 1".into()));
        }
        if self.readout.blt_size == 0 {
            return Err(DaqError::Configuration("blt_size must be non-zero".into()));
        }
        if self.readout.max_blts == 0 {
            return Err(DaqError::Configuration("max_blts must be non-zero".into()));
        }

        if let SinkConfig::Database(db) = &self.sink {
            if db.url.trim().is_empty() || db.table.trim().is_empty() {
                return Err(DaqError::Configuration(
                    "database sink needs both url and table".into(),
                ));
            }
        }

        Ok(())
    }

    /// Digitizer boards in configuration order.
    pub fn digitizers(&self) -> impl Iterator<Item = &BoardConfig> {
        self.boards.iter().filter(|b| b.kind.is_digitizer())
    }

    /// The crate controller, if one is configured.
    pub fn controller(&self) -> Option<&BoardConfig> {
        self.boards.iter().find(|b| !b.kind.is_digitizer())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
run_name = "test_run"

[readout]
blt_size = 65536
inter_board_yield = "50us"

[processing]
mode = "channel-split-new-firmware"
workers = 2
sink_error_policy = { retry = 3 }

[processing.threshold]
blocks = 3
interval = "250ms"

[[boards]]
id = 100
kind = "v1724"
base_address = 0x32100000

[[boards]]
id = 101
kind = "v1724"
registers = [{ address = 0x8120, value = 0x0F }]

[[boards]]
id = 900
kind = "v2718"

[sink]
type = "file"
directory = "/tmp/digi"
"#;

    #[test]
    fn test_parse_sample_config() {
        let config = RunConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.run_name, "test_run");
        assert_eq!(config.readout.blt_size, 65536);
        assert_eq!(config.readout.max_blts, 1000);
        assert_eq!(config.readout.inter_board_yield, Duration::from_micros(50));
        assert_eq!(config.processing.mode, ProcessingMode::ChannelSplitNewFirmware);
        assert_eq!(config.processing.threshold.blocks, 3);
        assert_eq!(config.processing.threshold.interval, Duration::from_millis(250));
        assert_eq!(config.processing.sink_error_policy, SinkErrorPolicy::Retry(3));
        assert_eq!(config.boards[0].base_address, 0x3210_0000);
        assert_eq!(config.boards[1].registers[0].address, 0x8120);
        assert_eq!(config.digitizers().count(), 2);
        assert_eq!(config.controller().map(|c| c.id), Some(900));
        match &config.sink {
            SinkConfig::File(file) => {
                assert_eq!(file.directory, PathBuf::from("/tmp/digi"));
                assert_eq!(file.prefix, "digi");
            }
            other => panic!("unexpected sink {:?}", other),
        }
    }

    #[test]
    fn test_rejects_duplicate_board_ids() {
        let mut config = RunConfig::default();
        config.boards = vec![BoardConfig::digitizer(1), BoardConfig::digitizer(1)];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate board id"));
    }

    #[test]
    fn test_rejects_missing_digitizers_and_zero_workers() {
        let config = RunConfig::default();
        assert!(config.validate().is_err());

        let mut config = RunConfig::default();
        config.boards = vec![BoardConfig::digitizer(1)];
        config.processing.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_database_target() {
        let mut config = RunConfig::default();
        config.boards = vec![BoardConfig::digitizer(1)];
        config.sink = SinkConfig::Database(DatabaseSinkConfig {
            url: String::new(),
            table: "occurrences".into(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = RunConfig::load_from(&path).unwrap();
        assert_eq!(config.boards.len(), 3);
    }

    #[test]
    fn test_mode_splits_channels() {
        assert!(ProcessingMode::ChannelSplitLegacy.splits_channels());
        assert!(!ProcessingMode::BlockSplit.splits_channels());
        assert!(!ProcessingMode::Raw.splits_channels());
    }
}
