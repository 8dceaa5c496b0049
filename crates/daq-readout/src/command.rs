//! Control commands accepted by [`BoardManager::handle`](crate::BoardManager::handle).
//!
//! The types are serde-ready so any transport can carry them; the transport
//! itself lives outside this crate.

use daq_core::{ErrorKind, RunConfig, SinkConfig};
use serde::{Deserialize, Serialize};

use crate::manager::RunState;

/// One control request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", content = "config", rename_all = "snake_case")]
pub enum Command {
    /// Open boards if needed, then program them for a run.
    Arm(RunConfig),
    /// Start acquisition on armed boards.
    Start,
    /// Stop acquisition and drain the pipeline.
    Stop,
    /// Stop if running, then release the boards.
    Sleep,
    /// Redirect the sink for subsequent writes.
    UpdateSinkTarget(SinkConfig),
}

impl Command {
    /// Wire name of the command.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Arm(_) => "arm",
            Command::Start => "start",
            Command::Stop => "stop",
            Command::Sleep => "sleep",
            Command::UpdateSinkTarget(_) => "update_sink_target",
        }
    }
}

/// Outcome of a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    /// Whether the command was carried out.
    pub accepted: bool,
    /// Manager state after the command.
    pub state: RunState,
    /// Human-readable outcome.
    pub message: String,
    /// Kind of the failure, for rejected commands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
}

impl CommandResponse {
    pub(crate) fn ok(state: RunState, message: impl Into<String>) -> Self {
        Self {
            accepted: true,
            state,
            message: message.into(),
            error: None,
        }
    }

    pub(crate) fn rejected(state: RunState, error: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            accepted: false,
            state,
            message: message.into(),
            error: Some(error),
        }
    }
}
