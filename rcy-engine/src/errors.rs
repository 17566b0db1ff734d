//! Error types and the stable error-code catalog.
//!
//! # Error Code Ranges
//!
//! | Range      | Category  | Description                              |
//! |------------|-----------|------------------------------------------|
//! | E001-E099  | Config    | Run file, validation and wiring errors   |
//! | E100-E199  | Resource  | Log directory and diagnostic capture     |
//! | E500-E599  | Internal  | Invariant violations inside the engine   |
//!
//! Only configuration and resource errors ever leave the engine. Per-cycle
//! failures are recorded in the run summary instead.

use crate::outcome::FailureKind;
use crate::report::RunSummary;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

// ── Catalog ────────────────────────────────────────────────────────────────

/// Stable error codes in the RCY-Exxx format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    /// Run file not found or unreadable
    ConfigReadError,
    /// Run file is not valid TOML or has unknown fields
    ConfigParseError,
    /// A configuration value is out of range
    ConfigValidationError,
    /// A failure kind has no recovery handler
    ConfigMissingHandler,
    /// A required collaborator was not supplied
    ConfigMissingCollaborator,
    /// Log directory could not be created
    LogDirectoryUnavailable,
    /// Per-cycle diagnostic capture could not be opened
    CaptureUnavailable,
    /// Summary reporter rejected a cycle record
    ReportInvariantViolated,
}

impl ErrorCode {
    pub fn number(self) -> u16 {
        match self {
            Self::ConfigReadError => 1,
            Self::ConfigParseError => 2,
            Self::ConfigValidationError => 3,
            Self::ConfigMissingHandler => 4,
            Self::ConfigMissingCollaborator => 5,
            Self::LogDirectoryUnavailable => 100,
            Self::CaptureUnavailable => 101,
            Self::ReportInvariantViolated => 500,
        }
    }

    /// Formatted code, e.g. `RCY-E101`.
    pub fn code_string(self) -> String {
        format!("RCY-E{:03}", self.number())
    }

    /// Remediation hint shown next to fatal errors.
    pub fn remediation(self) -> &'static str {
        match self {
            Self::ConfigReadError => "Check the --config path and file permissions",
            Self::ConfigParseError => "Fix the TOML syntax; durations are strings like \"90s\"",
            Self::ConfigValidationError => {
                "total_cycles, thresholds and timeouts must all be positive"
            }
            Self::ConfigMissingHandler => {
                "Register a recovery action for every failure kind before starting the run"
            }
            Self::ConfigMissingCollaborator => {
                "Supply a reset mechanism and a liveness probe before starting the run"
            }
            Self::LogDirectoryUnavailable => "Check that log_directory is writable",
            Self::CaptureUnavailable => "Check free disk space and permissions on log_directory",
            Self::ReportInvariantViolated => "This is a bug; please report it with the run log",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code_string())
    }
}

// ── Config Errors ──────────────────────────────────────────────────────────

/// Errors detected before any cycle runs.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read run file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse run file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("no recovery handler registered for {0}")]
    MissingHandler(FailureKind),

    #[error("no {0} supplied")]
    MissingCollaborator(&'static str),
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Read { .. } => ErrorCode::ConfigReadError,
            Self::Parse { .. } => ErrorCode::ConfigParseError,
            Self::Invalid { .. } => ErrorCode::ConfigValidationError,
            Self::MissingHandler(_) => ErrorCode::ConfigMissingHandler,
            Self::MissingCollaborator(_) => ErrorCode::ConfigMissingCollaborator,
        }
    }
}

// ── Report Errors ──────────────────────────────────────────────────────────

/// Programming errors caught by the summary reporter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReportError {
    #[error("cycle {0} was already recorded")]
    DuplicateCycle(u32),

    #[error("cycle {cycle} recorded after cycle {last}")]
    OutOfOrder { cycle: u32, last: u32 },

    #[error("cycle numbers start at 1")]
    InvalidCycle,
}

// ── Engine Errors ──────────────────────────────────────────────────────────

/// Errors that abort a run outright. Everything else becomes a cycle record.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("cannot create log directory {path}: {source}")]
    LogDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot open diagnostic capture for cycle {cycle} at {path}: {source}")]
    CaptureUnavailable {
        cycle: u32,
        path: PathBuf,
        #[source]
        source: std::io::Error,
        /// Cycles completed before the failure. Never written as a report.
        partial: Box<RunSummary>,
    },

    #[error("summary reporter rejected a record: {0}")]
    Report(#[from] ReportError),
}

impl EngineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::LogDirectory { .. } => ErrorCode::LogDirectoryUnavailable,
            Self::CaptureUnavailable { .. } => ErrorCode::CaptureUnavailable,
            Self::Report(_) => ErrorCode::ReportInvariantViolated,
        }
    }
}
