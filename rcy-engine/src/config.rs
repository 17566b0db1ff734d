//! Run configuration and the TOML run file.
//!
//! [`RunConfig`] is the validated in-memory form the engine runs with.
//! [`RunFile`] is what operators write: it names the commands behind each
//! collaborator and the recovery choice per failure kind, and
//! [`RunFile::build_engine`] wires everything into a [`CycleEngine`].

use crate::command::CommandSpec;
use crate::dispatch::{BoundedRetry, CommandRestore, EscalateAndAbort, LogAndContinue, RecoveryAction};
use crate::engine::CycleEngine;
use crate::errors::ConfigError;
use crate::mechanism::{CommandMechanism, ResetKind};
use crate::outcome::FailureKind;
use crate::target::CommandProbe;
use crate::workload::{CommandWorkload, NoWorkload};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

// ── Run Config ─────────────────────────────────────────────────────────────

/// Validated settings for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    /// Number of cycles to attempt (> 0).
    pub total_cycles: u32,
    /// How long to wait for the target after a reset is acknowledged.
    pub boot_timeout: Duration,
    /// Back-to-back classified failures that abort the run (>= 1).
    pub consecutive_failure_threshold: u32,
    /// Upper bound on one workload verification.
    pub workload_timeout: Duration,
    /// Where `cycle_<N>.log` and the summary artifacts go.
    pub log_directory: PathBuf,
    /// Delay between liveness probes.
    pub poll_interval: Duration,
    /// Settle time after the acknowledgement before polling starts.
    pub post_reset_delay: Duration,
}

impl RunConfig {
    pub const DEFAULT_BOOT_TIMEOUT: Duration = Duration::from_secs(600);
    pub const DEFAULT_WORKLOAD_TIMEOUT: Duration = Duration::from_secs(300);
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
    pub const DEFAULT_THRESHOLD: u32 = 3;

    pub fn new(total_cycles: u32, log_directory: impl Into<PathBuf>) -> Self {
        Self {
            total_cycles,
            boot_timeout: Self::DEFAULT_BOOT_TIMEOUT,
            consecutive_failure_threshold: Self::DEFAULT_THRESHOLD,
            workload_timeout: Self::DEFAULT_WORKLOAD_TIMEOUT,
            log_directory: log_directory.into(),
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            post_reset_delay: Duration::ZERO,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.total_cycles == 0 {
            return Err(ConfigError::invalid("total_cycles", "must be greater than zero"));
        }
        if self.consecutive_failure_threshold == 0 {
            return Err(ConfigError::invalid(
                "consecutive_failure_threshold",
                "must be at least 1",
            ));
        }
        if self.boot_timeout.is_zero() {
            return Err(ConfigError::invalid("boot_timeout", "must be greater than zero"));
        }
        if self.workload_timeout.is_zero() {
            return Err(ConfigError::invalid("workload_timeout", "must be greater than zero"));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::invalid("poll_interval", "must be greater than zero"));
        }
        if self.log_directory.as_os_str().is_empty() {
            return Err(ConfigError::invalid("log_directory", "must not be empty"));
        }
        Ok(())
    }
}

// ── Run File ───────────────────────────────────────────────────────────────

/// On-disk run description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunFile {
    pub run: RunSection,
    pub mechanism: MechanismSection,
    pub liveness: CommandSection,
    #[serde(default)]
    pub workload: Option<WorkloadSection>,
    #[serde(default)]
    pub recovery: Option<RecoverySection>,
    #[serde(default)]
    pub handlers: HandlersSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunSection {
    pub total_cycles: u32,
    pub log_directory: PathBuf,
    #[serde(default = "default_boot_timeout", with = "humantime_serde")]
    pub boot_timeout: Duration,
    #[serde(default = "default_threshold")]
    pub consecutive_failure_threshold: u32,
    #[serde(default = "default_workload_timeout", with = "humantime_serde")]
    pub workload_timeout: Duration,
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(default, with = "humantime_serde")]
    pub post_reset_delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MechanismSection {
    pub kind: ResetKind,
    pub command: Vec<String>,
    /// Acknowledgement timeout for the reset command.
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Overrides the per-kind default (on for warm resets).
    #[serde(default)]
    pub tolerate_disconnect: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandSection {
    pub command: Vec<String>,
    #[serde(default = "default_probe_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// The workload command is bounded by `run.workload_timeout`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkloadSection {
    pub command: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecoverySection {
    pub command: Vec<String>,
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HandlersSection {
    pub target_unresponsive: Option<HandlerChoice>,
    pub mechanism_failure: Option<HandlerChoice>,
    pub unknown: Option<HandlerChoice>,
}

impl HandlersSection {
    fn get(&self, kind: FailureKind) -> Option<HandlerChoice> {
        match kind {
            FailureKind::TargetUnresponsive => self.target_unresponsive,
            FailureKind::MechanismFailure => self.mechanism_failure,
            FailureKind::Unknown => self.unknown,
        }
    }
}

/// Recovery choice for one failure kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerChoice {
    /// Log and go on with the next cycle.
    Continue,
    /// Stop the run.
    Abort,
    /// Restore power through `[recovery]`, abort if the target stays down.
    Retry,
}

fn default_boot_timeout() -> Duration {
    RunConfig::DEFAULT_BOOT_TIMEOUT
}

fn default_workload_timeout() -> Duration {
    RunConfig::DEFAULT_WORKLOAD_TIMEOUT
}

fn default_poll_interval() -> Duration {
    RunConfig::DEFAULT_POLL_INTERVAL
}

fn default_threshold() -> u32 {
    RunConfig::DEFAULT_THRESHOLD
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_attempts() -> u32 {
    3
}

impl RunFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded run file");
        Self::parse(&contents, path)
    }

    /// Parse TOML text; `origin` is only used in error messages.
    pub fn parse(contents: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|err| ConfigError::Parse {
            path: origin.to_path_buf(),
            message: err.to_string(),
        })
    }

    /// Apply command-line overrides before validation.
    pub fn apply_overrides(&mut self, total_cycles: Option<u32>, log_directory: Option<PathBuf>) {
        if let Some(total_cycles) = total_cycles {
            self.run.total_cycles = total_cycles;
        }
        if let Some(log_directory) = log_directory {
            self.run.log_directory = log_directory;
        }
    }

    pub fn run_config(&self) -> RunConfig {
        let run = &self.run;
        RunConfig {
            total_cycles: run.total_cycles,
            boot_timeout: run.boot_timeout,
            consecutive_failure_threshold: run.consecutive_failure_threshold,
            workload_timeout: run.workload_timeout,
            log_directory: run.log_directory.clone(),
            poll_interval: run.poll_interval,
            post_reset_delay: run.post_reset_delay,
        }
    }

    /// Wire command-backed collaborators and build a ready engine.
    pub fn build_engine(&self) -> Result<CycleEngine, ConfigError> {
        let config = self.run_config();
        config.validate()?;

        let mechanism_cmd = CommandSpec::new(
            "mechanism.command",
            self.mechanism.command.clone(),
            self.mechanism.timeout,
        )?;
        let mut mechanism = CommandMechanism::new(self.mechanism.kind, mechanism_cmd);
        if let Some(tolerate) = self.mechanism.tolerate_disconnect {
            mechanism = mechanism.with_tolerate_disconnect(tolerate);
        }

        let probe = CommandProbe::new(CommandSpec::new(
            "liveness.command",
            self.liveness.command.clone(),
            self.liveness.timeout,
        )?);

        let mut builder = CycleEngine::builder(config.clone())
            .mechanism(mechanism)
            .probe(probe.clone());

        builder = match &self.workload {
            Some(workload) => builder.workload(CommandWorkload::new(CommandSpec::new(
                "workload.command",
                workload.command.clone(),
                config.workload_timeout,
            )?)),
            None => builder.workload(NoWorkload),
        };

        for kind in FailureKind::ALL {
            let choice = self
                .handlers
                .get(kind)
                .ok_or(ConfigError::MissingHandler(kind))?;
            let action: Arc<dyn RecoveryAction> = match choice {
                HandlerChoice::Continue => Arc::new(LogAndContinue),
                HandlerChoice::Abort => Arc::new(EscalateAndAbort),
                HandlerChoice::Retry => {
                    let recovery = self.recovery.as_ref().ok_or_else(|| {
                        ConfigError::invalid(
                            "handlers",
                            format!("{kind} uses retry but no [recovery] command is configured"),
                        )
                    })?;
                    let restore = CommandRestore::new(CommandSpec::new(
                        "recovery.command",
                        recovery.command.clone(),
                        recovery.timeout,
                    )?);
                    Arc::new(BoundedRetry::new(
                        Arc::new(restore),
                        Arc::new(probe.clone()),
                        recovery.max_attempts,
                        config.boot_timeout,
                        config.poll_interval,
                    )?)
                }
            };
            builder = builder.handler_arc(kind, action);
        }

        builder.build()
    }
}
