//! Reset mechanism capability.
//!
//! One mechanism is selected per run. The engine only ever calls
//! [`ResetMechanism::attempt_cycle`]; it never inspects which variant it holds.

use crate::command::{CommandError, CommandSpec};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

/// The ways a target can be power-cycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetKind {
    /// In-band OS reboot.
    Warm,
    /// DC power off/on.
    Cold,
    /// AC power removed and restored.
    AcCycle,
    /// Out-of-band cycle through the Redfish service.
    Redfish,
    /// Out-of-band cycle through IPMI chassis control.
    Ipmi,
}

impl ResetKind {
    /// Warm resets are issued over a session the reboot itself tears down, so
    /// a dropped connection is expected rather than a failure.
    pub fn tolerates_disconnect_by_default(self) -> bool {
        matches!(self, Self::Warm)
    }
}

impl fmt::Display for ResetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Warm => write!(f, "warm"),
            Self::Cold => write!(f, "cold"),
            Self::AcCycle => write!(f, "ac_cycle"),
            Self::Redfish => write!(f, "redfish"),
            Self::Ipmi => write!(f, "ipmi"),
        }
    }
}

/// Explicit status from a reset attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetStatus {
    /// The power transition was acknowledged.
    Accepted,
    /// The reset could not be issued or was rejected.
    Failed { reason: String },
}

impl ResetStatus {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }
}

/// Performs one power-transition attempt.
///
/// Implementations wait for the local acknowledgement only. Waiting for the
/// target OS is the cycle controller's job. An `Err` (or a panic) is an
/// unclassified error; a rejected reset must be reported as
/// [`ResetStatus::Failed`].
pub trait ResetMechanism: Send + Sync {
    fn kind(&self) -> ResetKind;

    fn attempt_cycle(&self, cycle: u32) -> anyhow::Result<ResetStatus>;

    /// Loggable description of what the mechanism runs.
    fn describe(&self) -> String {
        self.kind().to_string()
    }
}

/// Closure-backed mechanism for ad-hoc wiring.
pub struct FnMechanism<F> {
    kind: ResetKind,
    attempt: F,
}

impl<F> FnMechanism<F>
where
    F: Fn(u32) -> anyhow::Result<ResetStatus> + Send + Sync,
{
    pub fn new(kind: ResetKind, attempt: F) -> Self {
        Self { kind, attempt }
    }
}

impl<F> ResetMechanism for FnMechanism<F>
where
    F: Fn(u32) -> anyhow::Result<ResetStatus> + Send + Sync,
{
    fn kind(&self) -> ResetKind {
        self.kind
    }

    fn attempt_cycle(&self, cycle: u32) -> anyhow::Result<ResetStatus> {
        (self.attempt)(cycle)
    }
}

/// Mechanism backed by an external command (`ipmitool`, `redfishtool`, a PDU
/// script, `ssh host reboot`, ...).
#[derive(Debug, Clone)]
pub struct CommandMechanism {
    kind: ResetKind,
    command: CommandSpec,
    tolerate_disconnect: bool,
}

impl CommandMechanism {
    pub fn new(kind: ResetKind, command: CommandSpec) -> Self {
        Self {
            kind,
            command,
            tolerate_disconnect: kind.tolerates_disconnect_by_default(),
        }
    }

    /// Accept a non-zero exit as a successful issue of the reset.
    pub fn with_tolerate_disconnect(mut self, tolerate: bool) -> Self {
        self.tolerate_disconnect = tolerate;
        self
    }

    pub fn tolerate_disconnect(&self) -> bool {
        self.tolerate_disconnect
    }
}

impl ResetMechanism for CommandMechanism {
    fn kind(&self) -> ResetKind {
        self.kind
    }

    fn describe(&self) -> String {
        format!("{} ({})", self.kind, self.command.display())
    }

    fn attempt_cycle(&self, cycle: u32) -> anyhow::Result<ResetStatus> {
        match self.command.run_for_cycle(cycle) {
            Ok(output) if output.success() => {
                debug!(kind = %self.kind, cycle, "Reset acknowledged");
                Ok(ResetStatus::Accepted)
            }
            Ok(output) if self.tolerate_disconnect => {
                warn!(
                    kind = %self.kind,
                    cycle,
                    reason = %output.failure_reason(),
                    "Reset command exited non-zero; treating as session drop during reboot"
                );
                Ok(ResetStatus::Accepted)
            }
            Ok(output) => Ok(ResetStatus::failed(output.failure_reason())),
            Err(err @ (CommandError::Spawn { .. } | CommandError::TimedOut { .. })) => {
                Ok(ResetStatus::failed(err.to_string()))
            }
            Err(err @ CommandError::Wait { .. }) => Err(err.into()),
        }
    }
}
