//! Cycle outcome taxonomy and the pure classifier that produces it.
//!
//! Every cycle ends with exactly one [`CycleOutcome`]. The classifier is the
//! only place that decides between outcomes; everything downstream (failure
//! dispatch, summary buckets, CSV remarks) keys off the result.

use serde::{Deserialize, Serialize};
use std::fmt;

// ── Outcome ────────────────────────────────────────────────────────────────

/// Classified result of one reset attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Target confirmed back online within the boot timeout.
    Success,
    /// Mechanism accepted the reset but the target never came back.
    TargetUnresponsive,
    /// The reset could not be issued or was explicitly rejected.
    MechanismFailure,
    /// Unclassified error while attempting the reset.
    Unknown,
}

impl CycleOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    /// Failure kind for non-success outcomes, `None` for [`CycleOutcome::Success`].
    pub fn failure_kind(self) -> Option<FailureKind> {
        match self {
            Self::Success => None,
            Self::TargetUnresponsive => Some(FailureKind::TargetUnresponsive),
            Self::MechanismFailure => Some(FailureKind::MechanismFailure),
            Self::Unknown => Some(FailureKind::Unknown),
        }
    }
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::TargetUnresponsive => write!(f, "target_unresponsive"),
            Self::MechanismFailure => write!(f, "mechanism_failure"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

// ── Failure Kind ───────────────────────────────────────────────────────────

/// The non-success subset of [`CycleOutcome`]; keys of the handler table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    TargetUnresponsive,
    MechanismFailure,
    Unknown,
}

impl FailureKind {
    /// All failure kinds, in report order.
    pub const ALL: [FailureKind; 3] = [
        FailureKind::TargetUnresponsive,
        FailureKind::MechanismFailure,
        FailureKind::Unknown,
    ];

    /// Classified failures count toward the consecutive-failure threshold.
    /// Unknown failures are soft and never do.
    pub fn is_classified(self) -> bool {
        !matches!(self, Self::Unknown)
    }

    pub fn outcome(self) -> CycleOutcome {
        match self {
            Self::TargetUnresponsive => CycleOutcome::TargetUnresponsive,
            Self::MechanismFailure => CycleOutcome::MechanismFailure,
            Self::Unknown => CycleOutcome::Unknown,
        }
    }

    /// Short remark used in the CSV summary and failure log.
    pub fn remark(self) -> &'static str {
        match self {
            Self::TargetUnresponsive => "Target failed to come back online",
            Self::MechanismFailure => "Reset mechanism failure",
            Self::Unknown => "Unclassified error",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.outcome().fmt(f)
    }
}

// ── Raw Attempt ────────────────────────────────────────────────────────────

/// What the reset mechanism reported, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MechanismReport {
    /// The power transition was acknowledged locally.
    Accepted,
    /// Explicit failure status (command rejected, could not be issued).
    Rejected { reason: String },
    /// Unexpected error or panic inside the mechanism.
    Faulted { error: String },
}

/// Input to [`classify`]: the mechanism report plus whether the target came
/// back online within the boot timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAttempt {
    pub report: MechanismReport,
    pub target_online: bool,
}

impl RawAttempt {
    /// Free-form detail worth keeping on the cycle record.
    pub fn detail(&self) -> Option<String> {
        match &self.report {
            MechanismReport::Accepted if !self.target_online => {
                Some("target did not respond within boot timeout".to_string())
            }
            MechanismReport::Accepted => None,
            MechanismReport::Rejected { reason } => Some(reason.clone()),
            MechanismReport::Faulted { error } => Some(error.clone()),
        }
    }
}

/// Classify one reset attempt. Pure and total.
pub fn classify(attempt: &RawAttempt) -> CycleOutcome {
    match (&attempt.report, attempt.target_online) {
        (MechanismReport::Faulted { .. }, _) => CycleOutcome::Unknown,
        (MechanismReport::Rejected { .. }, _) => CycleOutcome::MechanismFailure,
        (MechanismReport::Accepted, false) => CycleOutcome::TargetUnresponsive,
        (MechanismReport::Accepted, true) => CycleOutcome::Success,
    }
}
