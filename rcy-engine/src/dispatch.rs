//! Failure handler dispatch and run bookkeeping.
//!
//! Each non-success outcome is looked up in a [`HandlerTable`] that is total
//! over [`FailureKind`]. The [`FailureDispatcher`] owns the abort policy:
//! classified failures count toward the consecutive-failure threshold,
//! unknown failures never abort.

use crate::command::CommandSpec;
use crate::errors::ConfigError;
use crate::outcome::FailureKind;
use crate::target::{LivenessProbe, wait_until_responsive};
use anyhow::bail;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

// ── Recovery Actions ───────────────────────────────────────────────────────

/// Decision returned by a recovery action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryVerdict {
    Continue,
    Abort,
}

/// What a recovery action gets to see about the failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureContext {
    pub cycle: u32,
    pub kind: FailureKind,
    /// Consecutive classified failures including this one.
    pub consecutive_failures: u32,
    /// Cycles still planned after this one.
    pub remaining_cycles: u32,
    pub detail: Option<String>,
}

/// Recovery step run after a failed cycle. Runs on the blocking pool.
pub trait RecoveryAction: Send + Sync {
    fn name(&self) -> &'static str;

    fn recover(&self, ctx: &FailureContext) -> RecoveryVerdict;
}

/// Log the failure and move on to the next cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAndContinue;

impl RecoveryAction for LogAndContinue {
    fn name(&self) -> &'static str {
        "continue"
    }

    fn recover(&self, ctx: &FailureContext) -> RecoveryVerdict {
        warn!(
            cycle = ctx.cycle,
            kind = %ctx.kind,
            consecutive = ctx.consecutive_failures,
            "Cycle failed; continuing"
        );
        RecoveryVerdict::Continue
    }
}

/// Stop the run at the first failure of this kind.
#[derive(Debug, Clone, Copy, Default)]
pub struct EscalateAndAbort;

impl RecoveryAction for EscalateAndAbort {
    fn name(&self) -> &'static str {
        "abort"
    }

    fn recover(&self, ctx: &FailureContext) -> RecoveryVerdict {
        error!(
            cycle = ctx.cycle,
            kind = %ctx.kind,
            detail = ctx.detail.as_deref().unwrap_or(""),
            "Cycle failed; escalating and aborting run"
        );
        RecoveryVerdict::Abort
    }
}

/// Out-of-band power restore used to bring a wedged target back.
pub trait PowerRestore: Send + Sync {
    fn restore(&self) -> anyhow::Result<()>;
}

impl<F> PowerRestore for F
where
    F: Fn() -> anyhow::Result<()> + Send + Sync,
{
    fn restore(&self) -> anyhow::Result<()> {
        self()
    }
}

/// Power restore backed by an external command, e.g. a PDU outlet cycle.
#[derive(Debug, Clone)]
pub struct CommandRestore {
    command: CommandSpec,
}

impl CommandRestore {
    pub fn new(command: CommandSpec) -> Self {
        Self { command }
    }
}

impl PowerRestore for CommandRestore {
    fn restore(&self) -> anyhow::Result<()> {
        let output = self.command.run()?;
        if !output.success() {
            bail!(
                "{} failed: {}",
                self.command.display(),
                output.failure_reason()
            );
        }
        Ok(())
    }
}

/// Restore power up to `max_attempts` times, waiting for the target after
/// each attempt. Aborts the run when the target cannot be brought back.
pub struct BoundedRetry {
    restore: Arc<dyn PowerRestore>,
    probe: Arc<dyn LivenessProbe>,
    max_attempts: u32,
    boot_timeout: Duration,
    poll_interval: Duration,
}

impl BoundedRetry {
    pub fn new(
        restore: Arc<dyn PowerRestore>,
        probe: Arc<dyn LivenessProbe>,
        max_attempts: u32,
        boot_timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Self, ConfigError> {
        if max_attempts == 0 {
            return Err(ConfigError::invalid(
                "recovery.max_attempts",
                "must be at least 1",
            ));
        }
        Ok(Self {
            restore,
            probe,
            max_attempts,
            boot_timeout,
            poll_interval,
        })
    }
}

impl fmt::Debug for BoundedRetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedRetry")
            .field("max_attempts", &self.max_attempts)
            .field("boot_timeout", &self.boot_timeout)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl RecoveryAction for BoundedRetry {
    fn name(&self) -> &'static str {
        "retry"
    }

    fn recover(&self, ctx: &FailureContext) -> RecoveryVerdict {
        if ctx.remaining_cycles == 0 {
            info!(cycle = ctx.cycle, "Last cycle failed; skipping recovery");
            return RecoveryVerdict::Continue;
        }

        for attempt in 1..=self.max_attempts {
            info!(
                cycle = ctx.cycle,
                attempt,
                max_attempts = self.max_attempts,
                "Restoring target power"
            );
            if let Err(err) = self.restore.restore() {
                warn!(cycle = ctx.cycle, attempt, error = %err, "Power restore failed");
                continue;
            }
            if let Some(waited) =
                wait_until_responsive(self.probe.as_ref(), self.boot_timeout, self.poll_interval)
            {
                info!(
                    cycle = ctx.cycle,
                    attempt,
                    waited_ms = waited.as_millis() as u64,
                    "Target recovered"
                );
                return RecoveryVerdict::Continue;
            }
            warn!(cycle = ctx.cycle, attempt, "Target still unresponsive after restore");
        }

        error!(
            cycle = ctx.cycle,
            attempts = self.max_attempts,
            "Target could not be recovered"
        );
        RecoveryVerdict::Abort
    }
}

// ── Handler Table ──────────────────────────────────────────────────────────

/// Recovery action per failure kind. Total by construction and read-only
/// for the lifetime of a run.
#[derive(Clone)]
pub struct HandlerTable {
    target_unresponsive: Arc<dyn RecoveryAction>,
    mechanism_failure: Arc<dyn RecoveryAction>,
    unknown: Arc<dyn RecoveryAction>,
}

impl HandlerTable {
    /// Build from explicit entries. Every [`FailureKind`] must be present;
    /// later entries for the same kind replace earlier ones.
    pub fn from_entries(
        entries: impl IntoIterator<Item = (FailureKind, Arc<dyn RecoveryAction>)>,
    ) -> Result<Self, ConfigError> {
        let mut map: BTreeMap<FailureKind, Arc<dyn RecoveryAction>> = entries.into_iter().collect();
        let mut take = |kind: FailureKind| map.remove(&kind).ok_or(ConfigError::MissingHandler(kind));
        Ok(Self {
            target_unresponsive: take(FailureKind::TargetUnresponsive)?,
            mechanism_failure: take(FailureKind::MechanismFailure)?,
            unknown: take(FailureKind::Unknown)?,
        })
    }

    /// Same action for every failure kind.
    pub fn uniform(action: Arc<dyn RecoveryAction>) -> Self {
        Self {
            target_unresponsive: Arc::clone(&action),
            mechanism_failure: Arc::clone(&action),
            unknown: action,
        }
    }

    /// Replace the action for `kind`.
    pub fn with(mut self, kind: FailureKind, action: Arc<dyn RecoveryAction>) -> Self {
        match kind {
            FailureKind::TargetUnresponsive => self.target_unresponsive = action,
            FailureKind::MechanismFailure => self.mechanism_failure = action,
            FailureKind::Unknown => self.unknown = action,
        }
        self
    }

    pub fn get(&self, kind: FailureKind) -> &Arc<dyn RecoveryAction> {
        match kind {
            FailureKind::TargetUnresponsive => &self.target_unresponsive,
            FailureKind::MechanismFailure => &self.mechanism_failure,
            FailureKind::Unknown => &self.unknown,
        }
    }
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::uniform(Arc::new(LogAndContinue))
    }
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for kind in FailureKind::ALL {
            map.entry(&kind, &self.get(kind).name());
        }
        map.finish()
    }
}

// ── Run State ──────────────────────────────────────────────────────────────

/// Per-run failure bookkeeping, threaded explicitly through the cycle loop.
#[derive(Debug, Clone, Default)]
pub struct RunState {
    consecutive_reset_failures: u32,
    totals: BTreeMap<FailureKind, u32>,
    workload_failures: u32,
    previous_failure_cycle: Option<u32>,
    failure_log: Vec<String>,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn consecutive_reset_failures(&self) -> u32 {
        self.consecutive_reset_failures
    }

    pub fn total(&self, kind: FailureKind) -> u32 {
        self.totals.get(&kind).copied().unwrap_or(0)
    }

    pub fn workload_failures(&self) -> u32 {
        self.workload_failures
    }

    pub fn previous_failure_cycle(&self) -> Option<u32> {
        self.previous_failure_cycle
    }

    pub fn failure_log(&self) -> &[String] {
        &self.failure_log
    }

    /// A successful reset breaks any failure streak.
    pub fn record_reset_success(&mut self) {
        self.consecutive_reset_failures = 0;
    }

    /// Count a reset failure. Unknown failures leave the streak untouched.
    pub fn record_reset_failure(&mut self, cycle: u32, kind: FailureKind, detail: Option<&str>) {
        if kind.is_classified() {
            self.consecutive_reset_failures += 1;
        }
        *self.totals.entry(kind).or_insert(0) += 1;
        self.log_failure(cycle, kind.remark(), detail);
    }

    /// Count a workload failure. Never touches the reset streak.
    pub fn record_workload_failure(&mut self, cycle: u32, detail: Option<&str>) {
        self.workload_failures += 1;
        self.log_failure(cycle, "Workload verification failed", detail);
    }

    fn log_failure(&mut self, cycle: u32, remark: &str, detail: Option<&str>) {
        let mut entry = format!("Cycle #{cycle}: {remark}");
        if let Some(detail) = detail {
            entry.push_str(&format!(" ({detail})"));
        }
        match self.previous_failure_cycle {
            Some(prev) => entry.push_str(&format!("; previous failure at cycle #{prev}")),
            None => entry.push_str("; first failure of the run"),
        }
        self.failure_log.push(entry);
        self.previous_failure_cycle = Some(cycle);
    }
}

// ── Dispatcher ─────────────────────────────────────────────────────────────

/// Why a run stopped early.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum AbortReason {
    /// Back-to-back classified failures reached the configured threshold.
    ThresholdReached {
        cycle: u32,
        consecutive: u32,
        threshold: u32,
    },
    /// A recovery action asked to stop.
    RecoveryAborted {
        cycle: u32,
        kind: FailureKind,
        action: String,
    },
}

impl AbortReason {
    pub fn cycle(&self) -> u32 {
        match self {
            Self::ThresholdReached { cycle, .. } | Self::RecoveryAborted { cycle, .. } => *cycle,
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ThresholdReached {
                cycle,
                consecutive,
                threshold,
            } => write!(
                f,
                "{consecutive} consecutive reset failures at cycle {cycle} (threshold {threshold})"
            ),
            Self::RecoveryAborted {
                cycle,
                kind,
                action,
            } => write!(f, "{action} recovery aborted the run after {kind} at cycle {cycle}"),
        }
    }
}

/// Result of dispatching one failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Continue,
    Abort(AbortReason),
}

impl Dispatch {
    pub fn should_continue(&self) -> bool {
        matches!(self, Self::Continue)
    }
}

/// Applies the handler table and the consecutive-failure threshold.
#[derive(Debug, Clone)]
pub struct FailureDispatcher {
    table: HandlerTable,
    threshold: u32,
}

impl FailureDispatcher {
    pub fn new(table: HandlerTable, threshold: u32) -> Result<Self, ConfigError> {
        if threshold == 0 {
            return Err(ConfigError::invalid(
                "consecutive_failure_threshold",
                "must be at least 1",
            ));
        }
        Ok(Self { table, threshold })
    }

    pub fn table(&self) -> &HandlerTable {
        &self.table
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Record a reset failure in `state` and decide whether the run goes on.
    ///
    /// The threshold is checked before the recovery action runs, so a tripped
    /// threshold never triggers recovery. Unknown failures always continue.
    pub async fn handle(
        &self,
        state: &mut RunState,
        kind: FailureKind,
        cycle: u32,
        remaining_cycles: u32,
        detail: Option<String>,
    ) -> Dispatch {
        state.record_reset_failure(cycle, kind, detail.as_deref());
        let consecutive = state.consecutive_reset_failures();

        if kind.is_classified() && consecutive >= self.threshold {
            error!(
                cycle,
                kind = %kind,
                consecutive,
                threshold = self.threshold,
                "Consecutive failure threshold reached; aborting run"
            );
            return Dispatch::Abort(AbortReason::ThresholdReached {
                cycle,
                consecutive,
                threshold: self.threshold,
            });
        }

        let action = Arc::clone(self.table.get(kind));
        let ctx = FailureContext {
            cycle,
            kind,
            consecutive_failures: consecutive,
            remaining_cycles,
            detail,
        };
        let name = action.name();
        let verdict = match tokio::task::spawn_blocking(move || action.recover(&ctx)).await {
            Ok(verdict) => verdict,
            Err(err) => {
                error!(cycle, action = name, error = %err, "Recovery action panicked");
                RecoveryVerdict::Abort
            }
        };

        match (verdict, kind.is_classified()) {
            (RecoveryVerdict::Continue, _) => Dispatch::Continue,
            (RecoveryVerdict::Abort, false) => {
                warn!(cycle, action = name, "Ignoring abort for unclassified failure");
                Dispatch::Continue
            }
            (RecoveryVerdict::Abort, true) => Dispatch::Abort(AbortReason::RecoveryAborted {
                cycle,
                kind,
                action: name.to_string(),
            }),
        }
    }
}
