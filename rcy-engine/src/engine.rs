//! The cycle controller.
//!
//! Drives `total_cycles` strictly sequential iterations of
//! capture → reset → classify → verify → release → record → dispatch.
//! Per-cycle problems never leave the loop; only configuration errors (at
//! build time) and resource-acquisition errors (at run time) propagate.

use crate::capture::{CaptureFactory, CycleCapture, FileCaptureFactory, cycle_log_path};
use crate::config::RunConfig;
use crate::dispatch::{Dispatch, FailureDispatcher, HandlerTable, RecoveryAction, RunState};
use crate::errors::{ConfigError, EngineError};
use crate::mechanism::{ResetKind, ResetMechanism, ResetStatus};
use crate::outcome::{CycleOutcome, FailureKind, MechanismReport, RawAttempt, classify};
use crate::report::{CycleRecord, RunEnd, RunSummary, SummaryReporter};
use crate::target::LivenessProbe;
use crate::workload::{NoWorkload, WorkloadHook};
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, sleep, timeout};
use tracing::{Instrument, debug, error, info, info_span, warn};

// ── Run Control ────────────────────────────────────────────────────────────

/// Cooperative cancellation, checked once per cycle boundary.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    cancelled: Arc<AtomicBool>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop before the next cycle starts. A cycle already in flight finishes.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

// ── Phases ─────────────────────────────────────────────────────────────────

/// Controller state, for logging transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    Idle,
    Running { cycle: u32 },
    Recovering { cycle: u32 },
    Aborted { cycle: u32 },
    Finished,
}

impl fmt::Display for EnginePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running { cycle } => write!(f, "running({cycle})"),
            Self::Recovering { cycle } => write!(f, "recovering({cycle})"),
            Self::Aborted { cycle } => write!(f, "aborted({cycle})"),
            Self::Finished => write!(f, "finished"),
        }
    }
}

fn transition(phase: &mut EnginePhase, next: EnginePhase) {
    debug!(from = %phase, to = %next, "Engine phase transition");
    *phase = next;
}

// ── Builder ────────────────────────────────────────────────────────────────

/// Collects collaborators; [`build`](Self::build) validates everything.
pub struct CycleEngineBuilder {
    config: RunConfig,
    mechanism: Option<Arc<dyn ResetMechanism>>,
    probe: Option<Arc<dyn LivenessProbe>>,
    workload: Arc<dyn WorkloadHook>,
    capture: Arc<dyn CaptureFactory>,
    handlers: Vec<(FailureKind, Arc<dyn RecoveryAction>)>,
    table: Option<HandlerTable>,
}

impl CycleEngineBuilder {
    pub fn mechanism(mut self, mechanism: impl ResetMechanism + 'static) -> Self {
        self.mechanism = Some(Arc::new(mechanism));
        self
    }

    pub fn probe(mut self, probe: impl LivenessProbe + 'static) -> Self {
        self.probe = Some(Arc::new(probe));
        self
    }

    /// Defaults to [`NoWorkload`].
    pub fn workload(mut self, workload: impl WorkloadHook + 'static) -> Self {
        self.workload = Arc::new(workload);
        self
    }

    /// Defaults to [`FileCaptureFactory`].
    pub fn capture_factory(mut self, factory: impl CaptureFactory + 'static) -> Self {
        self.capture = Arc::new(factory);
        self
    }

    /// Register the recovery action for one failure kind.
    pub fn handler(self, kind: FailureKind, action: impl RecoveryAction + 'static) -> Self {
        self.handler_arc(kind, Arc::new(action))
    }

    pub fn handler_arc(mut self, kind: FailureKind, action: Arc<dyn RecoveryAction>) -> Self {
        self.handlers.push((kind, action));
        self
    }

    /// Start from a complete table. Entries registered with
    /// [`handler`](Self::handler) override it, in whichever order the two
    /// are called.
    pub fn handlers(mut self, table: HandlerTable) -> Self {
        self.table = Some(table);
        self
    }

    pub fn build(self) -> Result<CycleEngine, ConfigError> {
        self.config.validate()?;
        let mechanism = self
            .mechanism
            .ok_or(ConfigError::MissingCollaborator("reset mechanism"))?;
        let probe = self
            .probe
            .ok_or(ConfigError::MissingCollaborator("liveness probe"))?;
        let table = match self.table {
            Some(table) => self
                .handlers
                .into_iter()
                .fold(table, |table, (kind, action)| table.with(kind, action)),
            None => HandlerTable::from_entries(self.handlers)?,
        };
        let dispatcher = FailureDispatcher::new(table, self.config.consecutive_failure_threshold)?;

        debug!(
            mechanism = %mechanism.describe(),
            threshold = dispatcher.threshold(),
            handlers = ?dispatcher.table(),
            "Cycle engine built"
        );
        Ok(CycleEngine {
            config: self.config,
            mechanism,
            probe,
            workload: self.workload,
            capture: self.capture,
            dispatcher,
        })
    }
}

// ── Engine ─────────────────────────────────────────────────────────────────

/// A configured reliability run, ready to execute.
pub struct CycleEngine {
    config: RunConfig,
    mechanism: Arc<dyn ResetMechanism>,
    probe: Arc<dyn LivenessProbe>,
    workload: Arc<dyn WorkloadHook>,
    capture: Arc<dyn CaptureFactory>,
    dispatcher: FailureDispatcher,
}

impl fmt::Debug for CycleEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CycleEngine")
            .field("config", &self.config)
            .field("mechanism", &self.mechanism.describe())
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

impl CycleEngine {
    pub fn builder(config: RunConfig) -> CycleEngineBuilder {
        CycleEngineBuilder {
            config,
            mechanism: None,
            probe: None,
            workload: Arc::new(NoWorkload),
            capture: Arc::new(FileCaptureFactory),
            handlers: Vec::new(),
            table: None,
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn mechanism_kind(&self) -> ResetKind {
        self.mechanism.kind()
    }

    /// Execute the run.
    ///
    /// Always yields a summary unless the log directory or a cycle's
    /// diagnostic capture cannot be set up. Summary artifacts are written to
    /// the log directory; a failure to write them is only logged.
    pub async fn run(&self, control: &RunControl) -> Result<RunSummary, EngineError> {
        let config = &self.config;
        std::fs::create_dir_all(&config.log_directory).map_err(|source| {
            EngineError::LogDirectory {
                path: config.log_directory.clone(),
                source,
            }
        })?;

        let mut reporter = SummaryReporter::new(self.mechanism.kind(), config.total_cycles);
        let mut state = RunState::new();
        let mut phase = EnginePhase::Idle;
        let mut end = RunEnd::Completed;

        info!(
            run_id = %reporter.run_id(),
            mechanism = %self.mechanism.describe(),
            cycles = config.total_cycles,
            threshold = config.consecutive_failure_threshold,
            log_dir = %config.log_directory.display(),
            "Starting reset cycling run"
        );

        for cycle in 1..=config.total_cycles {
            if control.is_cancelled() {
                warn!(cycle, "Run cancelled before cycle started");
                end = RunEnd::Cancelled;
                break;
            }
            transition(&mut phase, EnginePhase::Running { cycle });

            let path = cycle_log_path(&config.log_directory, cycle);
            let capture = match CycleCapture::open(self.capture.as_ref(), cycle, path.clone()) {
                Ok(capture) => capture,
                Err(source) => {
                    error!(cycle, path = %path.display(), error = %source, "Cannot open diagnostic capture");
                    let partial = reporter.finalize(RunEnd::Fatal {
                        error: source.to_string(),
                    });
                    return Err(EngineError::CaptureUnavailable {
                        cycle,
                        path,
                        source,
                        partial: Box::new(partial),
                    });
                }
            };

            let record = self
                .run_cycle(cycle, capture)
                .instrument(info_span!("cycle", cycle))
                .await;
            let outcome = record.outcome;
            let workload_failed = record.is_workload_failure();
            let detail = record.detail.clone();
            reporter.record(record)?;

            match outcome.failure_kind() {
                None => {
                    state.record_reset_success();
                    if workload_failed {
                        state.record_workload_failure(cycle, detail.as_deref());
                    }
                }
                Some(kind) => {
                    transition(&mut phase, EnginePhase::Recovering { cycle });
                    let remaining = config.total_cycles - cycle;
                    if let Dispatch::Abort(reason) = self
                        .dispatcher
                        .handle(&mut state, kind, cycle, remaining, detail)
                        .await
                    {
                        transition(
                            &mut phase,
                            EnginePhase::Aborted {
                                cycle: reason.cycle(),
                            },
                        );
                        end = RunEnd::Aborted { reason };
                        break;
                    }
                }
            }
        }

        transition(&mut phase, EnginePhase::Finished);
        let summary = reporter.finalize(end);
        for line in state.failure_log() {
            warn!("{line}");
        }
        info!(
            attempted = summary.total_cycles,
            succeeded = summary.succeeded,
            failed_reset = summary.failed_reset.len(),
            failed_workload = summary.failed_workload.len(),
            end = %summary.end,
            passed = summary.passed(),
            "Reset cycling run finished"
        );

        if let Err(err) = summary.write_artifacts(&config.log_directory) {
            warn!(error = %err, "Failed to write summary artifacts");
        }
        Ok(summary)
    }

    /// One iteration. The capture is released before this returns.
    async fn run_cycle(&self, cycle: u32, mut capture: CycleCapture) -> CycleRecord {
        let started_at = Utc::now();
        info!(cycle, total = self.config.total_cycles, "Cycle started");
        capture.note(format!(
            "cycle {cycle}/{} started; mechanism {}",
            self.config.total_cycles,
            self.mechanism.describe()
        ));

        let (raw, boot_duration) = self.attempt_reset(cycle, &mut capture).await;
        let mut outcome = classify(&raw);
        let mut detail = raw.detail();
        capture.note(format!("outcome: {outcome}"));

        let mut workload_verified = None;
        if outcome.is_success() {
            match self.verify_workload(cycle).await {
                Ok(()) => {
                    capture.note("workload verification passed");
                    workload_verified = Some(true);
                }
                Err(reason) => {
                    warn!(cycle, reason = %reason, "Workload verification failed");
                    capture.note(format!("workload verification failed: {reason}"));
                    workload_verified = Some(false);
                    detail = Some(reason);
                }
            }
        }

        let diagnostic_log_path = capture.path().to_path_buf();
        if let Err(err) = capture.close() {
            warn!(cycle, error = %err, "Diagnostic capture failed; recording cycle as unknown");
            outcome = CycleOutcome::Unknown;
            workload_verified = None;
            detail = Some(format!("diagnostic capture I/O error: {err}"));
        }

        match outcome {
            CycleOutcome::Success => info!(
                cycle,
                boot_ms = boot_duration.map(|d| d.as_millis() as u64),
                workload_verified,
                "Cycle succeeded"
            ),
            _ => warn!(cycle, outcome = %outcome, detail = detail.as_deref().unwrap_or(""), "Cycle failed"),
        }

        CycleRecord {
            cycle_number: cycle,
            outcome,
            boot_duration,
            workload_verified,
            diagnostic_log_path,
            detail,
            started_at,
        }
    }

    /// Issue the reset and, once acknowledged, wait for the target. Boot
    /// duration is measured from the acknowledgement.
    async fn attempt_reset(
        &self,
        cycle: u32,
        capture: &mut CycleCapture,
    ) -> (RawAttempt, Option<Duration>) {
        let mechanism = Arc::clone(&self.mechanism);
        let report = match tokio::task::spawn_blocking(move || mechanism.attempt_cycle(cycle)).await
        {
            Ok(Ok(ResetStatus::Accepted)) => MechanismReport::Accepted,
            Ok(Ok(ResetStatus::Failed { reason })) => MechanismReport::Rejected { reason },
            Ok(Err(err)) => MechanismReport::Faulted {
                error: format!("{err:#}"),
            },
            Err(join) => MechanismReport::Faulted {
                error: format!("reset mechanism panicked: {}", panic_message(join)),
            },
        };

        let note = match &report {
            MechanismReport::Accepted => "reset acknowledged".to_string(),
            MechanismReport::Rejected { reason } => format!("reset rejected: {reason}"),
            MechanismReport::Faulted { error } => format!("reset error: {error}"),
        };
        capture.note(note);
        if report != MechanismReport::Accepted {
            return (raw(report, false), None);
        }

        let acknowledged = Instant::now();
        if !self.config.post_reset_delay.is_zero() {
            debug!(cycle, delay = ?self.config.post_reset_delay, "Waiting before liveness polling");
            sleep(self.config.post_reset_delay).await;
        }

        let boot = match self.wait_for_target(cycle).await {
            Some(_) => {
                let boot = acknowledged.elapsed();
                capture.note(format!("target responsive after {}ms", boot.as_millis()));
                Some(boot)
            }
            None => {
                capture.note(format!(
                    "target not responsive within {}",
                    humantime::format_duration(self.config.boot_timeout)
                ));
                None
            }
        };
        (raw(report, boot.is_some()), boot)
    }

    /// Poll the liveness probe until it answers or the boot window closes.
    async fn wait_for_target(&self, cycle: u32) -> Option<Duration> {
        let started = Instant::now();
        let deadline = started + self.config.boot_timeout;
        let mut probes = 0u32;
        loop {
            probes += 1;
            let probe = Arc::clone(&self.probe);
            let remaining = deadline.saturating_duration_since(Instant::now());
            let joined = run_bounded(
                cycle,
                "liveness probe",
                remaining,
                tokio::task::spawn_blocking(move || probe.is_responsive()),
            )
            .await;
            let responsive = match joined {
                Some(Ok(responsive)) => responsive,
                Some(Err(join)) => {
                    warn!(cycle, error = %panic_message(join), "Liveness probe panicked");
                    false
                }
                None => false,
            };
            if responsive {
                let waited = started.elapsed();
                debug!(cycle, probes, waited_ms = waited.as_millis() as u64, "Target responsive");
                return Some(waited);
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(cycle, probes, "Boot window elapsed");
                return None;
            }
            sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }

    /// Run the workload hook under `workload_timeout`. `Err` carries the reason.
    async fn verify_workload(&self, cycle: u32) -> Result<(), String> {
        let hook = Arc::clone(&self.workload);
        let limit = self.config.workload_timeout;
        let handle = tokio::task::spawn_blocking(move || hook.verify(cycle));
        match run_bounded(cycle, "workload hook", limit, handle).await {
            Some(Ok(Ok(true))) => Ok(()),
            Some(Ok(Ok(false))) => Err("workload verification returned false".to_string()),
            Some(Ok(Err(err))) => Err(format!("{err:#}")),
            Some(Err(join)) => Err(format!("workload hook panicked: {}", panic_message(join))),
            None => Err(format!(
                "workload verification timed out after {}",
                humantime::format_duration(limit)
            )),
        }
    }
}

/// Wait up to `limit` for a blocking collaborator. `None` means it overran;
/// the task is still joined before returning, so it never outlives the cycle.
async fn run_bounded<T>(
    cycle: u32,
    what: &'static str,
    limit: Duration,
    mut handle: JoinHandle<T>,
) -> Option<Result<T, JoinError>> {
    match timeout(limit, &mut handle).await {
        Ok(joined) => Some(joined),
        Err(_) => {
            let overran = Instant::now();
            warn!(cycle, what, limit = ?limit, "Collaborator overran its time limit; waiting for it to return");
            if let Err(join) = handle.await {
                warn!(cycle, what, error = %panic_message(join), "Collaborator failed after overrunning");
            }
            debug!(
                cycle,
                what,
                overrun_ms = overran.elapsed().as_millis() as u64,
                "Overrunning collaborator returned"
            );
            None
        }
    }
}

fn raw(report: MechanismReport, target_online: bool) -> RawAttempt {
    RawAttempt {
        report,
        target_online,
    }
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else {
        "non-string panic payload".to_string()
    }
}
