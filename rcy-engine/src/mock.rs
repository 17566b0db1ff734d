//! Deterministic collaborators for tests.
//!
//! All mocks are cheap to clone and share their state between clones, so a
//! test can hand one clone to the engine and keep another to inspect calls.

use crate::capture::{CaptureFactory, CaptureSink};
use crate::dispatch::PowerRestore;
use crate::mechanism::{ResetKind, ResetMechanism, ResetStatus};
use crate::target::LivenessProbe;
use crate::workload::WorkloadHook;
use anyhow::anyhow;
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ── Liveness ───────────────────────────────────────────────────────────────

/// Liveness probe whose answer is flipped by the test or by a
/// [`ScriptedMechanism`] wired to it.
#[derive(Debug, Clone)]
pub struct ScriptedProbe {
    responsive: Arc<AtomicBool>,
    calls: Arc<AtomicU32>,
}

impl ScriptedProbe {
    pub fn responsive() -> Self {
        Self::with_state(true)
    }

    pub fn unresponsive() -> Self {
        Self::with_state(false)
    }

    fn with_state(responsive: bool) -> Self {
        Self {
            responsive: Arc::new(AtomicBool::new(responsive)),
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn set_responsive(&self, responsive: bool) {
        self.responsive.store(responsive, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl LivenessProbe for ScriptedProbe {
    fn is_responsive(&self) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.responsive.load(Ordering::SeqCst)
    }
}

// ── Reset Mechanism ────────────────────────────────────────────────────────

/// One scripted reset attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MechanismStep {
    /// Acknowledge; the wired target comes back.
    Accept,
    /// Acknowledge; the wired target stays down.
    AcceptNoBoot,
    /// Explicit failure status.
    Reject(String),
    /// Unexpected error.
    Error(String),
    /// Panic inside the mechanism.
    Panic,
}

/// Reset mechanism driven by per-cycle overrides, then a FIFO script, then a
/// default step.
#[derive(Debug, Clone)]
pub struct ScriptedMechanism {
    kind: ResetKind,
    per_cycle: Arc<Mutex<BTreeMap<u32, MechanismStep>>>,
    script: Arc<Mutex<VecDeque<MechanismStep>>>,
    default_step: MechanismStep,
    target: Option<ScriptedProbe>,
    calls: Arc<Mutex<Vec<u32>>>,
}

impl ScriptedMechanism {
    pub fn new(kind: ResetKind) -> Self {
        Self {
            kind,
            per_cycle: Arc::new(Mutex::new(BTreeMap::new())),
            script: Arc::new(Mutex::new(VecDeque::new())),
            default_step: MechanismStep::Accept,
            target: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Flip `probe` on every accepted attempt.
    pub fn with_target(mut self, probe: ScriptedProbe) -> Self {
        self.target = Some(probe);
        self
    }

    pub fn with_default(mut self, step: MechanismStep) -> Self {
        self.default_step = step;
        self
    }

    /// Use `step` whenever `cycle` is attempted.
    pub fn on_cycle(self, cycle: u32, step: MechanismStep) -> Self {
        self.per_cycle
            .lock()
            .expect("per_cycle mutex poisoned")
            .insert(cycle, step);
        self
    }

    /// Append a scripted step. Steps are consumed FIFO.
    pub fn push(&self, step: MechanismStep) {
        self.script
            .lock()
            .expect("script mutex poisoned")
            .push_back(step);
    }

    /// Cycle numbers of every attempt, in call order.
    pub fn calls(&self) -> Vec<u32> {
        self.calls.lock().expect("calls mutex poisoned").clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("calls mutex poisoned").len()
    }

    fn next_step(&self, cycle: u32) -> MechanismStep {
        if let Some(step) = self
            .per_cycle
            .lock()
            .expect("per_cycle mutex poisoned")
            .get(&cycle)
        {
            return step.clone();
        }
        self.script
            .lock()
            .expect("script mutex poisoned")
            .pop_front()
            .unwrap_or_else(|| self.default_step.clone())
    }
}

impl ResetMechanism for ScriptedMechanism {
    fn kind(&self) -> ResetKind {
        self.kind
    }

    fn attempt_cycle(&self, cycle: u32) -> anyhow::Result<ResetStatus> {
        self.calls.lock().expect("calls mutex poisoned").push(cycle);
        match self.next_step(cycle) {
            MechanismStep::Accept => {
                if let Some(target) = &self.target {
                    target.set_responsive(true);
                }
                Ok(ResetStatus::Accepted)
            }
            MechanismStep::AcceptNoBoot => {
                if let Some(target) = &self.target {
                    target.set_responsive(false);
                }
                Ok(ResetStatus::Accepted)
            }
            MechanismStep::Reject(reason) => Ok(ResetStatus::Failed { reason }),
            MechanismStep::Error(message) => Err(anyhow!(message)),
            MechanismStep::Panic => panic!("scripted mechanism panic at cycle {cycle}"),
        }
    }
}

// ── Workload ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum WorkloadStep {
    Fail,
    Error,
    Panic,
    Stall(Duration),
}

/// Workload hook that passes unless told otherwise for a given cycle.
#[derive(Debug, Clone, Default)]
pub struct ScriptedWorkload {
    steps: BTreeMap<u32, WorkloadStep>,
    calls: Arc<Mutex<Vec<u32>>>,
}

impl ScriptedWorkload {
    pub fn passing() -> Self {
        Self::default()
    }

    /// Return `Ok(false)` on `cycle`.
    pub fn fail_on(mut self, cycle: u32) -> Self {
        self.steps.insert(cycle, WorkloadStep::Fail);
        self
    }

    /// Return an error on `cycle`.
    pub fn error_on(mut self, cycle: u32) -> Self {
        self.steps.insert(cycle, WorkloadStep::Error);
        self
    }

    pub fn panic_on(mut self, cycle: u32) -> Self {
        self.steps.insert(cycle, WorkloadStep::Panic);
        self
    }

    /// Block for `duration` on `cycle`, then pass.
    pub fn stall_on(mut self, cycle: u32, duration: Duration) -> Self {
        self.steps.insert(cycle, WorkloadStep::Stall(duration));
        self
    }

    pub fn calls(&self) -> Vec<u32> {
        self.calls.lock().expect("calls mutex poisoned").clone()
    }
}

impl WorkloadHook for ScriptedWorkload {
    fn verify(&self, cycle: u32) -> anyhow::Result<bool> {
        self.calls.lock().expect("calls mutex poisoned").push(cycle);
        match self.steps.get(&cycle) {
            None => Ok(true),
            Some(WorkloadStep::Fail) => Ok(false),
            Some(WorkloadStep::Error) => Err(anyhow!("guest workload did not start on cycle {cycle}")),
            Some(WorkloadStep::Panic) => panic!("scripted workload panic at cycle {cycle}"),
            Some(WorkloadStep::Stall(duration)) => {
                std::thread::sleep(*duration);
                Ok(true)
            }
        }
    }
}

// ── Power Restore ──────────────────────────────────────────────────────────

/// Power restore that counts calls and can bring a probe back on a given attempt.
#[derive(Debug, Clone, Default)]
pub struct ScriptedRestore {
    calls: Arc<AtomicU32>,
    revive: Option<(ScriptedProbe, u32)>,
    failing: bool,
}

impl ScriptedRestore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `probe` responsive on the `attempt`-th call (1-based).
    pub fn revive(mut self, probe: ScriptedProbe, attempt: u32) -> Self {
        self.revive = Some((probe, attempt));
        self
    }

    /// Every restore call returns an error.
    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PowerRestore for ScriptedRestore {
    fn restore(&self) -> anyhow::Result<()> {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing {
            return Err(anyhow!("PDU did not respond"));
        }
        if let Some((probe, on_attempt)) = &self.revive
            && attempt >= *on_attempt
        {
            probe.set_responsive(true);
        }
        Ok(())
    }
}

// ── Capture ────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct CaptureLedger {
    opens: u32,
    releases: u32,
    released_cycles: Vec<u32>,
    paths: Vec<PathBuf>,
    lines: BTreeMap<u32, Vec<String>>,
}

/// In-memory capture factory that counts opens and releases.
#[derive(Debug, Clone, Default)]
pub struct CountingCaptureFactory {
    ledger: Arc<Mutex<CaptureLedger>>,
    fail_open_on: Option<u32>,
    fail_writes_on: Option<u32>,
    fail_release_on: Option<u32>,
}

impl CountingCaptureFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// `open` fails for `cycle`, as if the disk were full.
    pub fn fail_open_on(mut self, cycle: u32) -> Self {
        self.fail_open_on = Some(cycle);
        self
    }

    /// Every write during `cycle` fails.
    pub fn fail_writes_on(mut self, cycle: u32) -> Self {
        self.fail_writes_on = Some(cycle);
        self
    }

    /// Release (flush) fails for `cycle`.
    pub fn fail_release_on(mut self, cycle: u32) -> Self {
        self.fail_release_on = Some(cycle);
        self
    }

    pub fn opens(&self) -> u32 {
        self.lock().opens
    }

    pub fn releases(&self) -> u32 {
        self.lock().releases
    }

    pub fn released_cycles(&self) -> Vec<u32> {
        self.lock().released_cycles.clone()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.lock().paths.clone()
    }

    /// Lines recorded for `cycle`.
    pub fn lines(&self, cycle: u32) -> Vec<String> {
        self.lock().lines.get(&cycle).cloned().unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CaptureLedger> {
        self.ledger.lock().expect("capture ledger mutex poisoned")
    }
}

impl CaptureFactory for CountingCaptureFactory {
    fn open(&self, cycle: u32, path: &Path) -> io::Result<Box<dyn CaptureSink>> {
        if self.fail_open_on == Some(cycle) {
            return Err(io::Error::new(
                io::ErrorKind::StorageFull,
                "no space left on device",
            ));
        }
        let mut ledger = self.lock();
        ledger.opens += 1;
        ledger.paths.push(path.to_path_buf());
        ledger.lines.entry(cycle).or_default();
        drop(ledger);
        Ok(Box::new(CountingSink {
            ledger: Arc::clone(&self.ledger),
            cycle,
            fail_writes: self.fail_writes_on == Some(cycle),
            fail_release: self.fail_release_on == Some(cycle),
        }))
    }
}

struct CountingSink {
    ledger: Arc<Mutex<CaptureLedger>>,
    cycle: u32,
    fail_writes: bool,
    fail_release: bool,
}

impl CaptureSink for CountingSink {
    fn record(&mut self, line: &str) -> io::Result<()> {
        if self.fail_writes {
            return Err(io::Error::other("console capture write failed"));
        }
        self.ledger
            .lock()
            .expect("capture ledger mutex poisoned")
            .lines
            .entry(self.cycle)
            .or_default()
            .push(line.to_string());
        Ok(())
    }

    fn release(&mut self) -> io::Result<()> {
        let mut ledger = self.ledger.lock().expect("capture ledger mutex poisoned");
        ledger.releases += 1;
        ledger.released_cycles.push(self.cycle);
        if self.fail_release {
            return Err(io::Error::other("console capture flush failed"));
        }
        Ok(())
    }
}
