//! End-to-end runs of the cycle engine against scripted collaborators.

mod common;

use common::{builder, fast_config, init_test_logging};
use proptest::prelude::*;
use rcy_engine::mock::{
    CountingCaptureFactory, MechanismStep, ScriptedMechanism, ScriptedProbe, ScriptedRestore,
    ScriptedWorkload,
};
use rcy_engine::{
    AbortReason, BoundedRetry, CycleOutcome, EngineError, EscalateAndAbort, FailureKind,
    FileCaptureFactory, FnMechanism, HandlerTable, LogAndContinue, ResetKind, ResetMechanism,
    ResetStatus, RunConfig, RunControl, RunEnd,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

#[ctor::ctor]
fn setup() {
    init_test_logging();
}

fn continue_everywhere() -> HandlerTable {
    HandlerTable::uniform(Arc::new(LogAndContinue))
}

// ── Example scenarios ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_all_cycles_succeed() {
    let dir = TempDir::new().unwrap();
    let probe = ScriptedProbe::responsive();
    let mechanism = ScriptedMechanism::new(ResetKind::Warm);
    let workload = ScriptedWorkload::passing();
    let capture = CountingCaptureFactory::new();

    let engine = builder(fast_config(&dir, 5), mechanism.clone(), &probe)
        .workload(workload.clone())
        .capture_factory(capture.clone())
        .handlers(continue_everywhere())
        .build()
        .unwrap();
    let summary = engine.run(&RunControl::new()).await.unwrap();

    assert_eq!(summary.total_cycles, 5);
    assert_eq!(summary.succeeded, 5);
    assert!(summary.failed_reset.is_empty());
    assert!(summary.failed_workload.is_empty());
    assert_eq!(summary.end, RunEnd::Completed);
    assert!(summary.passed());
    assert_eq!(summary.cycle_numbers(), vec![1, 2, 3, 4, 5]);
    assert_eq!(workload.calls(), vec![1, 2, 3, 4, 5]);
    assert_eq!(capture.opens(), 5);
    assert_eq!(capture.releases(), 5);
    let expected_paths: Vec<_> = summary
        .records
        .iter()
        .map(|r| r.diagnostic_log_path.clone())
        .collect();
    assert_eq!(capture.paths(), expected_paths);
    assert!(summary.records.iter().all(|r| r.workload_verified == Some(true)));
}

#[tokio::test]
async fn test_consecutive_mechanism_failures_abort_run() {
    let dir = TempDir::new().unwrap();
    let probe = ScriptedProbe::responsive();
    let mechanism = ScriptedMechanism::new(ResetKind::Ipmi)
        .on_cycle(3, MechanismStep::Reject("chassis control rejected".into()))
        .on_cycle(4, MechanismStep::Reject("chassis control rejected".into()));
    let config = RunConfig {
        consecutive_failure_threshold: 2,
        ..fast_config(&dir, 10)
    };

    let engine = builder(config, mechanism.clone(), &probe)
        .capture_factory(CountingCaptureFactory::new())
        .handlers(continue_everywhere())
        .build()
        .unwrap();
    let summary = engine.run(&RunControl::new()).await.unwrap();

    assert_eq!(summary.cycle_numbers(), vec![1, 2, 3, 4]);
    assert_eq!(summary.failed_reset.len(), 2);
    assert!(
        summary
            .failed_reset
            .iter()
            .all(|r| r.outcome == CycleOutcome::MechanismFailure)
    );
    assert_eq!(
        summary.end,
        RunEnd::Aborted {
            reason: AbortReason::ThresholdReached {
                cycle: 4,
                consecutive: 2,
                threshold: 2,
            }
        }
    );
    // Abort-then-stop: no reset after the aborting cycle.
    assert_eq!(mechanism.calls(), vec![1, 2, 3, 4]);
    assert!(!summary.passed());
}

#[tokio::test]
async fn test_workload_failure_is_tracked_separately() {
    let dir = TempDir::new().unwrap();
    let probe = ScriptedProbe::responsive();
    let workload = ScriptedWorkload::passing().error_on(2);
    // A threshold of 1 would abort on any counted reset failure.
    let config = RunConfig {
        consecutive_failure_threshold: 1,
        ..fast_config(&dir, 3)
    };

    let engine = builder(config, ScriptedMechanism::new(ResetKind::Cold), &probe)
        .workload(workload)
        .capture_factory(CountingCaptureFactory::new())
        .handlers(HandlerTable::uniform(Arc::new(EscalateAndAbort)))
        .build()
        .unwrap();
    let summary = engine.run(&RunControl::new()).await.unwrap();

    assert_eq!(summary.succeeded, 3);
    assert!(summary.failed_reset.is_empty());
    assert_eq!(summary.failed_workload.len(), 1);
    let failed = &summary.failed_workload[0];
    assert_eq!(failed.cycle_number, 2);
    assert_eq!(failed.outcome, CycleOutcome::Success);
    assert_eq!(failed.workload_verified, Some(false));
    assert!(failed.detail.as_deref().unwrap().contains("did not start"));
    assert_eq!(summary.end, RunEnd::Completed);
    assert!(!summary.passed());
}

#[tokio::test]
async fn test_capture_open_failure_is_fatal() {
    let dir = TempDir::new().unwrap();
    let probe = ScriptedProbe::responsive();
    let mechanism = ScriptedMechanism::new(ResetKind::Redfish);
    let config = fast_config(&dir, 4);
    let log_dir = config.log_directory.clone();

    let engine = builder(config, mechanism.clone(), &probe)
        .capture_factory(CountingCaptureFactory::new().fail_open_on(1))
        .handlers(continue_everywhere())
        .build()
        .unwrap();
    let err = engine.run(&RunControl::new()).await.unwrap_err();

    match err {
        EngineError::CaptureUnavailable { cycle, partial, .. } => {
            assert_eq!(cycle, 1);
            assert!(partial.records.is_empty());
            assert!(matches!(partial.end, RunEnd::Fatal { .. }));
        }
        other => panic!("expected CaptureUnavailable, got {other:?}"),
    }
    assert_eq!(mechanism.call_count(), 0);
    assert!(!log_dir.join("summary.txt").exists());
}

// ── Resource lifecycle ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_capture_failure_mid_run_keeps_partial_summary() {
    let dir = TempDir::new().unwrap();
    let probe = ScriptedProbe::responsive();
    let mechanism = ScriptedMechanism::new(ResetKind::AcCycle);

    let engine = builder(fast_config(&dir, 5), mechanism.clone(), &probe)
        .capture_factory(CountingCaptureFactory::new().fail_open_on(3))
        .handlers(continue_everywhere())
        .build()
        .unwrap();
    let err = engine.run(&RunControl::new()).await.unwrap_err();

    let EngineError::CaptureUnavailable { cycle, partial, .. } = err else {
        panic!("expected CaptureUnavailable");
    };
    assert_eq!(cycle, 3);
    assert_eq!(partial.cycle_numbers(), vec![1, 2]);
    assert_eq!(mechanism.calls(), vec![1, 2]);
}

#[tokio::test]
async fn test_capture_released_once_on_every_path() {
    let dir = TempDir::new().unwrap();
    let probe = ScriptedProbe::responsive();
    let mechanism = ScriptedMechanism::new(ResetKind::Ipmi)
        .on_cycle(2, MechanismStep::Reject("BMC busy".into()))
        .on_cycle(3, MechanismStep::Panic)
        .on_cycle(5, MechanismStep::Error("session dropped".into()));
    let workload = ScriptedWorkload::passing().panic_on(4);
    let capture = CountingCaptureFactory::new();

    let engine = builder(fast_config(&dir, 5), mechanism, &probe)
        .workload(workload)
        .capture_factory(capture.clone())
        .handlers(continue_everywhere())
        .build()
        .unwrap();
    let summary = engine.run(&RunControl::new()).await.unwrap();

    assert_eq!(capture.opens(), 5);
    assert_eq!(capture.releases(), 5);
    assert_eq!(capture.released_cycles(), vec![1, 2, 3, 4, 5]);

    let outcomes: Vec<CycleOutcome> = summary.records.iter().map(|r| r.outcome).collect();
    assert_eq!(
        outcomes,
        vec![
            CycleOutcome::Success,
            CycleOutcome::MechanismFailure,
            CycleOutcome::Unknown,
            CycleOutcome::Success,
            CycleOutcome::Unknown,
        ]
    );
    assert!(summary.records[2].detail.as_deref().unwrap().contains("panicked"));
    assert_eq!(summary.records[3].workload_verified, Some(false));
    assert_eq!(summary.end, RunEnd::Completed);
}

#[tokio::test]
async fn test_capture_write_error_turns_cycle_unknown() {
    let dir = TempDir::new().unwrap();
    let probe = ScriptedProbe::responsive();
    let capture = CountingCaptureFactory::new().fail_writes_on(2);

    let engine = builder(fast_config(&dir, 3), ScriptedMechanism::new(ResetKind::Warm), &probe)
        .capture_factory(capture.clone())
        .handlers(continue_everywhere())
        .build()
        .unwrap();
    let summary = engine.run(&RunControl::new()).await.unwrap();

    let record = &summary.records[1];
    assert_eq!(record.outcome, CycleOutcome::Unknown);
    assert_eq!(record.workload_verified, None);
    assert!(record.detail.as_deref().unwrap().contains("diagnostic capture"));
    assert_eq!(summary.total_cycles, 3);
    assert_eq!(capture.releases(), 3);
}

#[tokio::test]
async fn test_capture_release_error_turns_cycle_unknown() {
    let dir = TempDir::new().unwrap();
    let probe = ScriptedProbe::responsive();
    let capture = CountingCaptureFactory::new().fail_release_on(1);

    let engine = builder(fast_config(&dir, 2), ScriptedMechanism::new(ResetKind::Warm), &probe)
        .capture_factory(capture.clone())
        .handlers(continue_everywhere())
        .build()
        .unwrap();
    let summary = engine.run(&RunControl::new()).await.unwrap();

    assert_eq!(summary.records[0].outcome, CycleOutcome::Unknown);
    assert_eq!(summary.records[1].outcome, CycleOutcome::Success);
    assert_eq!(capture.releases(), 2);
}

#[tokio::test]
async fn test_file_capture_and_summary_artifacts() {
    let dir = TempDir::new().unwrap();
    let probe = ScriptedProbe::responsive();
    let mechanism =
        ScriptedMechanism::new(ResetKind::Cold).on_cycle(2, MechanismStep::AcceptNoBoot);
    let config = fast_config(&dir, 3);
    let log_dir = config.log_directory.clone();

    let engine = builder(config, mechanism, &probe)
        .capture_factory(FileCaptureFactory)
        .handlers(continue_everywhere())
        .build()
        .unwrap();
    let summary = engine.run(&RunControl::new()).await.unwrap();

    for cycle in 1..=3 {
        let path = log_dir.join(format!("cycle_{cycle}.log"));
        assert_eq!(summary.records[cycle - 1].diagnostic_log_path, path);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains(&format!("cycle {cycle}/3 started")));
    }
    let cycle_two = std::fs::read_to_string(log_dir.join("cycle_2.log")).unwrap();
    assert!(cycle_two.contains("outcome: target_unresponsive"));

    let text = std::fs::read_to_string(log_dir.join("summary.txt")).unwrap();
    assert!(text.contains("cycle_2.log"));
    let csv = std::fs::read_to_string(log_dir.join("summary.csv")).unwrap();
    assert!(csv.contains("2,Failed,NA,Target failed to come back online"));
    assert!(log_dir.join("summary.json").exists());
}

// ── Failure policy ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_unknown_failures_never_abort() {
    let dir = TempDir::new().unwrap();
    let probe = ScriptedProbe::responsive();
    let mechanism = ScriptedMechanism::new(ResetKind::Redfish)
        .with_default(MechanismStep::Error("HTTP 500 from BMC".into()));
    let config = RunConfig {
        consecutive_failure_threshold: 1,
        ..fast_config(&dir, 4)
    };

    let engine = builder(config, mechanism.clone(), &probe)
        .capture_factory(CountingCaptureFactory::new())
        .handlers(HandlerTable::uniform(Arc::new(EscalateAndAbort)))
        .build()
        .unwrap();
    let summary = engine.run(&RunControl::new()).await.unwrap();

    assert_eq!(summary.total_cycles, 4);
    assert_eq!(summary.failed_reset.len(), 4);
    assert_eq!(
        summary.outcome_breakdown().get(&FailureKind::Unknown),
        Some(&4)
    );
    assert_eq!(summary.end, RunEnd::Completed);
    assert_eq!(mechanism.call_count(), 4);
}

#[tokio::test]
async fn test_success_breaks_failure_streak() {
    let dir = TempDir::new().unwrap();
    let probe = ScriptedProbe::responsive();
    let reject = || MechanismStep::Reject("rejected".into());
    let mechanism = ScriptedMechanism::new(ResetKind::Ipmi)
        .on_cycle(1, reject())
        .on_cycle(3, reject())
        .on_cycle(5, reject());
    let config = RunConfig {
        consecutive_failure_threshold: 2,
        ..fast_config(&dir, 6)
    };

    let engine = builder(config, mechanism, &probe)
        .capture_factory(CountingCaptureFactory::new())
        .handlers(continue_everywhere())
        .build()
        .unwrap();
    let summary = engine.run(&RunControl::new()).await.unwrap();

    assert_eq!(summary.total_cycles, 6);
    assert_eq!(summary.failed_reset.len(), 3);
    assert_eq!(summary.end, RunEnd::Completed);
}

#[tokio::test]
async fn test_escalate_handler_aborts_on_first_failure() {
    let dir = TempDir::new().unwrap();
    let probe = ScriptedProbe::responsive();
    let mechanism =
        ScriptedMechanism::new(ResetKind::AcCycle).on_cycle(2, MechanismStep::AcceptNoBoot);

    let engine = builder(fast_config(&dir, 5), mechanism.clone(), &probe)
        .capture_factory(CountingCaptureFactory::new())
        .handler(FailureKind::TargetUnresponsive, EscalateAndAbort)
        .handler(FailureKind::MechanismFailure, LogAndContinue)
        .handler(FailureKind::Unknown, LogAndContinue)
        .build()
        .unwrap();
    let summary = engine.run(&RunControl::new()).await.unwrap();

    assert_eq!(summary.cycle_numbers(), vec![1, 2]);
    assert!(matches!(
        summary.end,
        RunEnd::Aborted {
            reason: AbortReason::RecoveryAborted { cycle: 2, .. }
        }
    ));
    assert_eq!(mechanism.call_count(), 2);
}

#[tokio::test]
async fn test_bounded_retry_recovers_target() {
    let dir = TempDir::new().unwrap();
    let probe = ScriptedProbe::responsive();
    let mechanism =
        ScriptedMechanism::new(ResetKind::AcCycle).on_cycle(2, MechanismStep::AcceptNoBoot);
    let restore = ScriptedRestore::new().revive(probe.clone(), 1);
    let config = fast_config(&dir, 4);
    let retry = BoundedRetry::new(
        Arc::new(restore.clone()),
        Arc::new(probe.clone()),
        2,
        config.boot_timeout,
        config.poll_interval,
    )
    .unwrap();

    let engine = builder(config, mechanism, &probe)
        .capture_factory(CountingCaptureFactory::new())
        .handler(FailureKind::TargetUnresponsive, retry)
        .handler(FailureKind::MechanismFailure, LogAndContinue)
        .handler(FailureKind::Unknown, LogAndContinue)
        .build()
        .unwrap();
    let summary = engine.run(&RunControl::new()).await.unwrap();

    assert_eq!(restore.calls(), 1);
    assert_eq!(summary.total_cycles, 4);
    assert_eq!(summary.failed_reset.len(), 1);
    assert_eq!(summary.end, RunEnd::Completed);
}

#[tokio::test]
async fn test_workload_timeout_is_workload_failure() {
    let dir = TempDir::new().unwrap();
    let probe = ScriptedProbe::responsive();
    let config = RunConfig {
        workload_timeout: Duration::from_millis(40),
        ..fast_config(&dir, 2)
    };

    let engine = builder(config, ScriptedMechanism::new(ResetKind::Warm), &probe)
        .workload(ScriptedWorkload::passing().stall_on(1, Duration::from_millis(250)))
        .capture_factory(CountingCaptureFactory::new())
        .handlers(continue_everywhere())
        .build()
        .unwrap();
    let summary = engine.run(&RunControl::new()).await.unwrap();

    assert!(summary.failed_reset.is_empty());
    assert_eq!(summary.failed_workload.len(), 1);
    assert!(
        summary.failed_workload[0]
            .detail
            .as_deref()
            .unwrap()
            .contains("timed out")
    );
}

/// Shared event log for collaborators that report when they start and stop.
#[derive(Clone, Default)]
struct Timeline {
    events: Arc<Mutex<Vec<(String, Instant)>>>,
}

impl Timeline {
    fn mark(&self, event: impl Into<String>) {
        self.events
            .lock()
            .expect("timeline mutex poisoned")
            .push((event.into(), Instant::now()));
    }

    fn at(&self, event: &str) -> Instant {
        self.events
            .lock()
            .expect("timeline mutex poisoned")
            .iter()
            .find(|(name, _)| name == event)
            .map(|(_, at)| *at)
            .unwrap_or_else(|| panic!("no event {event}"))
    }
}

fn timed_mechanism(timeline: &Timeline) -> impl ResetMechanism + 'static {
    let timeline = timeline.clone();
    FnMechanism::new(ResetKind::Warm, move |cycle| {
        timeline.mark(format!("reset {cycle}"));
        Ok(ResetStatus::Accepted)
    })
}

#[tokio::test]
async fn test_overrunning_workload_finishes_before_next_reset() {
    let dir = TempDir::new().unwrap();
    let timeline = Timeline::default();
    let hook_timeline = timeline.clone();
    let config = RunConfig {
        workload_timeout: Duration::from_millis(40),
        ..fast_config(&dir, 2)
    };

    let engine = rcy_engine::CycleEngine::builder(config)
        .mechanism(timed_mechanism(&timeline))
        .probe(ScriptedProbe::responsive())
        .workload(move |cycle: u32| -> anyhow::Result<bool> {
            if cycle == 1 {
                std::thread::sleep(Duration::from_millis(300));
            }
            hook_timeline.mark(format!("workload {cycle} done"));
            Ok(true)
        })
        .capture_factory(CountingCaptureFactory::new())
        .handlers(continue_everywhere())
        .build()
        .unwrap();
    let summary = engine.run(&RunControl::new()).await.unwrap();

    assert!(timeline.at("workload 1 done") < timeline.at("reset 2"));
    assert_eq!(summary.failed_workload.len(), 1);
    assert!(
        summary.failed_workload[0]
            .detail
            .as_deref()
            .unwrap()
            .contains("timed out")
    );
    assert_eq!(summary.records[1].workload_verified, Some(true));
}

#[tokio::test]
async fn test_overrunning_probe_finishes_before_next_reset() {
    let dir = TempDir::new().unwrap();
    let timeline = Timeline::default();
    let probe_timeline = timeline.clone();
    let probes = Arc::new(AtomicU32::new(0));
    let config = RunConfig {
        boot_timeout: Duration::from_millis(30),
        ..fast_config(&dir, 2)
    };

    let engine = rcy_engine::CycleEngine::builder(config)
        .mechanism(timed_mechanism(&timeline))
        .probe(move || {
            // The first probe hangs past the boot window; later ones answer.
            if probes.fetch_add(1, Ordering::SeqCst) == 0 {
                std::thread::sleep(Duration::from_millis(200));
                probe_timeline.mark("slow probe done");
                return false;
            }
            true
        })
        .capture_factory(CountingCaptureFactory::new())
        .handlers(continue_everywhere())
        .build()
        .unwrap();
    let summary = engine.run(&RunControl::new()).await.unwrap();

    assert!(timeline.at("slow probe done") < timeline.at("reset 2"));
    assert_eq!(summary.records[0].outcome, CycleOutcome::TargetUnresponsive);
    assert_eq!(summary.records[1].outcome, CycleOutcome::Success);
}

// ── Cancellation ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_cancelled_before_start_runs_nothing() {
    let dir = TempDir::new().unwrap();
    let probe = ScriptedProbe::responsive();
    let mechanism = ScriptedMechanism::new(ResetKind::Warm);
    let config = fast_config(&dir, 3);
    let log_dir = config.log_directory.clone();

    let engine = builder(config, mechanism.clone(), &probe)
        .capture_factory(CountingCaptureFactory::new())
        .handlers(continue_everywhere())
        .build()
        .unwrap();
    let control = RunControl::new();
    control.cancel();
    let summary = engine.run(&control).await.unwrap();

    assert_eq!(summary.total_cycles, 0);
    assert_eq!(summary.end, RunEnd::Cancelled);
    assert_eq!(mechanism.call_count(), 0);
    assert!(log_dir.join("summary.txt").exists());
}

#[tokio::test]
async fn test_cancel_mid_cycle_finishes_current_cycle() {
    let dir = TempDir::new().unwrap();
    let control = RunControl::new();
    let cancel = control.clone();
    let mechanism = FnMechanism::new(ResetKind::Cold, move |cycle| {
        if cycle == 2 {
            cancel.cancel();
        }
        Ok(ResetStatus::Accepted)
    });

    let engine = rcy_engine::CycleEngine::builder(fast_config(&dir, 5))
        .mechanism(mechanism)
        .probe(ScriptedProbe::responsive())
        .capture_factory(CountingCaptureFactory::new())
        .handlers(continue_everywhere())
        .build()
        .unwrap();
    let summary = engine.run(&control).await.unwrap();

    assert_eq!(summary.cycle_numbers(), vec![1, 2]);
    assert_eq!(summary.records[1].outcome, CycleOutcome::Success);
    assert_eq!(summary.end, RunEnd::Cancelled);
    assert!(!summary.passed());
}

// ── Properties ─────────────────────────────────────────────────────────────

fn step_strategy() -> impl Strategy<Value = MechanismStep> {
    prop_oneof![
        4 => Just(MechanismStep::Accept),
        2 => Just(MechanismStep::Reject("rejected".to_string())),
        1 => Just(MechanismStep::Error("boom".to_string())),
    ]
}

/// Cycles a run with `steps` should attempt, and whether it aborts.
fn expected_attempts(steps: &[MechanismStep], threshold: u32) -> (usize, bool) {
    let mut consecutive = 0;
    for (idx, step) in steps.iter().enumerate() {
        match step {
            MechanismStep::Accept => consecutive = 0,
            MechanismStep::Reject(_) => {
                consecutive += 1;
                if consecutive >= threshold {
                    return (idx + 1, true);
                }
            }
            _ => {}
        }
    }
    (steps.len(), false)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_numbering_is_monotonic_and_abort_stops(
        steps in prop::collection::vec(step_strategy(), 1..10),
        threshold in 1u32..4,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let dir = TempDir::new().unwrap();
        let probe = ScriptedProbe::responsive();
        let mechanism = ScriptedMechanism::new(ResetKind::Ipmi);
        for step in &steps {
            mechanism.push(step.clone());
        }
        let config = RunConfig {
            consecutive_failure_threshold: threshold,
            ..fast_config(&dir, steps.len() as u32)
        };
        let engine = builder(config, mechanism.clone(), &probe)
            .capture_factory(CountingCaptureFactory::new())
            .handlers(continue_everywhere())
            .build()
            .unwrap();

        let summary = runtime.block_on(engine.run(&RunControl::new())).unwrap();
        let (expected, aborts) = expected_attempts(&steps, threshold);
        let numbers = summary.cycle_numbers();

        prop_assert_eq!(numbers, (1..=expected as u32).collect::<Vec<_>>());
        prop_assert_eq!(mechanism.call_count(), expected);
        prop_assert_eq!(matches!(summary.end, RunEnd::Aborted { .. }), aborts);
        prop_assert_eq!(
            summary.failed_reset.len() + summary.succeeded as usize,
            summary.total_cycles as usize
        );
    }
}
