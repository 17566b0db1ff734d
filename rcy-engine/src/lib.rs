//! Cyclic reset reliability engine.
//!
//! Power-cycles one target system `N` times through a pluggable reset
//! mechanism, classifies each attempt, dispatches bounded recovery on
//! failure, verifies a workload after every good boot and produces a
//! pass/fail summary with one diagnostic log per cycle.

#![forbid(unsafe_code)]

pub mod capture;
pub mod command;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod errors;
pub mod logging;
pub mod mechanism;
pub mod mock;
pub mod outcome;
pub mod report;
pub mod target;
pub mod workload;

pub use capture::{CaptureFactory, CaptureSink, CycleCapture, FileCaptureFactory};
pub use command::{CommandError, CommandOutput, CommandSpec, mask_sensitive_args};
pub use config::{HandlerChoice, RunConfig, RunFile};
pub use dispatch::{
    AbortReason, BoundedRetry, CommandRestore, Dispatch, EscalateAndAbort, FailureContext,
    FailureDispatcher, HandlerTable, LogAndContinue, PowerRestore, RecoveryAction,
    RecoveryVerdict, RunState,
};
pub use engine::{CycleEngine, CycleEngineBuilder, EnginePhase, RunControl};
pub use errors::{ConfigError, EngineError, ErrorCode, ReportError};
pub use logging::{LogConfig, LogFormat, LoggingGuards, init_logging};
pub use mechanism::{CommandMechanism, FnMechanism, ResetKind, ResetMechanism, ResetStatus};
pub use outcome::{CycleOutcome, FailureKind, MechanismReport, RawAttempt, classify};
pub use report::{CycleRecord, RunEnd, RunSummary, SummaryReporter};
pub use target::{CommandProbe, LivenessProbe};
pub use workload::{CommandWorkload, NoWorkload, WorkloadHook};
