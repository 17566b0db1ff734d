//! Cycle records, the summary reporter and run artifacts.
//!
//! The reporter accepts records in strictly increasing cycle order and is
//! finalized exactly once into a read-only [`RunSummary`].

use crate::dispatch::AbortReason;
use crate::errors::ReportError;
use crate::mechanism::ResetKind;
use crate::outcome::{CycleOutcome, FailureKind};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

pub const SUMMARY_TEXT_FILE: &str = "summary.txt";
pub const SUMMARY_CSV_FILE: &str = "summary.csv";
pub const SUMMARY_JSON_FILE: &str = "summary.json";

const CSV_HEADER: &str = "Cycle#,Status,Previous Failure Cycle#,Remarks";

// ── Cycle Record ───────────────────────────────────────────────────────────

/// Immutable result of one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleRecord {
    pub cycle_number: u32,
    pub outcome: CycleOutcome,
    /// Time from reset acknowledgement to first successful liveness probe.
    #[serde(rename = "boot_duration_ms", with = "duration_ms")]
    pub boot_duration: Option<Duration>,
    /// `None` unless the reset succeeded.
    pub workload_verified: Option<bool>,
    pub diagnostic_log_path: PathBuf,
    /// Rejection reason, error text or workload failure reason.
    pub detail: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl CycleRecord {
    pub fn is_reset_failure(&self) -> bool {
        !self.outcome.is_success()
    }

    pub fn is_workload_failure(&self) -> bool {
        self.outcome.is_success() && self.workload_verified == Some(false)
    }

    pub fn is_failure(&self) -> bool {
        self.is_reset_failure() || self.is_workload_failure()
    }

    fn remark(&self) -> String {
        let base = match self.outcome.failure_kind() {
            Some(kind) => kind.remark(),
            None if self.is_workload_failure() => "Workload verification failed",
            None => return "No Errors".to_string(),
        };
        match &self.detail {
            Some(detail) => format!("{base}: {detail}"),
            None => base.to_string(),
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        value.map(|d| d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

// ── Run End ────────────────────────────────────────────────────────────────

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunEnd {
    /// Every planned cycle was attempted.
    Completed,
    /// Stopped early by the failure dispatcher.
    Aborted { reason: AbortReason },
    /// Stopped at a cycle boundary on request.
    Cancelled,
    /// Stopped by an unrecoverable resource error. Only seen on partial
    /// summaries carried by an engine error.
    Fatal { error: String },
}

impl std::fmt::Display for RunEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Aborted { reason } => write!(f, "aborted: {reason}"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Fatal { error } => write!(f, "fatal: {error}"),
        }
    }
}

// ── Reporter ───────────────────────────────────────────────────────────────

/// Collects cycle records for one run.
#[derive(Debug)]
pub struct SummaryReporter {
    run_id: Uuid,
    mechanism: ResetKind,
    planned_cycles: u32,
    started_at: DateTime<Utc>,
    records: Vec<CycleRecord>,
}

impl SummaryReporter {
    pub fn new(mechanism: ResetKind, planned_cycles: u32) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            mechanism,
            planned_cycles,
            started_at: Utc::now(),
            records: Vec::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn records(&self) -> &[CycleRecord] {
        &self.records
    }

    /// Append a record. Cycle numbers must start at 1 and strictly increase.
    pub fn record(&mut self, record: CycleRecord) -> Result<(), ReportError> {
        let cycle = record.cycle_number;
        if cycle == 0 {
            return Err(ReportError::InvalidCycle);
        }
        if let Some(last) = self.records.last().map(|r| r.cycle_number)
            && cycle <= last
        {
            let duplicate = self
                .records
                .binary_search_by_key(&cycle, |r| r.cycle_number)
                .is_ok();
            return Err(if duplicate {
                ReportError::DuplicateCycle(cycle)
            } else {
                ReportError::OutOfOrder { cycle, last }
            });
        }
        self.records.push(record);
        Ok(())
    }

    pub fn finalize(self, end: RunEnd) -> RunSummary {
        let succeeded = self
            .records
            .iter()
            .filter(|r| r.outcome.is_success())
            .count() as u32;
        let failed_reset = self
            .records
            .iter()
            .filter(|r| r.is_reset_failure())
            .cloned()
            .collect();
        let failed_workload = self
            .records
            .iter()
            .filter(|r| r.is_workload_failure())
            .cloned()
            .collect();

        RunSummary {
            run_id: self.run_id,
            mechanism: self.mechanism,
            planned_cycles: self.planned_cycles,
            total_cycles: self.records.len() as u32,
            succeeded,
            failed_reset,
            failed_workload,
            records: self.records,
            end,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}

// ── Summary ────────────────────────────────────────────────────────────────

/// Finalized, read-only result of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub mechanism: ResetKind,
    pub planned_cycles: u32,
    /// Cycles actually attempted.
    pub total_cycles: u32,
    /// Cycles whose reset succeeded, regardless of workload verdict.
    pub succeeded: u32,
    pub failed_reset: Vec<CycleRecord>,
    pub failed_workload: Vec<CycleRecord>,
    pub records: Vec<CycleRecord>,
    pub end: RunEnd,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunSummary {
    /// A run passes when it completed with no reset or workload failures.
    pub fn passed(&self) -> bool {
        self.end == RunEnd::Completed
            && self.failed_reset.is_empty()
            && self.failed_workload.is_empty()
    }

    pub fn outcome_breakdown(&self) -> BTreeMap<FailureKind, u32> {
        let mut breakdown = BTreeMap::new();
        for kind in self.failed_reset.iter().filter_map(|r| r.outcome.failure_kind()) {
            *breakdown.entry(kind).or_insert(0) += 1;
        }
        breakdown
    }

    pub fn cycle_numbers(&self) -> Vec<u32> {
        self.records.iter().map(|r| r.cycle_number).collect()
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let verdict = if self.passed() { "PASS" } else { "FAIL" };
        let _ = writeln!(out, "Reset cycling summary");
        let _ = writeln!(out, "=====================");
        let _ = writeln!(out, "Run ID:              {}", self.run_id);
        let _ = writeln!(out, "Mechanism:           {}", self.mechanism);
        let _ = writeln!(
            out,
            "Started:             {}",
            self.started_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        let _ = writeln!(
            out,
            "Finished:            {}",
            self.finished_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        let _ = writeln!(out, "Planned cycles:      {}", self.planned_cycles);
        let _ = writeln!(out, "Attempted cycles:    {}", self.total_cycles);
        let _ = writeln!(out, "Succeeded:           {}", self.succeeded);
        let _ = writeln!(out, "Failed at reset:     {}", self.failed_reset.len());
        for (kind, count) in self.outcome_breakdown() {
            let _ = writeln!(out, "  {:<18} {count}", format!("{kind}:"));
        }
        let _ = writeln!(out, "Failed at workload:  {}", self.failed_workload.len());
        let _ = writeln!(out, "End:                 {}", self.end);
        let _ = writeln!(out, "Result:              {verdict}");

        let failures: Vec<&CycleRecord> = self.records.iter().filter(|r| r.is_failure()).collect();
        if !failures.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "Failures:");
            for record in failures {
                let kind = match record.outcome.failure_kind() {
                    Some(kind) => kind.to_string(),
                    None => "workload".to_string(),
                };
                let _ = write!(
                    out,
                    "  cycle {:<5} {:<20} {}",
                    record.cycle_number,
                    kind,
                    record.diagnostic_log_path.display()
                );
                if let Some(detail) = &record.detail {
                    let _ = write!(out, "  ({detail})");
                }
                let _ = writeln!(out);
            }
        }
        out
    }

    /// One row per attempted cycle; failed rows name the previous failed cycle.
    pub fn render_csv(&self) -> String {
        let mut out = String::from(CSV_HEADER);
        out.push('\n');
        let mut previous_failure: Option<u32> = None;
        for record in &self.records {
            if record.is_failure() {
                let previous = previous_failure
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "NA".to_string());
                let _ = writeln!(
                    out,
                    "{},Failed,{},{}",
                    record.cycle_number,
                    previous,
                    csv_field(&record.remark())
                );
                previous_failure = Some(record.cycle_number);
            } else {
                let _ = writeln!(out, "{},Succeeded,NA,No Errors", record.cycle_number);
            }
        }
        out
    }

    /// Write `summary.txt`, `summary.csv` and `summary.json` into `dir`.
    pub fn write_artifacts(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let json = serde_json::to_string_pretty(self).map_err(io::Error::other)?;
        let artifacts = [
            (SUMMARY_TEXT_FILE, self.render_text()),
            (SUMMARY_CSV_FILE, self.render_csv()),
            (SUMMARY_JSON_FILE, json),
        ];
        let mut written = Vec::with_capacity(artifacts.len());
        for (name, contents) in artifacts {
            let path = dir.join(name);
            std::fs::write(&path, contents)?;
            written.push(path);
        }
        info!(dir = %dir.display(), "Summary artifacts written");
        Ok(written)
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
