//! Per-cycle diagnostic capture.
//!
//! A [`CycleCapture`] owns the recorder for exactly one cycle. It is released
//! once, either explicitly through [`CycleCapture::close`] or on drop when the
//! cycle body exits early.

use chrono::{SecondsFormat, Utc};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// An open recorder bound to one cycle's log file.
pub trait CaptureSink: Send {
    fn record(&mut self, line: &str) -> io::Result<()>;

    /// Flush and close. Called exactly once.
    fn release(&mut self) -> io::Result<()>;
}

/// Opens capture sinks. A failed `open` is fatal to the run.
pub trait CaptureFactory: Send + Sync {
    fn open(&self, cycle: u32, path: &Path) -> io::Result<Box<dyn CaptureSink>>;
}

/// Path of the diagnostic log for `cycle` inside `log_directory`.
pub fn cycle_log_path(log_directory: &Path, cycle: u32) -> PathBuf {
    log_directory.join(format!("cycle_{cycle}.log"))
}

// ── File Capture ───────────────────────────────────────────────────────────

/// Writes timestamped lines to `cycle_<N>.log`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileCaptureFactory;

impl CaptureFactory for FileCaptureFactory {
    fn open(&self, _cycle: u32, path: &Path) -> io::Result<Box<dyn CaptureSink>> {
        let file = File::create(path)?;
        Ok(Box::new(FileSink {
            writer: BufWriter::new(file),
        }))
    }
}

struct FileSink {
    writer: BufWriter<File>,
}

impl CaptureSink for FileSink {
    fn record(&mut self, line: &str) -> io::Result<()> {
        let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        writeln!(self.writer, "{ts} {line}")
    }

    fn release(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }
}

// ── Scoped Guard ───────────────────────────────────────────────────────────

/// Scoped capture for one cycle.
///
/// Write errors are sticky: the first one is kept, later lines are dropped,
/// and the error is returned from [`close`](Self::close).
pub struct CycleCapture {
    cycle: u32,
    path: PathBuf,
    sink: Option<Box<dyn CaptureSink>>,
    error: Option<io::Error>,
}

impl CycleCapture {
    pub fn open(factory: &dyn CaptureFactory, cycle: u32, path: PathBuf) -> io::Result<Self> {
        let sink = factory.open(cycle, &path)?;
        debug!(cycle, path = %path.display(), "Diagnostic capture opened");
        Ok(Self {
            cycle,
            path,
            sink: Some(sink),
            error: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn has_failed(&self) -> bool {
        self.error.is_some()
    }

    /// Append one line to the cycle log.
    pub fn note(&mut self, line: impl AsRef<str>) {
        if self.error.is_some() {
            return;
        }
        if let Some(sink) = self.sink.as_mut()
            && let Err(err) = sink.record(line.as_ref())
        {
            warn!(cycle = self.cycle, error = %err, "Diagnostic capture write failed");
            self.error = Some(err);
        }
    }

    /// Release the capture and report the first I/O error seen during the cycle.
    pub fn close(mut self) -> io::Result<()> {
        let released = match self.sink.take() {
            Some(mut sink) => sink.release(),
            None => Ok(()),
        };
        debug!(cycle = self.cycle, "Diagnostic capture released");
        match self.error.take() {
            Some(err) => Err(err),
            None => released,
        }
    }
}

impl Drop for CycleCapture {
    fn drop(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            if let Err(err) = sink.release() {
                warn!(cycle = self.cycle, error = %err, "Diagnostic capture release failed");
            }
            debug!(cycle = self.cycle, "Diagnostic capture released on early exit");
        }
    }
}

impl std::fmt::Debug for CycleCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CycleCapture")
            .field("cycle", &self.cycle)
            .field("path", &self.path)
            .field("open", &self.sink.is_some())
            .field("failed", &self.error.is_some())
            .finish()
    }
}
