//! Target liveness checks.

use crate::command::CommandSpec;
use std::time::{Duration, Instant};
use tracing::trace;

/// Answers whether the target is back up. Polled by the engine until the boot
/// window closes; a single call should return promptly.
pub trait LivenessProbe: Send + Sync {
    fn is_responsive(&self) -> bool;
}

impl<F> LivenessProbe for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_responsive(&self) -> bool {
        self()
    }
}

/// Responsive iff the probe command exits 0 within its own timeout
/// (`ping -c1 host`, `ssh host true`, `nc -z host 22`).
#[derive(Debug, Clone)]
pub struct CommandProbe {
    command: CommandSpec,
}

impl CommandProbe {
    pub fn new(command: CommandSpec) -> Self {
        Self { command }
    }
}

impl LivenessProbe for CommandProbe {
    fn is_responsive(&self) -> bool {
        match self.command.run() {
            Ok(output) => output.success(),
            Err(err) => {
                trace!(error = %err, "Liveness probe did not complete");
                false
            }
        }
    }
}

/// Poll `probe` every `interval` until it answers or `timeout` elapses.
///
/// Blocking; used from recovery actions, which already run on the blocking
/// pool. Returns the time it took to come up.
pub fn wait_until_responsive(
    probe: &dyn LivenessProbe,
    timeout: Duration,
    interval: Duration,
) -> Option<Duration> {
    let started = Instant::now();
    loop {
        if probe.is_responsive() {
            return Some(started.elapsed());
        }
        let elapsed = started.elapsed();
        if elapsed >= timeout {
            return None;
        }
        std::thread::sleep(interval.min(timeout - elapsed));
    }
}
