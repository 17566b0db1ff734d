//! Post-cycle workload verification hooks.

use crate::command::CommandSpec;
use anyhow::{Context, bail};

/// Validates that the target is functionally correct, not just powered on.
///
/// Runs only after a successful reset. `Ok(false)` and `Err(_)` are both a
/// failed verification; neither counts as a reset failure.
pub trait WorkloadHook: Send + Sync {
    fn verify(&self, cycle: u32) -> anyhow::Result<bool>;
}

impl<F> WorkloadHook for F
where
    F: Fn(u32) -> anyhow::Result<bool> + Send + Sync,
{
    fn verify(&self, cycle: u32) -> anyhow::Result<bool> {
        self(cycle)
    }
}

/// Hook used when no workload is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoWorkload;

impl WorkloadHook for NoWorkload {
    fn verify(&self, _cycle: u32) -> anyhow::Result<bool> {
        Ok(true)
    }
}

/// Passes iff the command exits 0. `{cycle}` in arguments is substituted.
#[derive(Debug, Clone)]
pub struct CommandWorkload {
    command: CommandSpec,
}

impl CommandWorkload {
    pub fn new(command: CommandSpec) -> Self {
        Self { command }
    }
}

impl WorkloadHook for CommandWorkload {
    fn verify(&self, cycle: u32) -> anyhow::Result<bool> {
        let output = self
            .command
            .run_for_cycle(cycle)
            .with_context(|| format!("workload command {}", self.command.program()))?;
        if !output.success() {
            bail!("workload failed: {}", output.failure_reason());
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_no_workload_always_passes() {
        assert!(NoWorkload.verify(1).unwrap());
        assert!(NoWorkload.verify(99).unwrap());
    }

    #[test]
    fn test_closure_hook_sees_cycle() {
        let hook = |cycle: u32| -> anyhow::Result<bool> { Ok(cycle % 2 == 0) };
        assert!(!hook.verify(1).unwrap());
        assert!(hook.verify(2).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_command_workload_failure_carries_stderr() {
        let hook = CommandWorkload::new(
            CommandSpec::new(
                "workload.command",
                vec![
                    "sh".into(),
                    "-c".into(),
                    "echo 'guest {cycle} not booted' >&2; exit 1".into(),
                ],
                Duration::from_secs(5),
            )
            .unwrap(),
        );
        let err = hook.verify(4).unwrap_err();
        assert!(err.to_string().contains("guest 4 not booted"));
    }
}
