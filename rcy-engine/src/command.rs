//! External command execution with a hard timeout.
//!
//! Every command-backed collaborator (reset mechanism, liveness probe,
//! workload hook, power restore) goes through [`CommandSpec`]. Commands are
//! executed directly from an argv vector, never through a shell.

use crate::errors::ConfigError;
use std::io::Read;
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Placeholder substituted with the current cycle number.
pub const CYCLE_PLACEHOLDER: &str = "{cycle}";

/// Interval between `try_wait` polls while a command runs.
const WAIT_POLL_STEP: Duration = Duration::from_millis(20);

/// Flags whose following argument is a credential.
const SECRET_FLAGS: &[&str] = &["-P", "--password", "--passwd", "--pass", "-k", "--key"];

/// `key=value` prefixes whose value is a credential (matched case-insensitively).
const SECRET_KEYS: &[&str] = &["password=", "passwd=", "pass=", "token=", "secret="];

/// Flags that take `user:password`; only the password half is masked.
const USER_PASS_FLAGS: &[&str] = &["-u", "--user"];

/// Errors from running a command. A non-zero exit is *not* an error.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} did not finish within {timeout:?}")]
    TimedOut { program: String, timeout: Duration },

    #[error("failed waiting for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code, `None` when terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// One-line reason for a failed command, preferring stderr.
    pub fn failure_reason(&self) -> String {
        let code = self
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let stream = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        let first_line = stream.lines().next().unwrap_or("");
        if first_line.is_empty() {
            format!("exit {code}")
        } else {
            format!("exit {code}: {first_line}")
        }
    }
}

/// An argv vector plus the time it is allowed to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandSpec {
    /// Build a spec. `field` names the config entry for error messages.
    pub fn new(
        field: &'static str,
        argv: Vec<String>,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        match argv.first() {
            None => return Err(ConfigError::invalid(field, "command must not be empty")),
            Some(program) if program.trim().is_empty() => {
                return Err(ConfigError::invalid(field, "program name must not be blank"));
            }
            Some(_) => {}
        }
        if timeout.is_zero() {
            return Err(ConfigError::invalid(field, "timeout must be greater than zero"));
        }
        Ok(Self { argv, timeout })
    }

    pub fn program(&self) -> &str {
        &self.argv[0]
    }

    /// Command line with credentials masked, safe for logs.
    pub fn display(&self) -> String {
        mask_sensitive_args(&self.argv).join(" ")
    }

    /// Run the command as configured.
    pub fn run(&self) -> Result<CommandOutput, CommandError> {
        self.execute(self.argv[1..].to_vec())
    }

    /// Run the command with `{cycle}` substituted in every argument.
    pub fn run_for_cycle(&self, cycle: u32) -> Result<CommandOutput, CommandError> {
        let cycle = cycle.to_string();
        let args = self.argv[1..]
            .iter()
            .map(|arg| arg.replace(CYCLE_PLACEHOLDER, &cycle))
            .collect();
        self.execute(args)
    }

    fn execute(&self, args: Vec<String>) -> Result<CommandOutput, CommandError> {
        let program = self.program().to_string();
        debug!(command = %self.display(), timeout = ?self.timeout, "Running command");

        let started = Instant::now();
        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| CommandError::Spawn {
                program: program.clone(),
                source,
            })?;

        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(source) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(CommandError::Wait { program, source });
                }
            }
            let elapsed = started.elapsed();
            if elapsed >= self.timeout {
                // Readers are left detached; grandchildren may still hold the pipes.
                let _ = child.kill();
                let _ = child.wait();
                return Err(CommandError::TimedOut {
                    program,
                    timeout: self.timeout,
                });
            }
            thread::sleep(WAIT_POLL_STEP.min(self.timeout - elapsed));
        };

        let output = CommandOutput {
            exit_code: status.code(),
            stdout: collect(stdout),
            stderr: collect(stderr),
            elapsed: started.elapsed(),
        };
        debug!(
            program = %program,
            exit_code = ?output.exit_code,
            elapsed_ms = output.elapsed.as_millis() as u64,
            "Command finished"
        );
        Ok(output)
    }
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn collect(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

/// Mask credentials in an argv vector before it is logged.
///
/// BMC tooling routinely takes passwords on the command line
/// (`ipmitool -P secret`, `curl -u admin:secret`), so anything that looks like
/// a credential is replaced with `***`.
pub fn mask_sensitive_args(argv: &[String]) -> Vec<String> {
    let mut masked = Vec::with_capacity(argv.len());
    let mut mask_next = false;
    let mut mask_next_password = false;

    for arg in argv {
        if mask_next {
            masked.push("***".to_string());
            mask_next = false;
            continue;
        }
        if mask_next_password {
            masked.push(mask_user_pass(arg));
            mask_next_password = false;
            continue;
        }

        if SECRET_FLAGS.contains(&arg.as_str()) {
            mask_next = true;
            masked.push(arg.clone());
            continue;
        }
        if USER_PASS_FLAGS.contains(&arg.as_str()) {
            mask_next_password = true;
            masked.push(arg.clone());
            continue;
        }
        // ipmitool also accepts the password glued to the flag: -Psecret
        if arg.len() > 2 && arg.starts_with("-P") {
            masked.push("-P***".to_string());
            continue;
        }
        if let Some(flag) = SECRET_FLAGS
            .iter()
            .find(|flag| flag.starts_with("--") && arg.starts_with(&format!("{flag}=")))
        {
            masked.push(format!("{flag}=***"));
            continue;
        }
        if let Some(masked_kv) = mask_key_value(arg) {
            masked.push(masked_kv);
            continue;
        }
        masked.push(arg.clone());
    }

    masked
}

fn mask_key_value(arg: &str) -> Option<String> {
    let lower = arg.to_ascii_lowercase();
    SECRET_KEYS.iter().find_map(|key| {
        let pos = lower.find(key)?;
        let value_start = pos + key.len();
        Some(format!("{}***", &arg[..value_start]))
    })
}

fn mask_user_pass(arg: &str) -> String {
    match arg.split_once(':') {
        Some((user, _)) => format!("{user}:***"),
        None => arg.to_string(),
    }
}
