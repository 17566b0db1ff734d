//! Reset Cycle Harness CLI
//!
//! Loads a run file, power-cycles the system under test and prints the
//! pass/fail summary. Exit status: 0 pass, 1 fail, 2 configuration or
//! resource error.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rcy_engine::{
    EngineError, ErrorCode, LogConfig, LogFormat, RunControl, RunFile, RunSummary, init_logging,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "rcy")]
#[command(author, version, about = "Reset cycle harness - power-cycle reliability runs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit stderr logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Also write JSON logs to this file
    #[arg(long, global = true, value_name = "PATH")]
    log_file: Option<PathBuf>,
}

fn log_config(cli: &Cli) -> LogConfig {
    let mut config = LogConfig::from_env("info").with_stderr();
    if cli.verbose {
        config = config.with_level("debug");
    }
    if cli.log_json {
        config = config.with_format(LogFormat::Json);
    }
    if let Some(path) = &cli.log_file {
        config = config.with_file(path);
    }
    config
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a reset cycling run
    Run {
        /// Run file (defaults to <config dir>/rcy/cycle.toml)
        #[arg(short, long, env = "RCY_CONFIG")]
        config: Option<PathBuf>,

        /// Override run.total_cycles
        #[arg(long)]
        cycles: Option<u32>,

        /// Override run.log_directory
        #[arg(long)]
        log_dir: Option<PathBuf>,

        /// Print the summary as JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Check a run file and its handler wiring without touching the target
    Validate {
        /// Run file (defaults to <config dir>/rcy/cycle.toml)
        #[arg(short, long, env = "RCY_CONFIG")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let _logging_guards = match init_logging(&log_config(&cli)) {
        Ok(guards) => guards,
        Err(err) => {
            eprintln!("error: {err:#}");
            return ExitCode::from(2);
        }
    };

    let result = match cli.command {
        Commands::Run {
            config,
            cycles,
            log_dir,
            json,
        } => run(config, cycles, log_dir, json).await,
        Commands::Validate { config } => validate(config),
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(2)
        }
    }
}

fn resolve_config_path(explicit: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }
    let base = dirs::config_dir().context("no config directory; pass --config")?;
    Ok(base.join("rcy").join("cycle.toml"))
}

fn report_fatal(code: ErrorCode, message: &str) -> ExitCode {
    eprintln!("error[{code}]: {message}");
    eprintln!("  hint: {}", code.remediation());
    ExitCode::from(2)
}

async fn run(
    config: Option<PathBuf>,
    cycles: Option<u32>,
    log_dir: Option<PathBuf>,
    json: bool,
) -> Result<ExitCode> {
    let path = resolve_config_path(config)?;
    let mut run_file = match RunFile::load(&path) {
        Ok(file) => file,
        Err(err) => return Ok(report_fatal(err.code(), &err.to_string())),
    };
    run_file.apply_overrides(cycles, log_dir);
    let engine = match run_file.build_engine() {
        Ok(engine) => engine,
        Err(err) => return Ok(report_fatal(err.code(), &err.to_string())),
    };

    let control = RunControl::new();
    let signal_control = control.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping after the current cycle");
            signal_control.cancel();
        }
    });

    match engine.run(&control).await {
        Ok(summary) => {
            print_summary(&summary, json)?;
            Ok(if summary.passed() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Err(err) => {
            if let EngineError::CaptureUnavailable { partial, .. } = &err {
                warn!(
                    attempted = partial.total_cycles,
                    succeeded = partial.succeeded,
                    "Run stopped before completion; no summary artifacts written"
                );
            }
            Ok(report_fatal(err.code(), &err.to_string()))
        }
    }
}

fn print_summary(summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
    } else {
        print!("{}", summary.render_text());
    }
    Ok(())
}

fn validate(config: Option<PathBuf>) -> Result<ExitCode> {
    let path = resolve_config_path(config)?;
    let run_file = match RunFile::load(&path) {
        Ok(file) => file,
        Err(err) => return Ok(report_fatal(err.code(), &err.to_string())),
    };
    match run_file.build_engine() {
        Ok(engine) => {
            let config = engine.config();
            info!(path = %path.display(), "Run file is valid");
            println!(
                "OK: {} cycles via {} reset, logs in {}",
                config.total_cycles,
                engine.mechanism_kind(),
                config.log_directory.display()
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => Ok(report_fatal(err.code(), &err.to_string())),
    }
}
