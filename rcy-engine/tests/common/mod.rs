use rcy_engine::mock::{ScriptedMechanism, ScriptedProbe};
use rcy_engine::{CycleEngine, CycleEngineBuilder, RunConfig};
use std::sync::Once;
use std::time::Duration;
use tempfile::TempDir;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_env("RCY_LOG").unwrap_or_else(|_| EnvFilter::new("debug"));

        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_test_writer()
                    .with_target(true)
                    .with_thread_ids(true),
            )
            .with(filter)
            .init();
    });
}

/// Millisecond-scale timings so scenarios run quickly.
pub fn fast_config(dir: &TempDir, cycles: u32) -> RunConfig {
    RunConfig {
        boot_timeout: Duration::from_millis(50),
        poll_interval: Duration::from_millis(5),
        workload_timeout: Duration::from_secs(2),
        ..RunConfig::new(cycles, dir.path().join("logs"))
    }
}

/// Builder with the mechanism wired to flip the probe.
pub fn builder(
    config: RunConfig,
    mechanism: ScriptedMechanism,
    probe: &ScriptedProbe,
) -> CycleEngineBuilder {
    CycleEngine::builder(config)
        .mechanism(mechanism.with_target(probe.clone()))
        .probe(probe.clone())
}
