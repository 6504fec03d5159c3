//! `scbus-apply`: the boot-time applier.
//!
//! A short-lived one-shot binary invoked by the host's service manager
//! before any policy-sensitive subsystem starts. Promotes pending policy
//! into active policy and exits non-zero on any failure so upstream
//! service-manager policy can alert.

use std::process::ExitCode;

use anyhow::Context;
use signed_control_bus::applier;
use signed_control_bus::config::Config;
use signed_control_bus::schema::Schema;
use tracing::{error, info};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match try_main() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "boot applier failed");
            ExitCode::FAILURE
        }
    }
}

fn try_main() -> anyhow::Result<()> {
    let config = Config::from_env();
    let schema = Schema::load(&config.schema_path)
        .with_context(|| format!("loading schema from {:?}", config.schema_path))?;

    let report = applier::run(&schema, &config.active_path, &config.pending_path)
        .context("running boot applier")?;

    info!(
        promoted = ?report.promoted,
        ignored = ?report.ignored_runtime_keys,
        "boot applier promoted pending policy into active policy"
    );
    Ok(())
}
