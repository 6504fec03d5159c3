//! `scbusd`: the signed control bus policy daemon.
//!
//! Loads the signing key, schema, and active/pending policy at start,
//! binds the Unix-domain socket, and serves requests until signaled.
//!
//! The schema defaults to `/etc/scbusd/schema.json`; `etc/scbusd/schema.json`
//! in this repository is a ready-to-copy starting point covering all four
//! value shapes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use signed_control_bus::config::{
    Config, FRESHNESS_WINDOW_SECS, MAX_FRAME_BYTES, NONCE_CACHE_CAPACITY, REQUEST_TIMEOUT_SECS,
    SHUTDOWN_GRACE_SECS,
};
use signed_control_bus::crypto::PublicKey;
use signed_control_bus::daemon::Daemon;
use signed_control_bus::policy::{NoopEffector, PolicyState};
use signed_control_bus::replay::ReplayGuard;
use signed_control_bus::schema::Schema;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();

    let schema = Schema::load(&config.schema_path)
        .with_context(|| format!("loading schema from {:?}", config.schema_path))?;
    let verify_key = PublicKey::read_from_file(&config.public_key_path())
        .with_context(|| format!("loading public key from {:?}", config.public_key_path()))?;

    info!(key = %verify_key.fingerprint(), "loaded control domain public key");

    // No effector implementation ships with the core: realizing a policy
    // key's effect in the running system is an external collaborator
    // (§1, out of scope). Operators wire a real `Effector` in; absent
    // that, runtime keys are accepted but have no observable side effect
    // beyond the active-policy document.
    let state = Arc::new(PolicyState::load(
        Arc::new(schema),
        Arc::new(NoopEffector),
        config.active_path.clone(),
        config.pending_path.clone(),
    )?);

    let replay_guard = Arc::new(ReplayGuard::new(NONCE_CACHE_CAPACITY, FRESHNESS_WINDOW_SECS));

    let daemon = Arc::new(Daemon::new(
        state,
        replay_guard,
        verify_key,
        config.socket_path.clone(),
        MAX_FRAME_BYTES,
        Duration::from_secs(REQUEST_TIMEOUT_SECS),
        Duration::from_secs(SHUTDOWN_GRACE_SECS),
        FRESHNESS_WINDOW_SECS,
        NONCE_CACHE_CAPACITY,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    daemon.serve(shutdown_rx).await?;
    Ok(())
}
