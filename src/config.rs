//! Struct-carried runtime configuration, built once in each binary's
//! `main` from the small enumerated set of environment variables in §6.
//! No process-wide singleton: every component that needs a path receives
//! it explicitly.

use std::path::PathBuf;

/// Nonce cache capacity, per §4.2. Must exceed the maximum number of
/// distinct signed envelopes an honest signer can emit within the
/// freshness window by a comfortable margin.
pub const NONCE_CACHE_CAPACITY: usize = 10_000;

/// The symmetric freshness window, in seconds.
pub const FRESHNESS_WINDOW_SECS: i64 = 300;

/// Maximum size of a single framed request, in bytes.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Maximum time a per-request read may take before the connection is
/// closed with a timeout error.
pub const REQUEST_TIMEOUT_SECS: u64 = 5;

/// Grace period the daemon waits for in-flight handlers to drain on
/// shutdown.
pub const SHUTDOWN_GRACE_SECS: u64 = 5;

/// Runtime paths the daemon, CLI, and applier all derive from the
/// environment, with documented defaults.
#[derive(Clone, Debug)]
pub struct Config {
    /// Unix-domain socket path. `SCBUS_SOCKET_PATH`, default
    /// `/run/scbusd/bus.sock`.
    pub socket_path: PathBuf,
    /// Active policy document path. `SCBUS_ACTIVE_PATH`, default
    /// `/var/lib/scbusd/active.json`.
    pub active_path: PathBuf,
    /// Pending policy document path. `SCBUS_PENDING_PATH`, default
    /// `/var/lib/scbusd/pending.json`.
    pub pending_path: PathBuf,
    /// Directory holding `sign_pk`/`sign_sk`. `SCBUS_KEY_DIR`, default
    /// `/var/lib/scbusd/keys`.
    pub key_dir: PathBuf,
    /// Policy schema document path. `SCBUS_SCHEMA_PATH`, default
    /// `/etc/scbusd/schema.json`.
    pub schema_path: PathBuf,
}

impl Config {
    /// Build configuration from the environment, falling back to the
    /// documented defaults for any variable that isn't set.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            socket_path: env_path("SCBUS_SOCKET_PATH", "/run/scbusd/bus.sock"),
            active_path: env_path("SCBUS_ACTIVE_PATH", "/var/lib/scbusd/active.json"),
            pending_path: env_path("SCBUS_PENDING_PATH", "/var/lib/scbusd/pending.json"),
            key_dir: env_path("SCBUS_KEY_DIR", "/var/lib/scbusd/keys"),
            schema_path: env_path("SCBUS_SCHEMA_PATH", "/etc/scbusd/schema.json"),
        }
    }

    /// Path to the daemon's public key file within `key_dir`.
    #[must_use]
    pub fn public_key_path(&self) -> PathBuf {
        self.key_dir.join("sign_pk")
    }

    /// Path to the control domain's private key file within `key_dir`.
    #[must_use]
    pub fn private_key_path(&self) -> PathBuf {
        self.key_dir.join("sign_sk")
    }
}

fn env_path(var: &str, default: &str) -> PathBuf {
    std::env::var_os(var).map_or_else(|| PathBuf::from(default), PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_paths_are_derived_from_key_dir() {
        let cfg = Config {
            socket_path: PathBuf::from("/run/x.sock"),
            active_path: PathBuf::from("/var/lib/active.json"),
            pending_path: PathBuf::from("/var/lib/pending.json"),
            key_dir: PathBuf::from("/var/lib/keys"),
            schema_path: PathBuf::from("/etc/schema.json"),
        };
        assert_eq!(cfg.public_key_path(), PathBuf::from("/var/lib/keys/sign_pk"));
        assert_eq!(cfg.private_key_path(), PathBuf::from("/var/lib/keys/sign_sk"));
    }
}
