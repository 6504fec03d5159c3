//! Policy core: schema validation, classification, active/pending state,
//! and atomic persistence.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::envelope::{canonical_bytes, PolicyValue};
use crate::error::{Error, Result};
use crate::replay::now_secs;
use crate::schema::{Classification, Schema};

/// A policy document: key to current value. Used for both active and
/// pending state.
pub type PolicyDocument = BTreeMap<String, PolicyValue>;

/// One key that failed to apply or validate, with a stable reason string.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FailedKey {
    /// The offending key.
    pub key: String,
    /// The `§7` error kind identifier that caused the failure.
    pub reason: String,
}

/// The structured result of a `set_policy` command.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SetPolicyOutcome {
    /// Keys merged into active policy and successfully realized by their
    /// effector.
    pub applied: Vec<String>,
    /// Keys merged into pending policy, awaiting the next boot.
    pub staged: Vec<String>,
    /// Keys that failed validation or effector realization.
    pub failed: Vec<FailedKey>,
}

/// The observable snapshot returned by `get_status`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusDocument {
    /// Current active policy.
    pub active: PolicyDocument,
    /// Keys staged in pending policy, awaiting the next boot.
    pub pending_keys: Vec<String>,
    /// This crate's version.
    pub daemon_version: String,
    /// Epoch seconds of the last successful commit, if any.
    pub last_applied: Option<i64>,
    /// Epoch seconds the daemon process started.
    pub started_at: i64,
    /// The freshness window in effect, in seconds.
    pub freshness_window_secs: i64,
    /// The nonce cache capacity in effect.
    pub nonce_cache_capacity: usize,
}

/// Realizes a runtime-classified key's effect in the running system.
///
/// The core treats this as an opaque external collaborator: it returns
/// success or failure and nothing else.
pub trait Effector: Send + Sync {
    /// Apply `key = value` to the running system.
    ///
    /// # Errors
    ///
    /// Any error causes this key to be reported as `EffectorFailed`; it is
    /// never merged into active policy.
    fn apply(&self, key: &str, value: &PolicyValue) -> Result<()>;
}

/// An effector that always succeeds, used where no real side effect is
/// wired up (e.g. a bare daemon instance used only for staged keys, or
/// tests).
#[derive(Default)]
pub struct NoopEffector;

impl Effector for NoopEffector {
    fn apply(&self, _key: &str, _value: &PolicyValue) -> Result<()> {
        Ok(())
    }
}

/// In-memory active/pending state plus the schema and effector needed to
/// mutate it, backed by atomically-persisted files.
pub struct PolicyState {
    schema: Arc<Schema>,
    effector: Arc<dyn Effector>,
    active: RwLock<PolicyDocument>,
    pending: RwLock<PolicyDocument>,
    active_path: PathBuf,
    pending_path: PathBuf,
    last_applied: RwLock<Option<i64>>,
    started_at: i64,
}

impl PolicyState {
    /// Load active and pending documents from disk (missing files are
    /// treated as empty, per §4.5 step 1) and build the in-memory state.
    pub fn load(
        schema: Arc<Schema>,
        effector: Arc<dyn Effector>,
        active_path: PathBuf,
        pending_path: PathBuf,
    ) -> Result<Self> {
        let active = read_document(&active_path)?;
        let pending = read_document(&pending_path)?;

        Ok(Self {
            schema,
            effector,
            active: RwLock::new(active),
            pending: RwLock::new(pending),
            active_path,
            pending_path,
            last_applied: RwLock::new(None),
            started_at: now_secs(),
        })
    }

    /// Handle a `set_policy` command.
    ///
    /// Validates every key first; if any key fails schema validation, the
    /// whole envelope is rejected with no mutation (Scenario 5). Otherwise
    /// keys are classified and applied: runtime keys are realized by the
    /// effector and merged into active as one persisted snapshot; reboot
    /// keys are merged into pending.
    ///
    /// # Errors
    ///
    /// Returns `Error::PersistenceFailed` if an atomic write fails; the
    /// in-memory state is rolled back to match what's on disk.
    pub fn set_policy(&self, args: &BTreeMap<String, PolicyValue>) -> Result<SetPolicyOutcome> {
        let mut schema_failures = Vec::new();
        for (key, value) in args {
            if let Err(e) = self.schema.validate(key, value) {
                schema_failures.push(FailedKey {
                    key: key.clone(),
                    reason: e.kind().to_string(),
                });
            }
        }
        if !schema_failures.is_empty() {
            return Ok(SetPolicyOutcome {
                applied: Vec::new(),
                staged: Vec::new(),
                failed: schema_failures,
            });
        }

        let mut runtime_updates = BTreeMap::new();
        let mut reboot_updates = BTreeMap::new();
        for (key, value) in args {
            match self.schema.classify(key)? {
                Classification::Runtime => {
                    runtime_updates.insert(key.clone(), value.clone());
                }
                Classification::Reboot => {
                    reboot_updates.insert(key.clone(), value.clone());
                }
            }
        }

        let mut failed = Vec::new();
        let succeeded = self.run_effectors(&runtime_updates, &mut failed);
        let (applied, staged) = self.commit(&succeeded, &reboot_updates)?;

        if !applied.is_empty() || !staged.is_empty() {
            *self.last_applied.write().expect("lock poisoned") = Some(now_secs());
        }

        Ok(SetPolicyOutcome {
            applied,
            staged,
            failed,
        })
    }

    /// Run effectors against the proposed runtime values, before touching
    /// the in-memory map. Only keys whose effector succeeded are returned
    /// for merging; the rest are recorded in `failed`.
    fn run_effectors(&self, updates: &PolicyDocument, failed: &mut Vec<FailedKey>) -> PolicyDocument {
        let mut succeeded = BTreeMap::new();
        for (key, value) in updates {
            match self.effector.apply(key, value) {
                Ok(()) => {
                    succeeded.insert(key.clone(), value.clone());
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "effector failed for runtime key");
                    failed.push(FailedKey {
                        key: key.clone(),
                        reason: "EffectorFailed".to_string(),
                    });
                }
            }
        }
        succeeded
    }

    /// Merge effector-successful runtime values and reboot values into
    /// active/pending and persist both as one joint unit.
    ///
    /// Both temp files are written and fsynced before either is renamed
    /// into place, and a failure renaming pending rolls the already-renamed
    /// active file back to its prior contents. This keeps a mixed envelope
    /// (one that both applies and stages keys) from ever leaving active and
    /// pending reflecting two different envelopes on disk.
    fn commit(
        &self,
        runtime_succeeded: &PolicyDocument,
        reboot_updates: &PolicyDocument,
    ) -> Result<(Vec<String>, Vec<String>)> {
        if runtime_succeeded.is_empty() && reboot_updates.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }

        let mut active = self.active.write().expect("lock poisoned");
        let mut pending = self.pending.write().expect("lock poisoned");
        let active_snapshot = active.clone();
        let pending_snapshot = pending.clone();

        for (key, value) in runtime_succeeded {
            active.insert(key.clone(), value.clone());
        }
        for (key, value) in reboot_updates {
            pending.insert(key.clone(), value.clone());
        }

        let rollback = |active: &mut PolicyDocument, pending: &mut PolicyDocument| {
            *active = active_snapshot.clone();
            *pending = pending_snapshot.clone();
        };

        let active_tmp = match prepare_write(&self.active_path, &active) {
            Ok(tmp) => tmp,
            Err(e) => {
                rollback(&mut active, &mut pending);
                return Err(e);
            }
        };
        let pending_tmp = match prepare_write(&self.pending_path, &pending) {
            Ok(tmp) => tmp,
            Err(e) => {
                rollback(&mut active, &mut pending);
                return Err(e);
            }
        };

        if let Err(e) = finalize_rename(active_tmp, &self.active_path) {
            rollback(&mut active, &mut pending);
            return Err(e);
        }

        if let Err(e) = finalize_rename(pending_tmp, &self.pending_path) {
            // Active is already renamed into place. Restore its previous
            // contents so the two files don't end up committed to two
            // different envelopes.
            if let Err(rollback_err) = persist_atomic(&self.active_path, &active_snapshot) {
                warn!(
                    error = %rollback_err,
                    "failed to roll back active policy after a pending write failure",
                );
            }
            rollback(&mut active, &mut pending);
            return Err(e);
        }

        info!(path = %self.active_path.display(), "persisted policy document");
        info!(path = %self.pending_path.display(), "persisted policy document");

        Ok((
            runtime_succeeded.keys().cloned().collect(),
            reboot_updates.keys().cloned().collect(),
        ))
    }

    /// Build a point-in-time status snapshot. Safe to call concurrently
    /// with `set_policy`: each lock is held only long enough to clone the
    /// current value.
    #[must_use]
    pub fn status(&self, freshness_window_secs: i64, nonce_cache_capacity: usize) -> StatusDocument {
        let active = self.active.read().expect("lock poisoned").clone();
        let pending_keys = self
            .pending
            .read()
            .expect("lock poisoned")
            .keys()
            .cloned()
            .collect();
        let last_applied = *self.last_applied.read().expect("lock poisoned");

        StatusDocument {
            active,
            pending_keys,
            daemon_version: env!("CARGO_PKG_VERSION").to_string(),
            last_applied,
            started_at: self.started_at,
            freshness_window_secs,
            nonce_cache_capacity,
        }
    }
}

fn read_document(path: &Path) -> Result<PolicyDocument> {
    match fs::read_to_string(path) {
        Ok(text) => {
            serde_json::from_str(&text).map_err(|e| Error::PersistenceFailed(e.to_string()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PolicyDocument::new()),
        Err(e) => Err(Error::from(e)),
    }
}

/// Serialize a document to canonical bytes and write it to a temp file in
/// `path`'s directory, fsyncing before returning. Does not rename the temp
/// file into place; call [`finalize_rename`] to complete the write.
fn prepare_write(path: &Path, doc: &PolicyDocument) -> Result<NamedTempFile> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let value = serde_json::to_value(doc)?;
    let bytes = canonical_bytes(&value)?;

    let mut tmp = NamedTempFile::new_in(dir)
        .map_err(|e| Error::PersistenceFailed(format!("cannot create temp file: {e}")))?;
    std::io::Write::write_all(&mut tmp, &bytes)
        .map_err(|e| Error::PersistenceFailed(format!("cannot write temp file: {e}")))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| Error::PersistenceFailed(format!("fsync failed: {e}")))?;
    Ok(tmp)
}

/// Rename a temp file prepared by [`prepare_write`] over `path`.
fn finalize_rename(tmp: NamedTempFile, path: &Path) -> Result<()> {
    tmp.persist(path)
        .map_err(|e| Error::PersistenceFailed(format!("rename failed: {e}")))?;
    Ok(())
}

/// Write a policy document to `path` atomically: serialize to a temp file
/// in the same directory, fsync, rename over the target.
pub fn persist_atomic(path: &Path, doc: &PolicyDocument) -> Result<()> {
    let tmp = prepare_write(path, doc)?;
    finalize_rename(tmp, path)?;
    info!(path = %path.display(), "persisted policy document");
    Ok(())
}

/// Current epoch seconds, for stamping backup file names.
#[must_use]
pub fn backup_suffix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the epoch")
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{SchemaEntry, ValueShape};
    use std::collections::BTreeMap as Map;

    fn sample_schema() -> Arc<Schema> {
        let mut entries = Map::new();
        entries.insert(
            "RADIO_ISOLATION".to_string(),
            SchemaEntry {
                shape: ValueShape::EnumString {
                    values: vec!["on".to_string(), "off".to_string()],
                },
                class: Classification::Runtime,
            },
        );
        entries.insert(
            "CLIPBOARD_ISOLATION".to_string(),
            SchemaEntry {
                shape: ValueShape::EnumString {
                    values: vec!["on".to_string(), "off".to_string()],
                },
                class: Classification::Runtime,
            },
        );
        entries.insert(
            "BOOT_VERIFICATION".to_string(),
            SchemaEntry {
                shape: ValueShape::EnumString {
                    values: vec!["strict".to_string(), "permissive".to_string()],
                },
                class: Classification::Reboot,
            },
        );
        Arc::new(Schema::from_entries(entries))
    }

    struct FailingEffector;
    impl Effector for FailingEffector {
        fn apply(&self, key: &str, _value: &PolicyValue) -> Result<()> {
            if key == "RADIO_ISOLATION" {
                Err(Error::EffectorFailed {
                    key: key.to_string(),
                    reason: "radio driver offline".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    fn state_with(effector: Arc<dyn Effector>) -> (PolicyState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let state = PolicyState::load(
            sample_schema(),
            effector,
            dir.path().join("active.json"),
            dir.path().join("pending.json"),
        )
        .unwrap();
        (state, dir)
    }

    #[test]
    fn happy_path_runtime_key_is_applied_and_persisted() {
        let (state, dir) = state_with(Arc::new(NoopEffector));
        let mut args = Map::new();
        args.insert("RADIO_ISOLATION".to_string(), PolicyValue::String("on".into()));

        let outcome = state.set_policy(&args).unwrap();
        assert_eq!(outcome.applied, vec!["RADIO_ISOLATION".to_string()]);
        assert!(outcome.staged.is_empty());
        assert!(outcome.failed.is_empty());

        let on_disk = read_document(&dir.path().join("active.json")).unwrap();
        assert_eq!(on_disk.get("RADIO_ISOLATION"), Some(&PolicyValue::String("on".into())));
    }

    #[test]
    fn reboot_key_is_staged_not_active() {
        let (state, dir) = state_with(Arc::new(NoopEffector));
        let mut args = Map::new();
        args.insert(
            "BOOT_VERIFICATION".to_string(),
            PolicyValue::String("strict".into()),
        );

        let outcome = state.set_policy(&args).unwrap();
        assert!(outcome.applied.is_empty());
        assert_eq!(outcome.staged, vec!["BOOT_VERIFICATION".to_string()]);

        let active_on_disk = read_document(&dir.path().join("active.json")).unwrap();
        assert!(active_on_disk.is_empty());
        let pending_on_disk = read_document(&dir.path().join("pending.json")).unwrap();
        assert!(pending_on_disk.contains_key("BOOT_VERIFICATION"));
    }

    #[test]
    fn mixed_envelope_with_unknown_key_is_rejected_wholesale() {
        let (state, _dir) = state_with(Arc::new(NoopEffector));
        let mut args = Map::new();
        args.insert("RADIO_ISOLATION".to_string(), PolicyValue::String("on".into()));
        args.insert("FOO".to_string(), PolicyValue::String("bar".into()));

        let outcome = state.set_policy(&args).unwrap();
        assert!(outcome.applied.is_empty());
        assert!(outcome.staged.is_empty());
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].key, "FOO");
    }

    #[test]
    fn effector_failure_is_per_key_best_effort() {
        let (state, dir) = state_with(Arc::new(FailingEffector));
        let mut args = Map::new();
        args.insert("RADIO_ISOLATION".to_string(), PolicyValue::String("on".into()));
        args.insert(
            "CLIPBOARD_ISOLATION".to_string(),
            PolicyValue::String("on".into()),
        );

        let outcome = state.set_policy(&args).unwrap();
        assert_eq!(outcome.applied, vec!["CLIPBOARD_ISOLATION".to_string()]);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].key, "RADIO_ISOLATION");

        let on_disk = read_document(&dir.path().join("active.json")).unwrap();
        assert!(!on_disk.contains_key("RADIO_ISOLATION"));
        assert_eq!(
            on_disk.get("CLIPBOARD_ISOLATION"),
            Some(&PolicyValue::String("on".into()))
        );
    }

    #[test]
    fn status_reflects_committed_state() {
        let (state, _dir) = state_with(Arc::new(NoopEffector));
        let mut args = Map::new();
        args.insert("RADIO_ISOLATION".to_string(), PolicyValue::String("on".into()));
        state.set_policy(&args).unwrap();

        let status = state.status(300, 10_000);
        assert_eq!(status.active.get("RADIO_ISOLATION"), Some(&PolicyValue::String("on".into())));
        assert!(status.last_applied.is_some());
    }

    #[test]
    fn mixed_runtime_and_reboot_envelope_commits_both_files_together() {
        let (state, dir) = state_with(Arc::new(NoopEffector));
        let mut args = Map::new();
        args.insert("RADIO_ISOLATION".to_string(), PolicyValue::String("on".into()));
        args.insert(
            "BOOT_VERIFICATION".to_string(),
            PolicyValue::String("strict".into()),
        );

        let outcome = state.set_policy(&args).unwrap();
        assert_eq!(outcome.applied, vec!["RADIO_ISOLATION".to_string()]);
        assert_eq!(outcome.staged, vec!["BOOT_VERIFICATION".to_string()]);
        assert!(outcome.failed.is_empty());

        let active_on_disk = read_document(&dir.path().join("active.json")).unwrap();
        assert_eq!(
            active_on_disk.get("RADIO_ISOLATION"),
            Some(&PolicyValue::String("on".into()))
        );
        let pending_on_disk = read_document(&dir.path().join("pending.json")).unwrap();
        assert_eq!(
            pending_on_disk.get("BOOT_VERIFICATION"),
            Some(&PolicyValue::String("strict".into()))
        );
    }
}
