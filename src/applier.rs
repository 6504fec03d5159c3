//! The boot-time applier: promotes pending policy into active policy
//! exactly once per boot, before any policy-sensitive subsystem starts.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::policy::{backup_suffix, persist_atomic, PolicyDocument};
use crate::schema::{Classification, Schema};

/// Outcome of one applier run, for logging and tests.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Keys promoted from pending into active.
    pub promoted: Vec<String>,
    /// Keys present in pending but ignored because the schema classifies
    /// them as runtime; the daemon never writes such a key to pending.
    pub ignored_runtime_keys: Vec<String>,
}

/// Run the applier once: read active/pending (missing treated as empty),
/// back up active, promote every pending key into active, persist both,
/// and truncate pending.
///
/// Idempotent: running this twice in a row after a successful first run
/// leaves active unchanged and pending empty, since pending is already
/// empty going in.
///
/// # Errors
///
/// Returns `Error::PersistenceFailed` if any atomic write fails. The
/// backup file, if already written, is left in place so the failure is
/// diagnosable.
pub fn run(schema: &Schema, active_path: &Path, pending_path: &Path) -> Result<ApplyReport> {
    let mut active = read_document(active_path)?;
    let pending = read_document(pending_path)?;

    if active_path.exists() {
        backup(active_path)?;
    }

    let mut report = ApplyReport::default();

    for (key, value) in &pending {
        match schema.entry(key).map(|e| e.class) {
            Some(Classification::Reboot) | None => {
                active.insert(key.clone(), value.clone());
                report.promoted.push(key.clone());
            }
            Some(Classification::Runtime) => {
                warn!(key = %key, "ignoring runtime-classified key found in pending policy");
                report.ignored_runtime_keys.push(key.clone());
            }
        }
    }

    persist_atomic(active_path, &active)?;
    persist_atomic(pending_path, &PolicyDocument::new())?;

    info!(promoted = report.promoted.len(), "boot applier run complete");
    Ok(report)
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

fn backup(active_path: &Path) -> Result<PathBuf> {
    let suffix = backup_suffix();
    let backup_path = active_path.with_extension(format!("bak.{suffix}"));
    fs::copy(active_path, &backup_path)?;
    info!(path = %backup_path.display(), "wrote active policy backup");
    Ok(backup_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::PolicyValue;
    use crate::schema::{SchemaEntry, ValueShape};
    use std::collections::BTreeMap;

    fn schema_with_reboot_key(name: &str) -> Schema {
        let mut entries = BTreeMap::new();
        entries.insert(
            name.to_string(),
            SchemaEntry {
                shape: ValueShape::EnumString {
                    values: vec!["strict".to_string(), "permissive".to_string()],
                },
                class: Classification::Reboot,
            },
        );
        Schema::from_entries(entries)
    }

    #[test]
    fn promotes_pending_keys_into_active_and_clears_pending() {
        let dir = tempfile::tempdir().unwrap();
        let active_path = dir.path().join("active.json");
        let pending_path = dir.path().join("pending.json");

        let mut pending = PolicyDocument::new();
        pending.insert(
            "BOOT_VERIFICATION".to_string(),
            PolicyValue::String("strict".into()),
        );
        persist_atomic(&pending_path, &pending).unwrap();
        persist_atomic(&active_path, &PolicyDocument::new()).unwrap();

        let schema = schema_with_reboot_key("BOOT_VERIFICATION");
        let report = run(&schema, &active_path, &pending_path).unwrap();
        assert_eq!(report.promoted, vec!["BOOT_VERIFICATION".to_string()]);

        let active = read_document(&active_path).unwrap();
        assert_eq!(
            active.get("BOOT_VERIFICATION"),
            Some(&PolicyValue::String("strict".into()))
        );
        let pending_after = read_document(&pending_path).unwrap();
        assert!(pending_after.is_empty());
    }

    #[test]
    fn second_run_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let active_path = dir.path().join("active.json");
        let pending_path = dir.path().join("pending.json");

        let mut pending = PolicyDocument::new();
        pending.insert(
            "BOOT_VERIFICATION".to_string(),
            PolicyValue::String("strict".into()),
        );
        persist_atomic(&pending_path, &pending).unwrap();
        persist_atomic(&active_path, &PolicyDocument::new()).unwrap();

        let schema = schema_with_reboot_key("BOOT_VERIFICATION");
        run(&schema, &active_path, &pending_path).unwrap();
        let active_after_first = read_document(&active_path).unwrap();

        let second = run(&schema, &active_path, &pending_path).unwrap();
        assert!(second.promoted.is_empty());
        let active_after_second = read_document(&active_path).unwrap();
        assert_eq!(active_after_first, active_after_second);
    }

    #[test]
    fn missing_files_are_treated_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let active_path = dir.path().join("active.json");
        let pending_path = dir.path().join("pending.json");
        let schema = schema_with_reboot_key("BOOT_VERIFICATION");

        let report = run(&schema, &active_path, &pending_path).unwrap();
        assert!(report.promoted.is_empty());
        assert!(active_path.exists());
        assert!(pending_path.exists());
    }
}
