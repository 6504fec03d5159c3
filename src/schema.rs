//! The policy schema: the single source of truth for which keys exist,
//! what values they accept, and whether they apply immediately or wait for
//! the next boot.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::envelope::PolicyValue;
use crate::error::{Error, Result};

/// A tagged variant over the value shapes a policy key can declare.
///
/// Replaces the ad-hoc string/number checking an untyped schema would need
/// with a structural match, per the design note that validation should be
/// a match over known shapes rather than per-key special-casing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValueShape {
    /// A string drawn from a fixed allowed set.
    EnumString {
        /// The allowed values.
        values: Vec<String>,
    },
    /// An integer within an inclusive range.
    BoundedInteger {
        /// Minimum allowed value, inclusive.
        min: i64,
        /// Maximum allowed value, inclusive.
        max: i64,
    },
    /// A non-negative duration in seconds, bounded above.
    Duration {
        /// Maximum allowed duration, in seconds.
        max_secs: u64,
    },
    /// A true/false flag.
    Boolean,
}

/// Whether a key's new value applies immediately or waits for the next
/// boot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Applied to active policy immediately and pushed to an effector.
    Runtime,
    /// Staged to pending policy; promoted by the boot applier.
    Reboot,
}

/// One schema entry: a key's value shape plus its classification.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchemaEntry {
    /// The accepted value shape.
    pub shape: ValueShape,
    /// Runtime or reboot.
    pub class: Classification,
}

/// The full set of recognized policy keys.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Schema {
    entries: BTreeMap<String, SchemaEntry>,
}

impl Schema {
    /// Load a schema document from disk.
    ///
    /// # Errors
    ///
    /// Returns `Error::Schema` if the file is absent or malformed. The
    /// daemon and applier must both fail to start under this condition.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Schema(format!("cannot read schema at {path:?}: {e}")))?;
        serde_json::from_str(&text)
            .map_err(|e| Error::Schema(format!("cannot parse schema at {path:?}: {e}")))
    }

    /// Look up a key's entry.
    #[must_use]
    pub fn entry(&self, key: &str) -> Option<&SchemaEntry> {
        self.entries.get(key)
    }

    /// The classification for a known key.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownKey` if the key is not in the schema.
    pub fn classify(&self, key: &str) -> Result<Classification> {
        self.entry(key)
            .map(|e| e.class)
            .ok_or_else(|| Error::UnknownKey(key.to_string()))
    }

    /// Validate a candidate value against a key's declared shape.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownKey` if the key is absent, or
    /// `Error::InvalidValue` if the value doesn't match the key's shape.
    pub fn validate(&self, key: &str, value: &PolicyValue) -> Result<()> {
        let entry = self
            .entry(key)
            .ok_or_else(|| Error::UnknownKey(key.to_string()))?;

        let ok = match (&entry.shape, value) {
            (ValueShape::EnumString { values }, PolicyValue::String(s)) => {
                values.iter().any(|v| v == s)
            }
            (ValueShape::BoundedInteger { min, max }, PolicyValue::Integer(n)) => {
                n >= min && n <= max
            }
            (ValueShape::Duration { max_secs }, PolicyValue::Integer(n)) => {
                *n >= 0 && (*n as u64) <= *max_secs
            }
            (ValueShape::Boolean, PolicyValue::Bool(_)) => true,
            _ => false,
        };

        if ok {
            Ok(())
        } else {
            Err(Error::InvalidValue {
                key: key.to_string(),
                reason: format!(
                    "{} is not a valid {:?} for this key",
                    value.kind_name(),
                    entry.shape
                ),
            })
        }
    }

    /// Iterate over all entries, for the boot applier's classification check.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &SchemaEntry)> {
        self.entries.iter()
    }
}

#[cfg(test)]
impl Schema {
    /// Build a schema directly from entries, for tests elsewhere in the
    /// crate that need a schema without a file on disk.
    pub(crate) fn from_entries(entries: BTreeMap<String, SchemaEntry>) -> Self {
        Self { entries }
    }
}
