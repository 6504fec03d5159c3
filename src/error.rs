//! Error types for the Signed Control Bus.

use thiserror::Error;

/// Result type alias used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while verifying, classifying, or applying policy.
///
/// Each variant is a stable wire-level error kind that clients and logs
/// key off of; see [`Error::kind`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// JSON parse failure, unknown command, or missing fields.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Request exceeded the framing size cap.
    #[error("frame too large: {size} bytes exceeds the {limit} byte cap")]
    FrameTooLarge {
        /// The size the caller attempted to send.
        size: usize,
        /// The configured cap.
        limit: usize,
    },

    /// Signature verification failed.
    #[error("invalid signature")]
    BadSignature,

    /// Timestamp lies outside the freshness window.
    #[error("stale envelope: timestamp {timestamp} is outside the {window_secs}s window (now={now})")]
    StaleEnvelope {
        /// The envelope's claimed timestamp.
        timestamp: i64,
        /// The daemon's wall-clock time at receipt.
        now: i64,
        /// The configured freshness window, in seconds.
        window_secs: i64,
    },

    /// Nonce already present in the replay cache.
    #[error("replayed envelope: nonce already seen")]
    ReplayedEnvelope,

    /// A policy key is not present in the schema.
    #[error("unknown key: {0}")]
    UnknownKey(String),

    /// A policy value does not match its key's schema constraints.
    #[error("invalid value for key {key}: {reason}")]
    InvalidValue {
        /// The offending key.
        key: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// An external effector reported failure while applying a runtime key.
    #[error("effector failed for key {key}: {reason}")]
    EffectorFailed {
        /// The key whose effector failed.
        key: String,
        /// The effector's failure reason.
        reason: String,
    },

    /// Atomic persistence (write-temp/fsync/rename) failed.
    #[error("persistence failed: {0}")]
    PersistenceFailed(String),

    /// The command was not recognized.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// The daemon could not load or parse the schema at startup.
    #[error("schema error: {0}")]
    Schema(String),

    /// The daemon could not load a signing/verification key.
    #[error("key error: {0}")]
    Key(String),

    /// I/O failure not otherwise classified above.
    #[error("io error: {0}")]
    Io(String),

    /// The per-request read did not complete within the timeout.
    #[error("request timed out")]
    Timeout,
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::MalformedMessage(e.to_string())
    }
}

impl From<ed25519_dalek::SignatureError> for Error {
    fn from(_: ed25519_dalek::SignatureError) -> Self {
        Error::BadSignature
    }
}

impl Error {
    /// The stable `§7` error-kind identifier clients and logs key off of.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Error::MalformedMessage(_) => "MalformedMessage",
            Error::FrameTooLarge { .. } => "FrameTooLarge",
            Error::BadSignature => "BadSignature",
            Error::StaleEnvelope { .. } => "StaleEnvelope",
            Error::ReplayedEnvelope => "ReplayedEnvelope",
            Error::UnknownKey(_) => "UnknownKey",
            Error::InvalidValue { .. } => "InvalidValue",
            Error::EffectorFailed { .. } => "EffectorFailed",
            Error::PersistenceFailed(_) => "PersistenceFailed",
            Error::UnknownCommand(_) => "MalformedMessage",
            Error::Schema(_) => "Schema",
            Error::Key(_) => "Key",
            Error::Io(_) => "Io",
            Error::Timeout => "Timeout",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_bad_signature() {
        assert_eq!(format!("{}", Error::BadSignature), "invalid signature");
    }

    #[test]
    fn error_display_unknown_key() {
        let err = Error::UnknownKey("FOO".into());
        assert!(format!("{}", err).contains("FOO"));
    }

    #[test]
    fn error_display_stale_envelope() {
        let err = Error::StaleEnvelope {
            timestamp: 100,
            now: 500,
            window_secs: 300,
        };
        let s = format!("{}", err);
        assert!(s.contains("100"));
        assert!(s.contains("500"));
    }

    #[test]
    fn error_clone_and_eq() {
        let a = Error::ReplayedEnvelope;
        let b = a.clone();
        assert_eq!(a, b);
        assert_ne!(a, Error::BadSignature);
    }

    #[test]
    fn error_kind_is_stable_identifier() {
        assert_eq!(Error::UnknownKey("X".into()).kind(), "UnknownKey");
        assert_eq!(Error::UnknownCommand("noop".into()).kind(), "MalformedMessage");
    }

    #[test]
    fn error_display_invalid_value() {
        let err = Error::InvalidValue {
            key: "RADIO_ISOLATION".into(),
            reason: "not in allowed set".into(),
        };
        let s = format!("{}", err);
        assert!(s.contains("RADIO_ISOLATION"));
        assert!(s.contains("not in allowed set"));
    }
}
