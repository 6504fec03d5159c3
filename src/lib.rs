//! Signed Control Bus
//!
//! An authenticated policy command channel between an offline control
//! domain and a long-running policy daemon. The daemon is the sole
//! authority that validates, classifies, and commits policy; the CLI only
//! signs and sends. Reboot-classified updates are staged and reconciled
//! into active policy by a separate boot-time applier.
//!
//! # Overview
//!
//! - [`crypto`] and [`envelope`]: the canonical codec, deterministic
//!   serialization plus Ed25519 sign/verify.
//! - [`replay`]: the bounded nonce cache and freshness-window guard.
//! - [`schema`] and [`policy`]: schema-driven validation, classification,
//!   and atomically-persisted active/pending state.
//! - [`daemon`]: the Unix-domain socket endpoint.
//! - [`applier`]: the one-shot boot-time reconciler.
//! - [`config`]: struct-carried runtime configuration.
//!
//! # Example
//!
//! ```rust,ignore
//! use signed_control_bus::{crypto::KeyPair, envelope::{CommandMsg, sign, verify}};
//! use std::collections::BTreeMap;
//!
//! let keypair = KeyPair::generate();
//! let msg = CommandMsg {
//!     command: "set_policy".to_string(),
//!     args: BTreeMap::new(),
//!     nonce: "AAAAAAAAAAAAAAAAAAAAAA==".to_string(),
//!     timestamp: 1_700_000_000,
//! };
//! let signature = sign(&keypair, &msg)?;
//! assert!(verify(keypair.public_key(), &msg, &signature).is_ok());
//! # Ok::<(), signed_control_bus::Error>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod applier;
pub mod config;
pub mod crypto;
pub mod daemon;
pub mod envelope;
pub mod error;
pub mod policy;
pub mod replay;
pub mod schema;

pub use config::Config;
pub use crypto::{KeyPair, PublicKey, Signature};
pub use envelope::{canonicalize, sign, verify, CommandEnvelope, CommandMsg, PolicyValue};
pub use error::{Error, Result};
pub use policy::{Effector, NoopEffector, PolicyState, SetPolicyOutcome, StatusDocument};
pub use replay::ReplayGuard;
pub use schema::Schema;
