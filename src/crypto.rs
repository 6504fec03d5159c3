//! Ed25519 signing primitives and on-disk key handling.
//!
//! # Security
//!
//! - Uses `ed25519-dalek` for signatures.
//! - Uses `blake3` to fingerprint public keys for logging (never the full
//!   key material).
//! - Key files are written with owner-only permissions (mode `0600`).

use std::fs;
use std::path::Path;

use ed25519_dalek::{
    Signature as DalekSignature, Signer as DalekSigner, SigningKey, Verifier as DalekVerifier,
    VerifyingKey,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Ed25519 public key for signature verification.
///
/// Public keys are 32 bytes (256 bits) as per the Ed25519 specification.
/// The parsed curve point is cached alongside the raw bytes so repeated
/// verification against the same key doesn't re-parse it each time.
#[derive(Clone)]
pub struct PublicKey {
    bytes: [u8; 32],
    verifying_key: VerifyingKey,
}

impl PublicKey {
    fn from_verifying_key(verifying_key: VerifyingKey) -> Self {
        Self {
            bytes: verifying_key.to_bytes(),
            verifying_key,
        }
    }

    /// Create a public key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes don't form a valid public key.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 32 {
            return Err(Error::Key("public key must be 32 bytes".into()));
        }

        let mut arr = [0u8; 32];
        arr.copy_from_slice(bytes);

        let verifying_key =
            VerifyingKey::from_bytes(&arr).map_err(|_| Error::Key("invalid public key".into()))?;

        Ok(Self::from_verifying_key(verifying_key))
    }

    /// Get the raw bytes of this public key.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    /// A short, stable fingerprint safe to write to logs.
    ///
    /// Logs never carry the raw key; only the first four bytes of its
    /// BLAKE3 hash, hex-encoded, for the `BadSignature` audit trail.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let hash = blake3::hash(&self.bytes);
        hex::encode(&hash.as_bytes()[..4])
    }

    /// Verify a signature over a message.
    ///
    /// # Errors
    ///
    /// Returns `Error::BadSignature` if the signature is invalid.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        let sig = DalekSignature::from_bytes(&signature.bytes);
        self.verifying_key
            .verify(message, &sig)
            .map_err(|_| Error::BadSignature)
    }

    /// Load a public key from a file written by [`PublicKey::write_to_file`]
    /// or the matching half of a [`KeyPair`].
    pub fn read_from_file(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    /// Write the raw key bytes to `path` with mode `0600`.
    #[cfg(unix)]
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        fs::write(path, self.bytes)?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        Ok(())
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for PublicKey {}

impl std::hash::Hash for PublicKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.bytes.hash(state);
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.bytes.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes = <[u8; 32]>::deserialize(deserializer)?;
        Self::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({}...)", self.fingerprint())
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.bytes))
    }
}

/// Ed25519 detached signature (64 bytes).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    bytes: [u8; 64],
}

// Manual Serialize/Deserialize for [u8; 64] since serde doesn't support arrays > 32.
impl serde::Serialize for Signature {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serde_bytes::serialize(&self.bytes[..], serializer)
    }
}

impl<'de> serde::Deserialize<'de> for Signature {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes: Vec<u8> = serde_bytes::deserialize(deserializer)?;
        if bytes.len() != 64 {
            return Err(serde::de::Error::custom("signature must be 64 bytes"));
        }
        let mut arr = [0u8; 64];
        arr.copy_from_slice(&bytes);
        Ok(Self { bytes: arr })
    }
}

impl Signature {
    /// Create a signature from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the signature is not 64 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 64 {
            return Err(Error::Key("signature must be 64 bytes".into()));
        }

        let mut arr = [0u8; 64];
        arr.copy_from_slice(bytes);
        Ok(Self { bytes: arr })
    }

    /// Get the raw bytes of this signature.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 64] {
        &self.bytes
    }

    /// Base64-encode this signature for the wire envelope (§6).
    #[must_use]
    pub fn to_base64(&self) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(self.bytes)
    }

    /// Decode a signature from its base64 transport form.
    ///
    /// # Errors
    ///
    /// Returns `Error::MalformedMessage` if `s` is not valid base64, or
    /// `Error::Key` if it doesn't decode to 64 bytes.
    pub fn from_base64(s: &str) -> Result<Self> {
        use base64::Engine;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(|e| Error::MalformedMessage(format!("invalid base64 signature: {e}")))?;
        Self::from_bytes(&bytes)
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({}...)", hex::encode(&self.bytes[..8]))
    }
}

/// Ed25519 key pair: a secret signing key plus its public half.
pub struct KeyPair {
    signing_key: SigningKey,
    public_key: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair.
    ///
    /// Uses the operating system's cryptographically secure random number
    /// generator, per the bootstrap operation of §6.
    #[must_use]
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let public_key = PublicKey::from_verifying_key(signing_key.verifying_key());
        Self {
            signing_key,
            public_key,
        }
    }

    /// Get the public key component of this key pair.
    #[must_use]
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Sign a message, producing a detached 64-byte Ed25519 signature.
    pub fn sign(&self, message: &[u8]) -> Signature {
        let sig = self.signing_key.sign(message);
        Signature {
            bytes: sig.to_bytes(),
        }
    }

    /// Verify a signature against this key pair's own public key.
    ///
    /// # Errors
    ///
    /// Returns `Error::BadSignature` if the signature is invalid.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        self.public_key.verify(message, signature)
    }

    /// Load a signing key pair from a raw 32-byte private key file.
    ///
    /// The control-side CLI is the only party that ever reads this file;
    /// the daemon never holds a private key.
    pub fn read_from_file(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        if bytes.len() != 32 {
            return Err(Error::Key("private key must be 32 bytes".into()));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        let signing_key = SigningKey::from_bytes(&arr);
        let public_key = PublicKey::from_verifying_key(signing_key.verifying_key());
        Ok(Self {
            signing_key,
            public_key,
        })
    }

    /// Write the raw 32-byte private key to `path` with mode `0600`.
    #[cfg(unix)]
    pub fn write_private_key_to_file(&self, path: &Path) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        fs::write(path, self.signing_key.to_bytes())?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        Ok(())
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyPair(public={:?})", self.public_key)
    }
}
