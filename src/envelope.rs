//! The canonical codec: deterministic serialization plus sign/verify.
//!
//! Canonicalization is pure and stateless. Given the same logical `msg`,
//! two independent encoders must produce byte-identical output: keys sorted
//! by Unicode code point at every nesting level, no insignificant
//! whitespace, UTF-8 strings with standard JSON escaping, and integers with
//! no leading zeros and no floats anywhere in the structure.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::{KeyPair, PublicKey, Signature};
use crate::error::{Error, Result};

/// A policy value carried in a command envelope's `args` map.
///
/// Untagged: on the wire this is a plain JSON string, integer, or boolean,
/// matching the "string or bounded structured value" shape of the data
/// model. `schema` gives these a type-checked meaning per key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PolicyValue {
    /// A boolean flag.
    Bool(bool),
    /// A bounded or duration integer, in whatever unit the key's schema
    /// entry declares (seconds, for durations).
    Integer(i64),
    /// An enumerated string value.
    String(String),
}

impl PolicyValue {
    /// The value's kind, for error messages.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "boolean",
            Self::Integer(_) => "integer",
            Self::String(_) => "string",
        }
    }
}

/// The signed payload of a command envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandMsg {
    /// The command being issued. Currently `"set_policy"` or `"get_status"`;
    /// anything else is rejected as malformed.
    pub command: String,
    /// Policy-key name to policy-value. Duplicate keys are impossible once
    /// represented as a map; insertion order carries no meaning.
    pub args: BTreeMap<String, PolicyValue>,
    /// 16 bytes of uniform randomness, base64-encoded.
    pub nonce: String,
    /// Integer seconds since the epoch at signing time.
    pub timestamp: i64,
}

/// The `{msg, signature}` record exchanged on the socket.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// The signed payload.
    pub msg: CommandMsg,
    /// Base64-encoded detached signature over `canonicalize(msg)`.
    pub signature: String,
}

/// Produce the canonical byte string for any JSON value.
///
/// Fails with `MalformedMessage` if the value contains a float (no floats
/// are permitted in the envelope) or a number too large to represent
/// exactly as an `i64`/`u64`.
pub fn canonical_bytes(value: &Value) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    write_canonical(value, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) -> Result<()> {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(b) => out.extend_from_slice(if *b { b"true" } else { b"false" }),
        Value::Number(n) => {
            if n.is_f64() && n.as_i64().is_none() && n.as_u64().is_none() {
                return Err(Error::MalformedMessage(
                    "floating point numbers are not permitted in the canonical form".into(),
                ));
            }
            if let Some(i) = n.as_i64() {
                out.extend_from_slice(i.to_string().as_bytes());
            } else if let Some(u) = n.as_u64() {
                out.extend_from_slice(u.to_string().as_bytes());
            } else {
                return Err(Error::MalformedMessage(
                    "number cannot be represented without loss in canonical form".into(),
                ));
            }
        }
        Value::String(s) => {
            let encoded = serde_json::to_string(s)
                .map_err(|e| Error::MalformedMessage(format!("unencodable string: {e}")))?;
            out.extend_from_slice(encoded.as_bytes());
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out)?;
            }
            out.push(b']');
        }
        Value::Object(map) => {
            // BTreeMap<String, _> sorts by byte value, which for valid
            // UTF-8 matches Unicode code point order.
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            out.push(b'{');
            for (i, (key, val)) in sorted.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                let encoded_key = serde_json::to_string(key)
                    .map_err(|e| Error::MalformedMessage(format!("unencodable key: {e}")))?;
                out.extend_from_slice(encoded_key.as_bytes());
                out.push(b':');
                write_canonical(val, out)?;
            }
            out.push(b'}');
        }
    }
    Ok(())
}

/// Compute the canonical byte string for a `CommandMsg`.
pub fn canonicalize(msg: &CommandMsg) -> Result<Vec<u8>> {
    let value = serde_json::to_value(msg)?;
    canonical_bytes(&value)
}

/// Sign a message, returning the detached signature to embed in the
/// envelope.
pub fn sign(keypair: &KeyPair, msg: &CommandMsg) -> Result<Signature> {
    let bytes = canonicalize(msg)?;
    Ok(keypair.sign(&bytes))
}

/// Verify a detached signature over a message.
///
/// # Errors
///
/// Returns `Error::BadSignature` on any mismatch; never panics.
pub fn verify(public_key: &PublicKey, msg: &CommandMsg, signature: &Signature) -> Result<()> {
    let bytes = canonicalize(msg)?;
    public_key.verify(&bytes, signature)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_msg() -> CommandMsg {
        let mut args = BTreeMap::new();
        args.insert("RADIO_ISOLATION".to_string(), PolicyValue::String("on".into()));
        args.insert("MAX_SESSIONS".to_string(), PolicyValue::Integer(4));
        CommandMsg {
            command: "set_policy".to_string(),
            args,
            nonce: "AAAAAAAAAAAAAAAAAAAAAA==".to_string(),
            timestamp: 1_700_000_000,
        }
    }

    #[test]
    fn canonicalize_sorts_object_keys() {
        let value = serde_json::json!({"b": 1, "a": 2});
        let bytes = canonical_bytes(&value).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn canonicalize_has_no_whitespace() {
        let bytes = canonicalize(&sample_msg()).unwrap();
        let s = String::from_utf8(bytes).unwrap();
        assert!(!s.contains(' '));
        assert!(!s.contains('\n'));
    }

    #[test]
    fn canonicalize_rejects_floats() {
        let value = serde_json::json!({"x": 1.5});
        assert!(canonical_bytes(&value).is_err());
    }

    #[test]
    fn canonicalize_is_deterministic() {
        let msg = sample_msg();
        let a = canonicalize(&msg).unwrap();
        let b = canonicalize(&msg).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn sign_then_verify_succeeds() {
        let kp = KeyPair::generate();
        let msg = sample_msg();
        let sig = sign(&kp, &msg).unwrap();
        assert!(verify(kp.public_key(), &msg, &sig).is_ok());
    }

    #[test]
    fn tampering_with_args_breaks_verification() {
        let kp = KeyPair::generate();
        let mut msg = sample_msg();
        let sig = sign(&kp, &msg).unwrap();

        msg.args
            .insert("RADIO_ISOLATION".to_string(), PolicyValue::String("off".into()));
        assert!(verify(kp.public_key(), &msg, &sig).is_err());
    }

    #[test]
    fn different_messages_sign_to_different_bytes() {
        let kp = KeyPair::generate();
        let msg1 = sample_msg();
        let mut msg2 = sample_msg();
        msg2.timestamp += 1;

        let sig1 = sign(&kp, &msg1).unwrap();
        let sig2 = sign(&kp, &msg2).unwrap();
        assert_ne!(sig1.as_bytes(), sig2.as_bytes());
    }

    #[test]
    fn envelope_round_trips_through_json() {
        let kp = KeyPair::generate();
        let msg = sample_msg();
        let signature = sign(&kp, &msg).unwrap();
        let envelope = CommandEnvelope {
            msg: msg.clone(),
            signature: signature.to_base64(),
        };

        let encoded = serde_json::to_vec(&envelope).unwrap();
        let decoded: CommandEnvelope = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded.msg.command, msg.command);
        assert_eq!(decoded.msg.timestamp, msg.timestamp);
    }

    fn arb_policy_value() -> impl proptest::strategy::Strategy<Value = PolicyValue> {
        use proptest::prelude::*;
        prop_oneof![
            any::<bool>().prop_map(PolicyValue::Bool),
            any::<i64>().prop_map(PolicyValue::Integer),
            "[a-zA-Z0-9_]{0,16}".prop_map(PolicyValue::String),
        ]
    }

    fn arb_msg() -> impl proptest::strategy::Strategy<Value = CommandMsg> {
        use proptest::prelude::*;
        (
            "[a-z_]{1,16}",
            proptest::collection::btree_map("[A-Z_]{1,12}", arb_policy_value(), 0..6),
            "[A-Za-z0-9+/=]{16,24}",
            any::<i64>(),
        )
            .prop_map(|(command, args, nonce, timestamp)| CommandMsg {
                command,
                args,
                nonce,
                timestamp,
            })
    }

    proptest::proptest! {
        #[test]
        fn canonicalize_is_deterministic_over_arbitrary_messages(msg in arb_msg()) {
            let a = canonicalize(&msg).unwrap();
            let b = canonicalize(&msg).unwrap();
            proptest::prop_assert_eq!(a, b);
        }

        #[test]
        fn sign_then_verify_holds_for_arbitrary_well_formed_messages(msg in arb_msg()) {
            let kp = KeyPair::generate();
            let sig = sign(&kp, &msg).unwrap();
            proptest::prop_assert!(verify(kp.public_key(), &msg, &sig).is_ok());
        }

        #[test]
        fn distinct_messages_sign_to_distinct_signatures(msg in arb_msg(), extra_byte in proptest::arbitrary::any::<u8>()) {
            let kp = KeyPair::generate();
            let mut other = msg.clone();
            other.nonce.push(char::from(extra_byte % 26 + b'a'));

            let sig1 = sign(&kp, &msg).unwrap();
            let sig2 = sign(&kp, &other).unwrap();
            proptest::prop_assert_ne!(sig1.as_bytes(), sig2.as_bytes());
        }
    }
}
