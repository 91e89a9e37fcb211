use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use sha2::{Digest as _, Sha256};
use thiserror::Error;

/// A 256-bit SHA-256 digest. Serialized as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(pub [u8; 32]);

#[derive(Error, Debug)]
pub enum HashError {
    #[error("value cannot be canonically encoded: {0}")]
    Unencodable(String),
    #[error("invalid digest hex: {0}")]
    InvalidHex(String),
}

impl Digest {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, HashError> {
        let bytes = hex::decode(s).map_err(|e| HashError::InvalidHex(e.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| HashError::InvalidHex(format!("expected 32 bytes: {s}")))?;
        Ok(Self(arr))
    }

    /// Abbreviated form for log lines.
    pub fn short(&self) -> String {
        self.to_hex()[..16].to_string()
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

pub fn hash_bytes(bytes: &[u8]) -> Digest {
    Digest(Sha256::digest(bytes).into())
}

/// `H(left || right)`, the interior node function of the Merkle tree.
pub fn hash_pair(left: &Digest, right: &Digest) -> Digest {
    let mut h = Sha256::new();
    h.update(left.0);
    h.update(right.0);
    Digest(h.finalize().into())
}

/// Encode `value` as canonical JSON: object keys sorted, no whitespace.
///
/// Semantically equal values produce byte-identical output regardless of
/// field insertion order. Failure means the caller handed over something
/// JSON cannot express (e.g. a map with non-string keys), which is a bug at
/// the call site rather than a runtime condition.
pub fn canonicalize<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, HashError> {
    let raw = serde_json::to_value(value).map_err(|e| HashError::Unencodable(e.to_string()))?;
    let sorted = sort_keys(raw);
    serde_json::to_vec(&sorted).map_err(|e| HashError::Unencodable(e.to_string()))
}

pub fn hash_canonical<T: Serialize + ?Sized>(value: &T) -> Result<Digest, HashError> {
    Ok(hash_bytes(&canonicalize(value)?))
}

// Rebuild every object through a BTreeMap so ordering never depends on the
// serde_json map backend in use.
fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> =
                map.into_iter().map(|(k, v)| (k, sort_keys(v))).collect();
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}
