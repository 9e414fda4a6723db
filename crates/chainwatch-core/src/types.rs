//! Shared types for the observation engine.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::WatchError;

// ─── BlockRef ─────────────────────────────────────────────────────────────────

/// Reference to one block of the monitored chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    /// Block height.
    pub number: u64,
    /// Block id / hash.
    pub hash: String,
    /// Id / hash of the previous block.
    pub parent_hash: String,
    /// Unix timestamp of the block (seconds since epoch).
    #[serde(default)]
    pub timestamp: i64,
}

impl BlockRef {
    pub fn new(number: u64, hash: impl Into<String>, parent_hash: impl Into<String>) -> Self {
        Self {
            number,
            hash: hash.into(),
            parent_hash: parent_hash.into(),
            timestamp: 0,
        }
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Returns `true` if `parent` is the direct parent of `self`.
    pub fn extends(&self, parent: &BlockRef) -> bool {
        self.number == parent.number + 1 && self.parent_hash == parent.hash
    }
}

// ─── ClassifierKey ────────────────────────────────────────────────────────────

/// Stable identity of a classifier, used as the per-block cache key.
///
/// Two classifiers with the same key must mean the same fact for a block.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClassifierKey(String);

impl ClassifierKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Append a parameter: `accounts` + `alice` → `accounts(alice)`,
    /// then + `bob` → `accounts(alice,bob)`.
    pub fn with_param(mut self, param: impl AsRef<str>) -> Self {
        if self.0.ends_with(')') {
            self.0.pop();
            self.0.push(',');
        } else {
            self.0.push('(');
        }
        self.0.push_str(param.as_ref());
        self.0.push(')');
        self
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClassifierKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClassifierKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// ─── Fields ───────────────────────────────────────────────────────────────────

/// The accumulating output object of one pipeline evaluation.
pub type Fields = serde_json::Map<String, Value>;

/// Serialize `value` into output fields.
///
/// Objects become fields, `null` becomes no fields; anything else cannot be
/// merged into the output object.
pub fn to_fields<T: Serialize + ?Sized>(value: &T) -> Result<Fields, WatchError> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Fields::new()),
        other => Err(WatchError::InvalidOutput {
            reason: format!("expected an object, got {}", json_kind(&other)),
        }),
    }
}

/// Merge `update` into `target`; later keys overwrite earlier ones.
pub(crate) fn merge_fields(target: &mut Fields, update: Fields) {
    for (k, v) in update {
        target.insert(k, v);
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
