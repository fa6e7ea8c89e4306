//! Publish payloads, snapshots, and the string<->JSON coercions the Redis hash
//! layout imposes on them.
//!
//! A published payload and a room's snapshot are both represented as
//! `serde_json::Map<String, Value>` — an unordered field -> value mapping.
//! They diverge only in how they round-trip through Redis: a snapshot hash
//! stores every field as a Redis string (stringified primitives, JSON-encoded
//! objects/arrays), so fields read back via `HGETALL` lose their original
//! numeric/boolean type. Fields merged in live from a pub/sub message keep
//! their native JSON type. This asymmetry is preserved rather than "fixed":
//! consumers that need a numeric field must coerce it themselves.

use serde_json::{Map, Value};
use std::collections::HashMap;

/// A published payload or merged snapshot: field name -> JSON value.
pub type Payload = Map<String, Value>;

/// Convert a payload into the string-valued map written via `HSET`.
///
/// Nested objects/arrays are JSON-encoded; primitives are stringified;
/// null/undefined fields are dropped (never written to the hash).
#[must_use]
pub fn encode_for_hash(payload: &Payload) -> HashMap<String, String> {
    payload
        .iter()
        .filter_map(|(k, v)| encode_value_for_hash(v).map(|s| (k.clone(), s)))
        .collect()
}

fn encode_value_for_hash(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(_) | Value::Array(_) => serde_json::to_string(value).ok(),
    }
}

/// Decode a Redis hash's raw string fields back into snapshot values.
///
/// Any value beginning with `{` or `[` is tried as JSON first; on success the
/// decoded structure replaces the raw string. Everything else (including
/// numbers and booleans, which have no type hint once stored as strings) stays
/// a `Value::String`. Numeric/boolean fields read back from the hash are
/// strings -- a consequence of the hash-layout round trip, not a bug.
#[must_use]
pub fn decode_hash_to_snapshot(fields: HashMap<String, String>) -> Payload {
    let mut snapshot = Map::with_capacity(fields.len());
    for (field, raw) in fields {
        let value = decode_hash_field(&raw);
        snapshot.insert(field, value);
    }
    snapshot
}

fn decode_hash_field(raw: &str) -> Value {
    let looks_structured = raw.starts_with('{') || raw.starts_with('[');
    if looks_structured {
        if let Ok(decoded) = serde_json::from_str::<Value>(raw) {
            return decoded;
        }
    }
    Value::String(raw.to_string())
}

/// Shallow-merge `incoming` into `snapshot`, skipping null/undefined fields,
/// exactly as the Room Manager's `HSET` step does for the persisted hash.
/// Values merged this way keep their native JSON type (no string coercion) --
/// only values that made a round trip through the hash are stringified.
pub fn merge_into(snapshot: &mut Payload, incoming: &Payload) {
    for (k, v) in incoming {
        if v.is_null() {
            continue;
        }
        snapshot.insert(k.clone(), v.clone());
    }
}

/// A deep copy of a snapshot, safe to hand to a callback without risking one
/// callback's mutation bleeding into another's view or into the cached state.
#[must_use]
pub fn deep_copy(snapshot: &Payload) -> Payload {
    snapshot.clone()
}
