//! Field value encoding.
//!
//! Every field is stored as the compact JSON text of its value. That gives
//! one canonical form per value across all backends: booleans are `true` /
//! `false` (never `1`/`0`, which would collide with integers), strings are
//! quoted, integers are bare so Redis `HINCRBY` works on them directly, and
//! timestamps travel as RFC 3339 strings.
//!
//! Values written by other tools that are not valid JSON decode to plain
//! strings instead of failing.

use std::collections::BTreeMap;
use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use crate::error::{StoreError, StoreResult};

/// A decoded record: field name to value.
pub type Record = serde_json::Map<String, Value>;

/// A record as the backends store it: field name to encoded value.
pub type RawRecord = BTreeMap<String, String>;

// ── scalar values ────────────────────────────────────────────────────

pub fn encode_value(value: &Value) -> String {
    value.to_string()
}

pub fn decode_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_owned()))
}

/// Convert any serializable value into a [`Value`].
pub fn to_value<T: Serialize + ?Sized>(value: &T) -> StoreResult<Value> {
    Ok(serde_json::to_value(value)?)
}

/// Convert a serializable struct or map into a [`Record`].
pub fn to_record<T: Serialize + ?Sized>(value: &T) -> StoreResult<Record> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::Reconstruct(format!(
            "expected an object, got {}",
            kind_of(&other)
        ))),
    }
}

// ── records ──────────────────────────────────────────────────────────

pub fn encode_record(record: &Record) -> RawRecord {
    record
        .iter()
        .map(|(field, value)| (field.clone(), encode_value(value)))
        .collect()
}

pub fn decode_record(raw: RawRecord) -> Record {
    raw.into_iter()
        .map(|(field, value)| {
            let decoded = decode_value(&value);
            (field, decoded)
        })
        .collect()
}

// ── read-modify-write helpers shared by the backends ─────────────────

/// Apply an integer increment to an encoded field value.
///
/// A missing field counts as zero. Anything that is not an integer in its
/// encoded form fails without producing a new value.
pub(crate) fn increment_encoded(field: &str, current: Option<&str>, by: i64) -> StoreResult<i64> {
    let base = match current {
        None => 0,
        Some(raw) => raw.parse::<i64>().map_err(|_| StoreError::NonNumeric {
            field: field.to_owned(),
        })?,
    };
    base.checked_add(by).ok_or_else(|| StoreError::NonNumeric {
        field: field.to_owned(),
    })
}

/// Append `item` to the list held in an encoded field value.
///
/// A missing field becomes a one-element list. A field holding something
/// other than a list is replaced.
pub(crate) fn append_encoded(field: &str, current: Option<&str>, item: Value) -> String {
    let mut list = match current.map(decode_value) {
        None => Vec::new(),
        Some(Value::Array(items)) => items,
        Some(other) => {
            warn!(field, found = kind_of(&other), "field is not a list, replacing");
            Vec::new()
        }
    };
    list.push(item);
    encode_value(&Value::Array(list))
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ── structured reconstruction ────────────────────────────────────────

/// Turns a flat record into a caller-defined type.
///
/// Implemented for any `Fn(Record) -> StoreResult<T>` closure and for
/// [`SerdeModel`], which goes through `serde`.
pub trait Reconstruct<T> {
    fn reconstruct(&self, record: Record) -> StoreResult<T>;
}

impl<T, F> Reconstruct<T> for F
where
    F: Fn(Record) -> StoreResult<T>,
{
    fn reconstruct(&self, record: Record) -> StoreResult<T> {
        self(record)
    }
}

/// Reconstructs any `DeserializeOwned` type, nested structs included.
pub struct SerdeModel<T>(PhantomData<fn() -> T>);

impl<T> SerdeModel<T> {
    #[must_use]
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for SerdeModel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> Reconstruct<T> for SerdeModel<T> {
    fn reconstruct(&self, record: Record) -> StoreResult<T> {
        serde_json::from_value(Value::Object(record))
            .map_err(|e| StoreError::Reconstruct(e.to_string()))
    }
}
