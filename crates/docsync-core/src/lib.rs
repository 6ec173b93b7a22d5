//! Core record model and content fingerprinting for docsync.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "docsync-core";

/// Deepest container nesting accepted by [`canonical_bytes`]. Matches the
/// recursion limit `serde_json` enforces while parsing.
pub const MAX_CANONICAL_DEPTH: usize = 128;

const FINGERPRINT_HEX_LEN: usize = 64;

/// Untyped record fetched from a source: one JSON object.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Map<String, Value>> for Record {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("expected a JSON object, found {found}")]
pub struct NotAnObject {
    pub found: &'static str,
}

impl TryFrom<Value> for Record {
    type Error = NotAnObject;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(fields) => Ok(Self(fields)),
            other => Err(NotAnObject {
                found: json_type_name(&other),
            }),
        }
    }
}

pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Lowercase hex SHA-256 of a record's canonical serialization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(record: &Record) -> Result<Self, FingerprintError> {
        let bytes = canonical_bytes(record)?;
        Ok(Self(sha256_hex(&bytes)))
    }

    /// Accepts a previously computed fingerprint, e.g. one read back from a store.
    pub fn parse(hex: &str) -> Result<Self, InvalidFingerprint> {
        let well_formed = hex.len() == FINGERPRINT_HEX_LEN
            && hex
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if well_formed {
            Ok(Self(hex.to_string()))
        } else {
            Err(InvalidFingerprint(hex.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = InvalidFingerprint;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Fingerprint> for String {
    fn from(value: Fingerprint) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("not a 64-character lowercase hex fingerprint: {0:?}")]
pub struct InvalidFingerprint(pub String);

#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("record nesting exceeds {limit} levels")]
    TooDeep { limit: usize },
    #[error("serializing record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Persisted form of a record, keyed by its fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub fingerprint: Fingerprint,
    pub fetched_at: DateTime<Utc>,
    pub data: Record,
}

pub fn fingerprint(record: &Record) -> Result<Fingerprint, FingerprintError> {
    Fingerprint::of(record)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Compact JSON with object keys sorted bytewise at every level.
///
/// The output does not depend on the iteration order of the underlying map,
/// so it stays stable even when `serde_json/preserve_order` is enabled
/// somewhere in the dependency graph.
pub fn canonical_bytes(record: &Record) -> Result<Vec<u8>, FingerprintError> {
    let mut out = Vec::with_capacity(256);
    write_object(&mut out, record.as_map(), 1)?;
    Ok(out)
}

fn write_value(out: &mut Vec<u8>, value: &Value, depth: usize) -> Result<(), FingerprintError> {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => serde_json::to_writer(&mut *out, n)?,
        Value::String(s) => serde_json::to_writer(&mut *out, s)?,
        Value::Array(items) => {
            check_depth(depth)?;
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(out, item, depth + 1)?;
            }
            out.push(b']');
        }
        Value::Object(map) => write_object(out, map, depth)?,
    }
    Ok(())
}

fn write_object(
    out: &mut Vec<u8>,
    map: &Map<String, Value>,
    depth: usize,
) -> Result<(), FingerprintError> {
    check_depth(depth)?;
    let mut entries = map.iter().collect::<Vec<_>>();
    entries.sort_by(|(a, _), (b, _)| a.as_bytes().cmp(b.as_bytes()));

    out.push(b'{');
    for (i, (key, value)) in entries.into_iter().enumerate() {
        if i > 0 {
            out.push(b',');
        }
        serde_json::to_writer(&mut *out, key)?;
        out.push(b':');
        write_value(out, value, depth + 1)?;
    }
    out.push(b'}');
    Ok(())
}

fn check_depth(depth: usize) -> Result<(), FingerprintError> {
    if depth > MAX_CANONICAL_DEPTH {
        Err(FingerprintError::TooDeep {
            limit: MAX_CANONICAL_DEPTH,
        })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        Record::try_from(value).expect("object")
    }

    fn nested(depth: usize) -> Record {
        let mut value = json!({"leaf": true});
        for _ in 1..depth {
            value = json!({ "child": value });
        }
        record(value)
    }

    #[test]
    fn sha256_hex_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn canonical_form_sorts_keys_at_every_level() {
        let r = record(json!({
            "title": "a",
            "id": 1,
            "meta": {"z": [3, {"b": null, "a": false}], "a": "x\"y"}
        }));
        let bytes = canonical_bytes(&r).expect("canonical");
        assert_eq!(
            String::from_utf8(bytes).expect("utf8"),
            r#"{"id":1,"meta":{"a":"x\"y","z":[3,{"a":false,"b":null}]},"title":"a"}"#
        );
    }

    #[test]
    fn fingerprint_ignores_construction_order() {
        let mut forward = Map::new();
        forward.insert("id".into(), json!(1));
        forward.insert("title".into(), json!("a"));
        forward.insert("tags".into(), json!(["x", "y"]));

        let mut backward = Map::new();
        backward.insert("tags".into(), json!(["x", "y"]));
        backward.insert("title".into(), json!("a"));
        backward.insert("id".into(), json!(1));

        let a = fingerprint(&Record::new(forward)).expect("fp");
        let b = fingerprint(&Record::new(backward)).expect("fp");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn fingerprint_tracks_content() {
        let a = fingerprint(&record(json!({"id": 1, "title": "a"}))).expect("fp");
        let b = fingerprint(&record(json!({"id": 2, "title": "a"}))).expect("fp");
        let reordered = fingerprint(&record(json!({"tags": ["y", "x"]}))).expect("fp");
        let original = fingerprint(&record(json!({"tags": ["x", "y"]}))).expect("fp");
        assert_ne!(a, b);
        assert_ne!(reordered, original);
    }

    #[test]
    fn fingerprint_matches_hash_of_canonical_bytes() {
        let r = record(json!({"id": 1}));
        let fp = fingerprint(&r).expect("fp");
        assert_eq!(fp.as_str(), sha256_hex(br#"{"id":1}"#));
    }

    #[test]
    fn too_deep_records_fail_instead_of_hashing_empty() {
        assert!(fingerprint(&nested(MAX_CANONICAL_DEPTH)).is_ok());
        let err = fingerprint(&nested(MAX_CANONICAL_DEPTH + 1)).expect_err("too deep");
        assert!(matches!(err, FingerprintError::TooDeep { limit } if limit == MAX_CANONICAL_DEPTH));
    }

    #[test]
    fn parse_accepts_only_lowercase_hex_of_the_right_length() {
        let fp = fingerprint(&record(json!({}))).expect("fp");
        assert_eq!(Fingerprint::parse(fp.as_str()).expect("valid"), fp);
        assert!(Fingerprint::parse("").is_err());
        assert!(Fingerprint::parse(&fp.as_str().to_uppercase()).is_err());
        assert!(Fingerprint::parse(&fp.as_str()[..63]).is_err());
    }

    #[test]
    fn non_objects_are_not_records() {
        let err = Record::try_from(json!([1, 2])).expect_err("array");
        assert_eq!(err.found, "array");
        assert_eq!(json_type_name(&json!("s")), "string");
    }

    #[test]
    fn stored_document_serializes_fingerprint_as_string() {
        let data = record(json!({"id": 1}));
        let doc = StoredDocument {
            fingerprint: fingerprint(&data).expect("fp"),
            fetched_at: DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
                .expect("ts")
                .with_timezone(&Utc),
            data,
        };
        let value = serde_json::to_value(&doc).expect("serialize");
        assert_eq!(value["fingerprint"], json!(doc.fingerprint.as_str()));
        assert_eq!(value["data"], json!({"id": 1}));
        let back: StoredDocument = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, doc);
    }
}
