//! Canonical JSON serialization, hashing and golden normalization.
//!
//! Everything in this module is a pure function. Canonical JSON sorts object
//! keys at every depth and emits no insignificant whitespace, so two values
//! that differ only in key order produce the same string and the same hash.

use std::collections::BTreeSet;

use ledgerflow_types::config::GoldenOptions;
use serde::Serialize;
use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};

/// Keys whose values change between otherwise identical runs.
pub const VOLATILE_KEYS: &[&str] = &[
    "timestamp",
    "ts",
    "created_at",
    "updated_at",
    "started_at",
    "completed_at",
    "recorded_at",
    "duration_ms",
    "latency_ms",
    "elapsed_ms",
];

/// Replacement for the value of a sensitive key.
pub const REDACTION_MARKER: &str = "[REDACTED]";

/// Key segments that mark a value as a secret.
const SENSITIVE_SEGMENTS: &[&str] = &[
    "password",
    "passwd",
    "pwd",
    "token",
    "secret",
    "apikey",
    "authorization",
    "credential",
    "credentials",
];

/// Compound names matched as substrings of the normalized key.
const SENSITIVE_COMPOUNDS: &[&str] = &["api_key", "private_key", "access_key"];

// ---------------------------------------------------------------------------
// Serialization and hashing
// ---------------------------------------------------------------------------

/// Serialize a value with sorted keys and no whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&format_number(n)),
        Value::String(s) => out.push_str(&Value::String(s.clone()).to_string()),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
    }
}

/// Integers print as-is; floats use the shortest round-trip form, with
/// negative zero folded into zero.
fn format_number(n: &Number) -> String {
    match n.as_f64() {
        Some(f) if n.is_f64() && f == 0.0 => "0.0".to_string(),
        _ => n.to_string(),
    }
}

/// Canonical JSON of any serializable value.
pub fn canonical_json_of<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    Ok(canonical_json(&serde_json::to_value(value)?))
}

/// Lowercase hex SHA-256 of the canonical JSON of `value`.
pub fn canonical_hash(value: &Value) -> String {
    let digest = Sha256::digest(canonical_json(value).as_bytes());
    format!("{:x}", digest)
}

/// Canonical hash of any serializable value.
pub fn canonical_hash_of<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    Ok(canonical_hash(&serde_json::to_value(value)?))
}

// ---------------------------------------------------------------------------
// Golden normalization
// ---------------------------------------------------------------------------

/// Normalize a payload for golden recording: drop volatile keys, optionally
/// redact secrets, round floats to `float_precision` decimals.
pub fn canonicalize_for_golden(value: &Value, options: &GoldenOptions) -> Value {
    let stripped = strip_volatile(value);
    let redacted = if options.redact_sensitive {
        redact_sensitive(&stripped)
    } else {
        stripped
    };
    round_floats(&redacted, options.float_precision)
}

pub fn is_volatile_key(key: &str) -> bool {
    VOLATILE_KEYS.contains(&key)
}

/// Whether a key names a secret (`password`, `auth_token`, `api_key`,
/// `clientSecret`, ...). `max_tokens` and similar counters are not secrets.
pub fn is_sensitive_key(key: &str) -> bool {
    let normalized = normalize_key(key);
    if SENSITIVE_COMPOUNDS.iter().any(|c| normalized.contains(c)) {
        return true;
    }
    normalized
        .split('_')
        .any(|segment| SENSITIVE_SEGMENTS.contains(&segment))
}

/// snake_case the key: camelCase boundaries and dashes become underscores.
fn normalize_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    let mut prev_lower = false;
    for c in key.chars() {
        if c.is_ascii_uppercase() && prev_lower {
            out.push('_');
        }
        prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
        match c {
            '-' | '.' | ' ' => out.push('_'),
            _ => out.push(c.to_ascii_lowercase()),
        }
    }
    out
}

/// Remove volatile keys at any depth.
pub fn strip_volatile(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !is_volatile_key(k))
                .map(|(k, v)| (k.clone(), strip_volatile(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(strip_volatile).collect()),
        other => other.clone(),
    }
}

/// Replace the values of sensitive keys at any depth with [`REDACTION_MARKER`].
pub fn redact_sensitive(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    if is_sensitive_key(k) {
                        (k.clone(), Value::String(REDACTION_MARKER.to_string()))
                    } else {
                        (k.clone(), redact_sensitive(v))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_sensitive).collect()),
        other => other.clone(),
    }
}

/// Round every float to `precision` decimals. Magnitudes below the precision
/// collapse to zero. Integers are untouched.
pub fn round_floats(value: &Value, precision: u32) -> Value {
    match value {
        Value::Number(n) if n.is_f64() => n
            .as_f64()
            .map(|f| round_float(f, precision))
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| value.clone()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), round_floats(v, precision)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items.iter().map(|v| round_floats(v, precision)).collect(),
        ),
        other => other.clone(),
    }
}

fn round_float(f: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision.min(15) as i32);
    let scaled = f * factor;
    if !scaled.is_finite() {
        return f;
    }
    let rounded = scaled.round() / factor;
    if rounded == 0.0 { 0.0 } else { rounded }
}

/// Strip volatile keys from each event in a sequence.
pub fn strip_volatile_from_events(events: &[Value]) -> Vec<Value> {
    events.iter().map(strip_volatile).collect()
}

// ---------------------------------------------------------------------------
// Comparison
// ---------------------------------------------------------------------------

/// One differing leaf between two values. `None` means the path is absent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalDiff {
    pub path: String,
    pub actual: Option<Value>,
    pub expected: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalComparison {
    #[serde(rename = "match")]
    pub matches: bool,
    pub diffs: Vec<CanonicalDiff>,
}

/// Structural comparison ignoring volatile keys. Diff paths use `$.key[0]`
/// notation and are reported in sorted-key order.
pub fn compare_canonical(actual: &Value, expected: &Value) -> CanonicalComparison {
    let actual = strip_volatile(actual);
    let expected = strip_volatile(expected);
    let mut diffs = Vec::new();
    diff_values("$", Some(&actual), Some(&expected), &mut diffs);
    CanonicalComparison {
        matches: diffs.is_empty(),
        diffs,
    }
}

fn diff_values(
    path: &str,
    actual: Option<&Value>,
    expected: Option<&Value>,
    diffs: &mut Vec<CanonicalDiff>,
) {
    match (actual, expected) {
        (Some(Value::Object(a)), Some(Value::Object(e))) => diff_objects(path, a, e, diffs),
        (Some(Value::Array(a)), Some(Value::Array(e))) => {
            for i in 0..a.len().max(e.len()) {
                diff_values(&format!("{path}[{i}]"), a.get(i), e.get(i), diffs);
            }
        }
        (a, e) => {
            let equal = match (a, e) {
                (Some(a), Some(e)) => canonical_json(a) == canonical_json(e),
                (None, None) => true,
                _ => false,
            };
            if !equal {
                diffs.push(CanonicalDiff {
                    path: path.to_string(),
                    actual: a.cloned(),
                    expected: e.cloned(),
                });
            }
        }
    }
}

fn diff_objects(
    path: &str,
    actual: &Map<String, Value>,
    expected: &Map<String, Value>,
    diffs: &mut Vec<CanonicalDiff>,
) {
    let keys: BTreeSet<&String> = actual.keys().chain(expected.keys()).collect();
    for key in keys {
        diff_values(
            &format!("{path}.{key}"),
            actual.get(key),
            expected.get(key),
            diffs,
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
