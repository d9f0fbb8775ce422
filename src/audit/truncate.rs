//! Size-bounded truncation of JSON snapshots.
//!
//! Object snapshots attached to audit events are capped at a fixed byte
//! ceiling. Reduction is deterministic and field-path addressable:
//!
//! 1. String leaves are shortened largest-first (ties broken by path) to a
//!    prefix followed by a `...[truncated N bytes]` marker.
//! 2. If that is not enough, non-root arrays and objects are elided
//!    largest-first and replaced by an `[elided N bytes]` marker.
//! 3. As a last resort the whole document is replaced by the marker.
//!
//! Every path that was altered is reported, so the degree of loss stays
//! machine-readable. Objects are walked key-sorted, arrays by index.

use std::cmp::Reverse;

use serde_json::Value;

use crate::error::{AuditError, AuditResult};

/// Default ceiling for a single serialized snapshot (64 KiB).
pub const DEFAULT_MAX_OBJECT_BYTES: usize = 64 * 1024;

/// Smallest ceiling a [`Truncator`] accepts; leaves room for the root marker.
pub const MIN_MAX_OBJECT_BYTES: usize = 256;

/// Path reported when the whole document had to be replaced.
pub const ROOT_PATH: &str = "$";

/// Result of running a document through the truncation engine.
#[derive(Debug, Clone, PartialEq)]
pub struct TruncateOutcome {
    /// Serialized document, never larger than the ceiling.
    pub json: Vec<u8>,
    /// Parsed form of `json`.
    pub value: Value,
    /// Whether any field was shortened or elided.
    pub was_truncated: bool,
    /// Dotted/indexed paths of every altered field, in the order they were cut.
    pub truncated_fields: Vec<String>,
}

impl TruncateOutcome {
    fn unchanged(json: Vec<u8>, value: Value) -> Self {
        Self {
            json,
            value,
            was_truncated: false,
            truncated_fields: Vec::new(),
        }
    }
}

/// Deterministic JSON truncation engine with a fixed byte ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Truncator {
    max_bytes: usize,
}

impl Default for Truncator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_OBJECT_BYTES)
    }
}

impl Truncator {
    /// Create a truncator with the given ceiling.
    ///
    /// Ceilings below [`MIN_MAX_OBJECT_BYTES`] are raised to it.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes: max_bytes.max(MIN_MAX_OBJECT_BYTES),
        }
    }

    /// The byte ceiling enforced by this truncator.
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Bound a JSON-encoded document to the ceiling.
    ///
    /// Input already within the ceiling is returned byte-for-byte.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Decode`] if `input` is not valid JSON.
    pub fn truncate(&self, input: &[u8]) -> AuditResult<TruncateOutcome> {
        let value: Value = serde_json::from_slice(input).map_err(|e| AuditError::Decode {
            message: e.to_string(),
        })?;

        if input.len() <= self.max_bytes {
            return Ok(TruncateOutcome::unchanged(input.to_vec(), value));
        }

        self.truncate_value(value)
    }

    /// Bound an already parsed document to the ceiling.
    pub fn truncate_value(&self, mut value: Value) -> AuditResult<TruncateOutcome> {
        let mut size = encoded_len(&value);
        if size <= self.max_bytes {
            let json = serde_json::to_vec(&value)?;
            return Ok(TruncateOutcome::unchanged(json, value));
        }

        let mut fields = Vec::new();
        size = self.shorten_strings(&mut value, size, &mut fields);
        if size > self.max_bytes {
            self.elide_containers(&mut value, size, &mut fields);
        }

        let mut json = serde_json::to_vec(&value)?;
        if json.len() > self.max_bytes {
            value = Value::String(elision_marker(json.len()));
            json = serde_json::to_vec(&value)?;
            fields.push(ROOT_PATH.to_string());
        }

        Ok(TruncateOutcome {
            json,
            value,
            was_truncated: true,
            truncated_fields: fields,
        })
    }

    /// Shorten string leaves, largest first. Returns the new encoded size.
    fn shorten_strings(&self, root: &mut Value, mut size: usize, fields: &mut Vec<String>) -> usize {
        let mut leaves = Vec::new();
        collect_strings(root, &mut Vec::new(), &mut leaves);
        leaves.sort_by(|a, b| (Reverse(a.encoded), &a.path).cmp(&(Reverse(b.encoded), &b.path)));

        for leaf in leaves {
            if size <= self.max_bytes {
                break;
            }
            let Some(Value::String(s)) = lookup_mut(root, &leaf.segments) else {
                continue;
            };

            let target = leaf.encoded.saturating_sub(size - self.max_bytes);
            let shortened = shorten(s, target);
            let new_len = escaped_len(&shortened);
            if new_len >= leaf.encoded {
                continue;
            }

            *s = shortened;
            size = size - leaf.encoded + new_len;
            fields.push(leaf.path);
        }

        size
    }

    /// Elide non-root containers, largest first. Returns the new encoded size.
    fn elide_containers(&self, root: &mut Value, mut size: usize, fields: &mut Vec<String>) -> usize {
        let mut containers = Vec::new();
        collect_containers(root, &mut Vec::new(), &mut containers);
        containers.sort_by(|a, b| (Reverse(a.encoded), &a.path).cmp(&(Reverse(b.encoded), &b.path)));

        let mut elided: Vec<Vec<Segment>> = Vec::new();
        for node in containers {
            if size <= self.max_bytes {
                break;
            }
            if elided.iter().any(|p| node.segments.starts_with(p)) {
                continue;
            }

            let marker = Value::String(elision_marker(node.encoded));
            let new_len = encoded_len(&marker);
            if new_len >= node.encoded {
                continue;
            }
            let Some(slot) = lookup_mut(root, &node.segments) else {
                continue;
            };

            *slot = marker;
            size = size - node.encoded + new_len;
            fields.push(node.path);
            elided.push(node.segments);
        }

        size
    }
}

/// Truncate a JSON document with the default 64 KiB ceiling.
pub fn truncate_object(input: &[u8]) -> AuditResult<TruncateOutcome> {
    Truncator::default().truncate(input)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

#[derive(Debug)]
struct Node {
    segments: Vec<Segment>,
    path: String,
    encoded: usize,
}

fn render_path(segments: &[Segment]) -> String {
    let mut path = String::new();
    for segment in segments {
        match segment {
            Segment::Key(key) => {
                if !path.is_empty() {
                    path.push('.');
                }
                path.push_str(key);
            }
            Segment::Index(i) => {
                path.push('[');
                path.push_str(&i.to_string());
                path.push(']');
            }
        }
    }
    if path.is_empty() {
        path.push_str(ROOT_PATH);
    }
    path
}

fn collect_strings(value: &Value, segments: &mut Vec<Segment>, out: &mut Vec<Node>) {
    match value {
        Value::String(s) => out.push(Node {
            segments: segments.clone(),
            path: render_path(segments),
            encoded: escaped_len(s),
        }),
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                segments.push(Segment::Index(i));
                collect_strings(item, segments, out);
                segments.pop();
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                segments.push(Segment::Key(key.clone()));
                collect_strings(item, segments, out);
                segments.pop();
            }
        }
        _ => {}
    }
}

/// Records every non-root container with its encoded size and returns the
/// encoded size of `value`.
fn collect_containers(value: &Value, segments: &mut Vec<Segment>, out: &mut Vec<Node>) -> usize {
    let encoded = match value {
        Value::Array(items) => {
            let mut total = 2 + items.len().saturating_sub(1);
            for (i, item) in items.iter().enumerate() {
                segments.push(Segment::Index(i));
                total += collect_containers(item, segments, out);
                segments.pop();
            }
            total
        }
        Value::Object(map) => {
            let mut total = 2 + map.len().saturating_sub(1);
            for (key, item) in map {
                segments.push(Segment::Key(key.clone()));
                total += escaped_len(key) + 1 + collect_containers(item, segments, out);
                segments.pop();
            }
            total
        }
        other => return encoded_len(other),
    };

    if !segments.is_empty() {
        out.push(Node {
            segments: segments.clone(),
            path: render_path(segments),
            encoded,
        });
    }
    encoded
}

fn lookup_mut<'a>(root: &'a mut Value, segments: &[Segment]) -> Option<&'a mut Value> {
    segments.iter().try_fold(root, |node, segment| match segment {
        Segment::Key(key) => node.as_object_mut()?.get_mut(key),
        Segment::Index(i) => node.as_array_mut()?.get_mut(*i),
    })
}

/// Shorten `s` so that its encoded form fits `target` bytes where possible.
///
/// Keeps the longest prefix (on a char boundary) that fits next to the
/// marker; the shortest possible result is the bare marker.
fn shorten(s: &str, target: usize) -> String {
    let budget = target.saturating_sub(2 + truncation_marker(s.len()).len());
    let mut used = 0;
    let mut keep = 0;
    for (i, ch) in s.char_indices() {
        let width = escaped_char_len(ch);
        if used + width > budget {
            break;
        }
        used += width;
        keep = i + ch.len_utf8();
    }
    format!("{}{}", &s[..keep], truncation_marker(s.len() - keep))
}

fn truncation_marker(cut: usize) -> String {
    format!("...[truncated {} bytes]", cut)
}

fn elision_marker(size: usize) -> String {
    format!("[elided {} bytes]", size)
}

fn escaped_byte_len(b: u8) -> usize {
    match b {
        b'"' | b'\\' | 0x08 | 0x09 | 0x0a | 0x0c | 0x0d => 2,
        0x00..=0x1f => 6,
        _ => 1,
    }
}

fn escaped_char_len(ch: char) -> usize {
    if ch.is_ascii() {
        escaped_byte_len(ch as u8)
    } else {
        ch.len_utf8()
    }
}

/// Length of `s` as a serialized JSON string, quotes included.
fn escaped_len(s: &str) -> usize {
    2 + s.bytes().map(escaped_byte_len).sum::<usize>()
}

/// Length of `value` as compact serialized JSON.
fn encoded_len(value: &Value) -> usize {
    match value {
        Value::Null => 4,
        Value::Bool(true) => 4,
        Value::Bool(false) => 5,
        Value::Number(n) => n.to_string().len(),
        Value::String(s) => escaped_len(s),
        Value::Array(items) => {
            2 + items.len().saturating_sub(1) + items.iter().map(encoded_len).sum::<usize>()
        }
        Value::Object(map) => {
            2 + map.len().saturating_sub(1)
                + map
                    .iter()
                    .map(|(k, v)| escaped_len(k) + 1 + encoded_len(v))
                    .sum::<usize>()
        }
    }
}
