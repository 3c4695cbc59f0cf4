//! Canonical JSON encoding used for content addressing.
//!
//! Canonical form: UTF-8, object keys sorted, `,`/`:` separators, no
//! insignificant whitespace. Hashing the canonical bytes of a value yields a
//! stable identifier across processes and platforms.
//!
//! `serde_json`'s `Map` is backed by a `BTreeMap` (the `preserve_order`
//! feature is not enabled anywhere in this workspace), so routing a value
//! through [`serde_json::Value`] sorts keys at every nesting level; compact
//! serialization then produces the canonical bytes.

use serde::Serialize;

use crate::error::TypeError;

/// Encode a value as canonical JSON bytes.
pub fn to_canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>, TypeError> {
    let v = serde_json::to_value(value).map_err(|e| TypeError::Serialization(e.to_string()))?;
    serde_json::to_vec(&v).map_err(|e| TypeError::Serialization(e.to_string()))
}

/// Encode a value as a canonical JSON string.
pub fn to_canonical_string<T: Serialize>(value: &T) -> Result<String, TypeError> {
    let bytes = to_canonical_json(value)?;
    String::from_utf8(bytes).map_err(|e| TypeError::Serialization(e.to_string()))
}
