// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Binary data inside task payloads.
//!
//! Envelopes carry JSON, so raw bytes travel as a tagged object `{"$buffer": "<base64>"}`. The
//! pool counts these before dispatch for logging and estimates result sizes for the
//! `outputSize` field of result messages.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::io;

pub const BUFFER_TAG: &str = "$buffer";

/// Owned bytes that serialize as a tagged base64 object.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Buffer(pub Vec<u8>);

impl Buffer {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Buffer(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn into_value(self) -> Value {
        let mut map = Map::new();
        map.insert(BUFFER_TAG.to_string(), Value::String(STANDARD.encode(&self.0)));
        Value::Object(map)
    }

    /// Decode a tagged buffer value. `None` when the value is not a well-formed buffer.
    pub fn from_value(value: &Value) -> Option<Self> {
        let encoded = buffer_tag(value)?;
        STANDARD.decode(encoded).ok().map(Buffer)
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(bytes: Vec<u8>) -> Self {
        Buffer(bytes)
    }
}

impl Serialize for Buffer {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(BUFFER_TAG, &STANDARD.encode(&self.0))?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for Buffer {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(deny_unknown_fields)]
        struct Tagged {
            #[serde(rename = "$buffer")]
            data: String,
        }

        let tagged = Tagged::deserialize(deserializer)?;
        STANDARD.decode(tagged.data).map(Buffer).map_err(D::Error::custom)
    }
}

fn buffer_tag(value: &Value) -> Option<&str> {
    match value {
        Value::Object(map) if map.len() == 1 => map.get(BUFFER_TAG)?.as_str(),
        _ => None,
    }
}

/// Buffers found in a payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferSummary {
    pub count: usize,
    /// Decoded size in bytes.
    pub bytes: usize,
}

pub fn collect_buffers(value: &Value) -> BufferSummary {
    let mut summary = BufferSummary::default();
    visit(value, &mut summary);
    summary
}

fn visit(value: &Value, summary: &mut BufferSummary) {
    if let Some(encoded) = buffer_tag(value) {
        summary.count += 1;
        summary.bytes += decoded_len(encoded);
        return;
    }
    match value {
        Value::Array(items) => items.iter().for_each(|item| visit(item, summary)),
        Value::Object(map) => map.values().for_each(|item| visit(item, summary)),
        _ => {}
    }
}

fn decoded_len(encoded: &str) -> usize {
    let padding = encoded.bytes().rev().take_while(|b| *b == b'=').count();
    (encoded.len() / 4 * 3).saturating_sub(padding)
}

struct ByteCounter(usize);

impl io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Serialized size of a value in bytes, without allocating the serialized form.
pub fn estimate_size(value: &Value) -> usize {
    let mut counter = ByteCounter(0);
    match serde_json::to_writer(&mut counter, value) {
        Ok(()) => counter.0,
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_buffer_value_shape() {
        let value = Buffer::new(b"hello".to_vec()).into_value();
        assert_eq!(value, json!({ "$buffer": "aGVsbG8=" }));
        assert_eq!(Buffer::from_value(&value), Some(Buffer::new(b"hello".to_vec())));
    }

    #[test]
    fn test_buffer_serde_matches_value_form() {
        let buffer = Buffer::new(vec![0u8, 1, 2, 255]);
        let via_serde = serde_json::to_value(&buffer).unwrap();
        assert_eq!(via_serde, buffer.clone().into_value());

        let back: Buffer = serde_json::from_value(via_serde).unwrap();
        assert_eq!(back, buffer);
    }

    #[test]
    fn test_rejects_non_buffers() {
        assert!(Buffer::from_value(&json!({ "$buffer": "!!!" })).is_none());
        assert!(Buffer::from_value(&json!({ "$buffer": "aGk=", "extra": 1 })).is_none());
        assert!(serde_json::from_value::<Buffer>(json!({ "data": "aGk=" })).is_err());
    }

    #[test]
    fn test_collect_buffers_nested() {
        let payload = json!({
            "image": Buffer::new(vec![7u8; 10]).into_value(),
            "frames": [Buffer::new(vec![1u8, 2]).into_value(), 3, "text"],
            "meta": { "n": 1 }
        });

        let summary = collect_buffers(&payload);
        assert_eq!(summary.count, 2);
        assert_eq!(summary.bytes, 12);
        assert_eq!(collect_buffers(&json!([1, 2, 3])), BufferSummary::default());
    }

    #[test]
    fn test_estimate_size_matches_serialized_len() {
        let value = json!({ "a": [1, 2, 3], "b": "text" });
        assert_eq!(estimate_size(&value), serde_json::to_vec(&value).unwrap().len());
        assert_eq!(estimate_size(&Value::Null), 4);
    }
}
