//! MessagePack record decoding and encoding.
//!
//! The host hands each output invocation one buffer holding a concatenation of
//! MessagePack entries. Two entry shapes are understood:
//!
//! ```text
//! legacy:  [timestamp, {fields}]
//! v2:      [[timestamp, {metadata}], {fields}]
//! ```
//!
//! Timestamps are either the EventTime extension (type 0, eight bytes holding
//! big-endian seconds and nanoseconds), integer seconds, float seconds, or nil.
//! A nil timestamp is replaced by the decode time.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use rmpv::Value as Msg;

use crate::error::{Error, Result};
use crate::record::{Record, Value};

/// MessagePack extension type used for EventTime timestamps.
pub const EVENT_TIME_EXT: i8 = 0;

/// A malformed entry in a host buffer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("decode error at entry {index} (byte offset {offset}): {reason}")]
pub struct DecodeError {
    /// Zero-based index of the failing entry.
    pub index: usize,
    /// Byte offset where the failing entry starts.
    pub offset: usize,
    /// What was wrong with it.
    pub reason: String,
}

/// Lazy decoder over one host buffer.
///
/// Yields records in buffer order. After the first error, or once the buffer
/// is exhausted, it yields nothing more.
#[derive(Debug)]
pub struct Decoder<'a> {
    tag: Arc<str>,
    cursor: Cursor<&'a [u8]>,
    index: usize,
    done: bool,
}

impl<'a> Decoder<'a> {
    /// Create a decoder for `buf`; every record gets `tag`.
    pub fn new(tag: impl Into<Arc<str>>, buf: &'a [u8]) -> Self {
        Self {
            tag: tag.into(),
            cursor: Cursor::new(buf),
            index: 0,
            done: false,
        }
    }

    /// Byte offset of the next entry.
    pub fn offset(&self) -> usize {
        self.cursor.position() as usize
    }

    /// Number of entries consumed so far, including a failed one.
    pub fn entries_read(&self) -> usize {
        self.index
    }

    fn fail(&mut self, offset: usize, reason: impl Into<String>) -> DecodeError {
        self.done = true;
        DecodeError {
            index: self.index,
            offset,
            reason: reason.into(),
        }
    }
}

impl Iterator for Decoder<'_> {
    type Item = std::result::Result<Record, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let start = self.offset();
        if start >= self.cursor.get_ref().len() {
            self.done = true;
            return None;
        }

        let entry = match rmpv::decode::read_value(&mut self.cursor) {
            Ok(entry) => entry,
            Err(e) => return Some(Err(self.fail(start, e.to_string()))),
        };

        let result = match decode_entry(&self.tag, entry) {
            Ok(record) => Ok(record),
            Err(reason) => Err(self.fail(start, reason)),
        };
        self.index += 1;
        Some(result)
    }
}

impl std::iter::FusedIterator for Decoder<'_> {}

/// Every record decoded from one buffer, plus the error that stopped decoding.
#[derive(Debug, Clone, Default)]
pub struct DecodedBatch {
    /// The valid prefix of the buffer.
    pub records: Vec<Record>,
    /// Error for the first malformed entry, if any.
    pub error: Option<DecodeError>,
}

/// Decode a whole buffer eagerly.
pub fn decode_batch(tag: &str, buf: &[u8]) -> DecodedBatch {
    let mut batch = DecodedBatch::default();
    for item in Decoder::new(tag, buf) {
        match item {
            Ok(record) => batch.records.push(record),
            Err(e) => batch.error = Some(e),
        }
    }
    batch
}

fn decode_entry(tag: &Arc<str>, entry: Msg) -> std::result::Result<Record, String> {
    let mut parts = match entry {
        Msg::Array(parts) if parts.len() == 2 => parts,
        Msg::Array(parts) => {
            return Err(format!("entry has {} elements, expected 2", parts.len()));
        }
        other => return Err(format!("entry is not an array: {}", kind_of(&other))),
    };
    let body = parts.pop().unwrap_or(Msg::Nil);
    let header = parts.pop().unwrap_or(Msg::Nil);

    let (time, metadata) = match header {
        Msg::Array(mut header) if header.len() == 2 => {
            let metadata = header.pop().unwrap_or(Msg::Nil);
            let time = decode_time(header.pop().unwrap_or(Msg::Nil))?;
            let metadata = match metadata {
                Msg::Nil => BTreeMap::new(),
                Msg::Map(pairs) => decode_map(pairs)?,
                other => return Err(format!("metadata is not a map: {}", kind_of(&other))),
            };
            (time, metadata)
        }
        Msg::Array(header) => {
            return Err(format!("header has {} elements, expected 2", header.len()));
        }
        ts => (decode_time(ts)?, BTreeMap::new()),
    };

    let fields = match body {
        Msg::Map(pairs) => decode_map(pairs)?,
        other => return Err(format!("record body is not a map: {}", kind_of(&other))),
    };

    Ok(Record::new(tag.clone(), time, fields).with_metadata(metadata))
}

fn decode_time(ts: Msg) -> std::result::Result<DateTime<Utc>, String> {
    match ts {
        Msg::Nil => Ok(Utc::now()),
        Msg::Ext(EVENT_TIME_EXT, data) => {
            let bytes: [u8; 8] = data
                .as_slice()
                .try_into()
                .map_err(|_| format!("event time has {} bytes, expected 8", data.len()))?;
            let secs = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            let nanos = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
            Utc.timestamp_opt(i64::from(secs), nanos)
                .single()
                .ok_or_else(|| format!("event time out of range: {}.{}", secs, nanos))
        }
        Msg::Ext(ty, _) => Err(format!("unsupported timestamp extension type {}", ty)),
        Msg::Integer(i) => {
            let secs = i
                .as_i64()
                .ok_or_else(|| format!("timestamp out of range: {}", i))?;
            Utc.timestamp_opt(secs, 0)
                .single()
                .ok_or_else(|| format!("timestamp out of range: {}", secs))
        }
        Msg::F32(f) => float_time(f64::from(f)),
        Msg::F64(f) => float_time(f),
        other => Err(format!("invalid timestamp: {}", kind_of(&other))),
    }
}

fn float_time(f: f64) -> std::result::Result<DateTime<Utc>, String> {
    if !f.is_finite() {
        return Err(format!("invalid timestamp: {}", f));
    }
    let secs = f.floor();
    let nanos = (((f - secs) * 1e9).round() as u32).min(999_999_999);
    Utc.timestamp_opt(secs as i64, nanos)
        .single()
        .ok_or_else(|| format!("timestamp out of range: {}", f))
}

fn decode_map(pairs: Vec<(Msg, Msg)>) -> std::result::Result<BTreeMap<String, Value>, String> {
    let mut map = BTreeMap::new();
    for (k, v) in pairs {
        map.insert(decode_key(k)?, decode_value(v)?);
    }
    Ok(map)
}

fn decode_key(key: Msg) -> std::result::Result<String, String> {
    match key {
        Msg::String(s) => s
            .into_str()
            .ok_or_else(|| "map key is not valid utf-8".to_string()),
        Msg::Binary(b) => Ok(String::from_utf8_lossy(&b).into_owned()),
        Msg::Integer(i) => Ok(i.to_string()),
        Msg::Boolean(b) => Ok(b.to_string()),
        Msg::F32(f) => Ok(f.to_string()),
        Msg::F64(f) => Ok(f.to_string()),
        other => Err(format!("unsupported map key: {}", kind_of(&other))),
    }
}

fn decode_value(value: Msg) -> std::result::Result<Value, String> {
    Ok(match value {
        Msg::Nil => Value::Nil,
        Msg::Boolean(b) => Value::Bool(b),
        Msg::Integer(i) => match (i.as_i64(), i.as_u64()) {
            (Some(v), _) => Value::Int(v),
            (None, Some(u)) => Value::UInt(u),
            _ => return Err(format!("integer out of range: {}", i)),
        },
        Msg::F32(f) => Value::Float(f64::from(f)),
        Msg::F64(f) => Value::Float(f),
        // Invalid UTF-8 is kept as bytes rather than rejected.
        Msg::String(s) => {
            if s.is_str() {
                Value::String(s.into_str().unwrap_or_default())
            } else {
                Value::Bytes(s.into_bytes())
            }
        }
        Msg::Binary(b) => Value::Bytes(b),
        Msg::Array(items) => Value::Array(
            items
                .into_iter()
                .map(decode_value)
                .collect::<std::result::Result<_, _>>()?,
        ),
        Msg::Map(pairs) => Value::Map(decode_map(pairs)?),
        Msg::Ext(_, data) => Value::Bytes(data),
    })
}

fn kind_of(value: &Msg) -> &'static str {
    match value {
        Msg::Nil => "nil",
        Msg::Boolean(_) => "bool",
        Msg::Integer(_) => "integer",
        Msg::F32(_) | Msg::F64(_) => "float",
        Msg::String(_) => "string",
        Msg::Binary(_) => "binary",
        Msg::Array(_) => "array",
        Msg::Map(_) => "map",
        Msg::Ext(_, _) => "ext",
    }
}

/// Encodes records into a host buffer for input plugins.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
    count: usize,
}

impl Encoder {
    /// Create an empty encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one record.
    ///
    /// Records with metadata are written in the v2 shape, others in the
    /// legacy shape.
    pub fn encode(&mut self, record: &Record) -> Result<()> {
        let time = encode_time(record.time());
        let header = if record.metadata().is_empty() {
            time
        } else {
            Msg::Array(vec![time, encode_map(record.metadata())])
        };
        let entry = Msg::Array(vec![header, encode_map(record.fields())]);

        rmpv::encode::write_value(&mut self.buf, &entry)
            .map_err(|e| Error::Encode(e.to_string()))?;
        self.count += 1;
        Ok(())
    }

    /// Number of records encoded.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Check if nothing was encoded.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Take the encoded buffer.
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Encode a single record into `buf`.
pub fn encode_record(record: &Record, buf: &mut Vec<u8>) -> Result<()> {
    let mut encoder = Encoder {
        buf: std::mem::take(buf),
        count: 0,
    };
    let result = encoder.encode(record);
    *buf = encoder.finish();
    result
}

fn encode_time(time: DateTime<Utc>) -> Msg {
    match u32::try_from(time.timestamp()) {
        Ok(secs) => {
            let mut data = Vec::with_capacity(8);
            data.extend_from_slice(&secs.to_be_bytes());
            data.extend_from_slice(&time.timestamp_subsec_nanos().to_be_bytes());
            Msg::Ext(EVENT_TIME_EXT, data)
        }
        // EventTime cannot represent it; fall back to integer seconds.
        Err(_) => Msg::from(time.timestamp()),
    }
}

fn encode_map(map: &BTreeMap<String, Value>) -> Msg {
    Msg::Map(
        map.iter()
            .map(|(k, v)| (Msg::from(k.as_str()), encode_value(v)))
            .collect(),
    )
}

fn encode_value(value: &Value) -> Msg {
    match value {
        Value::Nil => Msg::Nil,
        Value::Bool(b) => Msg::Boolean(*b),
        Value::Int(i) => Msg::from(*i),
        Value::UInt(u) => Msg::from(*u),
        Value::Float(f) => Msg::F64(*f),
        Value::String(s) => Msg::from(s.as_str()),
        Value::Bytes(b) => Msg::Binary(b.clone()),
        Value::Array(items) => Msg::Array(items.iter().map(encode_value).collect()),
        Value::Map(map) => encode_map(map),
    }
}
