//! Schema-less walker for protobuf-style wire data.
//!
//! Field numbers and wire types are recovered without any message schema.
//! Length-delimited payloads are interpreted opportunistically as text, as a
//! nested message, or left as raw bytes.

use std::collections::BTreeMap;

use super::text::readable_utf8;

/// Upper bound on fields collected from one payload, nested fields included.
pub const MAX_FIELDS: usize = 100;

const MAX_DEPTH: usize = 16;

const WIRE_VARINT: u8 = 0;
const WIRE_FIXED64: u8 = 1;
const WIRE_LEN: u8 = 2;
const WIRE_FIXED32: u8 = 5;

#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    Varint(u64),
    Fixed64(u64),
    Fixed32(u32),
    Text(String),
    Message(FieldMap),
    Bytes(Vec<u8>),
}

/// Field number to every value seen for it, in wire order.
pub type FieldMap = BTreeMap<u32, Vec<WireValue>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("truncated {0} at offset {1}")]
    Truncated(&'static str, usize),
    #[error("unsupported wire type {0} at offset {1}")]
    UnsupportedWireType(u8, usize),
    #[error("field number 0 at offset {0}")]
    ZeroField(usize),
    #[error("varint overflow at offset {0}")]
    VarintOverflow(usize),
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn varint(&mut self) -> Result<u64, WireError> {
        let start = self.pos;
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let Some(&b) = self.buf.get(self.pos) else {
                return Err(WireError::Truncated("varint", start));
            };
            self.pos += 1;
            value |= u64::from(b & 0x7f) << shift;
            if b & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(WireError::VarintOverflow(start))
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], WireError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&e| e <= self.buf.len())
            .ok_or(WireError::Truncated(what, self.pos))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }
}

/// Walk `bytes` as a sequence of tagged fields.
///
/// Stops quietly once [`MAX_FIELDS`] fields have been collected; malformed
/// input yields an error instead of a partial map.
pub fn walk(bytes: &[u8]) -> Result<FieldMap, WireError> {
    let mut budget = MAX_FIELDS;
    walk_inner(bytes, &mut budget, 0).map(|(fields, _)| fields)
}

/// Walk one level. The flag is false when the budget ran out before the end.
fn walk_inner(
    bytes: &[u8],
    budget: &mut usize,
    depth: usize,
) -> Result<(FieldMap, bool), WireError> {
    let mut cur = Cursor::new(bytes);
    let mut fields = FieldMap::new();

    while !cur.at_end() {
        if *budget == 0 {
            tracing::debug!(offset = cur.pos, "wire walk hit field budget");
            break;
        }
        let tag_offset = cur.pos;
        let tag = cur.varint()?;
        let field = u32::try_from(tag >> 3).map_err(|_| WireError::VarintOverflow(tag_offset))?;
        let wire_type = (tag & 0x7) as u8;
        if field == 0 {
            return Err(WireError::ZeroField(tag_offset));
        }

        let value = match wire_type {
            WIRE_VARINT => WireValue::Varint(cur.varint()?),
            WIRE_FIXED64 => {
                let raw = cur.take(8, "fixed64")?;
                WireValue::Fixed64(u64::from_le_bytes(raw.try_into().map_err(|_| {
                    WireError::Truncated("fixed64", tag_offset)
                })?))
            }
            WIRE_FIXED32 => {
                let raw = cur.take(4, "fixed32")?;
                WireValue::Fixed32(u32::from_le_bytes(raw.try_into().map_err(|_| {
                    WireError::Truncated("fixed32", tag_offset)
                })?))
            }
            WIRE_LEN => {
                let len = usize::try_from(cur.varint()?)
                    .map_err(|_| WireError::Truncated("length", tag_offset))?;
                let payload = cur.take(len, "length-delimited")?;
                *budget -= 1;
                fields
                    .entry(field)
                    .or_default()
                    .push(classify_payload(payload, budget, depth));
                continue;
            }
            other => return Err(WireError::UnsupportedWireType(other, tag_offset)),
        };
        *budget -= 1;
        fields.entry(field).or_default().push(value);
    }

    let complete = cur.at_end();
    Ok((fields, complete))
}

/// A complete nested message carrying text beats a text reading of the same
/// bytes, whose tag and length bytes may happen to be printable.
fn classify_payload(payload: &[u8], budget: &mut usize, depth: usize) -> WireValue {
    let mut trial = *budget;
    let nested = if depth < MAX_DEPTH && !payload.is_empty() {
        walk_inner(payload, &mut trial, depth + 1).ok()
    } else {
        None
    };

    let structured = nested
        .as_ref()
        .is_some_and(|(fields, complete)| *complete && carries_content(fields));
    if !structured && let Some(text) = readable_utf8(payload) {
        return WireValue::Text(text.to_string());
    }
    match nested {
        Some((fields, _)) if !fields.is_empty() => {
            *budget = trial;
            WireValue::Message(fields)
        }
        _ => WireValue::Bytes(payload.to_vec()),
    }
}

fn carries_content(fields: &FieldMap) -> bool {
    fields
        .values()
        .flatten()
        .any(|v| matches!(v, WireValue::Text(_) | WireValue::Message(_)))
}
