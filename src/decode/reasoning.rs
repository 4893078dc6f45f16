//! Decoding of opaque "redacted reasoning" payloads.
//!
//! The payloads are base64url text wrapping either a protobuf-like message,
//! embedded JSON, or genuinely encrypted bytes. Only the first two can be
//! recovered; the last is reported with enough diagnostics to tell them apart.

use base64::Engine;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};

use super::text::{extract_embedded_json, readable_utf8, shannon_entropy};
use super::wire::{self, FieldMap, WireValue};

/// Entropy (bits/byte) at or above which a payload is assumed encrypted.
pub const ENCRYPTED_ENTROPY: f64 = 6.0;

/// Recovered strings shorter than this are treated as wire noise.
const MIN_RECOVERED_CHARS: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub enum ReasoningOutcome {
    /// Readable content was recovered.
    Text(String),
    /// High-entropy bytes; cannot be decoded without the key.
    Encrypted { bytes: usize, entropy: f64 },
    /// Low-entropy bytes that still yielded nothing readable.
    Encoded { bytes: usize, entropy: f64 },
    /// The payload is not base64url at all.
    NotBase64,
}

impl ReasoningOutcome {
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text(t) => Some(t),
            _ => None,
        }
    }

    /// Short human-readable description used as a block label.
    pub fn describe(&self) -> String {
        match self {
            Self::Text(_) => "decoded".to_string(),
            Self::Encrypted { bytes, entropy } => format!(
                "encrypted, cannot decode without key ({bytes} bytes, entropy {entropy:.2})"
            ),
            Self::Encoded { bytes, entropy } => {
                format!("encoded, could not decode ({bytes} bytes, entropy {entropy:.2})")
            }
            Self::NotBase64 => "not base64, shown verbatim".to_string(),
        }
    }
}

/// Base64url-decode `payload`, padding it first if needed.
pub fn decode_base64url(payload: &str) -> Option<Vec<u8>> {
    let trimmed: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    if trimmed.is_empty() {
        return None;
    }
    let unpadded = trimmed.trim_end_matches('=');
    let padded = match unpadded.len() % 4 {
        0 => unpadded.to_string(),
        2 => format!("{unpadded}=="),
        3 => format!("{unpadded}="),
        _ => return None,
    };
    URL_SAFE
        .decode(&padded)
        .or_else(|_| URL_SAFE_NO_PAD.decode(unpadded))
        .ok()
}

/// Run the reasoning sub-chain on one payload.
pub fn decode_reasoning(payload: &str) -> ReasoningOutcome {
    let Some(bytes) = decode_base64url(payload) else {
        return ReasoningOutcome::NotBase64;
    };

    match wire::walk(&bytes) {
        Ok(fields) => {
            let mut parts = Vec::new();
            collect_text(&fields, &mut parts);
            if !parts.is_empty() {
                return ReasoningOutcome::Text(parts.join("\n\n"));
            }
        }
        Err(e) => tracing::trace!(error = %e, "reasoning payload is not wire data"),
    }

    if let Some(text) = readable_utf8(&bytes).filter(|t| t.trim().len() >= MIN_RECOVERED_CHARS) {
        return ReasoningOutcome::Text(text.trim().to_string());
    }
    if let Some(json) = extract_embedded_json(&bytes) {
        return ReasoningOutcome::Text(String::from_utf8_lossy(json).into_owned());
    }

    let entropy = shannon_entropy(&bytes);
    if entropy >= ENCRYPTED_ENTROPY {
        ReasoningOutcome::Encrypted {
            bytes: bytes.len(),
            entropy,
        }
    } else {
        ReasoningOutcome::Encoded {
            bytes: bytes.len(),
            entropy,
        }
    }
}

fn collect_text(fields: &FieldMap, out: &mut Vec<String>) {
    for value in fields.values().flatten() {
        match value {
            WireValue::Text(t) if t.trim().chars().count() >= MIN_RECOVERED_CHARS => {
                out.push(t.trim().to_string());
            }
            WireValue::Message(nested) => collect_text(nested, out),
            WireValue::Bytes(raw) => {
                if let Some(json) = extract_embedded_json(raw) {
                    out.push(String::from_utf8_lossy(json).into_owned());
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    fn proto_text(field: u8, text: &str) -> Vec<u8> {
        let mut out = vec![(field << 3) | 2, text.len() as u8];
        out.extend_from_slice(text.as_bytes());
        out
    }

    #[test]
    fn decodes_wire_wrapped_text() {
        let mut bytes = vec![0x08, 0x01];
        bytes.extend(proto_text(2, "The user wants a refactor."));
        let payload = URL_SAFE_NO_PAD.encode(&bytes);

        assert_eq!(
            decode_reasoning(&payload),
            ReasoningOutcome::Text("The user wants a refactor.".into())
        );
    }

    #[test]
    fn decodes_text_nested_one_level() {
        // 80 characters, so the inner length byte is a printable 'P'.
        let text: String = "The user wants the parser refactored into smaller passes. "
            .repeat(2)
            .chars()
            .take(0x50)
            .collect();
        let inner = proto_text(1, &text);
        let mut bytes = vec![0x0a, inner.len() as u8];
        bytes.extend(inner);

        assert_eq!(
            decode_reasoning(&URL_SAFE_NO_PAD.encode(&bytes)),
            ReasoningOutcome::Text(text.trim().to_string())
        );
    }

    #[test]
    fn pads_unpadded_payloads() {
        assert_eq!(decode_base64url("aGk").as_deref(), Some(&b"hi"[..]));
        assert_eq!(decode_base64url("aGk=").as_deref(), Some(&b"hi"[..]));
        assert!(decode_base64url("a").is_none());
        assert!(decode_base64url("").is_none());
    }

    #[test]
    fn high_entropy_is_reported_as_encrypted() {
        // Field 1 wire type 1 with a truncated body forces the walk to fail.
        let mut bytes: Vec<u8> = (0..=255u8).collect();
        bytes.extend((0..=255u8).rev());
        bytes[0] = 0x09;
        let outcome = decode_reasoning(&URL_SAFE_NO_PAD.encode(&bytes));
        match outcome {
            ReasoningOutcome::Encrypted { bytes: n, entropy } => {
                assert_eq!(n, 512);
                assert!(entropy >= ENCRYPTED_ENTROPY);
            }
            other => panic!("expected encrypted, got {other:?}"),
        }
    }

    #[test]
    fn low_entropy_is_reported_as_encoded() {
        let bytes = [0x0f, 0x00, 0x0f, 0x00, 0x0f, 0x00, 0x0f, 0x00];
        let outcome = decode_reasoning(&URL_SAFE_NO_PAD.encode(bytes));
        assert!(matches!(outcome, ReasoningOutcome::Encoded { bytes: 8, .. }));
        assert!(outcome.describe().starts_with("encoded, could not decode"));
    }

    #[test]
    fn non_base64_is_flagged() {
        assert_eq!(decode_reasoning("not base64!"), ReasoningOutcome::NotBase64);
    }
}
