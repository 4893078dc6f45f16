//! Recovery of structured records from untyped storage values.
//!
//! Values in the IDE's key-value tables are not reliably typed. Some are
//! plain JSON, some are JSON wrapped in base64 or hex, some are JSON buried
//! inside otherwise-binary blobs, and some user messages are stored as
//! `text$uuid`. [`decode_value`] runs an ordered list of named strategies and
//! returns the first one that succeeds.

pub mod reasoning;
pub mod text;
pub mod wire;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use serde_json::Value;

use crate::error::ParseError;

pub use reasoning::{ReasoningOutcome, decode_reasoning};
pub use text::{extract_embedded_json, is_readable_text};

/// Which strategy recovered a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStrategy {
    Json,
    Base64Json,
    HexJson,
    EmbeddedJson,
    DollarText,
}

/// A best-effort structured view of one raw value.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A JSON object or array.
    Json(Value),
    /// A `text$uuid` user message.
    PlainText { text: String, id: Option<String> },
}

type StrategyFn = fn(&str) -> Option<Decoded>;

/// The decode chain, tried top to bottom.
pub const STRATEGIES: &[(DecodeStrategy, StrategyFn)] = &[
    (DecodeStrategy::Json, decode_json),
    (DecodeStrategy::Base64Json, decode_base64_json),
    (DecodeStrategy::HexJson, decode_hex_json),
    (DecodeStrategy::EmbeddedJson, decode_embedded_json),
    (DecodeStrategy::DollarText, decode_dollar_text),
];

/// Decode one raw value, returning the record and the strategy that won.
pub fn decode_value(key: &str, raw: &str) -> Result<(Decoded, DecodeStrategy), ParseError> {
    if raw.trim().is_empty() {
        return Err(ParseError {
            key: key.to_string(),
            reason: "empty value".to_string(),
        });
    }
    for &(strategy, run) in STRATEGIES {
        if let Some(decoded) = run(raw) {
            tracing::trace!(key, ?strategy, "decoded record");
            return Ok((decoded, strategy));
        }
    }
    Err(ParseError {
        key: key.to_string(),
        reason: format!("no decode strategy matched ({} bytes)", raw.len()),
    })
}

/// Convenience wrapper for callers that only care about JSON records.
pub fn decode_json_value(key: &str, raw: &str) -> Option<Value> {
    match decode_value(key, raw) {
        Ok((Decoded::Json(v), _)) => Some(v),
        _ => None,
    }
}

fn structured(bytes: &[u8]) -> Option<Value> {
    serde_json::from_slice::<Value>(bytes)
        .ok()
        .filter(|v| v.is_object() || v.is_array())
}

pub fn decode_json(raw: &str) -> Option<Decoded> {
    structured(raw.trim().as_bytes()).map(Decoded::Json)
}

pub fn decode_base64_json(raw: &str) -> Option<Decoded> {
    let trimmed = raw.trim();
    [&STANDARD, &URL_SAFE, &STANDARD_NO_PAD, &URL_SAFE_NO_PAD]
        .into_iter()
        .filter_map(|engine| engine.decode(trimmed).ok())
        .find_map(|bytes| structured(&bytes))
        .map(Decoded::Json)
}

pub fn decode_hex_json(raw: &str) -> Option<Decoded> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = hex::decode(compact).ok()?;
    structured(&bytes).map(Decoded::Json)
}

pub fn decode_embedded_json(raw: &str) -> Option<Decoded> {
    extract_embedded_json(raw.as_bytes())
        .and_then(structured)
        .map(Decoded::Json)
}

pub fn decode_dollar_text(raw: &str) -> Option<Decoded> {
    let cleaned = text::strip_control_chars(raw);
    let idx = cleaned.rfind('$').filter(|&i| i > 0)?;
    let message = cleaned[..idx].trim();
    if message.is_empty() || !is_readable_text(message) {
        return None;
    }
    let id = cleaned[idx + 1..].trim();
    let id = uuid::Uuid::parse_str(id).ok().map(|u| u.to_string());
    Some(Decoded::PlainText {
        text: message.to_string(),
        id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn json_of(raw: &str) -> Value {
        match decode_value("k", raw).unwrap().0 {
            Decoded::Json(v) => v,
            other => panic!("expected JSON, got {other:?}"),
        }
    }

    #[test]
    fn chain_order_is_explicit() {
        let names: Vec<DecodeStrategy> = STRATEGIES.iter().map(|(s, _)| *s).collect();
        assert_eq!(
            names,
            vec![
                DecodeStrategy::Json,
                DecodeStrategy::Base64Json,
                DecodeStrategy::HexJson,
                DecodeStrategy::EmbeddedJson,
                DecodeStrategy::DollarText,
            ]
        );
    }

    #[test]
    fn plain_json_wins_first() {
        let (_, strategy) = decode_value("k", r#"{"text":"hi"}"#).unwrap();
        assert_eq!(strategy, DecodeStrategy::Json);
    }

    #[test]
    fn scalars_are_not_records() {
        assert!(decode_json("42").is_none());
        assert!(decode_json(r#""str""#).is_none());
    }

    #[test]
    fn url_safe_unpadded_base64() {
        let encoded = URL_SAFE_NO_PAD.encode(br#"{"a":"??>>"}"#);
        assert_eq!(json_of(&encoded), json!({"a": "??>>"}));
    }

    #[test]
    fn hex_tolerates_whitespace() {
        let hex = hex::encode(br#"{"a":1}"#);
        let spaced = format!("{}\n  {}", &hex[..6], &hex[6..]);
        let (decoded, strategy) = decode_value("k", &spaced).unwrap();
        assert_eq!(strategy, DecodeStrategy::HexJson);
        assert_eq!(decoded, Decoded::Json(json!({"a": 1})));
    }

    #[test]
    fn embedded_json_in_binary() {
        let raw = "\u{1}\u{2}xx{\"bubbleId\":\"b\",\"text\":\"a } b\"}\u{0}zz";
        let (decoded, strategy) = decode_value("k", raw).unwrap();
        assert_eq!(strategy, DecodeStrategy::EmbeddedJson);
        assert_eq!(decoded, Decoded::Json(json!({"bubbleId": "b", "text": "a } b"})));
    }

    #[test]
    fn dollar_text_with_uuid() {
        let raw = "fix the build\u{7}$0b5a1f2e-8d3c-4c6e-9f7a-1b2c3d4e5f60";
        assert_eq!(
            decode_value("k", raw).unwrap(),
            (
                Decoded::PlainText {
                    text: "fix the build".into(),
                    id: Some("0b5a1f2e-8d3c-4c6e-9f7a-1b2c3d4e5f60".into()),
                },
                DecodeStrategy::DollarText
            )
        );
    }

    #[test]
    fn dollar_text_requires_text_before_dollar() {
        assert!(decode_dollar_text("$0b5a1f2e-8d3c-4c6e-9f7a-1b2c3d4e5f60").is_none());
        assert!(decode_dollar_text("no separator").is_none());
        assert_eq!(
            decode_dollar_text("costs $5"),
            Some(Decoded::PlainText {
                text: "costs".into(),
                id: None
            })
        );
    }

    #[test]
    fn garbage_is_a_soft_error() {
        let err = decode_value("bubbleId:c:b", "\u{1}\u{2}\u{3}").unwrap_err();
        assert_eq!(err.key, "bubbleId:c:b");
        assert!(decode_value("k", "   ").is_err());
    }

    fn json_object() -> impl Strategy<Value = Value> {
        prop::collection::btree_map(
            "[a-zA-Z_]{1,8}",
            prop_oneof![
                any::<i64>().prop_map(Value::from),
                any::<bool>().prop_map(Value::from),
                "[ -~]{0,24}".prop_map(Value::from),
            ],
            1..6,
        )
        .prop_map(|m| Value::Object(m.into_iter().collect()))
    }

    proptest! {
        #[test]
        fn json_base64_and_hex_agree(obj in json_object()) {
            let text = serde_json::to_string(&obj).unwrap();
            let direct = json_of(&text);
            prop_assert_eq!(&direct, &obj);
            prop_assert_eq!(&json_of(&STANDARD.encode(&text)), &obj);
            prop_assert_eq!(&json_of(&hex::encode(&text)), &obj);
        }

        #[test]
        fn embedded_object_is_recovered_exactly(
            obj in json_object(),
            prefix in "[^{}\"]{0,16}",
            suffix in "[^{}\"]{0,16}",
        ) {
            let text = serde_json::to_string(&obj).unwrap();
            let raw = format!("{prefix}{text}{suffix}");
            prop_assert_eq!(extract_embedded_json(raw.as_bytes()), Some(text.as_bytes()));
        }
    }
}
