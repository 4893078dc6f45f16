//! Byte-level helpers shared by the decode strategies.

/// Share of printable characters a string of five or more characters needs
/// to count as readable.
const READABLE_RATIO: f64 = 0.70;

/// Below this many characters every character must be printable.
const SHORT_TEXT_CHARS: usize = 5;

fn is_printable(c: char) -> bool {
    c.is_whitespace() || !c.is_control()
}

/// Whether `text` looks like human-readable text rather than binary noise.
pub fn is_readable_text(text: &str) -> bool {
    let total = text.chars().count();
    if total == 0 {
        return false;
    }
    let printable = text.chars().filter(|&c| is_printable(c)).count();
    if total < SHORT_TEXT_CHARS {
        printable == total
    } else {
        printable as f64 / total as f64 >= READABLE_RATIO
    }
}

/// Byte-slice flavour of [`is_readable_text`]; invalid UTF-8 is never readable.
pub fn readable_utf8(bytes: &[u8]) -> Option<&str> {
    let text = std::str::from_utf8(bytes).ok()?;
    is_readable_text(text).then_some(text)
}

/// Shannon entropy in bits per byte.
pub fn shannon_entropy(bytes: &[u8]) -> f64 {
    if bytes.is_empty() {
        return 0.0;
    }
    let mut counts = [0usize; 256];
    for &b in bytes {
        counts[b as usize] += 1;
    }
    let len = bytes.len() as f64;
    counts
        .iter()
        .filter(|&&n| n > 0)
        .map(|&n| {
            let p = n as f64 / len;
            -p * p.log2()
        })
        .sum()
}

/// End index (exclusive) of the balanced `{...}` object starting at `start`.
///
/// Braces inside string literals are ignored, and backslash escapes inside
/// strings are honored so `"\""` does not end the literal.
fn balanced_object_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(start + offset + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// First balanced JSON object embedded anywhere in `bytes`.
///
/// Candidates that balance but fail to parse are skipped and the scan resumes
/// at the next `{`.
pub fn extract_embedded_json(bytes: &[u8]) -> Option<&[u8]> {
    let mut from = 0;
    while let Some(rel) = bytes[from..].iter().position(|&b| b == b'{') {
        let start = from + rel;
        if let Some(end) = balanced_object_end(bytes, start) {
            let candidate = &bytes[start..end];
            if serde_json::from_slice::<serde_json::Value>(candidate).is_ok() {
                return Some(candidate);
            }
        }
        from = start + 1;
    }
    None
}

/// Drop control characters except newline, tab and carriage return.
pub fn strip_control_chars(text: &str) -> String {
    text.chars()
        .filter(|&c| matches!(c, '\n' | '\t' | '\r') || !c.is_control())
        .collect()
}
