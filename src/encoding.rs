//! Convenience encoders the core exposes but does not itself require:
//! JSON bodies and `application/x-www-form-urlencoded` form bodies.

use serde::Serialize;

use crate::error::{Error, Result};

pub fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| Error::format_error(format!("json encoding failed: {e}")))
}

const UNRESERVED: fn(u8) -> bool = |b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~');

/// Percent-encodes every byte outside the unreserved set `A-Za-z0-9-_.~`.
pub fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for b in input.as_bytes() {
        if UNRESERVED(*b) {
            out.push(*b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

pub fn percent_decode(input: &str) -> Result<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes
                    .get(i + 1..i + 3)
                    .ok_or_else(|| Error::format_error("truncated percent-encoding"))?;
                let hex_str = std::str::from_utf8(hex)
                    .map_err(|_| Error::format_error("invalid percent-encoding"))?;
                let byte = u8::from_str_radix(hex_str, 16)
                    .map_err(|_| Error::format_error("invalid percent-encoding"))?;
                out.push(byte);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|_| Error::format_error("percent-decoded bytes are not UTF-8"))
}

/// Encodes key/value pairs as `k1=v1&k2=v2`, percent-encoding both sides.
pub fn encode_form(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_encode_leaves_unreserved_untouched() {
        assert_eq!(percent_encode("abcXYZ019-_.~"), "abcXYZ019-_.~");
    }

    #[test]
    fn percent_encode_escapes_everything_else() {
        assert_eq!(percent_encode("a b/c"), "a%20b%2Fc");
    }

    #[test]
    fn percent_decode_round_trips() {
        let original = "hello world/ünïcode";
        let encoded = percent_encode(original);
        assert_eq!(percent_decode(&encoded).unwrap(), original);
    }

    #[test]
    fn form_encodes_ampersand_and_equals_separators() {
        assert_eq!(encode_form(&[("a", "1"), ("b c", "2&3")]), "a=1&b%20c=2%263");
    }
}
