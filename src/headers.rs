//! Case-insensitive, order-preserving, multi-valued header store.

use crate::error::{Error, Result};
use std::fmt::Write as _;

#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces all existing values for `name` with a single value.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.add(name, value);
    }

    /// Appends a value for `name`, keeping any existing values.
    pub fn add(&mut self, name: &str, value: impl Into<String>) {
        self.entries.push((camel_case(name), value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    /// All values for `name`, in insertion order.
    pub fn get(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// The last value for `name`, if any (a repeated header is resolved by
    /// taking the value set most recently).
    pub fn single(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn matches(&self, name: &str, value: &str) -> bool {
        self.get(name).iter().any(|v| v.eq_ignore_ascii_case(value))
    }

    pub fn starts_with(&self, name: &str, prefix: &str) -> bool {
        self.single(name)
            .map(|v| v.len() >= prefix.len() && v[..prefix.len()].eq_ignore_ascii_case(prefix))
            .unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn copy(&self) -> Headers {
        self.clone()
    }

    /// Parses header lines already split off a start line. Rejects
    /// leading-whitespace continuation (obs-fold, RFC 7230 §3.2.4).
    pub fn parse_lines(lines: &[httparse::Header<'_>]) -> Result<Headers> {
        let mut headers = Headers::new();
        for h in lines {
            if h.name.is_empty() {
                return Err(Error::FoldedHeader);
            }
            let value = std::str::from_utf8(h.value)
                .map_err(|_| Error::format_error("header value is not valid UTF-8"))?;
            headers.add(h.name, value.trim());
        }
        Ok(headers)
    }

    pub fn write_to(&self, out: &mut String) {
        for (k, v) in &self.entries {
            let _ = write!(out, "{k}: {v}\r\n");
        }
    }
}

/// Normalizes a header name to Camel-Case: uppercase the first letter of
/// each run of ASCII letters, lowercase the rest, leaving separators
/// (`-`, digits, ...) untouched. `content-type` -> `Content-Type`.
pub fn camel_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut start_of_run = true;
    for c in name.chars() {
        if c.is_ascii_alphabetic() {
            if start_of_run {
                out.extend(c.to_uppercase());
            } else {
                out.extend(c.to_lowercase());
            }
            start_of_run = false;
        } else {
            out.push(c);
            start_of_run = true;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camel_case_normalizes_common_names() {
        assert_eq!(camel_case("content-type"), "Content-Type");
        assert_eq!(camel_case("CONTENT-LENGTH"), "Content-Length");
        assert_eq!(camel_case("x-my-HEADER"), "X-My-Header");
        assert_eq!(camel_case("etag"), "Etag");
    }

    #[test]
    fn set_replaces_all_prior_values() {
        let mut h = Headers::new();
        h.add("X-Thing", "a");
        h.add("X-Thing", "b");
        h.set("x-thing", "c");
        assert_eq!(h.get("X-Thing"), vec!["c"]);
    }

    #[test]
    fn add_is_case_insensitive_and_order_preserving() {
        let mut h = Headers::new();
        h.add("Set-Cookie", "a=1");
        h.add("set-cookie", "b=2");
        assert_eq!(h.get("SET-COOKIE"), vec!["a=1", "b=2"]);
    }

    #[test]
    fn single_returns_the_last_value_when_a_name_repeats() {
        let mut h = Headers::new();
        h.add("X-Thing", "a");
        h.add("X-Thing", "b");
        assert_eq!(h.single("x-thing"), Some("b"));
    }

    #[test]
    fn matches_and_starts_with() {
        let mut h = Headers::new();
        h.add("Connection", "Keep-Alive");
        assert!(h.matches("connection", "keep-alive"));
        assert!(h.starts_with("connection", "keep"));
        assert!(!h.starts_with("connection", "close"));
    }

    #[test]
    fn write_to_uses_crlf_and_normalized_names() {
        let mut h = Headers::new();
        h.set("content-length", "5");
        let mut out = String::new();
        h.write_to(&mut out);
        assert_eq!(out, "Content-Length: 5\r\n");
    }
}
