//! Outgoing request payload and the incoming-request query object.

use std::collections::HashMap;

use crate::encoding::percent_decode;
use crate::headers::Headers;
use crate::method::Method;

/// A request body the caller already holds in memory. Larger or streaming
/// bodies are written directly through the `BodyWriter` the connection hands
/// back instead of going through this type.
pub struct OutgoingRequest {
    pub method: Method,
    pub path: String,
    pub headers: Headers,
    pub body: Option<Vec<u8>>,
}

impl OutgoingRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self { method, path: path.into(), headers: Headers::new(), body: None }
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }
}

/// `{resource, parameters, fragment}` parsed out of an incoming request's
/// request-target.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub resource: String,
    pub parameters: HashMap<String, Vec<String>>,
    pub fragment: Option<String>,
}

impl Query {
    pub fn parse(request_target: &str) -> Self {
        let (path_and_query, fragment) = match request_target.split_once('#') {
            Some((p, f)) => (p, Some(f.to_string())),
            None => (request_target, None),
        };
        let (resource, query) = match path_and_query.split_once('?') {
            Some((r, q)) => (r.to_string(), Some(q)),
            None => (path_and_query.to_string(), None),
        };

        let mut parameters: HashMap<String, Vec<String>> = HashMap::new();
        if let Some(query) = query {
            for pair in query.split('&').filter(|s| !s.is_empty()) {
                let (key, value) = match pair.split_once('=') {
                    Some((k, v)) => (k, v),
                    None => (pair, ""),
                };
                let key = percent_decode(key).unwrap_or_else(|_| key.to_string());
                let value = percent_decode(value).unwrap_or_else(|_| value.to_string());
                parameters.entry(key).or_default().push(value);
            }
        }

        Query { resource, parameters, fragment }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_resource_parameters_and_fragment() {
        let q = Query::parse("/a/b?x=1&y=2&x=3#frag");
        assert_eq!(q.resource, "/a/b");
        assert_eq!(q.parameters.get("x"), Some(&vec!["1".to_string(), "3".to_string()]));
        assert_eq!(q.parameters.get("y"), Some(&vec!["2".to_string()]));
        assert_eq!(q.fragment.as_deref(), Some("frag"));
    }

    #[test]
    fn missing_query_yields_empty_parameters() {
        let q = Query::parse("/a/b");
        assert!(q.parameters.is_empty());
        assert_eq!(q.fragment, None);
    }

    #[test]
    fn value_less_parameter_defaults_to_empty_string() {
        let q = Query::parse("/a?flag");
        assert_eq!(q.parameters.get("flag"), Some(&vec!["".to_string()]));
    }
}
