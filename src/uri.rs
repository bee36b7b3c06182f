//! URI parsing, validation, and relative-redirect resolution.
//!
//! This is policy, not a full RFC 3986 implementation — `resolve` and
//! `merge_paths` pin the exact behavior the redirect engine relies on.

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
    Ws,
    Wss,
}

impl Scheme {
    fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            "ws" => Ok(Scheme::Ws),
            "wss" => Ok(Scheme::Wss),
            other => Err(Error::uri_parsing(format!("unsupported scheme: {other}"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
        }
    }

    fn default_port(&self) -> u16 {
        match self {
            Scheme::Http | Scheme::Ws => 80,
            Scheme::Https | Scheme::Wss => 443,
        }
    }

    fn uses_tls(&self) -> bool {
        matches!(self, Scheme::Https | Scheme::Wss)
    }

    /// Same "family" for the cross-family redirect prohibition: http<->https
    /// and ws<->wss are allowed; http-family <-> ws-family is not.
    fn family(&self) -> Family {
        match self {
            Scheme::Http | Scheme::Https => Family::Http,
            Scheme::Ws | Scheme::Wss => Family::Ws,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Http,
    Ws,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUri {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub fragment: Option<String>,
    pub use_tls: bool,
}

impl ParsedUri {
    /// Parses an absolute-form URI: `scheme://authority[/path][#fragment]`.
    pub fn parse(input: &str) -> Result<Self> {
        let (scheme_str, rest) = input
            .split_once("://")
            .ok_or_else(|| Error::uri_parsing(format!("missing scheme in: {input}")))?;
        let scheme = Scheme::parse(scheme_str)?;

        let (authority_and_path, fragment) = match rest.split_once('#') {
            Some((a, f)) => (a, Some(f.to_string())),
            None => (rest, None),
        };

        let (authority, path) = match authority_and_path.split_once('/') {
            Some((a, p)) => (a, format!("/{p}")),
            None => (authority_and_path, "/".to_string()),
        };

        let (host, port, is_ipv6) = parse_authority(authority, scheme.default_port())?;
        if is_ipv6 {
            validate_ipv6_literal(&host)?;
        } else {
            validate_host(&host)?;
        }

        Ok(ParsedUri {
            use_tls: scheme.uses_tls(),
            scheme,
            host,
            port,
            path,
            fragment,
        })
    }

    pub fn host_header(&self) -> String {
        if self.port == self.scheme.default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Resolves `target` against `self` as the previous (base) URI, per the
    /// redirect rules in spec.md §4.1.
    pub fn resolve(&self, target: &str) -> Result<ParsedUri> {
        if let Some((scheme_str, _)) = target.split_once("://") {
            // Only treat as absolute if the left side is actually a known scheme;
            // otherwise fall through to relative handling (a colon can appear
            // in path segments too, but "://" is unambiguous enough here).
            if Scheme::parse(scheme_str).is_ok() {
                let mut resolved = ParsedUri::parse(target)?;
                if self.scheme.family() != resolved.scheme.family() {
                    return Err(Error::invalid_redirect(format!(
                        "cannot redirect across families: {} -> {}",
                        self.scheme.as_str(),
                        resolved.scheme.as_str()
                    )));
                }
                if resolved.fragment.is_none() {
                    resolved.fragment = self.fragment.clone();
                }
                return Ok(resolved);
            }
        }

        if let Some(rest) = target.strip_prefix('/') {
            let (path_part, fragment) = match rest.split_once('#') {
                Some((p, f)) => (p, Some(f.to_string())),
                None => (rest, None),
            };
            return Ok(ParsedUri {
                scheme: self.scheme.clone(),
                host: self.host.clone(),
                port: self.port,
                use_tls: self.use_tls,
                path: format!("/{path_part}"),
                fragment: fragment.or_else(|| self.fragment.clone()),
            });
        }

        let (rel_path, fragment) = match target.split_once('#') {
            Some((p, f)) => (p, Some(f.to_string())),
            None => (target, None),
        };
        let merged = merge_paths(&self.path, rel_path)?;
        Ok(ParsedUri {
            scheme: self.scheme.clone(),
            host: self.host.clone(),
            port: self.port,
            use_tls: self.use_tls,
            path: merged,
            fragment: fragment.or_else(|| self.fragment.clone()),
        })
    }
}

fn parse_authority(authority: &str, default_port: u16) -> Result<(String, u16, bool)> {
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| Error::uri_parsing("unterminated IPv6 literal"))?;
        let port = match after.strip_prefix(':') {
            Some(p) => parse_port(p)?,
            Some("") => default_port,
            None if after.is_empty() => default_port,
            None => {
                return Err(Error::uri_parsing(
                    "unexpected characters between ']' and port",
                ));
            }
        };
        return Ok((host.to_string(), port, true));
    }

    if authority.contains('[') || authority.contains(']') {
        return Err(Error::illegal_hostname(
            "bare IPv6 address must be enclosed in brackets",
        ));
    }

    match authority.rsplit_once(':') {
        Some((host, port_str)) => Ok((host.to_string(), parse_port(port_str)?, false)),
        None => Ok((authority.to_string(), default_port, false)),
    }
}

fn parse_port(s: &str) -> Result<u16> {
    s.parse::<u16>()
        .map_err(|_| Error::uri_parsing(format!("invalid port: {s}")))
}

fn validate_host(host: &str) -> Result<()> {
    if host.is_empty() {
        return Err(Error::illegal_hostname("empty host"));
    }
    for label in host.split('.') {
        if label.is_empty() {
            return Err(Error::illegal_hostname(format!(
                "empty label in hostname: {host}"
            )));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(Error::illegal_hostname(format!(
                "label starts or ends with '-': {label}"
            )));
        }
        if !label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(Error::illegal_hostname(format!(
                "non-ASCII or illegal character in label: {label}"
            )));
        }
    }
    Ok(())
}

/// Bracketed IPv6 literals don't follow the dotted-label/hyphen rules a DNS
/// hostname does; only reject characters that couldn't appear in one
/// (`hex digit`, `:`, or `.` for an IPv4-mapped tail like `::ffff:1.2.3.4`).
fn validate_ipv6_literal(host: &str) -> Result<()> {
    if host.is_empty() {
        return Err(Error::illegal_hostname("empty IPv6 literal"));
    }
    if !host
        .chars()
        .all(|c| c.is_ascii_hexdigit() || c == ':' || c == '.')
    {
        return Err(Error::illegal_hostname(format!(
            "illegal character in IPv6 literal: {host}"
        )));
    }
    Ok(())
}

/// Merges a relative reference `rel` against a base path `base`, per
/// spec.md §4.1: strip to the last '/', append `rel`, normalize `.`/`..`.
pub fn merge_paths(base: &str, rel: &str) -> Result<String> {
    let cut = base.rfind('/').map(|i| i + 1).unwrap_or(0);
    let combined = format!("{}{}", &base[..cut], rel);

    let mut segments: Vec<&str> = Vec::new();
    for seg in combined.split('/') {
        match seg {
            "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(Error::illegal_path(format!(
                        "'..' escapes root while merging {base} with {rel}"
                    )));
                }
            }
            other => segments.push(other),
        }
    }
    let mut result = String::from("/");
    result.push_str(&segments.join("/"));
    // Collapse a leading "//" produced when the first real segment is empty
    // (e.g. an absolute-looking `combined` starting with '/').
    while result.starts_with("//") {
        result.remove(0);
    }
    if result.is_empty() {
        result.push('/');
    }
    Ok(result)
}
