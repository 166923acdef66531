//! Outbound destination URL normalization
//!
//! Turns a destination endpoint plus a stream key into the single URL handed to the
//! transcoder. Keys arrive mangled by copy-paste (embedded newlines, tabs, spaces), so
//! whitespace is stripped; anything that would still produce an invalid URL is an error.

use thiserror::Error;

/// Endpoint used when the caller supplies none
pub const DEFAULT_ENDPOINT: &str = "rtmps://live-api-s.facebook.com:443/rtmp/";

/// Application path appended when an endpoint names only a host
pub const DEFAULT_APP_SEGMENT: &str = "rtmp";

const DEFAULT_SCHEME: &str = "rtmps";

/// Error type for URL construction
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UrlError {
    #[error("stream key is empty after removing whitespace")]
    EmptyKey,

    #[error("invalid URL scheme '{0}'")]
    InvalidScheme(String),

    #[error("destination endpoint has no host")]
    MissingHost,

    #[error("outbound URL contains whitespace or control characters")]
    InvalidCharacters,
}

/// Build the outbound URL using [`DEFAULT_ENDPOINT`] for a blank base
pub fn build_outbound_url(base_endpoint: &str, secret_key: &str) -> Result<String, UrlError> {
    build_outbound_url_with_default(base_endpoint, secret_key, DEFAULT_ENDPOINT)
}

/// Build the outbound URL, substituting `default_endpoint` for a blank base
///
/// - a base without `scheme://` gets `rtmps://`
/// - a base with no path gets the `/rtmp` application segment
/// - repeated or trailing slashes are collapsed so exactly one `/` precedes the key
/// - a base that already ends in the key is not given the key twice
pub fn build_outbound_url_with_default(
    base_endpoint: &str,
    secret_key: &str,
    default_endpoint: &str,
) -> Result<String, UrlError> {
    let key = strip_whitespace(secret_key);
    if key.is_empty() {
        return Err(UrlError::EmptyKey);
    }

    let endpoint = Endpoint::parse(base_endpoint, default_endpoint)?;

    let mut segments = endpoint.segments;
    if segments.len() > 1 && segments.last().map(String::as_str) == Some(key.as_str()) {
        segments.pop();
    }

    let url = format!(
        "{}://{}/{}/{}",
        endpoint.scheme,
        endpoint.authority,
        segments.join("/"),
        key
    );

    if url.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(UrlError::InvalidCharacters);
    }

    Ok(url)
}

/// Remove every whitespace character, including ones in the middle of the string
pub fn strip_whitespace(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Rewrite an `rtmps://` URL to plain `rtmp://` for engines built without TLS output
///
/// An explicit `:443` port becomes `:80`. Other URLs are returned unchanged.
pub fn downgrade_to_rtmp(url: &str) -> String {
    let Some(rest) = strip_prefix_ignore_case(url, "rtmps://") else {
        return url.to_string();
    };
    let (authority, path) = match rest.find('/') {
        Some(i) => rest.split_at(i),
        None => (rest, ""),
    };
    let authority = match authority.strip_suffix(":443") {
        Some(host) => format!("{}:80", host),
        None => authority.to_string(),
    };
    format!("rtmp://{}{}", authority, path)
}

/// Replace the stream key in a URL for logging
pub fn redact_key(url: &str, secret_key: &str) -> String {
    let key = strip_whitespace(secret_key);
    if key.is_empty() {
        return url.to_string();
    }
    url.replace(&key, "***")
}

struct Endpoint {
    scheme: String,
    authority: String,
    segments: Vec<String>,
}

impl Endpoint {
    fn parse(base: &str, default_endpoint: &str) -> Result<Self, UrlError> {
        let trimmed = base.trim();
        let raw = if trimmed.is_empty() {
            default_endpoint.trim()
        } else {
            trimmed
        };

        let (scheme, rest) = match raw.split_once("://") {
            Some((scheme, rest)) => (scheme.to_ascii_lowercase(), rest),
            None => (DEFAULT_SCHEME.to_string(), raw),
        };

        if !is_valid_scheme(&scheme) {
            return Err(UrlError::InvalidScheme(scheme));
        }

        let (authority, path) = match rest.find('/') {
            Some(i) => rest.split_at(i),
            None => (rest, ""),
        };
        if authority.is_empty() {
            return Err(UrlError::MissingHost);
        }

        let mut segments: Vec<String> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        if segments.is_empty() {
            segments.push(DEFAULT_APP_SEGMENT.to_string());
        }

        Ok(Self {
            scheme,
            authority: authority.to_string(),
            segments,
        })
    }
}

fn is_valid_scheme(scheme: &str) -> bool {
    let mut chars = scheme.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {
            chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        }
        _ => false,
    }
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}
