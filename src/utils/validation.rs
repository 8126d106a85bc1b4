//! Input validation for registry identifiers
//!
//! Validates everything that crosses the engine boundary before it is
//! spliced into URLs or filesystem paths:
//! - repository names (`library/busybox`)
//! - tags (`latest`, `v1.0`)
//! - layer ids (64 lowercase hex chars)
//! - registry endpoints discovered from response headers (`host[:port]`)
//! - local machine names used for image aliases

use crate::utils::constants::LAYER_ID_LEN;

/// Check that a URL is a plausible HTTP(S) base URL.
///
/// Accepts `http://host...` and `https://host...` with a non-empty host
/// part and no whitespace or control characters anywhere.
pub fn http_url_is_valid(url: &str) -> bool {
    let rest = if let Some(r) = url.strip_prefix("https://") {
        r
    } else if let Some(r) = url.strip_prefix("http://") {
        r
    } else {
        return false;
    };

    if rest.is_empty() {
        return false;
    }

    let host = rest.split('/').next().unwrap_or("");
    if host.is_empty() {
        return false;
    }

    !url.chars().any(|c| c.is_whitespace() || c.is_control())
}

/// Check a repository name against the registry name grammar.
///
/// A name is one or more `/`-separated segments, each built from
/// lowercase alphanumerics plus `.`, `_` and `-`, starting and ending
/// with an alphanumeric.
pub fn name_is_valid(name: &str) -> bool {
    if name.is_empty() || name.len() > 256 {
        return false;
    }

    name.split('/').all(segment_is_valid)
}

fn segment_is_valid(segment: &str) -> bool {
    if segment.is_empty() {
        return false;
    }

    let bytes = segment.as_bytes();
    if !bytes[0].is_ascii_alphanumeric() || !bytes[bytes.len() - 1].is_ascii_alphanumeric() {
        return false;
    }

    bytes
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'.' | b'_' | b'-'))
}

/// Check a tag against the tag grammar: up to 128 chars of
/// alphanumerics plus `.`, `_` and `-`, not starting with a separator.
pub fn tag_is_valid(tag: &str) -> bool {
    if tag.is_empty() || tag.len() > 128 {
        return false;
    }

    let bytes = tag.as_bytes();
    if !bytes[0].is_ascii_alphanumeric() && bytes[0] != b'_' {
        return false;
    }

    bytes
        .iter()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

/// Check a layer id against the content-address grammar: exactly 64
/// lowercase hex characters.
pub fn layer_id_is_valid(id: &str) -> bool {
    id.len() == LAYER_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Check a hostname: dot-separated labels of alphanumerics and `-`,
/// no label starting or ending with `-`, total length at most 253.
pub fn hostname_is_valid(host: &str) -> bool {
    if host.is_empty() || host.len() > 253 {
        return false;
    }

    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
            && !label.starts_with('-')
            && !label.ends_with('-')
    })
}

/// Check a registry endpoint as discovered from response headers:
/// a valid hostname with an optional `:port` suffix.
pub fn endpoint_is_valid(endpoint: &str) -> bool {
    match endpoint.rsplit_once(':') {
        Some((host, port)) => {
            hostname_is_valid(host) && port.parse::<u16>().map(|p| p > 0).unwrap_or(false)
        }
        None => hostname_is_valid(endpoint),
    }
}

/// Check a local machine name: a single hostname-style label chain of
/// at most 64 characters, suitable as a directory name.
pub fn machine_name_is_valid(name: &str) -> bool {
    name.len() <= 64 && hostname_is_valid(name)
}
