//! Request Construction
//!
//! Builds the five request kinds the protocol issues. Every request
//! accepts JSON and carries either the session token once one has been
//! issued, or the bootstrap header asking the index to issue one.

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::RequestBuilder;

use crate::utils::constants::HEADER_TOKEN;

/// Base URL for a registry endpoint discovered mid-protocol.
///
/// Endpoints with an explicit port and `localhost` are assumed to be
/// local or test registries and use plain HTTP; everything else is
/// HTTPS.
pub(crate) fn registry_base(endpoint: &str) -> String {
    if endpoint.contains(':') || endpoint == "localhost" {
        format!("http://{}", endpoint)
    } else {
        format!("https://{}", endpoint)
    }
}

pub(crate) fn images_url(index_url: &str, name: &str) -> String {
    format!("{}/v1/repositories/{}/images", index_url, name)
}

pub(crate) fn tags_url(endpoint: &str, name: &str, tag: &str) -> String {
    format!(
        "{}/v1/repositories/{}/tags/{}",
        registry_base(endpoint),
        name,
        tag
    )
}

pub(crate) fn ancestry_url(endpoint: &str, id: &str) -> String {
    format!("{}/v1/images/{}/ancestry", registry_base(endpoint), id)
}

pub(crate) fn json_url(endpoint: &str, id: &str) -> String {
    format!("{}/v1/images/{}/json", registry_base(endpoint), id)
}

pub(crate) fn layer_url(endpoint: &str, id: &str) -> String {
    format!("{}/v1/images/{}/layer", registry_base(endpoint), id)
}

/// Start a GET for `url` with the session auth headers attached.
pub(crate) fn get(client: &reqwest::Client, url: &str, token: Option<&str>) -> RequestBuilder {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

    match token {
        Some(token) => {
            if let Ok(value) = HeaderValue::from_str(&format!("Token {}", token)) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        None => {
            headers.insert(HEADER_TOKEN, HeaderValue::from_static("true"));
        }
    }

    client.get(url).headers(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_base_scheme() {
        assert_eq!(registry_base("r.example.com"), "https://r.example.com");
        assert_eq!(registry_base("127.0.0.1:5000"), "http://127.0.0.1:5000");
        assert_eq!(registry_base("localhost"), "http://localhost");
    }

    #[test]
    fn test_url_shapes() {
        assert_eq!(
            images_url("https://index.docker.io", "library/busybox"),
            "https://index.docker.io/v1/repositories/library/busybox/images"
        );
        assert_eq!(
            tags_url("r.example.com", "library/busybox", "latest"),
            "https://r.example.com/v1/repositories/library/busybox/tags/latest"
        );

        let id = "ab".repeat(32);
        assert_eq!(
            ancestry_url("r.example.com", &id),
            format!("https://r.example.com/v1/images/{}/ancestry", id)
        );
        assert_eq!(
            json_url("r.example.com", &id),
            format!("https://r.example.com/v1/images/{}/json", id)
        );
        assert_eq!(
            layer_url("r.example.com", &id),
            format!("https://r.example.com/v1/images/{}/layer", id)
        );
    }
}
