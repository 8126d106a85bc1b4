//! Response Header Extraction
//!
//! Every response a session receives may carry a fresh auth token and a
//! registry endpoint list. Later values overwrite earlier ones, so the
//! most recent response always wins.

use reqwest::header::HeaderMap;

use crate::registry::{PullError, Result};
use crate::utils::constants::{HEADER_REGISTRY, HEADER_TOKEN};
use crate::utils::validation::endpoint_is_valid;

/// Fold one response's headers into the session's token and registry
/// endpoint list. An endpoint list with an invalid hostname is a fatal
/// protocol error for the request that delivered it.
pub fn absorb(
    headers: &HeaderMap,
    token: &mut Option<String>,
    registries: &mut Vec<String>,
) -> Result<()> {
    if let Some(value) = headers.get(HEADER_TOKEN) {
        let value = value
            .to_str()
            .map_err(|_| PullError::Protocol("non-ASCII auth token".to_string()))?;
        *token = Some(value.trim().to_string());
    }

    if let Some(value) = headers.get(HEADER_REGISTRY) {
        let value = value
            .to_str()
            .map_err(|_| PullError::Protocol("non-ASCII endpoint list".to_string()))?;

        let mut list = Vec::new();
        for endpoint in value.split(',') {
            let endpoint = endpoint.trim();
            if !endpoint_is_valid(endpoint) {
                return Err(PullError::Protocol(format!(
                    "registry hostname is not valid: {:?}",
                    endpoint
                )));
            }
            list.push(endpoint.to_string());
        }

        *registries = list;
    }

    Ok(())
}
