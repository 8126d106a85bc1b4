//! Unified constants module for Strata
//!
//! Centralizes protocol limits and on-disk naming so the registry and
//! image modules stay consistent.

use std::time::Duration;

// ============================================================================
// Protocol Limits
// ============================================================================

/// Hard cap on the number of layers a single image ancestry may list.
pub const LAYERS_MAX: usize = 2048;

/// Upper bound on buffered metadata payloads (tags, ancestry, json).
/// Layer bodies are streamed and never buffered, so no cap applies there.
pub const MAX_METADATA_SIZE: usize = 16 * 1024 * 1024;

/// Length of a layer id: 256 bits of lowercase hex.
pub const LAYER_ID_LEN: usize = 64;

// ============================================================================
// Wire Constants
// ============================================================================

/// Response/request header carrying the session auth token.
pub const HEADER_TOKEN: &str = "X-Docker-Token";

/// Response header carrying the comma-separated registry endpoint list.
pub const HEADER_REGISTRY: &str = "X-Docker-Endpoints";

/// Tag assumed when the caller does not name one.
pub const DEFAULT_TAG: &str = "latest";

/// Index used when the caller does not name one.
pub const DEFAULT_INDEX_URL: &str = "https://index.docker.io";

// ============================================================================
// On-Disk Layout
// ============================================================================

/// Directory name prefix for materialized layers under the image root.
/// Presence of `<image_root>/.dkr-<id>` is the ground truth that the
/// layer is already materialized.
pub const LAYER_DIR_PREFIX: &str = ".dkr-";

/// Default image root when the caller does not name one.
pub const DEFAULT_IMAGE_ROOT: &str = "/var/lib/strata";

// ============================================================================
// Timeouts
// ============================================================================

/// TCP connect timeout for registry requests.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
