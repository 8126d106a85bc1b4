//! Strata — container image pull engine
//!
//! Pulls an image from a v1-style registry and materializes it on the
//! local filesystem as a chain of stacked copy-on-write snapshots, one
//! read-only directory per layer. Layers shared between images are
//! fetched once and reused.
//!
//! The engine is the [`registry::PullSession`] state machine; the
//! [`image`] module owns everything below it on the filesystem side:
//! snapshots, extraction and whiteout handling.

pub mod image;
pub mod registry;
pub mod utils;

pub use registry::{ProgressFn, PullError, PullEvent, PullSession};
