//! V1 Registry Pull Protocol
//!
//! Implements the index/registry split of the v1 image protocol:
//! - GET {index}/v1/repositories/<name>/images - session bootstrap
//! - GET {registry}/v1/repositories/<name>/tags/<tag> - tag resolution
//! - GET {registry}/v1/images/<id>/ancestry - layer chain
//! - GET {registry}/v1/images/<id>/json - image metadata
//! - GET {registry}/v1/images/<id>/layer - layer archive
//!
//! The index response carries the auth token and the registry endpoint
//! list in headers; both are threaded through every later request.

mod headers;
mod parse;
mod progress;
mod request;
mod session;

pub use progress::{ProgressFn, PullEvent};
pub use session::PullSession;

use thiserror::Error;

/// Errors that can occur during a pull
#[derive(Error, Debug)]
pub enum PullError {
    #[error("invalid index URL: {0}")]
    InvalidIndexUrl(String),

    #[error("invalid repository name: {0}")]
    InvalidName(String),

    #[error("invalid tag: {0}")]
    InvalidTag(String),

    #[error("invalid local machine name: {0}")]
    InvalidMachineName(String),

    #[error("a pull was already started on this session")]
    Busy,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("ancestry lists {count} layers, limit is {limit}")]
    TooManyLayers { count: usize, limit: usize },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] crate::image::ImageError),
}

pub type Result<T> = std::result::Result<T, PullError>;
