//! Error taxonomy for the pull pipeline.
//!
//! A single [`PullError`] sum type is returned by every fallible operation in
//! this crate, mirroring the taxonomy in the registry/cache/reassembly design
//! rather than letting `reqwest`/`std::io` errors leak through untyped.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, PullError>;

#[derive(Debug, thiserror::Error)]
pub enum PullError {
    #[error("invalid image spec {image:?}: {reason}")]
    InvalidImageSpec { image: String, reason: &'static str },

    #[error("failed to obtain registry token for {repository}: {reason}")]
    TokenFetchFailed { repository: String, reason: String },

    #[error("failed to fetch manifest for {repository}:{reference}: {reason}")]
    ManifestFetchFailed {
        repository: String,
        reference: String,
        reason: String,
    },

    #[error("failed to download layer {digest}: {reason}")]
    LayerDownloadFailed { digest: String, reason: String },

    #[error("reassembly could not locate part {part}")]
    MissingPart { part: u32 },

    #[error(
        "multi-part image has no uncompressed size: neither the config annotation \
         nor a `disk_size` field in the VM config were present"
    )]
    MissingUncompressedSize,

    #[error("failed to create file {path}: {reason}")]
    FileCreationFailed { path: PathBuf, reason: String },

    #[error("failed to set up reassembly at {path}: {cause}")]
    ReassemblySetupFailed { path: PathBuf, cause: String },

    #[error("decompression of part {part} failed: {reason}")]
    DecompressionFailed { part: u32, reason: String },

    #[error("cache error at {path}: {reason}")]
    Cache { path: PathBuf, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl PullError {
    pub fn invalid_image_spec(image: impl Into<String>, reason: &'static str) -> Self {
        Self::InvalidImageSpec {
            image: image.into(),
            reason,
        }
    }
}
