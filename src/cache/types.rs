//! On-disk cache record types (§3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Written to `metadata.json` alongside a cached manifest so the cleanup pass
/// knows which image a cache entry belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub image: String,
    pub manifest_id: String,
    pub timestamp: DateTime<Utc>,
}

impl ImageMetadata {
    pub fn new(image: impl Into<String>, manifest_id: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            manifest_id: manifest_id.into(),
            timestamp: Utc::now(),
        }
    }
}

/// An enumerated cache entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CachedImage {
    pub repository: String,
    pub short_image_id: String,
    pub manifest_id: String,
}

/// First 12 hex characters of the manifest id's digest portion
/// (`sha256_deadbeef...` -> `deadbeef1234`).
pub fn short_image_id(manifest_id: &str) -> String {
    let hex_part = manifest_id.rsplit('_').next().unwrap_or(manifest_id);
    hex_part.chars().take(12).collect()
}
