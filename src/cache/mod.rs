//! Content-addressed layer cache (C2): per-image cache directory keyed by
//! manifest digest, with stale-version cleanup and crash-safe atomic writes.

pub mod types;

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

pub use types::{short_image_id, CachedImage, ImageMetadata};

use crate::error::{PullError, Result};
use crate::oci::manifest::{Layer, Manifest, ManifestId};
use crate::oci::reference::ImageReference;

const MANIFEST_FILE: &str = "manifest.json";
const METADATA_FILE: &str = "metadata.json";

pub struct CacheStore {
    cache_root: PathBuf,
    enabled: bool,
}

impl CacheStore {
    pub fn new(cache_root: impl Into<PathBuf>, enabled: bool) -> Self {
        Self {
            cache_root: cache_root.into(),
            enabled,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// `<cache_root>/<registry>/<organization>` (I2).
    pub fn org_dir(&self, reference: &ImageReference) -> PathBuf {
        self.cache_root.join(&reference.registry).join(reference.organization())
    }

    /// `<cache_root>/<registry>/<organization>/<manifest_id>` (I2).
    pub fn image_dir(&self, reference: &ImageReference, manifest_id: &ManifestId) -> PathBuf {
        self.org_dir(reference).join(manifest_id.as_str())
    }

    /// Never any other path than `<image_dir>/<digest_with_underscore>` (I2).
    pub fn layer_path(&self, image_dir: &Path, layer: &Layer) -> PathBuf {
        image_dir.join(layer.digest_filename())
    }

    /// I1: valid iff caching is enabled, the stored manifest's layer list
    /// structurally matches the requested one, and every expected layer file
    /// exists. Any parse failure is treated as a cache miss, not an error.
    pub async fn validate(
        &self,
        reference: &ImageReference,
        requested_manifest: &Manifest,
        manifest_id: &ManifestId,
    ) -> bool {
        if !self.enabled {
            return false;
        }

        let image_dir = self.image_dir(reference, manifest_id);
        let stored = match self.read_manifest(&image_dir).await {
            Ok(m) => m,
            Err(_) => return false,
        };

        if !stored.layers_match(requested_manifest) {
            return false;
        }

        for layer in stored.config.iter().chain(stored.layers.iter()) {
            if !self.layer_path(&image_dir, layer).exists() {
                return false;
            }
        }

        true
    }

    /// Idempotent recreate of the image cache directory (§4.2 `prepare`).
    pub async fn prepare(&self, reference: &ImageReference, manifest_id: &ManifestId) -> Result<PathBuf> {
        let image_dir = self.image_dir(reference, manifest_id);

        if image_dir.exists() {
            warn!(path = %image_dir.display(), "removing stale cache directory before recreate");
            loop {
                match tokio::fs::remove_dir_all(&image_dir).await {
                    Ok(()) => break,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
                    Err(e) => {
                        warn!(path = %image_dir.display(), error = %e, "retrying stale cache removal");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        }

        tokio::fs::create_dir_all(&image_dir).await.map_err(|e| PullError::Cache {
            path: image_dir.clone(),
            reason: e.to_string(),
        })?;

        Ok(image_dir)
    }

    pub async fn save_manifest(&self, reference: &ImageReference, manifest_id: &ManifestId, manifest: &Manifest) -> Result<()> {
        let image_dir = self.image_dir(reference, manifest_id);
        let body = serde_json::to_vec_pretty(manifest)?;
        self.write_atomic(&image_dir.join(MANIFEST_FILE), &body).await
    }

    pub async fn save_metadata(&self, reference: &ImageReference, manifest_id: &ManifestId, image: &str) -> Result<()> {
        let image_dir = self.image_dir(reference, manifest_id);
        let metadata = ImageMetadata::new(image, manifest_id.as_str());
        let body = serde_json::to_vec_pretty(&metadata)?;
        self.write_atomic(&image_dir.join(METADATA_FILE), &body).await
    }

    /// Deletes sibling `manifest_id` directories under the same organization
    /// that carry the same `image` in their metadata but a different
    /// `manifest_id`. Siblings without metadata are left alone (P3).
    pub async fn cleanup_old_versions(&self, reference: &ImageReference, current_manifest_id: &ManifestId, image: &str) -> Result<()> {
        let org_dir = self.org_dir(reference);
        let mut entries = match tokio::fs::read_dir(&org_dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let sibling_name = entry.file_name().to_string_lossy().into_owned();
            if sibling_name == current_manifest_id.as_str() {
                continue;
            }

            let sibling_dir = entry.path();
            match self.read_metadata(&sibling_dir).await {
                Ok(metadata) if metadata.image == image && metadata.manifest_id != current_manifest_id.as_str() => {
                    info!(path = %sibling_dir.display(), "removing superseded cache version");
                    tokio::fs::remove_dir_all(&sibling_dir).await?;
                }
                Ok(_) => {}
                Err(_) => {
                    debug!(path = %sibling_dir.display(), "sibling cache directory has no matching metadata, leaving untouched");
                }
            }
        }

        Ok(())
    }

    /// Enumerates every cached image across all registries/organizations,
    /// sorted by `(repository, short_image_id)`.
    pub async fn enumerate_images(&self) -> Result<Vec<CachedImage>> {
        let mut out = Vec::new();

        let mut registries = match tokio::fs::read_dir(&self.cache_root).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };

        while let Some(registry_entry) = registries.next_entry().await? {
            if !registry_entry.file_type().await?.is_dir() {
                continue;
            }
            let mut orgs = tokio::fs::read_dir(registry_entry.path()).await?;
            while let Some(org_entry) = orgs.next_entry().await? {
                if !org_entry.file_type().await?.is_dir() {
                    continue;
                }
                let organization = org_entry.file_name().to_string_lossy().into_owned();
                let mut manifests = tokio::fs::read_dir(org_entry.path()).await?;
                while let Some(manifest_entry) = manifests.next_entry().await? {
                    if !manifest_entry.file_type().await?.is_dir() {
                        continue;
                    }
                    let dir_name = manifest_entry.file_name().to_string_lossy().into_owned();
                    let dir_path = manifest_entry.path();

                    match self.read_metadata(&dir_path).await {
                        Ok(metadata) => {
                            let repository = metadata
                                .image
                                .split(':')
                                .next()
                                .unwrap_or(&metadata.image)
                                .to_string();
                            out.push(CachedImage {
                                repository,
                                short_image_id: short_image_id(&metadata.manifest_id),
                                manifest_id: metadata.manifest_id,
                            });
                        }
                        Err(_) => {
                            // No metadata.json: synthesize a record from the directory
                            // name itself rather than recomputing a digest from the
                            // manifest body (see Open Question resolution in DESIGN.md).
                            if self.read_manifest(&dir_path).await.is_ok() {
                                out.push(CachedImage {
                                    repository: organization.clone(),
                                    short_image_id: short_image_id(&dir_name),
                                    manifest_id: dir_name,
                                });
                            } else {
                                warn!(path = %dir_path.display(), "skipping cache directory with neither metadata nor a readable manifest");
                            }
                        }
                    }
                }
            }
        }

        out.sort();
        Ok(out)
    }

    async fn read_manifest(&self, image_dir: &Path) -> Result<Manifest> {
        let body = tokio::fs::read(image_dir.join(MANIFEST_FILE)).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn read_metadata(&self, image_dir: &Path) -> Result<ImageMetadata> {
        let body = tokio::fs::read(image_dir.join(METADATA_FILE)).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn write_atomic(&self, path: &Path, body: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp_path = path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(body).await?;
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, path).await?;
        Ok(())
    }
}
