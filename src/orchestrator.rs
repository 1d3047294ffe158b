//! Pull Orchestrator (C5): drives the token/manifest fetch, picks the cache
//! or fresh-download path, and stages everything before an atomic rename
//! onto the final VM directory (§4.5).

use std::path::{Path, PathBuf};

use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::CacheStore;
use crate::collaborators::{DiskConverter, ResourceHints, Settings, VmDirResolver};
use crate::config::PullConfig;
use crate::download::{DownloadCoordinator, FetchJob};
use crate::error::Result;
use crate::oci::manifest::{classify_layers, expected_chunk_total, LayerRole, Manifest};
use crate::oci::{ImageReference, ManifestId, RegistryClient};
use crate::progress::{ProgressTracker, Stats};
use crate::reassemble::{self, Part};

const CONFIG_FILE: &str = "config.json";
const NVRAM_FILE: &str = "nvram.bin";
const DISK_FILE: &str = "disk.img";

/// Result of a successful pull: the final VM directory and a progress summary.
pub struct PullOutcome {
    pub vm_dir: PathBuf,
    pub stats: Stats,
}

pub struct PullOrchestrator {
    client: RegistryClient,
    /// Reused for token requests only; `RegistryClient` owns the pooled
    /// client used for manifest/blob requests (§9 "explicit `HttpConfig`").
    token_http: reqwest::Client,
    cache: CacheStore,
    config: PullConfig,
    vm_dir_resolver: Box<dyn VmDirResolver>,
    resource_hints: Box<dyn ResourceHints>,
    converter: Box<dyn DiskConverter>,
}

impl PullOrchestrator {
    pub fn new(
        settings: &dyn Settings,
        vm_dir_resolver: Box<dyn VmDirResolver>,
        resource_hints: Box<dyn ResourceHints>,
        converter: Box<dyn DiskConverter>,
        config: PullConfig,
    ) -> Result<Self> {
        let client = RegistryClient::new(config.http.clone())?;
        let token_http = config.http.build_client()?;
        let cache = CacheStore::new(settings.cache_root(), settings.caching_enabled());
        Ok(Self {
            client,
            token_http,
            cache,
            config,
            vm_dir_resolver,
            resource_hints,
            converter,
        })
    }

    /// Pulls `image` (`"<name>:<tag>"`), optionally under an explicit `name`
    /// (passed to the VM directory resolver) or straight to an explicit
    /// `location`, bypassing the resolver entirely (§4.5).
    pub async fn pull(&self, image: &str, name: Option<&str>, location: Option<&Path>) -> Result<PullOutcome> {
        let reference = ImageReference::parse(image)?;
        let target_dir = match location {
            Some(path) => path.to_path_buf(),
            None => self.vm_dir_resolver.resolve(name, &reference.as_image_string()),
        };

        let progress = ProgressTracker::new();

        let staging_dir = std::env::temp_dir().join(format!("lume_vm_{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&staging_dir).await?;
        let _staging_guard = StagingGuard(staging_dir.clone());

        let token = crate::oci::token::get_token(&self.token_http, &reference, false).await?;
        let (manifest, digest) = self.client.get_manifest(&reference, &token).await?;
        let manifest_id = ManifestId::from_digest(&digest);

        info!(image, registry = %reference.registry, %manifest_id, "resolved manifest");

        let roles = classify_layers(&manifest.layers, manifest.config.is_some());

        if self.cache.enabled() && self.cache.validate(&reference, &manifest, &manifest_id).await {
            info!(image, %manifest_id, "cache valid, reassembling from cached layers");
            self.stage_from_cache(&reference, &manifest, &manifest_id, &roles, &staging_dir).await?;
        } else {
            info!(image, %manifest_id, "cache miss, downloading layers");
            self.cache
                .cleanup_old_versions(&reference, &manifest_id, &reference.as_image_string())
                .await?;
            let image_dir = self.cache.prepare(&reference, &manifest_id).await?;
            self.cache.save_manifest(&reference, &manifest_id, &manifest).await?;
            self.cache
                .save_metadata(&reference, &manifest_id, &reference.as_image_string())
                .await?;

            self.download_and_reassemble(&reference, &manifest, &manifest_id, &roles, image_dir, &token, &staging_dir, &progress)
                .await?;
        }

        if target_dir.exists() {
            tokio::fs::remove_dir_all(&target_dir).await?;
        }
        if let Some(parent) = target_dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&staging_dir, &target_dir).await?;

        let stats = progress.stats();
        info!(
            image,
            vm_dir = %target_dir.display(),
            downloaded = stats.downloaded_bytes,
            elapsed = ?stats.elapsed,
            "pull complete"
        );

        Ok(PullOutcome {
            vm_dir: target_dir,
            stats,
        })
    }

    /// Fresh-download path: schedules every non-empty layer through the
    /// Download Coordinator, then reassembles `disk.img` from the staged parts.
    #[allow(clippy::too_many_arguments)]
    async fn download_and_reassemble(
        &self,
        reference: &ImageReference,
        manifest: &Manifest,
        manifest_id: &ManifestId,
        roles: &[LayerRole],
        image_dir: PathBuf,
        token: &str,
        staging_dir: &Path,
        progress: &ProgressTracker,
    ) -> Result<()> {
        let jobs = build_fetch_jobs(manifest, roles, staging_dir);
        let total_bytes: u64 = jobs.iter().map(|j| j.layer.size.max(0) as u64).sum();
        progress.set_total(total_bytes, jobs.len() as u64);

        let max_concurrent = self.config.compute_max_concurrent(self.resource_hints.as_ref());
        let coordinator = DownloadCoordinator::new(
            &self.client,
            &self.cache,
            reference,
            manifest_id,
            image_dir,
            token,
            progress,
            max_concurrent,
        );
        coordinator.run(jobs).await?;

        self.reassemble_staging(manifest, roles, staging_dir).await
    }

    /// Cache-hit path: copies config/nvram straight into staging and
    /// reassembles `disk.img` by reading disk-chunk parts directly out of
    /// the cache directory, with no intermediate copy (§4.5 step 5).
    async fn stage_from_cache(
        &self,
        reference: &ImageReference,
        manifest: &Manifest,
        manifest_id: &ManifestId,
        roles: &[LayerRole],
        staging_dir: &Path,
    ) -> Result<()> {
        let image_dir = self.cache.image_dir(reference, manifest_id);

        if let Some(config_layer) = &manifest.config {
            let cached_path = self.cache.layer_path(&image_dir, config_layer);
            tokio::fs::copy(&cached_path, staging_dir.join(CONFIG_FILE)).await?;
        }

        let mut parts = Vec::new();
        for (layer, role) in manifest.layers.iter().zip(roles.iter()) {
            let cached_path = self.cache.layer_path(&image_dir, layer);
            match role {
                LayerRole::Empty => {}
                LayerRole::Config => {
                    tokio::fs::copy(&cached_path, staging_dir.join(CONFIG_FILE)).await?;
                }
                LayerRole::Nvram => {
                    tokio::fs::copy(&cached_path, staging_dir.join(NVRAM_FILE)).await?;
                }
                LayerRole::WholeDisk { decoder } => {
                    parts.push(Part {
                        ordinal: 1,
                        path: cached_path,
                        decoder: *decoder,
                    });
                }
                LayerRole::DiskChunk { ordinal, decoder } => {
                    parts.push(Part {
                        ordinal: *ordinal,
                        path: cached_path,
                        decoder: *decoder,
                    });
                }
            }
        }

        self.run_reassembler(manifest, roles, staging_dir, parts).await
    }

    /// Gathers the parts the Download Coordinator just staged
    /// (`disk.img.part.<N>` or a lone whole-disk layer) and reassembles them.
    async fn reassemble_staging(&self, manifest: &Manifest, roles: &[LayerRole], staging_dir: &Path) -> Result<()> {
        let parts = roles
            .iter()
            .filter_map(|role| match role {
                LayerRole::WholeDisk { decoder } => Some(Part {
                    ordinal: 1,
                    path: staging_dir.join(part_filename(1)),
                    decoder: *decoder,
                }),
                LayerRole::DiskChunk { ordinal, decoder } => Some(Part {
                    ordinal: *ordinal,
                    path: staging_dir.join(part_filename(*ordinal)),
                    decoder: *decoder,
                }),
                LayerRole::Empty | LayerRole::Config | LayerRole::Nvram => None,
            })
            .collect();

        self.run_reassembler(manifest, roles, staging_dir, parts).await
    }

    async fn run_reassembler(
        &self,
        manifest: &Manifest,
        roles: &[LayerRole],
        staging_dir: &Path,
        mut parts: Vec<Part>,
    ) -> Result<()> {
        if parts.is_empty() {
            return Ok(());
        }
        parts.sort_by_key(|p| p.ordinal);

        let logical_size = self.resolve_logical_size(manifest, staging_dir).await?;
        let target_path = staging_dir.join(DISK_FILE);
        let expected_parts = expected_chunk_total(&manifest.layers, roles);

        reassemble::reassemble(
            &parts,
            &target_path,
            logical_size,
            expected_parts,
            &self.config,
            self.converter.as_ref(),
        )
        .await
    }

    /// Priority order from §4.4 step 1: the manifest's own `uncompressed-size`
    /// annotation, then a `disk_size` field inside the pulled VM config JSON.
    /// Returning `None` here is only valid for a single-part image; multi-part
    /// is rejected by `reassemble::reassemble` itself.
    async fn resolve_logical_size(&self, manifest: &Manifest, staging_dir: &Path) -> Result<Option<u64>> {
        if let Some(size) = manifest.uncompressed_size_annotation() {
            return Ok(Some(size));
        }

        let config_path = staging_dir.join(CONFIG_FILE);
        match tokio::fs::read(&config_path).await {
            Ok(body) => {
                let parsed: serde_json::Value = serde_json::from_slice(&body)?;
                if let Some(size) = parsed.get("disk_size").and_then(|v| v.as_u64()) {
                    return Ok(Some(size));
                }
                warn!("VM config present but missing `disk_size`; size will come from part count if single-part");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        Ok(None)
    }
}

/// Scope-exit guard: always sweeps the staging directory, regardless of which
/// return path is taken (including cancellation dropping the pull future
/// mid-flight), per §3 "Staging temp dir" lifecycle and §5 cancellation.
/// Harmless to run again after a successful rename: the path is already gone.
struct StagingGuard(PathBuf);

impl Drop for StagingGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

fn part_filename(ordinal: u32) -> String {
    format!("{DISK_FILE}.part.{ordinal}")
}

/// Builds one [`FetchJob`] per non-empty layer, mapping each to its staging
/// destination per the §6 media-type table, plus one more for the manifest's
/// own `config` descriptor (not a `layers` entry) when present.
fn build_fetch_jobs(manifest: &Manifest, roles: &[LayerRole], staging_dir: &Path) -> Vec<FetchJob> {
    let mut jobs: Vec<FetchJob> = manifest
        .config
        .iter()
        .map(|layer| FetchJob {
            layer: layer.clone(),
            dest_path: staging_dir.join(CONFIG_FILE),
        })
        .collect();

    jobs.extend(manifest.layers.iter().zip(roles.iter()).filter_map(|(layer, role)| {
        let dest_path = match role {
            LayerRole::Empty => return None,
            LayerRole::Config => staging_dir.join(CONFIG_FILE),
            LayerRole::Nvram => staging_dir.join(NVRAM_FILE),
            LayerRole::WholeDisk { .. } => staging_dir.join(part_filename(1)),
            LayerRole::DiskChunk { ordinal, .. } => staging_dir.join(part_filename(*ordinal)),
        };
        Some(FetchJob {
            layer: layer.clone(),
            dest_path,
        })
    }));

    jobs
}
