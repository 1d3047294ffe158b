//! Bounded-concurrency layer fetcher with process-wide digest dedup (C3).
//!
//! Mirrors the teacher's parallel-upload shape (`Semaphore` + `try_join_all`)
//! but fetches instead of uploads, and adds the in-flight digest set that
//! makes concurrent pulls of the same image safe (I3).

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use futures::future::try_join_all;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::cache::CacheStore;
use crate::error::Result;
use crate::oci::manifest::Layer;
use crate::oci::reference::ImageReference;
use crate::oci::{ManifestId, RegistryClient};
use crate::progress::ProgressTracker;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Process-wide set of digests currently being downloaded by some task,
/// regardless of which pull scheduled them (I3, §5 "in-flight digest set").
fn in_flight() -> &'static Mutex<HashSet<String>> {
    static SET: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    SET.get_or_init(|| Mutex::new(HashSet::new()))
}

/// One layer to fetch (or reuse from cache), and where its bytes belong in
/// the staging directory. The orchestrator has already resolved `dest_path`
/// from the layer's role (§6); the coordinator only moves bytes there.
pub struct FetchJob {
    pub layer: Layer,
    pub dest_path: PathBuf,
}

pub struct DownloadCoordinator<'a> {
    client: &'a RegistryClient,
    cache: &'a CacheStore,
    reference: &'a ImageReference,
    image_dir: PathBuf,
    token: &'a str,
    progress: &'a ProgressTracker,
    max_concurrent: usize,
}

impl<'a> DownloadCoordinator<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: &'a RegistryClient,
        cache: &'a CacheStore,
        reference: &'a ImageReference,
        _manifest_id: &'a ManifestId,
        image_dir: PathBuf,
        token: &'a str,
        progress: &'a ProgressTracker,
        max_concurrent: usize,
    ) -> Self {
        Self {
            client,
            cache,
            reference,
            image_dir,
            token,
            progress,
            max_concurrent,
        }
    }

    /// Fetches every job, bounded to `max_concurrent` in flight. The first
    /// failure drops every other outstanding future (§4.3 failure semantics).
    pub async fn run(&self, jobs: Vec<FetchJob>) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent.max(1)));

        let futures = jobs.into_iter().map(|job| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("download semaphore never closes");
                self.fetch_one(job).await
            }
        });

        try_join_all(futures).await?;
        Ok(())
    }

    /// One layer: reuse the cache if present, otherwise join or start the
    /// download, then copy the result into the staging path.
    async fn fetch_one(&self, job: FetchJob) -> Result<()> {
        let digest = job.layer.digest.clone();
        let cached_path = self.cache.layer_path(&self.image_dir, &job.layer);

        if cached_path.exists() {
            return self.adopt_from_cache(&cached_path, &job).await;
        }

        loop {
            let claimed_here = {
                let mut set = in_flight().lock().expect("in-flight set poisoned");
                if set.contains(&digest) {
                    false
                } else {
                    set.insert(digest.clone());
                    true
                }
            };

            if claimed_here {
                break;
            }

            if cached_path.exists() {
                debug!(%digest, "another task finished this download while we waited");
                return self.adopt_from_cache(&cached_path, &job).await;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        let result = self.download_and_cache(&job, &cached_path).await;
        in_flight().lock().expect("in-flight set poisoned").remove(&digest);
        result?;
        self.progress.complete_file();
        Ok(())
    }

    async fn adopt_from_cache(&self, cached_path: &std::path::Path, job: &FetchJob) -> Result<()> {
        let bytes = tokio::fs::copy(cached_path, &job.dest_path).await?;
        if let Some(line) = self.progress.add_progress(bytes) {
            info!("{line}");
        }
        self.progress.complete_file();
        Ok(())
    }

    /// Downloads straight into the cache (never a partial blob, per I1/§4.3),
    /// then copies the now-complete cache file into the staging path.
    async fn download_and_cache(&self, job: &FetchJob, cached_path: &std::path::Path) -> Result<()> {
        if let Some(parent) = cached_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        self.client
            .download_blob(
                self.reference,
                &job.layer.digest,
                &job.layer.media_type,
                self.token,
                cached_path,
                self.progress,
            )
            .await?;

        tokio::fs::copy(cached_path, &job.dest_path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HttpConfig;

    fn layer(digest: &str, size: i64) -> Layer {
        Layer {
            media_type: "application/octet-stream".to_string(),
            digest: digest.to_string(),
            size,
            annotations: None,
        }
    }

    #[tokio::test]
    async fn already_cached_layer_is_adopted_without_network() {
        let cache_root = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let reference = ImageReference::parse("trycua/macos-sequoia-vanilla:latest").unwrap();
        let manifest_id = ManifestId::from_digest("sha256:deadbeef");

        let cache = CacheStore::new(cache_root.path(), true);
        let image_dir = cache.prepare(&reference, &manifest_id).await.unwrap();

        let layer = layer("sha256:aaaa", 4);
        tokio::fs::write(cache.layer_path(&image_dir, &layer), b"data").await.unwrap();

        let client = RegistryClient::new(HttpConfig::default()).unwrap();
        let progress = ProgressTracker::new();
        let coordinator = DownloadCoordinator::new(
            &client,
            &cache,
            &reference,
            &manifest_id,
            image_dir.clone(),
            "unused-token",
            &progress,
            2,
        );

        let dest_path = staging.path().join("disk.img.part.1");
        coordinator
            .run(vec![FetchJob {
                layer,
                dest_path: dest_path.clone(),
            }])
            .await
            .unwrap();

        assert_eq!(tokio::fs::read(&dest_path).await.unwrap(), b"data");
    }
}
