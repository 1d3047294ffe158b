//! Registry HTTP transport (C1): manifest fetch and resumable-with-retry blob download.

use std::path::Path;
use std::time::Duration;

use futures_util::StreamExt;
use rand::Rng;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::config::HttpConfig;
use crate::error::{PullError, Result};
use crate::oci::manifest::Manifest;
use crate::oci::reference::ImageReference;
use crate::progress::ProgressTracker;

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json";
const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";

#[derive(serde::Deserialize)]
struct TagsList {
    #[allow(dead_code)]
    name: String,
    tags: Vec<String>,
}

pub struct RegistryClient {
    http: reqwest::Client,
    config: HttpConfig,
}

impl RegistryClient {
    pub fn new(config: HttpConfig) -> Result<Self> {
        let http = config.build_client()?;
        Ok(Self { http, config })
    }

    /// `GET /v2/<repo>/tags/list` (§6). A 404 means the repository has no
    /// tags (or doesn't exist from the registry's point of view) and is
    /// treated as an empty list rather than an error.
    pub async fn list_tags(&self, reference: &ImageReference, token: &str) -> Result<Vec<String>> {
        let url = format!(
            "{}://{}/v2/{}/tags/list",
            reference.scheme(),
            reference.registry,
            reference.repository
        );

        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| manifest_failed(reference, e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(manifest_failed(reference, format!("registry returned {}", response.status())));
        }

        let body: TagsList = response
            .json()
            .await
            .map_err(|e| manifest_failed(reference, format!("invalid tags list response: {e}")))?;
        Ok(body.tags)
    }

    /// `GET /v2/<repo>/manifests/<tag>` (§4.1). Requires a non-empty
    /// `Docker-Content-Digest` response header.
    pub async fn get_manifest(
        &self,
        reference: &ImageReference,
        token: &str,
    ) -> Result<(Manifest, String)> {
        let url = format!(
            "{}://{}/v2/{}/manifests/{}",
            reference.scheme(),
            reference.registry,
            reference.repository,
            reference.tag
        );

        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .header("Accept", MANIFEST_ACCEPT)
            .send()
            .await
            .map_err(|e| manifest_failed(reference, e.to_string()))?;

        if !response.status().is_success() {
            return Err(manifest_failed(reference, format!("registry returned {}", response.status())));
        }

        let digest = response
            .headers()
            .get(DOCKER_CONTENT_DIGEST)
            .and_then(|v| v.to_str().ok())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or_else(|| manifest_failed(reference, "missing Docker-Content-Digest header".to_string()))?;

        let body = response.bytes().await.map_err(|e| manifest_failed(reference, e.to_string()))?;
        let manifest: Manifest =
            serde_json::from_slice(&body).map_err(|e| manifest_failed(reference, format!("unparseable manifest body: {e}")))?;

        Ok((manifest, digest))
    }

    /// Downloads a blob to `dest_path` with up to `max_retry_attempts` attempts
    /// and `attempt * 2 + uniform(0,1)` second backoff between them (§4.1).
    pub async fn download_blob(
        &self,
        reference: &ImageReference,
        digest: &str,
        media_type: &str,
        token: &str,
        dest_path: &Path,
        progress: &ProgressTracker,
    ) -> Result<()> {
        let mut last_error: Option<String> = None;

        for attempt in 1..=self.config.max_retry_attempts {
            match self.download_blob_once(reference, digest, media_type, token, dest_path, progress).await {
                Ok(()) => return Ok(()),
                Err((e, credited)) => {
                    warn!(%digest, attempt, error = %e, "blob download attempt failed");
                    progress.retract(credited);
                    last_error = Some(e);
                    if attempt < self.config.max_retry_attempts {
                        let jitter: f64 = rand::rng().random_range(0.0..1.0);
                        let backoff = Duration::from_secs_f64(attempt as f64 * 2.0 + jitter);
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        Err(PullError::LayerDownloadFailed {
            digest: digest.to_string(),
            reason: last_error.unwrap_or_else(|| "unknown error".to_string()),
        })
    }

    /// On failure, the `u64` alongside the error message is however many
    /// bytes this attempt already credited to `progress` before it failed,
    /// so the caller can retract them before retrying (§4.1 retry policy:
    /// a retried attempt restarts the blob from byte zero).
    async fn download_blob_once(
        &self,
        reference: &ImageReference,
        digest: &str,
        media_type: &str,
        token: &str,
        dest_path: &Path,
        progress: &ProgressTracker,
    ) -> std::result::Result<(), (String, u64)> {
        let url = format!(
            "{}://{}/v2/{}/blobs/{}",
            reference.scheme(),
            reference.registry,
            reference.repository,
            digest
        );

        let request = self
            .http
            .get(&url)
            .timeout(self.config.resource_timeout)
            .bearer_auth(token)
            .header("Accept", media_type);

        let response = request.send().await.map_err(|e| (e.to_string(), 0))?;
        if !response.status().is_success() {
            return Err((format!("registry returned {}", response.status()), 0));
        }

        let content_length = response.content_length();

        let tmp_path = dest_path.with_extension("part.download");
        if let Some(parent) = tmp_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| (e.to_string(), 0))?;
        }

        let mut file = tokio::fs::File::create(&tmp_path).await.map_err(|e| (e.to_string(), 0))?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        loop {
            let chunk = match stream.next().await {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => return Err((e.to_string(), written)),
                None => break,
            };
            if let Err(e) = file.write_all(&chunk).await {
                return Err((e.to_string(), written));
            }
            written += chunk.len() as u64;
            if let Some(line) = progress.add_progress(chunk.len() as u64) {
                info!("{line}");
            }
        }
        file.flush().await.map_err(|e| (e.to_string(), written))?;
        drop(file);

        if let Some(expected) = content_length {
            if expected != written {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err((format!("short read: expected {expected} bytes, got {written}"), written));
            }
        }

        tokio::fs::rename(&tmp_path, dest_path).await.map_err(|e| (e.to_string(), written))?;
        info!(%digest, bytes = written, "blob downloaded");
        Ok(())
    }
}

fn manifest_failed(reference: &ImageReference, reason: String) -> PullError {
    PullError::ManifestFetchFailed {
        repository: reference.repository.clone(),
        reference: reference.tag.clone(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn list_tags_returns_tags_on_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/testorg/testimage/tags/list"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "testorg/testimage",
                "tags": ["latest", "v1"]
            })))
            .mount(&server)
            .await;

        let client = RegistryClient::new(HttpConfig::default()).unwrap();
        let reference = ImageReference::parse(&format!("{}/testorg/testimage:latest", server.address())).unwrap();

        let tags = client.list_tags(&reference, "unused-token").await.unwrap();
        assert_eq!(tags, vec!["latest".to_string(), "v1".to_string()]);
    }

    #[tokio::test]
    async fn list_tags_treats_404_as_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/testorg/missing/tags/list"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = RegistryClient::new(HttpConfig::default()).unwrap();
        let reference = ImageReference::parse(&format!("{}/testorg/missing:latest", server.address())).unwrap();

        let tags = client.list_tags(&reference, "unused-token").await.unwrap();
        assert!(tags.is_empty());
    }
}
