//! End-to-end pull tests against a mock registry (A6).
//!
//! Exercises the orchestrator the way a real `ghcr.io` pull would, but with
//! `wiremock` standing in for the registry: token negotiation, manifest
//! fetch, and blob download all go over the wire to a loopback server.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use lz4_flex::frame::FrameEncoder;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use vm_image_puller::collaborators::{
    DefaultVmDirResolver, DiskConverter, FixedResourceHints, NullDiskConverter, Settings,
};
use vm_image_puller::config::PullConfig;
use vm_image_puller::orchestrator::PullOrchestrator;

struct TestSettings {
    cache_root: PathBuf,
}

impl Settings for TestSettings {
    fn cache_root(&self) -> PathBuf {
        self.cache_root.clone()
    }

    fn caching_enabled(&self) -> bool {
        true
    }
}

fn lz4_compress(data: &[u8]) -> Vec<u8> {
    use std::io::Write;
    let mut encoder = FrameEncoder::new(Vec::new());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn new_orchestrator(cache_root: PathBuf, vm_base: PathBuf) -> PullOrchestrator {
    let settings = TestSettings { cache_root };
    PullOrchestrator::new(
        &settings,
        Box::new(DefaultVmDirResolver::new(vm_base)),
        Box::new(FixedResourceHints::default()),
        Box::new(NullDiskConverter),
        PullConfig::default(),
    )
    .unwrap()
}

/// Registers the three registry endpoints a pull needs: token, manifest, and
/// one blob per layer. Returns the raw disk content the chunk decompresses to.
async fn mount_single_chunk_image(server: &MockServer) -> (String, Vec<u8>) {
    let config_body = json!({"disk_size": 0}).to_string().into_bytes();
    let disk_content = vec![7u8; 256 * 1024];
    let chunk_body = lz4_compress(&disk_content);

    Mock::given(method("GET"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "test-token"})))
        .mount(server)
        .await;

    let manifest = json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": "sha256:cfgcfgcfgcfgcfgcfgcfgcfgcfgcfgcfgcfgcfgcfgcfgcfgcfgcfgcfgcfgcfgc",
            "size": config_body.len() as i64,
            "annotations": {
                "com.trycua.lume.disk.uncompressed_size": disk_content.len().to_string()
            }
        },
        "layers": [{
            "mediaType": "application/octet-stream+lz4;part.number=1;part.total=1",
            "digest": "sha256:deadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef",
            "size": chunk_body.len() as i64
        }]
    });

    Mock::given(method("GET"))
        .and(path("/v2/testorg/testimage/manifests/latest"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Docker-Content-Digest", "sha256:manifestmanifestmanifestmanifestmanifestmanifestmanifestmanif")
                .set_body_json(manifest),
        )
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path(
            "/v2/testorg/testimage/blobs/sha256:cfgcfgcfgcfgcfgcfgcfgcfgcfgcfgcfgcfgcfgcfgcfgcfgcfgcfgcfgcfgcfgc",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(config_body.clone()))
        .expect(1)
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path(
            "/v2/testorg/testimage/blobs/sha256:deadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(chunk_body.clone()))
        .expect(1)
        .mount(server)
        .await;

    (format!("{}/testorg/testimage:latest", server.address()), disk_content)
}

#[tokio::test]
async fn pull_reassembles_single_chunk_disk() {
    let server = MockServer::start().await;
    let (image, disk_content) = mount_single_chunk_image(&server).await;

    let cache_dir = tempfile::tempdir().unwrap();
    let vm_base = tempfile::tempdir().unwrap();
    let orchestrator = new_orchestrator(cache_dir.path().to_path_buf(), vm_base.path().to_path_buf());

    let outcome = orchestrator.pull(&image, Some("vm1"), None).await.unwrap();

    let disk_path = outcome.vm_dir.join("disk.img");
    let written = tokio::fs::read(&disk_path).await.unwrap();
    assert_eq!(written, disk_content);
    assert!(outcome.vm_dir.join("config.json").exists());
    assert!(!outcome.vm_dir.join("nvram.bin").exists());
}

#[tokio::test]
async fn second_pull_of_same_manifest_reuses_cache() {
    let server = MockServer::start().await;
    let (image, disk_content) = mount_single_chunk_image(&server).await;

    let cache_dir = tempfile::tempdir().unwrap();
    let vm_base = tempfile::tempdir().unwrap();
    let orchestrator = new_orchestrator(cache_dir.path().to_path_buf(), vm_base.path().to_path_buf());

    let first = orchestrator.pull(&image, Some("vm1"), None).await.unwrap();
    let second = orchestrator.pull(&image, Some("vm1"), None).await.unwrap();

    // The `.expect(1)` on each blob Mock is checked when `server` drops at the
    // end of the test; reaching here with both pulls succeeding already
    // proves the second pull never re-requested a blob (P2).
    assert_eq!(
        tokio::fs::read(second.vm_dir.join("disk.img")).await.unwrap(),
        disk_content
    );
    assert_eq!(first.vm_dir, second.vm_dir);
}

#[tokio::test]
async fn pull_of_multi_part_image_without_size_fails() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "test-token"})))
        .mount(&server)
        .await;

    let manifest = json!({
        "schemaVersion": 2,
        "layers": [
            {
                "mediaType": "application/octet-stream+lz4;part.number=1;part.total=2",
                "digest": "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
                "size": 10
            },
            {
                "mediaType": "application/octet-stream+lz4;part.number=2;part.total=2",
                "digest": "sha256:bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb",
                "size": 10
            }
        ]
    });

    Mock::given(method("GET"))
        .and(path("/v2/testorg/noannotation/manifests/latest"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Docker-Content-Digest", "sha256:manifestnomanifestnomanifestnomanifestnomanifestnomanifestno")
                .set_body_json(manifest),
        )
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(
            "/v2/testorg/noannotation/blobs/sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(lz4_compress(b"0123456789")))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(
            "/v2/testorg/noannotation/blobs/sha256:bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(lz4_compress(b"0123456789")))
        .mount(&server)
        .await;

    let cache_dir = tempfile::tempdir().unwrap();
    let vm_base = tempfile::tempdir().unwrap();
    let orchestrator = new_orchestrator(cache_dir.path().to_path_buf(), vm_base.path().to_path_buf());

    let image = format!("{}/testorg/noannotation:latest", server.address());
    let result = orchestrator.pull(&image, Some("vm2"), None).await;

    assert!(matches!(result, Err(vm_image_puller::PullError::MissingUncompressedSize)));
    assert!(!vm_base.path().join("vm2").exists());
}

#[tokio::test]
async fn null_disk_converter_is_a_noop() {
    let converter = NullDiskConverter;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.img");
    tokio::fs::write(&path, b"data").await.unwrap();
    converter.convert(&path).await.unwrap();
    assert_eq!(tokio::fs::read(&path).await.unwrap(), b"data");
}

/// Responds with a transient 503 for the first `fail_count` requests, then a
/// 200 with `body` forever after (S6: a chunk that fails twice before
/// succeeding on the third attempt).
struct FlakyResponder {
    fail_count: u32,
    attempts: AtomicU32,
    body: Vec<u8>,
}

impl Respond for FlakyResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_count {
            ResponseTemplate::new(503)
        } else {
            ResponseTemplate::new(200).set_body_bytes(self.body.clone())
        }
    }
}

#[tokio::test]
async fn blob_download_retries_past_transient_failures() {
    let server = MockServer::start().await;

    let config_body = json!({"disk_size": 0}).to_string().into_bytes();
    let disk_content = vec![3u8; 64 * 1024];
    let chunk_body = lz4_compress(&disk_content);
    let chunk_body_len = chunk_body.len() as u64;

    Mock::given(method("GET"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "test-token"})))
        .mount(&server)
        .await;

    let manifest = json!({
        "schemaVersion": 2,
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": "sha256:cfgcfgcfgcfgcfgcfgcfgcfgcfgcfgcfgcfgcfgcfgcfgcfgcfgcfgcfgcfgcfgc",
            "size": config_body.len() as i64,
            "annotations": {
                "com.trycua.lume.disk.uncompressed_size": disk_content.len().to_string()
            }
        },
        "layers": [{
            "mediaType": "application/octet-stream+lz4;part.number=1;part.total=1",
            "digest": "sha256:deadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef",
            "size": chunk_body.len() as i64
        }]
    });

    Mock::given(method("GET"))
        .and(path("/v2/testorg/flaky/manifests/latest"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Docker-Content-Digest", "sha256:manifestflakymanifestflakymanifestflakymanifestflakyman")
                .set_body_json(manifest),
        )
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(
            "/v2/testorg/flaky/blobs/sha256:cfgcfgcfgcfgcfgcfgcfgcfgcfgcfgcfgcfgcfgcfgcfgcfgcfgcfgcfgcfgcfgc",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(config_body.clone()))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(
            "/v2/testorg/flaky/blobs/sha256:deadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef",
        ))
        .respond_with(FlakyResponder {
            fail_count: 2,
            attempts: AtomicU32::new(0),
            body: chunk_body,
        })
        .expect(3)
        .mount(&server)
        .await;

    let cache_dir = tempfile::tempdir().unwrap();
    let vm_base = tempfile::tempdir().unwrap();
    let orchestrator = new_orchestrator(cache_dir.path().to_path_buf(), vm_base.path().to_path_buf());

    let image = format!("{}/testorg/flaky:latest", server.address());
    let outcome = orchestrator.pull(&image, Some("vm3"), None).await.unwrap();

    let written = tokio::fs::read(outcome.vm_dir.join("disk.img")).await.unwrap();
    assert_eq!(written, disk_content);
    // Only the bytes actually retained from the network are credited; the
    // two failed attempts' partial credit must have been retracted rather
    // than inflating the running total.
    assert_eq!(outcome.stats.downloaded_bytes, config_body.len() as u64 + chunk_body_len);
}
