//! Narrow traits for the pieces this crate treats as external collaborators:
//! settings storage, VM directory layout, host resource probing, and the
//! optional post-reassembly disk-image converter. The orchestrator only ever
//! talks to these traits, never to a concrete settings file format or a real
//! `/proc/meminfo` reader — production hosts are expected to supply their own
//! implementations; the defaults here exist so the crate runs end to end.

use std::path::{Path, PathBuf};

use crate::error::Result;

/// Cache configuration a host application owns (where it lives, whether it's enabled).
pub trait Settings: Send + Sync {
    fn cache_root(&self) -> PathBuf;
    fn caching_enabled(&self) -> bool;
}

/// Resolves the on-disk VM directory for a given `name`/`image` pair.
pub trait VmDirResolver: Send + Sync {
    fn resolve(&self, name: Option<&str>, image: &str) -> PathBuf;
}

/// Hints about host conditions used to size the download concurrency window.
/// Real network/memory probing is explicitly out of scope for this crate;
/// hosts that care can implement this trait against `sysinfo` or similar.
pub trait ResourceHints: Send + Sync {
    /// Returns `true` when the host is memory-constrained and the download
    /// concurrency window should be halved.
    fn memory_pressure(&self) -> bool;

    /// A coarse 0.0-1.0 estimate of network quality; used to scale the
    /// concurrency window within its bounds.
    fn network_quality(&self) -> f64;
}

/// Optional post-reassembly conversion of the plain sparse `disk.img` into a
/// host-native sparse image format. Gated behind `PullConfig::convert_after_reassembly`.
#[async_trait::async_trait]
pub trait DiskConverter: Send + Sync {
    async fn convert(&self, disk_path: &Path) -> Result<()>;
}

/// Environment-backed [`Settings`]: `VM_IMAGE_CACHE_DIR` (default: a
/// `vm-image-puller/cache` directory under the OS cache dir) and
/// `VM_IMAGE_CACHE_DISABLE` (any non-empty value disables caching).
pub struct EnvSettings {
    cache_root: PathBuf,
    caching_enabled: bool,
}

impl EnvSettings {
    pub fn from_env() -> Self {
        let cache_root = std::env::var_os("VM_IMAGE_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("vm-image-puller").join("cache"));
        let caching_enabled = std::env::var_os("VM_IMAGE_CACHE_DISABLE").is_none();
        Self {
            cache_root,
            caching_enabled,
        }
    }
}

impl Settings for EnvSettings {
    fn cache_root(&self) -> PathBuf {
        self.cache_root.clone()
    }

    fn caching_enabled(&self) -> bool {
        self.caching_enabled
    }
}

/// Resolves `<base>/<name-or-sanitized-image>` under a configurable base directory.
pub struct DefaultVmDirResolver {
    base: PathBuf,
}

impl DefaultVmDirResolver {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }
}

impl VmDirResolver for DefaultVmDirResolver {
    fn resolve(&self, name: Option<&str>, image: &str) -> PathBuf {
        let dir_name = match name {
            Some(n) => n.to_string(),
            None => image.replace(['/', ':'], "_"),
        };
        self.base.join(dir_name)
    }
}

/// A fixed, conservative hint set: no memory pressure, mid-range network
/// quality. Stands in for real host probing.
pub struct FixedResourceHints {
    pub memory_pressure: bool,
    pub network_quality: f64,
}

impl Default for FixedResourceHints {
    fn default() -> Self {
        Self {
            memory_pressure: false,
            network_quality: 0.6,
        }
    }
}

impl ResourceHints for FixedResourceHints {
    fn memory_pressure(&self) -> bool {
        self.memory_pressure
    }

    fn network_quality(&self) -> f64 {
        self.network_quality
    }
}

/// Default converter: a no-op that always keeps the plain sparse file.
pub struct NullDiskConverter;

#[async_trait::async_trait]
impl DiskConverter for NullDiskConverter {
    async fn convert(&self, _disk_path: &Path) -> Result<()> {
        Ok(())
    }
}
