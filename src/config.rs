//! Network and pull-time tuning, constructed once by the orchestrator and
//! threaded through by reference — replaces the "global mutable configuration"
//! pattern the distilled source used for its HTTP client defaults.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Whole-resource timeout (covers retries for a single blob).
    pub resource_timeout: Duration,
    /// Max connections kept alive per host.
    pub pool_max_idle_per_host: usize,
    /// Max attempts for a single blob download.
    pub max_retry_attempts: u32,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            resource_timeout: Duration::from_secs(3600),
            pool_max_idle_per_host: 6,
            max_retry_attempts: 5,
        }
    }
}

impl HttpConfig {
    pub fn build_client(&self) -> reqwest::Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(self.request_timeout)
            .pool_max_idle_per_host(self.pool_max_idle_per_host)
            .tcp_keepalive(Duration::from_secs(60))
            .build()
    }
}

#[derive(Debug, Clone)]
pub struct PullConfig {
    pub http: HttpConfig,
    /// Lower/upper bound of the download concurrency window (§4.3).
    pub concurrency_bounds: (usize, usize),
    /// Whether to invoke the optional post-reassembly disk converter.
    pub convert_after_reassembly: bool,
    /// Minimum free disk space, beyond the image's own size, required before
    /// attempting the optional conversion step.
    pub convert_min_free_space: u64,
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            concurrency_bounds: (2, 12),
            convert_after_reassembly: false,
            convert_min_free_space: 2 * 1024 * 1024 * 1024,
        }
    }
}

impl PullConfig {
    /// Computes the bounded download concurrency window from resource hints (§4.3).
    pub fn compute_max_concurrent(&self, hints: &dyn crate::collaborators::ResourceHints) -> usize {
        let (lo, hi) = self.concurrency_bounds;
        let span = (hi - lo) as f64;
        let mut window = lo as f64 + span * hints.network_quality().clamp(0.0, 1.0);
        if hints.memory_pressure() {
            window /= 2.0;
        }
        (window.round() as usize).clamp(lo, hi)
    }
}
