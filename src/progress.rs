//! Thread-safe byte/file progress counter with smoothed speed and ETA (C6).
//!
//! A plain mutex around a small struct; the "actor" single-writer property
//! falls out of `lock -> update -> unlock`, per the design notes' guidance
//! on how to re-express actor-based counters.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const SPEED_SAMPLE_WINDOW: usize = 20;
const MIN_UPDATE_INTERVAL: Duration = Duration::from_millis(500);
const EMA_ALPHA: f64 = 0.3;

struct Inner {
    total_bytes: u64,
    total_files: u64,
    downloaded_bytes: u64,
    completed_files: u64,
    start_time: Instant,
    last_update_time: Instant,
    last_update_bytes: u64,
    speed_samples: VecDeque<f64>,
    smoothed_speed: f64,
    peak_speed: f64,
    emitted_first: bool,
}

pub struct ProgressTracker {
    inner: Mutex<Inner>,
}

#[derive(Debug, Clone, Copy)]
pub struct Stats {
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    pub elapsed: Duration,
    pub avg_speed: f64,
    pub peak_speed: f64,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            inner: Mutex::new(Inner {
                total_bytes: 0,
                total_files: 0,
                downloaded_bytes: 0,
                completed_files: 0,
                start_time: now,
                last_update_time: now,
                last_update_bytes: 0,
                speed_samples: VecDeque::with_capacity(SPEED_SAMPLE_WINDOW),
                smoothed_speed: 0.0,
                peak_speed: 0.0,
                emitted_first: false,
            }),
        }
    }

    pub fn set_total(&self, total_bytes: u64, total_files: u64) {
        let mut inner = self.inner.lock().expect("progress mutex poisoned");
        inner.total_bytes = total_bytes;
        inner.total_files = total_files;
    }

    /// Credits `delta` bytes and returns a formatted progress line when the
    /// rate limit allows an update (or this is the very first call).
    pub fn add_progress(&self, delta: u64) -> Option<String> {
        let mut inner = self.inner.lock().expect("progress mutex poisoned");
        inner.downloaded_bytes += delta;

        let now = Instant::now();
        let since_last = now.duration_since(inner.last_update_time);
        let is_first = !inner.emitted_first;
        let is_last = inner.total_bytes > 0 && inner.downloaded_bytes >= inner.total_bytes;

        if !is_first && !is_last && since_last < MIN_UPDATE_INTERVAL {
            return None;
        }

        let elapsed_secs = since_last.as_secs_f64().max(1e-6);
        let bytes_since = inner.downloaded_bytes.saturating_sub(inner.last_update_bytes);
        let instantaneous = bytes_since as f64 / elapsed_secs;

        if inner.speed_samples.len() == SPEED_SAMPLE_WINDOW {
            inner.speed_samples.pop_front();
        }
        inner.speed_samples.push_back(instantaneous);

        inner.smoothed_speed = if inner.smoothed_speed == 0.0 {
            instantaneous
        } else {
            EMA_ALPHA * instantaneous + (1.0 - EMA_ALPHA) * inner.smoothed_speed
        };
        inner.peak_speed = inner.peak_speed.max(inner.smoothed_speed);

        inner.last_update_time = now;
        inner.last_update_bytes = inner.downloaded_bytes;
        inner.emitted_first = true;

        Some(render_line(&inner))
    }

    pub fn complete_file(&self) {
        let mut inner = self.inner.lock().expect("progress mutex poisoned");
        inner.completed_files += 1;
    }

    /// Reverses bytes credited by a download attempt that was then discarded
    /// (a failed attempt retried from byte zero, §4.1 retry policy) so a
    /// retry never inflates `downloaded_bytes` past what actually landed on
    /// disk.
    pub fn retract(&self, delta: u64) {
        let mut inner = self.inner.lock().expect("progress mutex poisoned");
        inner.downloaded_bytes = inner.downloaded_bytes.saturating_sub(delta);
    }

    pub fn stats(&self) -> Stats {
        let inner = self.inner.lock().expect("progress mutex poisoned");
        Stats {
            total_bytes: inner.total_bytes,
            downloaded_bytes: inner.downloaded_bytes,
            elapsed: inner.start_time.elapsed(),
            avg_speed: average(&inner.speed_samples),
            peak_speed: inner.peak_speed,
        }
    }
}

fn average(samples: &VecDeque<f64>) -> f64 {
    if samples.is_empty() {
        0.0
    } else {
        samples.iter().sum::<f64>() / samples.len() as f64
    }
}

fn render_line(inner: &Inner) -> String {
    let percent = if inner.total_bytes > 0 {
        (inner.downloaded_bytes as f64 / inner.total_bytes as f64 * 100.0).min(100.0)
    } else {
        0.0
    };

    let bar_width = 30;
    let filled = ((percent / 100.0) * bar_width as f64).round() as usize;
    let bar: String = "=".repeat(filled) + &" ".repeat(bar_width.saturating_sub(filled));

    let weighted_recent_avg = average(&inner.speed_samples);
    let eta_speed = inner.smoothed_speed.max(0.8 * weighted_recent_avg).max(1.0);
    let remaining = inner.total_bytes.saturating_sub(inner.downloaded_bytes) as f64;
    let eta = Duration::from_secs_f64((remaining / eta_speed).max(0.0));

    format!(
        "[{bar}] {percent:5.1}% {downloaded}/{total} @ {speed}/s (avg {avg}/s, peak {peak}/s) ETA {eta}",
        downloaded = human_bytes(inner.downloaded_bytes),
        total = human_bytes(inner.total_bytes),
        speed = human_bytes(inner.smoothed_speed as u64),
        avg = human_bytes(weighted_recent_avg as u64),
        peak = human_bytes(inner.peak_speed as u64),
        eta = human_duration(eta),
    )
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1}{}", UNITS[unit])
}

fn human_duration(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}
