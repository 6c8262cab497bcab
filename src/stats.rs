//! Download statistics types and human-readable formatting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Statistics for a single file download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStats {
    /// Bytes written to disk.
    pub size: u64,
    /// Time taken to download the file.
    pub elapsed: Duration,
    /// Average download speed in bytes per second.
    pub average_speed: u64,
    /// Peak download speed in bytes per second.
    pub peak_speed: u64,
}

/// Statistics for one download pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassStats {
    /// Targets fetched and written successfully.
    pub downloaded: usize,
    /// Targets skipped thanks to the cache or an unchanged remote.
    pub skipped: usize,
    /// Targets that failed.
    pub failed: usize,
    /// Targets abandoned because the pass was cancelled.
    pub cancelled: usize,
    /// Total bytes downloaded.
    pub total_bytes: u64,
    /// Total elapsed time for the pass.
    pub elapsed: Duration,
    /// True when the pass stopped on a fatal error.
    pub aborted: bool,
}

impl PassStats {
    /// Returns the number of targets that reached a final outcome.
    #[must_use]
    pub const fn finished(&self) -> usize {
        self.downloaded + self.skipped + self.failed
    }

    /// Returns the average download speed in bytes per second.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn average_speed(&self) -> u64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            (self.total_bytes as f64 / secs) as u64
        } else {
            0
        }
    }
}

/// Tracks per-file byte counts and speed while a body is streaming.
pub struct DownloadStatsTracker {
    start_time: Instant,
    downloaded: AtomicU64,
    peak_speed: AtomicU64,
}

impl Default for DownloadStatsTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl DownloadStatsTracker {
    /// Creates a new tracker starting now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            downloaded: AtomicU64::new(0),
            peak_speed: AtomicU64::new(0),
        }
    }

    /// Records downloaded bytes and returns the current speed (bytes/sec).
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn record_bytes(&self, bytes: u64) -> u64 {
        let total = self.downloaded.fetch_add(bytes, Ordering::Relaxed) + bytes;
        let secs = self.start_time.elapsed().as_secs_f64();
        if secs > 0.0 {
            let speed = (total as f64 / secs) as u64;
            self.peak_speed.fetch_max(speed, Ordering::Relaxed);
            speed
        } else {
            0
        }
    }

    /// Returns the number of bytes recorded so far.
    #[must_use]
    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    /// Converts this tracker into final file statistics.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn into_file_stats(self) -> FileStats {
        let elapsed = self.start_time.elapsed();
        let size = self.downloaded();
        let secs = elapsed.as_secs_f64();
        let average_speed = if secs > 0.0 {
            (size as f64 / secs) as u64
        } else {
            0
        };
        FileStats {
            size,
            elapsed,
            average_speed,
            peak_speed: self.peak_speed.load(Ordering::Relaxed),
        }
    }
}

/// Builder for accumulating pass statistics as outcomes arrive.
pub struct PassStatsBuilder {
    stats: PassStats,
    start_time: Instant,
}

impl Default for PassStatsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PassStatsBuilder {
    /// Creates a new builder starting now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            stats: PassStats::default(),
            start_time: Instant::now(),
        }
    }

    /// Records a completed file download.
    pub const fn add_download(&mut self, file_stats: &FileStats) {
        self.stats.downloaded += 1;
        self.stats.total_bytes += file_stats.size;
    }

    /// Records a skipped target.
    pub const fn add_skip(&mut self) {
        self.stats.skipped += 1;
    }

    /// Records a failed target.
    pub const fn add_failure(&mut self) {
        self.stats.failed += 1;
    }

    /// Records a target abandoned on cancellation.
    pub const fn add_cancelled(&mut self) {
        self.stats.cancelled += 1;
    }

    /// Marks the pass as stopped by a fatal error.
    pub const fn set_aborted(&mut self) {
        self.stats.aborted = true;
    }

    /// Builds the final pass statistics.
    #[must_use]
    pub fn build(mut self) -> PassStats {
        self.stats.elapsed = self.start_time.elapsed();
        self.stats
    }
}

/// Formats a byte count as a human-readable string (B, KB, MB, GB).
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Formats a duration as e.g. "5.0s", "1m 05s", "1h 01m 05s".
#[must_use]
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!(
            "{}h {:02}m {:02}s",
            secs / 3600,
            (secs % 3600) / 60,
            secs % 60
        )
    } else if secs >= 60 {
        format!("{}m {:02}s", secs / 60, secs % 60)
    } else {
        format!("{}.{:01}s", secs, d.subsec_millis() / 100)
    }
}
