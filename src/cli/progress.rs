//! Progress bars and summary reporting for CLI passes.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::download::{DownloadObserver, Target};
use crate::error::{Error, FailureReason};
use crate::model::LibraryStats;
use crate::stats::{FileStats, PassStats, format_bytes, format_duration};

const SEPARATOR: &str = "────────────────────────────────────────────────────────────";

/// Creates a progress bar for a single file download.
fn make_progress_bar(size: Option<u64>, name: &str) -> ProgressBar {
    let (bar, template) = match size {
        Some(size) => (
            ProgressBar::new(size),
            "{spinner:.cyan} [{bar:40.cyan/blue}] {bytes}/{total_bytes} @ {bytes_per_sec} - {msg}",
        ),
        None => (
            ProgressBar::no_length(),
            "{spinner:.cyan} {bytes} @ {bytes_per_sec} - {msg}",
        ),
    };
    if let Ok(style) = ProgressStyle::with_template(template) {
        bar.set_style(style.progress_chars("━━╌"));
    }
    bar.set_message(name.to_string());
    bar
}

/// Renders one bar per in-flight file; used for sequential passes.
pub struct BarObserver {
    progress: MultiProgress,
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl Default for BarObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl BarObserver {
    #[must_use]
    pub fn new() -> Self {
        Self {
            progress: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn take_bar(&self, target: &Target) -> Option<ProgressBar> {
        self.bars
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&target.url)
    }

    /// Clears any bars left behind by an interrupted pass.
    pub fn finish(&self) {
        for (_, bar) in self.bars.lock().unwrap_or_else(PoisonError::into_inner).drain() {
            bar.abandon();
        }
        let _ = self.progress.clear();
    }
}

impl DownloadObserver for BarObserver {
    fn on_start(&self, target: &Target, size: Option<u64>) {
        let bar = self.progress.add(make_progress_bar(size, target.name()));
        bar.enable_steady_tick(Duration::from_millis(250));
        self.bars
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(target.url.clone(), bar);
    }

    fn on_progress(&self, target: &Target, bytes_delta: u64, _speed: u64) {
        if let Some(bar) = self
            .bars
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&target.url)
        {
            bar.inc(bytes_delta);
        }
    }

    fn on_success(&self, target: &Target, stats: &FileStats) {
        if let Some(bar) = self.take_bar(target) {
            bar.finish_and_clear();
        }
        let _ = self.progress.println(format!(
            "  {} {} - {} in {} ({}/s avg, {}/s peak)",
            style("✓").green(),
            target.name(),
            format_bytes(stats.size),
            format_duration(stats.elapsed),
            format_bytes(stats.average_speed),
            format_bytes(stats.peak_speed),
        ));
    }

    fn on_skip(&self, target: &Target) {
        if let Some(bar) = self.take_bar(target) {
            bar.finish_and_clear();
        }
        let _ = self
            .progress
            .println(format!("  {} {} (unchanged)", style("=").dim(), target.name()));
    }

    fn on_failure(&self, target: &Target, reason: &FailureReason) {
        if let Some(bar) = self.take_bar(target) {
            bar.abandon();
        }
        let _ = self.progress.println(format!(
            "  {} {}: {reason}",
            style("✗").red(),
            target.name()
        ));
    }

    fn on_abort(&self, error: &Error) {
        let _ = self
            .progress
            .println(format!("{} {error}", style("Download aborted:").red().bold()));
    }
}

/// Logs one line per outcome; used for concurrent passes.
pub struct LogObserver;

impl DownloadObserver for LogObserver {
    fn on_success(&self, target: &Target, stats: &FileStats) {
        log::info!(
            "Downloaded {} ({}, {}/s)",
            target.dest.display(),
            format_bytes(stats.size),
            format_bytes(stats.average_speed)
        );
    }

    fn on_skip(&self, target: &Target) {
        log::debug!("Skipped {}", target.dest.display());
    }

    fn on_failure(&self, target: &Target, reason: &FailureReason) {
        log::warn!("Failed {}: {reason}", target.name());
    }

    fn on_abort(&self, error: &Error) {
        log::error!("Download pass aborted: {error}");
    }
}

/// Prints a summary of one download pass.
pub fn print_summary(stats: &PassStats) {
    println!("\n{SEPARATOR}");
    println!("{}", style("Download Summary").bold());
    println!("{SEPARATOR}");
    println!("  Files downloaded:  {}", stats.downloaded);
    if stats.downloaded > 0 {
        println!("  Total size:        {}", format_bytes(stats.total_bytes));
        println!(
            "  Average speed:     {}/s",
            format_bytes(stats.average_speed())
        );
    }
    println!("  Total time:        {}", format_duration(stats.elapsed));
    println!("  Files skipped:     {}", stats.skipped);
    if stats.failed > 0 {
        println!("  Files failed:      {}", style(stats.failed).red());
    }
    if stats.cancelled > 0 {
        println!("  Files cancelled:   {}", stats.cancelled);
    }
    if stats.aborted {
        println!("  {}", style("Pass aborted on a fatal error").red());
    }
    println!("{SEPARATOR}");
}

/// Prints library totals.
pub fn print_library_stats(stats: &LibraryStats) {
    println!("{SEPARATOR}");
    println!("{}", style("Library").bold());
    println!("{SEPARATOR}");
    println!("  Assets:            {}", stats.total);
    println!("  Downloaded:        {}", stats.downloaded);
    if let Some(on_disk) = stats.downloaded_on_disk {
        println!("  On disk:           {on_disk}");
    }
    println!("  Bundles:           {}", stats.bundles);
    println!("  Products:          {}", stats.products);
    println!("{SEPARATOR}");
}
