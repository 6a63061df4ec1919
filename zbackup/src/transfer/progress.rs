//! Byte-level progress reporting for backup runs.
//!
//! The executor reports through the [`Progress`] trait; the binary renders it
//! with an `indicatif` bar unless progress output is disabled.

use crate::utils::logger;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Receives progress events from a transfer
pub trait Progress: Send + Sync {
    /// Transfer of `total_files` files / `total_bytes` bytes is starting
    fn start(&self, total_files: usize, total_bytes: u64);

    /// A new file started copying
    fn next_file(&self, rel_path: &str);

    /// `bytes` more bytes were written
    fn add_bytes(&self, bytes: u64);

    fn finish(&self);
}

/// Discards all events
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl Progress for NoopProgress {
    fn start(&self, _total_files: usize, _total_bytes: u64) {}
    fn next_file(&self, _rel_path: &str) {}
    fn add_bytes(&self, _bytes: u64) {}
    fn finish(&self) {}
}

/// Terminal progress bar measured in bytes. Log lines printed while it is
/// active are written around it.
pub struct BarProgress {
    bar: ProgressBar,
    total_files: AtomicUsize,
    files_processed: AtomicUsize,
}

impl BarProgress {
    pub fn new() -> Self {
        let bar = ProgressBar::hidden();
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec} ETA {eta} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        Self {
            bar,
            total_files: AtomicUsize::new(0),
            files_processed: AtomicUsize::new(0),
        }
    }
}

impl Default for BarProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl Progress for BarProgress {
    fn start(&self, total_files: usize, total_bytes: u64) {
        self.total_files.store(total_files, Ordering::Relaxed);
        self.files_processed.store(0, Ordering::Relaxed);
        self.bar.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        self.bar.set_length(total_bytes);
        self.bar.set_position(0);
        self.bar.enable_steady_tick(Duration::from_millis(250));
        logger::set_console_bar(Some(self.bar.clone()));
    }

    fn next_file(&self, rel_path: &str) {
        let processed = self.files_processed.fetch_add(1, Ordering::Relaxed) + 1;
        let total = self.total_files.load(Ordering::Relaxed);
        self.bar.set_message(format!("[{}/{}] {}", processed, total, rel_path));
    }

    fn add_bytes(&self, bytes: u64) {
        self.bar.inc(bytes);
    }

    fn finish(&self) {
        logger::set_console_bar(None);
        self.bar.finish_and_clear();
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed as human-readable string
pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

/// Average speed over an elapsed duration
pub fn average_speed(bytes: u64, elapsed: Duration) -> u64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        (bytes as f64 / secs) as u64
    } else {
        0
    }
}
