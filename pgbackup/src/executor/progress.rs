//! File and byte counters shared by copy workers.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Progress of one copy pass (backup, restore or catchup).
#[derive(Debug)]
pub struct CopyProgress {
    total_files: usize,
    total_bytes: u64,
    files_done: AtomicUsize,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    started: Instant,
}

impl CopyProgress {
    pub fn new(total_files: usize, total_bytes: u64) -> Self {
        Self {
            total_files,
            total_bytes,
            files_done: AtomicUsize::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    /// Record a processed file. Safe to call from any worker.
    pub fn file_done(&self, rel_path: &str, read: u64, written: u64) {
        let n = self.files_done.fetch_add(1, Ordering::Relaxed) + 1;
        self.bytes_read.fetch_add(read, Ordering::Relaxed);
        self.bytes_written.fetch_add(written, Ordering::Relaxed);
        debug!("Progress: ({}/{}). Process file \"{}\"", n, self.total_files, rel_path);
    }

    pub fn files_done(&self) -> usize {
        self.files_done.load(Ordering::Relaxed)
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Percentage of source bytes read (0-100).
    pub fn percent_complete(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        (self.bytes_read() as f64 / self.total_bytes as f64 * 100.0).min(100.0)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Average read speed since start
    pub fn average_speed(&self) -> u64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            (self.bytes_read() as f64 / elapsed) as u64
        } else {
            0
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "{} files, {} read, {} written in {} ({})",
            self.files_done(),
            format_bytes(self.bytes_read()),
            format_bytes(self.bytes_written()),
            format_duration(self.elapsed().as_secs()),
            format_speed(self.average_speed())
        )
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "kB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{}{}", bytes, UNITS[0])
    } else {
        format!("{:.0}{}", size, UNITS[unit_index])
    }
}

/// Format speed as human-readable string
pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

/// Format duration as human-readable string
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m:{}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h:{}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
