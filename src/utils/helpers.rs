/// Helper utilities for the site-backup CLI

use chrono::NaiveDateTime;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::naming::TIMESTAMP_FORMAT;

/// Format bytes to human-readable size
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// Elapsed run time, to the second
pub fn format_elapsed(elapsed: Duration) -> String {
    humantime::format_duration(Duration::from_secs(elapsed.as_secs())).to_string()
}

/// Mask sensitive data (show only first and last N characters)
pub fn mask_sensitive(value: &str, visible_chars: usize) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= visible_chars * 2 {
        "*".repeat(chars.len())
    } else {
        let start: String = chars[..visible_chars].iter().collect();
        let end: String = chars[chars.len() - visible_chars..].iter().collect();
        format!("{}...{}", start, end)
    }
}

/// `out-<timestamp>.err.log`, written next to the config when a backup fails
pub fn error_log_file_name(started: NaiveDateTime) -> String {
    format!("out-{}.err.log", started.format(TIMESTAMP_FORMAT))
}

/// The error log sits in the parent of the work dir
pub fn error_log_path(work_dir: &Path, started: NaiveDateTime) -> PathBuf {
    work_dir
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(work_dir)
        .join(error_log_file_name(started))
}
