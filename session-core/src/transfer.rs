//! Transfer status classification and throughput statistics.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::link::ChannelKind;

/// State reported by the channel carrying a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferState {
    /// Bytes are still moving.
    InProgress,
    /// The channel says it is done.
    Complete,
    /// One side cancelled.
    Cancelled,
    /// The receiver refused it.
    Refused,
    /// The channel failed.
    Error,
}

impl TransferState {
    /// Whether the transfer has stopped moving.
    pub fn is_done(&self) -> bool {
        !matches!(self, TransferState::InProgress)
    }
}

/// Outcome of a monitored transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    /// All declared bytes arrived.
    Ok,
    /// Cancelled, refused, or completed short.
    Cancel,
    /// The channel failed.
    Error,
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TransferStatus::Ok => "ok",
            TransferStatus::Cancel => "cancelled",
            TransferStatus::Error => "error",
        };
        f.write_str(text)
    }
}

/// Classify a finished transfer.
///
/// A completed transfer that wrote fewer bytes than declared counts as
/// cancelled; an error is an error regardless of bytes written.
pub fn classify_transfer(state: TransferState, file_size: u64, written: u64) -> TransferStatus {
    match state {
        TransferState::Complete if written < file_size => TransferStatus::Cancel,
        TransferState::Complete => TransferStatus::Ok,
        TransferState::Error => TransferStatus::Error,
        TransferState::Cancelled | TransferState::Refused | TransferState::InProgress => {
            TransferStatus::Cancel
        }
    }
}

/// Throughput snapshot of a running transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStats {
    /// Declared size.
    pub file_size: u64,
    /// Bytes written so far.
    pub written: u64,
    /// Whole percent done, 0..=100.
    pub percent: u32,
    /// Average rate since the start, 0 when unknown.
    pub bytes_per_second: u64,
    /// Estimated time left, `None` while the rate is unknown.
    pub remaining: Option<Duration>,
}

impl TransferStats {
    /// Compute statistics. A not-yet-started transfer (`written < 0` on
    /// some channels) should be passed as zero.
    pub fn compute(file_size: u64, written: u64, elapsed: Duration) -> Self {
        let percent = ((100 * written as u128) / file_size.max(1) as u128).min(100) as u32;
        let elapsed_ms = elapsed.as_millis();
        let bytes_per_second = if elapsed_ms > 0 {
            ((written as u128 * 1000) / elapsed_ms) as u64
        } else {
            0
        };
        let remaining = (bytes_per_second > 0).then(|| {
            Duration::from_secs(file_size.saturating_sub(written) / bytes_per_second)
        });
        Self {
            file_size,
            written,
            percent,
            bytes_per_second,
            remaining,
        }
    }
}

/// `"Remaining time: N/A"` or `"Remaining time: 1m 05s (12.0 KB/s)"`.
pub fn remaining_time_label(stats: &TransferStats) -> String {
    match stats.remaining {
        Some(remaining) if stats.bytes_per_second > 0 => format!(
            "Remaining time: {} ({}/s)",
            format_duration(remaining),
            format_bytes(stats.bytes_per_second)
        ),
        _ => "Remaining time: N/A".to_string(),
    }
}

/// Human-readable duration with second resolution.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m:02}m {s:02}s")
    } else if m > 0 {
        format!("{m}m {s:02}s")
    } else {
        format!("{s}s")
    }
}

/// Human-readable byte count (binary units).
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

/// The channel currently used towards a peer, with the statistics of the
/// last monitored transfer on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferMode {
    /// Negotiated channel kind.
    pub channel: ChannelKind,
    /// Last observed throughput.
    pub last_transfer: Option<TransferStats>,
}

impl TransferMode {
    /// A mode without statistics yet.
    pub fn new(channel: ChannelKind) -> Self {
        Self {
            channel,
            last_transfer: None,
        }
    }
}
