//! Progress polling for transfers.

use super::FileTransfer;
use session_core::{classify_transfer, remaining_time_label, TransferStats, TransferStatus};
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Receives progress of a monitored transfer.
pub trait ProgressMonitor: Send + Sync {
    /// Whether the user asked to stop.
    fn is_cancelled(&self) -> bool;

    /// Percent points completed since the last call.
    fn worked(&self, delta: u32);

    /// Human-readable status line.
    fn sub_task(&self, label: &str);

    /// Raw statistics behind the last status line.
    fn stats(&self, _stats: &TransferStats) {}
}

/// Ignores all progress.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMonitor;

impl ProgressMonitor for NullMonitor {
    fn is_cancelled(&self) -> bool {
        false
    }

    fn worked(&self, _delta: u32) {}

    fn sub_task(&self, _label: &str) {}
}

/// Logs progress at debug level.
#[derive(Debug, Clone)]
pub struct TracingMonitor {
    name: String,
}

impl TracingMonitor {
    /// Create a monitor labelled `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl ProgressMonitor for TracingMonitor {
    fn is_cancelled(&self) -> bool {
        false
    }

    fn worked(&self, delta: u32) {
        debug!(transfer = %self.name, delta, "Transfer progress");
    }

    fn sub_task(&self, label: &str) {
        debug!(transfer = %self.name, "{label}");
    }
}

/// Poll `transfer` every `interval` until it is done.
///
/// Completion is checked before cancellation. While running, the monitor
/// receives the percent delta and a remaining-time label. A cancelled
/// monitor cancels the transfer and polling continues until the transfer
/// reports it stopped.
pub async fn monitor_transfer(
    transfer: &dyn FileTransfer,
    monitor: &dyn ProgressMonitor,
    interval: Duration,
) -> (TransferStatus, TransferStats) {
    let started = Instant::now();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut reported = 0u32;

    while !transfer.is_done() {
        if monitor.is_cancelled() {
            transfer.cancel();
            ticker.tick().await;
            continue;
        }

        let stats = TransferStats::compute(
            transfer.file_size(),
            transfer.amount_written(),
            started.elapsed(),
        );
        if stats.percent > reported {
            monitor.worked(stats.percent - reported);
            reported = stats.percent;
        }
        monitor.sub_task(&remaining_time_label(&stats));
        monitor.stats(&stats);
        ticker.tick().await;
    }

    let size = transfer.file_size();
    let written = transfer.amount_written();
    let stats = TransferStats::compute(size, written, started.elapsed());
    if stats.percent > reported {
        monitor.worked(stats.percent - reported);
    }
    monitor.stats(&stats);
    (classify_transfer(transfer.state(), size, written), stats)
}
