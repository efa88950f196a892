//! Per-transfer throughput tracking. Observability only; nothing reads these back.

use std::time::{Duration, Instant};

use tracing::{debug, info};

const REPORT_EVERY: Duration = Duration::from_secs(1);
const MIB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone)]
pub struct TransferMetrics {
    pub transfer_id: String,
    pub bytes_transferred: u64,
    started: Instant,
    last_report: Instant,
}

impl TransferMetrics {
    pub fn start(label: &str) -> Self {
        let transfer_id = format!("{}-{}", label, &uuid::Uuid::new_v4().simple().to_string()[..8]);
        debug!(%transfer_id, "transfer started");
        let now = Instant::now();
        Self {
            transfer_id,
            bytes_transferred: 0,
            started: now,
            last_report: now,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// MB/s (MiB) since start; 0 before any time has passed.
    pub fn throughput(&self) -> f64 {
        throughput_mbps(self.bytes_transferred, self.elapsed())
    }

    /// Add `n` bytes; logs progress at most once per second.
    pub fn record(&mut self, n: u64, total: u64) {
        self.bytes_transferred += n;
        if self.last_report.elapsed() >= REPORT_EVERY {
            self.last_report = Instant::now();
            debug!(
                transfer_id = %self.transfer_id,
                bytes = self.bytes_transferred,
                total,
                percent = percent(self.bytes_transferred, total),
                mbps = round2(self.throughput()),
                "progress"
            );
        }
    }

    pub fn finish(&self) {
        info!(
            transfer_id = %self.transfer_id,
            bytes = self.bytes_transferred,
            secs = round2(self.elapsed().as_secs_f64()),
            mbps = round2(self.throughput()),
            "transfer finished"
        );
    }
}

pub fn throughput_mbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    bytes as f64 / secs / MIB
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done as f64 / total as f64) * 100.0).min(100.0) as u8
}
