use std::collections::VecDeque;
use std::time::Instant;

use gantry_infra::net::DownloadEvent;

#[derive(Debug, Clone, Default)]
pub struct TransferSnapshot {
    /// Declared size of the transfer currently in flight, 0 when unknown.
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    pub speed_bps: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Folds raw [`DownloadEvent`]s into a throughput snapshot for display.
/// Speed is a moving average over the last few half-second windows.
pub struct ProgressTracker {
    total_bytes: u64,
    downloaded_bytes: u64,
    completed: u64,
    failed: u64,
    last_tick: Instant,
    bytes_since_last_tick: u64,
    speed_bps: u64,
    history: VecDeque<u64>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            total_bytes: 0,
            downloaded_bytes: 0,
            completed: 0,
            failed: 0,
            last_tick: Instant::now(),
            bytes_since_last_tick: 0,
            speed_bps: 0,
            history: VecDeque::new(),
        }
    }

    pub fn update(&mut self, event: DownloadEvent) {
        match event {
            DownloadEvent::Started { total_bytes } => {
                self.total_bytes = total_bytes;
                self.downloaded_bytes = 0;
            }
            DownloadEvent::Progress { bytes_delta } => {
                self.downloaded_bytes += bytes_delta;
                self.bytes_since_last_tick += bytes_delta;
            }
            DownloadEvent::Completed { success } => {
                if success {
                    self.completed += 1;
                } else {
                    self.failed += 1;
                }
            }
        }
    }

    pub fn snapshot(&mut self) -> TransferSnapshot {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_tick).as_secs_f64();

        if elapsed >= 0.5 {
            let current_bps = (self.bytes_since_last_tick as f64 / elapsed) as u64;
            self.history.push_back(current_bps);
            if self.history.len() > 5 {
                self.history.pop_front();
            }
            self.speed_bps =
                (self.history.iter().sum::<u64>() as f64 / self.history.len() as f64) as u64;
            self.last_tick = now;
            self.bytes_since_last_tick = 0;
        }

        TransferSnapshot {
            total_bytes: self.total_bytes,
            downloaded_bytes: self.downloaded_bytes,
            speed_bps: self.speed_bps,
            completed: self.completed,
            failed: self.failed,
        }
    }
}
