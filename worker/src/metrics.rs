use std::time::Duration;

use model::Metrics;

/// Counters a worker keeps over its whole training run.
#[derive(Debug, Default, Clone)]
pub struct WorkerMetrics {
    pub recv_time: Duration,
    pub compute_time: Duration,
    pub send_time: Duration,

    pub rounds_trained: u64,
    pub rounds_skipped: u64,

    /// Non-zero elements actually transmitted.
    pub sent_elements: u64,
    /// Elements the full parameter sets would have taken.
    pub total_elements: u64,

    /// The metrics the trainer reported in the last trained round.
    pub last_train_metrics: Metrics,
}

impl WorkerMetrics {
    #[inline]
    pub fn bump_trained(&mut self) {
        self.rounds_trained += 1;
    }

    #[inline]
    pub fn bump_skipped(&mut self) {
        self.rounds_skipped += 1;
    }

    #[inline]
    pub fn add_bandwidth(&mut self, sent: usize, total: usize) {
        self.sent_elements += sent as u64;
        self.total_elements += total as u64;
    }

    /// The share of elements transmitted, 1.0 if nothing was sent yet.
    pub fn bandwidth_ratio(&self) -> f64 {
        if self.total_elements == 0 {
            return 1.0;
        }

        self.sent_elements as f64 / self.total_elements as f64
    }
}
