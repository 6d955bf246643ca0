use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ErrorType;

/// Aggregate figures over every finished execution. Timeouts and
/// cancellations count as failures and are also broken out separately.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub total_tasks: u64,
    pub completed_count: u64,
    pub failed_count: u64,
    pub timeout_count: u64,
    pub cancelled_count: u64,
    pub total_duration_ms: f64,
    pub min_duration_ms: Option<f64>,
    pub max_duration_ms: Option<f64>,
    pub avg_duration_ms: f64,
    /// Snapshot values filled in by `get_stats`.
    pub running_tasks: usize,
    pub pending_tasks: usize,
}

impl ExecutionStats {
    pub(crate) fn record(&mut self, failure: Option<ErrorType>, duration: Duration) {
        let ms = duration.as_secs_f64() * 1000.0;

        self.total_tasks += 1;
        match failure {
            None => self.completed_count += 1,
            Some(kind) => {
                self.failed_count += 1;
                match kind {
                    ErrorType::Timeout => self.timeout_count += 1,
                    ErrorType::Cancelled => self.cancelled_count += 1,
                    ErrorType::ExecutionError => {}
                }
            }
        }

        self.total_duration_ms += ms;
        self.min_duration_ms = Some(self.min_duration_ms.map_or(ms, |m| m.min(ms)));
        self.max_duration_ms = Some(self.max_duration_ms.map_or(ms, |m| m.max(ms)));
        self.avg_duration_ms = self.total_duration_ms / self.total_tasks as f64;
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_tasks == 0 {
            0.0
        } else {
            self.completed_count as f64 / self.total_tasks as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_durations_and_outcomes() {
        let mut stats = ExecutionStats::default();
        stats.record(None, Duration::from_millis(10));
        stats.record(Some(ErrorType::Timeout), Duration::from_millis(30));
        stats.record(Some(ErrorType::ExecutionError), Duration::from_millis(20));

        assert_eq!(stats.total_tasks, 3);
        assert_eq!(stats.completed_count, 1);
        assert_eq!(stats.failed_count, 2);
        assert_eq!(stats.timeout_count, 1);
        assert_eq!(stats.cancelled_count, 0);
        assert_eq!(stats.min_duration_ms, Some(10.0));
        assert_eq!(stats.max_duration_ms, Some(30.0));
        assert!((stats.avg_duration_ms - 20.0).abs() < 1e-9);
        assert!((stats.success_rate() - 1.0 / 3.0).abs() < 1e-9);
    }
}
