use std::sync::atomic::{AtomicU64, Ordering};

use crate::engine::status::Status;

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    submitted_total: AtomicU64,
    completed_total: AtomicU64,
    internal_error_total: AtomicU64,
    time_limit_total: AtomicU64,
    running: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submitted(&self) {
        self.submitted_total.fetch_add(1, Ordering::Relaxed);
        self.running.fetch_add(1, Ordering::Relaxed);
    }

    pub fn completed(&self, statuses: &[Status]) {
        self.completed_total.fetch_add(1, Ordering::Relaxed);
        self.running.fetch_sub(1, Ordering::Relaxed);
        for status in statuses {
            match status {
                Status::InternalError => {
                    self.internal_error_total.fetch_add(1, Ordering::Relaxed);
                }
                Status::TimeLimitExceeded => {
                    self.time_limit_total.fetch_add(1, Ordering::Relaxed);
                }
                _ => {}
            }
        }
    }

    pub fn failed(&self) {
        self.completed_total.fetch_add(1, Ordering::Relaxed);
        self.internal_error_total.fetch_add(1, Ordering::Relaxed);
        self.running.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn render_prometheus(&self) -> String {
        format!(
            concat!(
                "# TYPE sandbox_submitted_total counter\n",
                "sandbox_submitted_total {}\n",
                "# TYPE sandbox_completed_total counter\n",
                "sandbox_completed_total {}\n",
                "# TYPE sandbox_internal_error_total counter\n",
                "sandbox_internal_error_total {}\n",
                "# TYPE sandbox_time_limit_total counter\n",
                "sandbox_time_limit_total {}\n",
                "# TYPE sandbox_running gauge\n",
                "sandbox_running {}\n"
            ),
            self.submitted_total.load(Ordering::Relaxed),
            self.completed_total.load(Ordering::Relaxed),
            self.internal_error_total.load(Ordering::Relaxed),
            self.time_limit_total.load(Ordering::Relaxed),
            self.running.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_submissions() {
        let metrics = MetricsRegistry::new();
        metrics.submitted();
        metrics.completed(&[Status::Accepted, Status::TimeLimitExceeded]);

        let rendered = metrics.render_prometheus();
        assert!(rendered.contains("sandbox_submitted_total 1"));
        assert!(rendered.contains("sandbox_completed_total 1"));
        assert!(rendered.contains("sandbox_time_limit_total 1"));
        assert!(rendered.contains("sandbox_running 0"));
    }
}
