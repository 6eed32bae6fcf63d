use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::engine::cgroup::ResourceController;

/// Process-wide CPU time-limit checker. Kernel CPU limits are second-grained
/// and say nothing about wall clock, so one background ticker samples every
/// live job's controller and fires its TLE signal at the hard cap.
pub struct TimeLimitChecker {
    jobs: Arc<DashMap<u64, JobWatch>>,
    seq: AtomicU64,
}

struct JobWatch {
    controller: Weak<dyn ResourceController>,
    limit: Duration,
    fired: watch::Sender<bool>,
}

impl TimeLimitChecker {
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(DashMap::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// Spawns the background ticker. The task holds only a weak handle, so it
    /// winds down together with the last checker reference.
    pub fn start(&self, interval: Duration) {
        let jobs = Arc::downgrade(&self.jobs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(jobs) = jobs.upgrade() else {
                    break;
                };
                scan(&jobs);
            }
        });
    }

    /// Registers a running job. The receiver flips to `true` once the
    /// controller reports CPU time at or above `limit`; dropping the guard
    /// deregisters.
    pub fn watch(
        &self,
        controller: &Arc<dyn ResourceController>,
        limit: Duration,
    ) -> (WatchGuard, watch::Receiver<bool>) {
        let (fired, rx) = watch::channel(false);
        let id = self.seq.fetch_add(1, Ordering::AcqRel);
        self.jobs.insert(
            id,
            JobWatch {
                controller: Arc::downgrade(controller),
                limit,
                fired,
            },
        );
        (
            WatchGuard {
                id,
                jobs: self.jobs.clone(),
            },
            rx,
        )
    }

    pub fn watched_jobs(&self) -> usize {
        self.jobs.len()
    }

    #[cfg(test)]
    fn scan_now(&self) {
        scan(&self.jobs);
    }
}

impl Default for TimeLimitChecker {
    fn default() -> Self {
        Self::new()
    }
}

fn scan(jobs: &DashMap<u64, JobWatch>) {
    jobs.retain(|_, job| {
        let Some(controller) = job.controller.upgrade() else {
            return false;
        };
        if let Ok(cpu) = controller.cpu_time() {
            if cpu >= job.limit {
                job.fired.send_replace(true);
            }
        }
        true
    });
}

pub struct WatchGuard {
    id: u64,
    jobs: Arc<DashMap<u64, JobWatch>>,
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.jobs.remove(&self.id);
    }
}
