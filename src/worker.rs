use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::Semaphore;

use crate::engine::cancel::CancelToken;
use crate::engine::cgroup::ControllerBuilder;
use crate::engine::cmd::{ExecDefaults, ExecRequest, RunResult};
use crate::engine::container::ContainerBuilder;
use crate::engine::group::{run_group, GroupEnv};
use crate::engine::pipe;
use crate::engine::pool::Pool;
use crate::engine::ticker::TimeLimitChecker;
use crate::filestore::FileStore;
use crate::metrics::MetricsRegistry;

pub struct WorkerConfig {
    pub parallelism: usize,
    pub container_root: PathBuf,
    pub cgroup_prefix: String,
    pub enable_cpu_rate: bool,
    pub cpu_cfs_period_us: u64,
    pub tick_interval: Duration,
    pub extra_memory_limit: u64,
    pub defaults: ExecDefaults,
}

#[derive(Debug)]
pub enum SubmitError {
    ShuttingDown,
    Invalid(String),
    Internal(anyhow::Error),
}

/// Admission layer: bounds process-wide parallelism with a semaphore and
/// owns the pools, the tick clock and the metrics.
pub struct Worker {
    env: GroupEnv,
    semaphore: Arc<Semaphore>,
    parallelism: usize,
    metrics: Arc<MetricsRegistry>,
    closed: AtomicBool,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn FileStore>,
        metrics: Arc<MetricsRegistry>,
    ) -> Arc<Self> {
        let parallelism = config.parallelism.max(1);
        let checker = Arc::new(TimeLimitChecker::new());
        checker.start(config.tick_interval);
        let env = GroupEnv {
            containers: Arc::new(Pool::new(ContainerBuilder::new(config.container_root))),
            controllers: Arc::new(Pool::new(ControllerBuilder::new(
                config.cgroup_prefix,
                config.enable_cpu_rate,
                config.cpu_cfs_period_us,
            ))),
            checker,
            store,
            defaults: config.defaults,
            extra_memory: config.extra_memory_limit,
        };
        Arc::new(Self {
            env,
            semaphore: Arc::new(Semaphore::new(parallelism)),
            parallelism,
            metrics,
            closed: AtomicBool::new(false),
        })
    }

    pub async fn prefork(&self, n: usize) -> Result<()> {
        self.env.containers.prefork(n).await?;
        self.env.controllers.prefork(n).await
    }

    /// Runs one request to completion. The job itself executes in a detached
    /// task, so a caller that stops waiting cannot leak pool items.
    pub async fn submit(&self, request: ExecRequest) -> Result<Vec<RunResult>, SubmitError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SubmitError::ShuttingDown);
        }
        validate(&request).map_err(SubmitError::Invalid)?;

        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return Err(SubmitError::ShuttingDown),
        };
        self.metrics.submitted();

        let env = self.env.clone();
        let cancel = CancelToken::new();
        let job = tokio::spawn(async move {
            let result = run_group(&env, cancel, request.cmd, request.pipe_mapping).await;
            drop(permit);
            result
        });

        match job.await {
            Ok(Ok(results)) => {
                let statuses: Vec<_> = results.iter().map(|result| result.status).collect();
                self.metrics.completed(&statuses);
                Ok(results)
            }
            Ok(Err(err)) => {
                self.metrics.failed();
                Err(SubmitError::Internal(err))
            }
            Err(err) => {
                self.metrics.failed();
                Err(SubmitError::Internal(anyhow!("executor task panicked: {err}")))
            }
        }
    }

    /// Refuses new submissions, waits for in-flight jobs, then tears both
    /// pools down.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // holding every permit means every job has finished
        let _drain = self.semaphore.acquire_many(self.parallelism as u32).await;
        self.semaphore.close();
        self.env.containers.shutdown().await;
        self.env.controllers.shutdown().await;
    }

    pub fn store(&self) -> &Arc<dyn FileStore> {
        &self.env.store
    }

    /// Containers and controllers currently alive, for leak diagnostics.
    pub fn live_counts(&self) -> (usize, usize) {
        (
            self.env.containers.live_count(),
            self.env.controllers.live_count(),
        )
    }
}

fn validate(request: &ExecRequest) -> Result<(), String> {
    if request.cmd.is_empty() {
        return Err("no command provided".to_string());
    }
    for (index, cmd) in request.cmd.iter().enumerate() {
        if cmd.args.is_empty() {
            return Err(format!("command {index} has an empty argument vector"));
        }
    }
    pipe::validate_pipes(&request.cmd, &request.pipe_mapping).map_err(|err| err.to_string())
}
