use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinSet;

use crate::engine::cancel::CancelToken;
use crate::engine::cgroup::ControllerBuilder;
use crate::engine::cmd::{Cmd, ExecDefaults, PipeSpec, RunResult};
use crate::engine::container::ContainerBuilder;
use crate::engine::pipe;
use crate::engine::pool::Pool;
use crate::engine::single::{run_one, ExecContext};
use crate::engine::ticker::TimeLimitChecker;
use crate::filestore::FileStore;

/// Shared machinery a group run borrows from the worker.
#[derive(Clone)]
pub struct GroupEnv {
    pub containers: Arc<Pool<ContainerBuilder>>,
    pub controllers: Arc<Pool<ControllerBuilder>>,
    pub checker: Arc<TimeLimitChecker>,
    pub store: Arc<dyn FileStore>,
    pub defaults: ExecDefaults,
    pub extra_memory: u64,
}

/// Runs a group of commands wired by pipes. One container and one controller
/// are borrowed per command and returned on every termination path; results
/// preserve the input order.
pub async fn run_group(
    env: &GroupEnv,
    cancel: CancelToken,
    cmds: Vec<Cmd>,
    pipes: Vec<PipeSpec>,
) -> Result<Vec<RunResult>> {
    let cmds: Vec<Cmd> = cmds
        .into_iter()
        .map(|cmd| cmd.normalized(&env.defaults))
        .collect();
    let prepared = pipe::prepare(&cmds, &pipes, &env.store, &env.defaults)
        .await
        .context("prepare descriptors")?;

    let mut containers = Vec::with_capacity(cmds.len());
    let mut controllers = Vec::with_capacity(cmds.len());
    for _ in &cmds {
        match env.containers.acquire().await {
            Ok(container) => containers.push(container),
            Err(err) => {
                release_all(env, containers, controllers).await;
                return Err(err.context("acquire container"));
            }
        }
        match env.controllers.acquire().await {
            Ok(controller) => controllers.push(controller),
            Err(err) => {
                release_all(env, containers, controllers).await;
                return Err(err.context("acquire resource controller"));
            }
        }
    }

    let mut tasks = JoinSet::new();
    for (index, (cmd, prepared)) in cmds.iter().cloned().zip(prepared).enumerate() {
        let ctx = ExecContext {
            container: containers[index].clone(),
            controller: controllers[index].clone(),
            store: env.store.clone(),
            checker: env.checker.clone(),
            cancel: cancel.clone(),
            extra_memory: env.extra_memory,
        };
        tasks.spawn(async move { (index, run_one(&ctx, &cmd, prepared).await) });
    }

    let mut results: Vec<Option<RunResult>> = (0..cmds.len()).map(|_| None).collect();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, result)) => results[index] = Some(result),
            Err(err) => {
                tracing::error!(error = %err, "executor task failed");
                cancel.cancel();
            }
        }
    }

    release_all(env, containers, controllers).await;

    Ok(results
        .into_iter()
        .map(|slot| slot.unwrap_or_else(|| RunResult::internal_error("executor task failed")))
        .collect())
}

async fn release_all(
    env: &GroupEnv,
    containers: Vec<<ContainerBuilder as crate::engine::pool::ItemBuilder>::Item>,
    controllers: Vec<<ControllerBuilder as crate::engine::pool::ItemBuilder>::Item>,
) {
    for container in containers {
        env.containers.release(container).await;
    }
    for controller in controllers {
        env.controllers.release(controller).await;
    }
}
