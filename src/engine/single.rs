use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use nix::sys::signal::Signal;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinSet;

use crate::engine::cancel::CancelToken;
use crate::engine::cgroup::ResourceController;
use crate::engine::cmd::{Cmd, RequestFile, RunResult};
use crate::engine::container::{self, Container, ExecParams, ExitKind};
use crate::engine::pipe::{self, Collected, PreparedCmd};
use crate::engine::status::{self, RawStatus, ResolveInput, Status};
use crate::engine::ticker::TimeLimitChecker;
use crate::filestore::FileStore;

/// Shared handles one command needs for its lifecycle.
pub struct ExecContext {
    pub container: Arc<dyn Container>,
    pub controller: Arc<dyn ResourceController>,
    pub store: Arc<dyn FileStore>,
    pub checker: Arc<TimeLimitChecker>,
    pub cancel: CancelToken,
    pub extra_memory: u64,
}

/// Runs one command to completion. Program-level failures are encoded in the
/// result; infrastructure failures cancel the sibling commands and surface
/// as `InternalError`.
pub async fn run_one(ctx: &ExecContext, cmd: &Cmd, prepared: PreparedCmd) -> RunResult {
    match run_inner(ctx, cmd, prepared).await {
        Ok(result) => result,
        Err(err) => {
            ctx.cancel.cancel();
            RunResult::internal_error(format!("{err:#}"))
        }
    }
}

async fn run_inner(ctx: &ExecContext, cmd: &Cmd, prepared: PreparedCmd) -> Result<RunResult> {
    let PreparedCmd {
        fds,
        feeds,
        collectors,
    } = prepared;

    if cmd.memory_limit > 0 {
        ctx.controller
            .set_memory_limit(cmd.memory_limit + ctx.extra_memory)
            .context("program memory limit")?;
    }
    if cmd.proc_limit > 0 {
        ctx.controller
            .set_pid_limit(cmd.proc_limit)
            .context("program pid limit")?;
    }

    if let Err(err) = copy_in(ctx, cmd).await {
        // nothing spawned yet; dropping the prepared ends closes every pipe
        drop(fds);
        return Ok(failure_result(Status::FileError, err));
    }

    // host-side transfers run alongside the child
    let mut collector_tasks: JoinSet<Collected> = JoinSet::new();
    for collector in collectors {
        collector_tasks.spawn(pipe::collect(collector));
    }
    let mut feed_tasks: JoinSet<()> = JoinSet::new();
    for feed in feeds {
        feed_tasks.spawn(pipe::feed(feed));
    }

    if ctx.cancel.is_cancelled() {
        drop(fds);
        join_set_shutdown(&mut feed_tasks, &mut collector_tasks).await;
        bail!("job cancelled before spawn");
    }

    let attach_handles = ctx
        .controller
        .attach_handles()
        .context("open controller attach handles")?;
    let pre_attached = !attach_handles.is_empty();

    let params = ExecParams {
        args: cmd.args.clone(),
        env: cmd.env.clone(),
        fds,
        cpu_hard_limit: cmd.cpu_hard_limit_duration(),
        stack_limit: cmd.stack_limit,
        output_limit: cmd.copy_out_max,
        memory_limit: if ctx.controller.kernel_enforced() || cmd.memory_limit == 0 {
            0
        } else {
            cmd.memory_limit + ctx.extra_memory
        },
        proc_limit: if ctx.controller.kernel_enforced() {
            0
        } else {
            cmd.proc_limit
        },
        attach_handles,
    };

    let mut running = match ctx.container.execute(params).await {
        Ok(running) => running,
        Err(err) => {
            join_set_shutdown(&mut feed_tasks, &mut collector_tasks).await;
            return Err(err.context("spawn child"));
        }
    };

    if !pre_attached {
        if let Err(err) = ctx.controller.attach(running.pid()) {
            running.kill_group();
            let _ = running.wait().await;
            join_set_shutdown(&mut feed_tasks, &mut collector_tasks).await;
            return Err(err.context("attach pid to controller"));
        }
    }

    // waiter: whichever of {exit, cpu tick, wall clock, cancel} fires first
    // wins; the rest only ever see an already-dead process group
    let hard_cpu = cmd.cpu_hard_limit_duration();
    let (guard, mut tle_rx) = if hard_cpu.is_zero() {
        (None, None)
    } else {
        let (guard, rx) = ctx.checker.watch(&ctx.controller, hard_cpu);
        (Some(guard), Some(rx))
    };
    let has_watch = tle_rx.is_some();
    let clock = cmd.clock_limit_duration();
    let wall_sleep = tokio::time::sleep(if clock.is_zero() {
        Duration::from_secs(86_400)
    } else {
        clock
    });
    tokio::pin!(wall_sleep);

    let child_pid = running.pid();
    let wall_start = Instant::now();
    let mut tle = false;
    let mut killed = false;
    let exit = loop {
        tokio::select! {
            reaped = running.wait() => break reaped.context("reap child")?,
            Ok(_) = async {
                tle_rx
                    .as_mut()
                    .expect("arm enabled only with a watch")
                    .wait_for(|fired| *fired)
                    .await
                    .map(|_| ())
            }, if has_watch && !killed => {
                tle = true;
                killed = true;
                container::kill_group(child_pid);
            }
            _ = &mut wall_sleep, if !killed => {
                tle = true;
                killed = true;
                container::kill_group(child_pid);
            }
            _ = ctx.cancel.cancelled(), if !killed => {
                killed = true;
                container::kill_group(child_pid);
            }
        }
    };
    let wall_time = wall_start.elapsed();
    drop(guard);

    // stragglers left in the process group would keep collector pipes open
    container::kill_group(child_pid);

    // collectors run until every write end is gone, which may include a
    // sibling still holding the far end of a shared pipe
    let mut outputs = Vec::new();
    while let Some(joined) = collector_tasks.join_next().await {
        outputs.push(joined.context("collector task")?);
    }
    while let Some(joined) = feed_tasks.join_next().await {
        joined.context("feed task")?;
    }

    let raw = match exit {
        ExitKind::Exited(0) => RawStatus::Normal,
        ExitKind::Exited(code) => RawStatus::NonzeroExit(code),
        ExitKind::Signalled(sig) => signal_raw(sig),
    };

    let collector_overflow = outputs.iter().any(|collected| collected.overflow);
    let mut files = BTreeMap::new();
    let mut file_ids = BTreeMap::new();
    let mut file_errors = Vec::new();

    for collected in outputs {
        files.insert(
            collected.name,
            String::from_utf8_lossy(&collected.bytes).into_owned(),
        );
    }
    for name in &cmd.copy_out {
        match read_copy_out(ctx.container.as_ref(), name, cmd.copy_out_max).await {
            Ok(bytes) => {
                files.insert(file_key(name), String::from_utf8_lossy(&bytes).into_owned());
            }
            Err(err) => file_errors.push(format!("{name}: {err:#}")),
        }
    }
    for name in &cmd.copy_out_cached {
        match read_copy_out(ctx.container.as_ref(), name, cmd.copy_out_max).await {
            Ok(bytes) => {
                let id = ctx
                    .store
                    .put(&file_key(name), Bytes::from(bytes))
                    .await
                    .context("cache copy-out file")?;
                file_ids.insert(file_key(name), id);
            }
            Err(err) => file_errors.push(format!("{name}: {err:#}")),
        }
    }
    if let Some(dir) = &cmd.copy_out_dir {
        if let Err(err) = copy_out_directory(ctx.container.as_ref(), dir).await {
            file_errors.push(format!("{}: {err:#}", dir.display()));
        }
    }

    // the controller, not the raw runner, is authoritative for usage
    let mut usage_read_failed = false;
    let mut usage_error = String::new();
    let cpu = ctx.controller.cpu_time().unwrap_or_else(|err| {
        usage_read_failed = true;
        usage_error = format!("read cpu time: {err:#}");
        Duration::ZERO
    });
    let memory = ctx.controller.peak_memory().unwrap_or_else(|err| {
        usage_read_failed = true;
        usage_error = format!("read peak memory: {err:#}");
        0
    });

    let status = status::resolve(&ResolveInput {
        raw,
        cpu,
        memory,
        cpu_limit: cmd.cpu_limit_duration(),
        memory_limit: cmd.memory_limit,
        tle,
        collector_overflow,
        file_error: !file_errors.is_empty(),
        usage_read_failed,
        strict: cmd.strict,
    });

    let error = if usage_read_failed {
        usage_error
    } else if !file_errors.is_empty() {
        file_errors.join("; ")
    } else {
        String::new()
    };

    Ok(RunResult {
        status,
        error,
        exit_status: raw.exit_status(),
        time: cpu.as_nanos() as u64,
        run_time: wall_time.as_nanos() as u64,
        memory,
        files,
        file_ids,
    })
}

/// Copies every prepared file into the container in parallel; the first
/// failure aborts the remaining transfers.
async fn copy_in(ctx: &ExecContext, cmd: &Cmd) -> Result<()> {
    if cmd.copy_in.is_empty() {
        return Ok(());
    }
    let mut tasks = JoinSet::new();
    for (path, file) in &cmd.copy_in {
        let container = ctx.container.clone();
        let store = ctx.store.clone();
        let path = path.clone();
        let file = file.clone();
        tasks.spawn(async move {
            let bytes = materialize(&store, &file)
                .await
                .with_context(|| format!("prepare {path}"))?;
            let mut dest = container.open_create(&path).await?;
            dest.write_all(&bytes)
                .await
                .with_context(|| format!("write {path}"))?;
            Ok::<_, anyhow::Error>(())
        });
    }
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tasks.shutdown().await;
                return Err(err);
            }
            Err(err) => {
                tasks.shutdown().await;
                return Err(anyhow!(err));
            }
        }
    }
    Ok(())
}

async fn materialize(store: &Arc<dyn FileStore>, file: &RequestFile) -> Result<Bytes> {
    match file {
        RequestFile::Memory { content } => Ok(Bytes::copy_from_slice(content.as_bytes())),
        RequestFile::Cached { file_id } => store
            .get(file_id)
            .await
            .map(|(_, bytes)| bytes)
            .with_context(|| format!("unknown file id {file_id}")),
        RequestFile::Local { src } => tokio::fs::read(src)
            .await
            .map(Bytes::from)
            .with_context(|| format!("read {}", src.display())),
        RequestFile::Collector { .. } => bail!("collector is not a copy-in source"),
    }
}

/// Copy-out sources must be regular files within the size cap; symlinks,
/// directories and devices are rejected.
async fn read_copy_out(container: &dyn Container, name: &str, max: u64) -> Result<Vec<u8>> {
    let path = container.resolve(name)?;
    let metadata = tokio::fs::symlink_metadata(&path)
        .await
        .context("stat file")?;
    if !metadata.is_file() {
        bail!("not a regular file");
    }
    if max > 0 && metadata.len() > max {
        bail!("size {} exceeds the {max} byte limit", metadata.len());
    }
    tokio::fs::read(&path).await.context("read file")
}

async fn copy_out_directory(container: &dyn Container, dest: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dest)
        .await
        .context("create copy-out dir")?;
    let mut entries = tokio::fs::read_dir(container.work_dir())
        .await
        .context("read work dir")?;
    while let Some(entry) = entries.next_entry().await.context("walk work dir")? {
        if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
            tokio::fs::copy(entry.path(), dest.join(entry.file_name()))
                .await
                .with_context(|| format!("copy {}", entry.path().display()))?;
        }
    }
    Ok(())
}

fn signal_raw(sig: i32) -> RawStatus {
    if sig == Signal::SIGXCPU as i32 {
        RawStatus::TimeLimitExceeded
    } else if sig == Signal::SIGXFSZ as i32 {
        RawStatus::OutputLimitExceeded
    } else if sig == Signal::SIGSYS as i32 {
        RawStatus::DisallowedSyscall
    } else {
        RawStatus::Signalled(sig)
    }
}

fn file_key(name: &str) -> String {
    Path::new(name)
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string())
}

fn failure_result(status: Status, err: anyhow::Error) -> RunResult {
    RunResult {
        status,
        error: format!("{err:#}"),
        ..RunResult::internal_error(String::new())
    }
}

async fn join_set_shutdown(feeds: &mut JoinSet<()>, collectors: &mut JoinSet<Collected>) {
    feeds.shutdown().await;
    collectors.shutdown().await;
}
