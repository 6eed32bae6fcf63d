use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use nix::libc;
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

use crate::engine::pool::{ItemBuilder, Recyclable};

/// Everything `execute` needs to start one child.
pub struct ExecParams {
    pub args: Vec<String>,
    pub env: Vec<String>,
    /// index = child fd
    pub fds: Vec<OwnedFd>,
    /// rlimit backstops; zero disables the corresponding limit
    pub cpu_hard_limit: Duration,
    pub stack_limit: u64,
    pub output_limit: u64,
    pub memory_limit: u64,
    pub proc_limit: u64,
    /// written with the child's own pid between fork and exec, so the
    /// resource controller owns the process before user code runs
    pub attach_handles: Vec<std::fs::File>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Exited(i32),
    Signalled(i32),
}

/// A spawned child: its own session/process group, killable as a unit.
pub struct Running {
    child: Child,
    pgid: Pid,
}

impl Running {
    pub fn pid(&self) -> u32 {
        self.pgid.as_raw() as u32
    }

    pub async fn wait(&mut self) -> Result<ExitKind> {
        let status = self.child.wait().await.context("wait for sandbox child")?;
        if let Some(code) = status.code() {
            Ok(ExitKind::Exited(code))
        } else {
            use std::os::unix::process::ExitStatusExt;
            Ok(ExitKind::Signalled(status.signal().unwrap_or(0)))
        }
    }

    pub fn kill_group(&self) {
        kill_group(self.pid());
    }
}

/// Kills an entire process group; the pid is the group id because children
/// call setsid before exec.
pub fn kill_group(pid: u32) {
    let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
}

/// A live sandbox: restricted filesystem view rooted at a scratch directory
/// plus an exec primitive. Implementations with real namespace isolation
/// plug in behind this trait.
#[async_trait]
pub trait Container: Send + Sync + 'static {
    fn work_dir(&self) -> &Path;

    /// Maps a path as the child sees it (`/w/...` or work-dir relative) to a
    /// host path, rejecting escapes.
    fn resolve(&self, path: &str) -> Result<PathBuf>;

    async fn open_read(&self, path: &str) -> Result<tokio::fs::File>;
    async fn open_create(&self, path: &str) -> Result<tokio::fs::File>;
    async fn execute(&self, params: ExecParams) -> Result<Running>;

    async fn reset(&self) -> Result<()>;
    async fn destroy(&self);
}

/// Host-process sandbox: children run under a wiped scratch directory in
/// their own session, confined by rlimits and the resource controller.
pub struct ProcessContainer {
    root: PathBuf,
}

impl ProcessContainer {
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)
            .with_context(|| format!("create container dir {}", root.display()))?;
        Ok(Self { root })
    }
}

#[async_trait]
impl Container for ProcessContainer {
    fn work_dir(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = if let Some(stripped) = path.strip_prefix("/w/") {
            stripped
        } else if path == "/w" {
            ""
        } else if path.starts_with('/') {
            bail!("path {path} is outside the container work dir");
        } else {
            path
        };
        let relative = Path::new(relative);
        if relative
            .components()
            .any(|component| matches!(component, Component::ParentDir))
        {
            bail!("path {path} escapes the container work dir");
        }
        Ok(self.root.join(relative))
    }

    async fn open_read(&self, path: &str) -> Result<tokio::fs::File> {
        let host = self.resolve(path)?;
        tokio::fs::File::open(&host)
            .await
            .with_context(|| format!("open {path}"))
    }

    async fn open_create(&self, path: &str) -> Result<tokio::fs::File> {
        let host = self.resolve(path)?;
        if let Some(parent) = host.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&host)
            .await
            .with_context(|| format!("create {path}"))
    }

    async fn execute(&self, params: ExecParams) -> Result<Running> {
        let Some((program, rest)) = params.args.split_first() else {
            bail!("empty argument vector");
        };

        let mut command = Command::new(program);
        command
            .args(rest)
            .env_clear()
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        for entry in &params.env {
            match entry.split_once('=') {
                Some((key, value)) => command.env(key, value),
                None => command.env(entry, ""),
            };
        }

        let raw_fds: Vec<RawFd> = params.fds.iter().map(|fd| fd.as_raw_fd()).collect();
        let attach_fds: Vec<RawFd> = params
            .attach_handles
            .iter()
            .map(|file| file.as_raw_fd())
            .collect();
        let cpu_secs = if params.cpu_hard_limit.is_zero() {
            0
        } else {
            params.cpu_hard_limit.as_secs() + 1
        };
        let stack = params.stack_limit;
        let fsize = params.output_limit;
        let address_space = params.memory_limit;
        let nproc = params.proc_limit;

        unsafe {
            command.pre_exec(move || {
                child_setup(&raw_fds, &attach_fds, cpu_secs, stack, fsize, address_space, nproc)
            });
        }

        let child = command
            .spawn()
            .with_context(|| format!("spawn {program}"))?;
        let pid = child
            .id()
            .ok_or_else(|| anyhow!("spawned child has no pid"))?;

        // parent-side copies of the child fds and attach handles are no
        // longer needed once the child is running
        drop(params.fds);
        drop(params.attach_handles);

        Ok(Running {
            child,
            pgid: Pid::from_raw(pid as i32),
        })
    }

    async fn reset(&self) -> Result<()> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            std::fs::remove_dir_all(&root)?;
            std::fs::create_dir_all(&root)
        })
        .await
        .context("reset container work dir")?
        .with_context(|| format!("wipe {}", self.root.display()))
    }

    async fn destroy(&self) {
        let root = self.root.clone();
        let _ = tokio::task::spawn_blocking(move || std::fs::remove_dir_all(root)).await;
    }
}

/// Runs between fork and exec; only async-signal-safe calls. New session,
/// descriptor table remap, rlimit backstops, then self-attach to the
/// controller's cgroups by writing into the pre-opened procs handles.
fn child_setup(
    fds: &[RawFd],
    attach_fds: &[RawFd],
    cpu_secs: u64,
    stack: u64,
    fsize: u64,
    address_space: u64,
    nproc: u64,
) -> std::io::Result<()> {
    unsafe {
        libc::setsid();
    }
    remap_fds(fds)?;

    if cpu_secs > 0 {
        set_limit(Resource::RLIMIT_CPU, cpu_secs)?;
    }
    if stack > 0 {
        set_limit(Resource::RLIMIT_STACK, stack)?;
    }
    if fsize > 0 {
        set_limit(Resource::RLIMIT_FSIZE, fsize)?;
    }
    if address_space > 0 {
        set_limit(Resource::RLIMIT_AS, address_space)?;
    }
    if nproc > 0 {
        set_limit(Resource::RLIMIT_NPROC, nproc)?;
    }

    for &fd in attach_fds {
        let written = unsafe { libc::write(fd, b"0".as_ptr().cast(), 1) };
        if written != 1 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

fn set_limit(resource: Resource, value: u64) -> std::io::Result<()> {
    setrlimit(resource, value, value)
        .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))
}

/// Moves every source fd above the target range, then dup2s each one onto
/// its slot. dup2 clears close-on-exec, so only the mapped copies survive
/// the exec.
fn remap_fds(fds: &[RawFd]) -> std::io::Result<()> {
    let floor = fds.len() as RawFd;
    let mut sources = Vec::with_capacity(fds.len());
    for &fd in fds {
        if fd < floor {
            let moved = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, floor) };
            if moved < 0 {
                return Err(std::io::Error::last_os_error());
            }
            sources.push(moved);
        } else {
            sources.push(fd);
        }
    }
    for (target, &source) in sources.iter().enumerate() {
        if unsafe { libc::dup2(source, target as RawFd) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Builds pooled containers under one scratch root.
pub struct ContainerBuilder {
    base: PathBuf,
    seq: AtomicU64,
}

impl ContainerBuilder {
    pub fn new(base: PathBuf) -> Self {
        Self {
            base,
            seq: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl ItemBuilder for ContainerBuilder {
    type Item = Arc<dyn Container>;

    async fn build(&self) -> Result<Arc<dyn Container>> {
        let seq = self.seq.fetch_add(1, Ordering::AcqRel);
        let root = self.base.join(format!("container-{seq}"));
        Ok(Arc::new(ProcessContainer::new(root)?))
    }
}

#[async_trait]
impl Recyclable for Arc<dyn Container> {
    async fn reset(&self) -> Result<()> {
        Container::reset(self.as_ref()).await
    }

    async fn destroy(&self) {
        Container::destroy(self.as_ref()).await;
    }
}
