use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, ensure, Result};
use async_trait::async_trait;
use cgroups_rs::cgroup_builder::CgroupBuilder;
use cgroups_rs::cpu::CpuController;
use cgroups_rs::cpuacct::CpuAcctController;
use cgroups_rs::memory::MemController;
use cgroups_rs::pid::PidController;
use cgroups_rs::{Cgroup, CgroupPid, Controller, MaxValue};

use crate::engine::pool::{ItemBuilder, Recyclable};

/// Kernel-backed accountant for one job: caps memory/pids, measures
/// cumulative CPU time and high-water memory for every process attached.
pub trait ResourceController: Send + Sync + 'static {
    fn set_memory_limit(&self, bytes: u64) -> Result<()>;
    fn set_pid_limit(&self, limit: u64) -> Result<()>;
    /// Pre-opened handles the child writes itself into between fork and
    /// exec; empty when the controller attaches from the parent side only.
    fn attach_handles(&self) -> Result<Vec<File>>;
    fn attach(&self, pid: u32) -> Result<()>;
    fn cpu_time(&self) -> Result<Duration>;
    fn peak_memory(&self) -> Result<u64>;
    /// Whether the programmed limits are enforced kernel-side. When false the
    /// container arms rlimits as the backstop.
    fn kernel_enforced(&self) -> bool;
    fn reset(&self) -> Result<()>;
    fn destroy(&self);
}

pub struct CgroupController {
    name: String,
    cgroup: Cgroup,
    procs: Vec<PathBuf>,
}

impl CgroupController {
    pub fn new(name: String, enable_cpu_rate: bool, cpu_cfs_period_us: u64) -> Result<Self> {
        let hierarchy = cgroups_rs::hierarchies::auto();
        let has = |wanted: &str| {
            hierarchy
                .subsystems()
                .iter()
                .any(|subsystem| subsystem.controller_name() == wanted)
        };
        ensure!(
            has("cpuacct") && has("memory") && has("pids"),
            "cgroup subsystems cpuacct/memory/pids unavailable"
        );

        let root = hierarchy.root();
        let v2 = hierarchy.v2();
        let mut controllers = vec![
            "cpuacct".to_string(),
            "memory".to_string(),
            "pids".to_string(),
        ];
        if enable_cpu_rate && has("cpu") {
            controllers.push("cpu".to_string());
        }

        let cgroup = CgroupBuilder::new(&name)
            .set_specified_controllers(controllers.clone())
            .build(hierarchy)
            .map_err(|err| anyhow!("build cgroup {name}: {err}"))?;

        if enable_cpu_rate {
            if let Some(cpu) = cgroup.controller_of::<CpuController>() {
                cpu.set_cfs_period(cpu_cfs_period_us)
                    .map_err(|err| anyhow!("set cfs period: {err}"))?;
                // one full core per job
                cpu.set_cfs_quota(cpu_cfs_period_us as i64)
                    .map_err(|err| anyhow!("set cfs quota: {err}"))?;
            }
        }

        let procs = if v2 {
            vec![root.join(&name).join("cgroup.procs")]
        } else {
            controllers
                .iter()
                .map(|subsystem| root.join(subsystem).join(&name).join("cgroup.procs"))
                .collect()
        };

        Ok(Self {
            name,
            cgroup,
            procs,
        })
    }

    fn memory(&self) -> Result<&MemController> {
        self.cgroup
            .controller_of()
            .ok_or_else(|| anyhow!("memory controller missing"))
    }

    fn cpuacct(&self) -> Result<&CpuAcctController> {
        self.cgroup
            .controller_of()
            .ok_or_else(|| anyhow!("cpuacct controller missing"))
    }

    fn pids(&self) -> Result<&PidController> {
        self.cgroup
            .controller_of()
            .ok_or_else(|| anyhow!("pids controller missing"))
    }
}

impl ResourceController for CgroupController {
    fn set_memory_limit(&self, bytes: u64) -> Result<()> {
        let memory = self.memory()?;
        memory
            .set_limit(bytes as i64)
            .map_err(|err| anyhow!("set memory limit: {err}"))?;
        // swap accounting is not compiled into every kernel
        let _ = memory.set_memswap_limit(bytes as i64);
        Ok(())
    }

    fn set_pid_limit(&self, limit: u64) -> Result<()> {
        self.pids()?
            .set_pid_max(MaxValue::Value(limit as i64))
            .map_err(|err| anyhow!("set pid limit: {err}"))
    }

    fn attach_handles(&self) -> Result<Vec<File>> {
        let mut handles = Vec::with_capacity(self.procs.len());
        for path in &self.procs {
            let file = std::fs::OpenOptions::new()
                .write(true)
                .open(path)
                .map_err(|err| anyhow!("open {}: {err}", path.display()))?;
            handles.push(file);
        }
        Ok(handles)
    }

    fn attach(&self, pid: u32) -> Result<()> {
        let task = CgroupPid::from(pid as u64);
        self.cpuacct()?
            .add_task(&task)
            .map_err(|err| anyhow!("attach to cpuacct: {err}"))?;
        self.memory()?
            .add_task(&task)
            .map_err(|err| anyhow!("attach to memory: {err}"))?;
        self.pids()?
            .add_task(&task)
            .map_err(|err| anyhow!("attach to pids: {err}"))?;
        Ok(())
    }

    fn cpu_time(&self) -> Result<Duration> {
        Ok(Duration::from_nanos(self.cpuacct()?.cpuacct().usage))
    }

    fn peak_memory(&self) -> Result<u64> {
        Ok(self.memory()?.memory_stat().max_usage_in_bytes)
    }

    fn kernel_enforced(&self) -> bool {
        true
    }

    fn reset(&self) -> Result<()> {
        self.cpuacct()?
            .reset()
            .map_err(|err| anyhow!("reset cpuacct: {err}"))?;
        self.memory()?
            .reset_max_usage()
            .map_err(|err| anyhow!("reset memory max usage: {err}"))?;
        Ok(())
    }

    fn destroy(&self) {
        if let Err(err) = self.cgroup.delete() {
            tracing::warn!(cgroup = %self.name, error = %err, "delete cgroup failed");
        }
    }
}

/// Sampling fallback for hosts without a writable cgroup hierarchy: reads
/// `/proc/<pid>/stat` and `/proc/<pid>/status`, keeping high-water marks so
/// readback after exit still reports the last observation. Limits are then
/// enforced by the rlimits the container arms.
pub struct ProcController {
    pid: AtomicU64,
    cpu_ns: AtomicU64,
    peak_bytes: AtomicU64,
}

impl ProcController {
    pub fn new() -> Self {
        Self {
            pid: AtomicU64::new(0),
            cpu_ns: AtomicU64::new(0),
            peak_bytes: AtomicU64::new(0),
        }
    }

    fn sample(&self) {
        let pid = self.pid.load(Ordering::Acquire);
        if pid == 0 {
            return;
        }
        if let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            if let Some(ns) = parse_stat_cpu_ns(&stat) {
                self.cpu_ns.fetch_max(ns, Ordering::AcqRel);
            }
        }
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{pid}/status")) {
            if let Some(bytes) = parse_status_hwm_bytes(&status) {
                self.peak_bytes.fetch_max(bytes, Ordering::AcqRel);
            }
        }
    }
}

impl Default for ProcController {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceController for ProcController {
    fn set_memory_limit(&self, _bytes: u64) -> Result<()> {
        Ok(())
    }

    fn set_pid_limit(&self, _limit: u64) -> Result<()> {
        Ok(())
    }

    fn attach_handles(&self) -> Result<Vec<File>> {
        Ok(Vec::new())
    }

    fn attach(&self, pid: u32) -> Result<()> {
        self.pid.store(pid as u64, Ordering::Release);
        self.sample();
        Ok(())
    }

    fn cpu_time(&self) -> Result<Duration> {
        self.sample();
        Ok(Duration::from_nanos(self.cpu_ns.load(Ordering::Acquire)))
    }

    fn peak_memory(&self) -> Result<u64> {
        self.sample();
        Ok(self.peak_bytes.load(Ordering::Acquire))
    }

    fn kernel_enforced(&self) -> bool {
        false
    }

    fn reset(&self) -> Result<()> {
        self.pid.store(0, Ordering::Release);
        self.cpu_ns.store(0, Ordering::Release);
        self.peak_bytes.store(0, Ordering::Release);
        Ok(())
    }

    fn destroy(&self) {}
}

fn clock_ticks_per_second() -> u64 {
    nix::unistd::sysconf(nix::unistd::SysconfVar::CLK_TCK)
        .ok()
        .flatten()
        .map(|hz| hz as u64)
        .unwrap_or(100)
}

/// utime + stime out of `/proc/<pid>/stat`; the comm field may contain
/// spaces, so fields are counted from the closing parenthesis.
fn parse_stat_cpu_ns(stat: &str) -> Option<u64> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let utime: u64 = fields.nth(11)?.parse().ok()?;
    let stime: u64 = fields.next()?.parse().ok()?;
    Some((utime + stime) * (1_000_000_000 / clock_ticks_per_second()))
}

fn parse_status_hwm_bytes(status: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with("VmHWM:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

/// Builds controllers for the pool, probing once at startup whether the
/// cgroup hierarchy is usable and degrading to `ProcController` otherwise.
pub struct ControllerBuilder {
    prefix: String,
    enable_cpu_rate: bool,
    cpu_cfs_period_us: u64,
    cgroup_available: bool,
    seq: AtomicU64,
}

impl ControllerBuilder {
    pub fn new(prefix: impl Into<String>, enable_cpu_rate: bool, cpu_cfs_period_us: u64) -> Self {
        let prefix = prefix.into();
        let probe_name = format!("{prefix}/{prefix}-probe");
        let cgroup_available =
            match CgroupController::new(probe_name, enable_cpu_rate, cpu_cfs_period_us) {
                Ok(probe) => {
                    probe.destroy();
                    true
                }
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        "cgroup hierarchy unusable, falling back to /proc sampling"
                    );
                    false
                }
            };
        Self {
            prefix,
            enable_cpu_rate,
            cpu_cfs_period_us,
            cgroup_available,
            seq: AtomicU64::new(0),
        }
    }

    pub fn cgroup_available(&self) -> bool {
        self.cgroup_available
    }
}

#[async_trait]
impl ItemBuilder for ControllerBuilder {
    type Item = Arc<dyn ResourceController>;

    async fn build(&self) -> Result<Arc<dyn ResourceController>> {
        if !self.cgroup_available {
            return Ok(Arc::new(ProcController::new()));
        }
        let seq = self.seq.fetch_add(1, Ordering::AcqRel);
        let name = format!("{0}/{0}-{seq}", self.prefix);
        let enable_cpu_rate = self.enable_cpu_rate;
        let period = self.cpu_cfs_period_us;
        let controller = tokio::task::spawn_blocking(move || {
            CgroupController::new(name, enable_cpu_rate, period)
        })
        .await??;
        Ok(Arc::new(controller))
    }
}

#[async_trait]
impl Recyclable for Arc<dyn ResourceController> {
    async fn reset(&self) -> Result<()> {
        self.as_ref().reset()
    }

    async fn destroy(&self) {
        self.as_ref().destroy();
    }
}
