use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::cmd::ExecDefaults;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_addr: SocketAddr,
    pub parallelism: usize,
    pub work_dir: Option<PathBuf>,
    pub time_limit_checker_interval: Duration,
    pub extra_memory_limit: u64,
    pub output_limit: u64,
    pub copy_out_limit: u64,
    pub pre_fork: usize,
    pub cgroup_prefix: String,
    pub enable_cpu_rate: bool,
    pub cpu_cfs_period_us: u64,
    pub auth_token: Option<String>,
    pub src_prefix: Option<PathBuf>,
    pub release: bool,
    pub silent: bool,
    pub enable_metrics: bool,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            http_addr: env_parse("HTTP_ADDR", SocketAddr::from(([0, 0, 0, 0], 5050))),
            parallelism: env_parse("PARALLELISM", 4usize),
            work_dir: env::var("WORK_DIR").ok().filter(|v| !v.is_empty()).map(PathBuf::from),
            time_limit_checker_interval: Duration::from_millis(env_parse(
                "TIME_LIMIT_CHECKER_INTERVAL_MS",
                100u64,
            )),
            extra_memory_limit: env_parse("EXTRA_MEMORY_LIMIT", 16u64 << 10),
            output_limit: env_parse("OUTPUT_LIMIT", 16u64 << 20),
            copy_out_limit: env_parse("COPY_OUT_LIMIT", 64u64 << 20),
            pre_fork: env_parse("PRE_FORK", 0usize),
            cgroup_prefix: env::var("CGROUP_PREFIX").unwrap_or_else(|_| "sandbox-engine".to_string()),
            enable_cpu_rate: env_parse("ENABLE_CPU_RATE", false),
            cpu_cfs_period_us: env_parse("CPU_CFS_PERIOD_US", 100_000u64),
            auth_token: env::var("AUTH_TOKEN").ok().filter(|v| !v.is_empty()),
            src_prefix: env::var("SRC_PREFIX").ok().filter(|v| !v.is_empty()).map(PathBuf::from),
            release: env_parse("RELEASE", false),
            silent: env_parse("SILENT", false),
            enable_metrics: env_parse("ENABLE_METRICS", true),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        }
    }

    pub fn exec_defaults(&self) -> ExecDefaults {
        ExecDefaults {
            output_limit: self.output_limit,
            copy_out_limit: self.copy_out_limit,
        }
    }

    /// Scratch root for container work dirs; kept beside the file store when
    /// one is configured.
    pub fn container_root(&self) -> PathBuf {
        match &self.work_dir {
            Some(dir) => dir.join("run"),
            None => env::temp_dir().join("sandbox-engine"),
        }
    }
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}
