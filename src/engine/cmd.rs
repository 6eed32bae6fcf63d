use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::status::Status;

/// One input source for a descriptor or a copy-in entry. The variants are
/// distinguished by their field names on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestFile {
    Local {
        src: PathBuf,
    },
    Memory {
        content: String,
    },
    Cached {
        #[serde(rename = "fileId")]
        file_id: String,
    },
    Collector {
        name: String,
        #[serde(default)]
        max: Option<u64>,
    },
}

/// The unit of execution. Descriptor index equals the child fd; `None` is a
/// pipe placeholder when referenced by a `PipeSpec` and a discard otherwise.
/// Times are nanoseconds, sizes bytes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Cmd {
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub files: Vec<Option<RequestFile>>,

    pub cpu_limit: u64,
    pub cpu_hard_limit: u64,
    pub clock_limit: u64,
    pub memory_limit: u64,
    pub stack_limit: u64,
    pub proc_limit: u64,
    pub copy_out_max: u64,
    pub strict: bool,

    pub copy_in: BTreeMap<String, RequestFile>,
    pub copy_out: Vec<String>,
    pub copy_out_cached: Vec<String>,
    pub copy_out_dir: Option<PathBuf>,
}

/// Process-wide fallbacks applied to fields a request leaves at zero.
#[derive(Debug, Clone, Copy)]
pub struct ExecDefaults {
    pub output_limit: u64,
    pub copy_out_limit: u64,
}

impl Cmd {
    /// Fills derived limits: the hard CPU cap defaults to the reporting cap,
    /// the wall clock to twice the CPU limit, the stack to the memory limit,
    /// and the per-file copy-out cap to the configured default.
    pub fn normalized(mut self, defaults: &ExecDefaults) -> Self {
        if self.cpu_hard_limit == 0 {
            self.cpu_hard_limit = self.cpu_limit;
        }
        if self.clock_limit == 0 && self.cpu_limit > 0 {
            self.clock_limit = self.cpu_limit.saturating_mul(2);
        }
        if self.stack_limit == 0 {
            self.stack_limit = self.memory_limit;
        }
        if self.copy_out_max == 0 {
            self.copy_out_max = defaults.copy_out_limit;
        }
        self
    }

    pub fn cpu_limit_duration(&self) -> Duration {
        Duration::from_nanos(self.cpu_limit)
    }

    pub fn cpu_hard_limit_duration(&self) -> Duration {
        Duration::from_nanos(self.cpu_hard_limit)
    }

    pub fn clock_limit_duration(&self) -> Duration {
        Duration::from_nanos(self.clock_limit)
    }
}

/// A pipe between two distinct commands of one group: bytes flow from
/// `(fromIndex, fromFd)` to `(toIndex, toFd)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipeSpec {
    pub from_index: usize,
    pub from_fd: usize,
    pub to_index: usize,
    pub to_fd: usize,
}

/// One `/run` request: commands plus the pipes wiring them together.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecRequest {
    pub cmd: Vec<Cmd>,
    pub pipe_mapping: Vec<PipeSpec>,
}

/// Outcome of one command. `time` is CPU time and `run_time` wall time, both
/// in nanoseconds; `exit_status` carries the exit code or the signal number.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub status: Status,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub exit_status: i32,
    pub time: u64,
    pub run_time: u64,
    pub memory: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub file_ids: BTreeMap<String, String>,
}

impl RunResult {
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self {
            status: Status::InternalError,
            error: message.into(),
            exit_status: 0,
            time: 0,
            run_time: 0,
            memory: 0,
            files: BTreeMap::new(),
            file_ids: BTreeMap::new(),
        }
    }
}
