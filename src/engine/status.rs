use std::fmt::{Display, Formatter};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Final verdict for a single command. `WrongAnswer` exists for callers that
/// post-process results; the engine itself never produces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Accepted,
    WrongAnswer,
    MemoryLimitExceeded,
    TimeLimitExceeded,
    OutputLimitExceeded,
    FileError,
    NonzeroExit,
    Signalled,
    DangerousSyscall,
    InternalError,
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Accepted => "accepted",
            Status::WrongAnswer => "wrong answer",
            Status::MemoryLimitExceeded => "memory limit exceeded",
            Status::TimeLimitExceeded => "time limit exceeded",
            Status::OutputLimitExceeded => "output limit exceeded",
            Status::FileError => "file error",
            Status::NonzeroExit => "nonzero exit status",
            Status::Signalled => "signalled",
            Status::DangerousSyscall => "dangerous syscall",
            Status::InternalError => "internal error",
        };
        write!(f, "{s}")
    }
}

/// Raw container-level outcome, before usage and limit checks are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawStatus {
    Normal,
    NonzeroExit(i32),
    Signalled(i32),
    MemoryLimitExceeded,
    TimeLimitExceeded,
    OutputLimitExceeded,
    DisallowedSyscall,
    Failed,
}

impl RawStatus {
    pub fn exit_status(&self) -> i32 {
        match *self {
            RawStatus::NonzeroExit(code) => code,
            RawStatus::Signalled(sig) => sig,
            _ => 0,
        }
    }
}

/// Everything the mapper needs to compose the final status.
#[derive(Debug, Clone, Copy)]
pub struct ResolveInput {
    pub raw: RawStatus,
    pub cpu: Duration,
    pub memory: u64,
    pub cpu_limit: Duration,
    pub memory_limit: u64,
    pub tle: bool,
    pub collector_overflow: bool,
    pub file_error: bool,
    pub usage_read_failed: bool,
    pub strict: bool,
}

fn rank(status: Status) -> u8 {
    match status {
        Status::Accepted => 0,
        Status::WrongAnswer => 1,
        Status::NonzeroExit | Status::Signalled => 2,
        Status::MemoryLimitExceeded => 3,
        Status::TimeLimitExceeded => 4,
        Status::OutputLimitExceeded => 5,
        Status::DangerousSyscall => 6,
        Status::FileError => 7,
        Status::InternalError => 8,
    }
}

fn upgrade(current: &mut Status, candidate: Status) {
    if rank(candidate) > rank(*current) {
        *current = candidate;
    }
}

/// Pure mapping from raw outcome plus measured usage to the final status.
/// Overrides only ever move up the precedence order, so a harsher verdict is
/// never replaced by a milder one.
pub fn resolve(input: &ResolveInput) -> Status {
    let mut status = match input.raw {
        RawStatus::Normal => Status::Accepted,
        RawStatus::NonzeroExit(_) => Status::NonzeroExit,
        RawStatus::Signalled(_) => Status::Signalled,
        RawStatus::MemoryLimitExceeded => Status::MemoryLimitExceeded,
        RawStatus::TimeLimitExceeded => Status::TimeLimitExceeded,
        RawStatus::OutputLimitExceeded => Status::OutputLimitExceeded,
        RawStatus::DisallowedSyscall => Status::DangerousSyscall,
        RawStatus::Failed => Status::InternalError,
    };

    if input.memory_limit > 0 && input.memory > input.memory_limit {
        upgrade(&mut status, Status::MemoryLimitExceeded);
    }
    if input.tle {
        upgrade(&mut status, Status::TimeLimitExceeded);
    }
    if input.collector_overflow {
        upgrade(&mut status, Status::OutputLimitExceeded);
    }
    if input.strict {
        if !input.cpu_limit.is_zero() && input.cpu > input.cpu_limit {
            upgrade(&mut status, Status::TimeLimitExceeded);
        }
        if input.file_error {
            upgrade(&mut status, Status::FileError);
        }
    }
    if input.usage_read_failed {
        upgrade(&mut status, Status::InternalError);
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(raw: RawStatus) -> ResolveInput {
        ResolveInput {
            raw,
            cpu: Duration::ZERO,
            memory: 0,
            cpu_limit: Duration::from_secs(1),
            memory_limit: 256 << 20,
            tle: false,
            collector_overflow: false,
            file_error: false,
            usage_read_failed: false,
            strict: false,
        }
    }

    const RAWS: [RawStatus; 8] = [
        RawStatus::Normal,
        RawStatus::NonzeroExit(1),
        RawStatus::Signalled(11),
        RawStatus::MemoryLimitExceeded,
        RawStatus::TimeLimitExceeded,
        RawStatus::OutputLimitExceeded,
        RawStatus::DisallowedSyscall,
        RawStatus::Failed,
    ];

    #[test]
    fn base_mapping() {
        assert_eq!(resolve(&base(RawStatus::Normal)), Status::Accepted);
        assert_eq!(resolve(&base(RawStatus::NonzeroExit(2))), Status::NonzeroExit);
        assert_eq!(resolve(&base(RawStatus::Signalled(9))), Status::Signalled);
        assert_eq!(
            resolve(&base(RawStatus::MemoryLimitExceeded)),
            Status::MemoryLimitExceeded
        );
        assert_eq!(
            resolve(&base(RawStatus::TimeLimitExceeded)),
            Status::TimeLimitExceeded
        );
        assert_eq!(
            resolve(&base(RawStatus::OutputLimitExceeded)),
            Status::OutputLimitExceeded
        );
        assert_eq!(
            resolve(&base(RawStatus::DisallowedSyscall)),
            Status::DangerousSyscall
        );
        assert_eq!(resolve(&base(RawStatus::Failed)), Status::InternalError);
    }

    #[test]
    fn tle_flag_overrides_accepted_and_runtime_error() {
        for raw in [RawStatus::Normal, RawStatus::NonzeroExit(1), RawStatus::Signalled(9)] {
            let mut input = base(raw);
            input.tle = true;
            assert_eq!(resolve(&input), Status::TimeLimitExceeded);
        }
    }

    #[test]
    fn memory_overshoot_overrides_accepted_and_runtime_error() {
        for raw in [RawStatus::Normal, RawStatus::NonzeroExit(1)] {
            let mut input = base(raw);
            input.memory = input.memory_limit + 1;
            assert_eq!(resolve(&input), Status::MemoryLimitExceeded);
        }
        // but not a TLE verdict, which ranks higher
        let mut input = base(RawStatus::TimeLimitExceeded);
        input.memory = input.memory_limit + 1;
        assert_eq!(resolve(&input), Status::TimeLimitExceeded);
    }

    #[test]
    fn collector_overflow_overrides_accepted() {
        let mut input = base(RawStatus::Normal);
        input.collector_overflow = true;
        assert_eq!(resolve(&input), Status::OutputLimitExceeded);
    }

    #[test]
    fn usage_read_failure_overrides_everything() {
        for raw in RAWS {
            let mut input = base(raw);
            input.tle = true;
            input.collector_overflow = true;
            input.usage_read_failed = true;
            assert_eq!(resolve(&input), Status::InternalError);
        }
    }

    #[test]
    fn strict_upgrades_cpu_overshoot_and_file_errors() {
        let mut input = base(RawStatus::Normal);
        input.cpu = Duration::from_secs(2);
        assert_eq!(resolve(&input), Status::Accepted);
        input.strict = true;
        assert_eq!(resolve(&input), Status::TimeLimitExceeded);

        let mut input = base(RawStatus::Normal);
        input.file_error = true;
        assert_eq!(resolve(&input), Status::Accepted);
        input.strict = true;
        assert_eq!(resolve(&input), Status::FileError);
    }

    #[test]
    fn overrides_never_downgrade() {
        // every combination of override flags must produce a status ranking at
        // least as high as the plain raw mapping
        for raw in RAWS {
            let plain = resolve(&base(raw));
            for bits in 0u8..16 {
                let mut input = base(raw);
                input.tle = bits & 1 != 0;
                input.collector_overflow = bits & 2 != 0;
                input.usage_read_failed = bits & 4 != 0;
                if bits & 8 != 0 {
                    input.memory = input.memory_limit + 1;
                }
                let combined = resolve(&input);
                assert!(
                    rank(combined) >= rank(plain),
                    "raw {raw:?} bits {bits:#b}: {plain:?} -> {combined:?}"
                );
            }
        }
    }

    #[test]
    fn serializes_with_variant_names() {
        assert_eq!(
            serde_json::to_string(&Status::TimeLimitExceeded).unwrap(),
            "\"TimeLimitExceeded\""
        );
        assert_eq!(
            serde_json::from_str::<Status>("\"Accepted\"").unwrap(),
            Status::Accepted
        );
    }
}
