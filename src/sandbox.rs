mod isolate_runner;
mod pool;
mod runner;
mod simple_runner;
mod truncator;

pub use isolate_runner::IsolateRunner;
pub use pool::{SlotGuard, SlotPool};
pub use runner::Sandbox;
pub use simple_runner::SimpleRunner;
pub use truncator::Truncator;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// `PATH` given to sandboxed commands that do not inherit the host environment
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Process ceiling used when a command is allowed to spawn helpers
pub const MULTIPROCESS_LIMIT: u32 = 1000;

/// How a sandboxed command terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitStatus {
    Ok,
    SandboxError,
    Timeout,
    TimeoutWall,
    MemoryLimitExceeded,
    Signal,
    NonzeroReturn,
}

impl ExitStatus {
    pub fn is_ok(&self) -> bool {
        *self == ExitStatus::Ok
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ExitStatus::Ok => "execution completed successfully",
            ExitStatus::SandboxError => "execution failed because of sandbox error",
            ExitStatus::Timeout => "execution timed out",
            ExitStatus::TimeoutWall => "execution timed out (wall clock limit exceeded)",
            ExitStatus::MemoryLimitExceeded => "memory limit exceeded",
            ExitStatus::Signal => "execution killed by signal",
            ExitStatus::NonzeroReturn => "execution failed because the return code was nonzero",
        };
        f.write_str(text)
    }
}

/// Where the standard error of a sandboxed command goes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StderrRedirect {
    #[default]
    Discard,
    File(PathBuf),
    MergeWithStdout,
}

/// Fully resolved configuration of one sandbox execution
///
/// Paths are relative to the sandbox root. Time limits are in milliseconds,
/// memory limits in bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxParams {
    pub chdir: Option<PathBuf>,
    pub mirror_dirs: Vec<PathBuf>,
    pub preserve_env: bool,
    pub set_env: BTreeMap<String, String>,
    pub stdin_file: Option<PathBuf>,
    pub stdout_file: Option<PathBuf>,
    pub stderr: StderrRedirect,
    pub timeout_ms: Option<u64>,
    pub wallclock_timeout_ms: Option<u64>,
    pub extra_timeout_ms: Option<u64>,
    pub memory_limit_bytes: Option<u64>,
    pub stack_limit_bytes: Option<u64>,
    pub fsize_kib: Option<u64>,
    pub max_processes: u32,
}

impl Default for SandboxParams {
    fn default() -> Self {
        Self {
            chdir: None,
            mirror_dirs: Vec::new(),
            preserve_env: false,
            set_env: BTreeMap::from([("HOME".to_string(), "./".to_string())]),
            stdin_file: None,
            stdout_file: None,
            stderr: StderrRedirect::Discard,
            timeout_ms: None,
            wallclock_timeout_ms: None,
            extra_timeout_ms: None,
            memory_limit_bytes: None,
            stack_limit_bytes: None,
            fsize_kib: None,
            max_processes: 1,
        }
    }
}

impl SandboxParams {
    pub fn set_multiprocess(&mut self, multiprocess: bool) {
        self.max_processes = if multiprocess { MULTIPROCESS_LIMIT } else { 1 };
    }

    /// CPU ceiling actually enforced, including the extra timeout
    pub fn hard_timeout_ms(&self) -> Option<u64> {
        self.timeout_ms.map(|t| t + self.extra_timeout_ms.unwrap_or(0))
    }

    /// Wall clock ceiling actually enforced, including the extra timeout
    pub fn hard_wallclock_timeout_ms(&self) -> Option<u64> {
        self.wallclock_timeout_ms.map(|t| t + self.extra_timeout_ms.unwrap_or(0))
    }
}

/// Result of one sandbox execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLog {
    pub exit_status: ExitStatus,
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub killing_signal: Option<i32>,
    pub time_ms: u64,
    pub wall_time_ms: u64,
    pub memory_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_absolute_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_absolute_path: Option<PathBuf>,
}

impl RunLog {
    pub fn sandbox_error(message: impl Into<String>) -> Self {
        Self {
            exit_status: ExitStatus::SandboxError,
            exit_code: -1,
            killing_signal: None,
            time_ms: 0,
            wall_time_ms: 0,
            memory_bytes: 0,
            message: Some(message.into()),
            stdout_absolute_path: None,
            stderr_absolute_path: None,
        }
    }

    /// Short summary such as `[0.123 sec - 1.50 MB]`
    pub fn stats(&self) -> String {
        format!(
            "[{:.3} sec - {:.2} MB]",
            self.time_ms as f64 / 1000.0,
            self.memory_bytes as f64 / (1024.0 * 1024.0)
        )
    }
}

/// Available isolation backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxKind {
    /// Ordinary process limits
    #[default]
    #[serde(alias = "stupid")]
    Process,
    /// External `isolate` binary
    Isolate,
}

impl FromStr for SandboxKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "process" | "stupid" => Ok(SandboxKind::Process),
            "isolate" => Ok(SandboxKind::Isolate),
            other => bail!("unknown sandbox backend `{other}`"),
        }
    }
}

impl SandboxKind {
    /// Time a run is charged against its time limit
    ///
    /// Process runs are charged the larger of CPU and wall clock time, so a
    /// program cannot hide blocked or sleeping time; isolate runs are charged
    /// CPU time.
    pub fn charged_time_ms(&self, run_log: &RunLog) -> u64 {
        match self {
            SandboxKind::Process => run_log.time_ms.max(run_log.wall_time_ms),
            SandboxKind::Isolate => run_log.time_ms,
        }
    }
}

impl fmt::Display for SandboxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxKind::Process => f.write_str("process"),
            SandboxKind::Isolate => f.write_str("isolate"),
        }
    }
}

/// Initializes a sandbox of the requested backend on execution slot `slot`
///
/// The process backend creates its root under `temp_dir`; the isolate backend
/// uses the box directory handed out by `isolate --init`.
pub fn create_sandbox(
    kind: SandboxKind,
    name: &str,
    slot: SlotGuard,
    temp_dir: &Path,
) -> Result<Box<dyn Sandbox>> {
    match kind {
        SandboxKind::Process => {
            log::debug!("Creating process sandbox `{name}` on slot {}", slot.id());
            Ok(Box::new(SimpleRunner::build(name, slot, temp_dir)?))
        }
        SandboxKind::Isolate => {
            log::debug!("Creating isolate sandbox `{name}` on slot {}", slot.id());
            Ok(Box::new(IsolateRunner::build(name, slot)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_params() {
        let params = SandboxParams::default();
        assert_eq!(params.max_processes, 1);
        assert!(!params.preserve_env);
        assert_eq!(params.set_env.get("HOME").map(String::as_str), Some("./"));
        assert_eq!(params.stderr, StderrRedirect::Discard);
    }

    #[test]
    fn test_multiprocess_toggle() {
        let mut params = SandboxParams::default();
        params.set_multiprocess(true);
        assert_eq!(params.max_processes, MULTIPROCESS_LIMIT);
        params.set_multiprocess(false);
        assert_eq!(params.max_processes, 1);
    }

    #[test]
    fn test_hard_limits_include_extra_timeout() {
        let params = SandboxParams {
            timeout_ms: Some(1000),
            wallclock_timeout_ms: Some(2000),
            extra_timeout_ms: Some(500),
            ..Default::default()
        };
        assert_eq!(params.hard_timeout_ms(), Some(1500));
        assert_eq!(params.hard_wallclock_timeout_ms(), Some(2500));
        assert_eq!(SandboxParams::default().hard_timeout_ms(), None);
    }

    #[test]
    fn test_run_log_stats() {
        let mut log = RunLog::sandbox_error("boom");
        log.time_ms = 123;
        log.memory_bytes = 3 * 512 * 1024;
        assert_eq!(log.stats(), "[0.123 sec - 1.50 MB]");
    }

    #[test]
    fn test_sandbox_kind_names() {
        assert_eq!("stupid".parse::<SandboxKind>().unwrap(), SandboxKind::Process);
        assert_eq!("isolate".parse::<SandboxKind>().unwrap(), SandboxKind::Isolate);
        assert!("docker".parse::<SandboxKind>().is_err());
        let kind: SandboxKind = serde_json::from_str(r#""stupid""#).unwrap();
        assert_eq!(kind, SandboxKind::Process);
    }
}
