use std::fs;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use tempfile::TempDir;

use super::{DEFAULT_PATH, ExitStatus, RunLog, Sandbox, SandboxParams, SlotGuard, StderrRedirect};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A sandbox built from ordinary process limits
///
/// SimpleRunner enforces CPU time, data size, stack, file size and, for
/// single-process runs, the process count through `setrlimit` in the child.
/// Wall clock and the resident memory of the whole process group are
/// enforced by a watchdog polling the child. It offers no filesystem or permission isolation
/// beyond running inside its own temporary root.
pub struct SimpleRunner {
    name: String,
    slot: SlotGuard,
    root: PathBuf,
    root_dir: Option<TempDir>,
    exec_count: usize,
}

/// The kernel data segment cap is this multiple of the memory limit; the
/// watchdog kills at the limit itself
const DATA_LIMIT_FACTOR: u64 = 2;

/// Limits applied in the forked child before `exec`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ResourceLimits {
    cpu_secs: Option<u64>,
    data_bytes: Option<u64>,
    stack_bytes: Option<u64>,
    /// `RLIMIT_NPROC` counts every process of the user, not just this tree,
    /// so it is only set to forbid forking outright
    processes: Option<u64>,
    fsize_bytes: Option<u64>,
}

impl ResourceLimits {
    fn from_params(params: &SandboxParams) -> Self {
        Self {
            cpu_secs: params.hard_timeout_ms().map(|ms| ms.div_ceil(1000).max(1)),
            data_bytes: params
                .memory_limit_bytes
                .map(|bytes| bytes.saturating_mul(DATA_LIMIT_FACTOR)),
            stack_bytes: params.stack_limit_bytes,
            processes: (params.max_processes <= 1).then_some(1),
            fsize_bytes: params.fsize_kib.map(|kib| kib * 1024),
        }
    }

    /// Runs between fork and exec: only async-signal-safe calls allowed
    fn apply(&self) -> io::Result<()> {
        if let Some(secs) = self.cpu_secs {
            set_rlimit(libc::RLIMIT_CPU, secs, secs + 1)?;
        }
        if let Some(bytes) = self.data_bytes {
            set_rlimit(libc::RLIMIT_DATA, bytes, bytes)?;
        }
        if let Some(bytes) = self.stack_bytes {
            set_rlimit(libc::RLIMIT_STACK, bytes, bytes)?;
        }
        if let Some(processes) = self.processes {
            set_rlimit(libc::RLIMIT_NPROC, processes, processes)?;
        }
        if let Some(bytes) = self.fsize_bytes {
            set_rlimit(libc::RLIMIT_FSIZE, bytes, bytes)?;
        }
        Ok(())
    }
}

fn set_rlimit(resource: libc::__rlimit_resource_t, soft: u64, hard: u64) -> io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: soft as libc::rlim_t,
        rlim_max: hard as libc::rlim_t,
    };
    let rc = unsafe { libc::setrlimit(resource, &limit) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// What the watchdog saw of a finished process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Observation {
    cpu_ms: u64,
    wall_ms: u64,
    memory_bytes: u64,
    exit_code: i32,
    signal: Option<i32>,
    wall_killed: bool,
    memory_killed: bool,
}

/// Maps an observation to an exit status; the first matching condition wins
fn classify(obs: &Observation, params: &SandboxParams) -> ExitStatus {
    if params.timeout_ms.is_some_and(|limit| obs.cpu_ms > limit) {
        return ExitStatus::Timeout;
    }
    if obs.wall_killed
        || params
            .wallclock_timeout_ms
            .is_some_and(|limit| obs.wall_ms > limit)
    {
        return ExitStatus::TimeoutWall;
    }
    if obs.memory_killed
        || params
            .memory_limit_bytes
            .is_some_and(|limit| obs.memory_bytes > limit)
    {
        return ExitStatus::MemoryLimitExceeded;
    }
    if obs.signal.is_some() {
        return ExitStatus::Signal;
    }
    if obs.exit_code != 0 {
        return ExitStatus::NonzeroReturn;
    }
    ExitStatus::Ok
}

fn timeval_ms(tv: libc::timeval) -> u64 {
    tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000
}

/// Resident set size of `pid` in bytes, if it is still alive
fn resident_bytes(pid: libc::pid_t) -> Option<u64> {
    let status = fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    status.lines().find_map(|line| {
        let kib = line.strip_prefix("VmRSS:")?.trim().strip_suffix("kB")?;
        kib.trim().parse::<u64>().ok().map(|kib| kib * 1024)
    })
}

/// Process group of `pid`, read from `/proc/<pid>/stat`
fn process_group(pid: libc::pid_t) -> Option<libc::pid_t> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // state, ppid and pgrp follow the parenthesized command name
    let fields = &stat[stat.rfind(')')? + 1..];
    fields.split_whitespace().nth(2)?.parse().ok()
}

/// Summed resident set size of every live process in group `pgid`
fn group_resident_bytes(pgid: libc::pid_t) -> u64 {
    let Ok(entries) = fs::read_dir("/proc") else {
        return 0;
    };
    entries
        .filter_map(|entry| {
            let name = entry.ok()?.file_name();
            name.to_str()?.parse::<libc::pid_t>().ok()
        })
        .filter(|&pid| process_group(pid) == Some(pgid))
        .filter_map(resident_bytes)
        .sum()
}

fn kill_group(pgid: libc::pid_t) {
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
}

impl SimpleRunner {
    pub fn build(name: &str, slot: SlotGuard, temp_dir: &Path) -> Result<Self> {
        fs::create_dir_all(temp_dir)?;
        let prefix = format!("jbx-{}-", sanitize(name));
        let root_dir = tempfile::Builder::new()
            .prefix(&prefix)
            .tempdir_in(temp_dir)
            .with_context(|| format!("failed to create sandbox root in {}", temp_dir.display()))?;
        let root = root_dir.path().to_path_buf();

        log::debug!(
            "SimpleRunner `{name}` initialized at {} on slot {}",
            root.display(),
            slot.id()
        );

        Ok(Self {
            name: name.to_string(),
            slot,
            root,
            root_dir: Some(root_dir),
            exec_count: 0,
        })
    }

    fn open_redirects(&self, params: &SandboxParams) -> Result<(Stdio, Stdio, Stdio)> {
        let stdin = match &params.stdin_file {
            Some(path) => Stdio::from(self.get_file(path)?),
            None => Stdio::null(),
        };
        let stdout_file = match &params.stdout_file {
            Some(path) => Some(self.create_file(path, false)?),
            None => None,
        };
        let stderr = match &params.stderr {
            StderrRedirect::Discard => Stdio::null(),
            StderrRedirect::File(path) => Stdio::from(self.create_file(path, false)?),
            StderrRedirect::MergeWithStdout => match &stdout_file {
                Some(file) => Stdio::from(file.try_clone()?),
                None => Stdio::null(),
            },
        };
        let stdout = stdout_file.map_or_else(Stdio::null, Stdio::from);
        Ok((stdin, stdout, stderr))
    }

    fn spawn_and_wait(&self, command: &str, params: &SandboxParams) -> Result<RunLog> {
        if self.root_dir.is_none() {
            bail!("sandbox `{}` was already cleaned up", self.name);
        }
        let cwd = match &params.chdir {
            Some(dir) => self.relative_path(dir)?,
            None => self.root.clone(),
        };
        let (stdin, stdout, stderr) = self.open_redirects(params)?;

        for dir in &params.mirror_dirs {
            log::debug!("Process sandbox shares {} with the host", dir.display());
        }

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&cwd)
            .stdin(stdin)
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0);
        if !params.preserve_env {
            cmd.env_clear().env("PATH", DEFAULT_PATH);
        }
        cmd.envs(&params.set_env);

        let limits = ResourceLimits::from_params(params);
        unsafe {
            cmd.pre_exec(move || limits.apply());
        }

        let start = Instant::now();
        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn `{command}`"))?;
        let pid = child.id() as libc::pid_t;

        let wall_deadline = params
            .hard_wallclock_timeout_ms()
            .map(|ms| start + Duration::from_millis(ms));
        let mut obs = Observation::default();
        let mut status: libc::c_int = 0;
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };

        loop {
            let ret = unsafe { libc::wait4(pid, &mut status, libc::WNOHANG, &mut usage) };
            if ret == pid {
                break;
            }
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                kill_group(pid);
                return Err(err).context("wait4 on sandboxed process failed");
            }

            let past_deadline = wall_deadline.is_some_and(|deadline| Instant::now() >= deadline);
            if !obs.wall_killed && past_deadline {
                log::debug!("Sandbox `{}` hit the wall clock limit", self.name);
                obs.wall_killed = true;
                kill_group(pid);
            }
            if let Some(limit) = params.memory_limit_bytes {
                let resident = group_resident_bytes(pid);
                obs.memory_bytes = obs.memory_bytes.max(resident);
                if !obs.memory_killed && resident > limit {
                    log::debug!("Sandbox `{}` hit the memory limit", self.name);
                    obs.memory_killed = true;
                    kill_group(pid);
                }
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        // Reap helpers left behind in the process group.
        kill_group(pid);

        obs.wall_ms = start.elapsed().as_millis() as u64;
        obs.cpu_ms = timeval_ms(usage.ru_utime) + timeval_ms(usage.ru_stime);
        obs.memory_bytes = obs.memory_bytes.max(usage.ru_maxrss.max(0) as u64 * 1024);
        if libc::WIFSIGNALED(status) {
            obs.signal = Some(libc::WTERMSIG(status));
            obs.exit_code = 128 + libc::WTERMSIG(status);
        } else if libc::WIFEXITED(status) {
            obs.exit_code = libc::WEXITSTATUS(status);
        }

        let exit_status = classify(&obs, params);
        Ok(RunLog {
            exit_status,
            exit_code: obs.exit_code,
            killing_signal: obs.signal,
            time_ms: obs.cpu_ms,
            wall_time_ms: obs.wall_ms,
            memory_bytes: obs.memory_bytes,
            message: (!exit_status.is_ok()).then(|| exit_status.to_string()),
            stdout_absolute_path: params.stdout_file.as_ref().map(|p| self.root.join(p)),
            stderr_absolute_path: match &params.stderr {
                StderrRedirect::File(p) => Some(self.root.join(p)),
                _ => None,
            },
        })
    }
}

impl Sandbox for SimpleRunner {
    fn name(&self) -> &str {
        &self.name
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn execute(&mut self, command: &str, params: &SandboxParams) -> RunLog {
        self.exec_count += 1;
        log::debug!(
            "Sandbox `{}` (slot {}) run #{}: {command}",
            self.name,
            self.slot.id(),
            self.exec_count
        );
        match self.spawn_and_wait(command, params) {
            Ok(run_log) => run_log,
            Err(e) => {
                log::error!("Sandbox `{}` failed to execute `{command}`: {e:#}", self.name);
                RunLog::sandbox_error(format!("{e:#}"))
            }
        }
    }

    fn cleanup(&mut self, delete: bool) -> Result<()> {
        let Some(root_dir) = self.root_dir.take() else {
            return Ok(());
        };
        if delete {
            root_dir.close()?;
            log::debug!("SimpleRunner `{}` removed {}", self.name, self.root.display());
        } else {
            let kept = root_dir.into_path();
            log::info!("SimpleRunner `{}` kept its root at {}", self.name, kept.display());
        }
        Ok(())
    }
}

impl Drop for SimpleRunner {
    fn drop(&mut self) {
        if let Some(root_dir) = self.root_dir.take() {
            match root_dir.close() {
                Ok(()) => log::debug!("SimpleRunner `{}` cleaned up", self.name),
                Err(e) => log::error!("SimpleRunner `{}` failed to clean up: {e}", self.name),
            }
        }
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::super::SlotPool;
    use super::*;

    fn runner(dir: &Path) -> SimpleRunner {
        let pool = SlotPool::new(1);
        SimpleRunner::build("test", pool.acquire(), dir).unwrap()
    }

    fn limited(timeout_ms: u64, wall_ms: u64) -> SandboxParams {
        SandboxParams {
            timeout_ms: Some(timeout_ms),
            wallclock_timeout_ms: Some(wall_ms),
            memory_limit_bytes: Some(256 * 1024 * 1024),
            ..Default::default()
        }
    }

    #[test]
    fn test_classification_precedence() {
        let params = limited(1000, 2000);
        let base = Observation::default();
        assert_eq!(classify(&base, &params), ExitStatus::Ok);

        let nonzero = Observation {
            exit_code: 3,
            ..base.clone()
        };
        assert_eq!(classify(&nonzero, &params), ExitStatus::NonzeroReturn);

        let signaled = Observation {
            signal: Some(9),
            exit_code: 137,
            ..base.clone()
        };
        assert_eq!(classify(&signaled, &params), ExitStatus::Signal);

        let oom = Observation {
            memory_killed: true,
            signal: Some(9),
            ..base.clone()
        };
        assert_eq!(classify(&oom, &params), ExitStatus::MemoryLimitExceeded);

        let slept = Observation {
            wall_killed: true,
            signal: Some(9),
            wall_ms: 2010,
            ..base.clone()
        };
        assert_eq!(classify(&slept, &params), ExitStatus::TimeoutWall);

        let spun = Observation {
            cpu_ms: 1900,
            wall_killed: true,
            signal: Some(9),
            ..base
        };
        assert_eq!(classify(&spun, &params), ExitStatus::Timeout);
    }

    #[test]
    fn test_resource_limits_from_params() {
        let mut params = limited(1500, 3000);
        let limits = ResourceLimits::from_params(&params);
        assert_eq!(limits.cpu_secs, Some(2));
        assert_eq!(limits.data_bytes, Some(512 * 1024 * 1024));
        assert_eq!(limits.processes, Some(1));

        params.set_multiprocess(true);
        assert_eq!(ResourceLimits::from_params(&params).processes, None);
        assert_eq!(ResourceLimits::from_params(&SandboxParams::default()).data_bytes, None);
    }

    fn memory_limited(bytes: u64) -> SandboxParams {
        SandboxParams {
            memory_limit_bytes: Some(bytes),
            ..limited(10_000, 10_000)
        }
    }

    #[test]
    fn test_allocation_hits_memory_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut sandbox = runner(dir.path());
        let limit = 32 * 1024 * 1024;

        let log = sandbox.execute("exec tail /dev/zero", &memory_limited(limit));
        assert_eq!(log.exit_status, ExitStatus::MemoryLimitExceeded);
        assert!(log.memory_bytes > limit);
    }

    #[test]
    fn test_memory_of_child_processes_counts() {
        let dir = tempfile::tempdir().unwrap();
        let mut sandbox = runner(dir.path());
        let limit = 32 * 1024 * 1024;
        let mut params = memory_limited(limit);
        params.set_multiprocess(true);

        let log = sandbox.execute("tail /dev/zero; exit 0", &params);
        assert_eq!(log.exit_status, ExitStatus::MemoryLimitExceeded);
        assert!(log.memory_bytes > limit);
        assert!(log.wall_time_ms < 5000);
    }

    #[test]
    fn test_process_group_of_self() {
        let pid = std::process::id() as libc::pid_t;
        let pgid = unsafe { libc::getpgid(0) };
        assert_eq!(process_group(pid), Some(pgid));
        assert!(group_resident_bytes(pgid) > 0);
    }

    #[test]
    fn test_stdout_is_captured() {
        let dir = tempfile::tempdir().unwrap();
        let mut sandbox = runner(dir.path());
        sandbox
            .create_file_from_bytes(Path::new("stdin"), b"41\n", false)
            .unwrap();
        let params = SandboxParams {
            stdin_file: Some("stdin".into()),
            stdout_file: Some("stdout".into()),
            ..limited(2000, 4000)
        };

        let log = sandbox.execute("read x; echo $((x + 1))", &params);
        assert_eq!(log.exit_status, ExitStatus::Ok);
        assert_eq!(
            sandbox.get_file_to_string(Path::new("stdout"), None).unwrap(),
            "42\n"
        );
        assert_eq!(log.stdout_absolute_path, Some(sandbox.root().join("stdout")));
    }

    #[test]
    fn test_nonzero_and_signal() {
        let dir = tempfile::tempdir().unwrap();
        let mut sandbox = runner(dir.path());

        let log = sandbox.execute("exit 3", &limited(1000, 2000));
        assert_eq!(log.exit_status, ExitStatus::NonzeroReturn);
        assert_eq!(log.exit_code, 3);

        let log = sandbox.execute("kill -9 $$", &limited(1000, 2000));
        assert_eq!(log.exit_status, ExitStatus::Signal);
        assert_eq!(log.killing_signal, Some(libc::SIGKILL));
    }

    #[test]
    fn test_sleep_hits_wall_clock() {
        let dir = tempfile::tempdir().unwrap();
        let mut sandbox = runner(dir.path());

        let log = sandbox.execute("exec sleep 5", &limited(1000, 500));
        assert_eq!(log.exit_status, ExitStatus::TimeoutWall);
        assert!(log.wall_time_ms < 5000);
    }

    #[test]
    fn test_busy_loop_hits_cpu_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut sandbox = runner(dir.path());

        let log = sandbox.execute("while :; do :; done", &limited(300, 10_000));
        assert_eq!(log.exit_status, ExitStatus::Timeout);
        assert!(log.time_ms > 300);
    }

    #[test]
    fn test_stderr_merge_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut sandbox = runner(dir.path());

        let merged = SandboxParams {
            stdout_file: Some("out".into()),
            stderr: StderrRedirect::MergeWithStdout,
            ..limited(1000, 2000)
        };
        sandbox.execute("echo a; echo b >&2", &merged);
        assert_eq!(
            sandbox.get_file_to_string(Path::new("out"), None).unwrap(),
            "a\nb\n"
        );

        let split = SandboxParams {
            stderr: StderrRedirect::File("err".into()),
            ..limited(1000, 2000)
        };
        let log = sandbox.execute("echo oops >&2", &split);
        assert_eq!(log.stderr_absolute_path, Some(sandbox.root().join("err")));
        assert_eq!(
            sandbox.get_file_to_string(Path::new("err"), Some(2)).unwrap(),
            "oo"
        );
    }

    #[test]
    fn test_environment_is_scrubbed() {
        let dir = tempfile::tempdir().unwrap();
        let mut sandbox = runner(dir.path());
        let params = SandboxParams {
            stdout_file: Some("env".into()),
            ..limited(1000, 2000)
        };

        sandbox.execute("echo \"$HOME:$PATH:${CARGO:-unset}\"", &params);
        assert_eq!(
            sandbox.get_file_to_string(Path::new("env"), None).unwrap(),
            format!("./:{DEFAULT_PATH}:unset\n")
        );
    }

    #[test]
    fn test_paths_cannot_escape_root() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = runner(dir.path());
        assert!(sandbox.relative_path(Path::new("../outside")).is_err());
        assert!(sandbox.relative_path(Path::new("/etc/passwd")).is_err());
        assert!(sandbox.relative_path(Path::new("a/./b")).is_ok());
        assert!(!sandbox.file_exists(Path::new("../outside")));
    }

    #[test]
    fn test_missing_stdin_is_sandbox_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut sandbox = runner(dir.path());
        let params = SandboxParams {
            stdin_file: Some("missing".into()),
            ..limited(1000, 2000)
        };
        let log = sandbox.execute("cat", &params);
        assert_eq!(log.exit_status, ExitStatus::SandboxError);
        assert!(log.message.is_some());
    }

    #[test]
    fn test_cleanup_deletes_root() {
        let dir = tempfile::tempdir().unwrap();
        let mut sandbox = runner(dir.path());
        let root = sandbox.root().to_path_buf();
        assert!(root.is_dir());
        sandbox.cleanup(true).unwrap();
        assert!(!root.exists());

        let log = sandbox.execute("true", &SandboxParams::default());
        assert_eq!(log.exit_status, ExitStatus::SandboxError);
    }

    #[test]
    fn test_drop_deletes_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = {
            let sandbox = runner(dir.path());
            sandbox.root().to_path_buf()
        };
        assert!(!root.exists());
    }
}
