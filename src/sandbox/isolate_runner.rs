use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow, bail};
use tempfile::TempDir;

use super::{DEFAULT_PATH, ExitStatus, RunLog, Sandbox, SandboxParams, SlotGuard, StderrRedirect};

/// Mount point of the sandbox root as seen from inside the box
const BOX_MOUNT: &str = "/box";

/// A sandbox driven by the external `isolate` binary
///
/// The box id is the execution slot id, so two live runners never share a box.
/// Meta files are written outside the box where the sandboxed program cannot
/// tamper with them.
pub struct IsolateRunner {
    name: String,
    slot: SlotGuard,
    box_dir: PathBuf,
    meta_dir: TempDir,
    exec_count: usize,
    cleaned: bool,
}

/// Fields of an isolate meta file relevant to classification
#[derive(Debug, Clone, Default, PartialEq)]
struct MetaInfo {
    time_secs: f64,
    wall_secs: f64,
    memory_kib: u64,
    exit_code: i32,
    exit_signal: Option<i32>,
    status: Option<String>,
    message: Option<String>,
    oom_killed: bool,
}

impl MetaInfo {
    /// Parses `key:value` lines; unknown keys are ignored
    fn parse(meta_content: &str) -> Self {
        let mut meta = MetaInfo::default();
        for line in meta_content.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            match key {
                "time" => meta.time_secs = value.parse().unwrap_or(0.0),
                "time-wall" => meta.wall_secs = value.parse().unwrap_or(0.0),
                "cg-mem" | "max-rss" => {
                    let kib = value.parse().unwrap_or(0);
                    meta.memory_kib = meta.memory_kib.max(kib);
                }
                "exitcode" => meta.exit_code = value.parse().unwrap_or(0),
                "exitsig" => meta.exit_signal = value.parse().ok(),
                "status" => meta.status = Some(value.to_string()),
                "message" => meta.message = Some(value.to_string()),
                "cg-oom-killed" => meta.oom_killed = value == "1",
                _ => {}
            }
        }
        meta
    }

    fn exit_status(&self, params: &SandboxParams) -> ExitStatus {
        let memory_bytes = self.memory_kib * 1024;
        match self.status.as_deref() {
            Some("XX") => ExitStatus::SandboxError,
            Some("TO") => {
                let wall = self
                    .message
                    .as_deref()
                    .is_some_and(|m| m.contains("wall clock"));
                if wall {
                    ExitStatus::TimeoutWall
                } else {
                    ExitStatus::Timeout
                }
            }
            _ if self.oom_killed
                || params
                    .memory_limit_bytes
                    .is_some_and(|limit| memory_bytes > limit) =>
            {
                ExitStatus::MemoryLimitExceeded
            }
            Some("SG") => ExitStatus::Signal,
            Some("RE") => ExitStatus::NonzeroReturn,
            _ if self.exit_code != 0 => ExitStatus::NonzeroReturn,
            _ => ExitStatus::Ok,
        }
    }
}

impl IsolateRunner {
    pub fn build(name: &str, slot: SlotGuard) -> Result<Self> {
        let box_dir = Self::initialize_isolate_box(slot.id())?;
        let meta_dir = tempfile::Builder::new()
            .prefix(&format!("jbx-meta-{}-", slot.id()))
            .tempdir()?;

        log::debug!("IsolateRunner `{name}` initialized at {}", box_dir.display());
        Ok(Self {
            name: name.to_string(),
            slot,
            box_dir,
            meta_dir,
            exec_count: 0,
            cleaned: false,
        })
    }

    /// Runs `isolate --init` and returns the box directory
    fn initialize_isolate_box(id: u32) -> Result<PathBuf> {
        let output = Command::new("isolate")
            .arg("-b")
            .arg(id.to_string())
            .arg("--cg")
            .arg("--init")
            .output()
            .map_err(|e| anyhow!("Failed to spawn isolate --init: {}", e))?;

        if !output.status.success() {
            bail!(
                "isolate --init exited with non-zero status; stderr={}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        let root_dir_absolute = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if root_dir_absolute.is_empty() {
            bail!(
                "isolate --init produced empty stdout; stderr={}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        Ok(PathBuf::from(root_dir_absolute).join("box"))
    }

    fn inside(path: &Path) -> String {
        Path::new(BOX_MOUNT).join(path).to_string_lossy().into_owned()
    }

    /// Translates resolved parameters into `isolate --run` arguments
    fn run_args(&self, params: &SandboxParams, meta_path: &Path) -> Vec<String> {
        let mut args = vec![
            "-b".to_string(),
            self.slot.id().to_string(),
            "--cg".to_string(),
            "--run".to_string(),
            "-M".to_string(),
            meta_path.to_string_lossy().into_owned(),
            format!("--processes={}", params.max_processes),
        ];
        if let Some(dir) = &params.chdir {
            args.push(format!("--chdir={}", Self::inside(dir)));
        }
        for dir in &params.mirror_dirs {
            args.push(format!("--dir={}", dir.display()));
        }
        if params.preserve_env {
            args.push("--full-env".to_string());
        } else {
            args.push("-E".to_string());
            args.push(format!("PATH={DEFAULT_PATH}"));
        }
        for (key, value) in &params.set_env {
            args.push("-E".to_string());
            args.push(format!("{key}={value}"));
        }
        if let Some(path) = &params.stdin_file {
            args.push(format!("--stdin={}", Self::inside(path)));
        }
        if let Some(path) = &params.stdout_file {
            args.push(format!("--stdout={}", Self::inside(path)));
        }
        match &params.stderr {
            StderrRedirect::Discard => {}
            StderrRedirect::File(path) => args.push(format!("--stderr={}", Self::inside(path))),
            StderrRedirect::MergeWithStdout => args.push("--stderr-to-stdout".to_string()),
        }
        if let Some(ms) = params.timeout_ms {
            args.push(format!("--time={:.3}", ms as f64 / 1000.0));
        }
        if let Some(ms) = params.wallclock_timeout_ms {
            args.push(format!("--wall-time={:.3}", ms as f64 / 1000.0));
        }
        if let Some(ms) = params.extra_timeout_ms {
            args.push(format!("--extra-time={:.3}", ms as f64 / 1000.0));
        }
        if let Some(bytes) = params.memory_limit_bytes {
            args.push(format!("--cg-mem={}", bytes / 1024));
        }
        if let Some(bytes) = params.stack_limit_bytes {
            args.push(format!("--stack={}", bytes / 1024));
        }
        if let Some(kib) = params.fsize_kib {
            args.push(format!("--fsize={kib}"));
        }
        args.push("--silent".to_string());
        args
    }

    fn run_isolate(&self, command: &str, params: &SandboxParams) -> Result<RunLog> {
        if self.cleaned {
            bail!("sandbox `{}` was already cleaned up", self.name);
        }
        let meta_path = self.meta_dir.path().join(format!("{}.meta", self.exec_count));
        let output = Command::new("isolate")
            .args(self.run_args(params, &meta_path))
            .args(["--", "/bin/sh", "-c", command])
            .output()
            .context("failed to spawn isolate --run")?;

        // Exit code 2 means isolate itself failed; 0 and 1 leave a meta file.
        if output.status.code() == Some(2) {
            bail!(
                "isolate --run failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let meta_content = fs::read_to_string(&meta_path)
            .with_context(|| format!("failed to read meta file {}", meta_path.display()))?;
        let meta = MetaInfo::parse(&meta_content);
        let exit_status = meta.exit_status(params);

        Ok(RunLog {
            exit_status,
            exit_code: meta.exit_code,
            killing_signal: meta.exit_signal,
            time_ms: (meta.time_secs * 1000.0).round() as u64,
            wall_time_ms: (meta.wall_secs * 1000.0).round() as u64,
            memory_bytes: meta.memory_kib * 1024,
            message: meta
                .message
                .or_else(|| (!exit_status.is_ok()).then(|| exit_status.to_string())),
            stdout_absolute_path: params.stdout_file.as_ref().map(|p| self.box_dir.join(p)),
            stderr_absolute_path: match &params.stderr {
                StderrRedirect::File(p) => Some(self.box_dir.join(p)),
                _ => None,
            },
        })
    }
}

impl Sandbox for IsolateRunner {
    fn name(&self) -> &str {
        &self.name
    }

    fn root(&self) -> &Path {
        &self.box_dir
    }

    fn execute(&mut self, command: &str, params: &SandboxParams) -> RunLog {
        self.exec_count += 1;
        log::debug!(
            "IsolateRunner `{}` (box {}) run #{}: {command}",
            self.name,
            self.slot.id(),
            self.exec_count
        );
        match self.run_isolate(command, params) {
            Ok(run_log) => run_log,
            Err(e) => {
                log::error!("IsolateRunner `{}` failed: {e:#}", self.name);
                RunLog::sandbox_error(format!("{e:#}"))
            }
        }
    }

    fn cleanup(&mut self, delete: bool) -> Result<()> {
        if self.cleaned {
            return Ok(());
        }
        self.cleaned = true;
        if !delete {
            log::info!(
                "IsolateRunner `{}` kept box {} at {}",
                self.name,
                self.slot.id(),
                self.box_dir.display()
            );
            return Ok(());
        }
        let output = Command::new("isolate")
            .arg("-b")
            .arg(self.slot.id().to_string())
            .arg("--cg")
            .arg("--cleanup")
            .output()?;
        if !output.status.success() {
            bail!("isolate --cleanup failed for box {}", self.slot.id());
        }
        log::debug!("IsolateRunner `{}` cleaned up", self.name);
        Ok(())
    }
}

impl Drop for IsolateRunner {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup(true) {
            log::error!("IsolateRunner `{}` failed to clean up: {e}", self.name);
        }
    }
}
