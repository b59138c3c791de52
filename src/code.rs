use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};

use crate::cache::{DependencyCache, Digest};
use crate::context::JudgeContext;
use crate::environment::{ExecutionConfig, ResolvedFileMapping};
use crate::error::JudgeError;
use crate::package::CodeItem;
use crate::sandbox::{RunLog, Sandbox, StderrRedirect};

/// Captured diagnostics are cut to this many bytes
pub const MAX_DIAGNOSTIC_BYTES: u64 = 64 * 1024;

const COMPILE_STDOUT: &str = "compile.stdout";
const COMPILE_STDERR: &str = "compile.stderr";
const RUN_STDERR: &str = "stderr";

/// Slot that receives a digest once an artifact is stored
#[derive(Debug, Clone, Default)]
pub struct DigestHolder(Arc<OnceLock<Digest>>);

impl DigestHolder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Digest> {
        self.0.get().cloned()
    }

    fn set(&self, digest: Digest) {
        if self.0.set(digest).is_err() {
            log::warn!("Digest holder was already filled; keeping the first value");
        }
    }
}

/// Where a file staged into a sandbox comes from
#[derive(Debug, Clone)]
pub enum DigestOrSource {
    Digest(Digest),
    Source(PathBuf),
}

impl From<Digest> for DigestOrSource {
    fn from(digest: Digest) -> Self {
        DigestOrSource::Digest(digest)
    }
}

impl From<PathBuf> for DigestOrSource {
    fn from(path: PathBuf) -> Self {
        DigestOrSource::Source(path)
    }
}

/// Where a file produced in a sandbox goes
#[derive(Debug, Clone)]
pub enum DigestOrDest {
    Digest(DigestHolder),
    Dest(PathBuf),
}

impl From<DigestHolder> for DigestOrDest {
    fn from(holder: DigestHolder) -> Self {
        DigestOrDest::Digest(holder)
    }
}

impl From<PathBuf> for DigestOrDest {
    fn from(path: PathBuf) -> Self {
        DigestOrDest::Dest(path)
    }
}

/// Optional parts of a [`run_item`] call
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub stdin: Option<DigestOrSource>,
    pub stdout: Option<DigestOrDest>,
    pub stderr: Option<DigestOrDest>,
    /// Additional files staged at sandbox-relative paths
    pub inputs: Vec<(DigestOrSource, PathBuf)>,
    /// Appended to the execution command
    pub extra_args: Option<String>,
    /// Layered over the language execution settings
    pub extra_config: Option<ExecutionConfig>,
}

fn stage(
    ctx: &JudgeContext,
    sandbox: &dyn Sandbox,
    source: &DigestOrSource,
    dest: &Path,
    executable: bool,
) -> Result<()> {
    match source {
        DigestOrSource::Digest(digest) => {
            sandbox.create_file_from_storage(dest, ctx.cache.as_ref(), digest, executable)
        }
        DigestOrSource::Source(path) => sandbox.create_file_from_other_file(dest, path, executable),
    }
}

/// Moves a sandbox file out to its destination and returns its final path
fn persist(
    ctx: &JudgeContext,
    sandbox: &dyn Sandbox,
    src: &Path,
    dest: &DigestOrDest,
) -> Result<Option<PathBuf>> {
    let exists = sandbox.file_exists(src);
    match dest {
        DigestOrDest::Digest(holder) => {
            let digest = if exists {
                sandbox.get_file_to_storage(src, ctx.cache.as_ref(), None)?
            } else {
                ctx.cache.put_bytes(b"")?
            };
            holder.set(digest);
            Ok(None)
        }
        DigestOrDest::Dest(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut file = File::create(path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            if exists {
                io::copy(&mut sandbox.get_file(src)?, &mut file)?;
            }
            Ok(Some(path.clone()))
        }
    }
}

fn sandbox_name(prefix: &str, code: &CodeItem) -> String {
    let stem = code
        .path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{prefix}-{stem}")
}

/// Auxiliary compilation files must stay below the directory of the source
fn checked_relative(path: &Path) -> Result<&Path> {
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes || path.as_os_str().is_empty() {
        return Err(JudgeError::Config(format!(
            "compilation file {} must be relative to its code item",
            path.display()
        ))
        .into());
    }
    Ok(path)
}

/// Compiles `code` and returns the digest of its executable
///
/// Languages without compilation commands store the source itself. Results
/// are memoized by the dependency cache, keyed by the expanded commands and
/// the digests of every staged input.
pub fn compile_item(ctx: &JudgeContext, code: &CodeItem) -> Result<Digest> {
    let environment = &ctx.environment;
    let language = environment.detect_language(&code.path, code.language.as_deref())?;
    let compilation = environment.resolve_compilation(language);
    let files = environment.resolve_file_mapping(language);

    let source_digest = ctx
        .cache
        .put_file(&code.path)
        .with_context(|| format!("failed to store {}", code.path.display()))?;
    if compilation.commands.is_empty() {
        log::debug!("{} needs no compilation", code.path.display());
        return Ok(source_digest);
    }

    let commands: Vec<String> = compilation.commands.iter().map(|c| files.apply(c)).collect();
    let mut inputs = vec![(files.compilable.to_string_lossy().into_owned(), source_digest)];
    let base_dir = code.path.parent().unwrap_or(Path::new("."));
    for extra in &code.compilation_files {
        let extra = checked_relative(extra)?;
        let digest = ctx
            .cache
            .put_file(&base_dir.join(extra))
            .with_context(|| format!("failed to store compilation file {}", extra.display()))?;
        inputs.push((extra.to_string_lossy().into_owned(), digest));
    }

    let key = DependencyCache::key(&commands, &inputs);
    if let Some(digest) = ctx.dependency_cache.lookup(&key, ctx.cache.as_ref()) {
        log::debug!("{} is up to date", code.path.display());
        return Ok(digest);
    }

    let mut sandbox = ctx
        .create_sandbox(&sandbox_name("compile", code))
        .map_err(|e| JudgeError::SandboxInfrastructure(format!("{e:#}")))?;
    for (name, digest) in &inputs {
        sandbox.create_file_from_storage(Path::new(name), ctx.cache.as_ref(), digest, false)?;
    }

    let mut params = compilation.sandbox.to_params();
    params.set_multiprocess(true);
    params.stdout_file = Some(PathBuf::from(COMPILE_STDOUT));
    params.stderr = StderrRedirect::File(PathBuf::from(COMPILE_STDERR));

    for command in &commands {
        let run_log = sandbox.execute(command, &params);
        if run_log.exit_status == crate::sandbox::ExitStatus::SandboxError {
            return Err(JudgeError::SandboxInfrastructure(
                run_log.message.unwrap_or_else(|| format!("`{command}` could not run")),
            )
            .into());
        }
        if !run_log.exit_status.is_ok() {
            let read = |name: &str| {
                sandbox
                    .get_file_to_string(Path::new(name), Some(MAX_DIAGNOSTIC_BYTES))
                    .unwrap_or_default()
            };
            log::error!("Compilation of {} failed on `{command}`", code.path.display());
            return Err(JudgeError::Compilation {
                path: code.path.clone(),
                command: command.clone(),
                status: run_log.exit_status,
                exit_code: run_log.exit_code,
                stdout: read(COMPILE_STDOUT),
                stderr: read(COMPILE_STDERR),
            }
            .into());
        }
    }

    if !sandbox.file_exists(&files.executable) {
        return Err(JudgeError::Compilation {
            path: code.path.clone(),
            command: commands.join(" && "),
            status: crate::sandbox::ExitStatus::Ok,
            exit_code: 0,
            stdout: String::new(),
            stderr: format!("{} was not produced", files.executable.display()),
        }
        .into());
    }

    let digest = sandbox.get_file_to_storage(&files.executable, ctx.cache.as_ref(), None)?;
    ctx.dependency_cache.record(key, digest.clone())?;
    sandbox.cleanup(true)?;
    log::info!("Compiled {}", code.path.display());
    Ok(digest)
}

/// Runs an executable produced by [`compile_item`]
///
/// Returns `Ok(None)` only when no sandbox could be initialized; every other
/// outcome of the program, including limit violations, is in the [`RunLog`].
pub fn run_item(
    ctx: &JudgeContext,
    code: &CodeItem,
    executable: &DigestOrSource,
    options: &RunOptions,
) -> Result<Option<RunLog>> {
    let environment = &ctx.environment;
    let language = environment.detect_language(&code.path, code.language.as_deref())?;
    let files: ResolvedFileMapping = environment.resolve_file_mapping(language);
    let execution = environment.resolve_execution(language, options.extra_config.as_ref())?;

    let mut command = files.apply(&execution.command);
    if let Some(args) = &options.extra_args {
        command = format!("{command} {args}");
    }
    let command = format!("exec {command}");

    let mut sandbox = match ctx.create_sandbox(&sandbox_name("run", code)) {
        Ok(sandbox) => sandbox,
        Err(e) => {
            log::error!("Could not initialize a sandbox for {}: {e:#}", code.path.display());
            return Ok(None);
        }
    };

    stage(ctx, sandbox.as_ref(), executable, &files.executable, true)?;
    for (source, dest) in &options.inputs {
        stage(ctx, sandbox.as_ref(), source, dest, false)?;
    }

    let mut params = execution.sandbox.to_params();
    if let Some(stdin) = &options.stdin {
        stage(ctx, sandbox.as_ref(), stdin, &files.input, false)?;
        params.stdin_file = Some(files.input.clone());
    }
    if options.stdout.is_some() {
        params.stdout_file = Some(files.output.clone());
    }
    if options.stderr.is_some() {
        params.stderr = StderrRedirect::File(PathBuf::from(RUN_STDERR));
    }

    let mut run_log = sandbox.execute(&command, &params);

    run_log.stdout_absolute_path = match &options.stdout {
        Some(dest) => persist(ctx, sandbox.as_ref(), &files.output, dest)?,
        None => None,
    };
    run_log.stderr_absolute_path = match &options.stderr {
        Some(dest) => persist(ctx, sandbox.as_ref(), Path::new(RUN_STDERR), dest)?,
        None => None,
    };

    if let Err(e) = sandbox.cleanup(true) {
        log::warn!("Sandbox cleanup after {} failed: {e:#}", code.path.display());
    }
    Ok(Some(run_log))
}
