use std::path::PathBuf;

use crate::cache::Digest;
use crate::sandbox::ExitStatus;

/// Failures of the artifact cache
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("digest {0} not found in cache")]
    NotFound(Digest),
    #[error("cache I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures that abort a compilation or an evaluation run
///
/// Verdicts are never reported through this type; see [`crate::verdict::Outcome`].
#[derive(Debug, thiserror::Error)]
pub enum JudgeError {
    #[error(
        "compilation of {} failed: `{command}` finished with {status} (exit code {exit_code})",
        .path.display()
    )]
    Compilation {
        path: PathBuf,
        command: String,
        status: ExitStatus,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    #[error("sandbox infrastructure failure: {0}")]
    SandboxInfrastructure(String),
    #[error("language `{0}` is not configured in the environment")]
    UnknownLanguage(String),
    #[error("could not detect a unique language for {}", .0.display())]
    UndetectableLanguage(PathBuf),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl JudgeError {
    /// Compiler diagnostics attached to a compilation failure
    pub fn diagnostics(&self) -> Option<String> {
        match self {
            JudgeError::Compilation { stdout, stderr, .. } => {
                Some(format!("{stdout}{stderr}"))
            }
            _ => None,
        }
    }
}
