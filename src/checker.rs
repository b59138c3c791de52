use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::cache::Digest;
use crate::code::{DigestOrSource, MAX_DIAGNOSTIC_BYTES, RunOptions, compile_item, run_item};
use crate::context::JudgeContext;
use crate::package::{CodeItem, Testcase};
use crate::sandbox::{ExitStatus, RunLog, Truncator};
use crate::verdict::{CheckerResult, Outcome};

const CHECKER_ARGS: &str = "input.txt output.txt expected.txt";

/// A checker program ready to run
#[derive(Debug, Clone)]
pub struct CompiledChecker {
    pub code: CodeItem,
    pub digest: Digest,
}

/// Compiles the package checker, if it declares one
pub fn compile_checker(ctx: &JudgeContext) -> Result<Option<CompiledChecker>> {
    let Some(code) = &ctx.package.checker else {
        return Ok(None);
    };
    let digest = compile_item(ctx, code)
        .with_context(|| format!("failed to compile checker {}", code.path.display()))?;
    Ok(Some(CompiledChecker {
        code: code.clone(),
        digest,
    }))
}

/// Verdict implied by the program's own run, before any checker is involved
pub fn precheck(run_log: &RunLog, charged_ms: u64, time_limit_ms: u64) -> Option<CheckerResult> {
    let outcome = match run_log.exit_status {
        ExitStatus::Signal | ExitStatus::NonzeroReturn => Outcome::RuntimeError,
        ExitStatus::Timeout | ExitStatus::TimeoutWall => Outcome::TimeLimitExceeded,
        ExitStatus::MemoryLimitExceeded => Outcome::MemoryLimitExceeded,
        ExitStatus::SandboxError => Outcome::InternalError,
        ExitStatus::Ok if charged_ms > time_limit_ms => Outcome::TimeLimitExceeded,
        ExitStatus::Ok => return None,
    };
    Some(CheckerResult::new(outcome))
}

/// testlib convention: 0 accepts, 1 and 2 reject, 3 reports a judge failure
pub fn outcome_from_exit_code(code: i32) -> Outcome {
    match code {
        0 => Outcome::Accepted,
        1 | 2 => Outcome::WrongAnswer,
        3 => Outcome::JudgeFailed,
        _ => Outcome::InternalError,
    }
}

fn tokens(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    data.split(u8::is_ascii_whitespace).filter(|t| !t.is_empty())
}

/// Whitespace-insensitive token comparison used when no checker is declared
///
/// Works on raw bytes: program output is not required to be UTF-8.
pub fn compare_tokens(output: &[u8], expected: &[u8]) -> Outcome {
    if tokens(output).eq(tokens(expected)) {
        Outcome::Accepted
    } else {
        Outcome::WrongAnswer
    }
}

fn read_diagnostics(path: &Path) -> Result<String> {
    let mut bytes = Vec::new();
    Truncator::new(File::open(path)?, MAX_DIAGNOSTIC_BYTES)?.read_to_end(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn internal_error(reason: String, diagnostics: &str) -> CheckerResult {
    log::warn!("Checker protocol violation: {reason}");
    let message = if diagnostics.is_empty() {
        reason
    } else {
        format!("{reason}\n{diagnostics}")
    };
    CheckerResult::with_message(Outcome::InternalError, message)
}

/// Judges `program_output` for `testcase`
///
/// The checker is only invoked when the run itself finished cleanly within
/// the time limit in effect for the current verification level.
pub fn check(
    ctx: &JudgeContext,
    checker: Option<&CompiledChecker>,
    run_log: &RunLog,
    testcase: &Testcase,
    program_output: &Path,
) -> Result<CheckerResult> {
    let time_limit = ctx.verification.effective_time_limit(ctx.package.time_limit);
    let charged_ms = ctx.sandbox_kind().charged_time_ms(run_log);
    if let Some(result) = precheck(run_log, charged_ms, time_limit) {
        return Ok(result);
    }

    let Some(expected) = &testcase.output_path else {
        return Ok(CheckerResult::new(Outcome::Accepted));
    };

    let Some(checker) = checker else {
        let output = fs::read(program_output)
            .with_context(|| format!("failed to read {}", program_output.display()))?;
        let expected = fs::read(expected)
            .with_context(|| format!("failed to read {}", expected.display()))?;
        return Ok(CheckerResult::new(compare_tokens(&output, &expected)));
    };

    let stderr_file = tempfile::Builder::new()
        .prefix("jbx-checker-")
        .suffix(".err")
        .tempfile_in(&ctx.temp_dir)?;
    let stderr_path = stderr_file.path().to_path_buf();
    let options = RunOptions {
        stderr: Some(stderr_path.clone().into()),
        inputs: vec![
            (testcase.input_path.clone().into(), PathBuf::from("input.txt")),
            (program_output.to_path_buf().into(), PathBuf::from("output.txt")),
            (expected.clone().into(), PathBuf::from("expected.txt")),
        ],
        extra_args: Some(CHECKER_ARGS.to_string()),
        ..Default::default()
    };
    let checker_log = run_item(
        ctx,
        &checker.code,
        &DigestOrSource::Digest(checker.digest.clone()),
        &options,
    )?;
    let diagnostics = read_diagnostics(&stderr_path).unwrap_or_default();

    let Some(checker_log) = checker_log else {
        return Ok(internal_error(
            "checker sandbox could not be initialized".to_string(),
            &diagnostics,
        ));
    };
    if !matches!(
        checker_log.exit_status,
        ExitStatus::Ok | ExitStatus::NonzeroReturn
    ) {
        return Ok(internal_error(
            format!("checker crashed: {}", checker_log.exit_status),
            &diagnostics,
        ));
    }

    match outcome_from_exit_code(checker_log.exit_code) {
        Outcome::InternalError => Ok(internal_error(
            format!("checker exited with undeclared code {}", checker_log.exit_code),
            &diagnostics,
        )),
        outcome => Ok(CheckerResult::with_message(outcome, diagnostics)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxKind;

    fn run_log(exit_status: ExitStatus, time_ms: u64) -> RunLog {
        RunLog {
            exit_status,
            time_ms,
            ..RunLog::sandbox_error("")
        }
    }

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(outcome_from_exit_code(0), Outcome::Accepted);
        assert_eq!(outcome_from_exit_code(1), Outcome::WrongAnswer);
        assert_eq!(outcome_from_exit_code(2), Outcome::WrongAnswer);
        assert_eq!(outcome_from_exit_code(3), Outcome::JudgeFailed);
        assert_eq!(outcome_from_exit_code(4), Outcome::InternalError);
        assert_eq!(outcome_from_exit_code(42), Outcome::InternalError);
        assert_eq!(outcome_from_exit_code(-1), Outcome::InternalError);
    }

    #[test]
    fn test_precheck_short_circuits() {
        let cases = [
            (ExitStatus::Signal, Outcome::RuntimeError),
            (ExitStatus::NonzeroReturn, Outcome::RuntimeError),
            (ExitStatus::Timeout, Outcome::TimeLimitExceeded),
            (ExitStatus::TimeoutWall, Outcome::TimeLimitExceeded),
            (ExitStatus::MemoryLimitExceeded, Outcome::MemoryLimitExceeded),
            (ExitStatus::SandboxError, Outcome::InternalError),
        ];
        for (status, outcome) in cases {
            assert_eq!(
                precheck(&run_log(status, 10), 10, 1000).map(|r| r.outcome),
                Some(outcome),
                "{status:?}"
            );
        }
    }

    #[test]
    fn test_precheck_time_limit() {
        assert_eq!(precheck(&run_log(ExitStatus::Ok, 1000), 1000, 1000), None);
        assert_eq!(
            precheck(&run_log(ExitStatus::Ok, 1001), 1001, 1000).map(|r| r.outcome),
            Some(Outcome::TimeLimitExceeded)
        );
        assert_eq!(precheck(&run_log(ExitStatus::Ok, 1400), 1400, 2000), None);
    }

    #[test]
    fn test_charged_time_follows_backend() {
        let mut log = run_log(ExitStatus::Ok, 5);
        log.wall_time_ms = 1404;
        assert_eq!(SandboxKind::Process.charged_time_ms(&log), 1404);
        assert_eq!(SandboxKind::Isolate.charged_time_ms(&log), 5);

        let charged = SandboxKind::Process.charged_time_ms(&log);
        assert_eq!(
            precheck(&log, charged, 1000).map(|r| r.outcome),
            Some(Outcome::TimeLimitExceeded)
        );
        assert_eq!(precheck(&log, charged, 2000), None);
    }

    #[test]
    fn test_token_comparison() {
        assert_eq!(compare_tokens(b"1 2\n3\n", b"1  2 3"), Outcome::Accepted);
        assert_eq!(compare_tokens(b"", b"\n\n"), Outcome::Accepted);
        assert_eq!(compare_tokens(b"1 2", b"1 2 3"), Outcome::WrongAnswer);
        assert_eq!(compare_tokens(b"12", b"1 2"), Outcome::WrongAnswer);
    }

    #[test]
    fn test_token_comparison_of_binary_output() {
        assert_eq!(compare_tokens(b"\xff\xfe\n", b"3\n"), Outcome::WrongAnswer);
        assert_eq!(compare_tokens(b"\xff 3\r\n", b"\xff\t3"), Outcome::Accepted);
    }

    #[test]
    fn test_diagnostics_are_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("err");
        fs::write(&path, "x".repeat(MAX_DIAGNOSTIC_BYTES as usize + 100)).unwrap();
        assert_eq!(
            read_diagnostics(&path).unwrap().len(),
            MAX_DIAGNOSTIC_BYTES as usize
        );
    }
}
