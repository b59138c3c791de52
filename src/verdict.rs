use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::package::Testcase;
use crate::sandbox::RunLog;

/// Classification of one program run against one testcase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    Accepted,
    WrongAnswer,
    RuntimeError,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    JudgeFailed,
    InternalError,
}

impl Outcome {
    pub fn name(&self) -> &'static str {
        match self {
            Outcome::Accepted => "ACCEPTED",
            Outcome::WrongAnswer => "WRONG_ANSWER",
            Outcome::RuntimeError => "RUNTIME_ERROR",
            Outcome::TimeLimitExceeded => "TIME_LIMIT_EXCEEDED",
            Outcome::MemoryLimitExceeded => "MEMORY_LIMIT_EXCEEDED",
            Outcome::JudgeFailed => "JUDGE_FAILED",
            Outcome::InternalError => "INTERNAL_ERROR",
        }
    }

    /// One-character marker used in run reports
    pub fn marker(&self) -> char {
        match self {
            Outcome::Accepted => '✓',
            Outcome::TimeLimitExceeded => '⧖',
            _ => '✗',
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome policy a solution is declared with in the package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExpectedOutcome {
    #[serde(rename = "accepted", alias = "ac", alias = "correct")]
    Accepted,
    #[serde(rename = "wrong-answer", alias = "wa", alias = "wrong answer")]
    WrongAnswer,
    #[serde(rename = "incorrect", alias = "fail")]
    Incorrect,
    #[serde(rename = "runtime-error", alias = "runtime error", alias = "rte", alias = "re")]
    RuntimeError,
    #[serde(
        rename = "time-limit-exceeded",
        alias = "time limit exceeded",
        alias = "tle",
        alias = "timeout"
    )]
    TimeLimitExceeded,
    #[serde(rename = "memory-limit-exceeded", alias = "memory limit exceeded", alias = "mle")]
    MemoryLimitExceeded,
    #[serde(rename = "tle-or-rte", alias = "tle or rte", alias = "tle/rte", alias = "tle+rte")]
    TleOrRte,
}

impl ExpectedOutcome {
    /// Whether this policy accepts `outcome`
    pub fn matches(&self, outcome: Outcome) -> bool {
        match self {
            ExpectedOutcome::Accepted => outcome == Outcome::Accepted,
            ExpectedOutcome::WrongAnswer => outcome == Outcome::WrongAnswer,
            ExpectedOutcome::Incorrect => matches!(
                outcome,
                Outcome::WrongAnswer
                    | Outcome::RuntimeError
                    | Outcome::MemoryLimitExceeded
                    | Outcome::TimeLimitExceeded
            ),
            ExpectedOutcome::RuntimeError => outcome == Outcome::RuntimeError,
            ExpectedOutcome::TimeLimitExceeded => outcome == Outcome::TimeLimitExceeded,
            ExpectedOutcome::MemoryLimitExceeded => outcome == Outcome::MemoryLimitExceeded,
            ExpectedOutcome::TleOrRte => {
                matches!(outcome, Outcome::TimeLimitExceeded | Outcome::RuntimeError)
            }
        }
    }
}

impl fmt::Display for ExpectedOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExpectedOutcome::Accepted => "ACCEPTED",
            ExpectedOutcome::WrongAnswer => "WRONG_ANSWER",
            ExpectedOutcome::Incorrect => "INCORRECT",
            ExpectedOutcome::RuntimeError => "RUNTIME_ERROR",
            ExpectedOutcome::TimeLimitExceeded => "TIME_LIMIT_EXCEEDED",
            ExpectedOutcome::MemoryLimitExceeded => "MEMORY_LIMIT_EXCEEDED",
            ExpectedOutcome::TleOrRte => "TIME_LIMIT_EXCEEDED_OR_RUNTIME_ERROR",
        };
        f.write_str(name)
    }
}

/// Verdict produced by the checker protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckerResult {
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CheckerResult {
    pub fn new(outcome: Outcome) -> Self {
        Self {
            outcome,
            message: None,
        }
    }

    pub fn with_message(outcome: Outcome, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            outcome,
            message: (!message.is_empty()).then_some(message),
        }
    }
}

/// How strictly solutions are verified
///
/// Only [`VerificationLevel::Full`] changes grading: runs get twice the
/// nominal time limit and marginal timings are reported as warnings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum VerificationLevel {
    #[default]
    None = 0,
    Validate = 1,
    FastSolutions = 2,
    AllSolutions = 3,
    Full = 4,
}

impl VerificationLevel {
    /// Time limit programs are actually run with
    pub fn effective_time_limit(&self, nominal_ms: u64) -> u64 {
        if *self >= VerificationLevel::Full {
            nominal_ms * 2
        } else {
            nominal_ms
        }
    }
}

impl TryFrom<u8> for VerificationLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(VerificationLevel::None),
            1 => Ok(VerificationLevel::Validate),
            2 => Ok(VerificationLevel::FastSolutions),
            3 => Ok(VerificationLevel::AllSolutions),
            4 => Ok(VerificationLevel::Full),
            other => Err(format!("verification level must be between 0 and 4, got {other}")),
        }
    }
}

/// Run record persisted next to the captured output of a testcase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestcaseLog {
    #[serde(flatten)]
    pub run_log: RunLog,
    /// Milliseconds charged against the time limit by the sandbox backend
    #[serde(default)]
    pub charged_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_absolute_path: Option<PathBuf>,
}

/// Result of one solution on one testcase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    pub result: CheckerResult,
    pub testcase: Testcase,
    pub log: TestcaseLog,
}
