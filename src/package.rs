use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::JudgeError;
use crate::verdict::ExpectedOutcome;

pub const PACKAGE_FILE: &str = "problem.json";

/// A program of the package: checker or solution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeItem {
    pub path: PathBuf,
    /// Detected from the file extension when absent
    #[serde(default)]
    pub language: Option<String>,
    /// Extra files staged next to the source when compiling, relative to it
    #[serde(default)]
    pub compilation_files: Vec<PathBuf>,
}

impl CodeItem {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            language: None,
            compilation_files: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Solution {
    #[serde(flatten)]
    pub code: CodeItem,
    pub outcome: ExpectedOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Testcase {
    pub input_path: PathBuf,
    #[serde(default)]
    pub output_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestcaseGroup {
    pub name: String,
    #[serde(default)]
    pub testcases: Vec<Testcase>,
    #[serde(default)]
    pub weight: Option<f64>,
}

/// Problem package: limits, checker, solutions and testcase groups
///
/// `time_limit` is in milliseconds and `memory_limit` in MiB; both are the
/// nominal limits before any verification scaling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Package {
    pub name: String,
    pub time_limit: u64,
    pub memory_limit: u64,
    #[serde(default)]
    pub checker: Option<CodeItem>,
    #[serde(default)]
    pub solutions: Vec<Solution>,
    #[serde(default)]
    pub testcases: Vec<TestcaseGroup>,
}

impl Package {
    /// Reads `problem.json` from `root`, making every path absolute
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(PACKAGE_FILE);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read package {}", path.display()))?;
        let mut package: Package = serde_json::from_str(&content)
            .map_err(|e| JudgeError::Config(format!("invalid {}: {e}", path.display())))?;
        package.rebase(root);
        Ok(package)
    }

    fn rebase(&mut self, root: &Path) {
        if let Some(checker) = &mut self.checker {
            checker.path = root.join(&checker.path);
        }
        for solution in &mut self.solutions {
            solution.code.path = root.join(&solution.code.path);
        }
        for group in &mut self.testcases {
            for testcase in &mut group.testcases {
                testcase.input_path = root.join(&testcase.input_path);
                testcase.output_path = testcase.output_path.as_ref().map(|p| root.join(p));
            }
        }
    }
}

/// Lists `<dir>/*.in` in name order, pairing each with a sibling `.out`
pub fn find_built_testcases(dir: &Path) -> Result<Vec<Testcase>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut inputs: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "in"))
        .collect();
    inputs.sort();

    Ok(inputs
        .into_iter()
        .map(|input_path| {
            let output = input_path.with_extension("out");
            Testcase {
                output_path: output.is_file().then_some(output),
                input_path,
            }
        })
        .collect())
}
