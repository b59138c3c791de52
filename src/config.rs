use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use directories::ProjectDirs;

use crate::environment::Environment;
use crate::verdict::VerificationLevel;

/// Environment used when neither `--env` nor a user-level file exists
pub const DEFAULT_ENVIRONMENT: &str = r#"{
  "sandbox": "process",
  "defaultFileMapping": {
    "input": "stdin",
    "output": "stdout",
    "compilable": "compilable",
    "executable": "executable"
  },
  "defaultCompilation": {
    "sandbox": {
      "maxProcesses": 1000,
      "timeLimit": 10000,
      "wallTimeLimit": 10000,
      "memoryLimit": 1024,
      "preserveEnv": true
    }
  },
  "defaultExecution": {
    "sandbox": { "maxProcesses": 1 }
  },
  "languages": [
    {
      "name": "cpp",
      "extension": "cpp",
      "compilation": {
        "commands": ["g++ -std=c++17 -O2 -lm %{compilable} -o %{executable}"]
      },
      "execution": { "command": "./%{executable}" },
      "fileMapping": { "compilable": "compilable.cpp" }
    },
    {
      "name": "c",
      "extension": "c",
      "compilation": {
        "commands": ["gcc -std=c11 -O2 -lm %{compilable} -o %{executable}"]
      },
      "execution": { "command": "./%{executable}" },
      "fileMapping": { "compilable": "compilable.c" }
    },
    {
      "name": "py",
      "extension": "py",
      "execution": { "command": "python3 %{executable}" }
    },
    {
      "name": "sh",
      "extension": "sh",
      "execution": {
        "command": "sh %{executable}",
        "sandbox": { "maxProcesses": 1000 }
      }
    }
  ]
}"#;

#[derive(Parser, Debug)]
#[command(name = "judgebox", version, about, long_about = None)]
pub struct CliArgs {
    /// Root directory of the problem package
    #[arg(long = "package", short = 'p', default_value = ".")]
    pub package: PathBuf,

    /// Path to the environment file
    #[arg(long = "env")]
    pub env_path: Option<PathBuf>,

    /// Verification level, 0 (none) to 4 (full)
    #[arg(long = "verification", short = 'v', default_value_t = 4,
          value_parser = clap::value_parser!(u8).range(0..=4))]
    pub verification: u8,

    /// Number of concurrent sandboxes
    #[arg(long = "threads", short = 't')]
    pub threads: Option<u32>,

    /// Only evaluate these solutions, relative to the package root
    #[arg(long = "solution", short = 's')]
    pub solutions: Vec<PathBuf>,

    /// Directory sandbox roots are created in
    #[arg(long = "temp-dir")]
    pub temp_dir: Option<PathBuf>,
}

impl CliArgs {
    pub fn verification_level(&self) -> Result<VerificationLevel> {
        VerificationLevel::try_from(self.verification).map_err(anyhow::Error::msg)
    }

    /// Loads `--env`, else the user-level environment file, else the
    /// built-in one
    pub fn load_environment(&self) -> Result<Environment> {
        if let Some(path) = &self.env_path {
            return Environment::from_path(path);
        }
        if let Some(path) = user_environment_path().filter(|p| p.is_file()) {
            log::info!("Using environment {}", path.display());
            return Environment::from_path(&path);
        }
        log::debug!("Using the built-in environment");
        Environment::from_json(DEFAULT_ENVIRONMENT)
    }

    /// Solution filter resolved against the package root
    pub fn tracked_solutions(&self) -> Option<std::collections::HashSet<PathBuf>> {
        if self.solutions.is_empty() {
            return None;
        }
        Some(
            self.solutions
                .iter()
                .map(|p| {
                    if p.is_absolute() {
                        p.clone()
                    } else {
                        self.package.join(p)
                    }
                })
                .collect(),
        )
    }
}

pub fn user_environment_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "judgebox").map(|dirs| dirs.config_dir().join("environment.json"))
}
