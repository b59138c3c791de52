use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::JudgeError;
use crate::sandbox::{SandboxKind, SandboxParams};

const MIB: u64 = 1024 * 1024;

/// Resource envelope of a sandboxed command
///
/// Every field is optional so that layers can be merged: a field set in an
/// override wins, an unset field keeps the base value. Time limits are in
/// milliseconds, memory and stack limits in MiB, the file size limit in KiB.
/// `extraTimeLimit` is grace time added on top of both time limits before the
/// process is killed; runs inside the grace are still judged against the
/// nominal limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentSandbox {
    pub max_processes: Option<u32>,
    pub time_limit: Option<u64>,
    pub wall_time_limit: Option<u64>,
    pub extra_time_limit: Option<u64>,
    pub memory_limit: Option<u64>,
    pub stack_limit: Option<u64>,
    pub file_size_limit: Option<u64>,
    pub preserve_env: Option<bool>,
    pub mirror_dirs: Option<Vec<PathBuf>>,
}

impl EnvironmentSandbox {
    /// Values used when no layer sets a field
    pub fn builtin_defaults() -> Self {
        Self {
            max_processes: Some(1),
            time_limit: Some(1000),
            wall_time_limit: Some(2000),
            extra_time_limit: None,
            memory_limit: Some(256),
            stack_limit: None,
            file_size_limit: None,
            preserve_env: Some(false),
            mirror_dirs: Some(Vec::new()),
        }
    }

    pub fn merge(&self, over: &Self) -> Self {
        Self {
            max_processes: over.max_processes.or(self.max_processes),
            time_limit: over.time_limit.or(self.time_limit),
            wall_time_limit: over.wall_time_limit.or(self.wall_time_limit),
            extra_time_limit: over.extra_time_limit.or(self.extra_time_limit),
            memory_limit: over.memory_limit.or(self.memory_limit),
            stack_limit: over.stack_limit.or(self.stack_limit),
            file_size_limit: over.file_size_limit.or(self.file_size_limit),
            preserve_env: over.preserve_env.or(self.preserve_env),
            mirror_dirs: over.mirror_dirs.clone().or_else(|| self.mirror_dirs.clone()),
        }
    }

    pub fn to_params(&self) -> SandboxParams {
        SandboxParams {
            max_processes: self.max_processes.unwrap_or(1),
            timeout_ms: self.time_limit,
            wallclock_timeout_ms: self.wall_time_limit,
            extra_timeout_ms: self.extra_time_limit,
            memory_limit_bytes: self.memory_limit.map(|mib| mib * MIB),
            stack_limit_bytes: self.stack_limit.map(|mib| mib * MIB),
            fsize_kib: self.file_size_limit,
            preserve_env: self.preserve_env.unwrap_or(false),
            mirror_dirs: self.mirror_dirs.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

fn merge_sandbox(
    base: &Option<EnvironmentSandbox>,
    over: &Option<EnvironmentSandbox>,
) -> Option<EnvironmentSandbox> {
    match (base, over) {
        (Some(base), Some(over)) => Some(base.merge(over)),
        (base, None) => base.clone(),
        (None, over) => over.clone(),
    }
}

/// Sandbox-relative paths of the files a language works with
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMapping {
    #[serde(alias = "stdin")]
    pub input: Option<String>,
    #[serde(alias = "stdout")]
    pub output: Option<String>,
    pub compilable: Option<String>,
    pub executable: Option<String>,
}

impl FileMapping {
    pub fn merge(&self, over: &Self) -> Self {
        Self {
            input: over.input.clone().or_else(|| self.input.clone()),
            output: over.output.clone().or_else(|| self.output.clone()),
            compilable: over.compilable.clone().or_else(|| self.compilable.clone()),
            executable: over.executable.clone().or_else(|| self.executable.clone()),
        }
    }
}

/// A [`FileMapping`] with every path decided
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFileMapping {
    pub input: PathBuf,
    pub output: PathBuf,
    pub compilable: PathBuf,
    pub executable: PathBuf,
}

impl From<FileMapping> for ResolvedFileMapping {
    fn from(mapping: FileMapping) -> Self {
        let path = |value: Option<String>, default: &str| {
            PathBuf::from(value.unwrap_or_else(|| default.to_string()))
        };
        Self {
            input: path(mapping.input, "stdin"),
            output: path(mapping.output, "stdout"),
            compilable: path(mapping.compilable, "compilable"),
            executable: path(mapping.executable, "executable"),
        }
    }
}

impl ResolvedFileMapping {
    /// Substitutes `%{compilable}`, `%{executable}`, `%{stdin}` and `%{stdout}`
    pub fn apply(&self, template: &str) -> String {
        [
            ("%{compilable}", &self.compilable),
            ("%{executable}", &self.executable),
            ("%{stdin}", &self.input),
            ("%{stdout}", &self.output),
        ]
        .iter()
        .fold(template.to_string(), |acc, (var, path)| {
            acc.replace(var, &path.to_string_lossy())
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompilationConfig {
    pub commands: Option<Vec<String>>,
    pub sandbox: Option<EnvironmentSandbox>,
}

impl CompilationConfig {
    pub fn merge(&self, over: &Self) -> Self {
        Self {
            commands: over.commands.clone().or_else(|| self.commands.clone()),
            sandbox: merge_sandbox(&self.sandbox, &over.sandbox),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionConfig {
    pub command: Option<String>,
    pub sandbox: Option<EnvironmentSandbox>,
}

impl ExecutionConfig {
    pub fn merge(&self, over: &Self) -> Self {
        Self {
            command: over.command.clone().or_else(|| self.command.clone()),
            sandbox: merge_sandbox(&self.sandbox, &over.sandbox),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentLanguage {
    pub name: String,
    pub extension: String,
    pub compilation: Option<CompilationConfig>,
    #[serde(default)]
    pub execution: ExecutionConfig,
    pub file_mapping: Option<FileMapping>,
}

/// Compilation settings with every layer applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCompilation {
    /// Empty when the language is not compiled
    pub commands: Vec<String>,
    pub sandbox: EnvironmentSandbox,
}

/// Execution settings with every layer applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedExecution {
    pub command: String,
    pub sandbox: EnvironmentSandbox,
}

/// Declares the sandbox backend, defaults and per-language overrides
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub default_file_mapping: Option<FileMapping>,
    pub default_compilation: Option<CompilationConfig>,
    pub default_execution: Option<ExecutionConfig>,
    #[serde(default)]
    pub languages: Vec<EnvironmentLanguage>,
    #[serde(default)]
    pub sandbox: SandboxKind,
}

impl Environment {
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| JudgeError::Config(format!("invalid environment: {e}")).into())
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| JudgeError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json(&content)
    }

    pub fn language(&self, name: &str) -> Result<&EnvironmentLanguage> {
        self.languages
            .iter()
            .find(|l| l.name == name)
            .ok_or_else(|| JudgeError::UnknownLanguage(name.to_string()).into())
    }

    /// Picks the declared language, or the unique language handling the file
    /// extension of `path`
    pub fn detect_language(
        &self,
        path: &Path,
        declared: Option<&str>,
    ) -> Result<&EnvironmentLanguage> {
        if let Some(name) = declared {
            return self.language(name);
        }
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        let mut candidates = self.languages.iter().filter(|l| l.extension == extension);
        match (candidates.next(), candidates.next()) {
            (Some(language), None) => Ok(language),
            _ => self
                .languages
                .iter()
                .find(|l| l.name == extension)
                .ok_or_else(|| JudgeError::UndetectableLanguage(path.to_path_buf()).into()),
        }
    }

    pub fn resolve_file_mapping(&self, language: &EnvironmentLanguage) -> ResolvedFileMapping {
        let mut mapping = self.default_file_mapping.clone().unwrap_or_default();
        if let Some(over) = &language.file_mapping {
            mapping = mapping.merge(over);
        }
        mapping.into()
    }

    pub fn resolve_compilation(&self, language: &EnvironmentLanguage) -> ResolvedCompilation {
        let mut config = self.default_compilation.clone().unwrap_or_default();
        if let Some(over) = &language.compilation {
            config = config.merge(over);
        }
        let sandbox = match &config.sandbox {
            Some(over) => EnvironmentSandbox::builtin_defaults().merge(over),
            None => EnvironmentSandbox::builtin_defaults(),
        };
        ResolvedCompilation {
            commands: config.commands.unwrap_or_default(),
            sandbox,
        }
    }

    /// Resolves the execution command and limits, applying `extra` last
    pub fn resolve_execution(
        &self,
        language: &EnvironmentLanguage,
        extra: Option<&ExecutionConfig>,
    ) -> Result<ResolvedExecution> {
        let mut config = self
            .default_execution
            .clone()
            .unwrap_or_default()
            .merge(&language.execution);
        if let Some(extra) = extra {
            config = config.merge(extra);
        }
        let command = config.command.ok_or_else(|| {
            JudgeError::Config(format!("language `{}` has no execution command", language.name))
        })?;
        let sandbox = match &config.sandbox {
            Some(over) => EnvironmentSandbox::builtin_defaults().merge(over),
            None => EnvironmentSandbox::builtin_defaults(),
        };
        Ok(ResolvedExecution { command, sandbox })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const ENVIRONMENT: &str = r#"{
        "sandbox": "stupid",
        "defaultFileMapping": { "compilable": "main.src" },
        "defaultCompilation": {
            "sandbox": { "maxProcesses": 1000, "timeLimit": 10000, "wallTimeLimit": 10000, "memoryLimit": 1024 }
        },
        "defaultExecution": {
            "sandbox": { "timeLimit": 3000, "extraTimeLimit": 200, "fileSizeLimit": 65536, "mirrorDirs": ["/usr/share"] }
        },
        "languages": [
            {
                "name": "cpp",
                "extension": "cpp",
                "compilation": { "commands": ["g++ -O2 %{compilable} -o %{executable}"] },
                "execution": { "command": "./%{executable}" },
                "fileMapping": { "compilable": "main.cpp" }
            },
            {
                "name": "py",
                "extension": "py",
                "execution": {
                    "command": "python3 %{compilable}",
                    "sandbox": { "memoryLimit": 512, "preserveEnv": true }
                }
            },
            { "name": "py2", "extension": "py", "execution": { "command": "python2 %{compilable}" } }
        ]
    }"#;

    fn environment() -> Environment {
        Environment::from_json(ENVIRONMENT).unwrap()
    }

    #[test]
    fn test_sandbox_merge_every_field() {
        let base = EnvironmentSandbox::builtin_defaults();
        let over = EnvironmentSandbox {
            max_processes: Some(4),
            time_limit: Some(500),
            wall_time_limit: Some(900),
            extra_time_limit: Some(250),
            memory_limit: Some(64),
            stack_limit: Some(32),
            file_size_limit: Some(4096),
            preserve_env: Some(true),
            mirror_dirs: Some(vec![PathBuf::from("/opt")]),
        };
        assert_eq!(base.merge(&over), over);
        assert_eq!(base.merge(&EnvironmentSandbox::default()), base);
        assert_eq!(over.merge(&EnvironmentSandbox::default()), over);
    }

    #[test]
    fn test_sandbox_merge_keeps_unset_fields() {
        let base = EnvironmentSandbox::builtin_defaults();
        let over = EnvironmentSandbox {
            memory_limit: Some(64),
            ..Default::default()
        };
        let merged = base.merge(&over);
        assert_eq!(merged.memory_limit, Some(64));
        assert_eq!(merged.time_limit, Some(1000));
        assert_eq!(merged.wall_time_limit, Some(2000));
        assert_eq!(merged.max_processes, Some(1));
        assert_eq!(merged.preserve_env, Some(false));
        assert_eq!(merged.stack_limit, None);
        assert_eq!(merged.extra_time_limit, None);
        assert_eq!(merged.file_size_limit, None);
    }

    #[test]
    fn test_file_mapping_merge() {
        let env = environment();
        let cpp = env.language("cpp").unwrap();
        let py = env.language("py").unwrap();

        let cpp_files = env.resolve_file_mapping(cpp);
        assert_eq!(cpp_files.compilable, PathBuf::from("main.cpp"));
        assert_eq!(cpp_files.executable, PathBuf::from("executable"));
        assert_eq!(cpp_files.input, PathBuf::from("stdin"));
        assert_eq!(cpp_files.output, PathBuf::from("stdout"));

        assert_eq!(env.resolve_file_mapping(py).compilable, PathBuf::from("main.src"));
    }

    #[test]
    fn test_template_substitution() {
        let env = environment();
        let files = env.resolve_file_mapping(env.language("cpp").unwrap());
        assert_eq!(
            files.apply("g++ %{compilable} -o %{executable} < %{stdin} > %{stdout}"),
            "g++ main.cpp -o executable < stdin > stdout"
        );
    }

    #[test]
    fn test_compilation_layers() {
        let env = environment();
        let cpp = env.resolve_compilation(env.language("cpp").unwrap());
        assert_eq!(cpp.commands, vec!["g++ -O2 %{compilable} -o %{executable}"]);
        assert_eq!(cpp.sandbox.max_processes, Some(1000));
        assert_eq!(cpp.sandbox.time_limit, Some(10000));
        assert_eq!(cpp.sandbox.memory_limit, Some(1024));

        let py = env.resolve_compilation(env.language("py").unwrap());
        assert!(py.commands.is_empty());
    }

    #[test]
    fn test_execution_layers() {
        let env = environment();
        let py = env.language("py").unwrap();

        let resolved = env.resolve_execution(py, None).unwrap();
        assert_eq!(resolved.command, "python3 %{compilable}");
        assert_eq!(resolved.sandbox.time_limit, Some(3000));
        assert_eq!(resolved.sandbox.memory_limit, Some(512));
        assert_eq!(resolved.sandbox.preserve_env, Some(true));
        assert_eq!(resolved.sandbox.wall_time_limit, Some(2000));
        assert_eq!(resolved.sandbox.mirror_dirs, Some(vec![PathBuf::from("/usr/share")]));
        assert_eq!(resolved.sandbox.extra_time_limit, Some(200));
        assert_eq!(resolved.sandbox.file_size_limit, Some(65536));

        let extra = ExecutionConfig {
            command: None,
            sandbox: Some(EnvironmentSandbox {
                time_limit: Some(2000),
                ..Default::default()
            }),
        };
        let resolved = env.resolve_execution(py, Some(&extra)).unwrap();
        assert_eq!(resolved.command, "python3 %{compilable}");
        assert_eq!(resolved.sandbox.time_limit, Some(2000));
        assert_eq!(resolved.sandbox.memory_limit, Some(512));
    }

    #[test]
    fn test_missing_execution_command() {
        let env = Environment::from_json(r#"{ "languages": [{ "name": "x", "extension": "x" }] }"#)
            .unwrap();
        let err = env.resolve_execution(env.language("x").unwrap(), None).unwrap_err();
        assert!(matches!(err.downcast_ref::<JudgeError>(), Some(JudgeError::Config(_))));
    }

    #[test]
    fn test_language_detection() {
        let env = environment();
        assert_eq!(env.detect_language(Path::new("sol.cpp"), None).unwrap().name, "cpp");
        assert_eq!(
            env.detect_language(Path::new("sol.cpp"), Some("py2")).unwrap().name,
            "py2"
        );
        // Two languages claim `.py`; the one named after the extension wins.
        assert_eq!(env.detect_language(Path::new("sol.py"), None).unwrap().name, "py");

        let err = env.detect_language(Path::new("sol.rs"), None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<JudgeError>(),
            Some(JudgeError::UndetectableLanguage(_))
        ));
        let err = env.language("java").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<JudgeError>(),
            Some(JudgeError::UnknownLanguage(_))
        ));
    }

    #[test]
    fn test_params_conversion() {
        let params = EnvironmentSandbox {
            stack_limit: Some(8),
            extra_time_limit: Some(500),
            file_size_limit: Some(1024),
            ..EnvironmentSandbox::builtin_defaults()
        }
        .to_params();
        assert_eq!(params.timeout_ms, Some(1000));
        assert_eq!(params.wallclock_timeout_ms, Some(2000));
        assert_eq!(params.memory_limit_bytes, Some(256 * MIB));
        assert_eq!(params.stack_limit_bytes, Some(8 * MIB));
        assert_eq!(params.extra_timeout_ms, Some(500));
        assert_eq!(params.hard_timeout_ms(), Some(1500));
        assert_eq!(params.fsize_kib, Some(1024));
        assert_eq!(params.max_processes, 1);
        assert!(!params.preserve_env);
    }

    #[test]
    fn test_sandbox_backend() {
        assert_eq!(environment().sandbox, SandboxKind::Process);
        assert_eq!(Environment::default().sandbox, SandboxKind::Process);
    }
}
