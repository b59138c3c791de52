use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;

use crate::cache::{ArtifactCache, DependencyCache, FilesystemCache};
use crate::environment::Environment;
use crate::package::{Package, Testcase, TestcaseGroup, find_built_testcases};
use crate::sandbox::{self, Sandbox, SandboxKind, SlotPool};
use crate::verdict::VerificationLevel;

/// Everything one judging invocation needs, built once and passed down
///
/// Nothing in here is mutated while solutions are evaluated, apart from the
/// internally synchronized caches and slot pool.
pub struct JudgeContext {
    pub root: PathBuf,
    pub package: Package,
    pub environment: Environment,
    pub cache: Arc<dyn ArtifactCache>,
    pub dependency_cache: DependencyCache,
    pub slots: SlotPool,
    pub temp_dir: PathBuf,
    pub verification: VerificationLevel,
}

impl JudgeContext {
    /// Opens the package at `root` with its on-disk artifact storage
    pub fn open(root: &Path, environment: Environment) -> Result<Self> {
        let package = Package::load(root)?;
        let cache = FilesystemCache::open(storage_dir(root))?;
        let dependency_cache = DependencyCache::open(box_dir(root).join("compilation.json"))?;
        Ok(Self::new(root, package, environment)
            .with_cache(Arc::new(cache), dependency_cache))
    }

    /// Context with an in-memory compilation index over `<root>/.box/.storage`
    ///
    /// Falls back to a cache that stores nothing when the storage directory
    /// cannot be created.
    pub fn new(root: &Path, package: Package, environment: Environment) -> Self {
        let cache: Arc<dyn ArtifactCache> = match FilesystemCache::open(storage_dir(root)) {
            Ok(cache) => Arc::new(cache),
            Err(e) => {
                log::warn!("Artifact storage unavailable, caching disabled: {e}");
                Arc::new(crate::cache::NullCache)
            }
        };
        Self {
            root: root.to_path_buf(),
            package,
            environment,
            cache,
            dependency_cache: DependencyCache::in_memory(),
            slots: SlotPool::new(default_parallelism()),
            temp_dir: std::env::temp_dir(),
            verification: VerificationLevel::None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn ArtifactCache>, deps: DependencyCache) -> Self {
        self.cache = cache;
        self.dependency_cache = deps;
        self
    }

    pub fn with_slots(mut self, slots: u32) -> Self {
        self.slots = SlotPool::new(slots);
        self
    }

    pub fn with_temp_dir(mut self, temp_dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = temp_dir.into();
        self
    }

    pub fn with_verification(mut self, verification: VerificationLevel) -> Self {
        self.verification = verification;
        self
    }

    pub fn sandbox_kind(&self) -> SandboxKind {
        self.environment.sandbox
    }

    /// Initializes a sandbox, blocking until an execution slot is free
    pub fn create_sandbox(&self, name: &str) -> Result<Box<dyn Sandbox>> {
        let slot = self.slots.acquire();
        sandbox::create_sandbox(self.sandbox_kind(), name, slot, &self.temp_dir)
    }

    pub fn runs_dir(&self) -> PathBuf {
        box_dir(&self.root).join("runs")
    }

    pub fn built_tests_dir(&self, group: &str) -> PathBuf {
        self.root.join("build").join("tests").join(group)
    }

    /// Declared testcases of `group` followed by the built ones
    pub fn testcases(&self, group: &TestcaseGroup) -> Result<Vec<Testcase>> {
        let mut testcases = group.testcases.clone();
        testcases.extend(find_built_testcases(&self.built_tests_dir(&group.name))?);
        Ok(testcases)
    }
}

fn box_dir(root: &Path) -> PathBuf {
    root.join(".box")
}

pub fn storage_dir(root: &Path) -> PathBuf {
    box_dir(root).join(".storage")
}

fn default_parallelism() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}
