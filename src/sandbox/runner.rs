use std::fs::{self, File};
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::cache::{ArtifactCache, Digest};

use super::{RunLog, SandboxParams, Truncator};

const EXECUTABLE_MODE: u32 = 0o755;
const REGULAR_MODE: u32 = 0o644;

/// Isolated execution context with a private filesystem root
///
/// Backends implement `execute` and `cleanup`; file operations are provided on
/// top of `root` and only ever touch paths inside it.
pub trait Sandbox: Send {
    fn name(&self) -> &str;

    /// Absolute path of the sandbox root
    fn root(&self) -> &Path;

    /// Runs `command` through `/bin/sh -c` with the working directory at the
    /// root (or `params.chdir` below it)
    ///
    /// Failures of the isolation mechanism itself are reported as a
    /// [`RunLog`] with [`super::ExitStatus::SandboxError`].
    fn execute(&mut self, command: &str, params: &SandboxParams) -> RunLog;

    /// Tears the sandbox down, deleting the root when `delete` is set
    fn cleanup(&mut self, delete: bool) -> Result<()>;

    /// Resolves a root-relative path, refusing anything that could escape it
    fn relative_path(&self, path: &Path) -> Result<PathBuf> {
        if path.as_os_str().is_empty() {
            bail!("empty path in sandbox `{}`", self.name());
        }
        for component in path.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => bail!(
                    "path {} is not relative to sandbox `{}`",
                    path.display(),
                    self.name()
                ),
            }
        }
        Ok(self.root().join(path))
    }

    fn create_file(&self, path: &Path, executable: bool) -> Result<File> {
        let real = self.relative_path(path)?;
        if let Some(parent) = real.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(&real)
            .with_context(|| format!("failed to create {} in sandbox", path.display()))?;
        let mode = if executable { EXECUTABLE_MODE } else { REGULAR_MODE };
        fs::set_permissions(&real, fs::Permissions::from_mode(mode))?;
        Ok(file)
    }

    fn create_file_from_bytes(&self, path: &Path, content: &[u8], executable: bool) -> Result<()> {
        let mut file = self.create_file(path, executable)?;
        io::Write::write_all(&mut file, content)?;
        Ok(())
    }

    fn create_file_from_storage(
        &self,
        path: &Path,
        cache: &dyn ArtifactCache,
        digest: &Digest,
        executable: bool,
    ) -> Result<()> {
        let mut reader = cache.get_reader(digest)?;
        let mut file = self.create_file(path, executable)?;
        io::copy(&mut reader, &mut file)?;
        Ok(())
    }

    fn create_file_from_other_file(
        &self,
        path: &Path,
        source: &Path,
        executable: bool,
    ) -> Result<()> {
        let mut reader = File::open(source)
            .with_context(|| format!("failed to open {}", source.display()))?;
        let mut file = self.create_file(path, executable)?;
        io::copy(&mut reader, &mut file)?;
        Ok(())
    }

    fn get_file(&self, path: &Path) -> Result<File> {
        let real = self.relative_path(path)?;
        File::open(&real).with_context(|| {
            format!("failed to open {} in sandbox `{}`", path.display(), self.name())
        })
    }

    fn get_file_truncated(&self, path: &Path, maxlen: u64) -> Result<Truncator<File>> {
        Ok(Truncator::new(self.get_file(path)?, maxlen)?)
    }

    fn get_file_to_bytes(&self, path: &Path, maxlen: Option<u64>) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        match maxlen {
            Some(limit) => self.get_file_truncated(path, limit)?.read_to_end(&mut buf)?,
            None => self.get_file(path)?.read_to_end(&mut buf)?,
        };
        Ok(buf)
    }

    fn get_file_to_string(&self, path: &Path, maxlen: Option<u64>) -> Result<String> {
        let bytes = self.get_file_to_bytes(path, maxlen)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn get_file_to_storage(
        &self,
        path: &Path,
        cache: &dyn ArtifactCache,
        maxlen: Option<u64>,
    ) -> Result<Digest> {
        let digest = match maxlen {
            Some(limit) => cache.put_reader(&mut self.get_file_truncated(path, limit)?)?,
            None => cache.put_reader(&mut self.get_file(path)?)?,
        };
        Ok(digest)
    }

    fn stat_file(&self, path: &Path) -> Result<fs::Metadata> {
        Ok(fs::metadata(self.relative_path(path)?)?)
    }

    fn file_exists(&self, path: &Path) -> bool {
        self.relative_path(path).is_ok_and(|real| real.exists())
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        Ok(fs::remove_file(self.relative_path(path)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::FilesystemCache;
    use crate::sandbox::{SimpleRunner, SlotPool};

    #[test]
    fn test_staging_through_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FilesystemCache::open(dir.path().join("storage")).unwrap();
        let pool = SlotPool::new(1);
        let sandbox = SimpleRunner::build("files", pool.acquire(), dir.path()).unwrap();

        let digest = cache.put_bytes(b"#!/bin/sh\necho hi\n").unwrap();
        sandbox
            .create_file_from_storage(Path::new("bin/run"), &cache, &digest, true)
            .unwrap();
        let mode = sandbox.stat_file(Path::new("bin/run")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, EXECUTABLE_MODE);

        let back = sandbox
            .get_file_to_storage(Path::new("bin/run"), &cache, None)
            .unwrap();
        assert_eq!(back, digest);
        let head = sandbox
            .get_file_to_storage(Path::new("bin/run"), &cache, Some(9))
            .unwrap();
        assert_eq!(cache.get_string(&head).unwrap(), "#!/bin/sh");

        sandbox.remove_file(Path::new("bin/run")).unwrap();
        assert!(!sandbox.file_exists(Path::new("bin/run")));
        assert!(sandbox.create_file(Path::new("../escape"), false).is_err());
    }
}
