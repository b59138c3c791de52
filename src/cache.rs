use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use tempfile::NamedTempFile;

use crate::error::CacheError;

/// Content hash identifying a stored artifact (lowercase hex SHA-256)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Incremental hasher producing [`Digest`] values
#[derive(Default)]
pub struct Digester(Sha256);

impl Digester {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: impl AsRef<[u8]>) {
        self.0.update(data.as_ref());
    }

    pub fn finalize(self) -> Digest {
        Digest(hex::encode(self.0.finalize()))
    }
}

impl Write for Digester {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn digest_bytes(data: &[u8]) -> Digest {
    let mut digester = Digester::new();
    digester.update(data);
    digester.finalize()
}

/// Content-addressed storage for artifacts staged into and out of sandboxes
///
/// Storing identical content twice yields the same digest and a single stored
/// copy. Implementations must be safe for concurrent `put` and `get`.
pub trait ArtifactCache: Send + Sync {
    /// Stores everything `reader` yields and returns its digest
    fn put_reader(&self, reader: &mut dyn Read) -> Result<Digest, CacheError>;

    /// Opens a stored artifact for reading
    fn get_reader(&self, digest: &Digest) -> Result<Box<dyn Read + Send>, CacheError>;

    fn exists(&self, digest: &Digest) -> bool;

    fn put_bytes(&self, data: &[u8]) -> Result<Digest, CacheError> {
        let mut reader = data;
        self.put_reader(&mut reader)
    }

    fn put_file(&self, path: &Path) -> Result<Digest, CacheError> {
        let mut file = File::open(path)?;
        self.put_reader(&mut file)
    }

    fn get_bytes(&self, digest: &Digest) -> Result<Vec<u8>, CacheError> {
        let mut buf = Vec::new();
        self.get_reader(digest)?.read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn get_string(&self, digest: &Digest) -> Result<String, CacheError> {
        let bytes = self.get_bytes(digest)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Materializes a stored artifact at `path`, creating parent directories
    fn get_to_path(&self, digest: &Digest, path: &Path) -> Result<(), CacheError> {
        let mut reader = self.get_reader(digest)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(path)?;
        io::copy(&mut reader, &mut file)?;
        Ok(())
    }
}

/// Digests currently being written, so concurrent writers of the same content
/// collapse into one physical write
#[derive(Default)]
struct InFlight {
    digests: Mutex<HashSet<Digest>>,
    released: Condvar,
}

struct InFlightGuard<'a> {
    in_flight: &'a InFlight,
    digest: Digest,
}

impl InFlight {
    fn acquire(&self, digest: &Digest) -> InFlightGuard<'_> {
        let mut digests = self.digests.lock();
        while digests.contains(digest) {
            self.released.wait(&mut digests);
        }
        digests.insert(digest.clone());
        InFlightGuard {
            in_flight: self,
            digest: digest.clone(),
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.digests.lock().remove(&self.digest);
        self.in_flight.released.notify_all();
    }
}

/// One file per digest under a storage directory
///
/// Entries are written to a temporary file in the same directory and renamed
/// into place, so readers never observe a partially written artifact.
pub struct FilesystemCache {
    dir: PathBuf,
    in_flight: InFlight,
}

impl FilesystemCache {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        log::debug!("Artifact cache opened at {}", dir.display());
        Ok(Self {
            dir,
            in_flight: InFlight::default(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, digest: &Digest) -> PathBuf {
        self.dir.join(digest.as_str())
    }

    fn commit(&self, digest: &Digest, tmp: NamedTempFile) -> Result<(), CacheError> {
        let _guard = self.in_flight.acquire(digest);
        if self.exists(digest) {
            return Ok(());
        }
        match tmp.persist_noclobber(self.entry_path(digest)) {
            Ok(_) => Ok(()),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(CacheError::Io(e.error)),
        }
    }
}

impl ArtifactCache for FilesystemCache {
    fn put_reader(&self, reader: &mut dyn Read) -> Result<Digest, CacheError> {
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        let mut digester = Digester::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            digester.update(&buf[..n]);
            tmp.write_all(&buf[..n])?;
        }
        tmp.flush()?;
        let digest = digester.finalize();
        self.commit(&digest, tmp)?;
        Ok(digest)
    }

    fn put_bytes(&self, data: &[u8]) -> Result<Digest, CacheError> {
        let digest = digest_bytes(data);
        if self.exists(&digest) {
            return Ok(digest);
        }
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(data)?;
        tmp.flush()?;
        self.commit(&digest, tmp)?;
        Ok(digest)
    }

    fn get_reader(&self, digest: &Digest) -> Result<Box<dyn Read + Send>, CacheError> {
        match File::open(self.entry_path(digest)) {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(CacheError::NotFound(digest.clone()))
            }
            Err(e) => Err(CacheError::Io(e)),
        }
    }

    fn exists(&self, digest: &Digest) -> bool {
        self.entry_path(digest).is_file()
    }
}

/// Computes digests but stores nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCache;

impl ArtifactCache for NullCache {
    fn put_reader(&self, reader: &mut dyn Read) -> Result<Digest, CacheError> {
        let mut digester = Digester::new();
        io::copy(reader, &mut digester)?;
        Ok(digester.finalize())
    }

    fn get_reader(&self, digest: &Digest) -> Result<Box<dyn Read + Send>, CacheError> {
        Err(CacheError::NotFound(digest.clone()))
    }

    fn exists(&self, _digest: &Digest) -> bool {
        false
    }
}

/// Memoizes compilations: hash of (commands, staged input digests) to the
/// digest of the produced executable
pub struct DependencyCache {
    path: Option<PathBuf>,
    entries: Mutex<HashMap<String, Digest>>,
}

impl DependencyCache {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Loads entries from a JSON index, starting empty when it does not exist
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                log::warn!("Ignoring corrupt compilation index {}: {e}", path.display());
                HashMap::new()
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: Some(path),
            entries: Mutex::new(entries),
        })
    }

    pub fn key<S: AsRef<str>>(commands: &[S], inputs: &[(String, Digest)]) -> String {
        let mut digester = Digester::new();
        for command in commands {
            digester.update(command.as_ref());
            digester.update([0u8]);
        }
        digester.update([1u8]);
        for (name, digest) in inputs {
            digester.update(name);
            digester.update([0u8]);
            digester.update(digest.as_str());
            digester.update([0u8]);
        }
        digester.finalize().0
    }

    /// Returns the memoized digest if it is still present in `cache`
    pub fn lookup(&self, key: &str, cache: &dyn ArtifactCache) -> Option<Digest> {
        let digest = self.entries.lock().get(key).cloned()?;
        if cache.exists(&digest) {
            Some(digest)
        } else {
            log::debug!("Compilation entry {key} points at missing artifact {digest}");
            None
        }
    }

    pub fn record(&self, key: String, digest: Digest) -> Result<(), CacheError> {
        let mut entries = self.entries.lock();
        entries.insert(key, digest);
        if let Some(path) = &self.path {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let content = serde_json::to_string_pretty(&*entries).map_err(io::Error::other)?;
            fs::write(path, content)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_put_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FilesystemCache::open(dir.path()).unwrap();

        let first = cache.put_bytes(b"hello world\n").unwrap();
        let second = cache.put_reader(&mut &b"hello world\n"[..]).unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.get_bytes(&first).unwrap(), b"hello world\n");

        let stored: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(stored.len(), 1);
    }

    #[test]
    fn test_digest_is_sha256_hex() {
        assert_eq!(
            digest_bytes(b"abc").as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_missing_digest_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FilesystemCache::open(dir.path()).unwrap();
        let digest = digest_bytes(b"never stored");
        assert!(matches!(
            cache.get_bytes(&digest),
            Err(CacheError::NotFound(d)) if d == digest
        ));
    }

    #[test]
    fn test_concurrent_puts_collapse() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(FilesystemCache::open(dir.path()).unwrap());
        let content = vec![7u8; 256 * 1024];

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let content = content.clone();
                thread::spawn(move || cache.put_bytes(&content).unwrap())
            })
            .collect();
        let digests: HashSet<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(digests.len(), 1);
        let digest = digests.into_iter().next().unwrap();
        assert_eq!(cache.get_bytes(&digest).unwrap(), content);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_null_cache_stores_nothing() {
        let cache = NullCache;
        let digest = cache.put_bytes(b"data").unwrap();
        assert_eq!(digest, digest_bytes(b"data"));
        assert!(!cache.exists(&digest));
        assert!(matches!(cache.get_bytes(&digest), Err(CacheError::NotFound(_))));
    }

    #[test]
    fn test_get_to_path_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FilesystemCache::open(dir.path().join("storage")).unwrap();
        let digest = cache.put_bytes(b"42\n").unwrap();

        let target = dir.path().join("out/nested/answer.txt");
        cache.get_to_path(&digest, &target).unwrap();
        assert_eq!(fs::read_to_string(target).unwrap(), "42\n");
    }

    #[test]
    fn test_dependency_cache_persists_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FilesystemCache::open(dir.path().join("storage")).unwrap();
        let index = dir.path().join("compilation.json");

        let source = cache.put_bytes(b"int main() {}").unwrap();
        let key = DependencyCache::key(
            &["g++ main.cpp -o main"],
            &[("main.cpp".to_string(), source.clone())],
        );
        let executable = cache.put_bytes(b"\x7fELF").unwrap();

        let deps = DependencyCache::open(&index).unwrap();
        assert_eq!(deps.lookup(&key, &cache), None);
        deps.record(key.clone(), executable.clone()).unwrap();

        let reopened = DependencyCache::open(&index).unwrap();
        assert_eq!(reopened.lookup(&key, &cache), Some(executable));

        let dangling = digest_bytes(b"gone");
        reopened.record(key.clone(), dangling).unwrap();
        assert_eq!(reopened.lookup(&key, &cache), None);
    }

    #[test]
    fn test_dependency_key_depends_on_inputs() {
        let a = digest_bytes(b"a");
        let b = digest_bytes(b"b");
        let commands = ["cc main.c"];
        assert_ne!(
            DependencyCache::key(&commands, &[("main.c".into(), a.clone())]),
            DependencyCache::key(&commands, &[("main.c".into(), b)])
        );
        assert_ne!(
            DependencyCache::key(&commands, &[("main.c".into(), a.clone())]),
            DependencyCache::key(&["cc -O2 main.c"], &[("main.c".into(), a)])
        );
    }
}
