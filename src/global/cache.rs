use std::io::Write;
use std::path::{Path, PathBuf};
use anyhow::{anyhow, Context, Result};
use tracing::debug;
use crate::global::utils::source_cache_dir;
use crate::util::sha256_hex;

/// On-disk cache of downloaded source archives.
///
/// Entries are keyed by URL. Forks and renamed projects often publish
/// archives with the same file name (`v1.4.6.tar.gz`), so the key combines a
/// digest of the full URL with the file name.
#[derive(Debug, Clone)]
pub struct SourceCache {
    dir: PathBuf,
}

impl SourceCache {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self { dir: dir.as_ref().to_path_buf() }
    }

    /// The cache under the per-user cache directory.
    pub fn global() -> Result<Self> {
        Ok(Self::new(source_cache_dir()?))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, url: &str) -> Result<PathBuf> {
        let file_name = url
            .split('/')
            .next_back()
            .filter(|name| !name.is_empty())
            .ok_or(anyhow!("Could not determine archive name of {url}"))?;
        let digest = sha256_hex(url.as_bytes());
        Ok(self.dir.join(format!("{}--{file_name}", &digest[..16])))
    }

    pub fn get(&self, url: &str) -> Result<Option<Vec<u8>>> {
        let path = self.entry_path(url)?;
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path)
            .with_context(|| format!("Could not read cache file {:?}", path))?;
        Ok(Some(bytes))
    }

    /// Stores `bytes` for `url`, replacing any previous entry atomically.
    pub fn put(&self, url: &str, bytes: &[u8]) -> Result<PathBuf> {
        if !self.dir.exists() {
            std::fs::create_dir_all(&self.dir)
                .with_context(|| format!("Could not create cache dir {:?}", self.dir))?;
            debug!(dir = %self.dir.display(), "cache directory created");
        }
        let path = self.entry_path(url)?;
        let mut staged = tempfile::NamedTempFile::new_in(&self.dir)
            .with_context(|| format!("Could not create cache file in {:?}", self.dir))?;
        staged.write_all(bytes)?;
        staged.persist(&path).map_err(|e| e.error)?;
        Ok(path)
    }

    pub fn remove(&self, url: &str) -> Result<()> {
        let path = self.entry_path(url)?;
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    pub fn is_cached(&self, url: &str) -> Result<bool> {
        Ok(self.entry_path(url)?.exists())
    }

    /// Removes every entry; returns how many were removed.
    pub fn clean(&self) -> Result<usize> {
        if !self.dir.exists() {
            std::fs::create_dir_all(&self.dir)?;
            return Ok(0);
        }
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_file() {
                std::fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
