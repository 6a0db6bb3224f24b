use std::fs;
use std::io::{self, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::{BkLensError, Result};

use super::store::BuildStore;
use super::types::Build;

const CACHE_FORMAT_VERSION: u32 = 1;

#[derive(Serialize)]
struct CacheEnvelopeRef<'a> {
    format_version: u32,
    saved_at: DateTime<Utc>,
    builds: Vec<&'a Build>,
}

#[derive(Deserialize)]
struct CacheEnvelope {
    format_version: u32,
    #[allow(dead_code)]
    saved_at: DateTime<Utc>,
    builds: Vec<Build>,
}

/// Outcome of a successful [`save`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveReport {
    pub builds: usize,
    pub bytes: usize,
}

/// Build cache for one Buildkite pipeline.
///
/// Each (organization, pipeline) pair gets its own file,
/// `{organization}_{pipeline}.cache`, in the cache directory. Without an
/// explicit directory the platform cache location is used:
/// - Linux: `~/.cache/bklens/buildkite/`
/// - macOS: `~/Library/Caches/bklens/buildkite/`
///
/// The whole store is rewritten on every save. Callers must not run two
/// processes against the same pipeline at once: the atomic rename keeps the
/// file intact but does not serialize writers.
pub struct BuildCache {
    cache_file: PathBuf,
}

impl BuildCache {
    /// Resolves the cache file for a pipeline, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if no cache directory can be determined or created.
    pub fn new(cache_dir: Option<&Path>, organization: &str, pipeline: &str) -> Result<Self> {
        let cache_dir = match cache_dir {
            Some(dir) => dir.to_path_buf(),
            None => default_cache_dir()?,
        };

        fs::create_dir_all(&cache_dir)?;

        Ok(Self {
            cache_file: cache_path(&cache_dir, organization, pipeline),
        })
    }

    pub fn path(&self) -> &Path {
        &self.cache_file
    }

    pub fn load(&self) -> Result<BuildStore> {
        load(&self.cache_file)
    }

    pub fn save(&self, store: &BuildStore) -> Result<SaveReport> {
        save(store, &self.cache_file)
    }

    /// Time since the cache file was last written, `None` if it does not exist.
    pub fn age(&self) -> Option<Duration> {
        let modified = fs::metadata(&self.cache_file).ok()?.modified().ok()?;
        SystemTime::now().duration_since(modified).ok()
    }

    /// Removes the cache file. Returns whether a file was removed.
    pub fn clear(&self) -> Result<bool> {
        match fs::remove_file(&self.cache_file) {
            Ok(()) => {
                info!("Cache cleared: {}", self.cache_file.display());
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("No cache file found at: {}", self.cache_file.display());
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn default_cache_dir() -> Result<PathBuf> {
    Ok(dirs::cache_dir()
        .ok_or_else(|| BkLensError::Config("No cache directory found".into()))?
        .join("bklens")
        .join("buildkite"))
}

/// Path of the cache file for a pipeline inside `dir`.
pub fn cache_path(dir: &Path, organization: &str, pipeline: &str) -> PathBuf {
    dir.join(format!("{organization}_{pipeline}.cache"))
}

/// Loads a store from `path`.
///
/// A missing file yields an empty store. An existing file that does not
/// deserialize into the expected shape is reported as `CacheCorrupt`.
pub fn load(path: &Path) -> Result<BuildStore> {
    let content = match fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("No cache file at {}, starting empty", path.display());
            return Ok(BuildStore::new());
        }
        Err(e) => return Err(e.into()),
    };

    #[allow(clippy::cast_precision_loss)]
    let mib = content.len() as f64 / 1024.0 / 1024.0;
    info!("Read {mib:.2} MiB from cache file: {}", path.display());

    let envelope: CacheEnvelope =
        serde_json::from_slice(&content).map_err(|e| BkLensError::CacheCorrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    if envelope.format_version != CACHE_FORMAT_VERSION {
        return Err(BkLensError::CacheCorrupt {
            path: path.to_path_buf(),
            reason: format!(
                "unsupported format version {} (expected {CACHE_FORMAT_VERSION})",
                envelope.format_version
            ),
        });
    }

    let store: BuildStore = envelope.builds.into_iter().collect();
    info!("Loaded {} builds from cache", store.len());

    Ok(store)
}

/// Writes `store` to `path`, replacing any previous file atomically.
///
/// On failure the previous file at `path` is left as it was.
pub fn save(store: &BuildStore, path: &Path) -> Result<SaveReport> {
    let envelope = CacheEnvelopeRef {
        format_version: CACHE_FORMAT_VERSION,
        saved_at: Utc::now(),
        builds: store.iter().collect(),
    };
    let payload = serde_json::to_vec(&envelope)?;

    write_atomic(path, |writer| writer.write_all(&payload))?;

    #[allow(clippy::cast_precision_loss)]
    let mib = payload.len() as f64 / 1024.0 / 1024.0;
    info!(
        "Persisted {} builds ({} bytes, {mib:.2} MiB) to {}",
        store.len(),
        payload.len(),
        path.display()
    );

    Ok(SaveReport {
        builds: store.len(),
        bytes: payload.len(),
    })
}

/// Runs `write` against a temporary file next to `path`, then renames it over
/// `path`. The temporary file is removed if anything fails.
fn write_atomic<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut dyn Write) -> io::Result<()>,
{
    let dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let attempt = || -> io::Result<()> {
        let mut temp = NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(temp.as_file_mut());
            write(&mut writer)?;
            writer.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|e| e.error)?;
        Ok(())
    };

    attempt().map_err(|source| BkLensError::Persistence {
        path: path.to_path_buf(),
        source,
    })
}
