//! Mechafoord Storage
//!
//! Content-addressed on-disk cache for downloaded and converted media.
//! A file's presence at its key-derived path is the only index.

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::OnceCell;
use tracing::debug;

static NEXT_PART_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("download stream failed: {0}")]
    Stream(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Hex SHA-256 of a semantic identifier such as `downloaded_<url>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn derive(semantic: &str) -> Self {
        Self(sha256_hex(semantic.as_bytes()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn sha256_hex(bytes: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes.as_ref());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

/// Appends `suffix` to the final path component, e.g. `abc` + `.png`.
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw: OsString = path.as_os_str().to_owned();
    raw.push(suffix);
    PathBuf::from(raw)
}

pub struct ContentStore {
    cache_dir: PathBuf,
    export_dir: PathBuf,
    dirs_ready: OnceCell<()>,
}

impl ContentStore {
    pub fn new(cache_dir: impl Into<PathBuf>, export_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            export_dir: export_dir.into(),
            dirs_ready: OnceCell::new(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn export_dir(&self) -> &Path {
        &self.export_dir
    }

    /// Creates both directories once per store. Concurrent callers wait on the
    /// same initialisation; a failed attempt is retried by the next caller.
    pub async fn ensure_dirs(&self) -> Result<(), StoreError> {
        self.dirs_ready
            .get_or_try_init(|| async {
                for dir in [&self.cache_dir, &self.export_dir] {
                    debug!("Creating directory: {}", dir.display());
                    fs::create_dir_all(dir)
                        .await
                        .map_err(|source| StoreError::CreateDir {
                            path: dir.clone(),
                            source,
                        })?;
                }
                Ok::<(), StoreError>(())
            })
            .await
            .map(|_| ())
    }

    pub fn input_key(url: &str) -> CacheKey {
        CacheKey::derive(&format!("downloaded_{}", url))
    }

    /// Output keys are scoped by command so two filters over the same input
    /// never share an artifact.
    pub fn output_key(scope: &str, input: &CacheKey) -> CacheKey {
        CacheKey::derive(&format!("{}_{}", scope, input))
    }

    pub fn input_path(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir.join(key.as_str())
    }

    pub fn output_path(&self, key: &CacheKey, extension: Option<&str>) -> PathBuf {
        match extension {
            Some(ext) => self.export_dir.join(format!("{}.{}", key, ext)),
            None => self.export_dir.join(key.as_str()),
        }
    }

    pub async fn exists(&self, path: &Path) -> bool {
        fs::metadata(path).await.is_ok()
    }

    /// Size in bytes, `0` when the file is missing or unreadable.
    pub async fn size_of(&self, path: &Path) -> u64 {
        fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
    }

    /// Streams `body` into a private part file and renames it to `path` once
    /// complete, so readers never observe a partially written artifact.
    pub async fn persist<S, E>(&self, path: &Path, body: S) -> Result<u64, StoreError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let part = part_path(path);
        match write_stream(&part, body).await {
            Ok(written) => {
                fs::rename(&part, path)
                    .await
                    .map_err(|source| StoreError::Write {
                        path: path.to_path_buf(),
                        source,
                    })?;
                debug!("Persisted {} bytes to {}", written, path.display());
                Ok(written)
            }
            Err(err) => {
                let _ = fs::remove_file(&part).await;
                Err(err)
            }
        }
    }
}

/// Staging name unique per process and call, so concurrent writers for the
/// same destination never share a file.
pub fn part_path(path: &Path) -> PathBuf {
    let n = NEXT_PART_COUNTER.fetch_add(1, Ordering::Relaxed);
    with_suffix(path, &format!(".{}-{}.part", std::process::id(), n))
}

async fn write_stream<S, E>(part: &Path, body: S) -> Result<u64, StoreError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let write_err = |source| StoreError::Write {
        path: part.to_path_buf(),
        source,
    };

    let mut file = fs::File::create(part).await.map_err(write_err)?;
    let mut written = 0u64;

    futures_util::pin_mut!(body);
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| StoreError::Stream(Box::new(e)))?;
        file.write_all(&chunk).await.map_err(write_err)?;
        written += chunk.len() as u64;
    }

    file.flush().await.map_err(write_err)?;
    file.sync_all().await.map_err(write_err)?;
    Ok(written)
}
