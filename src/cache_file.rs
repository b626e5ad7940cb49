//! Uploaded files persisted to temporary backing files.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue};
use bytes::Bytes;
use tempfile::{NamedTempFile, TempPath};
use tokio_util::io::ReaderStream;

const CACHE_FILE_PREFIX: &str = "cachefile_";

/// An uploaded file copied into the cache directory, with the headers of
/// the multipart section it arrived in.
///
/// [`CacheFile::remove`] is the deletion path used by the file cache. A
/// value that is never removed (for instance one superseded under the same
/// cache key) deletes its backing file when the last handle drops.
#[derive(Debug)]
pub struct CacheFile {
    path: PathBuf,
    file_name: Option<String>,
    headers: HeaderMap,
    size: u64,
    backing: Mutex<Option<TempPath>>,
}

impl CacheFile {
    /// Copy `data` into a new temporary file under `dir`.
    ///
    /// `dir` is created when missing. On failure no file is left behind.
    pub async fn create(
        dir: &Path,
        data: Bytes,
        headers: HeaderMap,
        file_name: Option<String>,
    ) -> io::Result<Self> {
        let target = dir.to_path_buf();
        let size = data.len() as u64;
        let temp = tokio::task::spawn_blocking(move || write_temp(&target, &data))
            .await
            .map_err(io::Error::other)??;
        Ok(Self::from_temp(temp, size, headers, file_name))
    }

    /// Take over a file already on disk, such as an upload spilled while
    /// parsing a multipart form.
    ///
    /// The file is hard-linked into `dir` under a new temporary name and
    /// copied when linking is not possible. `source` itself is left alone.
    pub async fn adopt(
        dir: &Path,
        source: &Path,
        headers: HeaderMap,
        file_name: Option<String>,
    ) -> io::Result<Self> {
        let target = dir.to_path_buf();
        let source = source.to_path_buf();
        let (temp, size) = tokio::task::spawn_blocking(move || link_temp(&target, &source))
            .await
            .map_err(io::Error::other)??;
        Ok(Self::from_temp(temp, size, headers, file_name))
    }

    fn from_temp(temp: TempPath, size: u64, headers: HeaderMap, file_name: Option<String>) -> Self {
        Self {
            path: temp.to_path_buf(),
            file_name,
            headers,
            size,
            backing: Mutex::new(Some(temp)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Client-side file name of the upload, if one was sent.
    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Replay the captured upload headers onto `target`.
    ///
    /// Repeated headers are joined with `"; "`. Names already present on
    /// `target` are left alone.
    pub fn add_headers(&self, target: &mut HeaderMap) {
        for name in self.headers.keys() {
            if target.contains_key(name) {
                continue;
            }
            let joined = self
                .headers
                .get_all(name)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .collect::<Vec<_>>()
                .join("; ");
            if let Ok(value) = HeaderValue::from_str(&joined) {
                target.insert(name.clone(), value);
            }
        }
    }

    /// Stream the current contents of the backing file.
    ///
    /// The file is reopened read-only for every call.
    pub async fn body(&self) -> io::Result<Body> {
        let file = tokio::fs::File::open(&self.path).await?;
        Ok(Body::from_stream(ReaderStream::new(file)))
    }

    /// Delete the backing file. Later calls do nothing.
    pub fn remove(&self) -> io::Result<()> {
        let backing = self
            .backing
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        match backing {
            Some(temp) => temp.close(),
            None => Ok(()),
        }
    }

    pub fn is_removed(&self) -> bool {
        self.backing
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_none()
    }
}

/// Create a named temporary file under `dir`, creating `dir` when missing.
pub(crate) fn temp_file_in(dir: &Path, prefix: &str) -> io::Result<NamedTempFile> {
    ensure_dir(dir)?;
    tempfile::Builder::new().prefix(prefix).tempfile_in(dir)
}

fn ensure_dir(dir: &Path) -> io::Result<()> {
    match std::fs::metadata(dir) {
        Ok(meta) if !meta.is_dir() => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("'{}' exists, but is not a directory", dir.display()),
        )),
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => std::fs::create_dir_all(dir),
        Err(e) => Err(e),
    }
}

fn write_temp(dir: &Path, data: &[u8]) -> io::Result<TempPath> {
    // dropping `file` on an early return deletes the partial copy
    let mut file = temp_file_in(dir, CACHE_FILE_PREFIX)?;
    file.write_all(data)?;
    file.as_file().sync_all()?;
    Ok(file.into_temp_path())
}

fn link_temp(dir: &Path, source: &Path) -> io::Result<(TempPath, u64)> {
    ensure_dir(dir)?;
    let size = std::fs::metadata(source)?.len();

    let mut builder = tempfile::Builder::new();
    builder.prefix(CACHE_FILE_PREFIX);
    if let Ok(linked) = builder.make_in(dir, |path| std::fs::hard_link(source, path)) {
        return Ok((linked.into_temp_path(), size));
    }

    let mut file = builder.tempfile_in(dir)?;
    io::copy(&mut File::open(source)?, &mut file)?;
    file.as_file().sync_all()?;
    Ok((file.into_temp_path(), size))
}
