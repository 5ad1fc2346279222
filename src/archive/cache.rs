//! # On-disk exposure cache
//!
//! Catalog bytes fetched from the archive are stored under one directory, one file per
//! exposure (`<exposure>.cat.csv`). The default location is the user cache directory:
//!
//! ```text
//! <cache dir>/daomop_cache/exposures/
//! ```
//!
//! Files are written to a temporary name in the same directory and renamed into place, so a
//! reader never observes a partially written catalog.
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use log::debug;
use tokio::{fs, io::AsyncWriteExt};

use crate::{archive::validate_exposure_id, daomop_errors::DaomopError};

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExposureCache {
    root: Utf8PathBuf,
}

impl ExposureCache {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        ExposureCache { root: root.into() }
    }

    /// Cache rooted at a non-UTF-8-checked path.
    pub fn from_path(root: &std::path::Path) -> Result<Self, DaomopError> {
        let root = Utf8Path::from_path(root)
            .ok_or_else(|| DaomopError::Utf8PathError(format!("{}", root.display())))?;
        Ok(Self::new(root))
    }

    /// Cache under the user cache directory (`<cache dir>/daomop_cache/exposures`).
    pub fn default_location() -> Result<Self, DaomopError> {
        let base_dir = BaseDirs::new().ok_or_else(|| {
            DaomopError::IoError(io::Error::new(
                io::ErrorKind::NotFound,
                "Cannot find the base directory",
            ))
        })?;
        let cache_path = Utf8Path::from_path(base_dir.cache_dir()).ok_or_else(|| {
            DaomopError::Utf8PathError(format!("{}", base_dir.cache_dir().display()))
        })?;
        Ok(Self::new(cache_path.join("daomop_cache").join("exposures")))
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Location of an exposure's catalog in the cache.
    pub fn path_for(&self, exposure_id: &str) -> Result<Utf8PathBuf, DaomopError> {
        validate_exposure_id(exposure_id)?;
        Ok(self.root.join(format!("{exposure_id}.cat.csv")))
    }

    /// Cached bytes of an exposure, `None` on a cache miss.
    pub async fn read(&self, exposure_id: &str) -> Result<Option<Vec<u8>>, DaomopError> {
        let path = self.path_for(exposure_id)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Store an exposure's bytes atomically.
    pub async fn write(&self, exposure_id: &str, bytes: &[u8]) -> Result<Utf8PathBuf, DaomopError> {
        let path = self.path_for(exposure_id)?;
        fs::create_dir_all(&self.root).await?;

        let tmp = self.root.join(format!(
            ".{exposure_id}.{}.{}.part",
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        if let Err(err) = write_and_rename(&tmp, &path, bytes).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(err.into());
        }
        debug!("Cached exposure {exposure_id} ({} bytes) at {path}", bytes.len());
        Ok(path)
    }

    pub async fn contains(&self, exposure_id: &str) -> bool {
        match self.path_for(exposure_id) {
            Ok(path) => fs::try_exists(&path).await.unwrap_or(false),
            Err(_) => false,
        }
    }
}

async fn write_and_rename(tmp: &Utf8Path, path: &Utf8Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(tmp).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    drop(file);
    fs::rename(tmp, path).await
}
