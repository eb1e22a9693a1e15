use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};

use crate::domain::Catalog;
use crate::error::FetchError;

pub const DEFAULT_SNAPSHOT_NAME: &str = "dataset.json";

/// The local download root.
#[derive(Debug, Clone)]
pub struct Store {
    root: Utf8PathBuf,
}

impl Store {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn ensure_root(&self) -> Result<(), FetchError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| FetchError::Filesystem(format!("create {}: {err}", self.root)))
    }

    pub fn snapshot_path(&self, name: &str) -> Utf8PathBuf {
        self.root.join(name)
    }

    /// Writes the normalized catalog as `{ "properties": .., "files": [..] }`.
    /// The snapshot is for audit only and never read back.
    pub fn write_snapshot(&self, catalog: &Catalog, name: &str) -> Result<Utf8PathBuf, FetchError> {
        let path = self.snapshot_path(name);
        let content = serde_json::to_vec_pretty(catalog)
            .map_err(|err| FetchError::Filesystem(err.to_string()))?;
        write_bytes_atomic(&path, &content)?;
        tracing::debug!(path = %path, files = catalog.len(), "catalog snapshot written");
        Ok(path)
    }
}

pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), FetchError> {
    let parent = path
        .parent()
        .ok_or_else(|| FetchError::Filesystem("invalid destination path".to_string()))?;
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| FetchError::Filesystem(err.to_string()))?;
    let mut temp = tempfile::Builder::new()
        .prefix(".clim-fetch")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| FetchError::Filesystem(err.to_string()))?;
    temp.write_all(content)
        .map_err(|err| FetchError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| FetchError::Filesystem(err.to_string()))?;
    Ok(())
}
