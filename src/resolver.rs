use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

use crate::checksum;
use crate::domain::{Catalog, FileRecord, LocalFileState};
use crate::error::FetchError;
use crate::locate::{FileLocator, locate_checked};

/// Suffix aria2 appends to a target while the transfer is unfinished.
pub const DEFAULT_MARKER_SUFFIX: &str = ".aria2";

/// Decides whether a record's local copy can be trusted.
///
/// First match wins: a missing file or an in-progress marker means not
/// downloaded; then checksum (when enabled and the record carries one), then
/// size (when known and positive), then bare existence.
#[derive(Debug, Clone)]
pub struct Resolver {
    root: Utf8PathBuf,
    verify_checksum: bool,
    marker_suffix: String,
}

impl Resolver {
    pub fn new(root: impl Into<Utf8PathBuf>, verify_checksum: bool) -> Self {
        Self {
            root: root.into(),
            verify_checksum,
            marker_suffix: DEFAULT_MARKER_SUFFIX.to_string(),
        }
    }

    pub fn with_marker_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.marker_suffix = suffix.into();
        self
    }

    pub fn marker_path(&self, path: &Utf8Path) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("{path}{}", self.marker_suffix))
    }

    /// Inspects the file at `relative` (under the root) for `record`.
    pub fn state(
        &self,
        record: &FileRecord,
        relative: &Utf8Path,
    ) -> Result<LocalFileState, FetchError> {
        let path = self.root.join(relative);
        if !path.as_std_path().exists() {
            return Ok(LocalFileState::Missing);
        }
        if self.marker_path(&path).as_std_path().exists() {
            tracing::debug!(name = %record.name, "in-progress marker present");
            return Ok(LocalFileState::Partial);
        }

        let intact = if self.verify_checksum && record.has_checksum() {
            checksum::verify(path.as_std_path(), &record.checksum, &record.checksum_type)?
        } else if let Some(expected) = record.known_size() {
            let actual = fs::metadata(path.as_std_path())
                .map_err(|err| FetchError::Filesystem(format!("stat {path}: {err}")))?
                .len();
            actual == expected
        } else {
            true
        };

        Ok(if intact {
            LocalFileState::Complete
        } else {
            LocalFileState::Partial
        })
    }

    pub fn is_downloaded(
        &self,
        record: &FileRecord,
        locator: &dyn FileLocator,
    ) -> Result<bool, FetchError> {
        let relative = locate_checked(locator, record)?;
        Ok(self.state(record, &relative)? == LocalFileState::Complete)
    }

    /// Records that still need fetching, in catalog order.
    pub fn resolve_set(
        &self,
        catalog: &Catalog,
        locator: &dyn FileLocator,
    ) -> Result<Vec<FileRecord>, FetchError> {
        self.resolve_set_until(catalog, locator, || false)
    }

    /// Like [`Resolver::resolve_set`], but checks `cancelled` before each
    /// record and fails with [`FetchError::Interrupted`] once it returns true.
    pub fn resolve_set_until(
        &self,
        catalog: &Catalog,
        locator: &dyn FileLocator,
        cancelled: impl Fn() -> bool,
    ) -> Result<Vec<FileRecord>, FetchError> {
        let mut pending = Vec::new();
        for record in catalog.files() {
            if cancelled() {
                return Err(FetchError::Interrupted);
            }
            if !self.is_downloaded(record, locator)? {
                pending.push(record.clone());
            }
        }
        Ok(pending)
    }
}
