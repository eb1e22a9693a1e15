use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::FileRecord;
use crate::error::FetchError;

/// Maps a record to its path relative to the download root.
pub trait FileLocator: Send + Sync {
    fn locate(&self, record: &FileRecord) -> Result<Utf8PathBuf, FetchError>;
}

const NETCDF_NAME_PATTERN: &str = r"^.*-(\d{4}\.\d{3})\..*\.([A-Z]*)\.(\d{6})-(\d{6})\.nc$";

/// Stores every file under its catalog name.
#[derive(Debug, Clone, Copy, Default)]
pub struct NameLocator;

impl FileLocator for NameLocator {
    fn locate(&self, record: &FileRecord) -> Result<Utf8PathBuf, FetchError> {
        Ok(Utf8PathBuf::from(&record.name))
    }
}

/// Groups CESM-style NetCDF output by ensemble member:
/// `b.e21.BSSP370smbb.f09_g17.LE2-1301.013.cam.h0.TAUX.201501-202412.nc`
/// lands at `1301.013/201501-202412.nc`.
#[derive(Debug, Clone)]
pub struct NetcdfLocator {
    pattern: Regex,
}

impl NetcdfLocator {
    pub fn new() -> Result<Self, FetchError> {
        let pattern = Regex::new(NETCDF_NAME_PATTERN)
            .map_err(|err| FetchError::ConfigParse(format!("netcdf layout pattern: {err}")))?;
        Ok(Self { pattern })
    }
}

impl FileLocator for NetcdfLocator {
    fn locate(&self, record: &FileRecord) -> Result<Utf8PathBuf, FetchError> {
        let invalid = || FetchError::InvalidLocation {
            name: record.name.clone(),
            reason: "name does not follow <...>-<SIM>.<...>.<VAR>.<YYYYMM>-<YYYYMM>.nc".to_string(),
        };
        let captures = self.pattern.captures(&record.name).ok_or_else(invalid)?;
        let simulation = &captures[1];
        let start: u32 = captures[3].parse().map_err(|_| invalid())?;
        let end: u32 = captures[4].parse().map_err(|_| invalid())?;
        Ok(Utf8PathBuf::from(simulation).join(format!("{start}-{end}.nc")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    #[default]
    Flat,
    Netcdf,
}

impl Layout {
    pub fn locator(self) -> Result<Box<dyn FileLocator>, FetchError> {
        let locator: Box<dyn FileLocator> = match self {
            Layout::Flat => Box::new(NameLocator),
            Layout::Netcdf => Box::new(NetcdfLocator::new()?),
        };
        Ok(locator)
    }
}

/// Locates a record and rejects paths that would escape the download root.
pub fn locate_checked(
    locator: &dyn FileLocator,
    record: &FileRecord,
) -> Result<Utf8PathBuf, FetchError> {
    let path = locator.locate(record)?;
    ensure_relative(&path).map_err(|reason| FetchError::InvalidLocation {
        name: record.name.clone(),
        reason,
    })?;
    Ok(path)
}

fn ensure_relative(path: &Utf8Path) -> Result<(), String> {
    if path.as_str().is_empty() {
        return Err("empty path".to_string());
    }
    for component in path.components() {
        match component {
            Utf8Component::Normal(_) | Utf8Component::CurDir => {}
            Utf8Component::ParentDir => return Err(format!("{path} leaves the target directory")),
            Utf8Component::RootDir | Utf8Component::Prefix(_) => {
                return Err(format!("{path} is absolute"));
            }
        }
    }
    Ok(())
}
