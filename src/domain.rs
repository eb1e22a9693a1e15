use std::collections::{BTreeMap, HashMap};
use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// One remote file to materialize locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub name: String,
    /// Opaque remote locator, substituted into the URL template as `{url}`.
    #[serde(rename = "url")]
    pub locator: String,
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub checksum_type: String,
    #[serde(default, with = "size_field")]
    pub size: Option<u64>,
    #[serde(default)]
    pub mod_time: Option<NaiveDateTime>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl FileRecord {
    pub fn new(name: impl Into<String>, locator: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            locator: locator.into(),
            checksum: String::new(),
            checksum_type: String::new(),
            size: None,
            mod_time: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_checksum(
        mut self,
        checksum: impl Into<String>,
        algorithm: impl Into<String>,
    ) -> Self {
        self.checksum = checksum.into();
        self.checksum_type = algorithm.into();
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_mod_time(mut self, mod_time: NaiveDateTime) -> Self {
        self.mod_time = Some(mod_time);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn has_checksum(&self) -> bool {
        !self.checksum.is_empty()
    }

    /// Size usable for comparison: known and positive.
    pub fn known_size(&self) -> Option<u64> {
        self.size.filter(|size| *size > 0)
    }

    fn supersedes(&self, current: &FileRecord) -> bool {
        match (self.mod_time, current.mod_time) {
            (Some(candidate), Some(existing)) => candidate > existing,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

/// Deduplicated set of file records plus free-form catalog properties.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Catalog {
    properties: BTreeMap<String, String>,
    files: Vec<FileRecord>,
}

impl Catalog {
    /// Builds a catalog, resolving records that share a name.
    ///
    /// The record with the later `mod_time` wins and a missing timestamp counts
    /// as older. On equal timestamps the first record seen is kept. A winning
    /// record takes over the slot of the one it replaces, so the output keeps
    /// the order in which names first appeared.
    pub fn from_records(
        properties: BTreeMap<String, String>,
        records: impl IntoIterator<Item = FileRecord>,
    ) -> Self {
        let mut slots: HashMap<String, usize> = HashMap::new();
        let mut files: Vec<FileRecord> = Vec::new();

        for record in records {
            match slots.get(&record.name) {
                Some(&index) => {
                    if record.supersedes(&files[index]) {
                        tracing::debug!(name = %record.name, "newer duplicate replaces entry");
                        files[index] = record;
                    } else {
                        tracing::debug!(name = %record.name, "dropping older duplicate");
                    }
                }
                None => {
                    slots.insert(record.name.clone(), files.len());
                    files.push(record);
                }
            }
        }

        Self { properties, files }
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn files(&self) -> &[FileRecord] {
        &self.files
    }

    pub fn get(&self, name: &str) -> Option<&FileRecord> {
        self.files.iter().find(|record| record.name == name)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Fully resolved fetch request handed to the transfer engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadJob {
    name: String,
    url: String,
    dir: Utf8PathBuf,
    out: Utf8PathBuf,
}

impl DownloadJob {
    pub fn new(name: String, url: String, dir: Utf8PathBuf, out: Utf8PathBuf) -> Self {
        Self {
            name,
            url,
            dir,
            out,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Target directory the engine writes into.
    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    /// Output path relative to [`DownloadJob::dir`].
    pub fn out(&self) -> &Utf8Path {
        &self.out
    }

    pub fn target_path(&self) -> Utf8PathBuf {
        self.dir.join(&self.out)
    }
}

/// Judgment about a record's local copy. Derived fresh on every inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalFileState {
    Missing,
    /// Interrupted transfer, or a copy whose checksum or size disagrees.
    Partial,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Idle,
    Filtering,
    EngineStarting,
    Submitting,
    Polling,
    Draining,
    Done,
    Failed,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::Filtering => "filtering",
            Stage::EngineStarting => "engine start",
            Stage::Submitting => "submission",
            Stage::Polling => "polling",
            Stage::Draining => "draining",
            Stage::Done => "done",
            Stage::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobId(String);

impl JobId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Active,
    Waiting,
    Paused,
    Error,
    Complete,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub id: JobId,
    pub state: JobState,
}

impl JobStatus {
    pub fn is_complete(&self) -> bool {
        self.state == JobState::Complete
    }
}

/// Unknown sizes travel as `-1`, matching what catalog tooling expects.
mod size_field {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(size: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error> {
        match size {
            Some(value) => serializer.serialize_u64(*value),
            None => serializer.serialize_i64(-1),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = i64::deserialize(deserializer)?;
        Ok(u64::try_from(value).ok())
    }
}
