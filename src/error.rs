use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

use crate::domain::Stage;

#[derive(Debug, Error, Diagnostic)]
pub enum FetchError {
    #[error("malformed catalog entry {entry}: {reason}")]
    #[diagnostic(help("every file dataset needs urlPath plus size and mod_time properties"))]
    MalformedCatalogEntry { entry: String, reason: String },

    #[error("failed to read catalog at {path}: {source}")]
    CatalogRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse catalog document: {0}")]
    CatalogParse(String),

    #[error("unsupported checksum algorithm: {0:?}")]
    UnsupportedAlgorithm(String),

    #[error("transfer engine failed to start on port {port}: {message}")]
    #[diagnostic(help("make sure aria2c is installed and the port is not already in use"))]
    EngineStartFailure { port: u16, message: String },

    #[error("failed to submit {name}: {message}")]
    JobSubmissionFailure { name: String, message: String },

    #[error("transfer engine query failed: {0}")]
    EngineQueryFailure(String),

    #[error("invalid URL template: {0}")]
    InvalidTemplate(String),

    #[error("URL template placeholder {{{placeholder}}} has no value for {name}")]
    UnknownPlaceholder { placeholder: String, name: String },

    #[error("cannot place {name} locally: {reason}")]
    InvalidLocation { name: String, reason: String },

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("interrupted")]
    Interrupted,

    #[error("{stage} stage failed")]
    StageFailed {
        stage: Stage,
        #[source]
        source: Box<FetchError>,
    },
}

impl FetchError {
    /// Unwraps stage context down to the error that actually happened.
    pub fn root_cause(&self) -> &FetchError {
        match self {
            FetchError::StageFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }

    pub fn failed_stage(&self) -> Option<Stage> {
        match self {
            FetchError::StageFailed { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}
