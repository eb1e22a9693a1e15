use crate::domain::{DownloadJob, JobId, JobStatus};
use crate::error::FetchError;

/// Starts an external transfer engine listening on a control port.
pub trait EngineLauncher {
    type Session: EngineSession;

    /// Fails with [`FetchError::EngineStartFailure`] when the engine cannot be
    /// brought up. No retry is attempted.
    fn start(&self, port: u16) -> Result<Self::Session, FetchError>;
}

/// Control channel of a running engine. Dropping a session must shut the
/// engine down; [`EngineSession::stop`] does so and reports failures.
///
/// Nothing here retries. Errors are surfaced unchanged and transfer failures
/// inside the engine are not interpreted.
pub trait EngineSession {
    fn submit(&self, job: &DownloadJob) -> Result<JobId, FetchError>;

    fn list_jobs(&self) -> Result<Vec<JobStatus>, FetchError>;

    fn remove(&self, id: &JobId) -> Result<(), FetchError>;

    fn stop(self) -> Result<(), FetchError>
    where
        Self: Sized;
}
