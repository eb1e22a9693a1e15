use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::aria2::DEFAULT_PORT;
use crate::domain::{Catalog, DownloadJob, FileRecord, Stage};
use crate::engine::{EngineLauncher, EngineSession};
use crate::error::FetchError;
use crate::locate::{FileLocator, locate_checked};
use crate::resolver::{DEFAULT_MARKER_SUFFIX, Resolver};
use crate::template::UrlTemplate;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

const INTERRUPT_CHECK: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub target_dir: Utf8PathBuf,
    pub port: u16,
    pub verify_checksum: bool,
    pub dry_run: bool,
    pub poll_interval: Duration,
    pub marker_suffix: String,
}

impl DownloadOptions {
    pub fn new(target_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            target_dir: target_dir.into(),
            port: DEFAULT_PORT,
            verify_checksum: false,
            dry_run: false,
            poll_interval: DEFAULT_POLL_INTERVAL,
            marker_suffix: DEFAULT_MARKER_SUFFIX.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FetchReport {
    pub total: usize,
    pub already_present: usize,
    pub to_fetch: usize,
    pub submitted: usize,
    pub submission_failures: usize,
    pub completed: usize,
    pub dry_run: bool,
}

impl fmt::Display for FetchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dry_run {
            return write!(
                f,
                "dry run: {}/{} already downloaded, {} to download",
                self.already_present, self.total, self.to_fetch
            );
        }
        write!(
            f,
            "{}/{} done, {}/{} already downloaded",
            self.completed, self.submitted, self.already_present, self.total
        )?;
        if self.submission_failures > 0 {
            write!(f, ", {} submissions failed", self.submission_failures)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Stage(Stage),
    FilterStarted {
        total: usize,
        verify_checksum: bool,
    },
    Filtered {
        already_present: usize,
        to_fetch: usize,
        total: usize,
    },
    EngineStarted {
        port: u16,
    },
    Submitted {
        submitted: usize,
        failed: usize,
    },
    Tick {
        tick: usize,
        done: usize,
        expected: usize,
    },
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Drives one download run: filter, start the engine, submit, poll, drain.
///
/// The engine session is owned by the run. It is stopped explicitly on every
/// path that got past engine start, and its drop handler covers unwinding.
pub struct App<L: EngineLauncher> {
    launcher: L,
    template: UrlTemplate,
    locator: Box<dyn FileLocator>,
    interrupt: Arc<AtomicBool>,
}

impl<L: EngineLauncher> App<L> {
    pub fn new(launcher: L, template: UrlTemplate, locator: Box<dyn FileLocator>) -> Self {
        Self {
            launcher,
            template,
            locator,
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shares a flag that, once set, makes the polling loop give up.
    pub fn with_interrupt(mut self, interrupt: Arc<AtomicBool>) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn fetch(
        &self,
        catalog: &Catalog,
        options: &DownloadOptions,
        sink: &dyn ProgressSink,
    ) -> Result<FetchReport, FetchError> {
        match self.run(catalog, options, sink) {
            Ok(report) => {
                enter(sink, Stage::Done);
                tracing::info!(
                    completed = report.completed,
                    submitted = report.submitted,
                    "run finished"
                );
                Ok(report)
            }
            Err(err) => {
                let stage = err.failed_stage().unwrap_or(Stage::Idle);
                tracing::error!(stage = %stage, "run failed: {}", err.root_cause());
                enter(sink, Stage::Failed);
                Err(err)
            }
        }
    }

    /// Builds the engine request for one record.
    pub fn prepare_job(
        &self,
        record: &FileRecord,
        target_dir: &Utf8Path,
    ) -> Result<DownloadJob, FetchError> {
        let url = self.template.render(record)?;
        let out = locate_checked(self.locator.as_ref(), record)?;
        Ok(DownloadJob::new(
            record.name.clone(),
            url,
            target_dir.to_path_buf(),
            out,
        ))
    }

    fn run(
        &self,
        catalog: &Catalog,
        options: &DownloadOptions,
        sink: &dyn ProgressSink,
    ) -> Result<FetchReport, FetchError> {
        enter(sink, Stage::Filtering);
        sink.event(ProgressEvent::FilterStarted {
            total: catalog.len(),
            verify_checksum: options.verify_checksum,
        });
        let resolver = Resolver::new(options.target_dir.clone(), options.verify_checksum)
            .with_marker_suffix(options.marker_suffix.clone());
        let pending = resolver
            .resolve_set_until(catalog, self.locator.as_ref(), || self.interrupted())
            .map_err(at(Stage::Filtering))?;

        let mut report = FetchReport {
            total: catalog.len(),
            already_present: catalog.len() - pending.len(),
            to_fetch: pending.len(),
            dry_run: options.dry_run,
            ..FetchReport::default()
        };
        sink.event(ProgressEvent::Filtered {
            already_present: report.already_present,
            to_fetch: report.to_fetch,
            total: report.total,
        });

        if self.interrupted() {
            return Err(at(Stage::Filtering)(FetchError::Interrupted));
        }
        if options.dry_run {
            return Ok(report);
        }
        if pending.is_empty() {
            tracing::info!("nothing to download, engine not started");
            return Ok(report);
        }

        enter(sink, Stage::EngineStarting);
        let session = self
            .launcher
            .start(options.port)
            .map_err(at(Stage::EngineStarting))?;
        sink.event(ProgressEvent::EngineStarted { port: options.port });

        let outcome = self.submit_and_poll(&session, &pending, options, sink, &mut report);

        enter(sink, Stage::Draining);
        let stopped = session.stop();
        outcome?;
        stopped.map_err(at(Stage::Draining))?;
        Ok(report)
    }

    fn submit_and_poll(
        &self,
        session: &L::Session,
        pending: &[FileRecord],
        options: &DownloadOptions,
        sink: &dyn ProgressSink,
        report: &mut FetchReport,
    ) -> Result<(), FetchError> {
        enter(sink, Stage::Submitting);
        for record in pending {
            if self.interrupted() {
                return Err(at(Stage::Submitting)(FetchError::Interrupted));
            }
            let submitted = self
                .prepare_job(record, &options.target_dir)
                .and_then(|job| session.submit(&job).map(|id| (job, id)));
            match submitted {
                Ok((job, id)) => {
                    tracing::debug!(name = job.name(), job = %id, url = job.url(), "submitted");
                    report.submitted += 1;
                }
                Err(err) => {
                    tracing::warn!(name = %record.name, "submission dropped: {err}");
                    report.submission_failures += 1;
                }
            }
        }
        sink.event(ProgressEvent::Submitted {
            submitted: report.submitted,
            failed: report.submission_failures,
        });

        enter(sink, Stage::Polling);
        report.completed = self
            .poll(session, report.submitted, options.poll_interval, sink)
            .map_err(at(Stage::Polling))?;
        Ok(())
    }

    /// Counts and clears finished jobs until `expected` have completed.
    fn poll(
        &self,
        session: &L::Session,
        expected: usize,
        interval: Duration,
        sink: &dyn ProgressSink,
    ) -> Result<usize, FetchError> {
        let mut done = 0;
        let mut tick = 0;
        while done < expected {
            if self.interrupted() {
                return Err(FetchError::Interrupted);
            }
            let jobs = session.list_jobs()?;
            for job in jobs.iter().filter(|job| job.is_complete()) {
                session.remove(&job.id)?;
                done += 1;
            }
            tick += 1;
            sink.event(ProgressEvent::Tick {
                tick,
                done,
                expected,
            });
            if done < expected {
                self.pause(interval)?;
            }
        }
        Ok(done)
    }

    fn pause(&self, interval: Duration) -> Result<(), FetchError> {
        let deadline = Instant::now() + interval;
        loop {
            if self.interrupted() {
                return Err(FetchError::Interrupted);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep((deadline - now).min(INTERRUPT_CHECK));
        }
    }

    fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }
}

fn enter(sink: &dyn ProgressSink, stage: Stage) {
    tracing::debug!(stage = %stage, "stage");
    sink.event(ProgressEvent::Stage(stage));
}

fn at(stage: Stage) -> impl FnOnce(FetchError) -> FetchError {
    move |source| FetchError::StageFailed {
        stage,
        source: Box::new(source),
    }
}
