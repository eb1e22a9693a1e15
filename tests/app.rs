use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::net::TcpListener;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;

use clim_fetch::app::{App, DownloadOptions, FetchReport, ProgressEvent, ProgressSink};
use clim_fetch::aria2::{Aria2Launcher, EngineSettings};
use clim_fetch::domain::{Catalog, DownloadJob, FileRecord, JobId, JobState, JobStatus, Stage};
use clim_fetch::engine::{EngineLauncher, EngineSession};
use clim_fetch::error::FetchError;
use clim_fetch::locate::NameLocator;
use clim_fetch::output::ConsoleOutput;
use clim_fetch::template::UrlTemplate;

const CONTENT: &[u8] = b"hello world";
const CONTENT_MD5: &str = "5eb63bbbe01eeed093cb22bb8f5acdc3";

#[derive(Default)]
struct EngineLog {
    starts: usize,
    submitted: Vec<DownloadJob>,
    removed: Vec<JobId>,
    list_calls: usize,
    stops: usize,
}

/// In-memory engine. Completing a job writes `CONTENT` to its target so a
/// later run sees the file on disk.
#[derive(Clone, Default)]
struct MockLauncher {
    log: Rc<RefCell<EngineLog>>,
    fail_start: bool,
    reject: Vec<String>,
    fail_listing: bool,
    completions_per_tick: Vec<usize>,
}

struct MockSession {
    log: Rc<RefCell<EngineLog>>,
    reject: Vec<String>,
    fail_listing: bool,
    completions: RefCell<VecDeque<usize>>,
    jobs: RefCell<Vec<(JobId, DownloadJob, JobState)>>,
}

impl EngineLauncher for MockLauncher {
    type Session = MockSession;

    fn start(&self, port: u16) -> Result<MockSession, FetchError> {
        if self.fail_start {
            return Err(FetchError::EngineStartFailure {
                port,
                message: "port already in use".to_string(),
            });
        }
        self.log.borrow_mut().starts += 1;
        Ok(MockSession {
            log: self.log.clone(),
            reject: self.reject.clone(),
            fail_listing: self.fail_listing,
            completions: RefCell::new(self.completions_per_tick.iter().copied().collect()),
            jobs: RefCell::new(Vec::new()),
        })
    }
}

impl EngineSession for MockSession {
    fn submit(&self, job: &DownloadJob) -> Result<JobId, FetchError> {
        if self.reject.iter().any(|name| name == job.name()) {
            return Err(FetchError::JobSubmissionFailure {
                name: job.name().to_string(),
                message: "rejected".to_string(),
            });
        }
        let id = JobId::new(format!("gid-{}", job.name()));
        self.log.borrow_mut().submitted.push(job.clone());
        self.jobs
            .borrow_mut()
            .push((id.clone(), job.clone(), JobState::Waiting));
        Ok(id)
    }

    fn list_jobs(&self) -> Result<Vec<JobStatus>, FetchError> {
        self.log.borrow_mut().list_calls += 1;
        if self.fail_listing {
            return Err(FetchError::EngineQueryFailure("connection refused".to_string()));
        }
        let mut budget = self.completions.borrow_mut().pop_front().unwrap_or(usize::MAX);
        let mut jobs = self.jobs.borrow_mut();
        for (_, job, state) in jobs.iter_mut() {
            if budget == 0 {
                break;
            }
            if *state != JobState::Complete {
                let target = job.target_path();
                fs::create_dir_all(target.parent().unwrap()).unwrap();
                fs::write(&target, CONTENT).unwrap();
                *state = JobState::Complete;
                budget -= 1;
            }
        }
        Ok(jobs
            .iter()
            .map(|(id, _, state)| JobStatus {
                id: id.clone(),
                state: *state,
            })
            .collect())
    }

    fn remove(&self, id: &JobId) -> Result<(), FetchError> {
        self.jobs.borrow_mut().retain(|(job_id, _, _)| job_id != id);
        self.log.borrow_mut().removed.push(id.clone());
        Ok(())
    }

    fn stop(self) -> Result<(), FetchError> {
        self.log.borrow_mut().stops += 1;
        Ok(())
    }
}

#[derive(Default)]
struct RecordingSink {
    events: RefCell<Vec<ProgressEvent>>,
}

impl RecordingSink {
    fn stages(&self) -> Vec<Stage> {
        self.events
            .borrow()
            .iter()
            .filter_map(|event| match event {
                ProgressEvent::Stage(stage) => Some(*stage),
                _ => None,
            })
            .collect()
    }

    fn ticks(&self) -> Vec<(usize, usize)> {
        self.events
            .borrow()
            .iter()
            .filter_map(|event| match event {
                ProgressEvent::Tick { done, expected, .. } => Some((*done, *expected)),
                _ => None,
            })
            .collect()
    }

    fn console_lines(&self) -> Vec<String> {
        self.events
            .borrow()
            .iter()
            .flat_map(ConsoleOutput::lines)
            .collect()
    }
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: ProgressEvent) {
        self.events.borrow_mut().push(event);
    }
}

/// Raises the interrupt flag as soon as the engine reports it is up.
struct InterruptOnEngineStart {
    flag: Arc<AtomicBool>,
    inner: RecordingSink,
}

impl ProgressSink for InterruptOnEngineStart {
    fn event(&self, event: ProgressEvent) {
        if let ProgressEvent::EngineStarted { .. } = event {
            self.flag.store(true, Ordering::SeqCst);
        }
        self.inner.event(event);
    }
}

fn target_dir() -> (TempDir, Utf8PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    (temp, root)
}

fn options(root: &Utf8Path) -> DownloadOptions {
    let mut options = DownloadOptions::new(root.to_path_buf());
    options.poll_interval = Duration::from_millis(1);
    options
}

fn app(launcher: MockLauncher) -> App<MockLauncher> {
    let template = UrlTemplate::parse("https://data.example.org/fileServer/{url}?api-token={token}")
        .unwrap()
        .bind("token", "secret");
    App::new(launcher, template, Box::new(NameLocator))
}

fn catalog(names: &[&str]) -> Catalog {
    Catalog::from_records(
        BTreeMap::new(),
        names.iter().map(|name| {
            FileRecord::new(*name, format!("cesm/{name}"))
                .with_checksum(CONTENT_MD5, "md5")
                .with_size(CONTENT.len() as u64)
        }),
    )
}

#[test]
fn empty_directory_has_nothing_already_downloaded() {
    let (_temp, root) = target_dir();
    let launcher = MockLauncher::default();
    let mut opts = options(&root);
    opts.verify_checksum = true;
    opts.dry_run = true;
    let sink = RecordingSink::default();

    let report = app(launcher.clone())
        .fetch(&catalog(&["a.nc", "b.nc"]), &opts, &sink)
        .unwrap();

    assert_eq!(report.already_present, 0);
    assert_eq!(report.to_fetch, 2);
    assert!(sink
        .console_lines()
        .contains(&"0/2 urls already downloaded".to_string()));
    assert_eq!(launcher.log.borrow().starts, 0);
}

#[test]
fn engine_start_failure_aborts_before_submission() {
    let (_temp, root) = target_dir();
    let launcher = MockLauncher {
        fail_start: true,
        ..MockLauncher::default()
    };
    let sink = RecordingSink::default();

    let err = app(launcher.clone())
        .fetch(&catalog(&["a.nc", "b.nc"]), &options(&root), &sink)
        .unwrap_err();

    assert_eq!(err.failed_stage(), Some(Stage::EngineStarting));
    assert_matches!(err.root_cause(), FetchError::EngineStartFailure { .. });
    assert!(launcher.log.borrow().submitted.is_empty());
    assert_eq!(sink.stages().last(), Some(&Stage::Failed));
    assert!(!sink.stages().contains(&Stage::Submitting));
}

#[test]
fn five_jobs_complete_over_three_ticks() {
    let (_temp, root) = target_dir();
    let launcher = MockLauncher {
        completions_per_tick: vec![1, 0, 4],
        ..MockLauncher::default()
    };
    let sink = RecordingSink::default();
    let names = ["a.nc", "b.nc", "c.nc", "d.nc", "e.nc"];

    let report = app(launcher.clone())
        .fetch(&catalog(&names), &options(&root), &sink)
        .unwrap();

    assert_eq!(
        report,
        FetchReport {
            total: 5,
            to_fetch: 5,
            submitted: 5,
            completed: 5,
            ..FetchReport::default()
        }
    );
    assert_eq!(sink.ticks(), vec![(1, 5), (1, 5), (5, 5)]);
    assert!(sink.console_lines().contains(&"5/5 done".to_string()));

    let log = launcher.log.borrow();
    assert_eq!(log.list_calls, 3);
    assert_eq!(log.removed.len(), 5);
    assert_eq!(log.stops, 1);
    assert_eq!(
        sink.stages(),
        vec![
            Stage::Filtering,
            Stage::EngineStarting,
            Stage::Submitting,
            Stage::Polling,
            Stage::Draining,
            Stage::Done,
        ]
    );
}

#[test]
fn jobs_carry_rendered_url_and_location() {
    let (_temp, root) = target_dir();
    let launcher = MockLauncher::default();
    app(launcher.clone())
        .fetch(&catalog(&["a.nc"]), &options(&root), &RecordingSink::default())
        .unwrap();

    let log = launcher.log.borrow();
    let job = &log.submitted[0];
    assert_eq!(
        job.url(),
        "https://data.example.org/fileServer/cesm/a.nc?api-token=secret"
    );
    assert_eq!(job.dir(), root.as_path());
    assert_eq!(job.out(), Utf8Path::new("a.nc"));
}

#[test]
fn second_run_submits_nothing() {
    let (_temp, root) = target_dir();
    let launcher = MockLauncher::default();
    let records = catalog(&["a.nc", "b.nc", "c.nc"]);
    let mut opts = options(&root);
    opts.verify_checksum = true;

    let first = app(launcher.clone())
        .fetch(&records, &opts, &RecordingSink::default())
        .unwrap();
    assert_eq!(first.completed, 3);

    let second = app(launcher.clone())
        .fetch(&records, &opts, &RecordingSink::default())
        .unwrap();
    assert_eq!(second.already_present, 3);
    assert_eq!(second.submitted, 0);

    let log = launcher.log.borrow();
    assert_eq!(log.starts, 1);
    assert_eq!(log.submitted.len(), 3);
}

#[test]
fn rejected_submission_is_dropped_from_expected_count() {
    let (_temp, root) = target_dir();
    let launcher = MockLauncher {
        reject: vec!["b.nc".to_string()],
        ..MockLauncher::default()
    };
    let sink = RecordingSink::default();

    let report = app(launcher.clone())
        .fetch(&catalog(&["a.nc", "b.nc", "c.nc"]), &options(&root), &sink)
        .unwrap();

    assert_eq!(report.submitted, 2);
    assert_eq!(report.submission_failures, 1);
    assert_eq!(report.completed, 2);
    assert_eq!(sink.ticks(), vec![(2, 2)]);
    assert_eq!(
        report.to_string(),
        "2/2 done, 0/3 already downloaded, 1 submissions failed"
    );
}

#[test]
fn template_failure_counts_as_submission_failure() {
    let (_temp, root) = target_dir();
    let launcher = MockLauncher::default();
    let template = UrlTemplate::parse("https://data.example.org/{member}/{url}").unwrap();
    let app = App::new(launcher.clone(), template, Box::new(NameLocator));
    let catalog = Catalog::from_records(
        BTreeMap::new(),
        vec![
            FileRecord::new("a.nc", "a.nc").with_metadata("member", "r1"),
            FileRecord::new("b.nc", "b.nc"),
        ],
    );

    let report = app
        .fetch(&catalog, &options(&root), &RecordingSink::default())
        .unwrap();

    assert_eq!(report.submitted, 1);
    assert_eq!(report.submission_failures, 1);
    assert_eq!(
        launcher.log.borrow().submitted[0].url(),
        "https://data.example.org/r1/a.nc"
    );
}

#[test]
fn query_failure_stops_engine_and_propagates() {
    let (_temp, root) = target_dir();
    let launcher = MockLauncher {
        fail_listing: true,
        ..MockLauncher::default()
    };
    let sink = RecordingSink::default();

    let err = app(launcher.clone())
        .fetch(&catalog(&["a.nc"]), &options(&root), &sink)
        .unwrap_err();

    assert_eq!(err.failed_stage(), Some(Stage::Polling));
    assert_matches!(err.root_cause(), FetchError::EngineQueryFailure(_));
    assert_eq!(launcher.log.borrow().stops, 1);
    assert_eq!(sink.stages().last(), Some(&Stage::Failed));
}

#[test]
fn nothing_to_fetch_never_starts_engine() {
    let (_temp, root) = target_dir();
    fs::write(root.join("a.nc"), CONTENT).unwrap();
    let launcher = MockLauncher::default();

    let report = app(launcher.clone())
        .fetch(&catalog(&["a.nc"]), &options(&root), &RecordingSink::default())
        .unwrap();

    assert_eq!(report.already_present, 1);
    assert_eq!(report.completed, 0);
    assert_eq!(launcher.log.borrow().starts, 0);
}

#[test]
fn occupied_port_fails_engine_start() {
    let (_temp, root) = target_dir();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let app = App::new(
        Aria2Launcher::new(EngineSettings::default()),
        UrlTemplate::parse("https://data.example.org/{url}").unwrap(),
        Box::new(NameLocator),
    );
    let mut opts = options(&root);
    opts.port = port;

    let err = app
        .fetch(&catalog(&["a.nc"]), &opts, &RecordingSink::default())
        .unwrap_err();

    assert_eq!(err.failed_stage(), Some(Stage::EngineStarting));
    assert_matches!(
        err.root_cause(),
        FetchError::EngineStartFailure { port: failed, .. } if *failed == port
    );
}

fn many(count: usize) -> Vec<String> {
    (0..count).map(|index| format!("f{index:03}.nc")).collect()
}

#[test]
fn interrupt_during_filtering_never_starts_engine() {
    let (_temp, root) = target_dir();
    let launcher = MockLauncher::default();
    let flag = Arc::new(AtomicBool::new(true));
    let names = many(50);
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    let sink = RecordingSink::default();

    let err = app(launcher.clone())
        .with_interrupt(flag)
        .fetch(&catalog(&names), &options(&root), &sink)
        .unwrap_err();

    assert_eq!(err.failed_stage(), Some(Stage::Filtering));
    assert_matches!(err.root_cause(), FetchError::Interrupted);
    let log = launcher.log.borrow();
    assert_eq!(log.starts, 0);
    assert!(log.submitted.is_empty());
    assert_eq!(sink.stages(), vec![Stage::Filtering, Stage::Failed]);
}

#[test]
fn interrupt_is_not_lost_in_dry_run() {
    let (_temp, root) = target_dir();
    let launcher = MockLauncher::default();
    let mut opts = options(&root);
    opts.dry_run = true;

    let err = app(launcher.clone())
        .with_interrupt(Arc::new(AtomicBool::new(true)))
        .fetch(&catalog(&["a.nc", "b.nc"]), &opts, &RecordingSink::default())
        .unwrap_err();

    assert_matches!(err.root_cause(), FetchError::Interrupted);
    assert_eq!(launcher.log.borrow().starts, 0);
}

#[test]
fn interrupt_during_submission_stops_engine() {
    let (_temp, root) = target_dir();
    let launcher = MockLauncher::default();
    let flag = Arc::new(AtomicBool::new(false));
    let sink = InterruptOnEngineStart {
        flag: flag.clone(),
        inner: RecordingSink::default(),
    };

    let err = app(launcher.clone())
        .with_interrupt(flag)
        .fetch(&catalog(&["a.nc", "b.nc", "c.nc"]), &options(&root), &sink)
        .unwrap_err();

    assert_eq!(err.failed_stage(), Some(Stage::Submitting));
    assert_matches!(err.root_cause(), FetchError::Interrupted);
    let log = launcher.log.borrow();
    assert_eq!(log.starts, 1);
    assert!(log.submitted.is_empty());
    assert_eq!(log.stops, 1);
    assert_eq!(sink.inner.stages().last(), Some(&Stage::Failed));
}
