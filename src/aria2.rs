//! aria2 as the transfer engine, driven over its JSON-RPC control port.

use std::net::{Ipv4Addr, TcpListener};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::domain::{DownloadJob, JobId, JobState, JobStatus};
use crate::engine::{EngineLauncher, EngineSession};
use crate::error::FetchError;

pub const DEFAULT_PORT: u16 = 6800;

const READY_POLL: Duration = Duration::from_millis(100);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
const LIST_PAGE: u64 = 1000;
const STATUS_KEYS: [&str; 2] = ["gid", "status"];

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub binary: PathBuf,
    pub max_connections: u16,
    pub split: u16,
    pub allow_overwrite: bool,
    pub auto_file_renaming: bool,
    pub secret: Option<String>,
    pub startup_timeout: Duration,
    pub rpc_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("aria2c"),
            max_connections: 16,
            split: 16,
            allow_overwrite: true,
            auto_file_renaming: false,
            secret: None,
            startup_timeout: Duration::from_secs(5),
            rpc_timeout: Duration::from_secs(30),
        }
    }
}

impl EngineSettings {
    pub fn command_args(&self, port: u16) -> Vec<String> {
        let mut args = vec![
            "--enable-rpc".to_string(),
            format!("--max-connection-per-server={}", self.max_connections),
            format!("--split={}", self.split),
            format!("--allow-overwrite={}", self.allow_overwrite),
            format!("--auto-file-renaming={}", self.auto_file_renaming),
            "--optimize-concurrent-downloads=true".to_string(),
            "--file-allocation=none".to_string(),
            "--rpc-listen-port".to_string(),
            port.to_string(),
        ];
        if let Some(secret) = &self.secret {
            args.push(format!("--rpc-secret={secret}"));
        }
        args
    }
}

#[derive(Debug, Clone, Default)]
pub struct Aria2Launcher {
    settings: EngineSettings,
}

impl Aria2Launcher {
    pub fn new(settings: EngineSettings) -> Self {
        Self { settings }
    }

}

impl EngineLauncher for Aria2Launcher {
    type Session = Aria2Session;

    fn start(&self, port: u16) -> Result<Aria2Session, FetchError> {
        ensure_port_free(port)?;

        let binary = &self.settings.binary;
        let child = Command::new(binary)
            .args(self.settings.command_args(port))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| {
                start_failure(port, format!("cannot launch {}: {err}", binary.display()))
            })?;
        let mut process = EngineProcess::new(child, port);
        tracing::debug!(port, pid = process.id(), "aria2c spawned");

        let rpc = Aria2Rpc::new(port, self.settings.secret.clone(), self.settings.rpc_timeout)
            .map_err(|message| start_failure(port, message))?;
        wait_until_ready(&mut process, &rpc, self.settings.startup_timeout)?;
        tracing::info!(port, "aria2 engine ready");

        Ok(Aria2Session { process, rpc })
    }
}

fn start_failure(port: u16, message: String) -> FetchError {
    FetchError::EngineStartFailure { port, message }
}

fn ensure_port_free(port: u16) -> Result<(), FetchError> {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port))
        .map(drop)
        .map_err(|err| start_failure(port, format!("port is already in use ({err})")))
}

fn wait_until_ready(
    process: &mut EngineProcess,
    rpc: &Aria2Rpc,
    timeout: Duration,
) -> Result<(), FetchError> {
    let port = process.port();
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = process.try_exit()? {
            return Err(start_failure(port, format!("aria2c exited during startup ({status})")));
        }
        if rpc.call::<Value>("aria2.getVersion", Vec::new()).is_ok() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(start_failure(
                port,
                format!("no answer on the control port after {}s", timeout.as_secs_f32()),
            ));
        }
        thread::sleep(READY_POLL);
    }
}

/// Owned engine process. Killed and reaped on drop if still running.
#[derive(Debug)]
pub struct EngineProcess {
    child: Option<Child>,
    port: u16,
}

impl EngineProcess {
    fn new(child: Child, port: u16) -> Self {
        Self {
            child: Some(child),
            port,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    fn try_exit(&mut self) -> Result<Option<ExitStatus>, FetchError> {
        match self.child.as_mut() {
            Some(child) => child
                .try_wait()
                .map_err(|err| FetchError::Filesystem(format!("wait for aria2c: {err}"))),
            None => Ok(None),
        }
    }

    /// Waits up to `grace` for the process to exit on its own, then kills it.
    pub fn stop(mut self, grace: Duration) -> Result<(), FetchError> {
        self.shutdown(grace)
    }

    fn shutdown(&mut self, grace: Duration) -> Result<(), FetchError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let deadline = Instant::now() + grace;
        loop {
            match child.try_wait() {
                Ok(Some(_)) => return Ok(()),
                Ok(None) if Instant::now() < deadline => thread::sleep(READY_POLL),
                _ => break,
            }
        }
        if let Err(err) = child.kill() {
            tracing::debug!("kill aria2c: {err}");
        }
        child
            .wait()
            .map(|_| ())
            .map_err(|err| FetchError::Filesystem(format!("reap aria2c: {err}")))
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown(Duration::ZERO) {
            tracing::warn!(port = self.port, "failed to stop aria2c: {err}");
        }
    }
}

pub struct Aria2Session {
    process: EngineProcess,
    rpc: Aria2Rpc,
}

impl EngineSession for Aria2Session {
    fn submit(&self, job: &DownloadJob) -> Result<JobId, FetchError> {
        let options = json!({
            "dir": job.dir().as_str(),
            "out": job.out().as_str(),
        });
        let gid: String = self
            .rpc
            .call("aria2.addUri", vec![json!([job.url()]), options])
            .map_err(|message| FetchError::JobSubmissionFailure {
                name: job.name().to_string(),
                message,
            })?;
        Ok(JobId::new(gid))
    }

    fn list_jobs(&self) -> Result<Vec<JobStatus>, FetchError> {
        let keys = json!(STATUS_KEYS);
        let mut entries: Vec<RpcDownload> = self
            .rpc
            .call("aria2.tellActive", vec![keys.clone()])
            .map_err(FetchError::EngineQueryFailure)?;
        for method in ["aria2.tellWaiting", "aria2.tellStopped"] {
            let page: Vec<RpcDownload> = self
                .rpc
                .call(method, vec![json!(0), json!(LIST_PAGE), keys.clone()])
                .map_err(FetchError::EngineQueryFailure)?;
            entries.extend(page);
        }
        Ok(entries.into_iter().map(RpcDownload::into_status).collect())
    }

    fn remove(&self, id: &JobId) -> Result<(), FetchError> {
        self.rpc
            .call::<String>("aria2.removeDownloadResult", vec![json!(id.as_str())])
            .map(|_| ())
            .map_err(FetchError::EngineQueryFailure)
    }

    fn stop(self) -> Result<(), FetchError> {
        if let Err(message) = self.rpc.call::<String>("aria2.shutdown", Vec::new()) {
            tracing::debug!("aria2.shutdown refused, killing: {message}");
        }
        self.process.stop(SHUTDOWN_GRACE)
    }
}

#[derive(Debug, Deserialize)]
struct RpcDownload {
    gid: String,
    status: JobState,
}

impl RpcDownload {
    fn into_status(self) -> JobStatus {
        JobStatus {
            id: JobId::new(self.gid),
            state: self.status,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcFault>,
}

#[derive(Debug, Deserialize)]
struct RpcFault {
    code: i64,
    message: String,
}

/// Minimal aria2 JSON-RPC client. Errors are returned as plain messages so
/// callers can file them under the right [`FetchError`] variant.
pub struct Aria2Rpc {
    client: Client,
    endpoint: String,
    secret: Option<String>,
    next_id: AtomicU64,
}

impl Aria2Rpc {
    pub fn new(port: u16, secret: Option<String>, timeout: Duration) -> Result<Self, String> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("clim-fetch/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| err.to_string())?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| err.to_string())?;
        Ok(Self {
            client,
            endpoint: format!("http://127.0.0.1:{port}/jsonrpc"),
            secret,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn call<T: DeserializeOwned>(&self, method: &str, params: Vec<Value>) -> Result<T, String> {
        let mut all_params = Vec::with_capacity(params.len() + 1);
        if let Some(secret) = &self.secret {
            all_params.push(json!(format!("token:{secret}")));
        }
        all_params.extend(params);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id.to_string(),
            "method": method,
            "params": all_params,
        });
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .map_err(|err| format!("{method}: {err}"))?;
        let status = response.status();
        let text = response
            .text()
            .map_err(|err| format!("{method}: {err}"))?;
        parse_response(method, status.as_u16(), &text)
    }
}

fn parse_response<T: DeserializeOwned>(method: &str, status: u16, text: &str) -> Result<T, String> {
    let parsed: RpcResponse<T> = serde_json::from_str(text)
        .map_err(|err| format!("{method}: unexpected response (HTTP {status}): {err}"))?;
    if let Some(fault) = parsed.error {
        return Err(format!("{method}: error {}: {}", fault.code, fault.message));
    }
    parsed
        .result
        .ok_or_else(|| format!("{method}: response carried no result (HTTP {status})"))
}
