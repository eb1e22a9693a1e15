use std::io::{self, Write};

use serde::Serialize;

use crate::app::{FetchReport, ProgressEvent, ProgressSink};
use crate::domain::Stage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Human,
    Json,
}

/// Human-readable progress lines on stdout.
pub struct ConsoleOutput;

impl ConsoleOutput {
    pub fn lines(event: &ProgressEvent) -> Vec<String> {
        match event {
            ProgressEvent::FilterStarted {
                total,
                verify_checksum,
            } => {
                let method = if *verify_checksum {
                    "checksum"
                } else {
                    "size check"
                };
                vec![format!(
                    "Filtering out already downloaded files among {total} via {method}"
                )]
            }
            ProgressEvent::Filtered {
                already_present,
                to_fetch,
                total,
            } => vec![
                format!("{already_present}/{total} urls already downloaded"),
                format!("{to_fetch}/{total} urls to download"),
            ],
            ProgressEvent::EngineStarted { port } => vec![
                format!("Started transfer engine in the background on port {port}"),
                format!("Use 'aria2p -p {port}' to monitor downloads"),
            ],
            ProgressEvent::Submitted { submitted, failed } => {
                let mut lines = vec![format!("Submitted {submitted} downloads")];
                if *failed > 0 {
                    lines.push(format!("{failed} submissions failed, see log for details"));
                }
                lines
            }
            ProgressEvent::Tick { done, expected, .. } => vec![format!("{done}/{expected} done")],
            ProgressEvent::Stage(Stage::Done) => vec!["Downloading done".to_string()],
            ProgressEvent::Stage(_) => Vec::new(),
        }
    }
}

impl ProgressSink for ConsoleOutput {
    fn event(&self, event: ProgressEvent) {
        let mut stdout = io::stdout().lock();
        for line in Self::lines(&event) {
            if let Err(err) = writeln!(stdout, "{line}") {
                tracing::debug!("progress line not written: {err}");
            }
        }
    }
}

/// Silent while running; prints the final report as JSON.
pub struct JsonOutput;

impl JsonOutput {
    pub fn print_report(report: &FetchReport) -> io::Result<()> {
        Self::print_json(report)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}
