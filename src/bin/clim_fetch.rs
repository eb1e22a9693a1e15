use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::Parser;
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use clim_fetch::app::{App, DownloadOptions, FetchReport};
use clim_fetch::aria2::Aria2Launcher;
use clim_fetch::catalog::{normalize, parse_catalog_document};
use clim_fetch::config::{ConfigLoader, ResolvedConfig};
use clim_fetch::error::FetchError;
use clim_fetch::locate::Layout;
use clim_fetch::output::{ConsoleOutput, JsonOutput, OutputMode};
use clim_fetch::store::Store;
use clim_fetch::template::UrlTemplate;

#[derive(Parser)]
#[command(name = "clim-fetch")]
#[command(about = "Download every file of a THREDDS catalog that is not already on disk")]
#[command(version, author)]
struct Cli {
    /// THREDDS catalog XML describing the dataset
    #[arg(long, alias = "xml")]
    catalog: PathBuf,

    /// Directory the files are downloaded into
    #[arg(long)]
    target: Utf8PathBuf,

    /// API token substituted for {token} in the URL template
    #[arg(long, env = "CLIM_FETCH_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// aria2 control port
    #[arg(long)]
    port: Option<u16>,

    /// Verify existing files by checksum instead of size
    #[arg(long)]
    checksum: bool,

    /// Report what would be downloaded without starting the engine
    #[arg(long)]
    dry_run: bool,

    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    url_template: Option<String>,

    #[arg(long, value_enum)]
    layout: Option<Layout>,

    /// Seconds between engine status polls
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Print the final report as JSON instead of progress lines
    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<FetchError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &FetchError) -> u8 {
    match error.root_cause() {
        FetchError::MalformedCatalogEntry { .. }
        | FetchError::CatalogRead { .. }
        | FetchError::CatalogParse(_)
        | FetchError::ConfigRead(_)
        | FetchError::ConfigParse(_)
        | FetchError::InvalidTemplate(_) => 2,
        FetchError::EngineStartFailure { .. } => 3,
        FetchError::Interrupted => 130,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };

    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let options = download_options(&cli, &config)?;
    let template = url_template(&cli, &config)?;
    let layout = cli.layout.unwrap_or(config.layout);

    let root = parse_catalog_document(&cli.catalog)?;
    let catalog = normalize(&root)?;

    let store = Store::new(cli.target.clone());
    store.ensure_root()?;
    let snapshot = store.write_snapshot(&catalog, &config.snapshot_name)?;
    tracing::info!(path = %snapshot, "catalog snapshot saved");
    if output_mode == OutputMode::Human {
        println!("Saving downloaded files to {}", store.root());
    }

    let interrupt = Arc::new(AtomicBool::new(false));
    let handler_flag = interrupt.clone();
    ctrlc::set_handler(move || {
        eprintln!();
        eprintln!("Received interrupt, stopping the transfer engine...");
        handler_flag.store(true, Ordering::SeqCst);
    })
    .into_diagnostic()?;

    let app = App::new(
        Aria2Launcher::new(config.engine.clone()),
        template,
        layout.locator()?,
    )
    .with_interrupt(interrupt);

    let report = match output_mode {
        OutputMode::Human => app.fetch(&catalog, &options, &ConsoleOutput)?,
        OutputMode::Json => app.fetch(&catalog, &options, &JsonOutput)?,
    };

    match output_mode {
        OutputMode::Human => print_summary(&report),
        OutputMode::Json => JsonOutput::print_report(&report).into_diagnostic()?,
    }
    Ok(())
}

fn download_options(cli: &Cli, config: &ResolvedConfig) -> Result<DownloadOptions, FetchError> {
    let poll_interval = match cli.poll_interval {
        Some(0) => {
            return Err(FetchError::ConfigParse(
                "--poll-interval must be positive".to_string(),
            ));
        }
        Some(secs) => Duration::from_secs(secs),
        None => config.poll_interval,
    };
    Ok(DownloadOptions {
        target_dir: cli.target.clone(),
        port: cli.port.unwrap_or(config.port),
        verify_checksum: cli.checksum || config.verify_checksum,
        dry_run: cli.dry_run,
        poll_interval,
        marker_suffix: config.marker_suffix.clone(),
    })
}

fn url_template(cli: &Cli, config: &ResolvedConfig) -> Result<UrlTemplate, FetchError> {
    let raw = cli.url_template.as_deref().unwrap_or(&config.url_template);
    let template = UrlTemplate::parse(raw)?;
    match &cli.token {
        Some(token) => Ok(template.bind("token", token.clone())),
        None if template.references("token") => Err(FetchError::InvalidTemplate(format!(
            "{raw:?} needs {{token}} but no --token was given"
        ))),
        None => Ok(template),
    }
}

fn print_summary(report: &FetchReport) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let reset = "\x1b[0m";

    let color = if report.submission_failures > 0 {
        yellow
    } else {
        green
    };
    println!("{color}{report}{reset}");
}
