// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::{ColoredString, Colorize};
use indicatif::ProgressBar;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

use torstream::config::{load_config, resolve_data_dir, save_config, Config};
use torstream::download::{
    Download, DownloadFilter, DownloadManager, DownloadRegistry, DownloadStatus, JsonFileStore,
};
use torstream::engine::{event_channel, SimulatedEngine};
use torstream::error::{
    describe_manager_error, format_error, EngineError, ManagerError, StorageError,
};
use torstream::utils::{format_bytes, format_eta, format_speed, truncate};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit codes following sysexits.h conventions
mod exit_codes {
    /// Success - operation completed successfully
    pub const SUCCESS: i32 = 0;
    /// General error - unspecified error
    pub const ERROR: i32 = 1;
    /// Usage error - invalid command line arguments
    pub const USAGE: i32 = 64;
    /// Service unavailable - torrent engine refused or failed a command
    pub const SERVICE_UNAVAILABLE: i32 = 69;
    /// I/O error - download list or content could not be read or written
    pub const IO_ERR: i32 = 74;
    /// Temporary failure - another torstream process owns the download list
    pub const TEMP_FAIL: i32 = 75;
}

use exit_codes::*;

/// Progress bar helpers for followed downloads
mod progress {
    use indicatif::{ProgressBar, ProgressStyle};
    use std::time::Duration;

    pub fn create(message: &str) -> ProgressBar {
        let bar = ProgressBar::new(100);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {msg:30} [{bar:30.cyan/blue}] {pos:>3}% {prefix}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
        );
        bar.set_message(message.to_string());
        bar.enable_steady_tick(Duration::from_millis(120));
        bar
    }
}

/// torstream - Torrent download manager
#[derive(Parser)]
#[command(name = "torstream")]
#[command(version = VERSION)]
#[command(about = "Manage torrent downloads: add, pause, resume and inspect their files.")]
#[command(long_about = "torstream - Torrent download manager\n\n\
    Add a download:      torstream add \"magnet:?xt=urn:btih:...\"\n\
    List downloads:      torstream list (or: torstream ls)\n\
    Pause / resume:      torstream pause <id> / torstream resume <id>\n\
    Show files:          torstream files <id>\n\
    Configure:           torstream config show\n\n\
    Downloads left running by an earlier session are paused on startup.\n\
    Only one torstream process changes a download list at a time.")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Data directory (default: $TORSTREAM_HOME or ~/.torstream)
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Quiet mode: minimal output, only essential information
    #[arg(short = 'q', long, global = true)]
    quiet: bool,

    /// Verbose mode: detailed output for debugging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a download and follow it until it finishes
    ///
    /// Examples:
    ///   torstream add "magnet:?xt=urn:btih:08ada5a7a6183aae1e09d831df6748d566095a10&dn=Sintel"
    Add {
        /// Magnet URI
        source: String,
    },

    /// List downloads
    ///
    /// Examples:
    ///   torstream list
    ///   torstream ls --status paused
    #[command(alias = "ls")]
    List {
        /// Only show downloads in this state (downloading, paused, completed, error)
        #[arg(short, long)]
        status: Option<DownloadStatus>,
    },

    /// Show every field of one download
    Show {
        /// Download id
        id: String,
    },

    /// Pause a running download
    Pause {
        /// Download id
        id: String,
    },

    /// Resume a paused download and follow it
    Resume {
        /// Download id
        id: String,
    },

    /// Start a download again from its magnet link and follow it
    Restart {
        /// Download id
        id: String,
    },

    /// Remove a download and delete its content
    #[command(alias = "rm")]
    Remove {
        /// Download id
        id: String,
    },

    /// List the files of a download
    Files {
        /// Download id
        id: String,
    },

    /// Configure settings
    ///
    /// Examples:
    ///   torstream config show
    ///   torstream config set-download-dir ~/Movies
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

impl Commands {
    /// Commands that only read may run beside the process that owns the list.
    fn access(&self) -> Access {
        match self {
            Commands::List { .. } | Commands::Show { .. } | Commands::Files { .. } => Access::Reader,
            _ => Access::Owner,
        }
    }
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Set where downloaded content is written
    SetDownloadDir {
        /// Directory path
        path: PathBuf,
    },
}

/// How a command uses the download list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    /// Changes downloads; needs sole ownership of the list.
    Owner,
    /// Reads the last saved list when another process owns it.
    Reader,
}

/// Everything a download command needs.
struct App {
    manager: Arc<DownloadManager>,
    quiet: bool,
    /// Whether this process owns the list and reconciled it on start
    owner: bool,
}

fn init_logging(verbose: bool, quiet: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let default_filter = if verbose {
        "torstream=debug"
    } else if quiet {
        "torstream=error"
    } else {
        "torstream=warn"
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .init();
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { USAGE } else { SUCCESS };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    init_logging(cli.verbose, cli.quiet);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("{} Failed to start async runtime: {}", "[✗]".red(), e);
            std::process::exit(ERROR);
        }
    };

    let result = runtime.block_on(run(cli));
    // Engine tasks are abandoned; their state is reconciled on the next start
    runtime.shutdown_background();

    match result {
        Ok(()) => std::process::exit(SUCCESS),
        Err(e) => {
            report_error(&e);
            std::process::exit(exit_code_for(&e));
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let data_dir = resolve_data_dir(cli.data_dir.as_deref())?;

    if let Commands::Config { command } = &cli.command {
        return handle_config(&data_dir, command);
    }

    let app = open_app(&data_dir, cli.quiet, cli.command.access()).await?;
    execute(&app, cli.command).await
}

async fn execute(app: &App, command: Commands) -> Result<()> {
    match command {
        Commands::Add { source } => {
            let download = app.manager.add(&source).await?;
            if !app.quiet {
                println!("{} Added {}", "[OK]".green(), download.id.bold());
            }
            follow(app, &download.id).await
        }
        Commands::List { status } => list_downloads(app, status).await,
        Commands::Show { id } => show_download(app, &id).await,
        Commands::Pause { id } => pause_download(app, &id).await,
        Commands::Resume { id } => {
            app.manager.resume(&id).await?;
            follow(app, &id).await
        }
        Commands::Restart { id } => {
            app.manager.restart(&id).await?;
            follow(app, &id).await
        }
        Commands::Remove { id } => remove_download(app, &id).await,
        Commands::Files { id } => list_files(app, &id).await,
        Commands::Config { .. } => Ok(()),
    }
}

/// Wire store, registry, engine and controller together. The process that
/// owns the list then pauses whatever a previous process left running.
async fn open_app(data_dir: &Path, quiet: bool, access: Access) -> Result<App> {
    let config = load_config(data_dir)?;
    let download_dir = config.download_dir(data_dir);
    std::fs::create_dir_all(&download_dir)
        .with_context(|| format!("Failed to create download directory {}", download_dir.display()))?;

    let store = JsonFileStore::new(config.store_path(data_dir)).with_lock_timeout(config.lock_timeout());
    let store = match store.clone().with_instance_lock() {
        Ok(owned) => owned,
        Err(StorageError::InUse { path }) if access == Access::Reader => {
            tracing::debug!("APP_READ_ONLY | owner_lock={:?}", path);
            store
        }
        Err(e) => return Err(ManagerError::from(e).into()),
    };
    let owner = store.is_owner();

    let registry = DownloadRegistry::open(Arc::new(store))
        .await
        .map_err(ManagerError::from)?;

    let (sink, events) = event_channel();
    let engine = SimulatedEngine::new(download_dir, sink)
        .with_rate(config.simulated_rate_bps)
        .with_progress_interval(config.progress_interval());

    let manager = Arc::new(DownloadManager::new(Arc::new(registry), Arc::new(engine)));
    manager.spawn_event_loop(events);

    // Without ownership, DOWNLOADING records belong to a live process
    let paused = if owner {
        manager.pause_unfinished_downloads().await?
    } else {
        0
    };
    if paused > 0 && !quiet {
        println!(
            "{} Paused {} download(s) left running by a previous session",
            "[!]".yellow(),
            paused
        );
    }

    Ok(App {
        manager,
        quiet,
        owner,
    })
}

/// Watch one download until it reaches a terminal state or the user hits Ctrl-C.
async fn follow(app: &App, id: &str) -> Result<()> {
    let (tx, mut rx) = watch::channel::<Option<Download>>(None);
    let _subscription = app
        .manager
        .registry()
        .subscribe_one(id, move |download| {
            tx.send_replace(Some(download.clone()));
        })
        .await;

    // Read after subscribing so a change in between is not missed
    let mut current = app.manager.registry().get(id).await;
    let bar = if app.quiet { None } else { Some(progress::create("Searching...")) };

    let last = loop {
        if let Some(update) = rx.borrow_and_update().clone() {
            current = Some(update);
        }
        let Some(download) = &current else {
            break None;
        };
        if let Some(bar) = &bar {
            render(bar, download);
        }
        if download.status.is_terminal() {
            break current;
        }

        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break current;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                if let Some(bar) = &bar {
                    bar.finish_and_clear();
                }
                match app.manager.pause(id).await {
                    Ok(_) | Err(ManagerError::Engine(_)) | Err(ManagerError::InvalidTransition { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
                println!(
                    "{} Paused {}. Resume with: torstream resume {}",
                    "[!]".yellow(),
                    id,
                    id
                );
                return Ok(());
            }
        }
    };

    if let Some(bar) = &bar {
        bar.finish_and_clear();
    }

    match last {
        Some(download) if download.status == DownloadStatus::Completed => {
            if !app.quiet {
                println!(
                    "{} {} ({})",
                    "[OK]".green(),
                    download.name.bold(),
                    format_bytes(download.total_size)
                );
                if let Some(location) = &download.location {
                    println!("     {}", location.dimmed());
                }
            }
            Ok(())
        }
        Some(download) if download.status == DownloadStatus::Error => {
            let detail = download.error.unwrap_or_else(|| "unknown error".to_string());
            Err(ManagerError::Engine(EngineError::Fatal(detail)))
                .with_context(|| format!("Download {} failed", id))
        }
        _ => anyhow::bail!("Download {} is no longer tracked", id),
    }
}

fn render(bar: &ProgressBar, download: &Download) {
    bar.set_message(truncate(&download.name, 30));
    bar.set_position(download.progress as u64);

    let mut details = format!(
        "{} / {}",
        format_bytes(download.downloaded_size),
        format_bytes(download.total_size)
    );
    if download.status == DownloadStatus::Downloading {
        details.push_str(&format!(
            "  {}  {} peers",
            format_speed(download.download_rate),
            download.peers
        ));
        if let Some(eta) = download.eta_seconds() {
            details.push_str(&format!("  ETA {}", format_eta(eta)));
        }
    }
    bar.set_prefix(details);
}

fn status_label(status: DownloadStatus) -> ColoredString {
    let text = format!("{:<11}", status.as_str());
    match status {
        DownloadStatus::Downloading => text.cyan(),
        DownloadStatus::Paused => text.yellow(),
        DownloadStatus::Completed => text.green(),
        DownloadStatus::Error => text.red(),
    }
}

async fn list_downloads(app: &App, status: Option<DownloadStatus>) -> Result<()> {
    let mut filter = DownloadFilter::new();
    if let Some(status) = status {
        filter = filter.status(status);
    }
    let downloads = app.manager.registry().get_all_by_filter(&filter).await;

    if downloads.is_empty() {
        println!("No downloads. Add one with: torstream add <magnet>");
        return Ok(());
    }
    if !app.owner && !app.quiet {
        println!(
            "{} Another torstream process is running; showing its last saved state",
            "[!]".yellow()
        );
    }

    println!(
        "{}",
        format!(
            "{:<20} {:<32} {:<11} {:>5} {:>12}",
            "ID", "NAME", "STATUS", "PROG", "SIZE"
        )
        .bold()
    );
    for download in &downloads {
        println!(
            "{:<20} {:<32} {} {:>4}% {:>12}",
            download.id,
            truncate(&download.name, 32),
            status_label(download.status),
            download.progress,
            format_bytes(download.total_size)
        );
    }
    Ok(())
}

async fn show_download(app: &App, id: &str) -> Result<()> {
    let download = app
        .manager
        .registry()
        .get(id)
        .await
        .ok_or_else(|| ManagerError::NotFound(id.to_string()))?;

    println!("{}", download.name.bold());
    println!("  {:<12} {}", "id", download.id);
    println!("  {:<12} {}", "status", status_label(download.status));
    println!("  {:<12} {}%", "progress", download.progress);
    println!(
        "  {:<12} {} / {}",
        "size",
        format_bytes(download.downloaded_size),
        format_bytes(download.total_size)
    );
    if download.status == DownloadStatus::Downloading {
        println!("  {:<12} {}", "rate", format_speed(download.download_rate));
        println!("  {:<12} {} ({} seeders)", "peers", download.peers, download.seeders);
        if let Some(eta) = download.eta_seconds() {
            println!("  {:<12} {}", "eta", format_eta(eta));
        }
    }
    if let Some(location) = &download.location {
        println!("  {:<12} {}", "location", location);
    }
    if let Some(error) = &download.error {
        println!("  {:<12} {}", "error", error.red());
    }
    println!("  {:<12} {}", "source", download.source.dimmed());
    println!("  {:<12} {}", "created", download.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("  {:<12} {}", "updated", download.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    Ok(())
}

async fn pause_download(app: &App, id: &str) -> Result<()> {
    match app.manager.pause(id).await {
        Ok(_) => {}
        Err(ManagerError::Engine(EngineError::NotFound(_))) => {
            tracing::debug!("PAUSE_NO_SESSION | id={}", id);
        }
        // Startup reconciliation already paused what the last process left running
        Err(ManagerError::InvalidTransition {
            status: DownloadStatus::Paused,
            ..
        }) => {
            tracing::debug!("PAUSE_ALREADY_PAUSED | id={}", id);
        }
        Err(e) => return Err(e.into()),
    }
    if !app.quiet {
        println!("{} Paused {}", "[OK]".green(), id);
    }
    Ok(())
}

async fn remove_download(app: &App, id: &str) -> Result<()> {
    let result = app.manager.remove(id).await;
    match result {
        Ok(download) => {
            if !app.quiet {
                println!("{} Removed {} ({})", "[OK]".green(), id, download.name);
            }
            Ok(())
        }
        Err(ManagerError::Engine(e)) => {
            println!("{} Removed {} from the list", "[!]".yellow(), id);
            Err(ManagerError::Engine(e)).context("Content could not be deleted")
        }
        Err(e) => Err(e.into()),
    }
}

async fn list_files(app: &App, id: &str) -> Result<()> {
    let files = app.manager.content(id).await?;
    if files.is_empty() {
        println!("No files found in this download");
        return Ok(());
    }

    println!("{}", format!("{:<9} {:>12}  {}", "KIND", "SIZE", "NAME").bold());
    for file in &files {
        let kind = format!("{:<9}", file.kind.as_str());
        let kind = match file.kind {
            torstream::FileKind::Video => kind.cyan(),
            torstream::FileKind::Subtitle => kind.green(),
            _ => kind.normal(),
        };
        println!("{} {:>12}  {}", kind, format_bytes(file.size), file.name);
    }
    Ok(())
}

fn handle_config(data_dir: &Path, command: &ConfigCommands) -> Result<()> {
    let mut config = load_config(data_dir)?;
    match command {
        ConfigCommands::Show => print_config(data_dir, &config),
        ConfigCommands::SetDownloadDir { path } => {
            let path = if path.is_absolute() {
                path.clone()
            } else {
                std::env::current_dir()
                    .context("Could not determine current directory")?
                    .join(path)
            };
            std::fs::create_dir_all(&path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            config.download_dir = Some(path.clone());
            save_config(data_dir, &config)?;
            println!("{} Download directory set to {}", "[OK]".green(), path.display());
        }
    }
    Ok(())
}

fn print_config(data_dir: &Path, config: &Config) {
    println!("{}", "Configuration".bold());
    println!("  {:<20} {}", "data_dir", data_dir.display());
    println!("  {:<20} {}", "download_dir", config.download_dir(data_dir).display());
    println!("  {:<20} {}", "store", config.store_path(data_dir).display());
    println!("  {:<20} {} ms", "progress_interval", config.progress_interval_ms);
    println!("  {:<20} {}", "simulated_rate", format_speed(config.simulated_rate_bps));
    println!("  {:<20} {} s", "lock_timeout", config.lock_timeout_secs);
}

fn report_error(err: &anyhow::Error) {
    let message = match err.downcast_ref::<ManagerError>() {
        Some(manager_err) if err.chain().count() == 1 => describe_manager_error(manager_err),
        _ => format_error(&format!("{:#}", err), &[], &[]),
    };
    eprint!("{}", message.as_str().red());
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<ManagerError>() {
        Some(ManagerError::Storage(StorageError::InUse { .. })) => TEMP_FAIL,
        Some(ManagerError::Storage(_)) | Some(ManagerError::Io { .. }) => IO_ERR,
        Some(ManagerError::Engine(_)) => SERVICE_UNAVAILABLE,
        Some(_) => ERROR,
        None if err.downcast_ref::<std::io::Error>().is_some() => IO_ERR,
        None => ERROR,
    }
}
