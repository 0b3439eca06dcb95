pub mod collector;
pub mod error;
pub mod instance;
pub mod note_builder;
pub mod oauth;
pub mod pipeline;
pub mod refile;
pub mod settings;
pub mod store;
pub mod watcher;

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

pub use error::{Error, Result};
pub use pipeline::{ImportPipeline, ImportResult, ImportRunResult, RunMode};

use instance::InstanceLock;
use oauth::OAuthClient;
use settings::Settings;
use store::edam::EdamConnector;
use store::{NoteStore, StoreConnector};

/// Guard name shared by every watch process on the machine.
pub const INSTANCE_NAME: &str = "EvernoteDirectoryMonitor";

/// Exit status when another watch process holds the guard.
const EXIT_ALREADY_RUNNING: u8 = 3;
const EXIT_FAILURE: u8 = 1;

#[derive(Parser)]
#[command(name = "evernote-sync")]
#[command(version, about = "Imports files dropped into a directory tree as Evernote notes")]
struct Cli {
    /// Env file applied before reading settings (default: configs/config.dev)
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the directory tree and import every new file
    Watch {
        /// Import into the sandbox account and keep the source files
        #[arg(long)]
        sandbox: bool,
    },

    /// Import everything currently in the configured subdirectories
    Import,

    /// Obtain an access token through the browser grant flow
    Token,

    /// Retitle, retag and move existing notes matching each search phrase
    Refile,
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "cannot start async runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(execute(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(exit_status(&e))
        }
    }
}

fn exit_status(e: &anyhow::Error) -> u8 {
    match e.downcast_ref::<Error>() {
        Some(Error::AlreadyRunning(_)) => EXIT_ALREADY_RUNNING,
        _ => EXIT_FAILURE,
    }
}

async fn execute(cli: Cli) -> anyhow::Result<()> {
    let env_file = cli.env_file.as_deref();
    match cli.command {
        Commands::Watch { sandbox } => watch(env_file, sandbox).await,
        Commands::Import => import(env_file).await,
        Commands::Token => token(env_file).await,
        Commands::Refile => refile(env_file).await,
    }
}

fn connector(settings: &Settings) -> Result<EdamConnector> {
    Ok(EdamConnector::new(settings.service_host(), settings.token()?))
}

async fn watch(env_file: Option<&Path>, sandbox: bool) -> anyhow::Result<()> {
    // Before anything else touches the filesystem or the network
    let _guard = InstanceLock::acquire(INSTANCE_NAME)?;

    let mut settings = Settings::load(env_file)?;
    settings.sandbox = sandbox;
    let root = watcher::watch_root(settings.root_directory()?)?;

    let connector = connector(&settings)?;
    let user = connector.connect().await?.current_user().await?;
    info!(user_id = user.id, username = ?user.username, "token accepted");

    let pipeline = Arc::new(ImportPipeline::new(
        connector,
        &root,
        &settings.config_file,
        settings.sandbox,
    ));

    let (queue_tx, queue_rx) = watcher::import_queue();
    let worker = watcher::spawn_import_worker(pipeline, queue_rx);
    let directory_watcher = watcher::start(&root, queue_tx)?;
    info!(store = settings.target_label(), root = %root.display(), "monitor started");

    shutdown_signal().await;
    info!("stopping monitor");

    // Unsubscribing closes the queue; the worker finishes what is queued
    drop(directory_watcher);
    let runs = worker.await?;
    info!(runs, "monitor stopped");
    Ok(())
}

async fn import(env_file: Option<&Path>) -> anyhow::Result<()> {
    let settings = Settings::load(env_file)?;
    let pipeline = ImportPipeline::new(
        connector(&settings)?,
        settings.root_directory()?,
        &settings.config_file,
        settings.sandbox,
    );

    let result = pipeline.run(RunMode::FullScan).await?;
    println!(
        "{} file(s) considered, {} note(s) created",
        result.considered,
        result.imported.len()
    );
    Ok(())
}

async fn token(env_file: Option<&Path>) -> anyhow::Result<()> {
    let settings = Settings::load(env_file)?;
    let (consumer_key, consumer_secret) = settings.consumer()?;
    let client = OAuthClient::new(settings.service_host(), consumer_key, consumer_secret)?;

    let access = client
        .process_token_request(&settings.callback_url, settings.callback_timeout)
        .await?;

    println!("Access token: {}", access.token);
    if let Some(url) = &access.note_store_url {
        println!("Note store URL: {}", url);
    }
    if let Some(user_id) = access.user_id {
        println!("User id: {}", user_id);
    }
    if let Some(expires) = access
        .expires
        .and_then(chrono::DateTime::<chrono::Utc>::from_timestamp_millis)
    {
        println!("Expires: {}", expires.to_rfc3339());
    }

    if client.test_access_token(&access.token).await {
        println!("Token \"{}\" tested successfully", access.token);
    } else {
        println!("Token FAILED");
    }
    Ok(())
}

async fn refile(env_file: Option<&Path>) -> anyhow::Result<()> {
    let settings = Settings::load(env_file)?;
    let summary = refile::run_refile(&connector(&settings)?, &settings.config_file).await?;
    println!("{} note(s) found, {} note(s) re-filed", summary.found, summary.refiled);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
