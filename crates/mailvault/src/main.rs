//! mailvault: back up a Gmail mailbox to object storage and restore it.
//!
//! Usage:
//!     mailvault auth --write
//!     mailvault --config config.toml backup --since 2024-01-01
//!     mailvault restore --apply
//!     mailvault daemon --every 900

use std::path::PathBuf;
use std::process::{Command as Process, ExitCode};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate};
use clap::{Args, Parser, Subcommand};
use mailvault_core::config::StorageBackend;
use mailvault_core::gmail::consent;
use mailvault_core::gmail::{
    CONTROL_HANDLE, ClientSecrets, ConsentFlow, FileTokenStore, GmailMailboxFactory, MailApi,
    MailboxFactory, Retrying, TokenStore,
};
use mailvault_core::naming::prefix_from_email;
use mailvault_core::state::ClaimKind;
use mailvault_core::{
    BackupEngine, BackupOptions, Config, FsObjectStore, ObjectStore, RehydrateOptions,
    RestoreEngine, RestoreOptions, RetryPolicy, RunError, RunLock, S3ObjectStore, StateStore,
    init_logging, rehydrate_index,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

const EXIT_ITEM_ERRORS: u8 = 2;
const EXIT_LOCK_HELD: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "mailvault", version, about = "Back up a Gmail mailbox to object storage")]
struct Cli {
    /// Configuration file
    #[arg(long, env = "CONFIG_PATH", default_value = "config.toml", global = true)]
    config: PathBuf,

    /// Derive the storage prefix from the account address when none is configured
    #[arg(long, global = true)]
    auto_prefix: bool,

    /// Concurrent workers (overrides sync.workers)
    #[arg(long, global = true)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Grant access to the mailbox in a browser and save the token file
    Auth(AuthArgs),
    /// Copy new messages from the mailbox into storage
    Backup(BackupArgs),
    /// Insert backed-up messages that are missing from the mailbox
    Restore(RestoreArgs),
    /// Rebuild the local index from objects already in storage
    RehydrateIndex(RehydrateArgs),
    /// Run a backup on a fixed interval until interrupted
    Daemon(DaemonArgs),
    /// Print the sync state and index counts
    Status,
}

#[derive(Args, Debug)]
struct AuthArgs {
    /// OAuth client JSON downloaded from the Google Cloud console
    #[arg(long)]
    credentials: Option<PathBuf>,

    /// Also request the scopes restore needs (insert and modify)
    #[arg(long)]
    write: bool,

    /// Only print the consent URL
    #[arg(long)]
    no_browser: bool,
}

#[derive(Args, Debug, Clone)]
struct BackupArgs {
    /// Only scan messages after this day (YYYY-MM-DD)
    #[arg(long)]
    since: Option<NaiveDate>,

    /// Stop after this many messages (0 = unlimited)
    #[arg(long = "max-messages", default_value_t = 0)]
    max_messages: u64,
}

#[derive(Args, Debug)]
struct RestoreArgs {
    /// Write to the mailbox. Without this flag nothing is changed.
    #[arg(long)]
    apply: bool,

    /// Only consider messages dated on or after this day (YYYY-MM-DD, UTC)
    #[arg(long)]
    since: Option<NaiveDate>,

    /// Stop after this many candidates (0 = unlimited)
    #[arg(long = "max-messages", default_value_t = 0)]
    max_messages: u64,
}

#[derive(Args, Debug)]
struct RehydrateArgs {
    /// Also rebuild the restore index from restore markers
    #[arg(long)]
    restore_markers: bool,

    /// Stop after this many listed objects (0 = unlimited)
    #[arg(long = "max-messages", default_value_t = 0)]
    max_messages: u64,
}

#[derive(Args, Debug)]
struct DaemonArgs {
    /// Seconds between runs
    #[arg(long, value_parser = clap::value_parser!(u64).range(30..))]
    every: u64,

    #[command(flatten)]
    backup: BackupArgs,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };
    if cli.auto_prefix {
        config.storage.auto_prefix = true;
    }
    if let Some(workers) = cli.workers {
        config.sync.workers = workers.max(1);
    }

    if let Err(err) = init_logging(&config.app) {
        eprintln!("error: {err}");
        return ExitCode::FAILURE;
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let result = match cli.command {
        Command::Auth(args) => auth(&config, &args).await,
        Command::Backup(args) => backup(&config, &args, &shutdown).await,
        Command::Restore(args) => restore(&config, &args, &shutdown).await,
        Command::RehydrateIndex(args) => rehydrate(&config, &args, &shutdown).await,
        Command::Daemon(args) => daemon(&config, &args, &shutdown).await,
        Command::Status => status(&config).await,
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            error!(error = %err, "run failed");
            eprintln!("error: {err}");
            ExitCode::from(exit_code_for(err.as_ref()))
        }
    }
}

fn exit_code_for(err: &(dyn std::error::Error + 'static)) -> u8 {
    match err.downcast_ref::<RunError>() {
        Some(run) if run.is_lock_held() => EXIT_LOCK_HELD,
        _ => 1,
    }
}

/// Takes the run lock, opens the index and drops claims left by a dead run.
async fn open_state(config: &Config, kind: ClaimKind) -> CliResult<(RunLock, Arc<StateStore>)> {
    let lock = RunLock::acquire(&config.paths.state_dir).map_err(RunError::from)?;
    let state = StateStore::open(&config.paths.state_dir)
        .await
        .map_err(RunError::from)?;
    let cleared = state
        .clear_in_flight_claims(&lock, kind)
        .await
        .map_err(RunError::from)?;
    if cleared > 0 {
        info!(cleared, "cleared claims left by an earlier run");
    }
    Ok((lock, Arc::new(state)))
}

async fn resolve_prefix(
    config: &Config,
    state: &StateStore,
    factory: Option<&GmailMailboxFactory>,
) -> CliResult<String> {
    if !config.wants_auto_prefix() {
        return Ok(config.storage_prefix());
    }

    let document = state.read_state().await.map_err(RunError::from)?;
    if let Some(email) = document.email_address.filter(|email| !email.is_empty()) {
        return Ok(prefix_from_email(&email));
    }

    if let Some(factory) = factory {
        let control = Retrying::new(
            factory.open(CONTROL_HANDLE)?,
            RetryPolicy::from_config(&config.retry),
        );
        let profile = control.profile().await?;
        if let Some(email) = profile.email_address.filter(|email| !email.is_empty()) {
            return Ok(prefix_from_email(&email));
        }
    }

    warn!("could not determine the account address, using the configured prefix");
    Ok(config.storage_prefix())
}

fn open_store(config: &Config, prefix: &str) -> CliResult<Arc<dyn ObjectStore>> {
    match config.storage.backend {
        StorageBackend::Fs => {
            let store =
                FsObjectStore::new(&config.storage.root, prefix).map_err(RunError::from)?;
            info!(base = %store.base().display(), "using directory object store");
            Ok(Arc::new(store))
        }
        StorageBackend::S3 => {
            let store = S3ObjectStore::from_config(&config.storage.s3, prefix)
                .map_err(RunError::from)?
                .with_retry_policy(RetryPolicy::from_config(&config.retry));
            info!(
                bucket = store.bucket_name(),
                prefix = store.prefix(),
                "using bucket object store"
            );
            Ok(Arc::new(store))
        }
    }
}

async fn auth(config: &Config, args: &AuthArgs) -> CliResult<u8> {
    let secrets = match &args.credentials {
        Some(path) => ClientSecrets::from_file(path).await?,
        None => {
            config.require_gmail_credentials()?;
            ClientSecrets {
                client_id: config.gmail.client_id.clone(),
                client_secret: config.gmail.client_secret.clone(),
            }
        }
    };
    if secrets.client_id != config.gmail.client_id {
        warn!(
            "set gmail.client_id and gmail.client_secret (or GOOGLE_CLIENT_ID / GOOGLE_CLIENT_SECRET) \
             to this OAuth client, later runs need it to refresh the token"
        );
    }

    let mut flow = ConsentFlow::new(
        secrets.client_id.clone(),
        secrets.client_secret.clone(),
        consent::scopes(args.write),
    );
    if let Some(endpoint) = &config.gmail.token_endpoint {
        flow = flow.with_token_endpoint(endpoint.clone());
    }
    let open_browser = !args.no_browser;
    let tokens = flow
        .run(|url| {
            println!("Open this URL to grant access:\n\n{url}\n");
            if open_browser {
                if let Err(err) = open_in_browser(url.as_str()) {
                    warn!(error = %err, "could not open a browser, use the URL above");
                }
            }
        })
        .await?;

    let token_store = Arc::new(FileTokenStore::new(config.token_path()));
    token_store.save_tokens(&tokens).await?;
    println!("Saved tokens to {}", token_store.path().display());

    // One profile call proves the token works.
    let mut factory = GmailMailboxFactory::new(
        secrets.client_id,
        secrets.client_secret,
        tokens,
        token_store,
    );
    if let Some(base) = &config.gmail.api_base {
        factory = factory.with_api_base(base.clone());
    }
    if let Some(endpoint) = &config.gmail.token_endpoint {
        factory = factory.with_token_endpoint(endpoint.clone());
    }
    let control = Retrying::new(
        factory.open(CONTROL_HANDLE)?,
        RetryPolicy::from_config(&config.retry),
    );
    let profile = control.profile().await?;
    println!(
        "Authorized {} (history id {})",
        profile.email_address.as_deref().unwrap_or("unknown account"),
        profile.history_id.as_deref().unwrap_or("none")
    );
    Ok(0)
}

fn open_in_browser(url: &str) -> std::io::Result<()> {
    #[cfg(target_os = "macos")]
    let mut command = Process::new("open");
    #[cfg(target_os = "windows")]
    let mut command = {
        let mut cmd = Process::new("cmd");
        cmd.arg("/C").arg(format!("start \"\" \"{}\"", url.replace('"', "\"\"")));
        cmd
    };
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    let mut command = Process::new("xdg-open");

    #[cfg(not(target_os = "windows"))]
    command.arg(url);
    let status = command.status()?;
    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::other(format!(
            "browser command exited with {status}"
        )))
    }
}

async fn backup(config: &Config, args: &BackupArgs, cancel: &CancellationToken) -> CliResult<u8> {
    config.require_gmail_credentials()?;
    let (_lock, state) = open_state(config, ClaimKind::Upload).await?;
    let factory = Arc::new(GmailMailboxFactory::from_config(config).await?);
    let prefix = resolve_prefix(config, &state, Some(factory.as_ref())).await?;
    let store = open_store(config, &prefix)?;

    let options = BackupOptions {
        since: args.since,
        max_messages: Some(args.max_messages),
        ..BackupOptions::from_config(&config.sync)
    };
    let engine = BackupEngine::new(
        state,
        store,
        factory,
        RetryPolicy::from_config(&config.retry),
        options,
    );
    let stats = engine.run(cancel).await?;

    println!(
        "Backup complete: mode={:?} uploaded={} skipped={} errors={}",
        stats.mode, stats.uploaded, stats.skipped, stats.errors
    );
    print_samples(&stats.error_samples);
    Ok(if stats.has_errors() { EXIT_ITEM_ERRORS } else { 0 })
}

async fn restore(config: &Config, args: &RestoreArgs, cancel: &CancellationToken) -> CliResult<u8> {
    config.require_gmail_credentials()?;
    let (_lock, state) = open_state(config, ClaimKind::Restore).await?;
    let factory = Arc::new(GmailMailboxFactory::from_config(config).await?);
    let prefix = resolve_prefix(config, &state, Some(factory.as_ref())).await?;
    let store = open_store(config, &prefix)?;

    let options = RestoreOptions {
        apply: args.apply,
        since: args.since,
        max_messages: Some(args.max_messages),
        ..RestoreOptions::from_config(&config.sync)
    };
    let engine = RestoreEngine::new(
        state,
        store,
        factory,
        RetryPolicy::from_config(&config.retry),
        options,
    );
    let stats = engine.run(cancel).await?;

    let mode = if stats.apply { "RESTORE" } else { "DRY-RUN" };
    println!(
        "{mode} complete: considered={} restored={} skipped={} errors={}",
        stats.considered, stats.restored, stats.skipped, stats.errors
    );
    print_samples(&stats.error_samples);
    Ok(if stats.should_fail() { EXIT_ITEM_ERRORS } else { 0 })
}

async fn rehydrate(
    config: &Config,
    args: &RehydrateArgs,
    cancel: &CancellationToken,
) -> CliResult<u8> {
    let (_lock, state) = open_state(config, ClaimKind::Upload).await?;
    let factory = if config.wants_auto_prefix() && config.require_gmail_credentials().is_ok() {
        GmailMailboxFactory::from_config(config).await.ok()
    } else {
        None
    };
    let prefix = resolve_prefix(config, &state, factory.as_ref()).await?;
    let store = open_store(config, &prefix)?;

    let options = RehydrateOptions {
        with_markers: args.restore_markers,
        max_objects: Some(args.max_messages),
        progress_every: config.sync.progress_every,
    };
    let report = rehydrate_index(&state, store.as_ref(), &options, cancel).await?;

    println!(
        "Rehydrated message index: transferred {} -> {} (delta={})",
        report.transferred_before,
        report.transferred_after,
        report.transferred_delta()
    );
    if let Some((before, after)) = report.restored {
        println!(
            "Rehydrated restore index: restored {before} -> {after} (delta={})",
            after.saturating_sub(before)
        );
    }
    Ok(0)
}

async fn daemon(config: &Config, args: &DaemonArgs, cancel: &CancellationToken) -> CliResult<u8> {
    let every = Duration::from_secs(args.every);
    info!(every_secs = args.every, "starting backup daemon");

    while !cancel.is_cancelled() {
        match backup(config, &args.backup, cancel).await {
            Ok(0) => {}
            Ok(code) => warn!(code, "backup run finished with errors"),
            Err(err) => error!(error = %err, "backup run crashed"),
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(every) => {}
        }
    }

    info!("backup daemon stopped");
    Ok(0)
}

async fn status(config: &Config) -> CliResult<u8> {
    let state = StateStore::open(&config.paths.state_dir)
        .await
        .map_err(RunError::from)?;
    let document = state.read_state().await.map_err(RunError::from)?;
    let transferred = state.transferred_count().await.map_err(RunError::from)?;
    let restored = state.restored_count().await.map_err(RunError::from)?;

    let last_run = document
        .last_run_at
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| "never".to_string());

    println!("state dir:          {}", state.root().display());
    println!("storage backend:    {:?}", config.storage.backend);
    println!("storage prefix:     {}", config.storage_prefix());
    println!(
        "account:            {}",
        document.email_address.as_deref().unwrap_or("unknown")
    );
    println!(
        "history id:         {}",
        document.history_id.as_deref().unwrap_or("none")
    );
    println!("full scan complete: {}", document.full_scan_complete);
    println!("last run:           {last_run}");
    println!("transferred:        {transferred}");
    println!("restored:           {restored}");
    Ok(0)
}

fn print_samples(samples: &[String]) {
    if samples.is_empty() {
        return;
    }
    eprintln!("Sample errors:");
    for sample in samples {
        eprintln!("- {sample}");
    }
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("received ctrl+c, finishing in-flight work");
        }
        _ = terminate => {
            warn!("received terminate signal, finishing in-flight work");
        }
    }

    shutdown.cancel();
}
