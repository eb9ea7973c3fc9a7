//! Tandem sync daemon
//!
//! Run with: tandem-sync --local-root ~/Tandem

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tandem::config::{self, SyncConfig};
use tandem::sync::remote::{CursorFile, GoogleDriveClient};
use tandem::sync::{BackoffPolicy, SyncBroker};
use tandem::{LocalBackend, RemoteDriveBackend};

#[derive(Parser, Debug)]
#[command(name = "tandem-sync")]
#[command(about = "Mirror a local directory and a Google Drive folder")]
#[command(version)]
struct Args {
    /// Configuration file (defaults to the platform config dir)
    #[arg(long, env = "TANDEM_CONFIG")]
    config: Option<String>,

    /// Local directory to mirror
    #[arg(long, env = "TANDEM_LOCAL_ROOT")]
    local_root: Option<String>,

    /// Drive folder id acting as the remote root
    #[arg(long, env = "TANDEM_ROOT_FOLDER_ID")]
    root_folder_id: Option<String>,

    /// Change cursor to resume from
    #[arg(long, env = "TANDEM_START_CURSOR")]
    start_cursor: Option<String>,

    /// Log as JSON lines
    #[arg(long, env = "TANDEM_LOG_JSON")]
    log_json: bool,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json_layer = json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
    });
    let text_layer = (!json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(false)
    });

    tracing_subscriber::registry()
        .with(json_layer)
        .with(text_layer)
        .with(filter)
        .init();
}

async fn load_config(args: &Args) -> anyhow::Result<SyncConfig> {
    let path = match &args.config {
        Some(path) => Some(PathBuf::from(shellexpand::tilde(path).to_string())),
        None => {
            let path = SyncConfig::default_path();
            path.exists().then_some(path)
        }
    };

    let mut config = match path {
        Some(path) => {
            tracing::info!(path = %path.display(), "Loading configuration");
            SyncConfig::load(&path)
                .await
                .with_context(|| format!("loading {}", path.display()))?
        }
        None => SyncConfig::default(),
    };

    if let Some(root) = &args.local_root {
        config.local.root = Some(config::expand(&PathBuf::from(root)));
    }
    if let Some(id) = &args.root_folder_id {
        config.remote.root_folder_id = id.clone();
    }
    if let Some(cursor) = &args.start_cursor {
        config.remote.start_cursor = Some(cursor.clone());
    }
    Ok(config.with_env_overrides())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_json);

    let config = load_config(&args).await?;
    let Some(local_root) = config.local.root.clone() else {
        bail!("no local root configured (use --local-root or [local] root)");
    };

    let broker = Arc::new(SyncBroker::new(&config.engine));

    let local = Arc::new(
        LocalBackend::open(&local_root)
            .await
            .with_context(|| format!("opening {}", local_root.display()))?,
    );

    let client = GoogleDriveClient::new(&config.remote).context("creating drive client")?;
    let mut remote = RemoteDriveBackend::new(
        Arc::new(client),
        &config.remote,
        BackoffPolicy::from(&config.backoff),
    );
    if let Some(path) = &config.remote.cursor_file {
        remote = remote.with_cursor_file(CursorFile::new(path));
    }
    let remote = Arc::new(remote);

    broker.register(local.clone());
    broker.register(remote.clone());
    tracing::info!(backends = ?broker.backends(), root = %local.root().display(), "Sync started");

    let cancel = CancellationToken::new();
    let local_task = tokio::spawn(local.clone().run(broker.clone(), cancel.clone()));
    let remote_task = tokio::spawn(remote.clone().run(broker.clone(), cancel.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    tracing::info!("Shutting down");
    cancel.cancel();

    for (name, task) in [("local", local_task), ("drive", remote_task)] {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(backend = name, error = %e, "Backend loop failed"),
            Err(e) => tracing::error!(backend = name, error = %e, "Backend task panicked"),
        }
    }

    broker.shutdown().await;
    remote.save_cursor().await.context("saving change cursor")?;
    if let Some(cursor) = remote.cursor() {
        tracing::info!(cursor = %cursor, "Stopped; resume with --start-cursor");
    }
    Ok(())
}
