//! Builds an overlay from the configuration and runs one command against it.

use std::sync::Arc;

use overlay_fs::backend::{BackendContext, BackendError, BackendRegistry};
use overlay_fs::content_type::ContentTypes;
use overlay_fs::overlay::Overlay;
use overlay_fs::store::{DirStore, InvalidRootPathError, LocalStore};
use overlay_fs::sync;
use thiserror::Error;
use tokio::io::AsyncWriteExt as _;
use tokio::select;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::Command;
use crate::app_config::Config;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to open the local store: {0}")]
    Store(#[from] InvalidRootPathError),

    #[error("Failed to set up the backend: {0}")]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{failed} of {total} paths could not be fetched")]
    FetchFailed { failed: usize, total: usize },

    #[error("Interrupted")]
    Interrupted,
}

/// Assemble store, synchronizer and backend into an overlay.
pub async fn open(config: &Config) -> Result<Overlay, SessionError> {
    let mut store = if config.store.temporary {
        DirStore::temporary(&config.store.path).await?
    } else {
        DirStore::open(&config.store.path).await?
    };
    if let Some(max_age) = config.store.expire_after() {
        store = store.with_expire_after(max_age);
    }
    let store: Arc<dyn LocalStore> = Arc::new(store);

    let registry = BackendRegistry::with_defaults();
    let ctx = BackendContext {
        store,
        env: config.backend.backend_env(),
        content_types: Arc::new(ContentTypes::default()),
    };
    let synchronizer = sync::create(config.fetch.workers, config.fetch.shards);
    let binding = registry
        .build(&config.backend.scheme, ctx, synchronizer)
        .await?;

    debug!(scheme = %config.backend.scheme, "overlay ready");
    Ok(Overlay::new(binding, config.fetch.send))
}

async fn execute(overlay: &Overlay, command: Command) -> Result<(), SessionError> {
    match command {
        Command::Exists { path } => {
            let present = overlay.exists(&path).await?;
            println!("{present}");
        }
        Command::Fetch { paths } => {
            let total = paths.len();
            let mut fetches = JoinSet::new();
            for path in paths {
                let overlay = overlay.clone();
                fetches.spawn(async move {
                    let res = overlay.exists(&path).await;
                    (path, res)
                });
            }

            let mut failed = 0;
            while let Some(joined) = fetches.join_next().await {
                match joined {
                    Ok((path, Ok(true))) => info!(%path, "fetched"),
                    Ok((path, Ok(false))) => {
                        error!(%path, "not found");
                        failed += 1;
                    }
                    Ok((path, Err(e))) => {
                        error!(%path, error = %e, "fetch failed");
                        failed += 1;
                    }
                    Err(e) => {
                        error!(error = %e, "fetch task aborted");
                        failed += 1;
                    }
                }
            }
            if failed > 0 {
                return Err(SessionError::FetchFailed { failed, total });
            }
        }
        Command::Cat { path } => {
            let mut file = overlay.open_for_read(&path).await?;
            let mut stdout = tokio::io::stdout();
            tokio::io::copy(&mut file, &mut stdout).await?;
            stdout.flush().await?;
        }
        Command::Push { path } => {
            overlay.send(&path).await?;
            info!(%path, "pushed");
        }
        Command::Expire => overlay.expire().await,
    }
    Ok(())
}

/// Run `command`, then close the overlay. Ctrl+C interrupts pending fetches.
pub async fn run(config: Config, command: Command) -> Result<(), SessionError> {
    let overlay = open(&config).await?;

    let outcome = select! {
        res = execute(&overlay, command) => res,
        _ = tokio::signal::ctrl_c() => {
            debug!("Received Ctrl+C signal, shutting down...");
            Err(SessionError::Interrupted)
        }
    };

    if let Err(e) = overlay.close().await {
        error!(error = %e, "failed to close the overlay");
    }
    outcome
}

pub fn spawn(config: Config, command: Command) -> Result<(), SessionError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(config, command))
}
