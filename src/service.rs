//! Service orchestration: the long-running loops and their shutdown.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::database::Database;
use crate::error::{Error, Result};
use crate::index::{IndexLoader, IndexUpdater};
use crate::schedule::Scheduler;
use crate::swh::SwhClient;
use crate::tracker::TaskTracker;
use crate::utils::default_user_agent;
use crate::vcs::GitValidator;
use crate::web::{self, AppState};

/// Shared HTTP client for the index, the validator and the archive.
pub fn http_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .user_agent(default_user_agent())
        .build()?)
}

/// Cancel `cancel` on SIGINT or SIGTERM.
pub fn install_signal_handlers(cancel: CancellationToken) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
                _ = sigint.recv() => info!("Received SIGINT, initiating graceful shutdown"),
            }
            cancel.cancel();
        });
    }
    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received interrupt, initiating graceful shutdown");
            }
            cancel.cancel();
        });
    }
    Ok(())
}

/// A started service: storage open and listener bound, loops not yet running.
pub struct Service {
    config: Config,
    db: Database,
    listener: TcpListener,
    cancel: CancellationToken,
}

impl Service {
    /// Open the database and bind the status listener.
    pub async fn start(config: Config) -> Result<Self> {
        let db = Database::connect(&config.database_path).await?;
        info!(path = %config.database_path.display(), "database ready");
        let listener = TcpListener::bind(config.bind).await?;
        Ok(Self {
            config,
            db,
            listener,
            cancel: CancellationToken::new(),
        })
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run every loop until cancellation, then drain within the shutdown timeout.
    ///
    /// A loop that exits on its own cancels the others and the service
    /// reports an error.
    pub async fn run(self) -> Result<()> {
        let Service {
            config,
            db,
            listener,
            cancel,
        } = self;
        let client = http_client()?;
        let notify = Arc::new(Notify::new());

        let updater = IndexUpdater::new(client.clone(), config.index.clone(), notify.clone());
        let loader = IndexLoader::new(db.clone(), config.index.path.clone(), notify);
        let archiver = Arc::new(SwhClient::new(client.clone(), config.swh.clone()));
        let tracker = TaskTracker::new(archiver, db.clone(), config.tracker.clone());
        let validator = GitValidator::new(client, config.validation.clone());
        let scheduler = Scheduler::new(db.clone(), validator, tracker, config.schedule.clone());
        let state = AppState::new(db.clone(), config.page_size);

        let mut loops: JoinSet<(&'static str, Result<()>)> = JoinSet::new();
        {
            let cancel = cancel.clone();
            loops.spawn(async move {
                updater.run(cancel).await;
                ("index updater", Ok(()))
            });
        }
        {
            let cancel = cancel.clone();
            loops.spawn(async move {
                loader.run(cancel).await;
                ("index loader", Ok(()))
            });
        }
        {
            let cancel = cancel.clone();
            loops.spawn(async move {
                scheduler.run(cancel).await;
                ("scheduler", Ok(()))
            });
        }
        {
            let cancel = cancel.clone();
            loops.spawn(async move { ("status server", web::serve(listener, state, cancel).await) });
        }
        info!("service running");

        let mut failure = None;
        tokio::select! {
            _ = cancel.cancelled() => {}
            Some(joined) = loops.join_next() => {
                let name = match joined {
                    Ok((name, Ok(()))) => name,
                    Ok((name, Err(e))) => {
                        error!(task = name, err = %e, "task failed");
                        name
                    }
                    Err(e) => {
                        error!(err = %e, "task panicked");
                        "unknown"
                    }
                };
                failure = Some(Error::Service(format!("{} stopped unexpectedly", name)));
                cancel.cancel();
            }
        }

        info!(timeout = ?config.shutdown_timeout, "shutting down");
        let drain = async {
            while let Some(joined) = loops.join_next().await {
                match joined {
                    Ok((name, Ok(()))) => info!(task = name, "task stopped"),
                    Ok((name, Err(e))) => warn!(task = name, err = %e, "task stopped with error"),
                    Err(e) => warn!(err = %e, "task panicked during shutdown"),
                }
            }
        };
        if tokio::time::timeout(config.shutdown_timeout, drain).await.is_err() {
            warn!("shutdown timeout reached, aborting remaining tasks");
            loops.abort_all();
            while loops.join_next().await.is_some() {}
        }

        db.close().await;
        info!("service stopped");
        failure.map_or(Ok(()), Err)
    }
}

/// Start the service, install signal handlers and run until interrupted.
pub async fn run_service(config: Config) -> Result<()> {
    let service = Service::start(config).await?;
    install_signal_handlers(service.cancel_token())?;
    service.run().await
}
