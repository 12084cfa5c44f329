//! Drives one package's save request from submission to a terminal state.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::database::{Database, PackageRef};
use crate::swh::{Archiver, SaveTask, SwhError};
use crate::utils::{sleep_or_cancel, until_cancelled};

#[derive(Debug, Clone)]
pub struct TrackerPolicy {
    /// Submission attempts that did not hit the rate limit.
    pub max_submit_attempts: u32,
    pub rate_limit_backoff: Duration,
    pub submit_retry_delay: Duration,
    pub poll_interval: Duration,
    pub poll_rate_limit_backoff: Duration,
    pub poll_error_backoff: Duration,
}

impl Default for TrackerPolicy {
    fn default() -> Self {
        Self {
            max_submit_attempts: 3,
            rate_limit_backoff: Duration::from_secs(300),
            submit_retry_delay: Duration::from_secs(10),
            poll_interval: Duration::from_secs(10),
            poll_rate_limit_backoff: Duration::from_secs(60),
            poll_error_backoff: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Error)]
pub enum TrackError {
    #[error("submission failed after {attempts} attempts: {source}")]
    Submit {
        attempts: u32,
        #[source]
        source: SwhError,
    },

    #[error("save request {0} was rejected")]
    Rejected(i64),

    #[error("storage error: {0}")]
    Storage(#[from] crate::error::Error),

    #[error("tracking cancelled")]
    Cancelled,
}

impl From<crate::utils::Cancelled> for TrackError {
    fn from(_: crate::utils::Cancelled) -> Self {
        TrackError::Cancelled
    }
}

#[derive(Clone)]
pub struct TaskTracker {
    archiver: Arc<dyn Archiver>,
    db: Database,
    policy: TrackerPolicy,
}

impl TaskTracker {
    pub fn new(archiver: Arc<dyn Archiver>, db: Database, policy: TrackerPolicy) -> Self {
        Self {
            archiver,
            db,
            policy,
        }
    }

    /// Submit `package` for archival and follow the task until it finishes.
    ///
    /// The task is stored and linked to the package as soon as the archive
    /// hands out an id, and re-stored after every successful poll.
    pub async fn run(
        &self,
        package: &PackageRef,
        cancel: &CancellationToken,
    ) -> Result<SaveTask, TrackError> {
        let mut task = self.submit(package, cancel).await?;
        self.db.upsert_task(&task).await?;
        self.db.set_current_task(&package.name, task.id).await?;
        info!(
            package = %package.name,
            task_id = task.id,
            request_status = %task.save_request_status,
            task_status = %task.save_task_status,
            "save request created"
        );

        if task.is_rejected() {
            return Err(TrackError::Rejected(task.id));
        }

        while !task.is_terminal() {
            sleep_or_cancel(cancel, self.policy.poll_interval).await?;
            match until_cancelled(cancel, self.archiver.fetch_status(&task.request_url)).await? {
                Ok(latest) => {
                    if latest.save_task_status != task.save_task_status {
                        debug!(
                            package = %package.name,
                            task_id = latest.id,
                            task_status = %latest.save_task_status,
                            "task status changed"
                        );
                    }
                    self.db.upsert_task(&latest).await?;
                    task = latest;
                }
                Err(e) if e.is_rate_limited() => {
                    warn!(package = %package.name, task_id = task.id, "rate limited while polling");
                    sleep_or_cancel(cancel, self.policy.poll_rate_limit_backoff).await?;
                }
                Err(e) => {
                    warn!(package = %package.name, task_id = task.id, err = %e, "polling failed");
                    sleep_or_cancel(cancel, self.policy.poll_error_backoff).await?;
                }
            }
        }

        info!(
            package = %package.name,
            task_id = task.id,
            task_status = %task.save_task_status,
            snapshot = task.snapshot_swhid.as_deref().unwrap_or(""),
            "task finished"
        );
        Ok(task)
    }

    /// Rate-limited attempts wait and do not count against the budget.
    async fn submit(
        &self,
        package: &PackageRef,
        cancel: &CancellationToken,
    ) -> Result<SaveTask, TrackError> {
        let mut attempts = 0;
        loop {
            match until_cancelled(cancel, self.archiver.submit(&package.source_code)).await? {
                Ok(task) => return Ok(task),
                Err(e) if e.is_rate_limited() => {
                    warn!(package = %package.name, "rate limited, backing off");
                    sleep_or_cancel(cancel, self.policy.rate_limit_backoff).await?;
                }
                Err(e) => {
                    attempts += 1;
                    if attempts >= self.policy.max_submit_attempts {
                        return Err(TrackError::Submit {
                            attempts,
                            source: e,
                        });
                    }
                    warn!(package = %package.name, attempt = attempts, err = %e, "submission failed, retrying");
                    sleep_or_cancel(cancel, self.policy.submit_retry_delay).await?;
                }
            }
        }
    }
}
