//! Selection and scheduling of packages for archival.
//!
//! Each cycle picks the packages whose last save is oldest, validates their
//! source URL, and hands them to the [`TaskTracker`] with bounded
//! concurrency. A cycle finishes only when all of its packages have.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::database::{Database, PackageRef};
use crate::error::Result;
use crate::metrics::MetricsCollector;
use crate::swh::SaveTaskStatus;
use crate::tracker::{TaskTracker, TrackError};
use crate::utils::{now_millis, sleep_or_cancel};
use crate::vcs::GitValidator;

#[derive(Debug, Clone)]
pub struct SchedulePolicy {
    pub batch_size: u32,
    pub concurrency: usize,
    /// A package is due again once its last save is older than this.
    pub resave_after: Duration,
    /// Wait after a cycle that found nothing to do.
    pub idle_interval: Duration,
    /// Wait after a cycle that failed to query the database.
    pub error_backoff: Duration,
}

impl Default for SchedulePolicy {
    fn default() -> Self {
        Self {
            batch_size: 100,
            concurrency: 10,
            resave_after: Duration::from_secs(30 * 24 * 3600),
            idle_interval: Duration::from_secs(60),
            error_backoff: Duration::from_secs(10),
        }
    }
}

/// Names of packages currently being worked on.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    names: Arc<Mutex<HashSet<String>>>,
}

impl InFlight {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        // The set stays consistent even if a holder panicked.
        self.names.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim `name`; `None` if it is already claimed.
    pub fn try_claim(&self, name: &str) -> Option<InFlightGuard> {
        let mut names = self.lock();
        if !names.insert(name.to_string()) {
            return None;
        }
        MetricsCollector::set_in_flight(names.len());
        Some(InFlightGuard {
            registry: self.clone(),
            name: name.to_string(),
        })
    }

    pub fn snapshot(&self) -> HashSet<String> {
        self.lock().clone()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains(name)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Releases its package from the [`InFlight`] registry on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    registry: InFlight,
    name: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut names = self.registry.lock();
        names.remove(&self.name);
        MetricsCollector::set_in_flight(names.len());
    }
}

/// How processing a single package ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackageOutcome {
    /// The archive saved a snapshot.
    Succeeded,
    /// The archive ran the task and it failed.
    Failed,
    Rejected,
    /// The source URL is not a usable git remote.
    Invalid,
    /// Submission or storage failed.
    Error,
    Cancelled,
}

impl PackageOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageOutcome::Succeeded => "succeeded",
            PackageOutcome::Failed => "failed",
            PackageOutcome::Rejected => "rejected",
            PackageOutcome::Invalid => "invalid",
            PackageOutcome::Error => "error",
            PackageOutcome::Cancelled => "cancelled",
        }
    }

    /// Whether the package's last-triggered time moves forward.
    pub fn records_trigger(&self) -> bool {
        !matches!(self, PackageOutcome::Cancelled)
    }
}

impl std::fmt::Display for PackageOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub selected: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub rejected: usize,
    pub invalid: usize,
    pub errors: usize,
    pub cancelled: usize,
}

impl BatchSummary {
    fn record(&mut self, outcome: PackageOutcome) {
        let counter = match outcome {
            PackageOutcome::Succeeded => &mut self.succeeded,
            PackageOutcome::Failed => &mut self.failed,
            PackageOutcome::Rejected => &mut self.rejected,
            PackageOutcome::Invalid => &mut self.invalid,
            PackageOutcome::Error => &mut self.errors,
            PackageOutcome::Cancelled => &mut self.cancelled,
        };
        *counter += 1;
    }

    pub fn processed(&self) -> usize {
        self.succeeded + self.failed + self.rejected + self.invalid + self.errors + self.cancelled
    }
}

#[derive(Clone)]
pub struct Scheduler {
    db: Database,
    validator: GitValidator,
    tracker: TaskTracker,
    policy: SchedulePolicy,
    in_flight: InFlight,
}

impl Scheduler {
    pub fn new(
        db: Database,
        validator: GitValidator,
        tracker: TaskTracker,
        policy: SchedulePolicy,
    ) -> Self {
        Self {
            db,
            validator,
            tracker,
            policy,
            in_flight: InFlight::default(),
        }
    }

    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    /// Run cycles until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            batch_size = self.policy.batch_size,
            concurrency = self.policy.concurrency,
            "scheduler started"
        );
        while !cancel.is_cancelled() {
            let wait = match self.run_batch(&cancel).await {
                Ok(summary) if summary.selected == 0 => Some(self.policy.idle_interval),
                Ok(summary) => {
                    info!(
                        selected = summary.selected,
                        succeeded = summary.succeeded,
                        failed = summary.failed,
                        rejected = summary.rejected,
                        invalid = summary.invalid,
                        errors = summary.errors,
                        "batch finished"
                    );
                    None
                }
                Err(e) => {
                    error!(err = %e, "failed to select packages");
                    Some(self.policy.error_backoff)
                }
            };
            if let Some(wait) = wait {
                if sleep_or_cancel(&cancel, wait).await.is_err() {
                    break;
                }
            }
        }
        info!("scheduler stopped");
    }

    /// Select one batch of due packages and process all of them.
    pub async fn run_batch(&self, cancel: &CancellationToken) -> Result<BatchSummary> {
        let resave_after = i64::try_from(self.policy.resave_after.as_millis()).unwrap_or(i64::MAX);
        let stale_before = now_millis().saturating_sub(resave_after);
        let packages = self
            .db
            .list_due(self.policy.batch_size, stale_before, &self.in_flight.snapshot())
            .await?;

        let mut summary = BatchSummary {
            selected: packages.len(),
            ..Default::default()
        };
        if packages.is_empty() {
            debug!("no packages due");
            return Ok(summary);
        }
        MetricsCollector::record_batch();

        let permits = Arc::new(Semaphore::new(self.policy.concurrency));
        let mut tasks = JoinSet::new();
        for package in packages {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            // Claimed only once a slot is held, so queued packages are not in flight.
            let Some(guard) = self.in_flight.try_claim(&package.name) else {
                continue;
            };
            let scheduler = self.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let outcome = scheduler.process_package(&package, &cancel).await;
                drop(permit);
                drop(guard);
                outcome
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => summary.record(outcome),
                Err(e) => {
                    error!(err = %e, "package task panicked");
                    summary.record(PackageOutcome::Error);
                }
            }
        }
        Ok(summary)
    }

    /// Validate, submit and track one package, then record the trigger time.
    pub async fn process_package(
        &self,
        package: &PackageRef,
        cancel: &CancellationToken,
    ) -> PackageOutcome {
        let outcome = match self.validator.validate(&package.source_code, cancel).await {
            Err(e) if e.is_cancelled() => PackageOutcome::Cancelled,
            Err(e) => {
                warn!(package = %package.name, source = %package.source_code, err = %e, "invalid source");
                PackageOutcome::Invalid
            }
            Ok(()) => match self.tracker.run(package, cancel).await {
                Ok(task) if task.save_task_status == SaveTaskStatus::Succeeded => {
                    PackageOutcome::Succeeded
                }
                Ok(_) => PackageOutcome::Failed,
                Err(TrackError::Rejected(id)) => {
                    warn!(package = %package.name, task_id = id, "save request rejected");
                    PackageOutcome::Rejected
                }
                Err(TrackError::Cancelled) => PackageOutcome::Cancelled,
                Err(e) => {
                    error!(package = %package.name, err = %e, "archival failed");
                    PackageOutcome::Error
                }
            },
        };

        if outcome.records_trigger() {
            if let Err(e) = self.db.set_last_triggered(&package.name, now_millis()).await {
                error!(package = %package.name, err = %e, "failed to record save trigger");
            }
        }
        MetricsCollector::record_package_outcome(outcome.as_str());
        debug!(package = %package.name, %outcome, "package processed");
        outcome
    }
}
