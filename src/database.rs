//! SQLite persistence for packages and archival tasks.

use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, QueryBuilder, Sqlite};
use tracing::debug;

use crate::error::Result;
use crate::swh::{SaveRequestStatus, SaveTask, SaveTaskStatus};
use crate::utils::now_millis;

const SCHEMA: &str = include_str!("schema.sql");

/// Package metadata as found in the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageMetadata {
    pub name: String,
    /// Milliseconds since the epoch.
    pub added: i64,
    pub last_updated: i64,
    /// Empty when the index has no source URL.
    pub source_code: String,
}

/// The minimum the scheduler needs to archive a package.
#[derive(Debug, Clone, PartialEq, Eq, Hash, FromRow)]
pub struct PackageRef {
    pub name: String,
    pub source_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct Package {
    pub name: String,
    pub added: i64,
    pub last_updated: i64,
    pub source_code: String,
    pub last_save_triggered: i64,
    pub last_task_id: Option<i64>,
}

/// One line of the status page.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct StatusRow {
    pub package: String,
    pub source_code: String,
    pub last_save_triggered: i64,
    pub save_request_status: Option<String>,
    pub save_task_status: Option<String>,
    pub snapshot_swhid: Option<String>,
}

#[derive(FromRow)]
struct TaskRow {
    id: i64,
    save_task_status: String,
    save_request_status: String,
    snapshot_swhid: Option<String>,
    request_url: String,
}

impl TryFrom<TaskRow> for SaveTask {
    type Error = sqlx::Error;

    fn try_from(row: TaskRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(SaveTask {
            id: row.id,
            save_task_status: SaveTaskStatus::from(row.save_task_status),
            save_request_status: SaveRequestStatus::from_str(&row.save_request_status)
                .map_err(|e| sqlx::Error::Decode(e.into()))?,
            snapshot_swhid: row.snapshot_swhid,
            request_url: row.request_url,
        })
    }
}

/// Handle on the service database. Cloning shares the pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database file at `path`.
    ///
    /// The pool holds one connection, so every statement is serialized.
    pub async fn connect(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    /// A private in-memory database, mostly for tests.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // The database lives and dies with its only connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Insert or refresh a package's index metadata.
    ///
    /// Archival state (`last_save_triggered`, `last_task_id`) is left alone.
    pub async fn upsert_package(&self, package: &PackageMetadata) -> Result<()> {
        upsert_package_query(package).execute(&self.pool).await?;
        Ok(())
    }

    /// Ingest a whole index in one transaction.
    pub async fn upsert_packages(&self, packages: &[PackageMetadata]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        for package in packages {
            upsert_package_query(package).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        debug!(count = packages.len(), "ingested packages");
        Ok(packages.len())
    }

    /// Packages whose last save is older than `stale_before`, oldest first.
    ///
    /// Packages without a source URL and those named in `exclude` are skipped.
    pub async fn list_due(
        &self,
        limit: u32,
        stale_before: i64,
        exclude: &HashSet<String>,
    ) -> Result<Vec<PackageRef>> {
        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT package AS name, meta_source_code AS source_code FROM apps \
             WHERE meta_source_code != '' AND last_save_triggered < ",
        );
        query.push_bind(stale_before);

        if !exclude.is_empty() {
            query.push(" AND package NOT IN (");
            let mut names = query.separated(", ");
            for name in exclude {
                names.push_bind(name.clone());
            }
            names.push_unseparated(")");
        }

        query.push(" ORDER BY last_save_triggered ASC, package ASC LIMIT ");
        query.push_bind(i64::from(limit));

        Ok(query
            .build_query_as::<PackageRef>()
            .fetch_all(&self.pool)
            .await?)
    }

    /// Record the latest known state of a task.
    pub async fn upsert_task(&self, task: &SaveTask) -> Result<()> {
        sqlx::query(
            "INSERT INTO tasks (id, save_task_status, save_request_status, snapshot_swhid, request_url, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (id) DO UPDATE SET
                save_task_status = excluded.save_task_status,
                save_request_status = excluded.save_request_status,
                snapshot_swhid = excluded.snapshot_swhid,
                request_url = excluded.request_url,
                updated_at = excluded.updated_at",
        )
        .bind(task.id)
        .bind(task.save_task_status.as_str())
        .bind(task.save_request_status.as_str())
        .bind(task.snapshot_swhid.as_deref())
        .bind(&task.request_url)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_last_triggered(&self, package: &str, millis: i64) -> Result<()> {
        sqlx::query("UPDATE apps SET last_save_triggered = ? WHERE package = ?")
            .bind(millis)
            .bind(package)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Point a package at its most recent task. The task must already be stored.
    pub async fn set_current_task(&self, package: &str, task_id: i64) -> Result<()> {
        sqlx::query("UPDATE apps SET last_task_id = ? WHERE package = ?")
            .bind(task_id)
            .bind(package)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_task(&self, id: i64) -> Result<Option<SaveTask>> {
        let row = sqlx::query_as::<_, TaskRow>(
            "SELECT id, save_task_status, save_request_status, snapshot_swhid, request_url
             FROM tasks WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(SaveTask::try_from).transpose()?)
    }

    pub async fn get_package(&self, name: &str) -> Result<Option<Package>> {
        Ok(sqlx::query_as::<_, Package>(
            "SELECT package AS name, meta_added AS added, meta_last_updated AS last_updated,
                    meta_source_code AS source_code, last_save_triggered, last_task_id
             FROM apps WHERE package = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn count_packages(&self) -> Result<i64> {
        Ok(sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM apps")
            .fetch_one(&self.pool)
            .await?)
    }

    /// Packages with their current task, in name order.
    pub async fn list_status(&self, limit: u32, offset: u64) -> Result<Vec<StatusRow>> {
        Ok(sqlx::query_as::<_, StatusRow>(
            "SELECT apps.package, apps.meta_source_code AS source_code, apps.last_save_triggered,
                    tasks.save_request_status, tasks.save_task_status, tasks.snapshot_swhid
             FROM apps
             LEFT JOIN tasks ON tasks.id = apps.last_task_id
             ORDER BY apps.package ASC
             LIMIT ? OFFSET ?",
        )
        .bind(i64::from(limit))
        .bind(i64::try_from(offset).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?)
    }
}

fn upsert_package_query(
    package: &PackageMetadata,
) -> sqlx::query::Query<'_, Sqlite, sqlx::sqlite::SqliteArguments<'_>> {
    sqlx::query(
        "INSERT INTO apps (package, meta_added, meta_last_updated, meta_source_code)
         VALUES (?, ?, ?, ?)
         ON CONFLICT (package) DO UPDATE SET
            meta_added = excluded.meta_added,
            meta_last_updated = excluded.meta_last_updated,
            meta_source_code = excluded.meta_source_code",
    )
    .bind(&package.name)
    .bind(package.added)
    .bind(package.last_updated)
    .bind(&package.source_code)
}
