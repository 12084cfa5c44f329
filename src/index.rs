//! F-Droid index acquisition and ingestion.
//!
//! [`IndexUpdater`] keeps a local copy of the index current and wakes the
//! [`IndexLoader`], which parses the copy and upserts every package.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use reqwest::header::CONTENT_LENGTH;
use reqwest::StatusCode;
use serde_json::Value;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::IndexConfig;
use crate::database::{Database, PackageMetadata};
use crate::error::{Error, Result};
use crate::metrics::MetricsCollector;
use crate::utils::{service_user_agent, sleep_or_cancel, until_cancelled};

/// Whether the remote index differs from the local copy.
///
/// Only sizes are compared. A missing local file or an undeclared remote
/// length both count as a change.
pub fn is_changed(local_size: Option<u64>, remote_size: Option<u64>) -> bool {
    match (local_size, remote_size) {
        (Some(local), Some(remote)) => local != remote,
        _ => true,
    }
}

/// Timestamps may be written as floats, but only whole values in range are accepted.
fn field_i64(metadata: &Value, name: &str) -> Option<i64> {
    let value = metadata.get(name)?;
    if let Some(v) = value.as_i64() {
        return Some(v);
    }
    let v = value.as_f64()?;
    if v.fract() == 0.0 && v >= i64::MIN as f64 && v < i64::MAX as f64 {
        Some(v as i64)
    } else {
        debug!(field = name, value = %value, "timestamp is not a whole number");
        None
    }
}

fn parse_entry(name: &str, entry: &Value) -> Option<PackageMetadata> {
    let metadata = entry.get("metadata")?;
    Some(PackageMetadata {
        name: name.to_string(),
        added: field_i64(metadata, "added")?,
        last_updated: field_i64(metadata, "lastUpdated")?,
        source_code: metadata
            .get("sourceCode")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}

/// Flatten an index-v2 document into per-package records, sorted by name.
///
/// Entries without `metadata.added` or `metadata.lastUpdated` are skipped.
pub fn parse_index(data: &[u8]) -> Result<Vec<PackageMetadata>> {
    let document: Value = serde_json::from_slice(data)?;
    let packages = document
        .get("packages")
        .and_then(Value::as_object)
        .ok_or_else(|| Error::index("packages field missing"))?;

    let mut parsed = Vec::with_capacity(packages.len());
    for (name, entry) in packages {
        match parse_entry(name, entry) {
            Some(package) => parsed.push(package),
            None => warn!(package = %name, "skipping malformed index entry"),
        }
    }
    parsed.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(parsed)
}

/// Read and parse a local index file.
pub async fn read_index(path: &Path) -> Result<Vec<PackageMetadata>> {
    let data = tokio::fs::read(path).await?;
    parse_index(&data)
}

/// The distinct, non-empty source URLs of `packages`, sorted.
pub fn source_urls(packages: &[PackageMetadata]) -> Vec<String> {
    packages
        .iter()
        .map(|p| p.source_code.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

async fn local_size(path: &Path) -> Result<Option<u64>> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(Some(meta.len())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Replace `path` with `data` without ever exposing a partial file.
async fn write_atomically(path: PathBuf, data: Vec<u8>) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut file = tempfile::NamedTempFile::new_in(&dir)?;
        file.write_all(&data)?;
        file.as_file().sync_all()?;
        file.persist(&path).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(|e| Error::index(format!("index writer failed: {}", e)))?
}

/// Periodically refreshes the local index file.
#[derive(Debug, Clone)]
pub struct IndexUpdater {
    client: reqwest::Client,
    config: IndexConfig,
    notify: Arc<Notify>,
}

impl IndexUpdater {
    pub fn new(client: reqwest::Client, config: IndexConfig, notify: Arc<Notify>) -> Self {
        Self {
            client,
            config,
            notify,
        }
    }

    /// Compare the remote size with the local copy.
    pub async fn check_for_update(&self) -> Result<bool> {
        let Some(local) = local_size(&self.config.path).await? else {
            return Ok(true);
        };

        let response = self
            .client
            .head(self.config.url.clone())
            .header(reqwest::header::USER_AGENT, service_user_agent("index"))
            .timeout(self.config.head_timeout)
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(Error::index(format!(
                "index HEAD returned {}",
                response.status()
            )));
        }

        let remote = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        debug!(local, remote = ?remote, "index sizes");
        Ok(is_changed(Some(local), remote))
    }

    /// Fetch the index and replace the local copy. Returns the size written.
    pub async fn download(&self) -> Result<usize> {
        let response = self
            .client
            .get(self.config.url.clone())
            .header(reqwest::header::USER_AGENT, service_user_agent("index"))
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(Error::index(format!(
                "index GET returned {}",
                response.status()
            )));
        }
        let data = response.bytes().await?.to_vec();
        let len = data.len();
        write_atomically(self.config.path.clone(), data).await?;
        info!(bytes = len, path = %self.config.path.display(), "index saved");
        Ok(len)
    }

    /// Download the index if it changed and wake the loader.
    pub async fn refresh(&self) -> Result<bool> {
        if !self.check_for_update().await? {
            MetricsCollector::record_index_check("unchanged");
            return Ok(false);
        }
        self.download().await?;
        MetricsCollector::record_index_check("downloaded");
        self.notify.notify_one();
        Ok(true)
    }

    pub async fn run(&self, cancel: CancellationToken) {
        info!(url = %self.config.url, "index updater started");
        loop {
            match until_cancelled(&cancel, self.refresh()).await {
                Err(_) => break,
                Ok(Ok(true)) => info!("index updated"),
                Ok(Ok(false)) => debug!("index unchanged"),
                Ok(Err(e)) => {
                    MetricsCollector::record_index_check("error");
                    error!(err = %e, "index refresh failed");
                }
            }
            if sleep_or_cancel(&cancel, self.config.check_interval).await.is_err() {
                break;
            }
        }
        info!("index updater stopped");
    }
}

/// Ingests the local index file into the database.
#[derive(Debug, Clone)]
pub struct IndexLoader {
    db: Database,
    path: PathBuf,
    notify: Arc<Notify>,
}

impl IndexLoader {
    pub fn new(db: Database, path: PathBuf, notify: Arc<Notify>) -> Self {
        Self { db, path, notify }
    }

    pub async fn load(&self) -> Result<usize> {
        let packages = read_index(&self.path).await?;
        info!(packages = packages.len(), "loading index into database");
        let count = self.db.upsert_packages(&packages).await?;
        MetricsCollector::record_index_load(count);
        Ok(count)
    }

    /// Load the existing file, then reload on every notification.
    pub async fn run(&self, cancel: CancellationToken) {
        info!("index loader started");
        if tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            self.load_logged().await;
        }
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.notify.notified() => self.load_logged().await,
            }
        }
        info!("index loader stopped");
    }

    async fn load_logged(&self) {
        if let Err(e) = self.load().await {
            error!(err = %e, path = %self.path.display(), "index load failed");
        }
    }
}
