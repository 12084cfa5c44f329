//! Configuration for the fdroid-swh service.
//!
//! Settings come from command-line flags with environment fallbacks (a `.env`
//! file is loaded first by the binary). Retry and backoff durations are kept in
//! the per-component policy structs so they can be tuned independently.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::error::{Error, Result};
use crate::schedule::SchedulePolicy;
use crate::tracker::TrackerPolicy;
use crate::vcs::ValidationPolicy;

pub const DEFAULT_SWH_API_URL: &str = "https://archive.softwareheritage.org/api/1/";
pub const DEFAULT_INDEX_URL: &str = "https://f-droid.org/repo/index-v2.json";

#[derive(clap::Args, Debug, Clone)]
#[group()]
pub struct ConfigArgs {
    /// Bearer token for the Software Heritage API.
    #[arg(long, env = "SWH_TOKEN", hide_env_values = true)]
    pub swh_token: Option<String>,

    /// Base URL of the Software Heritage API.
    #[arg(long, env = "SWH_API_URL", default_value = DEFAULT_SWH_API_URL)]
    pub swh_api_url: String,

    /// Location of the F-Droid index.
    #[arg(long, env = "INDEX_URL", default_value = DEFAULT_INDEX_URL)]
    pub index_url: String,

    /// Local cache of the F-Droid index.
    #[arg(long, env = "INDEX_PATH", default_value = "index-v2.json")]
    pub index_path: PathBuf,

    /// SQLite database file.
    #[arg(long = "database", env = "DATABASE_PATH", default_value = "db.sqlite")]
    pub database_path: PathBuf,

    /// Address for the status page.
    #[arg(long, env = "BIND", default_value = "0.0.0.0:8080")]
    pub bind: String,

    /// Maximum number of packages selected per scheduling cycle.
    #[arg(long, env = "BATCH_SIZE", default_value_t = 100)]
    pub batch_size: u32,

    /// Maximum number of packages processed concurrently.
    #[arg(long, env = "CONCURRENCY", default_value_t = 10)]
    pub concurrency: usize,

    /// Seconds after a save was triggered before a package is archived again.
    #[arg(long, env = "RESAVE_AFTER_SECS", default_value_t = 30 * 24 * 3600)]
    pub resave_after_secs: u64,

    /// Seconds between checks of the remote index.
    #[arg(long, env = "INDEX_CHECK_INTERVAL_SECS", default_value_t = 3600)]
    pub index_check_interval_secs: u64,

    /// Seconds to wait for in-flight work on shutdown.
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 30)]
    pub shutdown_timeout_secs: u64,

    /// Rows per page on the status page.
    #[arg(long, env = "PAGE_SIZE", default_value_t = 10000)]
    pub page_size: u32,
}

/// Archival service settings
#[derive(Debug, Clone)]
pub struct SwhConfig {
    /// API base, always ending in `/`
    pub api_url: Url,
    pub token: String,
    /// Timeout for a single API request
    pub request_timeout: Duration,
}

/// Index source settings
#[derive(Debug, Clone)]
pub struct IndexConfig {
    pub url: Url,
    pub path: PathBuf,
    pub check_interval: Duration,
    /// Timeout for the change-detection probe
    pub head_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub swh: SwhConfig,
    pub index: IndexConfig,
    pub database_path: PathBuf,
    pub bind: SocketAddr,
    pub page_size: u32,
    pub shutdown_timeout: Duration,
    pub schedule: SchedulePolicy,
    pub tracker: TrackerPolicy,
    pub validation: ValidationPolicy,
}

fn with_trailing_slash(url: &str) -> String {
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{}/", url)
    }
}

impl ConfigArgs {
    /// The archival-service token; an absent or blank token is a startup error.
    pub fn require_token(&self) -> Result<String> {
        match self.swh_token.as_deref().map(str::trim) {
            Some(token) if !token.is_empty() => Ok(token.to_string()),
            _ => Err(Error::config("SWH_TOKEN is empty")),
        }
    }

    pub fn index_config(&self) -> Result<IndexConfig> {
        Ok(IndexConfig {
            url: Url::parse(&self.index_url)?,
            path: self.index_path.clone(),
            check_interval: Duration::from_secs(self.index_check_interval_secs),
            head_timeout: Duration::from_secs(10),
        })
    }

    /// Build the full service configuration.
    pub fn into_config(self) -> Result<Config> {
        let token = self.require_token()?;
        let index = self.index_config()?;
        let api_url = Url::parse(&with_trailing_slash(&self.swh_api_url))?;
        let bind: SocketAddr = self
            .bind
            .parse()
            .map_err(|e| Error::config(format!("Invalid bind address {}: {}", self.bind, e)))?;
        if self.concurrency == 0 {
            return Err(Error::config("concurrency must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(Error::config("batch size must be at least 1"));
        }

        Ok(Config {
            swh: SwhConfig {
                api_url,
                token,
                request_timeout: Duration::from_secs(15),
            },
            index,
            database_path: self.database_path,
            bind,
            page_size: self.page_size.max(1),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
            schedule: SchedulePolicy {
                batch_size: self.batch_size,
                concurrency: self.concurrency,
                resave_after: Duration::from_secs(self.resave_after_secs),
                ..Default::default()
            },
            tracker: TrackerPolicy::default(),
            validation: ValidationPolicy::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        config: ConfigArgs,
    }

    fn parse(args: &[&str]) -> ConfigArgs {
        let mut argv = vec!["fdroid-swh"];
        argv.extend_from_slice(args);
        TestCli::parse_from(argv).config
    }

    #[test]
    fn test_defaults() {
        let config = parse(&["--swh-token", "secret"]).into_config().unwrap();
        assert_eq!(config.swh.token, "secret");
        assert_eq!(config.swh.api_url.as_str(), DEFAULT_SWH_API_URL);
        assert_eq!(config.index.url.as_str(), DEFAULT_INDEX_URL);
        assert_eq!(config.schedule.batch_size, 100);
        assert_eq!(config.schedule.concurrency, 10);
        assert_eq!(config.bind.port(), 8080);
        assert_eq!(config.page_size, 10000);
    }

    #[test]
    fn test_blank_token_refused() {
        let err = parse(&["--swh-token", "  "]).into_config().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_api_url_gets_trailing_slash() {
        let config = parse(&["--swh-token", "t", "--swh-api-url", "http://localhost:5080/api/1"])
            .into_config()
            .unwrap();
        assert_eq!(config.swh.api_url.as_str(), "http://localhost:5080/api/1/");
    }

    #[test]
    fn test_invalid_bind() {
        let err = parse(&["--swh-token", "t", "--bind", "nonsense"])
            .into_config()
            .unwrap_err();
        assert!(err.to_string().contains("Invalid bind address"));
    }

    #[test]
    fn test_zero_concurrency_refused() {
        assert!(parse(&["--swh-token", "t", "--concurrency", "0"])
            .into_config()
            .is_err());
    }
}
