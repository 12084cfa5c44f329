//! Software Heritage "save code now" client.
//!
//! Two calls are used: creating a save request for a git origin, and reading
//! back a request's status from the `request_url` the archive hands out.

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::header::{HeaderMap, USER_AGENT};
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::config::SwhConfig;
use crate::metrics::MetricsCollector;
use crate::utils::service_user_agent;

/// Characters escaped when a source URL is embedded in the save endpoint path.
/// `:` and `/` stay literal, the API expects the origin URL verbatim.
const ORIGIN_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Lifecycle of the archival job itself.
///
/// Statuses this client does not know about are kept verbatim in `Other`
/// and treated as still in progress.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SaveTaskStatus {
    NotCreated,
    Pending,
    Scheduled,
    Running,
    Succeeded,
    Failed,
    Other(String),
}

impl SaveTaskStatus {
    pub fn as_str(&self) -> &str {
        match self {
            SaveTaskStatus::NotCreated => "not created",
            SaveTaskStatus::Pending => "pending",
            SaveTaskStatus::Scheduled => "scheduled",
            SaveTaskStatus::Running => "running",
            SaveTaskStatus::Succeeded => "succeeded",
            SaveTaskStatus::Failed => "failed",
            SaveTaskStatus::Other(status) => status,
        }
    }

    /// No further polling happens once a task is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SaveTaskStatus::Succeeded | SaveTaskStatus::Failed)
    }
}

impl std::fmt::Display for SaveTaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for SaveTaskStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "not created" => SaveTaskStatus::NotCreated,
            "pending" => SaveTaskStatus::Pending,
            "scheduled" => SaveTaskStatus::Scheduled,
            "running" => SaveTaskStatus::Running,
            "succeeded" => SaveTaskStatus::Succeeded,
            "failed" => SaveTaskStatus::Failed,
            _ => SaveTaskStatus::Other(s),
        }
    }
}

impl From<SaveTaskStatus> for String {
    fn from(status: SaveTaskStatus) -> Self {
        match status {
            SaveTaskStatus::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl std::str::FromStr for SaveTaskStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(SaveTaskStatus::from(s.to_string()))
    }
}

/// Whether the archive accepted the save request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveRequestStatus {
    Accepted,
    Rejected,
    Pending,
}

impl SaveRequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaveRequestStatus::Accepted => "accepted",
            SaveRequestStatus::Rejected => "rejected",
            SaveRequestStatus::Pending => "pending",
        }
    }
}

impl std::fmt::Display for SaveRequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SaveRequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "accepted" => Ok(SaveRequestStatus::Accepted),
            "rejected" => Ok(SaveRequestStatus::Rejected),
            "pending" => Ok(SaveRequestStatus::Pending),
            _ => Err(format!("Unknown save request status: {}", s)),
        }
    }
}

/// A save request as reported by the archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveTask {
    pub id: i64,
    pub save_task_status: SaveTaskStatus,
    pub save_request_status: SaveRequestStatus,
    /// Only present once the snapshot exists.
    #[serde(default)]
    pub snapshot_swhid: Option<String>,
    /// Where to poll for updates of this request.
    pub request_url: String,
}

impl SaveTask {
    pub fn is_terminal(&self) -> bool {
        self.save_task_status.is_terminal()
    }

    pub fn is_rejected(&self) -> bool {
        self.save_request_status == SaveRequestStatus::Rejected
    }
}

/// Server-provided rate limit hints, logged for operators.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub remaining: Option<u64>,
    /// Unix time at which the window resets.
    pub reset: Option<i64>,
}

impl RateLimitInfo {
    fn from_headers(headers: &HeaderMap) -> Self {
        fn parse<T: std::str::FromStr>(headers: &HeaderMap, name: &str) -> Option<T> {
            headers.get(name)?.to_str().ok()?.trim().parse().ok()
        }
        Self {
            remaining: parse(headers, "x-ratelimit-remaining"),
            reset: parse(headers, "x-ratelimit-reset"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SwhError {
    /// HTTP 429. Never fatal: callers wait and retry.
    #[error("rate limited by the archive")]
    RateLimited(RateLimitInfo),

    #[error("save request failed with HTTP {0}")]
    SubmissionFailed(StatusCode),

    #[error("status request failed with HTTP {0}")]
    StatusFetchFailed(StatusCode),

    #[error("malformed response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl SwhError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, SwhError::RateLimited(_))
    }
}

/// The archival operations the tracker needs.
#[async_trait]
pub trait Archiver: Send + Sync {
    /// Ask the archive to save a git origin.
    async fn submit(&self, source: &str) -> Result<SaveTask, SwhError>;

    /// Read the current state of a save request.
    async fn fetch_status(&self, request_url: &str) -> Result<SaveTask, SwhError>;
}

/// HTTP implementation of [`Archiver`].
#[derive(Debug, Clone)]
pub struct SwhClient {
    client: reqwest::Client,
    config: SwhConfig,
}

impl SwhClient {
    pub fn new(client: reqwest::Client, config: SwhConfig) -> Self {
        Self { client, config }
    }

    /// The save endpoint for `source`; the origin always ends in `/`.
    pub fn save_url(&self, source: &str) -> Result<Url, SwhError> {
        let origin = if source.ends_with('/') {
            source.to_string()
        } else {
            format!("{}/", source)
        };
        let encoded = utf8_percent_encode(&origin, ORIGIN_ENCODE_SET);
        Ok(Url::parse(&format!(
            "{}origin/save/git/url/{}",
            self.config.api_url, encoded
        ))?)
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .bearer_auth(&self.config.token)
            .header(USER_AGENT, service_user_agent("git"))
            .timeout(self.config.request_timeout)
    }

    async fn decode(response: Response) -> Result<SaveTask, SwhError> {
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

fn record<T>(operation: &str, result: &Result<T, SwhError>) {
    let label = match result {
        Ok(_) => "ok",
        Err(e) if e.is_rate_limited() => "rate_limited",
        Err(_) => "error",
    };
    MetricsCollector::record_swh_request(operation, label);
}

#[async_trait]
impl Archiver for SwhClient {
    async fn submit(&self, source: &str) -> Result<SaveTask, SwhError> {
        let result = self.submit_request(source).await;
        record("submit", &result);
        result
    }

    async fn fetch_status(&self, request_url: &str) -> Result<SaveTask, SwhError> {
        let result = self.status_request(request_url).await;
        record("status", &result);
        result
    }
}

impl SwhClient {
    async fn submit_request(&self, source: &str) -> Result<SaveTask, SwhError> {
        let url = self.save_url(source)?;
        let response = self.authorize(self.client.post(url)).send().await?;

        let limits = RateLimitInfo::from_headers(response.headers());
        info!(
            source,
            remaining = ?limits.remaining,
            reset = ?limits.reset,
            status = %response.status(),
            "save request sent"
        );

        match response.status() {
            StatusCode::TOO_MANY_REQUESTS => Err(SwhError::RateLimited(limits)),
            StatusCode::OK => Self::decode(response).await,
            status => Err(SwhError::SubmissionFailed(status)),
        }
    }

    async fn status_request(&self, request_url: &str) -> Result<SaveTask, SwhError> {
        let url = Url::parse(request_url)?;
        let response = self.authorize(self.client.get(url)).send().await?;

        let limits = RateLimitInfo::from_headers(response.headers());
        debug!(
            request_url,
            remaining = ?limits.remaining,
            reset = ?limits.reset,
            status = %response.status(),
            "status request sent"
        );

        match response.status() {
            StatusCode::TOO_MANY_REQUESTS => Err(SwhError::RateLimited(limits)),
            StatusCode::OK => Self::decode(response).await,
            status => Err(SwhError::StatusFetchFailed(status)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{bearer_token, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(base: &str) -> SwhClient {
        SwhClient::new(
            reqwest::Client::new(),
            SwhConfig {
                api_url: Url::parse(&format!("{}/api/1/", base)).unwrap(),
                token: "sekrit".to_string(),
                request_timeout: Duration::from_secs(5),
            },
        )
    }

    fn task_json(id: i64, task_status: &str, request_status: &str) -> serde_json::Value {
        json!({
            "id": id,
            "save_task_status": task_status,
            "save_request_status": request_status,
            "snapshot_swhid": null,
            "request_url": format!("https://archive.example/api/1/origin/save/{}/", id),
            "origin_url": "https://example.org/r.git/",
            "visit_type": "git",
        })
    }

    #[test]
    fn test_status_round_trip_strings() {
        for status in [
            SaveTaskStatus::NotCreated,
            SaveTaskStatus::Pending,
            SaveTaskStatus::Scheduled,
            SaveTaskStatus::Running,
            SaveTaskStatus::Succeeded,
            SaveTaskStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<SaveTaskStatus>().unwrap(), status);
        }
        let other = "not yet scheduled".parse::<SaveTaskStatus>().unwrap();
        assert_eq!(other, SaveTaskStatus::Other("not yet scheduled".to_string()));
        assert_eq!(other.as_str(), "not yet scheduled");
        assert!(!other.is_terminal());
        assert!("exploded".parse::<SaveRequestStatus>().is_err());
        assert_eq!("rejected".parse::<SaveRequestStatus>().unwrap(), SaveRequestStatus::Rejected);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(SaveTaskStatus::Succeeded.is_terminal());
        assert!(SaveTaskStatus::Failed.is_terminal());
        assert!(!SaveTaskStatus::NotCreated.is_terminal());
        assert!(!SaveTaskStatus::Running.is_terminal());
    }

    #[test]
    fn test_decode_not_created() {
        let task: SaveTask = serde_json::from_value(json!({
            "id": 3,
            "save_task_status": "not created",
            "save_request_status": "pending",
            "request_url": "https://archive.example/3/",
        }))
        .unwrap();
        assert_eq!(task.save_task_status, SaveTaskStatus::NotCreated);
        assert_eq!(task.snapshot_swhid, None);
    }

    #[test]
    fn test_decode_unknown_task_status() {
        let task: SaveTask = serde_json::from_value(task_json(5, "not yet scheduled", "accepted")).unwrap();
        assert_eq!(
            task.save_task_status,
            SaveTaskStatus::Other("not yet scheduled".to_string())
        );
        assert!(!task.is_terminal());
        assert_eq!(
            serde_json::to_value(&task).unwrap()["save_task_status"],
            "not yet scheduled"
        );
    }

    #[test]
    fn test_save_url() {
        let c = client("http://swh.test");
        assert_eq!(
            c.save_url("https://example.org/r.git").unwrap().as_str(),
            "http://swh.test/api/1/origin/save/git/url/https://example.org/r.git/"
        );
        assert_eq!(
            c.save_url("https://example.org/a b?x").unwrap().as_str(),
            "http://swh.test/api/1/origin/save/git/url/https://example.org/a%20b%3Fx/"
        );
    }

    #[tokio::test]
    async fn test_submit_ok() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/1/origin/save/git/url/https://example.org/r.git/"))
            .and(bearer_token("sekrit"))
            .respond_with(ResponseTemplate::new(200).set_body_json(task_json(7, "pending", "accepted")))
            .expect(1)
            .mount(&server)
            .await;

        let task = client(&server.uri())
            .submit("https://example.org/r.git")
            .await
            .unwrap();
        assert_eq!(task.id, 7);
        assert_eq!(task.save_task_status, SaveTaskStatus::Pending);
        assert_eq!(task.save_request_status, SaveRequestStatus::Accepted);
        assert!(task.request_url.ends_with("/7/"));
    }

    #[tokio::test]
    async fn test_submit_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("X-RateLimit-Remaining", "0")
                    .insert_header("X-RateLimit-Reset", "1700000000"),
            )
            .mount(&server)
            .await;

        let err = client(&server.uri())
            .submit("https://example.org/r.git")
            .await
            .unwrap_err();
        match err {
            SwhError::RateLimited(info) => {
                assert_eq!(info.remaining, Some(0));
                assert_eq!(info.reset, Some(1_700_000_000));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn test_submit_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = client(&server.uri())
            .submit("https://example.org/r.git")
            .await
            .unwrap_err();
        assert!(matches!(err, SwhError::SubmissionFailed(StatusCode::INTERNAL_SERVER_ERROR)));
        assert!(!err.is_rate_limited());
    }

    #[tokio::test]
    async fn test_submit_malformed_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "seven"})))
            .mount(&server)
            .await;

        let err = client(&server.uri())
            .submit("https://example.org/r.git")
            .await
            .unwrap_err();
        assert!(matches!(err, SwhError::Decode(_)));
    }

    #[tokio::test]
    async fn test_fetch_status() {
        let server = MockServer::start().await;
        let mut body = task_json(7, "succeeded", "accepted");
        body["snapshot_swhid"] = json!("swh:1:snp:0000000000000000000000000000000000000000");
        Mock::given(method("GET"))
            .and(path("/api/1/origin/save/7/"))
            .and(bearer_token("sekrit"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        let task = client(&server.uri())
            .fetch_status(&format!("{}/api/1/origin/save/7/", server.uri()))
            .await
            .unwrap();
        assert!(task.is_terminal());
        assert_eq!(
            task.snapshot_swhid.as_deref(),
            Some("swh:1:snp:0000000000000000000000000000000000000000")
        );
    }

    #[tokio::test]
    async fn test_fetch_status_taxonomy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/limited"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let c = client(&server.uri());
        assert!(c
            .fetch_status(&format!("{}/limited", server.uri()))
            .await
            .unwrap_err()
            .is_rate_limited());
        assert!(matches!(
            c.fetch_status(&format!("{}/gone", server.uri())).await.unwrap_err(),
            SwhError::StatusFetchFailed(StatusCode::NOT_FOUND)
        ));
        assert!(matches!(
            c.fetch_status("not a url").await.unwrap_err(),
            SwhError::InvalidUrl(_)
        ));
    }
}
