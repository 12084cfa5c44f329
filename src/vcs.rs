//! Source validation: is a source-code URL a reachable Git smart-HTTP remote?
//!
//! The probe is the first step of git's own protocol discovery
//! (`GET <repo>/info/refs?service=git-upload-pack`), so a success means the
//! archival service will be able to clone the same URL.

use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::utils::{service_user_agent, until_cancelled};

/// Content type of a smart-HTTP upload-pack advertisement.
pub const UPLOAD_PACK_ADVERTISEMENT: &str = "application/x-git-upload-pack-advertisement";

#[derive(Debug, Clone)]
pub struct ValidationPolicy {
    /// Number of probe attempts; only timeouts are retried.
    pub attempts: u32,
    pub attempt_timeout: Duration,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("invalid source URL {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("unsupported scheme {0:?}, expected http or https")]
    InvalidScheme(String),

    #[error("not a git remote: {0}")]
    NotAGitRemote(String),

    #[error("no answer after {0} attempts")]
    RetriesExceeded(u32),

    #[error("validation cancelled")]
    Cancelled,
}

impl ValidationError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Parse a source URL, forcing a trailing `/` and rejecting non-HTTP schemes.
pub fn normalize_source_url(source: &str) -> Result<Url, ValidationError> {
    let with_slash = if source.ends_with('/') {
        source.to_string()
    } else {
        format!("{}/", source)
    };
    let url = Url::parse(&with_slash).map_err(|e| ValidationError::InvalidUrl {
        url: source.to_string(),
        source: e,
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ValidationError::InvalidScheme(other.to_string())),
    }
}

/// The protocol-discovery URL for a normalized repository URL.
pub fn refs_url(repo: &Url) -> Result<Url, ValidationError> {
    let mut url = repo.join("info/refs").map_err(|e| ValidationError::InvalidUrl {
        url: repo.to_string(),
        source: e,
    })?;
    url.query_pairs_mut()
        .append_pair("service", "git-upload-pack");
    Ok(url)
}

fn is_upload_pack_advertisement(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|essence| essence.trim().eq_ignore_ascii_case(UPLOAD_PACK_ADVERTISEMENT))
        .unwrap_or(false)
}

/// Probes source URLs over HTTP(S).
#[derive(Debug, Clone)]
pub struct GitValidator {
    client: reqwest::Client,
    policy: ValidationPolicy,
}

impl GitValidator {
    pub fn new(client: reqwest::Client, policy: ValidationPolicy) -> Self {
        Self { client, policy }
    }

    pub fn policy(&self) -> &ValidationPolicy {
        &self.policy
    }

    /// Check that `source` answers git protocol discovery.
    ///
    /// No request is made for URLs that fail to parse or use a non-HTTP scheme.
    pub async fn validate(
        &self,
        source: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ValidationError> {
        let repo = normalize_source_url(source)?;
        let probe = refs_url(&repo)?;

        for attempt in 1..=self.policy.attempts {
            let request = self
                .client
                .get(probe.clone())
                .header(USER_AGENT, service_user_agent("git"))
                .header("Git-Protocol", "version=2")
                .timeout(self.policy.attempt_timeout);

            let response = until_cancelled(cancel, request.send())
                .await
                .map_err(|_| ValidationError::Cancelled)?;

            match response {
                Ok(response) if is_upload_pack_advertisement(&response) => {
                    debug!(source, status = %response.status(), "git remote ok");
                    return Ok(());
                }
                Ok(response) => {
                    let content_type = response
                        .headers()
                        .get(CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("<none>")
                        .to_string();
                    return Err(ValidationError::NotAGitRemote(format!(
                        "HTTP {} with content type {}",
                        response.status(),
                        content_type
                    )));
                }
                Err(e) if e.is_timeout() => {
                    warn!(source, attempt, err = %e, "retrying GET info/refs");
                }
                Err(e) => return Err(ValidationError::NotAGitRemote(e.to_string())),
            }
        }

        Err(ValidationError::RetriesExceeded(self.policy.attempts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn validator(attempts: u32, timeout: Duration) -> GitValidator {
        GitValidator::new(
            reqwest::Client::new(),
            ValidationPolicy {
                attempts,
                attempt_timeout: timeout,
            },
        )
    }

    fn advertisement() -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_raw(
            b"001e# service=git-upload-pack\n0000".to_vec(),
            UPLOAD_PACK_ADVERTISEMENT,
        )
    }

    #[test]
    fn test_normalize_adds_slash() {
        let url = normalize_source_url("https://example.org/r.git").unwrap();
        assert_eq!(url.as_str(), "https://example.org/r.git/");
        let url = normalize_source_url("https://example.org/r.git/").unwrap();
        assert_eq!(url.as_str(), "https://example.org/r.git/");
    }

    #[test]
    fn test_normalize_rejects_scheme() {
        assert!(matches!(
            normalize_source_url("git://example.org/r.git"),
            Err(ValidationError::InvalidScheme(s)) if s == "git"
        ));
        assert!(matches!(
            normalize_source_url("ssh://git@example.org/r.git"),
            Err(ValidationError::InvalidScheme(_))
        ));
    }

    #[test]
    fn test_normalize_rejects_garbage() {
        assert!(matches!(
            normalize_source_url(""),
            Err(ValidationError::InvalidUrl { .. })
        ));
        assert!(matches!(
            normalize_source_url("not a url"),
            Err(ValidationError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_refs_url() {
        let repo = normalize_source_url("https://example.org/group/r").unwrap();
        assert_eq!(
            refs_url(&repo).unwrap().as_str(),
            "https://example.org/group/r/info/refs?service=git-upload-pack"
        );
    }

    #[tokio::test]
    async fn test_valid_remote() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/r.git/info/refs"))
            .and(query_param("service", "git-upload-pack"))
            .and(header("Git-Protocol", "version=2"))
            .respond_with(advertisement())
            .expect(1)
            .mount(&server)
            .await;

        let v = validator(3, Duration::from_secs(5));
        v.validate(&format!("{}/r.git", server.uri()), &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wrong_content_type() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page/info/refs"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
            .expect(1)
            .mount(&server)
            .await;

        let v = validator(3, Duration::from_secs(5));
        let err = v
            .validate(&format!("{}/page", server.uri()), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::NotAGitRemote(_)), "{err}");
    }

    #[tokio::test]
    async fn test_not_found_is_not_a_remote() {
        let server = MockServer::start().await;
        let v = validator(3, Duration::from_secs(5));
        let err = v
            .validate(&format!("{}/missing", server.uri()), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::NotAGitRemote(_)));
    }

    #[tokio::test]
    async fn test_timeouts_exhaust_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow/info/refs"))
            .respond_with(advertisement().set_delay(Duration::from_millis(500)))
            .expect(2)
            .mount(&server)
            .await;

        let v = validator(2, Duration::from_millis(50));
        let err = v
            .validate(&format!("{}/slow", server.uri()), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::RetriesExceeded(2)), "{err}");
    }

    #[tokio::test]
    async fn test_invalid_scheme_makes_no_request() {
        let v = validator(3, Duration::from_secs(5));
        let err = v
            .validate("ftp://example.org/r.git", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidScheme(_)));
    }

    #[tokio::test]
    async fn test_cancelled() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(advertisement().set_delay(Duration::from_secs(30)))
            .mount(&server)
            .await;

        let token = CancellationToken::new();
        token.cancel();
        let v = validator(3, Duration::from_secs(60));
        let err = v
            .validate(&format!("{}/r.git", server.uri()), &token)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
