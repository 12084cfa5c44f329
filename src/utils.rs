use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// The version of the fdroid-swh package
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Marker returned when a wait was interrupted by the shutdown token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl std::fmt::Display for Cancelled {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("cancelled")
    }
}

impl std::error::Error for Cancelled {}

/// Get the default user agent string for HTTP requests
pub fn default_user_agent() -> String {
    format!("fdroidswh/{}", VERSION)
}

/// Get a service-specific user agent string
pub fn service_user_agent(service_name: &str) -> String {
    format!("fdroidswh-{}/{}", service_name, VERSION)
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Render a millisecond timestamp as RFC 3339, or an empty string for "never".
pub fn format_millis(millis: i64) -> String {
    if millis <= 0 {
        return String::new();
    }
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_default()
}

/// Sleep for `duration`, returning early with [`Cancelled`] if `token` fires.
pub async fn sleep_or_cancel(token: &CancellationToken, duration: Duration) -> Result<(), Cancelled> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Drive `fut` to completion unless `token` is cancelled first.
pub async fn until_cancelled<F>(token: &CancellationToken, fut: F) -> Result<F::Output, Cancelled>
where
    F: Future,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Cancelled),
        out = fut => Ok(out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_agent_functions() {
        let default_ua = default_user_agent();
        assert!(default_ua.starts_with("fdroidswh/"));
        assert!(default_ua.contains(VERSION));

        let service_ua = service_user_agent("git");
        assert!(service_ua.starts_with("fdroidswh-git/"));
    }

    #[test]
    fn test_format_millis() {
        assert_eq!(format_millis(0), "");
        assert_eq!(format_millis(-5), "");
        assert_eq!(format_millis(1_700_000_000_000), "2023-11-14T22:13:20Z");
    }

    #[tokio::test]
    async fn test_sleep_or_cancel_returns_on_cancel() {
        let token = CancellationToken::new();
        token.cancel();
        let res = tokio::time::timeout(
            Duration::from_secs(1),
            sleep_or_cancel(&token, Duration::from_secs(3600)),
        )
        .await
        .unwrap();
        assert_eq!(res, Err(Cancelled));
    }

    #[tokio::test]
    async fn test_sleep_or_cancel_completes() {
        let token = CancellationToken::new();
        assert_eq!(sleep_or_cancel(&token, Duration::from_millis(1)).await, Ok(()));
    }

    #[tokio::test]
    async fn test_until_cancelled() {
        let token = CancellationToken::new();
        assert_eq!(until_cancelled(&token, async { 42 }).await, Ok(42));
        token.cancel();
        assert_eq!(
            until_cancelled(&token, std::future::pending::<()>()).await,
            Err(Cancelled)
        );
    }
}
