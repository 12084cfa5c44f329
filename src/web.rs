//! Read-only status page.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use askama::Template;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{middleware, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::database::{Database, StatusRow};
use crate::error::Result;
use crate::metrics::{metrics_middleware, MetricsCollector};
use crate::utils::{format_millis, VERSION};

#[derive(Debug, Clone)]
pub struct AppState {
    pub db: Database,
    pub page_size: u32,
    pub started: Instant,
}

impl AppState {
    pub fn new(db: Database, page_size: u32) -> Self {
        Self {
            db,
            page_size: page_size.max(1),
            started: Instant::now(),
        }
    }
}

struct StatusLine {
    package: String,
    source_code: String,
    last_save_triggered: String,
    save_request_status: String,
    save_task_status: String,
    snapshot_swhid: String,
}

impl From<StatusRow> for StatusLine {
    fn from(row: StatusRow) -> Self {
        Self {
            package: row.package,
            source_code: row.source_code,
            last_save_triggered: format_millis(row.last_save_triggered),
            save_request_status: row.save_request_status.unwrap_or_default(),
            save_task_status: row.save_task_status.unwrap_or_default(),
            snapshot_swhid: row.snapshot_swhid.unwrap_or_default(),
        }
    }
}

#[derive(Template)]
#[template(path = "status.html")]
struct StatusTemplate {
    rows: Vec<StatusLine>,
    page: u64,
    total: i64,
    prev_page: Option<u64>,
    next_page: Option<u64>,
    uptime: String,
    version: &'static str,
}

/// Parse the `page` query parameter. Absent means 1, values below 1 clamp to 1.
pub fn parse_page(raw: Option<&str>) -> std::result::Result<u64, String> {
    match raw {
        None => Ok(1),
        Some(raw) => raw
            .trim()
            .parse::<i64>()
            .map(|page| page.max(1) as u64)
            .map_err(|_| format!("invalid page: {:?}", raw)),
    }
}

/// Render an uptime like `2d 3h 4m 5s`.
pub fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    let (days, rem) = (secs / 86_400, secs % 86_400);
    let (hours, rem) = (rem / 3_600, rem % 3_600);
    let (minutes, seconds) = (rem / 60, rem % 60);
    if days > 0 {
        format!("{}d {}h {}m {}s", days, hours, minutes, seconds)
    } else if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

async fn render_status(state: &AppState, page: u64) -> Result<String> {
    let offset = (page - 1).saturating_mul(u64::from(state.page_size));
    let total = state.db.count_packages().await?;
    let rows = state.db.list_status(state.page_size, offset).await?;
    let shown = offset.saturating_add(rows.len() as u64);

    let template = StatusTemplate {
        page,
        total,
        prev_page: (page > 1).then(|| page - 1),
        next_page: (shown < u64::try_from(total).unwrap_or(0)).then(|| page + 1),
        rows: rows.into_iter().map(StatusLine::from).collect(),
        uptime: format_uptime(state.started.elapsed()),
        version: VERSION,
    };
    Ok(template.render()?)
}

async fn status(State(state): State<AppState>, Query(query): Query<HashMap<String, String>>) -> Response {
    let page = match parse_page(query.get("page").map(String::as_str)) {
        Ok(page) => page,
        Err(msg) => return (StatusCode::BAD_REQUEST, msg).into_response(),
    };
    match render_status(&state, page).await {
        Ok(body) => Html(body).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn metrics() -> Response {
    match MetricsCollector::collect_metrics() {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(status))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the status page until `cancel` fires.
pub async fn serve(listener: TcpListener, state: AppState, cancel: CancellationToken) -> Result<()> {
    info!(addr = ?listener.local_addr().ok(), "status server listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    info!("status server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::PackageMetadata;
    use crate::swh::{SaveRequestStatus, SaveTask, SaveTaskStatus};
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use tower::ServiceExt;

    async fn state(page_size: u32) -> AppState {
        let db = Database::in_memory().await.unwrap();
        db.upsert_packages(&[
            PackageMetadata {
                name: "org.example.a".to_string(),
                added: 0,
                last_updated: 0,
                source_code: "https://example.org/a".to_string(),
            },
            PackageMetadata {
                name: "org.example.b".to_string(),
                added: 0,
                last_updated: 0,
                source_code: "https://example.org/<b>".to_string(),
            },
        ])
        .await
        .unwrap();
        db.upsert_task(&SaveTask {
            id: 7,
            save_task_status: SaveTaskStatus::Succeeded,
            save_request_status: SaveRequestStatus::Accepted,
            snapshot_swhid: Some("swh:1:snp:0007".to_string()),
            request_url: "https://archive.example/7/".to_string(),
        })
        .await
        .unwrap();
        db.set_current_task("org.example.a", 7).await.unwrap();
        db.set_last_triggered("org.example.a", 1_700_000_000_000)
            .await
            .unwrap();
        AppState::new(db, page_size)
    }

    async fn get_page(app: Router, uri: &str) -> (StatusCode, String) {
        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[test]
    fn test_parse_page() {
        assert_eq!(parse_page(None), Ok(1));
        assert_eq!(parse_page(Some("3")), Ok(3));
        assert_eq!(parse_page(Some("0")), Ok(1));
        assert_eq!(parse_page(Some("-4")), Ok(1));
        assert!(parse_page(Some("two")).is_err());
    }

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(Duration::from_secs(5)), "5s");
        assert_eq!(format_uptime(Duration::from_secs(3_725)), "1h 2m 5s");
        assert_eq!(format_uptime(Duration::from_secs(90_061)), "1d 1h 1m 1s");
    }

    #[tokio::test]
    async fn test_status_page() {
        let (status, body) = get_page(app(state(100).await), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("org.example.a"));
        assert!(body.contains("2023-11-14T22:13:20Z"));
        assert!(body.contains("swh:1:snp:0007"));
        assert!(body.contains("succeeded"));
        assert!(body.contains("&lt;b&gt;"));
        assert!(!body.contains("<b>"));
        assert!(!body.contains("next &raquo;"));
    }

    #[tokio::test]
    async fn test_status_pagination() {
        let router = app(state(1).await);
        let (_, first) = get_page(router.clone(), "/?page=1").await;
        assert!(first.contains("org.example.a"));
        assert!(!first.contains("org.example.b"));
        assert!(first.contains("?page=2"));

        let (_, second) = get_page(router.clone(), "/?page=2").await;
        assert!(second.contains("org.example.b"));
        assert!(second.contains("?page=1"));

        let (status, clamped) = get_page(router, "/?page=0").await;
        assert_eq!(status, StatusCode::OK);
        assert!(clamped.contains("org.example.a"));
    }

    #[tokio::test]
    async fn test_bad_page_is_400() {
        let (status, _) = get_page(app(state(10).await), "/?page=abc").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health_and_metrics() {
        let router = app(state(10).await);
        let (status, body) = get_page(router.clone(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");

        let (status, body) = get_page(router, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("fdroidswh_http_requests_total"));
    }
}
