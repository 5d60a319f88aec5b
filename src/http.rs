//! HTTP surface: crawler serving, admin actions and a database health probe.
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE, LOCATION};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, warn};

use crate::admin::AdminRequest;
use crate::app::Services;
use crate::db;
use crate::error::CacheError;
use crate::model::CacheStatus;
use crate::paths;
use crate::render::escape_html;
use crate::resolver::Caller;

pub const CACHE_HEADER: &str = "x-static-cache";
pub const GENERATED_AT_HEADER: &str = "x-generated-at";
const CACHEABLE: &str = "public, max-age=3600, s-maxage=86400";
const UNCACHEABLE: &str = "no-cache, no-store, must-revalidate";
const HTML: &str = "text/html; charset=utf-8";

#[derive(Clone)]
pub struct AppState {
    pub services: Services,
    pub crawler_header: String,
    pub base_url: String,
    pub site_name: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/serve", get(serve))
        .route("/admin", post(admin))
        .route("/_health/db", get(health_db))
        .with_state(state)
}

impl IntoResponse for CacheError {
    fn into_response(self) -> Response {
        let status = match &self {
            CacheError::Validation(_) => StatusCode::BAD_REQUEST,
            CacheError::ConcurrencyConflict { .. } => StatusCode::CONFLICT,
            CacheError::NotFound(_) => StatusCode::NOT_FOUND,
            CacheError::BackendUnavailable(_) | CacheError::Cancelled { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            CacheError::Render { .. } | CacheError::Storage { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct ServeQuery {
    path: Option<String>,
    test: Option<String>,
}

fn flag(raw: Option<&str>) -> bool {
    matches!(raw, Some("1" | "true" | "yes"))
}

fn caller_from(headers: &HeaderMap, crawler_header: &str) -> Caller {
    let flagged = headers
        .get(crawler_header)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| flag(Some(v.trim())));
    if flagged {
        Caller::Crawler
    } else {
        Caller::Visitor
    }
}

fn html_response(
    status: StatusCode,
    cache_status: &'static str,
    cache_control: &'static str,
    body: String,
) -> Response {
    let mut response = (status, body).into_response();
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(HTML));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static(cache_control));
    headers.insert(CACHE_HEADER, HeaderValue::from_static(cache_status));
    response
}

fn placeholder(state: &AppState, path: &str, robots: &str) -> String {
    let site = escape_html(&state.site_name);
    let canonical = escape_html(&format!("{}{}", state.base_url.trim_end_matches('/'), path));
    format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n  <meta charset=\"UTF-8\">\n  <title>{site}</title>\n  <link rel=\"canonical\" href=\"{canonical}\">\n  <meta name=\"robots\" content=\"{robots}\">\n</head>\n<body>\n  <h1>{site}</h1>\n  <p>Loading...</p>\n</body>\n</html>\n"
    )
}

async fn serve(
    State(state): State<AppState>,
    Query(query): Query<ServeQuery>,
    headers: HeaderMap,
) -> Result<Response, CacheError> {
    let raw = query.path.unwrap_or_else(|| "/".to_string());
    let test_mode = flag(query.test.as_deref());

    let canonical = paths::canonicalize(&raw)?;
    if paths::is_private(&canonical) {
        let body = placeholder(&state, &canonical, "noindex, nofollow");
        return Ok(html_response(StatusCode::OK, "private", UNCACHEABLE, body));
    }
    if paths::is_asset(&canonical) {
        return Ok(html_response(StatusCode::NOT_FOUND, "bypass", UNCACHEABLE, String::new()));
    }
    if canonical != raw {
        let mut response = StatusCode::MOVED_PERMANENTLY.into_response();
        let location = HeaderValue::from_str(&canonical)
            .map_err(|e| CacheError::validation(format!("unusable path: {e}")))?;
        response.headers_mut().insert(LOCATION, location);
        return Ok(response);
    }

    let caller = caller_from(&headers, &state.crawler_header);
    let resolution = state
        .services
        .resolver
        .resolve(&canonical, caller, test_mode)
        .await?;

    let response = match (resolution.status, resolution.html) {
        (CacheStatus::Hit | CacheStatus::Stale, Some(html)) => {
            let mut response =
                html_response(StatusCode::OK, resolution.status.as_str(), CACHEABLE, html);
            if let Some(generated_at) = resolution.generated_at {
                if let Ok(v) = HeaderValue::from_str(&generated_at.to_rfc3339()) {
                    response.headers_mut().insert(GENERATED_AT_HEADER, v);
                }
            }
            response
        }
        _ => {
            let body = placeholder(&state, &canonical, "index, follow");
            html_response(StatusCode::OK, CacheStatus::Miss.as_str(), UNCACHEABLE, body)
        }
    };
    Ok(response)
}

async fn admin(State(state): State<AppState>, body: Bytes) -> Result<Response, CacheError> {
    let request: AdminRequest = serde_json::from_slice(&body).map_err(|e| {
        warn!(error = %e, "rejected admin request");
        CacheError::validation(format!("invalid admin request: {e}"))
    })?;
    let response = state.services.admin.dispatch(request).await?;
    Ok(Json(response).into_response())
}

async fn health_db(State(state): State<AppState>) -> Response {
    match db::ping(state.services.store.pool()).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response(),
        Err(err) => {
            warn!(?err, "database health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable" })),
            )
                .into_response()
        }
    }
}
