use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Query, Request, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use reftest_core::api::{InfoRequest, QuitQuery, SubmitRequest};
use tower::ServiceExt;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};

use crate::service::{HarnessService, SubmitError};

#[derive(Clone)]
pub struct AppState {
    svc: Arc<HarnessService>,
    doc_root: Arc<PathBuf>,
}

pub fn router(svc: Arc<HarnessService>, doc_root: PathBuf) -> Router {
    let state = AppState {
        svc,
        doc_root: Arc::new(doc_root),
    };
    Router::new()
        .route("/healthz", get(healthz))
        .route("/submit_task_results", post(submit_task_results))
        .route("/info", post(info))
        .route("/tellMeToQuit", post(tell_me_to_quit))
        .fallback(static_files)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn submit_task_results(
    State(st): State<AppState>,
    payload: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(req) = payload.map_err(ApiError::from)?;
    st.svc.submit(req).await?;
    Ok(StatusCode::OK)
}

async fn info(
    State(st): State<AppState>,
    payload: Result<Json<InfoRequest>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(req) = payload.map_err(ApiError::from)?;
    st.svc.info(req).await;
    Ok(StatusCode::OK)
}

async fn tell_me_to_quit(State(st): State<AppState>, Query(q): Query<QuitQuery>) -> StatusCode {
    st.svc.quit(q).await;
    StatusCode::OK
}

/// Serves the document root. Directories get a redirect to their slash form
/// or a PDF listing; everything else goes to `ServeDir`, which answers
/// byte-range requests with 206.
async fn static_files(State(st): State<AppState>, req: Request) -> Response {
    let uri_path = req.uri().path().to_string();
    let Some(fs_path) = resolve_under(&st.doc_root, &uri_path) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    if fs_path.is_dir() {
        if !uri_path.ends_with('/') {
            let target = match req.uri().query() {
                Some(q) => format!("{uri_path}/?{q}"),
                None => format!("{uri_path}/"),
            };
            return (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, target)]).into_response();
        }
        return match directory_listing(&fs_path, &uri_path) {
            Ok(html) => Html(html).into_response(),
            Err(e) => {
                tracing::error!(path = %fs_path.display(), error = %e, "directory listing failed");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        };
    }

    let served = ServeDir::new(st.doc_root.as_path()).oneshot(req).await;
    match served {
        Ok(resp) => resp.map(Body::new),
        Err(never) => match never {},
    }
}

/// Maps a request path onto the document root. Percent-encoded paths are left
/// to `ServeDir`; traversal outside the root is refused.
fn resolve_under(root: &Path, uri_path: &str) -> Option<PathBuf> {
    let rel = Path::new(uri_path.trim_start_matches('/'));
    if rel.components().any(|c| !matches!(c, Component::Normal(_))) {
        return None;
    }
    Some(root.join(rel))
}

fn directory_listing(dir: &Path, uri_path: &str) -> std::io::Result<String> {
    let mut subdirs = Vec::new();
    let mut pdfs = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type()?.is_dir() {
            subdirs.push(name);
        } else if name.to_lowercase().ends_with(".pdf") {
            pdfs.push(name);
        }
    }
    subdirs.sort();
    pdfs.sort();

    let mut html = format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>{0}</title></head>\n<body><h1>PDFs of {0}</h1>\n<ul>\n",
        escape_html(uri_path)
    );
    if uri_path != "/" {
        html.push_str("<li><a href=\"..\">..</a></li>\n");
    }
    for name in &subdirs {
        let name = escape_html(name);
        html.push_str(&format!("<li><a href=\"{name}/\">{name}/</a></li>\n"));
    }
    for name in &pdfs {
        let href = viewer_link(&format!("{uri_path}{name}"));
        html.push_str(&format!(
            "<li><a href=\"{}\">{}</a></li>\n",
            escape_html(&href),
            escape_html(name)
        ));
    }
    if subdirs.is_empty() && pdfs.is_empty() {
        html.push_str("<li>no files found</li>\n");
    }
    html.push_str("</ul></body></html>\n");
    Ok(html)
}

fn viewer_link(file: &str) -> String {
    match reqwest::Url::parse_with_params("http://localhost/web/viewer.html", [("file", file)]) {
        Ok(url) => format!("{}?{}", url.path(), url.query().unwrap_or_default()),
        Err(_) => format!("/web/viewer.html?file={file}"),
    }
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
}

impl From<SubmitError> for ApiError {
    fn from(e: SubmitError) -> Self {
        let msg = e.to_string();
        match e {
            SubmitError::UnknownBrowser(_) | SubmitError::UnknownTask(_) => ApiError::NotFound(msg),
            SubmitError::AlreadyGraded { .. } => ApiError::Conflict(msg),
            SubmitError::InvalidPage { .. } | SubmitError::Record(_) => ApiError::BadRequest(msg),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError::BadRequest(e.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, msg) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m),
        };
        tracing::error!(status = %code, error = %msg, "request rejected");
        (
            code,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            msg,
        )
            .into_response()
    }
}
