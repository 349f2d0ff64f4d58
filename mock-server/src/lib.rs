use std::{collections::BTreeMap, sync::Arc, time::Duration};

use axum::{
    body::Bytes,
    extract::{Path, Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{AppendHeaders, IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::RwLock};

/// `café` in ISO-8859-1.
pub const LATIN1_CAFE: &[u8] = b"caf\xe9";

pub const LATIN1_META_PAGE: &[u8] =
    b"<html><head><meta charset=\"iso-8859-1\"><title>t</title></head><body>caf\xe9</body></html>";

pub const LATIN1_XML: &[u8] = b"<?xml version=\"1.0\" encoding=\"ISO-8859-1\"?><word>caf\xe9</word>";

/// Requests served, keyed by path.
pub type Hits = Arc<RwLock<BTreeMap<String, u64>>>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Stats {
    pub hits: BTreeMap<String, u64>,
}

#[derive(Deserialize)]
pub struct SlowParams {
    #[serde(default)]
    pub ms: u64,
}

pub fn app() -> Router {
    let hits: Hits = Arc::new(RwLock::new(BTreeMap::new()));
    Router::new()
        .route("/text/latin1-meta", get(latin1_meta))
        .route("/text/header-charset", get(header_charset))
        .route("/xml", get(latin1_xml))
        .route("/echo", post(echo).put(echo))
        .route("/headers", get(request_headers))
        .route("/bytes/{n}", get(bytes))
        .route("/redirect", get(redirect))
        .route("/slow", get(slow))
        .route("/cookies", get(cookies))
        .route("/status/{code}", get(status))
        .route("/stats", get(stats))
        .layer(middleware::from_fn_with_state(hits.clone(), count_hits))
        .with_state(hits)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

async fn count_hits(State(hits): State<Hits>, request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();
    *hits.write().await.entry(path).or_default() += 1;
    next.run(request).await
}

async fn stats(State(hits): State<Hits>) -> Json<Stats> {
    Json(Stats {
        hits: hits.read().await.clone(),
    })
}

async fn latin1_meta() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/html")], LATIN1_META_PAGE)
}

async fn header_charset() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/plain; charset=iso-8859-1")], LATIN1_CAFE)
}

async fn latin1_xml() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "application/xml")], LATIN1_XML)
}

/// Returns the request body unchanged, with the request's Content-Type.
async fn echo(headers: HeaderMap, body: Bytes) -> impl IntoResponse {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    ([(header::CONTENT_TYPE, content_type)], body)
}

async fn request_headers(headers: HeaderMap) -> Json<BTreeMap<String, String>> {
    Json(
        headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect(),
    )
}

/// `n` bytes of a repeating pattern: byte `i` is `i % 251`.
async fn bytes(Path(n): Path<usize>) -> impl IntoResponse {
    let body: Vec<u8> = (0..n).map(|i| (i % 251) as u8).collect();
    ([(header::CONTENT_TYPE, "application/octet-stream")], body)
}

async fn redirect() -> Redirect {
    Redirect::to("/text/header-charset")
}

async fn slow(Query(params): Query<SlowParams>) -> &'static str {
    tokio::time::sleep(Duration::from_millis(params.ms)).await;
    "done"
}

async fn cookies() -> impl IntoResponse {
    (
        AppendHeaders([(header::SET_COOKIE, "a=1"), (header::SET_COOKIE, "b=2")]),
        "cookies",
    )
}

async fn status(Path(code): Path<u16>) -> Result<(StatusCode, String), StatusCode> {
    let status = StatusCode::from_u16(code).map_err(|_| StatusCode::BAD_REQUEST)?;
    Ok((status, format!("status {code}")))
}
