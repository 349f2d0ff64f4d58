use axum::http::{self, Request, StatusCode};
use http_body_util::BodyExt;
use mock_server::{app, Stats, LATIN1_CAFE, LATIN1_META_PAGE};
use tower::ServiceExt;

async fn body_bytes(response: axum::response::Response) -> bytes::Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

fn get(uri: &str) -> Request<String> {
    Request::builder().uri(uri).body(String::new()).unwrap()
}

fn content_type(response: &axum::response::Response) -> &str {
    response
        .headers()
        .get(http::header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
}

// --- text ---

#[tokio::test]
async fn latin1_meta_page_has_no_header_charset() {
    let resp = app().oneshot(get("/text/latin1-meta")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(content_type(&resp), "text/html");
    assert_eq!(body_bytes(resp).await, LATIN1_META_PAGE);
}

#[tokio::test]
async fn header_charset_is_declared() {
    let resp = app().oneshot(get("/text/header-charset")).await.unwrap();
    assert_eq!(content_type(&resp), "text/plain; charset=iso-8859-1");
    assert_eq!(body_bytes(resp).await, LATIN1_CAFE);
}

// --- echo ---

#[tokio::test]
async fn echo_returns_body_and_content_type() {
    let req = Request::builder()
        .method("POST")
        .uri("/echo")
        .header(http::header::CONTENT_TYPE, "text/plain; charset=iso-8859-1")
        .body(String::from("hello"))
        .unwrap();
    let resp = app().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(content_type(&resp), "text/plain; charset=iso-8859-1");
    assert_eq!(body_bytes(resp).await, "hello");
}

#[tokio::test]
async fn echo_without_content_type_is_binary() {
    let req = Request::builder()
        .method("PUT")
        .uri("/echo")
        .body(String::from("raw"))
        .unwrap();
    let resp = app().oneshot(req).await.unwrap();
    assert_eq!(content_type(&resp), "application/octet-stream");
}

#[tokio::test]
async fn headers_are_reflected() {
    let req = Request::builder()
        .uri("/headers")
        .header("x-probe", "1")
        .body(String::new())
        .unwrap();
    let resp = app().oneshot(req).await.unwrap();
    let headers: std::collections::BTreeMap<String, String> = body_json(resp).await;
    assert_eq!(headers.get("x-probe").map(String::as_str), Some("1"));
}

// --- bytes ---

#[tokio::test]
async fn bytes_have_requested_length_and_pattern() {
    let resp = app().oneshot(get("/bytes/300")).await.unwrap();
    assert_eq!(content_type(&resp), "application/octet-stream");
    let body = body_bytes(resp).await;
    assert_eq!(body.len(), 300);
    assert_eq!(body[250], 250);
    assert_eq!(body[251], 0);
}

// --- redirect / status / cookies ---

#[tokio::test]
async fn redirect_points_at_text() {
    let resp = app().oneshot(get("/redirect")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::SEE_OTHER);
    assert_eq!(
        resp.headers().get(http::header::LOCATION).unwrap(),
        "/text/header-charset"
    );
}

#[tokio::test]
async fn status_route_returns_requested_code() {
    let resp = app().oneshot(get("/status/404")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_bytes(resp).await, "status 404");
}

#[tokio::test]
async fn status_route_rejects_invalid_code() {
    let resp = app().oneshot(get("/status/42")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn cookies_are_sent_separately() {
    let resp = app().oneshot(get("/cookies")).await.unwrap();
    let cookies: Vec<_> = resp
        .headers()
        .get_all(http::header::SET_COOKIE)
        .iter()
        .map(|v| v.to_str().unwrap().to_string())
        .collect();
    assert_eq!(cookies, vec!["a=1", "b=2"]);
}

#[tokio::test]
async fn slow_route_answers_after_delay() {
    let resp = app().oneshot(get("/slow?ms=5")).await.unwrap();
    assert_eq!(body_bytes(resp).await, "done");
}

// --- stats ---

#[tokio::test]
async fn stats_count_hits_per_path() {
    let app = app();
    app.clone().oneshot(get("/xml")).await.unwrap();
    app.clone().oneshot(get("/xml")).await.unwrap();
    let resp = app.oneshot(get("/stats")).await.unwrap();
    let stats: Stats = body_json(resp).await;
    assert_eq!(stats.hits.get("/xml"), Some(&2));
    assert_eq!(stats.hits.get("/stats"), Some(&1));
}
