//! Control-plane routes exercised in-process through the router.

use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use http_body_util::BodyExt;
use serde::de::DeserializeOwned;
use tower::ServiceExt;
use warden_cli::router;
use warden_lsp::testing::diagnostic;
use warden_types::{CollectionResult, HealthReport, NO_ISSUES_SUMMARY, Severity};

use crate::common::{file_uri, project};

async fn call(app: &Router, method: Method, uri: &str) -> (StatusCode, bytes::Bytes) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body)
}

async fn get_json<T: DeserializeOwned>(app: &Router, uri: &str) -> T {
    let (status, body) = call(app, Method::GET, uri).await;
    assert_eq!(status, StatusCode::OK, "{}", String::from_utf8_lossy(&body));
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn health_reports_the_project() {
    let project = project(&[("main.fk", Vec::new())]).await;
    let (state, _shutdown) = project.control(100);
    let app = router(state);

    let report: HealthReport = get_json(&app, "/health").await;
    assert_eq!(&report.project_hash, project.service.project_hash());
    assert!(report.analyzers_ready);
    assert_eq!(report.languages.len(), 1);
}

#[tokio::test]
async fn file_queries_are_never_suppressed() {
    let project = project(&[(
        "src/lib.fk",
        vec![
            diagnostic(1, Severity::Error, "undefined name"),
            diagnostic(4, Severity::Warning, "unused import"),
        ],
    )])
    .await;
    let (state, _shutdown) = project.control(100);
    let app = router(state);
    let uri = file_uri(&project.path("src/lib.fk"));

    for _ in 0..2 {
        let result: CollectionResult = get_json(&app, &uri).await;
        assert_eq!(result.diagnostics.len(), 2);
        assert_eq!(result.counts.errors, 1);
        assert_eq!(result.summary.as_deref(), Some("1 error, 1 warning"));
        assert_eq!(result.file.as_deref(), Some(project.path("src/lib.fk").as_path()));
    }
}

#[tokio::test]
async fn file_query_needs_an_absolute_path() {
    let project = project(&[("main.fk", Vec::new())]).await;
    let (state, _shutdown) = project.control(100);
    let app = router(state);

    let (status, body) = call(&app, Method::GET, "/diagnostics?file=main.fk").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(String::from_utf8_lossy(&body).contains("absolute"));

    let (status, _) = call(&app, Method::GET, "/diagnostics").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn project_query_reports_once_until_reset() {
    let project = project(&[("main.fk", vec![diagnostic(0, Severity::Error, "type mismatch")])]).await;
    let (state, _shutdown) = project.control(100);
    let app = router(state);

    let first: CollectionResult = get_json(&app, "/diagnostics/all").await;
    assert_eq!(first.diagnostics.len(), 1);
    assert_eq!(first.summary.as_deref(), Some("1 error"));

    let second: CollectionResult = get_json(&app, "/diagnostics/all").await;
    assert!(second.diagnostics.is_empty());
    assert_eq!(second.summary.as_deref(), Some(NO_ISSUES_SUMMARY));

    let third: CollectionResult = get_json(&app, "/diagnostics/all").await;
    assert!(third.diagnostics.is_empty());
    assert_eq!(third.summary, None);

    let (status, _) = call(&app, Method::POST, "/reset-dedup").await;
    assert_eq!(status, StatusCode::OK);
    let again: CollectionResult = get_json(&app, "/diagnostics/all").await;
    assert_eq!(again.diagnostics.len(), 1);
}

#[tokio::test]
async fn requests_over_the_limit_are_refused() {
    let project = project(&[("main.fk", Vec::new())]).await;
    let (state, _shutdown) = project.control(3);
    let app = router(state);
    let uri = file_uri(&project.path("main.fk"));

    let (status, _) = call(&app, Method::GET, "/health").await;
    assert_eq!(status, StatusCode::OK);
    for _ in 0..2 {
        let (status, _) = call(&app, Method::GET, &uri).await;
        assert_eq!(status, StatusCode::OK);
    }
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key(header::RETRY_AFTER));

    let (status, body) = call(&app, Method::POST, "/reset-dedup").await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(String::from_utf8_lossy(&body).contains("rate limit"));
}

#[tokio::test]
async fn shutdown_route_signals_the_daemon() {
    let project = project(&[("main.fk", Vec::new())]).await;
    let (state, shutdown) = project.control(100);
    let app = router(state);

    let (status, _) = call(&app, Method::POST, "/shutdown").await;
    assert_eq!(status, StatusCode::ACCEPTED);
    tokio::time::timeout(Duration::from_secs(1), shutdown.notified())
        .await
        .expect("shutdown was signalled");
}

#[tokio::test]
async fn shutdown_requires_post() {
    let project = project(&[("main.fk", Vec::new())]).await;
    let (state, _shutdown) = project.control(100);
    let app = router(state);

    let (status, _) = call(&app, Method::GET, "/shutdown").await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
}
