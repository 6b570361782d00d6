use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Method, Request, StatusCode},
    Router,
};
use http_scan_jobs::engine::ScanEngine;
use http_scan_jobs::events::BroadcastPublisher;
use http_scan_jobs::server::{router, AppState};
use http_scan_jobs::settings::RuntimeSettings;
use http_scan_jobs::store::MemoryStore;
use http_scan_jobs::types::{Scan, ScanState, Severity, TemplateResult};
use http_scan_jobs::worker::Worker;
use serde_json::{json, Value};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

struct OneMatch;

#[async_trait]
impl Worker for OneMatch {
    async fn execute(
        &self,
        _scan: &Scan,
        _cancel: CancellationToken,
    ) -> anyhow::Result<Vec<TemplateResult>> {
        Ok(vec![TemplateResult {
            id: 0,
            template_id: "server-banner".into(),
            template_name: "Server header discloses software".into(),
            severity: Severity::Info,
            matched: true,
            status_code: Some("200".into()),
            error: None,
            checked_at: OffsetDateTime::now_utc(),
        }])
    }
}

fn app() -> Router {
    let settings = Arc::new(RuntimeSettings::new(5_000));
    let events = BroadcastPublisher::default();
    let engine = ScanEngine::new(
        Arc::new(MemoryStore::new()),
        settings.clone(),
        Arc::new(OneMatch),
        Arc::new(events.clone()),
    );
    router(AppState::new(engine, settings, events))
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let req = match body {
        Some(v) => builder
            .header("content-type", "application/json")
            .body(Body::from(v.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn new_scan_body() -> Value {
    json!({
        "name": "api",
        "target": { "request": "GET / HTTP/1.1", "host": "app.test", "port": 8080 }
    })
}

#[tokio::test]
async fn create_then_fetch_scan() {
    let app = app();
    let (status, created) = call(&app, Method::POST, "/api/scans", Some(new_scan_body())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["id"], 1);
    assert_eq!(created["state"], "pending");
    assert_eq!(created["target"]["tls"], false);

    let (status, fetched) = call(&app, Method::GET, "/api/scans/1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched, created);

    let (status, list) = call(&app, Method::GET, "/api/scans", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn error_statuses() {
    let app = app();
    let (status, body) = call(&app, Method::GET, "/api/scans/42", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("42"));

    let bad = json!({ "target": { "request": "GET", "host": "h" } });
    let (status, _) = call(&app, Method::POST, "/api/scans", Some(bad)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(&app, Method::POST, "/api/scans/7/run", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(&app, Method::POST, "/api/scans/7/cancel", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn run_is_accepted_and_completes_in_background() {
    let app = app();
    call(&app, Method::POST, "/api/scans", Some(new_scan_body())).await;

    let (status, started) = call(&app, Method::POST, "/api/scans/1/run", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(started["state"], "running");

    let mut scan = Value::Null;
    for _ in 0..100 {
        let (_, current) = call(&app, Method::GET, "/api/scans/1", None).await;
        if current["state"] == "completed" {
            scan = current;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(scan["state"], "completed");
    assert!(scan["finished_at"].is_string());

    let (status, results) = call(&app, Method::GET, "/api/scans/1/results", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(results[0]["id"], 1);
    assert_eq!(results[0]["matched"], true);

    let (status, one) = call(&app, Method::GET, "/api/scans/1/results/1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(one["template_id"], "server-banner");

    let (status, _) = call(&app, Method::GET, "/api/scans/1/results/9", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = call(&app, Method::POST, "/api/scans/1/cancel", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cancelled"], false);

    let (status, rerun) = call(&app, Method::POST, "/api/scans/1/rerun", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(rerun["id"], 2);
    assert_eq!(rerun["name"], "api");
}

#[tokio::test]
async fn patch_updates_name_and_target() {
    let app = app();
    call(&app, Method::POST, "/api/scans", Some(new_scan_body())).await;

    let patch = json!({ "name": "renamed" });
    let (status, updated) = call(&app, Method::PATCH, "/api/scans/1", Some(patch)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["name"], "renamed");
    assert_eq!(updated["target"]["host"], "app.test");
}

#[tokio::test]
async fn delete_and_clear() {
    let app = app();
    call(&app, Method::POST, "/api/scans", Some(new_scan_body())).await;
    call(&app, Method::POST, "/api/scans", Some(new_scan_body())).await;

    let (status, _) = call(&app, Method::DELETE, "/api/scans/1", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = call(&app, Method::DELETE, "/api/scans/1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(&app, Method::DELETE, "/api/scans", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (_, list) = call(&app, Method::GET, "/api/scans", None).await;
    assert_eq!(list, json!([]));
}

#[tokio::test]
async fn settings_round_trip_and_reject_zero() {
    let app = app();
    let (status, body) = call(&app, Method::GET, "/api/settings", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "scan_timeout_ms": 5000 }));

    let (status, _) = call(
        &app,
        Method::PUT,
        "/api/settings",
        Some(json!({ "scan_timeout_ms": 250 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = call(&app, Method::GET, "/api/settings", None).await;
    assert_eq!(body["scan_timeout_ms"], 250);

    let (status, _) = call(
        &app,
        Method::PUT,
        "/api/settings",
        Some(json!({ "scan_timeout_ms": 0 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
