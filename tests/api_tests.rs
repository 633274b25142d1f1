use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use recon_sched::config::Config;
use recon_sched::seed::Seed;
use recon_sched::server::{router, AppState};
use recon_sched::store::{MemoryStore, ScheduleStore};

const SEED: &str = r#"{
    "agents": [
        {"name": "edge-1", "api_token": "edge-1-token"},
        {"name": "edge-2", "api_token": "edge-2-token"}
    ],
    "scan_commands": [{"binary": "nmap", "name": "service-scan", "command": "-sV --top-ports 1000"}],
    "sites": [{
        "name": "branch office",
        "targets": "198.51.100.0/30 vpn.example.net",
        "excluded_targets": "198.51.100.3",
        "scan_command": "service-scan",
        "agent": "edge-1"
    }],
    "scans": [{
        "site": "branch office",
        "name": "nightly",
        "start_time": "00:00",
        "recurrence": {"dtstart": "2024-01-01", "rules": [{"frequency": "daily"}]}
    }]
}"#;

fn app() -> (Router, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let seed: Seed = serde_json::from_str(SEED).expect("seed json");
    seed.apply(&*store, true).expect("seed applies");
    let shared: Arc<dyn ScheduleStore> = store.clone();
    let state = AppState::new(shared, Arc::new(Config::default()));
    (router(state), store)
}

fn post(uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
    let mut req = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        req = req.header(header::AUTHORIZATION, format!("Token {token}"));
    }
    req.body(Body::from(body.to_string())).unwrap()
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

async fn materialize_first_two_days(app: &Router) -> Value {
    let (status, report) = send(
        app,
        post(
            "/api/materialize",
            None,
            json!({"start": "2024-01-01T00:00:00Z", "end": "2024-01-03T00:00:00Z"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    report
}

#[tokio::test]
async fn health_is_public() {
    let (app, _) = app();
    let req = Request::builder().uri("/api/health").body(Body::empty()).unwrap();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn unknown_or_missing_token_is_unauthorized() {
    let (app, _) = app();
    let (status, _) = send(&app, post("/api/checkin", Some("nope"), json!({}))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = send(&app, post("/api/claim", None, json!({}))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn checkin_records_timestamp() {
    let (app, store) = app();
    let (status, body) = send(&app, post("/api/checkin", Some("edge-1-token"), json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "edge-1");
    let agent = store.agent_by_token("edge-1-token").unwrap();
    assert!(agent.last_checkin.is_some());
}

#[tokio::test]
async fn materialize_then_claim_then_report() {
    let (app, _) = app();
    let report = materialize_first_two_days(&app).await;
    assert_eq!(report["created"].as_array().unwrap().len(), 2);
    assert_eq!(report["created"][0]["targets"], "198.51.100.0/31 198.51.100.2 vpn.example.net");
    assert_eq!(report["created"][0]["scan_status"], "pending");

    let again = materialize_first_two_days(&app).await;
    assert_eq!(again["created"].as_array().unwrap().len(), 0);
    assert_eq!(again["duplicates"], 2);

    // edge-2 has no sites, so nothing to claim.
    let (status, body) = send(&app, post("/api/claim", Some("edge-2-token"), json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));

    let (status, claimed) = send(&app, post("/api/claim", Some("edge-1-token"), json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    let claimed = claimed.as_array().unwrap().clone();
    assert_eq!(claimed.len(), 2);
    assert!(claimed.iter().all(|row| row["scan_status"] == "started"));
    assert_eq!(claimed[0]["scan_binary"], "nmap");
    assert_eq!(claimed[0]["scan_command"], "-sV --top-ports 1000");

    let first = claimed[0]["id"].as_u64().unwrap();
    let second = claimed[1]["id"].as_u64().unwrap();

    let (status, _) = send(&app, post("/api/claim", Some("edge-1-token"), json!({}))).await;
    assert_eq!(status, StatusCode::OK);

    let complete = format!("/api/scheduled/{first}/complete");
    let (status, _) = send(
        &app,
        post(&complete, Some("edge-2-token"), json!({"result_file_base_name": "branch"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, row) = send(
        &app,
        post(
            &complete,
            Some("edge-1-token"),
            json!({"result_file_base_name": "branch_20240101", "completed_time": "2024-01-01T00:42:00Z"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(row["scan_status"], "completed");
    assert_eq!(row["result_file_base_name"], "branch_20240101");

    let (status, _) = send(
        &app,
        post(&complete, Some("edge-1-token"), json!({"result_file_base_name": "again"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, row) = send(
        &app,
        post(
            &format!("/api/scheduled/{second}/error"),
            Some("edge-1-token"),
            json!({"reason": "nmap exited with status 1"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(row["scan_status"], "error");
    assert_eq!(row["error_reason"], "nmap exited with status 1");
}

#[tokio::test]
async fn bad_reports_are_rejected() {
    let (app, _) = app();
    let (status, _) = send(
        &app,
        post(
            "/api/scheduled/4242/complete",
            Some("edge-1-token"),
            json!({"result_file_base_name": "x"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    materialize_first_two_days(&app).await;
    let (_, claimed) = send(&app, post("/api/claim", Some("edge-1-token"), json!({}))).await;
    let id = claimed[0]["id"].as_u64().unwrap();
    let (status, body) = send(
        &app,
        post(
            &format!("/api/scheduled/{id}/complete"),
            Some("edge-1-token"),
            json!({"result_file_base_name": "../etc/passwd"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"].as_str().unwrap().contains("result_file_base_name"));
}

#[tokio::test]
async fn inverted_horizon_is_unprocessable() {
    let (app, _) = app();
    let (status, _) = send(
        &app,
        post(
            "/api/materialize",
            None,
            json!({"start": "2024-01-03T00:00:00Z", "end": "2024-01-01T00:00:00Z"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn horizon_past_the_calendar_end_is_unprocessable() {
    let (app, store) = app();
    let (status, body) = send(
        &app,
        post("/api/materialize", None, json!({"start": "9999-12-31T23:00:00Z"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"].as_str().unwrap().contains("out of range"));

    let (status, _) = send(
        &app,
        post(
            "/api/materialize",
            None,
            json!({"start": "2024-01-01T00:00:00Z", "end": "2030-01-01T00:00:00Z"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(store.scheduled_with_status(recon_sched::types::ScanStatus::Pending).unwrap().is_empty());
}
