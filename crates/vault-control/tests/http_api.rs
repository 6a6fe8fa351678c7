mod common;

use std::net::SocketAddr;
use std::sync::atomic::Ordering;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::Value;
use tower::ServiceExt;
use vault_control::http::{HttpState, router};
use vault_control::{Environment, Task};
use vault_protocol::api::TaskSource;

use common::{Harness, HarnessOptions, auth};

async fn call(h: &Harness, method: &str, uri: &str) -> (StatusCode, Value) {
    let app = router(HttpState::new(h.control.clone()));
    let response = app
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

async fn spawn(h: &Harness) -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let app = router(HttpState::new(h.control.clone()));
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
        .await
        .expect("bind listener");
    let addr = listener.local_addr().expect("local addr");
    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (addr, server)
}

#[tokio::test]
async fn health_lists_every_kind() {
    let h = Harness::new(&[]);
    h.publish_n(&auth(), 2).await;
    let (status, body) = call(&h, "GET", "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    let kinds = body["kinds"].as_array().unwrap();
    assert_eq!(kinds.len(), 2);
    let auth_row = kinds.iter().find(|k| k["kind"] == "proxy-auth").unwrap();
    assert_eq!(auth_row["published_seq"], 2);
    assert_eq!(auth_row["has_pending"], false);
}

#[tokio::test]
async fn sync_all_waits_or_accepts() {
    let h = Harness::new(&[]);
    let (addr, server) = spawn(&h).await;
    let client = reqwest::Client::new();

    h.control.request_publish(&auth(), TaskSource::Internal).unwrap();
    let response = client
        .post(format!("http://{addr}/queue/sync-all?source=periodic"))
        .send()
        .await
        .expect("post");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: Value = response.json().await.expect("decode json");
    assert_eq!(body["task"], "publish-all");
    assert_eq!(body["completed"], true);
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    let auth_result = results.iter().find(|r| r["kind"] == "proxy-auth").unwrap();
    assert_eq!(auth_result["published_seq"], 1);
    assert_eq!(auth_result["outcome"], "published");

    let response = client
        .post(format!("http://{addr}/queue/sync-all?async=true"))
        .send()
        .await
        .expect("post");
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);
    let body: Value = response.json().await.expect("decode json");
    assert_eq!(body["completed"], false);
    assert_eq!(body["source"], "interactive");
    assert!(body.get("results").is_none());

    server.abort();
    let _ = server.await;
}

#[tokio::test]
async fn malformed_query_is_rejected_with_field_errors() {
    let h = Harness::new(&[]);
    let (status, body) = call(&h, "POST", "/queue/sync-all?source=cron&async=maybe").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_request");
    let fields: Vec<_> = body["fields"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["field"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(fields, vec!["source", "async"]);
    assert!(h.control.in_flight().is_empty());
    assert_eq!(h.builder.builds(), 0);
}

#[tokio::test]
async fn publish_route_validates_kind() {
    let h = Harness::new(&[]);
    let (status, body) = call(&h, "POST", "/queue/publish/billing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "unknown_kind");

    let (status, body) = call(&h, "POST", "/queue/publish/Proxy_Auth").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["fields"][0]["field"], "kind");

    let (status, body) = call(&h, "POST", "/queue/publish/proxy-auth").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["results"][0]["published_seq"], 1);

    let (status, body) = call(&h, "GET", "/sync/proxy-auth").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["current_seq"], 1);
    assert_eq!(body["synced"], false);
}

#[tokio::test]
async fn fleet_views_report_polled_nodes() {
    let h = Harness::new(&["a", "b"]);
    h.publish_n(&auth(), 1).await;
    h.fleet.apply_all(&auth(), 1);
    let (status, _) = call(&h, "POST", "/queue/poll").await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(&h, "GET", "/sync/overview").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["synced"], true);
    assert_eq!(body["drift_detected"], false);
    assert_eq!(body["nodes"].as_array().unwrap().len(), 2);

    let (status, body) = call(&h, "GET", "/lm/status").await;
    assert_eq!(status, StatusCode::OK);
    let nodes = body["nodes"].as_array().unwrap();
    let a = nodes.iter().find(|n| n["node_id"] == "a").unwrap();
    let auth_detail = a["kinds"]
        .as_array()
        .unwrap()
        .iter()
        .find(|k| k["kind"] == "proxy-auth")
        .unwrap();
    assert_eq!(auth_detail["applied_seq"], 1);
}

#[tokio::test]
async fn overview_is_unavailable_after_failed_recovery() {
    let h = Harness::new(&["a"]);
    h.publish_n(&auth(), 1).await;
    h.fleet.set_applied("a", &auth(), 4);
    h.operator.fail_reset.store(true, Ordering::SeqCst);

    let (status, body) = call(&h, "POST", "/queue/poll").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "drift_recovery_failed");

    let (status, body) = call(&h, "GET", "/sync/overview").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "drift_recovery_failed");

    h.operator.fail_reset.store(false, Ordering::SeqCst);
    let (status, body) = call(&h, "POST", "/queue/recover").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["republished"].as_array().unwrap().len(), 2);
    let (status, _) = call(&h, "GET", "/sync/overview").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn recover_is_refused_in_production() {
    let h = Harness::with_options(
        &["a"],
        HarnessOptions {
            environment: Environment::Production,
            ..HarnessOptions::default()
        },
    );
    let (status, body) = call(&h, "POST", "/queue/recover").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "recovery_disabled");
    assert_eq!(h.operator.resets(), 0);
}

#[tokio::test]
async fn kind_status_reports_drift_as_unsynced() {
    let h = Harness::with_options(
        &["a"],
        HarnessOptions {
            environment: Environment::Production,
            ..HarnessOptions::default()
        },
    );
    h.publish_n(&auth(), 3).await;
    h.fleet.set_applied("a", &auth(), 9);
    let (status, _) = call(&h, "POST", "/queue/poll").await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(&h, "GET", "/sync/proxy-auth").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["current_seq"], 3);
    assert_eq!(body["max_applied_seq"], 9);
    assert_eq!(body["synced"], false);
}

#[tokio::test]
async fn notifications_can_be_acknowledged() {
    let h = Harness::new(&["a"]);
    h.publish_n(&auth(), 1).await;
    h.fleet.fail_apply("a", &auth(), 1, "bad entry");
    h.control
        .run(Task::PollFleet, TaskSource::Internal)
        .await
        .unwrap();

    let (status, body) = call(&h, "GET", "/notifications").await;
    assert_eq!(status, StatusCode::OK);
    let open = body.as_array().unwrap();
    assert_eq!(open.len(), 1);
    let id = open[0]["id"].as_i64().unwrap();

    let (status, _) = call(&h, "POST", &format!("/notifications/{id}/ack")).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (_, body) = call(&h, "GET", "/notifications").await;
    assert!(body.as_array().unwrap().is_empty());
    let (_, body) = call(&h, "GET", "/notifications?all=true").await;
    assert_eq!(body.as_array().unwrap().len(), 1);

    let (status, body) = call(&h, "POST", &format!("/notifications/{id}/ack")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "unknown_notification");
    let (status, body) = call(&h, "POST", "/notifications/latest/ack").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["fields"][0]["field"], "id");
}

#[tokio::test]
async fn openapi_document_is_served() {
    let h = Harness::new(&[]);
    let (status, body) = call(&h, "GET", "/api/openapi.json").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["paths"]["/queue/sync-all"].is_object());
}
