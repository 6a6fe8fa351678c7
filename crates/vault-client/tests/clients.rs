use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use serde_json::json;
use vault_client::{ClientError, NodeClient, OperatorClient};
use vault_protocol::ConfigKind;

async fn spawn(app: Router) -> (SocketAddr, tokio::task::JoinHandle<()>) {
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
async fn node_health_decodes_v1_envelope() {
    let app = Router::new().route(
        "/health",
        get(|| async {
            Json(json!({
                "schema": "vault/NodeHealth@1",
                "node_id": "ks-1",
                "kinds": {
                    "proxy-auth": {"applied": {"seq": 4, "at_ms": 10}, "entries": 3}
                }
            }))
        }),
    );
    let (addr, server) = spawn(app).await;

    let client = NodeClient::new(Duration::from_secs(2)).expect("client");
    let health = client
        .health(&format!("http://{addr}/health"))
        .await
        .expect("health");
    assert_eq!(health.node_id, "ks-1");
    let kind = ConfigKind::new("proxy-auth").unwrap();
    assert_eq!(health.kinds[&kind].applied_seq(), Some(4));
    assert_eq!(health.kinds[&kind].entries, 3);

    server.abort();
}

#[tokio::test]
async fn node_health_times_out_on_slow_node() {
    let app = Router::new().route(
        "/health",
        get(|| async {
            tokio::time::sleep(Duration::from_secs(3)).await;
            Json(json!({"schema": "vault/NodeHealth@1", "node_id": "slow"}))
        }),
    );
    let (addr, server) = spawn(app).await;

    let client = NodeClient::new(Duration::from_millis(200)).expect("client");
    let err = client
        .health(&format!("http://{addr}/health"))
        .await
        .expect_err("timeout");
    assert!(matches!(err, ClientError::Timeout { .. }), "got {err:?}");
    assert!(err.is_transient());

    server.abort();
}

#[tokio::test]
async fn node_health_rejects_unknown_schema() {
    let app = Router::new().route(
        "/health",
        get(|| async { Json(json!({"schema": "other/Thing@1"})) }),
    );
    let (addr, server) = spawn(app).await;

    let client = NodeClient::new(Duration::from_secs(2)).expect("client");
    let err = client
        .health(&format!("http://{addr}/health"))
        .await
        .expect_err("decode error");
    assert!(matches!(err, ClientError::Decode { .. }));
    assert!(!err.is_transient());

    server.abort();
}

#[tokio::test]
async fn refused_connection_is_transient() {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let client = NodeClient::new(Duration::from_millis(500)).expect("client");
    let err = client
        .health(&format!("http://{addr}/health"))
        .await
        .expect_err("refused");
    assert!(err.is_transient(), "got {err:?}");
}

#[tokio::test]
async fn operator_reset_sends_bearer_token() {
    let resets = Arc::new(AtomicUsize::new(0));
    let counter = resets.clone();
    let app = Router::new()
        .route(
            "/ops/v1/reset",
            post(move |headers: HeaderMap| {
                let counter = counter.clone();
                async move {
                    let auth = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    if auth != "Bearer s3cret" {
                        return StatusCode::UNAUTHORIZED;
                    }
                    counter.fetch_add(1, Ordering::SeqCst);
                    StatusCode::NO_CONTENT
                }
            }),
        )
        .route(
            "/ops/v1/health",
            get(|| async {
                Json(json!({"services": [
                    {"name": "proxy", "healthy": true},
                    {"name": "keyserver-1", "healthy": true}
                ]}))
            }),
        );
    let (addr, server) = spawn(app).await;

    let client = OperatorClient::new(
        &format!("http://{addr}/ops"),
        Some("s3cret".into()),
        Duration::from_secs(2),
    )
    .expect("client");
    client.reset().await.expect("reset");
    assert_eq!(resets.load(Ordering::SeqCst), 1);
    assert!(client.health().await.expect("health").all_healthy());

    let anonymous =
        OperatorClient::new(&format!("http://{addr}/ops"), None, Duration::from_secs(2))
            .expect("client");
    let err = anonymous.reset().await.expect_err("unauthorized");
    assert!(matches!(err, ClientError::Status { status: 401, .. }));

    server.abort();
}

#[tokio::test]
async fn slow_reset_outlasts_the_health_timeout() {
    let app = Router::new()
        .route(
            "/v1/reset",
            post(|| async {
                tokio::time::sleep(Duration::from_millis(400)).await;
                StatusCode::NO_CONTENT
            }),
        )
        .route(
            "/v1/health",
            get(|| async {
                tokio::time::sleep(Duration::from_millis(400)).await;
                Json(json!({"services": []}))
            }),
        );
    let (addr, server) = spawn(app).await;

    let client = OperatorClient::new(&format!("http://{addr}"), None, Duration::from_secs(5))
        .expect("client")
        .with_health_timeout(Duration::from_millis(100));
    client.reset().await.expect("reset within the recovery budget");
    let err = client.health().await.expect_err("health probe is bounded");
    assert!(matches!(err, ClientError::Timeout { .. }), "got {err:?}");

    server.abort();
}
