//! The assembled controller's REST surface, driven in-process.

mod common;

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tokio::sync::watch;
use tower::ServiceExt;

use corral_health::ProbeTable;

use common::cluster;

async fn call(router: &axum::Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    let req = match body {
        Some(v) => builder.body(Body::from(serde_json::to_vec(&v).unwrap())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn healthz_reports_leadership() {
    let fx = cluster(1, ProbeTable::default()).await;
    let (status, body) = call(&fx.controller.router(), "GET", "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["node_id"], "ctl-test");
    assert_eq!(body["data"]["leader"], true);
}

#[tokio::test]
async fn submitted_topology_reaches_ready_instances() {
    let fx = cluster(3, ProbeTable::default()).await;
    let router = fx.controller.router();

    let (status, _) = call(
        &router,
        "POST",
        "/api/v1/topology",
        Some(json!({ "roles": { "coordination-replica": { "count": 3 } } })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    fx.converge().await;

    let (status, body) = call(&router, "GET", "/api/v1/instances", None).await;
    assert_eq!(status, StatusCode::OK);
    let instances = body["data"].as_array().unwrap();
    assert_eq!(instances.len(), 3);
    assert!(instances.iter().all(|i| i["state"] == "ready"));
    assert!(instances.iter().all(|i| i["role"] == "coordination-replica"));

    let (status, body) = call(&router, "GET", "/api/v1/members", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn tasks_flow_through_the_controller_queue() {
    let fx = cluster(1, ProbeTable::default()).await;
    let router = fx.controller.router();

    let (status, body) = call(
        &router,
        "POST",
        "/api/v1/queues/reindex/tasks",
        Some(json!({ "shard": 7 })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let (_, body) = call(&router, "POST", "/api/v1/queues/reindex/claim", Some(json!({}))).await;
    assert_eq!(body["data"][0]["id"], id.as_str());
    assert_eq!(body["data"][0]["payload"]["shard"], 7);

    let (status, _) = call(&router, "POST", &format!("/api/v1/queues/reindex/ack/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = call(&router, "GET", "/api/v1/queues/reindex", None).await;
    assert_eq!(body["data"]["ready"], 0);
    assert_eq!(body["data"]["in_flight"], 0);
}

#[tokio::test]
async fn background_loops_stop_on_shutdown() {
    let fx = cluster(2, ProbeTable::default()).await;
    let (tx, rx) = watch::channel(false);
    let handles = fx.controller.spawn(rx).await;
    assert!(!handles.is_empty());

    tokio::time::sleep(Duration::from_millis(50)).await;
    tx.send(true).unwrap();

    for handle in handles {
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop did not stop")
            .unwrap();
    }
}
