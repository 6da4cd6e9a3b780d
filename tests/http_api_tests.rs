//! End-to-end tests of the HTTP dispatch layer over a real store.

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tidepool::http_server::{create_router, AppState};
use tidepool::{Store, StoreConfig};
use tower::util::ServiceExt;

fn test_app() -> (Router, TempDir) {
    let dir = TempDir::new().unwrap();
    let store = Store::open(StoreConfig {
        data_dir: dir.path().to_path_buf(),
        sweep_interval: Duration::from_millis(50),
        ..Default::default()
    })
    .unwrap();
    (create_router(AppState::new(Arc::new(store))), dir)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn set_request(key: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(format!("/set/{}", key))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_set_get_roundtrip() {
    let (app, _dir) = test_app();

    let response = app
        .clone()
        .oneshot(set_request(
            "user:1",
            json!({"value": {"name": "ada"}, "ttl": "10s"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/get/user:1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["key"], "user:1");
    assert_eq!(body["value"], json!({"name": "ada"}));
}

#[tokio::test]
async fn test_query_returns_indexed_keys() {
    let (app, _dir) = test_app();

    for key in ["a", "b"] {
        let response = app
            .clone()
            .oneshot(set_request(
                key,
                json!({"value": 1, "ttl": "10s", "indexes": {"cat": "x"}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    let response = app
        .oneshot(
            Request::builder()
                .uri("/query?index=cat&value=x")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    let mut keys: Vec<String> = body["keys"]
        .as_array()
        .unwrap()
        .iter()
        .map(|k| k.as_str().unwrap().to_string())
        .collect();
    keys.sort();
    assert_eq!(keys, vec!["a", "b"]);
}

#[tokio::test]
async fn test_query_distinguishes_int_from_string() {
    let (app, _dir) = test_app();

    app.clone()
        .oneshot(set_request(
            "int-key",
            json!({"value": 1, "ttl": "10s", "indexes": {"v": 1}}),
        ))
        .await
        .unwrap();
    app.clone()
        .oneshot(set_request(
            "str-key",
            json!({"value": 2, "ttl": "10s", "indexes": {"v": "1"}}),
        ))
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/query?index=v&value=1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["keys"], json!(["int-key"]));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/query?index=v&value=%221%22")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["keys"], json!(["str-key"]));
}

#[tokio::test]
async fn test_query_unknown_index_is_404() {
    let (app, _dir) = test_app();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/query?index=noSuchField&value=x")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delete_then_get_is_404() {
    let (app, _dir) = test_app();

    app.clone()
        .oneshot(set_request("k", json!({"value": 1, "ttl": "10s"})))
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/delete/k")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(Request::builder().uri("/get/k").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delete_absent_key_is_ok() {
    let (app, _dir) = test_app();

    let response = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/delete/never-existed")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_expired_key_is_404() {
    let (app, _dir) = test_app();

    app.clone()
        .oneshot(set_request("gone", json!({"value": 1, "ttl": "20ms"})))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(60)).await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/get/gone")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_zero_ttl_is_400() {
    let (app, _dir) = test_app();

    let response = app
        .oneshot(set_request("k", json!({"value": 1, "ttl": "0s"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_bad_index_value_is_400() {
    let (app, _dir) = test_app();

    let response = app
        .oneshot(set_request(
            "k",
            json!({"value": 1, "ttl": "10s", "indexes": {"flag": true}}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_stats_reflect_traffic() {
    let (app, _dir) = test_app();

    app.clone()
        .oneshot(set_request("k", json!({"value": 1, "ttl": "10s"})))
        .await
        .unwrap();
    app.clone()
        .oneshot(Request::builder().uri("/get/k").body(Body::empty()).unwrap())
        .await
        .unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/stats")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["sets"], 1);
    assert_eq!(body["hits"], 1);
    assert_eq!(body["live_entries"], 1);
}
