mod common;

use automerge::transaction::Transactable;
use automerge::Automerge;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use reach_store::distributed::PEER_ID_HEADER;
use reach_store::http::{BENEFICIARY_HEADER, IDENTITY_HEADER, REACH_HEADER};
use reach_store::sovereignty::SovereigntyMode;
use reach_store::sync::encode_heads;
use reach_store::types::TrustTier;
use reach_store::Manifest;

use common::{build, config, payload};

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    (status, body.to_vec())
}

fn put_blob(bytes: Vec<u8>, owner: &str, reach: &str) -> Request<Body> {
    Request::builder()
        .method(Method::PUT)
        .uri("/blob")
        .header(IDENTITY_HEADER, owner)
        .header(REACH_HEADER, reach)
        .header(header::CONTENT_TYPE, "image/png")
        .body(Body::from(bytes))
        .unwrap()
}

fn get(uri: &str, identity: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(Method::GET).uri(uri);
    if let Some(id) = identity {
        builder = builder.header(IDENTITY_HEADER, id);
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_blob_lifecycle() {
    let test = build(config(SovereigntyMode::Network)).await;
    let app = test.node.router();
    let bytes = payload(50_000, 1);

    let (status, body) = send(&app, put_blob(bytes.clone(), "alice", "commons")).await;
    assert_eq!(status, StatusCode::CREATED);
    let manifest: Manifest = serde_json::from_slice(&body).unwrap();
    assert_eq!(manifest.shard_digests.len(), 7);

    let response = app
        .clone()
        .oneshot(get(&format!("/blob/{}", manifest.digest), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
    let served = hyper::body::to_bytes(response.into_body()).await.unwrap();
    assert_eq!(served.to_vec(), bytes);

    let (status, body) = send(&app, get(&format!("/manifest/{}", manifest.digest), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(serde_json::from_slice::<Manifest>(&body).unwrap(), manifest);

    let delete = |who: &str| {
        Request::builder()
            .method(Method::DELETE)
            .uri(format!("/blob/{}", manifest.digest))
            .header(IDENTITY_HEADER, who)
            .body(Body::empty())
            .unwrap()
    };
    assert_eq!(send(&app, delete("bob")).await.0, StatusCode::FORBIDDEN);
    assert_eq!(send(&app, delete("alice")).await.0, StatusCode::NO_CONTENT);
    let (status, _) = send(&app, get(&format!("/blob/{}", manifest.digest), None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_private_blob_returns_403_without_reason() {
    let test = build(config(SovereigntyMode::Network)).await;
    test.oracle.set_tier("bob", "alice", TrustTier::Family).await;
    let app = test.node.router();
    let bytes = payload(4_000, 2);

    let request = Request::builder()
        .method(Method::PUT)
        .uri("/blob")
        .header(IDENTITY_HEADER, "carol")
        .header(REACH_HEADER, "private")
        .header(BENEFICIARY_HEADER, "alice")
        .body(Body::from(bytes.clone()))
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::CREATED);
    let manifest: Manifest = serde_json::from_slice(&body).unwrap();
    let uri = format!("/blob/{}", manifest.digest);

    let (status, body) = send(&app, get(&uri, Some("bob"))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body, json!({ "error": "forbidden" }));

    let (status, body) = send(&app, get(&uri, Some("alice"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, bytes);
}

#[tokio::test]
async fn test_laptop_answers_403_to_everyone() {
    let test = build(config(SovereigntyMode::Laptop)).await;
    test.oracle.set_tier("bob", "alice", TrustTier::Family).await;
    let app = test.node.router();

    let (status, body) = send(&app, put_blob(payload(2_000, 3), "alice", "commons")).await;
    assert_eq!(status, StatusCode::CREATED);
    let manifest: Manifest = serde_json::from_slice(&body).unwrap();

    for identity in [None, Some("alice"), Some("bob")] {
        let (status, _) = send(&app, get(&format!("/blob/{}", manifest.digest), identity)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }
    let (status, _) = send(&app, get(&format!("/shard/{}", manifest.shard_digests[0]), None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_bad_requests() {
    let test = build(config(SovereigntyMode::Network)).await;
    let app = test.node.router();

    let anonymous = Request::builder()
        .method(Method::PUT)
        .uri("/blob")
        .body(Body::from("data"))
        .unwrap();
    assert_eq!(send(&app, anonymous).await.0, StatusCode::BAD_REQUEST);
    assert_eq!(
        send(&app, put_blob(b"data".to_vec(), "alice", "galactic")).await.0,
        StatusCode::BAD_REQUEST
    );

    let (status, body) = send(&app, put_blob(b"data".to_vec(), "alice", "commons")).await;
    assert_eq!(status, StatusCode::CREATED);
    let manifest: Manifest = serde_json::from_slice(&body).unwrap();
    assert_eq!(
        send(&app, put_blob(b"data".to_vec(), "alice", "regional")).await.0,
        StatusCode::CONFLICT
    );
    let (status, _) = send(&app, get(&format!("/blob/{}", manifest.digest), None)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_shard_endpoints() {
    let test = build(config(SovereigntyMode::Network)).await;
    let app = test.node.router();
    let shard = b"a custodial shard".to_vec();
    let digest = reach_store::crypto::CryptoUtils::content_hash(&shard);

    let head = |digest: &str| {
        Request::builder()
            .method(Method::HEAD)
            .uri(format!("/shard/{}", digest))
            .body(Body::empty())
            .unwrap()
    };
    assert_eq!(send(&app, head(&digest)).await.0, StatusCode::NOT_FOUND);

    let wrong = Request::builder()
        .method(Method::PUT)
        .uri(format!("/shard/{}", digest))
        .header(PEER_ID_HEADER, "node-b")
        .body(Body::from("not the same bytes"))
        .unwrap();
    assert_eq!(send(&app, wrong).await.0, StatusCode::BAD_REQUEST);

    let push = Request::builder()
        .method(Method::PUT)
        .uri(format!("/shard/{}", digest))
        .header(PEER_ID_HEADER, "node-b")
        .body(Body::from(shard.clone()))
        .unwrap();
    assert_eq!(send(&app, push).await.0, StatusCode::CREATED);
    assert_eq!(send(&app, head(&digest)).await.0, StatusCode::OK);

    let fetch = Request::builder()
        .method(Method::GET)
        .uri(format!("/shard/{}", digest))
        .header(PEER_ID_HEADER, "node-b")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, fetch).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, shard);
}

#[tokio::test]
async fn test_shard_release_and_budget() {
    let mut cfg = config(SovereigntyMode::Network);
    cfg.high_water_bytes = 40;
    cfg.low_water_bytes = 0;
    let test = build(cfg).await;
    let app = test.node.router();

    let shard_request = |method: Method, digest: &str, peer: &str, body: Vec<u8>| {
        Request::builder()
            .method(method)
            .uri(format!("/shard/{}", digest))
            .header(PEER_ID_HEADER, peer)
            .body(Body::from(body))
            .unwrap()
    };
    let first = vec![7u8; 30];
    let first_digest = reach_store::crypto::CryptoUtils::content_hash(&first);
    let second = vec![9u8; 20];
    let second_digest = reach_store::crypto::CryptoUtils::content_hash(&second);

    let push = shard_request(Method::PUT, &first_digest, "node-b", first.clone());
    assert_eq!(send(&app, push).await.0, StatusCode::CREATED);

    // 30 + 20 bytes is over the 40 byte budget
    let push = shard_request(Method::PUT, &second_digest, "node-b", second.clone());
    let (status, body) = send(&app, push).await;
    assert_eq!(status, StatusCode::INSUFFICIENT_STORAGE);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert!(body["error"].as_str().unwrap().contains("storage"));

    // Only the placing node may release its shard
    let release = shard_request(Method::DELETE, &first_digest, "node-c", Vec::new());
    assert_eq!(send(&app, release).await.0, StatusCode::FORBIDDEN);
    let release = shard_request(Method::DELETE, &first_digest, "node-b", Vec::new());
    assert_eq!(send(&app, release).await.0, StatusCode::NO_CONTENT);
    let release = shard_request(Method::DELETE, &first_digest, "node-b", Vec::new());
    assert_eq!(send(&app, release).await.0, StatusCode::NOT_FOUND);
    assert_eq!(test.node.store().used_bytes(), 0);

    let push = shard_request(Method::PUT, &second_digest, "node-b", second);
    assert_eq!(send(&app, push).await.0, StatusCode::CREATED);
}

#[tokio::test]
async fn test_health_reports_usage() {
    let test = build(config(SovereigntyMode::HomeNode)).await;
    let app = test.node.router();
    send(&app, put_blob(payload(1_000, 4), "alice", "local")).await;

    let (status, body) = send(&app, get("/health", None)).await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["sovereignty"], "home_node");
    assert_eq!(body["blobs"], 1);
    assert!(body["used_bytes"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn test_document_endpoints() {
    let test = build(config(SovereigntyMode::HomeCluster)).await;
    let app = test.node.router();

    let mut doc = Automerge::new();
    let mut tx = doc.transaction();
    tx.put(automerge::ROOT, "title", "minutes").unwrap();
    tx.commit();
    let heads = encode_heads(&doc.get_heads());
    let changes = json!({
        "changes": [hex::encode(doc.save_after(&[]))],
        "heads": heads,
    });

    let post = |identity: &str| {
        Request::builder()
            .method(Method::POST)
            .uri("/docs/notes/meeting-1/changes")
            .header(IDENTITY_HEADER, identity)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(changes.to_string()))
            .unwrap()
    };
    assert_eq!(send(&app, post("mallory")).await.0, StatusCode::FORBIDDEN);

    let (status, body) = send(&app, post("carol")).await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["heads"], json!(heads));

    let (status, body) = send(&app, get("/docs/notes/meeting-1/heads", Some("alice"))).await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["heads"], json!(heads));

    let uri = format!("/docs/notes/meeting-1/changes?have={}", heads.join(","));
    let (status, body) = send(&app, get(&uri, Some("alice"))).await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["changes"], json!([]));

    let (status, body) = send(&app, get("/docs/notes", Some("bob"))).await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["total"], 1);
    assert_eq!(body["documents"][0]["doc_id"], "meeting-1");

    let (status, _) = send(&app, get("/docs/notes/missing/heads", Some("alice"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let remove = Request::builder()
        .method(Method::DELETE)
        .uri("/docs/notes/meeting-1")
        .header(IDENTITY_HEADER, "alice")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app, remove).await.0, StatusCode::NO_CONTENT);
    let (status, _) = send(&app, get("/docs/notes/meeting-1", Some("alice"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
