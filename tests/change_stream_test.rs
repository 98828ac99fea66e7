//! Change-stream workers, sessions and the WebSocket endpoint
//!
//! Tests verify that:
//! - Concurrent attaches for one key share a single worker
//! - Every session receives each event exactly once
//! - A worker deregisters once its last session closes
//! - The WebSocket endpoint streams rendered events
//! - Dropping a collection closes its streams
//! - A client reconnecting right after closing gets a live worker
//! - Updating a collection's streams redefines them for new sessions

mod common;

use restpipe::changestream::{
    ChangeEvent, ChangeStreamDefinition, ChangeStreamWorkerKey, ChangeStreamWorkers, JsonMode,
    MemoryChangeSource, MpscSessionChannel, SessionMessage,
};
use restpipe::config::{Config, ProxyMount};
use restpipe::gateway::Gateway;
use restpipe::metrics::Metrics;
use restpipe::web;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use warp::Filter;

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

fn workers() -> (Arc<MemoryChangeSource>, Arc<ChangeStreamWorkers>, Arc<Metrics>) {
    let source = Arc::new(MemoryChangeSource::default());
    let metrics = Arc::new(Metrics::new());
    let workers = ChangeStreamWorkers::new(source.clone(), Duration::from_millis(20), metrics.clone());
    (source, workers, metrics)
}

fn key() -> ChangeStreamWorkerKey {
    ChangeStreamWorkerKey::new("/shop/orders/_streams/all", json!({}), JsonMode::Relaxed)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_attaches_share_one_worker() {
    let (source, workers, metrics) = workers();

    let mut tasks = Vec::new();
    let mut receivers = Vec::new();
    for _ in 0..16 {
        let (channel, rx) = MpscSessionChannel::new(8);
        receivers.push(rx);
        let workers = workers.clone();
        tasks.push(tokio::spawn(async move {
            workers.attach(&key(), &[], "shop", "orders", Arc::new(channel))
        }));
    }

    let mut handles = Vec::new();
    for task in tasks {
        handles.push(task.await.unwrap());
    }

    assert_eq!(workers.len(), 1);
    let worker = handles[0].worker().clone();
    assert!(handles.iter().all(|h| Arc::ptr_eq(h.worker(), &worker)));
    assert_eq!(worker.session_count(), 16);
    assert_eq!(metrics.change_stream_workers.get(), 1);

    eventually(|| source.subscriber_count("shop", "orders") == 1).await;
    for handle in &handles {
        handle.close();
    }
    eventually(|| workers.is_empty()).await;
}

#[tokio::test]
async fn test_each_session_receives_event_once() {
    let (source, workers, _metrics) = workers();
    let (first, mut first_rx) = MpscSessionChannel::new(8);
    let (second, mut second_rx) = MpscSessionChannel::new(8);

    let a = workers.attach(&key(), &[], "shop", "orders", Arc::new(first));
    let b = workers.attach(&key(), &[], "shop", "orders", Arc::new(second));
    eventually(|| source.subscriber_count("shop", "orders") == 1).await;

    source.publish("shop", "orders", ChangeEvent::insert(json!({"_id": 1, "total": 42})));

    for rx in [&mut first_rx, &mut second_rx] {
        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let SessionMessage::Text(text) = message;
        let doc: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(doc["operationType"], "insert");
        assert_eq!(doc["fullDocument"]["total"], 42);
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(first_rx.try_recv().is_err());
    assert!(second_rx.try_recv().is_err());

    a.close();
    b.close();
}

#[tokio::test]
async fn test_worker_deregisters_after_last_session_closes() {
    let (source, workers, metrics) = workers();
    let (first, _first_rx) = MpscSessionChannel::new(8);
    let (second, _second_rx) = MpscSessionChannel::new(8);

    let a = workers.attach(&key(), &[], "shop", "orders", Arc::new(first));
    let b = workers.attach(&key(), &[], "shop", "orders", Arc::new(second));
    eventually(|| source.subscriber_count("shop", "orders") == 1).await;

    a.close();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(workers.len(), 1);
    assert!(!b.worker().is_terminated());

    b.close();
    eventually(|| workers.is_empty()).await;
    eventually(|| source.subscriber_count("shop", "orders") == 0).await;
    assert_eq!(metrics.change_stream_workers.get(), 0);
}

fn stream_config() -> Config {
    Config {
        change_streams: restpipe::config::ChangeStreamsConfig {
            streams: vec![ChangeStreamDefinition {
                db: "shop".to_string(),
                coll: "orders".to_string(),
                uri: "byStatus".to_string(),
                stages: vec![json!({"$match": {"fullDocument.status": {"$var": "status"}}})],
            }],
            ..Default::default()
        },
        ..Config::default()
    }
}

fn stream_gateway(config: Config) -> (Arc<MemoryChangeSource>, Arc<Gateway>) {
    let source = Arc::new(MemoryChangeSource::default());
    let gateway = Gateway::builder(config)
        .change_source(source.clone())
        .build()
        .unwrap();
    (source, Arc::new(gateway))
}

#[tokio::test]
async fn test_websocket_streams_rendered_events() {
    let (source, gateway) = stream_gateway(stream_config());
    let routes = web::routes(gateway.clone());

    let mut client = warp::test::ws()
        .path("/shop/orders/_streams/byStatus?avars=%7B%22status%22%3A%22paid%22%7D")
        .handshake(routes)
        .await
        .unwrap();

    eventually(|| source.subscriber_count("shop", "orders") == 1).await;
    assert_eq!(gateway.workers().len(), 1);

    source.publish("shop", "orders", ChangeEvent::insert(json!({"_id": 7, "status": "paid"})));

    let message = tokio::time::timeout(Duration::from_secs(5), client.recv())
        .await
        .unwrap()
        .unwrap();
    let doc: Value = serde_json::from_str(message.to_str().unwrap()).unwrap();
    assert_eq!(doc["documentKey"], json!({"_id": 7}));

    drop(client);
    eventually(|| gateway.workers().is_empty()).await;
}

#[tokio::test]
async fn test_plain_get_on_stream_is_400() {
    let (_source, gateway) = stream_gateway(stream_config());

    let response = warp::test::request()
        .method("GET")
        .path("/shop/orders/_streams/byStatus")
        .reply(&web::routes(gateway))
        .await;

    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_unbound_variable_refuses_upgrade() {
    let (_source, gateway) = stream_gateway(stream_config());

    let response = warp::test::request()
        .method("GET")
        .path("/shop/orders/_streams/byStatus")
        .header("connection", "upgrade")
        .header("upgrade", "websocket")
        .header("sec-websocket-version", "13")
        .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
        .reply(&web::routes(gateway.clone()))
        .await;

    assert_eq!(response.status(), 400);
    let body: Value = serde_json::from_slice(response.body()).unwrap();
    assert!(body["message"].as_str().unwrap().contains("status"));
    assert!(gateway.workers().is_empty());
}

#[tokio::test]
async fn test_dropping_collection_closes_its_streams() {
    let upstream = warp::delete().map(warp::reply);
    let (addr, server) = warp::serve(upstream).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);

    let config = Config {
        proxies: vec![ProxyMount {
            name: "db".to_string(),
            uri: "/".to_string(),
            upstream: format!("http://{addr}"),
        }],
        ..stream_config()
    };
    let (source, gateway) = stream_gateway(config);

    let (channel, mut rx) = MpscSessionChannel::new(8);
    let handle = gateway
        .workers()
        .attach(&key(), &[], "shop", "orders", Arc::new(channel));
    eventually(|| source.subscriber_count("shop", "orders") == 1).await;

    let recorded = common::send(&gateway, http::Method::DELETE, "/shop/orders", b"").await;
    assert_eq!(recorded.status, Some(http::StatusCode::OK));

    eventually(|| gateway.workers().is_empty()).await;
    assert!(handle.worker().is_terminated());
    assert_eq!(rx.recv().await, None);
}

#[tokio::test]
async fn test_reattach_right_after_last_close_receives_events() {
    let (source, workers, _metrics) = workers();
    let (first, _first_rx) = MpscSessionChannel::new(8);
    let first = workers.attach(&key(), &[], "shop", "orders", Arc::new(first));
    eventually(|| source.subscriber_count("shop", "orders") == 1).await;
    first.close();

    let (second, mut rx) = MpscSessionChannel::new(8);
    let second = workers.attach(&key(), &[], "shop", "orders", Arc::new(second));
    eventually(|| first.worker().is_terminated()).await;
    eventually(|| source.subscriber_count("shop", "orders") == 1).await;

    assert!(!second.worker().is_terminated());
    assert_eq!(workers.len(), 1);

    source.publish("shop", "orders", ChangeEvent::insert(json!({"_id": 2, "total": 10})));
    let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .expect("session closed");
    let SessionMessage::Text(text) = message;
    let doc: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(doc["documentKey"], json!({"_id": 2}));

    second.close();
    eventually(|| workers.is_empty()).await;
}

#[tokio::test]
async fn test_collection_update_redefines_streams() {
    let upstream = warp::any().map(warp::reply);
    let (addr, server) = warp::serve(upstream).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);

    let config = Config {
        proxies: vec![ProxyMount {
            name: "db".to_string(),
            uri: "/".to_string(),
            upstream: format!("http://{addr}"),
        }],
        ..stream_config()
    };
    let (source, gateway) = stream_gateway(config);
    let routes = web::routes(gateway.clone());

    let client = warp::test::ws()
        .path("/shop/orders/_streams/byStatus?avars=%7B%22status%22%3A%22paid%22%7D")
        .handshake(routes.clone())
        .await
        .unwrap();
    eventually(|| source.subscriber_count("shop", "orders") == 1).await;

    let body = json!({"streams": [
        {"uri": "byStatus", "stages": [{"$match": {"operationType": "insert"}}]}
    ]});
    let recorded = common::send(
        &gateway,
        http::Method::PUT,
        "/shop/orders",
        body.to_string().as_bytes(),
    )
    .await;
    assert_eq!(recorded.status, Some(http::StatusCode::OK));
    eventually(|| gateway.workers().is_empty()).await;
    drop(client);

    // The new definition no longer needs the status variable
    let _client = warp::test::ws()
        .path("/shop/orders/_streams/byStatus")
        .handshake(routes)
        .await
        .unwrap();
    eventually(|| gateway.workers().len() == 1).await;

    let key = ChangeStreamWorkerKey::new("/shop/orders/_streams/byStatus", json!({}), JsonMode::Relaxed);
    let worker = gateway.workers().get(&key).unwrap();
    assert_eq!(worker.stages(), &[json!({"$match": {"operationType": "insert"}})]);

    let recorded = common::send(&gateway, http::Method::DELETE, "/shop/orders", b"").await;
    assert_eq!(recorded.status, Some(http::StatusCode::OK));
    assert!(gateway.catalog().find("shop", "orders", "byStatus").is_none());
}
