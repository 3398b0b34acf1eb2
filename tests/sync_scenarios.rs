#![cfg(not(target_arch = "wasm32"))]

use std::sync::Arc;
use std::time::Duration;

use async_channel::Receiver;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use firestore_sync_core::firestore::core::{FieldFilter, FilterOperator};
use firestore_sync_core::firestore::model::{DatabaseId, DocumentKey, FieldMask, FieldPath, Mutation, ResourcePath, User};
use firestore_sync_core::firestore::remote::{BloomFilter, InMemoryConnection, ServerEndpoint, ServerStream, StaticCredentialsProvider, StreamKind};
use firestore_sync_core::firestore::value::{FirestoreValue, MapValue};
use firestore_sync_core::firestore::{
    ClientComponents, FirestoreClient, FirestoreError, FirestoreErrorCode, FirestoreSettings, ListenOptions, Query,
    ViewSnapshot,
};
use firestore_sync_core::util::PartialObserver;
use serde_json::{json, Value};

const DOC_ROOT: &str = "projects/p/databases/(default)/documents";
const WAIT: Duration = Duration::from_secs(5);

async fn start_client() -> (FirestoreClient, ServerEndpoint) {
    let (connection, endpoint) = InMemoryConnection::new();
    let credentials = Arc::new(StaticCredentialsProvider::new(User::unauthenticated(), None));
    let client = FirestoreClient::start(
        DatabaseId::new("p", "(default)"),
        FirestoreSettings::default(),
        ClientComponents::new(connection, credentials),
    )
    .await
    .expect("start client");
    (client, endpoint)
}

fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap()
}

fn rooms() -> Query {
    Query::collection(ResourcePath::from_string("rooms").unwrap())
}

fn fields(values: &[(&str, i64)]) -> MapValue {
    let mut data = MapValue::empty();
    for (name, value) in values {
        data.set(&FieldPath::from_dot_separated(name).unwrap(), FirestoreValue::from_integer(*value));
    }
    data
}

fn patch(path: &str, name: &str, value: i64) -> Mutation {
    let mask = FieldMask::new([FieldPath::from_dot_separated(name).unwrap()]);
    Mutation::patch(key(path), fields(&[(name, value)]), mask)
}

async fn listen(client: &FirestoreClient, query: Query) -> Receiver<ViewSnapshot> {
    let (sender, receiver) = async_channel::unbounded();
    let observer = PartialObserver::new().with_next(move |snapshot: &ViewSnapshot| {
        let _ = sender.try_send(snapshot.clone());
    });
    client
        .listen(query, ListenOptions::default().with_metadata_changes(), observer)
        .await
        .expect("listen");
    receiver
}

/// Waits for the first snapshot satisfying `predicate`.
async fn snapshot_where(snapshots: &Receiver<ViewSnapshot>, predicate: impl Fn(&ViewSnapshot) -> bool) -> ViewSnapshot {
    tokio::time::timeout(WAIT, async {
        loop {
            let snapshot = snapshots.recv().await.expect("listener dropped");
            if predicate(&snapshot) {
                return snapshot;
            }
        }
    })
    .await
    .expect("timed out waiting for a snapshot")
}

async fn accept(endpoint: &ServerEndpoint, kind: StreamKind) -> ServerStream {
    tokio::time::timeout(WAIT, endpoint.accept_kind(kind))
        .await
        .expect("timed out waiting for a stream")
        .expect("endpoint closed")
}

async fn recv(stream: &ServerStream) -> Value {
    tokio::time::timeout(WAIT, stream.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("stream closed")
}

fn document_change(path: &str, values: Value, update_time: &str, target_id: i32) -> Value {
    json!({ "documentChange": {
        "document": {
            "name": format!("{DOC_ROOT}/{path}"),
            "fields": values,
            "updateTime": update_time
        },
        "targetIds": [target_id]
    } })
}

/// Adds `target_id`, streams `docs` and marks the target current at `read_time`.
fn send_target_snapshot(stream: &ServerStream, target_id: i32, docs: &[(&str, Value)], read_time: &str) {
    stream
        .send(json!({ "targetChange": { "targetChangeType": "ADD", "targetIds": [target_id] } }))
        .unwrap();
    for (path, values) in docs {
        stream
            .send(document_change(path, values.clone(), "1970-01-01T00:00:01Z", target_id))
            .unwrap();
    }
    stream
        .send(json!({ "targetChange": {
            "targetChangeType": "CURRENT",
            "targetIds": [target_id],
            "resumeToken": "AQ=="
        } }))
        .unwrap();
    stream
        .send(json!({ "targetChange": { "readTime": read_time } }))
        .unwrap();
}

async fn complete_write_handshake(stream: &ServerStream) {
    let handshake = recv(stream).await;
    assert_eq!(handshake["database"], json!("projects/p/databases/(default)"));
    stream.send(json!({ "streamToken": "AQ==" })).unwrap();
}

fn acknowledge(stream: &ServerStream, commit_time: &str) {
    stream
        .send(json!({
            "streamToken": "Ag==",
            "commitTime": commit_time,
            "writeResults": [{ "updateTime": commit_time }]
        }))
        .unwrap();
}

fn integer_field(document: &firestore_sync_core::firestore::model::Document, name: &str) -> Option<FirestoreValue> {
    document.data().get(name).cloned()
}

#[tokio::test(flavor = "multi_thread")]
async fn filtered_query_is_served_from_the_backend_once_current() {
    let (client, endpoint) = start_client().await;
    let query = rooms().with_filter(FieldFilter::new(
        FieldPath::from_dot_separated("occupancy").unwrap(),
        FilterOperator::LessThan,
        FirestoreValue::from_integer(4),
    ));
    let snapshots = listen(&client, query).await;

    let stream = accept(&endpoint, StreamKind::Listen).await;
    let add = recv(&stream).await;
    let target_id = add["addTarget"]["targetId"].as_i64().unwrap() as i32;
    assert_eq!(
        add["addTarget"]["query"]["structuredQuery"]["from"][0]["collectionId"],
        json!("rooms")
    );

    send_target_snapshot(
        &stream,
        target_id,
        &[("rooms/small", json!({ "occupancy": { "integerValue": "2" } }))],
        "1970-01-01T00:00:02Z",
    );

    let snapshot = snapshot_where(&snapshots, |snapshot| !snapshot.from_cache).await;
    assert_eq!(snapshot.len(), 1);
    assert!(snapshot.docs.contains(&key("rooms/small")));
    client.terminate().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn offline_write_is_pending_until_acknowledged() {
    let (client, endpoint) = start_client().await;
    client.disable_network().await.unwrap();

    let writer = client.clone();
    let write = tokio::spawn(async move {
        writer
            .write(vec![Mutation::set(key("rooms/a"), fields(&[("n", 1)]))])
            .await
    });

    let snapshots = listen(&client, Query::document(&key("rooms/a"))).await;
    let snapshot = snapshot_where(&snapshots, |snapshot| snapshot.len() == 1).await;
    assert!(snapshot.has_pending_writes());

    let cached = client.get_document_from_cache(key("rooms/a")).await.unwrap().unwrap();
    assert!(cached.has_pending_writes());
    assert_eq!(integer_field(&cached, "n"), Some(FirestoreValue::from_integer(1)));
    assert!(endpoint.try_accept().is_none());

    client.enable_network().await.unwrap();
    let stream = accept(&endpoint, StreamKind::Write).await;
    complete_write_handshake(&stream).await;
    let request = recv(&stream).await;
    assert_eq!(request["writes"].as_array().map(Vec::len), Some(1));
    acknowledge(&stream, "1970-01-01T00:00:05Z");

    tokio::time::timeout(WAIT, write).await.unwrap().unwrap().unwrap();
    let cached = client.get_document_from_cache(key("rooms/a")).await.unwrap().unwrap();
    assert!(!cached.has_pending_writes());
    assert_eq!(integer_field(&cached, "n"), Some(FirestoreValue::from_integer(1)));
    client.terminate().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn rejecting_the_first_batch_keeps_the_second() {
    let (client, endpoint) = start_client().await;
    let snapshots = listen(&client, rooms()).await;

    let listen_stream = accept(&endpoint, StreamKind::Listen).await;
    let add = recv(&listen_stream).await;
    let target_id = add["addTarget"]["targetId"].as_i64().unwrap() as i32;
    send_target_snapshot(
        &listen_stream,
        target_id,
        &[("rooms/a", json!({ "a": { "integerValue": "0" } }))],
        "1970-01-01T00:00:02Z",
    );
    snapshot_where(&snapshots, |snapshot| !snapshot.from_cache).await;

    let first_writer = client.clone();
    let first = tokio::spawn(async move { first_writer.write(vec![patch("rooms/a", "a", 1)]).await });
    let a_is = |expected: i64| {
        move |snapshot: &ViewSnapshot| {
            snapshot
                .docs
                .get(&key("rooms/a"))
                .and_then(|doc| integer_field(doc, "a"))
                == Some(FirestoreValue::from_integer(expected))
        }
    };
    snapshot_where(&snapshots, a_is(1)).await;

    let second_writer = client.clone();
    let second = tokio::spawn(async move { second_writer.write(vec![patch("rooms/a", "a", 2)]).await });
    snapshot_where(&snapshots, a_is(2)).await;

    let write_stream = accept(&endpoint, StreamKind::Write).await;
    complete_write_handshake(&write_stream).await;
    recv(&write_stream).await;
    recv(&write_stream).await;
    write_stream.fail(FirestoreError::new(
        FirestoreErrorCode::FailedPrecondition,
        "precondition failed",
    ));

    let err = tokio::time::timeout(WAIT, first).await.unwrap().unwrap().unwrap_err();
    assert_eq!(err.code, FirestoreErrorCode::FailedPrecondition);
    let cached = client.get_document_from_cache(key("rooms/a")).await.unwrap().unwrap();
    assert_eq!(integer_field(&cached, "a"), Some(FirestoreValue::from_integer(2)));
    assert!(cached.has_pending_writes());

    let retry = accept(&endpoint, StreamKind::Write).await;
    complete_write_handshake(&retry).await;
    let request = recv(&retry).await;
    assert_eq!(request["writes"].as_array().map(Vec::len), Some(1));
    acknowledge(&retry, "1970-01-01T00:00:05Z");
    tokio::time::timeout(WAIT, second).await.unwrap().unwrap().unwrap();

    let cached = client.get_document_from_cache(key("rooms/a")).await.unwrap().unwrap();
    assert_eq!(integer_field(&cached, "a"), Some(FirestoreValue::from_integer(2)));
    client.terminate().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn bloom_filter_drops_missing_document_without_relisten() {
    let (client, endpoint) = start_client().await;
    let snapshots = listen(&client, rooms()).await;

    let stream = accept(&endpoint, StreamKind::Listen).await;
    let add = recv(&stream).await;
    let target_id = add["addTarget"]["targetId"].as_i64().unwrap() as i32;
    let data = json!({ "n": { "integerValue": "1" } });
    send_target_snapshot(
        &stream,
        target_id,
        &[("rooms/a", data.clone()), ("rooms/b", data)],
        "1970-01-01T00:00:02Z",
    );
    snapshot_where(&snapshots, |snapshot| !snapshot.from_cache && snapshot.len() == 2).await;

    let kept = format!("{DOC_ROOT}/rooms/a");
    let bloom = BloomFilter::from_values([kept.as_str()], 256, 5);
    stream
        .send(json!({ "filter": {
            "targetId": target_id,
            "count": 1,
            "unchangedNames": {
                "bits": { "bitmap": STANDARD.encode(bloom.bitmap()), "padding": bloom.padding() },
                "hashCount": 5
            }
        } }))
        .unwrap();
    stream
        .send(json!({ "targetChange": { "readTime": "1970-01-01T00:00:03Z" } }))
        .unwrap();

    // The next request resolves the dropped document instead of re-listening.
    let limbo = recv(&stream).await;
    let limbo_target = limbo["addTarget"]["targetId"].as_i64().unwrap() as i32;
    assert_eq!(limbo_target % 2, 1);
    assert_eq!(
        limbo["addTarget"]["documents"]["documents"],
        json!([format!("{DOC_ROOT}/rooms/b")])
    );

    send_target_snapshot(&stream, limbo_target, &[], "1970-01-01T00:00:04Z");
    let snapshot = snapshot_where(&snapshots, |snapshot| snapshot.len() == 1).await;
    assert!(snapshot.docs.contains(&key("rooms/a")));
    assert!(!snapshot.docs.contains(&key("rooms/b")));
    client.terminate().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn garbage_collection_below_threshold_does_not_run() {
    let (client, _endpoint) = start_client().await;
    client.disable_network().await.unwrap();
    let writer = client.clone();
    tokio::spawn(async move {
        let _ = writer
            .write(vec![Mutation::set(key("rooms/a"), fields(&[("n", 1)]))])
            .await;
    });
    let snapshots = listen(&client, rooms()).await;
    snapshot_where(&snapshots, |snapshot| snapshot.len() == 1).await;

    let results = client.collect_garbage().await.unwrap();
    assert!(!results.did_run);
    assert_eq!(results.documents_removed, 0);
    assert_eq!(results.targets_removed, 0);
    client.terminate().await.unwrap();
}
