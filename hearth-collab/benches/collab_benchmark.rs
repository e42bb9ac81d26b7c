use criterion::{criterion_group, criterion_main, Criterion};
use hearth_collab::bus::PermissionErrorBus;
use hearth_collab::error::PermissionError;
use hearth_collab::model::ChatMessage;
use hearth_collab::protocol::{StoreFrame, StoreRequest};
use hearth_collab::store::{
    path, AllowAll, DocumentStore, Fields, LocalStore, Operation, Query, RocksBackend, Snapshot,
    StoreConfig, StoredDoc, WriteData,
};
use hearth_collab::sync::{apply_snapshot, CollectionView};
use serde_json::json;
use std::hint::black_box;

fn message_doc(i: u64) -> StoredDoc {
    let fields: Fields = json!({
        "userId": format!("u{}", i % 7),
        "userName": "Reader",
        "message": "What did you make of the ending?",
        "type": "text",
        // Arrives out of order
        "timestamp": (i * 7919) % 1000,
    })
    .as_object()
    .cloned()
    .unwrap();
    StoredDoc::new(format!("m{i}"), fields)
}

fn snapshot(n: u64) -> Snapshot {
    Snapshot {
        docs: (0..n).map(message_doc).collect(),
    }
}

fn bench_request_encode(c: &mut Criterion) {
    let request = StoreRequest::Add {
        collection: path::room("r1").collection("annotations"),
        data: WriteData::new()
            .set("userId", "u1")
            .set("userName", "Reader")
            .set("pageNumber", 12)
            .set("x", 42.5)
            .set("y", 18.0)
            .set("content", "Foreshadowing")
            .server_timestamp("timestamp"),
    };

    c.bench_function("request_frame_encode", |b| {
        b.iter(|| {
            let frame = StoreFrame::request(black_box(1), black_box(&request)).unwrap();
            black_box(frame.encode().unwrap());
        })
    });
}

fn bench_snapshot_frame_decode(c: &mut Criterion) {
    let encoded = StoreFrame::snapshot(1, &snapshot(200)).unwrap().encode().unwrap();

    c.bench_function("snapshot_frame_decode_200", |b| {
        b.iter(|| {
            let frame = StoreFrame::decode(black_box(&encoded)).unwrap();
            black_box(frame.body::<Snapshot>().unwrap());
        })
    });
}

fn bench_apply_snapshot(c: &mut Criterion) {
    let snap = snapshot(500);
    let empty = CollectionView::<ChatMessage>::default();
    let current = apply_snapshot(&empty, &snap);

    c.bench_function("apply_snapshot_500_new", |b| {
        b.iter(|| black_box(apply_snapshot(black_box(&empty), black_box(&snap))))
    });

    c.bench_function("apply_snapshot_500_unchanged", |b| {
        b.iter(|| black_box(apply_snapshot(black_box(&current), black_box(&snap))))
    });
}

fn bench_bus_publish(c: &mut Criterion) {
    let bus = PermissionErrorBus::new(1024);
    let _listeners: Vec<_> = (0..100).map(|_| bus.subscribe()).collect();
    let error = PermissionError::new("rooms/r1/messages", Operation::Create)
        .with_data(json!({ "message": "hi" }));

    c.bench_function("bus_publish_100_listeners", |b| {
        b.iter(|| black_box(bus.publish(black_box(error.clone()))))
    });
}

fn bench_memory_query(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = LocalStore::in_memory(AllowAll).as_user("u1");
    let bookmarks = path::room("r1").collection("bookmarks");
    rt.block_on(async {
        for i in 0..1000u32 {
            store
                .add(
                    &bookmarks,
                    WriteData::new()
                        .set("userId", format!("u{}", i % 10))
                        .set("pageNumber", i % 50),
                )
                .await
                .unwrap();
        }
    });
    let query = Query::collection(bookmarks)
        .where_eq("userId", "u3")
        .where_eq("pageNumber", 13);

    c.bench_function("memory_query_1000_docs", |b| {
        b.iter(|| rt.block_on(async { black_box(store.query(black_box(&query)).await.unwrap()) }))
    });
}

fn bench_rocks_scan(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dir = std::env::temp_dir().join(format!("hearth_bench_scan_{}", uuid::Uuid::new_v4()));
    let backend = RocksBackend::open(StoreConfig::for_testing(&dir)).unwrap();
    let store = LocalStore::new(backend, AllowAll).as_user("u1");
    let messages = path::room("r1").collection("messages");
    rt.block_on(async {
        for i in 0..1000u64 {
            let doc = message_doc(i);
            store
                .set(&messages.doc(&doc.id), WriteData::new().set("message", format!("line {i}")))
                .await
                .unwrap();
        }
    });
    let query = Query::collection(messages);

    c.bench_function("rocks_scan_1000_docs", |b| {
        b.iter(|| rt.block_on(async { black_box(store.query(black_box(&query)).await.unwrap()) }))
    });

    drop(store);
    let _ = std::fs::remove_dir_all(&dir);
}

criterion_group!(
    benches,
    bench_request_encode,
    bench_snapshot_frame_decode,
    bench_apply_snapshot,
    bench_bus_publish,
    bench_memory_query,
    bench_rocks_scan,
);

criterion_main!(benches);
