use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use me2u_core::{Document, DEFAULT_JSONLD_CONTEXT};
use me2u_distribution::{
    document_routes, AnnotationCrud, DocumentStore, Frame, MemoryStore, Response, UuidGenerator,
    Verb,
};
use serde_json::json;
use std::sync::Arc;

fn bench_route_lookup(c: &mut Criterion) {
    let routes = document_routes().unwrap();

    c.bench_function("route_lookup_param", |b| {
        b.iter(|| {
            black_box(routes.lookup(
                black_box(Verb::Put),
                black_box("/annotations/3f2a9c1e-0000-4000-8000-000000000000.jsonld"),
            ));
        })
    });

    c.bench_function("route_lookup_miss", |b| {
        b.iter(|| {
            black_box(routes.lookup(black_box(Verb::Get), black_box("/unknown/path")));
        })
    });
}

fn bench_frame_codec(c: &mut Criterion) {
    let frame = Frame::Response {
        id: 42,
        response: Response::ok(json!([{
            "id": "docA/annotations/1.jsonld",
            "annotation_id": "1",
            "text": "a typical short annotation",
        }])),
    };
    let encoded = frame.encode().unwrap();

    c.bench_function("frame_encode", |b| {
        b.iter(|| black_box(frame.encode().unwrap()))
    });
    c.bench_function("frame_decode", |b| {
        b.iter(|| black_box(Frame::decode(black_box(&encoded)).unwrap()))
    });
}

fn crud_for(rt: &tokio::runtime::Runtime) -> AnnotationCrud {
    let store = Arc::new(MemoryStore::new());
    rt.block_on(store.put("docA", Document::new("topic")));
    AnnotationCrud::new(
        "docA",
        store as Arc<dyn DocumentStore>,
        Arc::new(UuidGenerator),
        DEFAULT_JSONLD_CONTEXT,
    )
}

fn bench_create_annotation(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("create_annotation_empty_doc", |b| {
        b.iter_batched(
            || crud_for(&rt),
            |crud| {
                rt.block_on(async {
                    black_box(crud.create(Some(json!({ "text": "bench" }))).await);
                })
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_list_annotations(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let crud = crud_for(&rt);
    rt.block_on(async {
        for n in 0..100 {
            crud.create(Some(json!({ "n": n }))).await;
        }
    });

    c.bench_function("list_100_annotations", |b| {
        b.iter(|| rt.block_on(async { black_box(crud.list().await) }))
    });
}

criterion_group!(
    benches,
    bench_route_lookup,
    bench_frame_codec,
    bench_create_annotation,
    bench_list_annotations,
);
criterion_main!(benches);
