// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Benchmarks for transaction operations.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use doctxn::storage::{DocId, DocumentContent, DocumentStore, InMemoryDocumentStore, StoreOptions};
use doctxn::txn::{PerTransactionConfig, TransactionConfig, Transactions};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Runtime;

fn setup(rt: &Runtime) -> (Arc<InMemoryDocumentStore>, Transactions) {
    let _guard = rt.enter();
    let store = Arc::new(InMemoryDocumentStore::new());
    let config = TransactionConfig::new()
        .with_cleanup_client_attempts(false)
        .with_cleanup_lost_attempts(false);
    let txns = Transactions::new(store.clone(), config).unwrap();
    (store, txns)
}

fn id(key: String) -> DocId {
    DocId::default_collection("bench", key)
}

fn bench_get(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let (store, txns) = setup(&rt);

    rt.block_on(async {
        for i in 0..1000 {
            store
                .insert(
                    &id(format!("doc{i:04}")),
                    &DocumentContent::new(vec![b'0'; 100], 0),
                    &StoreOptions::default(),
                )
                .await
                .unwrap();
        }
    });

    c.bench_function("txn::get", |b| {
        b.to_async(&rt).iter(|| async {
            let ctx = txns.begin(&PerTransactionConfig::default());
            let i = rand::random::<u32>() % 1000;
            let doc = ctx.get(&id(format!("doc{i:04}"))).await.unwrap();
            black_box(doc)
        })
    });
}

fn bench_insert_staged(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let (_store, txns) = setup(&rt);
    let counter = AtomicU64::new(0);

    c.bench_function("txn::insert_staged", |b| {
        b.to_async(&rt).iter(|| async {
            let i = counter.fetch_add(1, Ordering::Relaxed);
            let ctx = txns.begin(&PerTransactionConfig::default());
            let doc = ctx
                .insert(&id(format!("staged{i}")), vec![0u8; 100])
                .await
                .unwrap();
            black_box(doc)
        })
    });
}

fn bench_commit(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let (_store, txns) = setup(&rt);
    let counter = AtomicU64::new(0);

    let mut group = c.benchmark_group("txn");

    group.throughput(Throughput::Elements(1));
    group.bench_function("commit_1_doc", |b| {
        b.to_async(&rt).iter(|| async {
            let i = counter.fetch_add(1, Ordering::Relaxed);
            let result = txns
                .run(|ctx| async move {
                    ctx.insert(&id(format!("one{i}")), vec![0u8; 100]).await?;
                    Ok(())
                })
                .await
                .unwrap();
            black_box(result)
        })
    });

    group.throughput(Throughput::Elements(10));
    group.bench_function("commit_10_docs", |b| {
        b.to_async(&rt).iter(|| async {
            let base = counter.fetch_add(10, Ordering::Relaxed);
            let result = txns
                .run(|ctx| async move {
                    for i in base..base + 10 {
                        ctx.insert(&id(format!("batch{i}")), vec![0u8; 100]).await?;
                    }
                    Ok(())
                })
                .await
                .unwrap();
            black_box(result)
        })
    });

    group.finish();
}

fn bench_read_modify_write(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let (store, txns) = setup(&rt);

    rt.block_on(async {
        for i in 0..100 {
            store
                .insert(
                    &id(format!("counter{i:03}")),
                    &DocumentContent::from("0"),
                    &StoreOptions::default(),
                )
                .await
                .unwrap();
        }
    });

    c.bench_function("txn::read_modify_write", |b| {
        b.to_async(&rt).iter(|| async {
            let i = rand::random::<u32>() % 100;
            let result = txns
                .run(|ctx| async move {
                    let doc = ctx.get(&id(format!("counter{i:03}"))).await?;
                    let n: u64 = doc.content_as()?;
                    ctx.replace(&doc, serde_json::json!(n + 1)).await?;
                    Ok(())
                })
                .await
                .unwrap();
            black_box(result)
        })
    });
}

criterion_group!(
    benches,
    bench_get,
    bench_insert_staged,
    bench_commit,
    bench_read_modify_write,
);
criterion_main!(benches);
